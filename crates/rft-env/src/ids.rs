//! Generated names and MAC addresses.

use rand::Rng;

/// Common prefix of every libvirt object the suite creates; leftover objects
/// can be found by it after a crashed run.
pub const NAME_PREFIX: &str = "rft";

/// QEMU/KVM organisationally unique identifier.
const QEMU_OUI: [u8; 3] = [0x52, 0x54, 0x00];

/// `rft-<base>-<8 hex chars>`, e.g. `rft-node-1a2b3c4d`.
pub fn generate_name(base: &str) -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    let short = uuid.get(..8).unwrap_or(&uuid);
    format!("{NAME_PREFIX}-{base}-{short}")
}

/// Random locally used MAC under the QEMU OUI, lowercase hex.
pub fn random_mac() -> String {
    let tail: [u8; 3] = rand::thread_rng().r#gen();
    format_mac(QEMU_OUI, tail)
}

fn format_mac(oui: [u8; 3], tail: [u8; 3]) -> String {
    let [a, b, c] = oui;
    let [d, e, f] = tail;
    format!("{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{f:02x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_shape() {
        let name = generate_name("node");
        assert!(name.starts_with("rft-node-"), "name: {name}");
        let suffix = name.trim_start_matches("rft-node-");
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn names_differ() {
        assert_ne!(generate_name("net"), generate_name("net"));
    }

    #[test]
    fn bridge_name_fits_ifnamsiz() {
        // Linux interface names are limited to 15 bytes.
        assert!(generate_name("br").len() <= 15);
    }

    #[test]
    fn mac_uses_qemu_oui() {
        let mac = random_mac();
        assert!(mac.starts_with("52:54:00:"), "mac: {mac}");
        assert_eq!(mac.len(), 17);
        assert_eq!(mac, mac.to_lowercase());
    }

    #[test]
    fn format_mac_pads() {
        assert_eq!(format_mac(QEMU_OUI, [0x0a, 0, 0xff]), "52:54:00:0a:00:ff");
    }
}
