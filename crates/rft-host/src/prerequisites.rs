use rft_driver::{DriverError, DriverResult};

use crate::command::{Privilege, exec};

/// Commands the host backends shell out to.
const REQUIRED_COMMANDS: &[&str] = &["virsh", "ssh", "scp", "qemu-img"];

/// Commands used only by the rsync image source.
const RSYNC_COMMANDS: &[&str] = &["mount", "umount", "pgrep"];

/// Verify that the host tools are installed before any environment is built.
///
/// Collects all failures and returns them in a single `Unavailable` error.
/// `privilege` decides whether passwordless sudo must work as well.
pub async fn check_prerequisites(privilege: Privilege, with_rsync: bool) -> DriverResult<()> {
    let mut errors = Vec::new();

    check_required_commands(REQUIRED_COMMANDS, &mut errors);
    if with_rsync {
        check_required_commands(RSYNC_COMMANDS, &mut errors);
    }
    if privilege == Privilege::Sudo {
        check_sudo(&mut errors).await;
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(DriverError::Unavailable(errors.join("; ")))
    }
}

fn check_required_commands(commands: &[&str], errors: &mut Vec<String>) {
    for cmd in commands {
        if which::which(cmd).is_err() {
            errors.push(format!("required command not found: {cmd}"));
        }
    }
}

async fn check_sudo(errors: &mut Vec<String>) {
    if exec("sudo", &["-n", "true"], Privilege::User)
        .await
        .is_err()
    {
        errors.push(
            "root/sudo access required for libvirt and image mounts; \
             please run with sudo or configure sudoers"
                .to_string(),
        );
    }
}
