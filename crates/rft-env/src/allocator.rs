//! Picks an unused third octet under the configured address head.

use rft_driver::VirtDriver;
use tracing::{debug, info};

use crate::error::{EnvError, Result};

/// Candidates are `0..CANDIDATES`; 254 is never handed out.
const CANDIDATES: u8 = 254;

/// First octet `c` in ascending order such that `"{head}.{c}"` occurs in none
/// of `descriptions`.
///
/// The check is a plain substring match, so `192.168.1` is also considered
/// taken when only `192.168.10.0/24` exists.
pub fn find_free_octet(head: &str, descriptions: &[String]) -> Result<u8> {
    (0..CANDIDATES)
        .find(|c| {
            let pattern = format!("{head}.{c}");
            descriptions.iter().all(|d| !d.contains(&pattern))
        })
        .ok_or_else(|| EnvError::NoFreeAddressSpace {
            head: head.to_string(),
        })
}

/// Scan every network the driver knows about and return a free octet.
pub async fn allocate(driver: &dyn VirtDriver, head: &str) -> Result<u8> {
    let descriptions = driver
        .list_network_descriptions()
        .await
        .map_err(EnvError::driver("list networks", driver.name()))?;
    debug!(existing = descriptions.len(), head, "scanning networks");

    let octet = find_free_octet(head, &descriptions)?;
    info!(subnet = %format!("{head}.{octet}.0/24"), "address space allocated");
    Ok(octet)
}
