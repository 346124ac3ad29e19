use anyhow::{Context, Result};
use sha2::{Sha256, Digest};
use shared::types::DeviceExport;

/// Computes a SHA-256 hash of the device export list.
/// Exports are sorted by MAC address so the hash does not depend on host map order.
/// Detail fields are left out; they change with every DNS answer.
pub fn compute_hash(exports: &[DeviceExport]) -> Result<String> {
    let mut indices: Vec<usize> = (0..exports.len()).collect();
    indices.sort_by(|&a, &b| exports[a].mac_address.cmp(&exports[b].mac_address));

    let views: Vec<DeviceExport> = indices
        .iter()
        .map(|&i| DeviceExport {
            details: None,
            ..exports[i].clone()
        })
        .collect();

    let json = serde_json::to_string(&views)
        .context("Failed to serialize devices for hashing")?;

    let hash = Sha256::digest(json.as_bytes());
    Ok(hex::encode(hash))
}
