use dx_core::errors::DxError;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::serde::to_canonical_json_bytes;

/// Computes a stable hexadecimal SHA256 hash for the provided serializable payload.
pub fn stable_hash_string<T: Serialize>(value: &T) -> Result<String, DxError> {
    let bytes = to_canonical_json_bytes(value)?;
    let digest = Sha256::digest(&bytes);
    Ok(format!("{:x}", digest))
}

/// Short identifier for one (experiment, binding) pair; stable across runs.
pub fn instance_id<T: Serialize>(experiment: &str, binding: &T) -> Result<String, DxError> {
    let full = stable_hash_string(&(experiment, binding))?;
    Ok(full[..16].to_string())
}
