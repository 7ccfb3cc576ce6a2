use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    let out = h.finalize();
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&out);
    arr
}

/// Short hex fingerprint of a PEM document, for log lines.
///
/// Whitespace around the block is ignored so the same certificate served
/// with or without a trailing newline yields the same fingerprint.
pub fn pem_fingerprint(pem: &str) -> String {
    let digest = sha256(pem.trim().as_bytes());
    hex::encode(&digest[..8])
}
