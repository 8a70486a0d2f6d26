//! Raw content hashing: sha256 over raw bytes, hex-encoded.

use std::io::{self, Read};

use camino::Utf8Path;
use sha2::{Digest, Sha256};

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Streams a file through sha256 rather than reading it fully into memory,
/// since task inputs can include large build artifacts.
pub fn hash_file(path: &Utf8Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
