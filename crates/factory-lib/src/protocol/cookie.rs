//! Exchange salts and cookies

use sha2::{Digest, Sha256};

/// Fresh random salt for one exchange
pub fn new_salt() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// `hex(sha256(salt || name))`
pub fn cookie(salt: &str, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(name.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn verify(salt: &str, name: &str, presented: &str) -> bool {
    cookie(salt, name) == presented
}
