use sha1::{Digest, Sha1};

/// Lowercase hex SHA-1 of `input`.
///
/// The U-Key's "no hash" methods expect the caller to hash the canonical
/// source text itself, with SHA-1 as a fixed protocol constant. SHA-1 is kept
/// for wire compatibility only; it gives no collision resistance.
pub fn hex_digest(input: impl AsRef<[u8]>) -> String {
    hex::encode(Sha1::digest(input.as_ref()))
}
