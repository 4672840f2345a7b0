use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of the text's UTF-8 bytes.
///
/// Content hashes are compared against hashes computed by the client that
/// submitted the post, so the algorithm and encoding must not change.
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}
