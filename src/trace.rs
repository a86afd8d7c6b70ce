//! Credential redaction for log output

/// Character used to hide credential text
pub const MASK_CHAR: char = '*';

/// Replace every character of `secret` with [`MASK_CHAR`]
pub fn mask(secret: &str) -> String {
    secret.chars().map(|_| MASK_CHAR).collect()
}

/// Hex dump of at most `limit` bytes, for trace-level packet logging
pub fn hex_prefix(data: &[u8], limit: usize) -> String {
    let shown = &data[..data.len().min(limit)];
    if shown.len() < data.len() {
        format!("{}...", hex::encode(shown))
    } else {
        hex::encode(shown)
    }
}
