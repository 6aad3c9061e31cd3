use sha2::{Digest, Sha256};

/// SHA-256 of a text body, lowercase hex
pub fn content_hash(content: &str) -> String {
    bytes_hash(content.as_bytes())
}

/// SHA-256 of raw bytes, lowercase hex
pub fn bytes_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// 32-bit path hash compatible with the sync clients.
///
/// `h = h * 31 + unit` over UTF-16 code units with i32 wrap-around, rendered
/// as a signed decimal string.
pub fn path_hash(path: &str) -> String {
    let hash = path.encode_utf16().fold(0i32, |h, unit| {
        h.wrapping_shl(5).wrapping_sub(h).wrapping_add(unit as i32)
    });
    hash.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_hash_matches_client_algorithm() {
        assert_eq!(path_hash(""), "0");
        assert_eq!(path_hash("a"), "97");
        assert_eq!(path_hash("hello"), "99162322");
        // Overflows to i32::MIN
        assert_eq!(path_hash("polygenelubricants"), "-2147483648");
    }

    #[test]
    fn test_path_hash_uses_utf16_units() {
        // U+1F600 is a surrogate pair: 0xD83D, 0xDE00
        let expected = (0xD83Di32).wrapping_mul(31).wrapping_add(0xDE00);
        assert_eq!(path_hash("😀"), expected.to_string());
    }

    #[test]
    fn test_content_hash() {
        assert_eq!(
            content_hash("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(content_hash("hello"), bytes_hash(b"hello"));
        assert_ne!(content_hash("hello"), content_hash("hello "));
    }
}
