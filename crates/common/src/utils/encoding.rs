use base64::{Engine as _, engine::general_purpose::STANDARD};

/// Encode bytes to Base64 string
pub fn encode_body(body: &[u8]) -> String {
    STANDARD.encode(body)
}

/// Decode Base64 string to bytes
pub fn decode_body(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_empty() {
        let empty: &[u8] = &[];
        assert_eq!(encode_body(empty), "");
    }

    #[test]
    fn test_encode_simple_text() {
        assert_eq!(encode_body(b"Hello, World!"), "SGVsbG8sIFdvcmxkIQ==");
    }

    #[test]
    fn test_decode_simple_text() {
        let decoded = decode_body("SGVsbG8sIFdvcmxkIQ==").unwrap();
        assert_eq!(decoded, b"Hello, World!");
    }

    #[test]
    fn test_decode_binary_data() {
        let decoded = decode_body("AAEC//4=").unwrap();
        assert_eq!(decoded, vec![0x00, 0x01, 0x02, 0xFF, 0xFE]);
    }

    #[test]
    fn test_roundtrip_binary() {
        let original: Vec<u8> = (0..=255).collect();
        let encoded = encode_body(&original);
        assert_eq!(decode_body(&encoded).unwrap(), original);
    }

    #[test]
    fn test_decode_invalid_base64() {
        assert!(decode_body("This is not valid base64!!!").is_err());
    }
}
