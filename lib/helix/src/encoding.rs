/// Canonical lowercase hexadecimal encoding used for key material and identifiers.
pub mod hex {
    const CHARS: &[u8; 16] = b"0123456789abcdef";

    /// Encode the supplied bytes as lowercase hex.
    #[inline]
    pub fn encode(data: &[u8]) -> String {
        let mut out = String::with_capacity(data.len() * 2);

        for &byte in data {
            out.push(CHARS[(byte >> 4) as usize] as char);
            out.push(CHARS[(byte & 0x0f) as usize] as char);
        }

        out
    }

    /// Decode a hex string into bytes. Both character cases are accepted, the length
    /// must be even and every character must be a hex digit.
    pub fn decode(text: &str) -> Option<Vec<u8>> {
        if text.len() % 2 != 0 {
            return None;
        }

        let mut out = Vec::with_capacity(text.len() / 2);
        let bytes = text.as_bytes();

        for pair in bytes.chunks(2) {
            let high = (pair[0] as char).to_digit(16)?;
            let low = (pair[1] as char).to_digit(16)?;
            out.push(((high << 4) | low) as u8);
        }

        Some(out)
    }
}

/// Base64 helpers for serde fields carrying raw key material.
pub mod base64 {
    use serde::Serializer;

    #[inline]
    pub fn encode(data: &[u8]) -> String {
        ::base64::encode(data)
    }

    #[inline]
    pub fn decode(text: &str) -> Result<Vec<u8>, ::base64::DecodeError> {
        ::base64::decode(text)
    }

    /// Serialize a byte field as a base64 string.
    #[inline]
    pub fn serialize<T: AsRef<[u8]>, S: Serializer>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode(bytes.as_ref()))
    }
}
