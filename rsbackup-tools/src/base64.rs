//! Standard (RFC 4648, padded) base64, used to embed backup logs and other
//! binary blobs in the catalogue's JSON-ish text columns.

/// Encodes `data` as standard padded base64.
pub fn encode(data: &[u8]) -> String {
    base64::encode_config(data, base64::STANDARD)
}

/// Decodes standard padded base64 back to bytes.
pub fn decode(s: &str) -> anyhow::Result<Vec<u8>> {
    base64::decode_config(s, base64::STANDARD)
        .map_err(|err| anyhow::anyhow!("invalid base64: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        assert_eq!(encode(b""), "");
        assert_eq!(encode(b"f"), "Zg==");
        assert_eq!(encode(b"foobar"), "Zm9vYmFy");
    }

    #[test]
    fn round_trip() {
        let data = b"\x00\x01\xffsome binary data";
        assert_eq!(decode(&encode(data)).unwrap(), data);
    }
}
