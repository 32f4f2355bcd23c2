//! JSON + optional zlib message codec.

use crate::error::ProtocolError;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Encode a JSON value, optionally zlib-compressing it.
///
/// Default policy is to always compress; `compress` lets a
/// connection opt out as a per-connection optimization, matching the
/// preamble's `is_compressed` flag it must stay consistent with.
pub fn encode(value: &serde_json::Value, compress: bool) -> Result<(Vec<u8>, bool), ProtocolError> {
    let json = serde_json::to_vec(value).map_err(|e| ProtocolError::Encoding(e.to_string()))?;
    if !compress {
        return Ok((json, false));
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| ProtocolError::Encoding(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| ProtocolError::Encoding(e.to_string()))?;
    Ok((compressed, true))
}

/// Decode a message body into a JSON value, zlib-decompressing first if
/// `is_compressed`. An empty, uncompressed body is invalid JSON and
/// fails here.
pub fn decode(bytes: &[u8], is_compressed: bool) -> Result<serde_json::Value, ProtocolError> {
    let decompressed;
    let json_bytes: &[u8] = if is_compressed {
        let mut decoder = ZlibDecoder::new(bytes);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| ProtocolError::Encoding(e.to_string()))?;
        decompressed = out;
        &decompressed
    } else {
        bytes
    };

    serde_json::from_slice(json_bytes).map_err(|e| ProtocolError::Encoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn roundtrip_compressed() {
        let value = json!({"command": "register", "args": {"product": "p"}});
        let (bytes, is_compressed) = encode(&value, true).unwrap();
        assert!(is_compressed);
        let decoded = decode(&bytes, is_compressed).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn roundtrip_uncompressed() {
        let value = json!({"success": true, "data": null});
        let (bytes, is_compressed) = encode(&value, false).unwrap();
        assert!(!is_compressed);
        let decoded = decode(&bytes, is_compressed).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn empty_body_is_a_protocol_error() {
        let err = decode(b"", false).unwrap_err();
        assert!(matches!(err, ProtocolError::Encoding(_)));
    }

    #[test]
    fn malformed_json_is_a_protocol_error() {
        let err = decode(b"{not json", false).unwrap_err();
        assert!(matches!(err, ProtocolError::Encoding(_)));
    }

    #[test]
    fn corrupted_zlib_stream_is_a_protocol_error() {
        let err = decode(b"not zlib data", true).unwrap_err();
        assert!(matches!(err, ProtocolError::Encoding(_)));
    }

    proptest::proptest! {
        #[test]
        fn prop_roundtrip_strings(s in ".*") {
            let value = serde_json::Value::String(s);
            let (bytes, is_compressed) = encode(&value, true).unwrap();
            let decoded = decode(&bytes, is_compressed).unwrap();
            prop_assert_eq!(decoded, value);
        }
    }
}
