//! Wire codec for the device protocol
//!
//! Payloads are compact JSON obfuscated with a running-key XOR cascade.
//! TCP control traffic adds a 4-byte big-endian length prefix; UDP
//! discovery datagrams carry the bare obfuscated payload. The transform
//! pair is pure: all I/O happens in callers.

use serde::Serialize;
use thiserror::Error;

/// Upper bound on an accepted frame body; anything larger is malformed.
pub const MAX_FRAME_LEN: usize = 1 << 20;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("truncated stream: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("frame length {0} exceeds limit")]
    FrameTooLarge(usize),
    #[error("payload is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Obfuscation codec parameterized by the initial key byte
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    key_seed: u8,
}

impl Codec {
    pub fn new(key_seed: u8) -> Self {
        Self { key_seed }
    }

    /// Apply the cascade: each output byte is `key ^ input`, after which
    /// the key is replaced by the input byte.
    pub fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        let mut key = self.key_seed;
        plain
            .iter()
            .map(|&b| {
                let out = key ^ b;
                key = b;
                out
            })
            .collect()
    }

    /// Reverse the cascade: same rule, with the key replaced by the
    /// decoded output byte.
    pub fn decrypt(&self, cipher: &[u8]) -> Vec<u8> {
        let mut key = self.key_seed;
        cipher
            .iter()
            .map(|&b| {
                let out = key ^ b;
                key = out;
                out
            })
            .collect()
    }

    /// Serialize a request to JSON and obfuscate it
    pub fn encode<T: Serialize>(&self, payload: &T) -> Result<Vec<u8>, DecodeError> {
        let text = serde_json::to_vec(payload)?;
        Ok(self.encrypt(&text))
    }

    /// De-obfuscate a payload and parse it as JSON
    pub fn decode(&self, data: &[u8]) -> Result<serde_json::Value, DecodeError> {
        let plain = self.decrypt(data);
        let text = String::from_utf8(plain)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Prepend the 4-byte big-endian length prefix used on TCP
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Strip and validate the 4-byte length prefix, returning the frame body
pub fn unframe(data: &[u8]) -> Result<&[u8], DecodeError> {
    if data.len() < 4 {
        return Err(DecodeError::Truncated {
            expected: 4,
            got: data.len(),
        });
    }
    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(DecodeError::FrameTooLarge(len));
    }
    let body = &data[4..];
    if body.len() < len {
        return Err(DecodeError::Truncated {
            expected: len,
            got: body.len(),
        });
    }
    Ok(&body[..len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cascade_known_vector() {
        // seed 0xAB over "ab": 0xAB^0x61 = 0xCA, then key is the input
        // byte 0x61, so 0x61^0x62 = 0x03.
        let codec = Codec::new(0xAB);
        assert_eq!(codec.encrypt(b"ab"), vec![0xCA, 0x03]);
        assert_eq!(codec.decrypt(&[0xCA, 0x03]), b"ab");
    }

    #[test]
    fn test_round_trip_bytes() {
        for seed in [0u8, 0xAB, 0xFF] {
            let codec = Codec::new(seed);
            for plain in [
                &b""[..],
                &b"{}"[..],
                &b"{\"system\":{\"get_sysinfo\":{}}}"[..],
                &[0u8, 1, 2, 255, 128, 0][..],
            ] {
                assert_eq!(codec.decrypt(&codec.encrypt(plain)), plain);
            }
        }
    }

    #[test]
    fn test_round_trip_json() {
        let codec = Codec::new(171);
        let payload = json!({
            "system": {"set_relay_state": {"state": 1}},
            "note": "unicode \u{00e9}\u{4e2d}",
        });
        let encoded = codec.encode(&payload).unwrap();
        assert_eq!(codec.decode(&encoded).unwrap(), payload);
    }

    #[test]
    fn test_frame_round_trip() {
        let body = b"hello";
        let framed = frame(body);
        assert_eq!(&framed[..4], &5u32.to_be_bytes());
        assert_eq!(unframe(&framed).unwrap(), body);
    }

    #[test]
    fn test_unframe_short_prefix() {
        assert!(matches!(
            unframe(&[0, 0]),
            Err(DecodeError::Truncated { expected: 4, got: 2 })
        ));
    }

    #[test]
    fn test_unframe_truncated_body() {
        let mut framed = frame(b"hello");
        framed.truncate(6);
        assert!(matches!(
            unframe(&framed),
            Err(DecodeError::Truncated { expected: 5, got: 2 })
        ));
    }

    #[test]
    fn test_unframe_oversized_length() {
        let mut data = Vec::new();
        data.extend_from_slice(&u32::MAX.to_be_bytes());
        data.extend_from_slice(b"x");
        assert!(matches!(unframe(&data), Err(DecodeError::FrameTooLarge(_))));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let codec = Codec::new(171);
        let garbage = codec.encrypt(b"not json at all");
        assert!(matches!(codec.decode(&garbage), Err(DecodeError::Json(_))));
    }
}
