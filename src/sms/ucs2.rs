//! UCS-2 (big-endian, BMP-only) <-> UTF-8 conversion, used for alphanumeric
//! sender IDs and Unicode SMS bodies carried as hex-encoded UCS-2 on the
//! wire.

use crate::error::{CoreError, Result};

/// Encode `text` as big-endian UCS-2 bytes.
///
/// Fails with [`CoreError::InvalidArgs`] if `text` contains a code point
/// outside the Basic Multilingual Plane — UCS-2 has no surrogate pairs to
/// represent one.
pub fn encode(text: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len() * 2);
    for ch in text.chars() {
        let code = ch as u32;
        if code > 0xFFFF {
            return Err(CoreError::InvalidArgs(format!("{ch:?} is outside the BMP, not representable in UCS-2")).into());
        }
        out.extend_from_slice(&(code as u16).to_be_bytes());
    }
    Ok(out)
}

/// Decode big-endian UCS-2 bytes back to a `String`.
pub fn decode(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(CoreError::InvalidArgs("UCS-2 byte stream has odd length".into()).into());
    }
    let mut out = String::with_capacity(bytes.len() / 2);
    for chunk in bytes.chunks_exact(2) {
        let code = u16::from_be_bytes([chunk[0], chunk[1]]);
        let ch = char::from_u32(code as u32)
            .ok_or_else(|| CoreError::InvalidArgs(format!("0x{code:04X} is not a valid code point")))?;
        out.push(ch);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_worked_example() {
        let hex = [0x00, 0x54, 0x00, 0x2D, 0x00, 0x4D, 0x00, 0x6F, 0x00, 0x62, 0x00, 0x69, 0x00, 0x6C, 0x00, 0x65];
        assert_eq!(decode(&hex).unwrap(), "T-Mobile");
    }

    #[test]
    fn round_trips_bmp_text() {
        let text = "Héllo Wörld";
        let bytes = encode(text).unwrap();
        assert_eq!(decode(&bytes).unwrap(), text);
    }

    #[test]
    fn rejects_non_bmp_code_points() {
        assert!(encode("😀").is_err());
    }

    #[test]
    fn rejects_odd_length_input() {
        assert!(decode(&[0x00]).is_err());
    }
}
