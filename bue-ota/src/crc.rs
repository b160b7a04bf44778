//! CRC-8 checksum carried at the end of every payload.
//!
//! CRC-8/SMBUS: polynomial 0x07, initial value 0x00, no reflection and no
//! final xor. This matches the `crc8` reference implementation used by the
//! deployed radios.

use ::crc::{Crc, CRC_8_SMBUS};

const SMBUS: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

pub fn crc8(data: &[u8]) -> u8 {
    SMBUS.checksum(data)
}

/// Checksum of `payload` rendered as two lowercase hex digits.
pub fn checksum(payload: &str) -> String {
    format!("{:02x}", crc8(payload.as_bytes()))
}

/// Splits a received `payload+checksum` field and returns the payload when
/// the trailing two characters match.
pub fn verify(field: &str) -> Option<&str> {
    if field.len() < 2 || !field.is_char_boundary(field.len() - 2) {
        return None;
    }
    let (payload, crc) = field.split_at(field.len() - 2);
    (checksum(payload) == crc).then_some(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        assert_eq!(crc8(b"123456789"), 0xf4);
        assert_eq!(crc8(b""), 0x00);
    }

    #[test]
    fn test_checksum_is_lowercase_hex() {
        let crc = checksum("PING:IDLE,40.2,-111.6");
        assert_eq!(crc.len(), 2);
        assert!(crc.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn test_verify_round_trip() {
        for payload in ["REQ:host-1,10", "ACK", "UPD:40.0,-111.0,STDOUT: a,b,c", "x"] {
            let field = format!("{payload}{}", checksum(payload));
            assert_eq!(verify(&field), Some(payload));
        }
    }

    #[test]
    fn test_flipped_checksum_character_fails() {
        let payload = "CON:1";
        let crc = checksum(payload);
        for idx in 0..2 {
            let mut chars: Vec<char> = crc.chars().collect();
            chars[idx] = if chars[idx] == '0' { '1' } else { '0' };
            let broken: String = chars.into_iter().collect();
            assert_eq!(verify(&format!("{payload}{broken}")), None);
        }
    }

    #[test]
    fn test_verify_rejects_short_fields() {
        assert_eq!(verify(""), None);
        assert_eq!(verify("a"), None);
    }
}
