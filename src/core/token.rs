//! Class-identity token shared between the teacher and student applications.
//!
//! A token looks like `7b#52-42-54-4a`: the school code in hex, then the class
//! name XOR-ed byte by byte against a fixed repeating key. This is
//! obfuscation only. Anyone holding the key can read it back.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Shared key, must be identical on the issuing and consuming side.
pub const TOKEN_KEY: &[u8] = b"crax6ix";

const CODE_SEPARATOR: char = '#';
const SEGMENT_SEPARATOR: char = '-';

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenFormatError {
    #[error("token has no '#' separator")]
    MissingSeparator,

    #[error("invalid school code: {0:?}")]
    InvalidSchoolCode(String),

    #[error("empty segment at position {0}")]
    EmptySegment(usize),

    #[error("segment {index} is not a two-digit hex byte: {segment:?}")]
    InvalidSegment { index: usize, segment: String },

    #[error("segment {0} does not decode to an ASCII character")]
    NonAsciiByte(usize),

    #[error("unsupported class name: {0}")]
    UnsupportedClassName(String),
}

/// The two plaintext fields carried by a token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassIdentity {
    pub school_code: String,
    pub class_name: String,
}

impl ClassIdentity {
    pub fn new(school_code: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            school_code: school_code.into(),
            class_name: class_name.into(),
        }
    }

    pub fn encode(&self) -> Result<String, TokenFormatError> {
        encode(&self.school_code, &self.class_name)
    }
}

impl FromStr for ClassIdentity {
    type Err = TokenFormatError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        decode(token)
    }
}

impl fmt::Display for ClassIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.school_code, self.class_name)
    }
}

/// Build a token from a decimal school code and an ASCII class name.
///
/// Inputs that could not survive a round trip are refused: the school code
/// must be canonical decimal (no sign, no leading zeros) and the class name
/// must be non-empty ASCII.
pub fn encode(school_code: &str, class_name: &str) -> Result<String, TokenFormatError> {
    let code = parse_school_code(school_code)?;

    if class_name.is_empty() {
        return Err(TokenFormatError::UnsupportedClassName("class name is empty".into()));
    }
    if let Some(c) = class_name.chars().find(|c| !c.is_ascii()) {
        return Err(TokenFormatError::UnsupportedClassName(format!(
            "non-ASCII character {:?}",
            c
        )));
    }

    let segments: Vec<String> = class_name
        .bytes()
        .enumerate()
        .map(|(i, b)| format!("{:02x}", b ^ key_byte(i)))
        .collect();

    Ok(format!(
        "{:x}{}{}",
        code,
        CODE_SEPARATOR,
        segments.join(&SEGMENT_SEPARATOR.to_string())
    ))
}

/// Recover the school code and class name from a token.
pub fn decode(token: &str) -> Result<ClassIdentity, TokenFormatError> {
    let (code_part, segments_part) = token
        .trim()
        .split_once(CODE_SEPARATOR)
        .ok_or(TokenFormatError::MissingSeparator)?;

    if code_part.is_empty() || !code_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(TokenFormatError::InvalidSchoolCode(code_part.to_string()));
    }
    let code = u64::from_str_radix(code_part, 16)
        .map_err(|_| TokenFormatError::InvalidSchoolCode(code_part.to_string()))?;

    let mut class_name = String::new();
    for (index, segment) in segments_part.split(SEGMENT_SEPARATOR).enumerate() {
        if segment.is_empty() {
            return Err(TokenFormatError::EmptySegment(index));
        }
        // from_str_radix alone would accept "+f" or a single digit
        if segment.len() != 2 || !segment.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(TokenFormatError::InvalidSegment {
                index,
                segment: segment.to_string(),
            });
        }
        let byte = u8::from_str_radix(segment, 16).map_err(|_| TokenFormatError::InvalidSegment {
            index,
            segment: segment.to_string(),
        })?;

        let plain = byte ^ key_byte(index);
        if !plain.is_ascii() {
            return Err(TokenFormatError::NonAsciiByte(index));
        }
        class_name.push(plain as char);
    }

    Ok(ClassIdentity {
        school_code: code.to_string(),
        class_name,
    })
}

fn key_byte(index: usize) -> u8 {
    TOKEN_KEY[index % TOKEN_KEY.len()]
}

fn parse_school_code(school_code: &str) -> Result<u64, TokenFormatError> {
    let invalid = || TokenFormatError::InvalidSchoolCode(school_code.to_string());

    if school_code.is_empty() || !school_code.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    // Leading zeros would be lost on the way back
    if school_code.len() > 1 && school_code.starts_with('0') {
        return Err(invalid());
    }
    school_code.parse::<u64>().map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_known_example() {
        // 'A' ^ 'c' = 0x22, '1' ^ 'r' = 0x43
        assert_eq!(encode("123", "A1").unwrap(), "7b#22-43");
        assert_eq!(decode("7b#22-43").unwrap(), ClassIdentity::new("123", "A1"));
    }

    #[test]
    fn decodes_token_issued_by_teacher_app() {
        let identity = decode("7b#52-42-54-4a").unwrap();
        assert_eq!(identity.school_code, "123");
        assert_eq!(identity.class_name, "1052");
    }

    #[test]
    fn segments_are_case_insensitive() {
        assert_eq!(decode("7B#52-42-54-4A").unwrap(), decode("7b#52-42-54-4a").unwrap());
    }

    #[test]
    fn key_cycles_past_its_length() {
        let class_name = "Physics-Advanced 10B";
        let token = encode("98765", class_name).unwrap();
        assert_eq!(token.split('#').nth(1).unwrap().split('-').count(), class_name.len());

        let identity = decode(&token).unwrap();
        assert_eq!(identity, ClassIdentity::new("98765", class_name));
    }

    #[test]
    fn round_trips_printable_ascii() {
        let printable: String = (0x20u8..0x7f).map(|b| b as char).collect();
        for code in ["0", "7", "123", "4294967296", "18446744073709551615"] {
            let token = encode(code, &printable).unwrap();
            assert_eq!(decode(&token).unwrap(), ClassIdentity::new(code, printable.clone()));
        }
    }

    #[test]
    fn rejects_missing_separator() {
        assert_eq!(decode("7b52-42"), Err(TokenFormatError::MissingSeparator));
    }

    #[test]
    fn rejects_bad_school_code() {
        assert!(matches!(decode("#52"), Err(TokenFormatError::InvalidSchoolCode(_))));
        assert!(matches!(decode("zz#52"), Err(TokenFormatError::InvalidSchoolCode(_))));
        assert!(matches!(decode("+7b#52"), Err(TokenFormatError::InvalidSchoolCode(_))));
    }

    #[test]
    fn rejects_empty_segments() {
        assert_eq!(decode("7b#"), Err(TokenFormatError::EmptySegment(0)));
        assert_eq!(decode("7b#52--54"), Err(TokenFormatError::EmptySegment(1)));
        assert_eq!(decode("7b#52-"), Err(TokenFormatError::EmptySegment(1)));
    }

    #[test]
    fn rejects_non_hex_segments() {
        assert!(matches!(
            decode("7b#52-g2"),
            Err(TokenFormatError::InvalidSegment { index: 1, .. })
        ));
        assert!(matches!(
            decode("7b#5"),
            Err(TokenFormatError::InvalidSegment { index: 0, .. })
        ));
        assert!(matches!(
            decode("7b#152"),
            Err(TokenFormatError::InvalidSegment { index: 0, .. })
        ));
    }

    #[test]
    fn rejects_bytes_outside_ascii() {
        // 0xe3 ^ 'c' = 0x80
        assert_eq!(decode("7b#e3"), Err(TokenFormatError::NonAsciiByte(0)));
    }

    #[test]
    fn encode_refuses_unsupported_input() {
        assert!(matches!(encode("12a", "A"), Err(TokenFormatError::InvalidSchoolCode(_))));
        assert!(matches!(encode("0123", "A"), Err(TokenFormatError::InvalidSchoolCode(_))));
        assert!(matches!(encode("", "A"), Err(TokenFormatError::InvalidSchoolCode(_))));
        assert!(matches!(encode("1", ""), Err(TokenFormatError::UnsupportedClassName(_))));
        assert!(matches!(encode("1", "Klasse ä"), Err(TokenFormatError::UnsupportedClassName(_))));
    }

    #[test]
    fn parses_through_from_str() {
        let identity: ClassIdentity = "7b#22-43".parse().unwrap();
        assert_eq!(identity.to_string(), "123 / A1");
        assert_eq!(identity.encode().unwrap(), "7b#22-43");
    }
}
