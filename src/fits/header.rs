//! FITS header cards: 80-byte records grouped in 2880-byte blocks.

use std::fmt;

use crate::error::{CubeError, Result, Stage};

pub const CARD_LEN: usize = 80;
pub const BLOCK_LEN: usize = 2880;

/// A header keyword value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl HeaderValue {
    /// Numeric value as `f64`; integers are widened.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HeaderValue::Int(i) => Some(*i as f64),
            HeaderValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(i) => Some(*i),
            HeaderValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl From<f64> for HeaderValue {
    fn from(v: f64) -> Self {
        HeaderValue::Float(v)
    }
}

impl From<i64> for HeaderValue {
    fn from(v: i64) -> Self {
        HeaderValue::Int(v)
    }
}

impl From<usize> for HeaderValue {
    fn from(v: usize) -> Self {
        HeaderValue::Int(v as i64)
    }
}

impl From<bool> for HeaderValue {
    fn from(v: bool) -> Self {
        HeaderValue::Bool(v)
    }
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        HeaderValue::Str(v.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        HeaderValue::Str(v)
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Bool(b) => write!(f, "{:>20}", if *b { "T" } else { "F" }),
            HeaderValue::Int(i) => write!(f, "{i:>20}"),
            HeaderValue::Float(v) => {
                // Shortest round-trip form in exponent notation.
                let s = format!("{v:E}");
                write!(f, "{s:>20}")
            }
            HeaderValue::Str(s) => {
                let escaped = s.replace('\'', "''");
                write!(f, "'{escaped:<8}'")
            }
        }
    }
}

/// One header record. Commentary cards (`COMMENT`, `HISTORY`, blank) carry no value.
#[derive(Debug, Clone, PartialEq)]
pub struct Card {
    pub keyword: String,
    pub value: Option<HeaderValue>,
    pub comment: Option<String>,
}

impl Card {
    /// Render the card as exactly 80 ASCII bytes.
    pub fn to_bytes(&self) -> [u8; CARD_LEN] {
        let mut text = format!("{:<8}", self.keyword);
        match &self.value {
            Some(v) => {
                text.push_str("= ");
                text.push_str(&v.to_string());
                if let Some(c) = &self.comment {
                    text.push_str(" / ");
                    text.push_str(c);
                }
            }
            None => {
                if let Some(c) = &self.comment {
                    text.push_str(c);
                }
            }
        }
        let mut out = [b' '; CARD_LEN];
        for (dst, src) in out.iter_mut().zip(text.bytes().filter(|b| b.is_ascii())) {
            *dst = src;
        }
        out
    }
}

/// Parse a single 80-byte card. Returns `None` for the `END` card.
fn parse_card(card: &[u8]) -> Option<Card> {
    let text = String::from_utf8_lossy(card);
    let keyword = text.get(..8).unwrap_or(&text).trim().to_string();
    if keyword == "END" {
        return None;
    }
    let rest = text.get(8..).unwrap_or("");
    if !rest.starts_with("= ") && !rest.starts_with("=") {
        let comment = rest.trim();
        return Some(Card {
            keyword,
            value: None,
            comment: (!comment.is_empty()).then(|| comment.to_string()),
        });
    }

    let value_str = rest[1..].trim_start();
    let (value, comment) = if let Some(stripped) = value_str.strip_prefix('\'') {
        // Quoted string: '' is an escaped quote.
        let mut s = String::new();
        let mut chars = stripped.char_indices().peekable();
        let mut end = stripped.len();
        while let Some((i, c)) = chars.next() {
            if c == '\'' {
                if matches!(chars.peek(), Some((_, '\''))) {
                    s.push('\'');
                    chars.next();
                } else {
                    end = i + 1;
                    break;
                }
            } else {
                s.push(c);
            }
        }
        let tail = &stripped[end.min(stripped.len())..];
        let comment = tail.split_once('/').map(|(_, c)| c.trim().to_string());
        (Some(HeaderValue::Str(s.trim_end().to_string())), comment)
    } else {
        let (num, comment) = match value_str.split_once('/') {
            Some((n, c)) => (n.trim(), Some(c.trim().to_string())),
            None => (value_str.trim(), None),
        };
        let value = if num.is_empty() {
            None
        } else if num == "T" {
            Some(HeaderValue::Bool(true))
        } else if num == "F" {
            Some(HeaderValue::Bool(false))
        } else if let Ok(i) = num.parse::<i64>() {
            Some(HeaderValue::Int(i))
        } else if let Ok(f) = num.replace(['D', 'd'], "E").parse::<f64>() {
            Some(HeaderValue::Float(f))
        } else {
            Some(HeaderValue::Str(num.to_string()))
        };
        (value, comment)
    };

    Some(Card {
        keyword,
        value,
        comment: comment.filter(|c| !c.is_empty()),
    })
}

/// Ordered list of header cards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    cards: Vec<Card>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a header from raw bytes (a multiple of 80 bytes, END optional).
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let cards = bytes
            .chunks(CARD_LEN)
            .map_while(parse_card)
            .collect();
        Self { cards }
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn get(&self, keyword: &str) -> Option<&HeaderValue> {
        self.cards
            .iter()
            .find(|c| c.keyword == keyword)
            .and_then(|c| c.value.as_ref())
    }

    pub fn contains(&self, keyword: &str) -> bool {
        self.get(keyword).is_some()
    }

    pub fn get_f64(&self, keyword: &str) -> Option<f64> {
        self.get(keyword).and_then(HeaderValue::as_f64)
    }

    pub fn get_i64(&self, keyword: &str) -> Option<i64> {
        self.get(keyword).and_then(HeaderValue::as_i64)
    }

    pub fn get_str(&self, keyword: &str) -> Option<&str> {
        self.get(keyword).and_then(HeaderValue::as_str)
    }

    /// Integer keyword that must be present.
    pub fn require_i64(&self, keyword: &str) -> Result<i64> {
        self.get_i64(keyword).ok_or_else(|| {
            CubeError::format(Stage::Header, format!("missing integer keyword {keyword}"))
        })
    }

    /// Replace the value of `keyword`, or append a new card.
    pub fn set(&mut self, keyword: &str, value: impl Into<HeaderValue>) {
        let keyword = keyword.to_ascii_uppercase();
        let value = value.into();
        match self.cards.iter_mut().find(|c| c.keyword == keyword) {
            Some(card) => card.value = Some(value),
            None => self.cards.push(Card {
                keyword,
                value: Some(value),
                comment: None,
            }),
        }
    }

    /// Remove every card with this keyword.
    pub fn remove(&mut self, keyword: &str) {
        self.cards.retain(|c| c.keyword != keyword);
    }

    pub fn push(&mut self, card: Card) {
        self.cards.push(card);
    }

    /// Serialize followed by `END`, padded with spaces to a whole block.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity((self.cards.len() + 1) * CARD_LEN);
        for card in &self.cards {
            out.extend_from_slice(&card.to_bytes());
        }
        let mut end = [b' '; CARD_LEN];
        end[..3].copy_from_slice(b"END");
        out.extend_from_slice(&end);
        let padded = out.len().div_ceil(BLOCK_LEN) * BLOCK_LEN;
        out.resize(padded, b' ');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(text: &str) -> Vec<u8> {
        let mut b = text.as_bytes().to_vec();
        b.resize(CARD_LEN, b' ');
        b
    }

    #[test]
    fn test_parse_numeric_and_string_cards() {
        let c = parse_card(&card("NAXIS1  =                  128 / length of axis 1")).unwrap();
        assert_eq!(c.keyword, "NAXIS1");
        assert_eq!(c.value, Some(HeaderValue::Int(128)));
        assert_eq!(c.comment.as_deref(), Some("length of axis 1"));

        let c = parse_card(&card("CDELT3  =      -1.2207031250D+04")).unwrap();
        assert_eq!(c.value.unwrap().as_f64(), Some(-12207.03125));

        let c = parse_card(&card("CTYPE1  = 'RA---TAN'           / projection")).unwrap();
        assert_eq!(c.value, Some(HeaderValue::Str("RA---TAN".into())));

        let c = parse_card(&card("OBSERVER= 'O''Brien'")).unwrap();
        assert_eq!(c.value.unwrap().as_str(), Some("O'Brien"));

        let c = parse_card(&card("SIMPLE  =                    T")).unwrap();
        assert_eq!(c.value, Some(HeaderValue::Bool(true)));

        assert!(parse_card(&card("END")).is_none());

        let c = parse_card(&card("HISTORY reduced with pipeline v2")).unwrap();
        assert!(c.value.is_none());
    }

    #[test]
    fn test_header_serialization_roundtrip() {
        let mut h = Header::new();
        h.set("SIMPLE", true);
        h.set("BITPIX", -32_i64);
        h.set("CRVAL1", 83.822083_f64);
        h.set("CDELT3", -1.0e-7_f64);
        h.set("CTYPE3", "VRAD");
        h.set("BUNIT", "Jy/beam");

        let bytes = h.to_bytes();
        assert_eq!(bytes.len() % BLOCK_LEN, 0);

        let parsed = Header::from_bytes(&bytes);
        assert_eq!(parsed.get_f64("CRVAL1"), Some(83.822083));
        assert_eq!(parsed.get_f64("CDELT3"), Some(-1.0e-7));
        assert_eq!(parsed.get_i64("BITPIX"), Some(-32));
        assert_eq!(parsed.get_str("CTYPE3"), Some("VRAD"));
        assert_eq!(parsed.get_str("BUNIT"), Some("Jy/beam"));
    }

    #[test]
    fn test_set_replaces_existing() {
        let mut h = Header::new();
        h.set("CRPIX1", 1.0_f64);
        h.set("crpix1", 5.5_f64);
        assert_eq!(h.len(), 1);
        assert_eq!(h.get_f64("CRPIX1"), Some(5.5));
        h.remove("CRPIX1");
        assert!(h.is_empty());
    }
}
