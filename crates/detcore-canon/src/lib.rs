//! Canonical textual serialization.
//!
//! [`CanonicalValue`] is the only admissible input to the hash primitive's
//! domain-separated functions. Two semantically equal values always
//! serialize to byte-identical output: mapping keys are sorted by
//! lexicographic UTF-8 byte order, sequences preserve input order, integers
//! use shortest decimal form, and floats are always emitted with exactly
//! six fractional digits. The parser is strict: duplicate keys, invalid
//! UTF-8, NaN/Infinity, and out-of-range floats are hard parse errors
//! rather than silently accepted.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CanonError {
    #[error("invalid utf-8 in input")]
    InvalidUtf8,
    #[error("duplicate key in mapping: {0}")]
    DuplicateKey(String),
    #[error("NaN or infinite float is not representable")]
    NanOrInf,
    #[error("structural parse error: {0}")]
    Structural(String),
}

impl CanonError {
    pub fn code(&self) -> &'static str {
        match self {
            CanonError::InvalidUtf8 => "parse_invalid_utf8",
            CanonError::DuplicateKey(_) => "parse_duplicate_key",
            CanonError::NanOrInf => "parse_nan_or_inf",
            CanonError::Structural(_) => "parse_structural",
        }
    }
}

/// A structured value in canonical form.
///
/// `Object` stores entries in the order they were parsed (or inserted);
/// canonicalization always re-sorts keys at emit time, so insertion order
/// never affects the digest. Duplicate keys are rejected at construction
/// time via [`CanonicalValue::object`].
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<CanonicalValue>),
    Object(Vec<(String, CanonicalValue)>),
}

/// Floats at or beyond this magnitude cannot be represented faithfully in
/// fixed six-fractional-digit form and are rejected on parse, per the
/// pinned open-question decision (see `SPEC_FULL.md` §12).
const MAX_FLOAT_MAGNITUDE: f64 = 1.0e15;

impl CanonicalValue {
    pub fn object(entries: Vec<(String, CanonicalValue)>) -> Result<Self, CanonError> {
        let mut seen = std::collections::HashSet::new();
        for (k, _) in &entries {
            if !seen.insert(k.clone()) {
                return Err(CanonError::DuplicateKey(k.clone()));
            }
        }
        Ok(CanonicalValue::Object(entries))
    }

    pub fn float(value: f64) -> Result<Self, CanonError> {
        if value.is_nan() || value.is_infinite() {
            return Err(CanonError::NanOrInf);
        }
        if value.abs() >= MAX_FLOAT_MAGNITUDE {
            return Err(CanonError::Structural(format!(
                "float magnitude {value} exceeds representable range"
            )));
        }
        Ok(CanonicalValue::Float(value))
    }

    /// Serialize to the unique canonical textual form.
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        write_value(self, &mut out);
        out.into_bytes()
    }

    pub fn as_object(&self) -> Option<&[(String, CanonicalValue)]> {
        match self {
            CanonicalValue::Object(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&CanonicalValue> {
        self.as_object()?.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

fn write_value(value: &CanonicalValue, out: &mut String) {
    match value {
        CanonicalValue::Null => out.push_str("null"),
        CanonicalValue::Bool(true) => out.push_str("true"),
        CanonicalValue::Bool(false) => out.push_str("false"),
        CanonicalValue::Int(i) => {
            write!(out, "{i}").expect("writing to String never fails");
        }
        CanonicalValue::Float(f) => {
            write!(out, "{f:.6}").expect("writing to String never fails");
        }
        CanonicalValue::Str(s) => write_string(s, out),
        CanonicalValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        CanonicalValue::Object(entries) => {
            // Sort by lexicographic UTF-8 byte order of the key.
            let mut sorted: BTreeMap<&str, &CanonicalValue> = BTreeMap::new();
            for (k, v) in entries {
                sorted.insert(k.as_str(), v);
            }
            out.push('{');
            for (i, (k, v)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(k, out);
                out.push(':');
                write_value(v, out);
            }
            out.push('}');
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                write!(out, "\\u{:04x}", c as u32).expect("writing to String never fails");
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Parse canonical (or canonical-adjacent, e.g. scientific-notation floats
/// rejected by range rather than syntax) textual input into a
/// [`CanonicalValue`]. Strict: rejects duplicate keys and non-UTF-8 input.
pub fn parse(bytes: &[u8]) -> Result<CanonicalValue, CanonError> {
    let text = std::str::from_utf8(bytes).map_err(|_| CanonError::InvalidUtf8)?;
    let mut parser = Parser {
        chars: text.chars().collect(),
        pos: 0,
    };
    parser.skip_ws();
    let value = parser.parse_value()?;
    parser.skip_ws();
    if parser.pos != parser.chars.len() {
        return Err(CanonError::Structural("trailing data after value".into()));
    }
    Ok(value)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(' ') | Some('\t') | Some('\n') | Some('\r')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, c: char) -> Result<(), CanonError> {
        match self.bump() {
            Some(x) if x == c => Ok(()),
            other => Err(CanonError::Structural(format!(
                "expected '{c}', found {other:?}"
            ))),
        }
    }

    fn parse_value(&mut self) -> Result<CanonicalValue, CanonError> {
        self.skip_ws();
        match self.peek() {
            Some('{') => self.parse_object(),
            Some('[') => self.parse_array(),
            Some('"') => Ok(CanonicalValue::Str(self.parse_string()?)),
            Some('t') => self.parse_literal("true", CanonicalValue::Bool(true)),
            Some('f') => self.parse_literal("false", CanonicalValue::Bool(false)),
            Some('n') => self.parse_literal("null", CanonicalValue::Null),
            Some(c) if c == '-' || c.is_ascii_digit() => self.parse_number(),
            other => Err(CanonError::Structural(format!(
                "unexpected character: {other:?}"
            ))),
        }
    }

    fn parse_literal(
        &mut self,
        lit: &str,
        value: CanonicalValue,
    ) -> Result<CanonicalValue, CanonError> {
        for expected in lit.chars() {
            self.expect(expected)?;
        }
        Ok(value)
    }

    fn parse_object(&mut self) -> Result<CanonicalValue, CanonError> {
        self.expect('{')?;
        let mut entries = Vec::new();
        let mut seen = std::collections::HashSet::new();
        self.skip_ws();
        if self.peek() == Some('}') {
            self.bump();
            return Ok(CanonicalValue::Object(entries));
        }
        loop {
            self.skip_ws();
            let key = self.parse_string()?;
            self.skip_ws();
            self.expect(':')?;
            let value = self.parse_value()?;
            if !seen.insert(key.clone()) {
                return Err(CanonError::DuplicateKey(key));
            }
            entries.push((key, value));
            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some('}') => break,
                other => {
                    return Err(CanonError::Structural(format!(
                        "expected ',' or '}}', found {other:?}"
                    )))
                }
            }
        }
        Ok(CanonicalValue::Object(entries))
    }

    fn parse_array(&mut self) -> Result<CanonicalValue, CanonError> {
        self.expect('[')?;
        let mut items = Vec::new();
        self.skip_ws();
        if self.peek() == Some(']') {
            self.bump();
            return Ok(CanonicalValue::Array(items));
        }
        loop {
            let value = self.parse_value()?;
            items.push(value);
            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some(']') => break,
                other => {
                    return Err(CanonError::Structural(format!(
                        "expected ',' or ']', found {other:?}"
                    )))
                }
            }
        }
        Ok(CanonicalValue::Array(items))
    }

    fn parse_string(&mut self) -> Result<String, CanonError> {
        self.expect('"')?;
        let mut s = String::new();
        loop {
            match self.bump() {
                None => return Err(CanonError::Structural("unterminated string".into())),
                Some('"') => break,
                Some('\\') => match self.bump() {
                    Some('"') => s.push('"'),
                    Some('\\') => s.push('\\'),
                    Some('/') => s.push('/'),
                    Some('b') => s.push('\u{0008}'),
                    Some('f') => s.push('\u{000C}'),
                    Some('n') => s.push('\n'),
                    Some('r') => s.push('\r'),
                    Some('t') => s.push('\t'),
                    Some('u') => {
                        let cp = self.parse_hex4()?;
                        s.push(char::from_u32(cp).unwrap_or('\u{FFFD}'));
                    }
                    other => {
                        return Err(CanonError::Structural(format!(
                            "invalid escape: {other:?}"
                        )))
                    }
                },
                Some(c) => s.push(c),
            }
        }
        Ok(s)
    }

    fn parse_hex4(&mut self) -> Result<u32, CanonError> {
        let mut value = 0u32;
        for _ in 0..4 {
            let c = self
                .bump()
                .ok_or_else(|| CanonError::Structural("truncated \\u escape".into()))?;
            let digit = c
                .to_digit(16)
                .ok_or_else(|| CanonError::Structural(format!("invalid hex digit: {c}")))?;
            value = value * 16 + digit;
        }
        Ok(value)
    }

    fn parse_number(&mut self) -> Result<CanonicalValue, CanonError> {
        let start = self.pos;
        let mut is_float = false;

        if self.peek() == Some('-') {
            self.bump();
        }
        if self.peek() == Some('0') {
            self.bump();
        } else {
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.bump();
            }
        }
        if self.peek() == Some('.') {
            is_float = true;
            self.bump();
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.bump();
            }
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            is_float = true;
            self.bump();
            if matches!(self.peek(), Some('+') | Some('-')) {
                self.bump();
            }
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.bump();
            }
        }

        let text: String = self.chars[start..self.pos].iter().collect();
        if text.is_empty() || text == "-" {
            return Err(CanonError::Structural("empty number literal".into()));
        }

        if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| CanonError::Structural(format!("invalid float literal: {text}")))?;
            if value.is_nan() || value.is_infinite() {
                return Err(CanonError::NanOrInf);
            }
            if value.abs() >= MAX_FLOAT_MAGNITUDE {
                return Err(CanonError::Structural(format!(
                    "float magnitude {value} exceeds representable range"
                )));
            }
            Ok(CanonicalValue::Float(value))
        } else {
            let value: i64 = text
                .parse()
                .map_err(|_| CanonError::Structural(format!("invalid integer literal: {text}")))?;
            Ok(CanonicalValue::Int(value))
        }
    }
}
