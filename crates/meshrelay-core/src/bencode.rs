//! Self-describing binary codec used to talk to the overlay's admin service.
//!
//! # Wire Format
//!
//! A tagged union encoded as ASCII-ish bytes, in the tradition of the
//! bencode format used by BitTorrent:
//!
//! ```text
//! Integer:    i<decimal>e       canonical decimal, no leading zeros, no "-0"
//! ByteString: <len>:<bytes>     len is an unsigned canonical decimal
//! List:       l<value>*e
//! Dictionary: d(<bytestring><value>)*e   keys sorted, unique, byte-lexicographic
//! Boolean:    b0 | b1           local extension, not part of classic bencode
//! ```
//!
//! # Why this shape?
//!
//! It is self-describing (no external schema needed to decode a reply) and
//! its canonical form makes dictionary key order and integer representation
//! deterministic, which the admin-service exchange depends on.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use thiserror::Error;

/// How deeply nested lists/dictionaries may be before decoding gives up.
///
/// Bounds the stack depth used by a naive recursive-descent decoder against
/// adversarially nested input.
pub const MAX_DEPTH: usize = 256;

/// A decoded (or to-be-encoded) value in the self-describing format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    ByteString(Vec<u8>),
    List(Vec<Value>),
    /// Keys are byte strings compared by byte value; `BTreeMap<Vec<u8>, _>`
    /// naturally iterates in ascending byte-lexicographic order, which is
    /// exactly the canonical encoding order this format requires.
    Dictionary(BTreeMap<Vec<u8>, Value>),
    Boolean(bool),
}

impl Value {
    /// Convenience constructor for a byte-string value from a UTF-8 str.
    pub fn string(s: impl AsRef<str>) -> Self {
        Value::ByteString(s.as_ref().as_bytes().to_vec())
    }

    /// Returns the value as a UTF-8 string slice, if it is a byte string
    /// holding valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::ByteString(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::ByteString(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dictionary(map) => Some(map),
            _ => None,
        }
    }

    /// Looks up a key in a dictionary value by its string form.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict()?.get(key.as_bytes())
    }
}

/// The three error kinds `decode`/`decode_prefix` may return.
///
/// Kept distinct (rather than one catch-all variant) so callers can tell a
/// permanently malformed buffer apart from one that might simply need more
/// bytes once the caller can stream them in.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// The input violates the grammar or a canonicality rule.
    #[error("invalid encoding")]
    Invalid,
    /// The input is a valid prefix of a larger value; more bytes are needed.
    #[error("insufficient input")]
    Insufficient,
    /// A declared length is implausibly large (would require excessive
    /// allocation to even attempt parsing).
    #[error("declared size exceeds allowed bound")]
    OutOfMemory,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub message: String,
}

impl DecodeError {
    fn new(kind: DecodeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A length declared in the wire format larger than this is rejected as
/// `OutOfMemory` rather than attempted, regardless of how much of the
/// buffer is actually present.
const MAX_DECLARED_LEN: usize = 64 * 1024 * 1024;

/// Decodes a complete value from `bytes`, requiring the entire buffer to be
/// consumed by exactly one value.
pub fn decode(bytes: &[u8]) -> Result<Value, DecodeError> {
    let (value, consumed) = decode_prefix(bytes, 0)?;
    if consumed != bytes.len() {
        return Err(DecodeError::new(
            DecodeErrorKind::Invalid,
            "trailing bytes after decoded value",
        ));
    }
    Ok(value)
}

/// Decodes one value starting at `offset`, returning the value and the
/// offset of the first unconsumed byte. Allows streaming decode of a
/// sequence of back-to-back values.
pub fn decode_prefix(bytes: &[u8], offset: usize) -> Result<(Value, usize), DecodeError> {
    decode_at(bytes, offset, 0)
}

fn decode_at(bytes: &[u8], offset: usize, depth: usize) -> Result<(Value, usize), DecodeError> {
    if depth > MAX_DEPTH {
        return Err(DecodeError::new(
            DecodeErrorKind::Invalid,
            "nesting exceeds maximum depth",
        ));
    }
    let tag = *bytes
        .get(offset)
        .ok_or_else(|| DecodeError::new(DecodeErrorKind::Insufficient, "empty input"))?;

    match tag {
        b'i' => decode_integer(bytes, offset),
        b'l' => decode_list(bytes, offset, depth),
        b'd' => decode_dict(bytes, offset, depth),
        b'b' => decode_bool(bytes, offset),
        b'0'..=b'9' => decode_bytestring(bytes, offset),
        other => Err(DecodeError::new(
            DecodeErrorKind::Invalid,
            format!("unexpected tag byte {other:#04x}"),
        )),
    }
}

fn decode_integer(bytes: &[u8], offset: usize) -> Result<(Value, usize), DecodeError> {
    debug_assert_eq!(bytes[offset], b'i');
    let start = offset + 1;
    let end = find_byte(bytes, start, b'e')?;
    let digits = &bytes[start..end];
    let n = parse_canonical_i64(digits)?;
    Ok((Value::Integer(n), end + 1))
}

/// Parses `digits` as a canonical signed decimal integer: optional leading
/// `-`, no leading zeros (except the literal `"0"`), no `"-0"`, must fit in
/// an `i64`.
fn parse_canonical_i64(digits: &[u8]) -> Result<i64, DecodeError> {
    if digits.is_empty() {
        return Err(DecodeError::new(
            DecodeErrorKind::Invalid,
            "empty integer",
        ));
    }
    let (negative, unsigned) = match digits[0] {
        b'-' => (true, &digits[1..]),
        _ => (false, digits),
    };
    if unsigned.is_empty() || !unsigned.iter().all(u8::is_ascii_digit) {
        return Err(DecodeError::new(
            DecodeErrorKind::Invalid,
            "non-digit in integer",
        ));
    }
    if unsigned.len() > 1 && unsigned[0] == b'0' {
        return Err(DecodeError::new(
            DecodeErrorKind::Invalid,
            "leading zero in integer",
        ));
    }
    if negative && unsigned == b"0" {
        return Err(DecodeError::new(DecodeErrorKind::Invalid, "negative zero"));
    }
    let text = std::str::from_utf8(digits).expect("already validated ascii digits");
    text.parse::<i64>()
        .map_err(|_| DecodeError::new(DecodeErrorKind::Invalid, "integer does not fit in i64"))
}

fn decode_bytestring(bytes: &[u8], offset: usize) -> Result<(Value, usize), DecodeError> {
    let colon = find_byte(bytes, offset, b':')?;
    let len_digits = &bytes[offset..colon];
    let len = parse_canonical_len(len_digits)?;
    if len > MAX_DECLARED_LEN {
        return Err(DecodeError::new(
            DecodeErrorKind::OutOfMemory,
            format!("declared string length {len} exceeds bound"),
        ));
    }
    let data_start = colon + 1;
    let data_end = data_start
        .checked_add(len)
        .ok_or_else(|| DecodeError::new(DecodeErrorKind::OutOfMemory, "length overflow"))?;
    if data_end > bytes.len() {
        return Err(DecodeError::new(
            DecodeErrorKind::Insufficient,
            "declared string length exceeds remaining buffer",
        ));
    }
    Ok((
        Value::ByteString(bytes[data_start..data_end].to_vec()),
        data_end,
    ))
}

fn parse_canonical_len(digits: &[u8]) -> Result<usize, DecodeError> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(DecodeError::new(
            DecodeErrorKind::Invalid,
            "invalid string length",
        ));
    }
    if digits.len() > 1 && digits[0] == b'0' {
        return Err(DecodeError::new(
            DecodeErrorKind::Invalid,
            "leading zero in string length",
        ));
    }
    let text = std::str::from_utf8(digits).expect("already validated ascii digits");
    text.parse::<usize>()
        .map_err(|_| DecodeError::new(DecodeErrorKind::OutOfMemory, "length does not fit"))
}

fn decode_list(bytes: &[u8], offset: usize, depth: usize) -> Result<(Value, usize), DecodeError> {
    debug_assert_eq!(bytes[offset], b'l');
    let mut cursor = offset + 1;
    let mut items = Vec::new();
    loop {
        match bytes.get(cursor) {
            None => {
                return Err(DecodeError::new(
                    DecodeErrorKind::Insufficient,
                    "unterminated list",
                ))
            }
            Some(b'e') => return Ok((Value::List(items), cursor + 1)),
            Some(_) => {
                let (value, next) = decode_at(bytes, cursor, depth + 1)?;
                items.push(value);
                cursor = next;
            }
        }
    }
}

fn decode_dict(bytes: &[u8], offset: usize, depth: usize) -> Result<(Value, usize), DecodeError> {
    debug_assert_eq!(bytes[offset], b'd');
    let mut cursor = offset + 1;
    let mut map = BTreeMap::new();
    let mut last_key: Option<Vec<u8>> = None;
    loop {
        match bytes.get(cursor) {
            None => {
                return Err(DecodeError::new(
                    DecodeErrorKind::Insufficient,
                    "unterminated dictionary",
                ))
            }
            Some(b'e') => return Ok((Value::Dictionary(map), cursor + 1)),
            Some(_) => {
                let (key_value, after_key) = decode_at(bytes, cursor, depth + 1)?;
                let key = match key_value {
                    Value::ByteString(k) => k,
                    _ => {
                        return Err(DecodeError::new(
                            DecodeErrorKind::Invalid,
                            "dictionary key must be a byte string",
                        ))
                    }
                };
                if let Some(prev) = &last_key {
                    match key.as_slice().cmp(prev.as_slice()) {
                        Ordering::Greater => {}
                        Ordering::Equal => {
                            return Err(DecodeError::new(
                                DecodeErrorKind::Invalid,
                                "duplicate dictionary key",
                            ))
                        }
                        Ordering::Less => {
                            return Err(DecodeError::new(
                                DecodeErrorKind::Invalid,
                                "dictionary keys out of order",
                            ))
                        }
                    }
                }
                let (value, after_value) = decode_at(bytes, after_key, depth + 1)?;
                last_key = Some(key.clone());
                map.insert(key, value);
                cursor = after_value;
            }
        }
    }
}

fn decode_bool(bytes: &[u8], offset: usize) -> Result<(Value, usize), DecodeError> {
    debug_assert_eq!(bytes[offset], b'b');
    match bytes.get(offset + 1) {
        Some(b'0') => Ok((Value::Boolean(false), offset + 2)),
        Some(b'1') => Ok((Value::Boolean(true), offset + 2)),
        Some(_) => Err(DecodeError::new(DecodeErrorKind::Invalid, "invalid boolean")),
        None => Err(DecodeError::new(
            DecodeErrorKind::Insufficient,
            "truncated boolean",
        )),
    }
}

fn find_byte(bytes: &[u8], start: usize, needle: u8) -> Result<usize, DecodeError> {
    bytes[start..]
        .iter()
        .position(|&b| b == needle)
        .map(|pos| start + pos)
        .ok_or_else(|| {
            DecodeError::new(
                DecodeErrorKind::Insufficient,
                format!("missing terminator {needle:#04x}"),
            )
        })
}

/// Encodes `value` into a freshly allocated buffer. Dictionaries are
/// emitted with keys in ascending byte order (guaranteed by `BTreeMap`'s
/// iteration order), which is the canonical encoding.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(value));
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Integer(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::ByteString(bytes) => {
            out.extend_from_slice(bytes.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(bytes);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dictionary(map) => {
            out.push(b'd');
            for (key, value) in map {
                encode_into(&Value::ByteString(key.clone()), out);
                encode_into(value, out);
            }
            out.push(b'e');
        }
        Value::Boolean(b) => {
            out.push(b'b');
            out.push(if *b { b'1' } else { b'0' });
        }
    }
}

/// Computes the encoded size of `value` without allocating, so callers can
/// pre-size buffers.
pub fn encoded_len(value: &Value) -> usize {
    match value {
        Value::Integer(n) => 1 + n.to_string().len() + 1,
        Value::ByteString(bytes) => bytes.len().to_string().len() + 1 + bytes.len(),
        Value::List(items) => 2 + items.iter().map(encoded_len).sum::<usize>(),
        Value::Dictionary(map) => {
            2 + map
                .iter()
                .map(|(k, v)| encoded_len(&Value::ByteString(k.clone())) + encoded_len(v))
                .sum::<usize>()
        }
        Value::Boolean(_) => 2,
    }
}

/// Comparison order used for sorting and set operations over values:
/// integers sort before byte strings; integers compare numerically;
/// byte strings compare by byte value then length (`memcmp`-then-length).
/// Other variants have no defined relative order and compare `Equal` to
/// themselves only when byte-identical.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => x.cmp(y),
        (Value::Integer(_), Value::ByteString(_)) => Ordering::Less,
        (Value::ByteString(_), Value::Integer(_)) => Ordering::Greater,
        (Value::ByteString(x), Value::ByteString(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(pairs: &[(&str, Value)]) -> Value {
        let mut map = BTreeMap::new();
        for (k, v) in pairs {
            map.insert(k.as_bytes().to_vec(), v.clone());
        }
        Value::Dictionary(map)
    }

    #[test]
    fn roundtrip_integer() {
        for n in [0_i64, 1, -1, 123456789, i64::MAX, i64::MIN] {
            let v = Value::Integer(n);
            let bytes = encode(&v);
            assert_eq!(decode(&bytes).unwrap(), v);
        }
    }

    #[test]
    fn roundtrip_bytestring() {
        let v = Value::string("hello world");
        let bytes = encode(&v);
        assert_eq!(bytes, b"11:hello world");
        assert_eq!(decode(&bytes).unwrap(), v);
    }

    #[test]
    fn roundtrip_empty_bytestring() {
        let v = Value::ByteString(vec![]);
        let bytes = encode(&v);
        assert_eq!(bytes, b"0:");
        assert_eq!(decode(&bytes).unwrap(), v);
    }

    #[test]
    fn roundtrip_list() {
        let v = Value::List(vec![Value::Integer(1), Value::string("x")]);
        let bytes = encode(&v);
        assert_eq!(bytes, b"li1e1:xe");
        assert_eq!(decode(&bytes).unwrap(), v);
    }

    #[test]
    fn roundtrip_dict_sorted_keys() {
        let v = dict(&[
            ("q", Value::string("NodeStore_dumpTable")),
            (
                "args",
                dict(&[("page", Value::Integer(0))]),
            ),
        ]);
        let bytes = encode(&v);
        // "args" sorts before "q" regardless of insertion order above.
        assert_eq!(bytes, b"d4:argsd4:pagei0ee1:q20:NodeStore_dumpTablee");
        assert_eq!(decode(&bytes).unwrap(), v);
    }

    #[test]
    fn roundtrip_boolean() {
        for v in [Value::Boolean(true), Value::Boolean(false)] {
            let bytes = encode(&v);
            assert_eq!(decode(&bytes).unwrap(), v);
        }
    }

    #[test]
    fn decode_prefix_streams_multiple_values() {
        let bytes = b"i1ei2ei3e";
        let (a, off1) = decode_prefix(bytes, 0).unwrap();
        let (b, off2) = decode_prefix(bytes, off1).unwrap();
        let (c, off3) = decode_prefix(bytes, off2).unwrap();
        assert_eq!((a, b, c), (Value::Integer(1), Value::Integer(2), Value::Integer(3)));
        assert_eq!(off3, bytes.len());
    }

    #[test]
    fn rejects_negative_zero() {
        assert_eq!(decode(b"i-0e").unwrap_err().kind, DecodeErrorKind::Invalid);
    }

    #[test]
    fn rejects_leading_zero() {
        assert_eq!(decode(b"i03e").unwrap_err().kind, DecodeErrorKind::Invalid);
    }

    #[test]
    fn accepts_bare_zero() {
        assert_eq!(decode(b"i0e").unwrap(), Value::Integer(0));
    }

    #[test]
    fn rejects_malformed_integer() {
        assert_eq!(decode(b"i e").unwrap_err().kind, DecodeErrorKind::Invalid);
    }

    #[test]
    fn rejects_unsorted_dict_keys() {
        let err = decode(b"d1:bi1e1:ai2ee").unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::Invalid);
    }

    #[test]
    fn rejects_duplicate_dict_keys() {
        let err = decode(b"d1:ai1e1:ai2ee").unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::Invalid);
    }

    #[test]
    fn rejects_string_length_past_buffer() {
        let err = decode(b"10:short").unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::Insufficient);
    }

    #[test]
    fn rejects_excessive_depth() {
        let mut bytes = vec![b'l'; MAX_DEPTH + 2];
        bytes.extend(std::iter::repeat(b'e').take(MAX_DEPTH + 2));
        let err = decode(&bytes).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::Invalid);
    }

    #[test]
    fn accepts_depth_at_bound() {
        let depth = MAX_DEPTH;
        let mut bytes = vec![b'l'; depth];
        bytes.extend(std::iter::repeat(b'e').take(depth));
        assert!(decode(&bytes).is_ok());
    }

    #[test]
    fn value_comparison_order() {
        assert_eq!(
            compare_values(&Value::Integer(5), &Value::string("a")),
            Ordering::Less
        );
        assert_eq!(
            compare_values(&Value::Integer(1), &Value::Integer(2)),
            Ordering::Less
        );
        assert_eq!(
            compare_values(&Value::string("ab"), &Value::string("b")),
            Ordering::Less
        );
    }

    #[test]
    fn admin_request_shape() {
        // S1: encoding {"args": {"page": 0}, "q": "NodeStore_dumpTable"}
        // must come out with "args" before "q".
        let req = dict(&[
            ("q", Value::string("NodeStore_dumpTable")),
            ("args", dict(&[("page", Value::Integer(0))])),
        ]);
        let encoded = encode(&req);
        let args_pos = encoded.windows(4).position(|w| w == b"args").unwrap();
        let q_pos = encoded.windows(1).position(|w| w == b"q").unwrap();
        assert!(args_pos < q_pos);
        assert_eq!(decode(&encoded).unwrap(), req);
    }

    #[test]
    fn admin_reply_shape_s2() {
        // S2: d11:routingTablel d2:ip9:abc:::::1 e e 4:morei1e e  (spaces for
        // readability only — encode without them for the actual wire form)
        let bytes = "d11:routingTablel d2:ip9:abc:::::1 e e 4:morei1ee".replace(" ", "");
        let value = decode(bytes.as_bytes()).unwrap();
        let table = value.get("routingTable").unwrap().as_list().unwrap();
        assert_eq!(table.len(), 1);
        let ip = table[0].get("ip").unwrap().as_str().unwrap();
        assert_eq!(ip, "abc:::::1");
        assert_eq!(value.get("more").unwrap().as_integer(), Some(1));
    }
}
