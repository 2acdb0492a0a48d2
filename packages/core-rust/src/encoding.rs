//! Order-preserving byte encodings for index entries and primary keys.
//!
//! Index values encode so that byte order equals value order:
//!
//! | type    | tag    | payload                                         |
//! |---------|--------|-------------------------------------------------|
//! | boolean | `0x10` | `0x00` / `0x01`                                 |
//! | number  | `0x20` | 8 bytes sign-flipped IEEE 754, then 8 bytes sign-flipped `i64` residual |
//! | string  | `0x30` | UTF-8 with `0x00` escaped as `0x00 0xFF`, then `0x00 0x00` |
//!
//! Every encoding is self-delimiting, so a primary key can be appended to an
//! encoded value without disturbing the value order. Integers and floats
//! share the number space: the leading 8 bytes order by the nearest `f64`
//! and the residual is what an integer loses to that rounding, so integers
//! beyond 2^53 stay distinct. Null, NaN, arrays and maps have no encoding
//! and are never indexed.

use crate::types::{Key, Value};

/// Bumped whenever an encoding changes, so stored index entries are rebuilt.
pub const ENCODING_VERSION: &str = "2";

pub const TAG_BOOL: u8 = 0x10;
pub const TAG_NUMBER: u8 = 0x20;
pub const TAG_STRING: u8 = 0x30;

const ESCAPE: u8 = 0xFF;
const TERMINATOR: [u8; 2] = [0x00, 0x00];

/// Encodes an indexable value, or `None` when the value cannot be indexed.
#[must_use]
pub fn encode_value(value: &Value) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    match value {
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*b));
        }
        Value::Int(i) => {
            #[allow(clippy::cast_precision_loss)]
            let f = *i as f64;
            out.push(TAG_NUMBER);
            out.extend_from_slice(&ordered_f64(f));
            out.extend_from_slice(&ordered_i64(rounding_residual(*i, f)));
        }
        Value::Float(f) => {
            if f.is_nan() {
                return None;
            }
            out.push(TAG_NUMBER);
            out.extend_from_slice(&ordered_f64(*f));
            out.extend_from_slice(&ordered_i64(0));
        }
        Value::String(s) => {
            out.push(TAG_STRING);
            push_escaped(&mut out, s.as_bytes());
        }
        Value::Null | Value::Array(_) | Value::Map(_) => return None,
    }
    Some(out)
}

/// Encodes a primary key. Numeric keys sort before string keys.
#[must_use]
pub fn encode_key(key: &Key) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    match key {
        Key::Int(i) => {
            out.push(TAG_NUMBER);
            out.extend_from_slice(&ordered_i64(*i));
        }
        Key::Str(s) => {
            out.push(TAG_STRING);
            push_escaped(&mut out, s.as_bytes());
        }
    }
    out
}

/// Decodes bytes produced by [`encode_key`].
#[must_use]
pub fn decode_key(bytes: &[u8]) -> Option<Key> {
    let (&tag, rest) = bytes.split_first()?;
    match tag {
        TAG_NUMBER => {
            let raw: [u8; 8] = rest.try_into().ok()?;
            #[allow(clippy::cast_possible_wrap)]
            let value = (u64::from_be_bytes(raw) ^ (1 << 63)) as i64;
            Some(Key::Int(value))
        }
        TAG_STRING => {
            let (raw, consumed) = read_escaped(rest)?;
            if consumed != rest.len() {
                return None;
            }
            String::from_utf8(raw).ok().map(Key::Str)
        }
        _ => None,
    }
}

/// Encodes a field name as an index-entry prefix.
#[must_use]
pub fn encode_field(field: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(field.len() + 2);
    push_escaped(&mut out, field.as_bytes());
    out
}

/// Smallest byte string greater than every string starting with `prefix`.
///
/// Returns `None` when no such string exists (`prefix` is empty or all `0xFF`).
#[must_use]
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.pop() {
        if last < u8::MAX {
            out.push(last + 1);
            return Some(out);
        }
    }
    None
}

fn ordered_i64(i: i64) -> [u8; 8] {
    #[allow(clippy::cast_sign_loss)]
    let flipped = (i as u64) ^ (1 << 63);
    flipped.to_be_bytes()
}

/// `i - f`, exactly, where `f` is `i` rounded to the nearest `f64`.
fn rounding_residual(i: i64, f: f64) -> i64 {
    // `f` is integral whenever rounding happened.
    #[allow(clippy::cast_possible_truncation)]
    let rounded = f as i128;
    i64::try_from(i128::from(i) - rounded).unwrap_or(0)
}

fn ordered_f64(f: f64) -> [u8; 8] {
    // -0.0 and 0.0 must collide.
    let f = if f == 0.0 { 0.0 } else { f };
    let bits = f.to_bits();
    let ordered = if bits & (1 << 63) == 0 {
        bits ^ (1 << 63)
    } else {
        !bits
    };
    ordered.to_be_bytes()
}

fn push_escaped(out: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        out.push(b);
        if b == 0x00 {
            out.push(ESCAPE);
        }
    }
    out.extend_from_slice(&TERMINATOR);
}

/// Reads one escaped, terminated run. Returns the raw bytes and the number
/// of input bytes consumed including the terminator.
fn read_escaped(bytes: &[u8]) -> Option<(Vec<u8>, usize)> {
    let mut raw = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == 0x00 {
            match bytes.get(i + 1)? {
                0x00 => return Some((raw, i + 2)),
                &ESCAPE => {
                    raw.push(0x00);
                    i += 2;
                    continue;
                }
                _ => return None,
            }
        }
        raw.push(b);
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn enc(value: impl Into<Value>) -> Vec<u8> {
        encode_value(&value.into()).unwrap()
    }

    #[test]
    fn type_order_is_bool_number_string() {
        assert!(enc(true) < enc(-1_000_000));
        assert!(enc(1e300) < enc(""));
    }

    #[test]
    fn ints_and_floats_share_one_space() {
        assert_eq!(enc(2), enc(2.0));
        assert!(enc(2) < enc(2.5));
        assert!(enc(-0.5) < enc(0));
    }

    #[test]
    fn large_ints_stay_distinct() {
        let base = 1_i64 << 53;
        assert!(enc(base) < enc(base + 1));
        assert!(enc(base + 1) < enc(base + 2));
        assert!(enc(i64::MAX - 1) < enc(i64::MAX));
        assert!(enc(i64::MIN) < enc(i64::MIN + 1));
        assert_eq!(enc(base), enc(9_007_199_254_740_992.0));
        assert!(enc(base + 1) > enc(9_007_199_254_740_992.0));
    }

    #[test]
    fn negative_zero_equals_zero() {
        assert_eq!(enc(-0.0), enc(0.0));
    }

    #[test]
    fn unindexable_values_have_no_encoding() {
        assert_eq!(encode_value(&Value::Null), None);
        assert_eq!(encode_value(&Value::Float(f64::NAN)), None);
        assert_eq!(encode_value(&Value::Array(vec![])), None);
    }

    #[test]
    fn string_prefix_sorts_first() {
        assert!(enc("a") < enc("ab"));
        assert!(enc("ab") < enc("b"));
        assert!(enc("a\u{0}b") > enc("a"));
    }

    #[test]
    fn key_round_trip_with_embedded_nul() {
        for key in [Key::Int(i64::MIN), Key::Int(0), Key::Int(42), Key::from("x\u{0}y"), Key::from("")] {
            assert_eq!(decode_key(&encode_key(&key)), Some(key));
        }
    }

    #[test]
    fn decode_key_rejects_garbage() {
        assert_eq!(decode_key(&[]), None);
        assert_eq!(decode_key(&[0x99, 1]), None);
        assert_eq!(decode_key(&[TAG_NUMBER, 1, 2]), None);
        assert_eq!(decode_key(&[TAG_STRING, b'a']), None);
    }

    #[test]
    fn prefix_successor_carries() {
        assert_eq!(prefix_successor(&[1, 2]), Some(vec![1, 3]));
        assert_eq!(prefix_successor(&[1, 0xFF]), Some(vec![2]));
        assert_eq!(prefix_successor(&[0xFF, 0xFF]), None);
        assert_eq!(prefix_successor(&[]), None);
    }

    proptest! {
        #[test]
        fn number_encoding_preserves_order(a in -1e12f64..1e12, b in -1e12f64..1e12) {
            let (ea, eb) = (enc(a), enc(b));
            prop_assert_eq!(a.partial_cmp(&b), Some(ea.cmp(&eb)));
        }

        #[test]
        fn int_encoding_preserves_order(a in any::<i64>(), b in any::<i64>()) {
            prop_assert_eq!(a.cmp(&b), enc(a).cmp(&enc(b)));
        }

        #[test]
        fn string_encoding_preserves_order(a in ".{0,12}", b in ".{0,12}") {
            let (ea, eb) = (enc(a.as_str()), enc(b.as_str()));
            prop_assert_eq!(a.as_bytes().cmp(b.as_bytes()), ea.cmp(&eb));
        }

        #[test]
        fn key_encoding_preserves_order(a in any::<i64>(), b in any::<i64>()) {
            let (ka, kb) = (Key::Int(a), Key::Int(b));
            prop_assert_eq!(ka.cmp(&kb), encode_key(&ka).cmp(&encode_key(&kb)));
        }

        #[test]
        fn value_order_survives_key_suffix(a in ".{0,6}", b in ".{0,6}", ka in any::<i64>(), kb in any::<i64>()) {
            prop_assume!(a != b);
            let mut ea = enc(a.as_str());
            ea.extend(encode_key(&Key::Int(ka)));
            let mut eb = enc(b.as_str());
            eb.extend(encode_key(&Key::Int(kb)));
            prop_assert_eq!(a.as_bytes().cmp(b.as_bytes()), ea.cmp(&eb));
        }
    }
}
