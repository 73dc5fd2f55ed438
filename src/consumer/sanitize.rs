//! Field clean-up applied before a message is stored
//!
//! Document stores reject keys containing `.`, and text must be valid
//! UTF-8 before it can be stored at all. The repair functions are also
//! what lets the parser accept bodies with broken text.

use crate::event::{Fields, Value};
use std::borrow::Cow;

const REPLACEMENT_ESCAPE: &str = "\\ufffd";

/// Replace every `.` in a key with `_`
pub fn sanitize_key(key: &str) -> String {
    key.replace('.', "_")
}

/// Sanitize every key of a mapping, recursing into nested mappings,
/// including mappings held inside arrays
pub fn sanitize_fields(fields: Fields) -> Fields {
    fields
        .into_iter()
        .map(|(key, value)| (sanitize_key(&key), sanitize_value(value)))
        .collect()
}

/// Sanitize the keys of any mapping inside `value`
pub fn sanitize_value(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(sanitize_fields(map)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        other => other,
    }
}

/// Decode bytes as UTF-8, dropping every invalid sequence
///
/// Valid characters are kept in their original order.
pub fn repair_text(bytes: &[u8]) -> String {
    let mut repaired = String::with_capacity(bytes.len());
    let mut rest = bytes;

    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                repaired.push_str(valid);
                break;
            }
            Err(err) => {
                let (valid, after) = rest.split_at(err.valid_up_to());
                repaired.push_str(std::str::from_utf8(valid).unwrap_or_default());
                match err.error_len() {
                    Some(len) => rest = &after[len..],
                    // truncated sequence at the very end
                    None => break,
                }
            }
        }
    }

    repaired
}

/// Rewrite unpaired UTF-16 surrogate escapes in JSON text to `\ufffd`
///
/// Properly paired surrogates and every other escape are left alone.
pub fn repair_escapes(text: &str) -> Cow<'_, str> {
    if !text.contains("\\u") {
        return Cow::Borrowed(text);
    }

    let bytes = text.as_bytes();
    let mut repaired = String::new();
    let mut changed = false;
    let mut copied = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'\\' {
            i += 1;
            continue;
        }
        match unicode_escape(bytes, i) {
            Some(0xD800..=0xDBFF)
                if matches!(unicode_escape(bytes, i + 6), Some(0xDC00..=0xDFFF)) =>
            {
                i += 12
            }
            Some(0xD800..=0xDFFF) => {
                repaired.push_str(&text[copied..i]);
                repaired.push_str(REPLACEMENT_ESCAPE);
                i += 6;
                copied = i;
                changed = true;
            }
            Some(_) => i += 6,
            // `\\`, `\"` and the other two-byte escapes
            None => i += 2,
        }
    }

    if !changed {
        Cow::Borrowed(text)
    } else {
        repaired.push_str(&text[copied..]);
        Cow::Owned(repaired)
    }
}

/// Code unit of the `\uXXXX` escape starting at `at`
fn unicode_escape(bytes: &[u8], at: usize) -> Option<u16> {
    let escape = bytes.get(at..at + 6)?;
    if escape[0] != b'\\' || escape[1] != b'u' || !escape[2..].iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let digits = std::str::from_utf8(&escape[2..]).ok()?;
    u16::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("a.b.c", "a_b_c")]
    #[case("plain", "plain")]
    #[case("..", "__")]
    #[case("", "")]
    fn test_sanitize_key(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(sanitize_key(input), expected);
    }

    #[test]
    fn test_sanitize_nested_fields() {
        let fields: Fields = serde_json::from_str(
            r#"{"x.y": {"a.b": 1, "list": [{"c.d": true}, "e.f"]}, "keep": "v.w"}"#,
        )
        .unwrap();

        let clean = sanitize_fields(fields);
        let inner = clean["x_y"].as_object().unwrap();
        assert_eq!(inner["a_b"], Value::Integer(1));
        match &inner["list"] {
            Value::Array(items) => {
                assert!(items[0].as_object().unwrap().contains_key("c_d"));
                // values are never touched
                assert_eq!(items[1], Value::String("e.f".to_string()));
            }
            other => panic!("expected array, got {:?}", other),
        }
        assert_eq!(clean["keep"], Value::String("v.w".to_string()));
    }

    #[rstest]
    #[case(b"hello", "hello")]
    #[case(b"he\xffllo", "hello")]
    #[case(b"\xc3\xa9t\xc3\xa9", "\u{e9}t\u{e9}")]
    #[case(b"ab\xe2\x82", "ab")]
    #[case(b"\xf0\x28\x8c\x28x", "((x")]
    fn test_repair_text(#[case] input: &[u8], #[case] expected: &str) {
        assert_eq!(repair_text(input), expected);
    }

    #[rstest]
    #[case(r#""x\ud800y""#, r#""x\ufffdy""#)]
    #[case(r#""\udc00""#, r#""\ufffd""#)]
    #[case(r#""\ud800\ud800""#, r#""\ufffd\ufffd""#)]
    #[case(r#""\ud83d\ude00""#, r#""\ud83d\ude00""#)]
    #[case(r#""\\ud800""#, r#""\\ud800""#)]
    #[case(r#""caf\u00e9\n""#, r#""caf\u00e9\n""#)]
    fn test_repair_escapes(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(repair_escapes(input), expected);
    }

    #[test]
    fn test_repair_escapes_borrows_clean_text() {
        assert!(matches!(repair_escapes(r#"{"a": "\u0041"}"#), Cow::Borrowed(_)));
    }
}
