//! Canonical model-args encoding (spec.md §6).
//!
//! The scheduler registry keys schedulers by `(model_identifier,
//! canonicalized-model-args)`, so that two logically-equal argument sets
//! collide on the same registry entry even if they were constructed through
//! different call paths. [`canonical_key`] produces that deterministic,
//! byte-stable string.
//!
//! The encoding is a simple tagged byte stream over the argument map's
//! `BTreeMap` iteration (already sorted by key, so no separate sort step is
//! needed), hex-encoded for use as a map key / log-friendly string.

use crate::kwargs::{KwValue, Kwargs};

const TAG_BOOL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_STR: u8 = 3;

fn push_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn encode_value(buf: &mut Vec<u8>, value: &KwValue) {
    match value {
        KwValue::Bool(b) => {
            buf.push(TAG_BOOL);
            buf.push(u8::from(*b));
        }
        KwValue::Int(i) => {
            buf.push(TAG_INT);
            buf.extend_from_slice(&i.to_le_bytes());
        }
        KwValue::Float(f) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&f.to_le_bytes());
        }
        KwValue::Str(s) => {
            buf.push(TAG_STR);
            push_len_prefixed(buf, s.as_bytes());
        }
    }
}

fn encode_bytes(model_identifier: &str, model_args: &Kwargs) -> Vec<u8> {
    let mut buf = Vec::new();
    push_len_prefixed(&mut buf, model_identifier.as_bytes());
    for (key, value) in model_args.iter() {
        push_len_prefixed(&mut buf, key.as_bytes());
        encode_value(&mut buf, value);
    }
    buf
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// The deterministic registry key for `(model_identifier, model_args)`. Two
/// argument sets encode to the same key iff they are semantically equal.
pub fn canonical_key(model_identifier: &str, model_args: &Kwargs) -> String {
    to_hex(&encode_bytes(model_identifier, model_args))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_args_collide() {
        let mut a = Kwargs::new();
        a.insert("device", "cuda").insert("dtype", "fp16");
        let mut b = Kwargs::new();
        b.insert("dtype", "fp16").insert("device", "cuda");

        assert_eq!(
            canonical_key("gpt2", &a),
            canonical_key("gpt2", &b),
            "key order must not affect the canonical encoding"
        );
    }

    #[test]
    fn different_model_identifiers_never_collide() {
        let args = Kwargs::new();
        assert_ne!(
            canonical_key("gpt2", &args),
            canonical_key("gpt2-medium", &args)
        );
    }

    #[test]
    fn different_values_never_collide() {
        let mut a = Kwargs::new();
        a.insert("device", "cuda");
        let mut b = Kwargs::new();
        b.insert("device", "cpu");

        assert_ne!(canonical_key("gpt2", &a), canonical_key("gpt2", &b));
    }
}
