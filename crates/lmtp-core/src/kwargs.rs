//! The free-form + recognized sampling options carried by every call.
//!
//! [`Kwargs`] is a thin, ordered wrapper around a map of option name to
//! [`KwValue`]. It's used both for a [`GenerateCall`]'s sampling
//! configuration (temperature, max_tokens, top_logprobs, score,
//! scoring_offset, plus opaque backend-specific keys like `top_k` or
//! `repetition_penalty`) and for a model's load-time arguments.
//!
//! The underlying `BTreeMap` gives deterministic, sorted-by-key iteration for
//! free: both `generation_mode()`'s compatibility key and the canonical
//! model-args encoding need exactly that, and neither has to sort anything
//! itself.
//!
//! [`GenerateCall`]: ../../lmtp_server/server/call/struct.GenerateCall.html

use std::collections::BTreeMap;
use std::fmt;

/// A single recognized or opaque option value.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum KwValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for KwValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for KwValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for KwValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for KwValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for KwValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<&str> for KwValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

/// Recognized kwargs keys, pulled out by name when a component needs the
/// typed value rather than the opaque map entry.
pub const KEY_TEMPERATURE: &str = "temperature";
pub const KEY_MAX_TOKENS: &str = "max_tokens";
pub const KEY_TOP_LOGPROBS: &str = "top_logprobs";
pub const KEY_SCORE: &str = "score";
pub const KEY_SCORING_OFFSET: &str = "scoring_offset";

const DEFAULT_TEMPERATURE: f64 = 0.0;
const DEFAULT_MAX_TOKENS: i64 = 32;
const DEFAULT_TOP_LOGPROBS: i64 = 1;
const DEFAULT_SCORING_OFFSET: i64 = 0;

/// An ordered map of call/model options.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Kwargs(BTreeMap<String, KwValue>);

impl Kwargs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<KwValue>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<KwValue> {
        self.0.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&KwValue> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &KwValue)> {
        self.0.iter()
    }

    /// `temperature`, defaulting to `0.0` if absent or not numeric.
    pub fn temperature(&self) -> f64 {
        match self.0.get(KEY_TEMPERATURE) {
            Some(KwValue::Float(v)) => *v,
            Some(KwValue::Int(v)) => *v as f64,
            _ => DEFAULT_TEMPERATURE,
        }
    }

    /// `max_tokens`, defaulting to `32` if absent.
    pub fn max_tokens(&self) -> i64 {
        match self.0.get(KEY_MAX_TOKENS) {
            Some(KwValue::Int(v)) => *v,
            Some(KwValue::Float(v)) => *v as i64,
            _ => DEFAULT_MAX_TOKENS,
        }
    }

    /// `top_logprobs`, defaulting to `1` if absent.
    pub fn top_logprobs(&self) -> i64 {
        match self.0.get(KEY_TOP_LOGPROBS) {
            Some(KwValue::Int(v)) => *v,
            Some(KwValue::Float(v)) => *v as i64,
            _ => DEFAULT_TOP_LOGPROBS,
        }
    }

    /// `score`, defaulting to `false` if absent.
    pub fn score(&self) -> bool {
        matches!(self.0.get(KEY_SCORE), Some(KwValue::Bool(true)))
    }

    /// `scoring_offset`, defaulting to `0` if absent.
    pub fn scoring_offset(&self) -> i64 {
        match self.0.get(KEY_SCORING_OFFSET) {
            Some(KwValue::Int(v)) => *v,
            Some(KwValue::Float(v)) => *v as i64,
            _ => DEFAULT_SCORING_OFFSET,
        }
    }

    /// A copy of `self` with `max_tokens`, `top_logprobs`, and `temperature`
    /// removed — the set of keys a batch normalizes away before it hands the
    /// residual options to the backend (spec.md §4.2 step 8).
    pub fn without_normalized(&self) -> Self {
        let mut residual = self.clone();
        residual.remove(KEY_MAX_TOKENS);
        residual.remove(KEY_TOP_LOGPROBS);
        residual.remove(KEY_TEMPERATURE);
        residual
    }

    /// The compatibility key used to partition calls into batchable groups,
    /// excluding `max_tokens` and `top_logprobs`, with `temperature`
    /// defaulting to `0.0`. Two calls share a key iff they can legally run
    /// in the same batch.
    ///
    /// Stable under key-order permutation because the backing map is a
    /// `BTreeMap`: insertion order never affects iteration order.
    pub fn compatibility_key(&self) -> String {
        let mut key_args = self.clone();
        key_args.remove(KEY_MAX_TOKENS);
        key_args.remove(KEY_TOP_LOGPROBS);
        key_args
            .0
            .entry(KEY_TEMPERATURE.to_string())
            .or_insert(KwValue::Float(DEFAULT_TEMPERATURE));

        key_args
            .0
            .iter()
            .map(|(k, v)| format!("{k}-{v}"))
            .collect::<Vec<_>>()
            .join("-")
    }
}

impl FromIterator<(String, KwValue)> for Kwargs {
    fn from_iter<T: IntoIterator<Item = (String, KwValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compatibility_key_ignores_max_tokens_and_top_logprobs() {
        let mut a = Kwargs::new();
        a.insert(KEY_MAX_TOKENS, 10_i64).insert(KEY_TOP_LOGPROBS, 3_i64);
        let mut b = Kwargs::new();
        b.insert(KEY_MAX_TOKENS, 999_i64).insert(KEY_TOP_LOGPROBS, 1_i64);

        assert_eq!(a.compatibility_key(), b.compatibility_key());
    }

    #[test]
    fn compatibility_key_differs_on_temperature() {
        let mut a = Kwargs::new();
        a.insert(KEY_TEMPERATURE, 0.5_f64);
        let mut b = Kwargs::new();
        b.insert(KEY_TEMPERATURE, 0.7_f64);

        assert_ne!(a.compatibility_key(), b.compatibility_key());
    }

    #[test]
    fn compatibility_key_defaults_temperature_to_zero() {
        let a = Kwargs::new();
        let mut b = Kwargs::new();
        b.insert(KEY_TEMPERATURE, 0.0_f64);

        assert_eq!(a.compatibility_key(), b.compatibility_key());
    }

    #[test]
    fn compatibility_key_stable_under_key_permutation() {
        let mut a = Kwargs::new();
        a.insert("top_k", 50_i64).insert(KEY_TEMPERATURE, 0.3_f64);
        let mut b = Kwargs::new();
        b.insert(KEY_TEMPERATURE, 0.3_f64).insert("top_k", 50_i64);

        assert_eq!(a.compatibility_key(), b.compatibility_key());
    }

    #[test]
    fn score_defaults_false() {
        assert!(!Kwargs::new().score());
    }
}
