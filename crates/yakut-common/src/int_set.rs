//! Integer set notation used for node-ID and status-code arguments.
//!
//! ```text
//! Discrete elements (, or ;):   1,56;-3
//! Intervals [lo,hi) (- or ...): 10-23,-5--7,-10..-2
//! Exclusion with ! prefix:      5-9,!6,!5...7
//! Arbitrary combination:        -9--5;+4,!-8..-5
//! JSON/YAML compatibility:      [1,53,78]
//! ```

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Help text shown by commands that accept integer sets.
pub const INT_SET_USER_DOC: &str = "\
Integer set notation examples:
    Discrete elements (, or ;):   1,56;-3
    Intervals [lo,hi) (- or ...): 10-23,-5--7,-10..-2
    Exclusion with ! prefix:      5-9,!6,!5...7
    Arbitrary combination:        -9--5;+4,!-8..-5
    JSON/YAML compatibility:      [1,53,78]";

/// Ranges wider than this are rejected instead of being materialized.
const MAX_RANGE_SPAN: i64 = 1 << 24;

#[allow(clippy::expect_used)] // literal patterns, compiled in tests
static RE_JSON_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\[([^\]]*)\]\s*$").expect("pattern is valid"));
#[allow(clippy::expect_used)]
static RE_SPLIT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[,;]").expect("pattern is valid"));
#[allow(clippy::expect_used)]
static RE_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([+-]?\w+)(?:-|\.\.\.?)([+-]?\w+)").expect("pattern is valid")
});

/// An item of the set notation could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("item {item:?} of the integer set {text:?} could not be parsed")]
pub struct IntSetError {
    /// The offending item.
    pub item: String,
    /// The complete input.
    pub text: String,
}

/// Result of parsing the integer set notation.
///
/// A lone integer without a trailing separator stays a scalar, which lets
/// commands unwrap their per-node output for the single-node case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntSet {
    /// A single integer given without separators or list brackets.
    Scalar(i64),
    /// Everything else, including the empty set.
    Set(BTreeSet<i64>),
}

impl IntSet {
    /// Whether the input was a bare scalar.
    #[must_use]
    pub const fn is_scalar(&self) -> bool {
        matches!(self, Self::Scalar(_))
    }

    /// Elements in ascending order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<i64> {
        match self {
            Self::Scalar(x) => vec![*x],
            Self::Set(s) => s.iter().copied().collect(),
        }
    }

    /// Whether the set holds `value`.
    #[must_use]
    pub fn contains(&self, value: i64) -> bool {
        match self {
            Self::Scalar(x) => *x == value,
            Self::Set(s) => s.contains(&value),
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Scalar(_) => 1,
            Self::Set(s) => s.len(),
        }
    }

    /// Whether there are no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromStr for IntSet {
    type Err = IntSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_int_set(s)
    }
}

/// Parses an integer literal the way a base-prefixed literal is usually read:
/// optional sign, then `0x`/`0o`/`0b` or decimal digits, underscores allowed
/// between digits. Decimal literals may not carry leading zeros.
#[must_use]
pub fn parse_int_literal(text: &str) -> Option<i64> {
    let text = text.trim();
    let (negative, body) = match text.as_bytes().first()? {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };
    let lower = body.to_ascii_lowercase();
    let (radix, digits) = if let Some(rest) = lower.strip_prefix("0x") {
        (16, rest)
    } else if let Some(rest) = lower.strip_prefix("0o") {
        (8, rest)
    } else if let Some(rest) = lower.strip_prefix("0b") {
        (2, rest)
    } else {
        (10, lower.as_str())
    };
    let digits = if radix == 10 {
        digits
    } else {
        digits.strip_prefix('_').unwrap_or(digits)
    };
    if digits.is_empty() || digits.starts_with('_') || digits.ends_with('_') || digits.contains("__") {
        return None;
    }
    let cleaned: String = digits.chars().filter(|c| *c != '_').collect();
    if !cleaned.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    if radix == 10 && cleaned.len() > 1 && cleaned.starts_with('0') && cleaned.chars().any(|c| c != '0') {
        return None;
    }
    let magnitude = i64::from_str_radix(&cleaned, radix).ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

/// Unpacks the integer set notation.
///
/// # Errors
///
/// Returns [`IntSetError`] when an item is neither an integer nor a range.
pub fn parse_int_set(text: &str) -> Result<IntSet, IntSetError> {
    let json_list = RE_JSON_LIST.captures(text);
    let mut collapse = json_list.is_none();
    let body = json_list
        .and_then(|c| c.get(1))
        .map_or(text, |m| m.as_str());

    let fail = |item: &str| IntSetError {
        item: item.to_owned(),
        text: text.to_owned(),
    };

    let mut include = BTreeSet::new();
    let mut exclude = BTreeSet::new();
    for raw in RE_SPLIT.split(body) {
        let mut item = raw.trim();
        if item.is_empty() {
            collapse = false;
            continue;
        }
        let target = if let Some(rest) = item.strip_prefix('!') {
            item = rest;
            &mut exclude
        } else {
            &mut include
        };
        if let Some(x) = parse_int_literal(item) {
            let _ = target.insert(x);
            continue;
        }
        let caps = RE_RANGE.captures(item).ok_or_else(|| fail(item))?;
        let lo = caps.get(1).and_then(|m| parse_int_literal(m.as_str()));
        let hi = caps.get(2).and_then(|m| parse_int_literal(m.as_str()));
        match (lo, hi) {
            (Some(lo), Some(hi)) => {
                if hi.saturating_sub(lo) > MAX_RANGE_SPAN {
                    return Err(fail(item));
                }
                target.extend(lo..hi);
            }
            _ => return Err(fail(item)),
        }
    }

    let result: BTreeSet<i64> = include.difference(&exclude).copied().collect();
    tracing::debug!(input = text, parsed = ?result, "integer set parsed");
    if collapse && result.len() == 1 {
        if let Some(x) = result.first() {
            return Ok(IntSet::Scalar(*x));
        }
    }
    Ok(IntSet::Set(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(text: &str) -> Vec<i64> {
        parse_int_set(text).expect("should parse").to_vec()
    }

    #[test]
    fn empty_input_is_empty_set() {
        assert_eq!(parse_int_set("").expect("parse"), IntSet::Set(BTreeSet::new()));
    }

    #[test]
    fn lone_scalar_collapses() {
        assert_eq!(parse_int_set("123").expect("parse"), IntSet::Scalar(123));
        assert_eq!(parse_int_set("-0").expect("parse"), IntSet::Scalar(0));
    }

    #[test]
    fn trailing_separator_or_list_keeps_set() {
        assert_eq!(parse_int_set("123,").expect("parse"), IntSet::Set([123].into()));
        assert_eq!(parse_int_set("[123]").expect("parse"), IntSet::Set([123].into()));
        assert_eq!(parse_int_set("[-0]").expect("parse"), IntSet::Set([0].into()));
    }

    #[test]
    fn half_open_intervals_with_all_separators() {
        assert_eq!(set("0..0x0A"), (0..10).collect::<Vec<_>>());
        assert_eq!(set("-9...-5,"), vec![-9, -8, -7, -6]);
        assert!(set("6-6").is_empty());
    }

    #[test]
    fn exclusions_are_applied_last() {
        assert_eq!(set("-9--5; +4, !-8..-5"), vec![-9, 4]);
        assert_eq!(set("-10..+10,!-9-+9"), vec![-10, 9]);
    }

    #[test]
    fn json_list_is_accepted() {
        assert_eq!(set("[1,53,78]"), vec![1, 53, 78]);
    }

    #[test]
    fn dangling_range_is_an_error() {
        let err = parse_int_set("123,456,9-").expect_err("should fail");
        assert_eq!(err.item, "9-");
    }

    #[test]
    fn literals_follow_prefixed_syntax() {
        assert_eq!(parse_int_literal("0x1F"), Some(31));
        assert_eq!(parse_int_literal("0b101"), Some(5));
        assert_eq!(parse_int_literal("+1_000"), Some(1000));
        assert_eq!(parse_int_literal("010"), None);
        assert_eq!(parse_int_literal("000"), Some(0));
        assert_eq!(parse_int_literal("abc"), None);
    }

    #[test]
    fn contains_and_len_cover_both_shapes() {
        let scalar = parse_int_set("5").expect("parse");
        assert!(scalar.contains(5));
        assert_eq!(scalar.len(), 1);
        let many = parse_int_set("1-4").expect("parse");
        assert!(many.contains(3));
        assert!(!many.contains(4));
        assert_eq!(many.len(), 3);
    }

    #[test]
    fn patterns_compile() {
        let _ = LazyLock::force(&RE_JSON_LIST);
        let _ = LazyLock::force(&RE_SPLIT);
        let _ = LazyLock::force(&RE_RANGE);
    }
}
