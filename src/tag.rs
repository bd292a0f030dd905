//! Tag handling for series identification.

use crate::{LinDbError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Maximum length of tag key.
pub const MAX_TAG_KEY_LEN: usize = 256;

/// Maximum length of tag value.
pub const MAX_TAG_VALUE_LEN: usize = 16 * 1024;

/// Maximum metric-name length.
pub const MAX_METRIC_NAME_LEN: usize = 1024;

const SERIES_KEY_SEPARATOR: char = ',';
const TAG_PAIR_SEPARATOR: char = '=';

/// A series tag.
/// A tag with missing key or value is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    fn truncate_utf8(s: &mut String, max_len: usize) {
        if s.len() <= max_len {
            return;
        }

        let mut trunc_at = max_len;
        while trunc_at > 0 && !s.is_char_boundary(trunc_at) {
            trunc_at -= 1;
        }
        s.truncate(trunc_at);
    }

    /// Creates a new tag, truncating oversized keys and values.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut key = key.into();
        let mut value = value.into();

        if key.len() > MAX_TAG_KEY_LEN {
            Self::truncate_utf8(&mut key, MAX_TAG_KEY_LEN);
        }
        if value.len() > MAX_TAG_VALUE_LEN {
            Self::truncate_utf8(&mut value, MAX_TAG_VALUE_LEN);
        }

        Self { key, value }
    }

    /// Checks if the tag is valid (both key and value are non-empty and
    /// free of the series key separators).
    pub fn is_valid(&self) -> bool {
        !self.key.is_empty()
            && !self.value.is_empty()
            && !self.key.contains([SERIES_KEY_SEPARATOR, TAG_PAIR_SEPARATOR])
            && !self.value.contains(SERIES_KEY_SEPARATOR)
    }
}

impl Ord for Tag {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.key.cmp(&other.key) {
            Ordering::Equal => self.value.cmp(&other.value),
            other => other,
        }
    }
}

impl PartialOrd for Tag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Validates a metric name.
pub fn validate_metric_name(metric: &str) -> Result<()> {
    if metric.is_empty() {
        return Err(LinDbError::MetricRequired);
    }
    if metric.len() > MAX_METRIC_NAME_LEN {
        return Err(LinDbError::Other(format!(
            "metric name longer than {} bytes",
            MAX_METRIC_NAME_LEN
        )));
    }
    Ok(())
}

/// Builds the canonical series key of a tag set: tags sorted by key, invalid
/// tags dropped, rendered as `k1=v1,k2=v2`. An empty tag set yields "".
pub fn series_key(tags: &[Tag]) -> String {
    let mut sorted: Vec<&Tag> = tags.iter().filter(|t| t.is_valid()).collect();
    sorted.sort();
    sorted.dedup_by(|a, b| a.key == b.key);

    let mut out = String::with_capacity(sorted.iter().map(|t| t.key.len() + t.value.len() + 2).sum());
    for (idx, tag) in sorted.iter().enumerate() {
        if idx > 0 {
            out.push(SERIES_KEY_SEPARATOR);
        }
        out.push_str(&tag.key);
        out.push(TAG_PAIR_SEPARATOR);
        out.push_str(&tag.value);
    }
    out
}

/// Parses a series key produced by [`series_key`] back into tags.
pub fn parse_series_key(key: &str) -> Result<Vec<Tag>> {
    if key.is_empty() {
        return Ok(Vec::new());
    }
    key.split(SERIES_KEY_SEPARATOR)
        .map(|pair| {
            let (k, v) = pair
                .split_once(TAG_PAIR_SEPARATOR)
                .ok_or_else(|| LinDbError::InvalidTag(pair.to_string()))?;
            Ok(Tag::new(k, v))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_creation() {
        let tag = Tag::new("host", "server1");
        assert_eq!(tag.key, "host");
        assert_eq!(tag.value, "server1");
        assert!(tag.is_valid());
    }

    #[test]
    fn test_tag_truncation_preserves_utf8_boundaries() {
        let long_key = "é".repeat(MAX_TAG_KEY_LEN);
        let long_value = "😀".repeat((MAX_TAG_VALUE_LEN / 4) + 10);

        let tag = Tag::new(long_key, long_value);
        assert!(tag.key.is_char_boundary(tag.key.len()));
        assert!(tag.key.len() <= MAX_TAG_KEY_LEN);
        assert!(tag.value.len() <= MAX_TAG_VALUE_LEN);
    }

    #[test]
    fn test_invalid_tags() {
        assert!(!Tag::new("", "value").is_valid());
        assert!(!Tag::new("name", "").is_valid());
        assert!(!Tag::new("a=b", "c").is_valid());
        assert!(!Tag::new("a", "b,c").is_valid());
    }

    #[test]
    fn series_key_is_order_independent() {
        let a = series_key(&[Tag::new("region", "sh"), Tag::new("host", "h1")]);
        let b = series_key(&[Tag::new("host", "h1"), Tag::new("region", "sh")]);
        assert_eq!(a, b);
        assert_eq!(a, "host=h1,region=sh");
        assert_eq!(series_key(&[]), "");
    }

    #[test]
    fn series_key_parses_back() {
        let tags = vec![Tag::new("host", "h1"), Tag::new("ip", "1.1.1.1")];
        let parsed = parse_series_key(&series_key(&tags)).unwrap();
        assert_eq!(parsed, tags);
        assert!(parse_series_key("").unwrap().is_empty());
        assert!(parse_series_key("broken").is_err());
    }

    #[test]
    fn metric_name_validation() {
        assert!(validate_metric_name("cpu").is_ok());
        assert!(matches!(
            validate_metric_name(""),
            Err(LinDbError::MetricRequired)
        ));
        assert!(validate_metric_name(&"m".repeat(MAX_METRIC_NAME_LEN + 1)).is_err());
    }
}
