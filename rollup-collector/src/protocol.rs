//! Metric identities and the naming grammar enforced before submission.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Type used for counter values.
pub type CounterValue = f64;

/// Type used for measured values, such as timings in milliseconds.
pub type MeasureValue = f64;

/// The tag set of a metric.
///
/// Tags are unique by key, and their order is irrelevant for equality.
pub type Tags = BTreeMap<String, String>;

/// The tag name used for the legacy single-dimension `source` of a metric.
pub const SOURCE_TAG: &str = "source";

/// Maximum length of a metric name.
pub const MAX_NAME_LENGTH: usize = 255;

/// Maximum length of a tag key.
pub const MAX_TAG_KEY_LENGTH: usize = 64;

/// Maximum length of a tag value.
pub const MAX_TAG_VALUE_LENGTH: usize = 255;

/// The identity of a metric series: its name and tag set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct MetricKey {
    /// The name of the metric, without prefix.
    pub name: String,
    /// The tags of the metric.
    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    pub tags: Tags,
}

impl MetricKey {
    /// Creates a key without tags.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: Tags::new(),
        }
    }

    /// Creates a key with the given tags.
    pub fn with_tags(name: impl Into<String>, tags: Tags) -> Self {
        Self {
            name: name.into(),
            tags,
        }
    }

    /// Creates a key from the legacy `(name, source)` form.
    ///
    /// The source is represented as a tag named `source`.
    pub fn with_source(name: impl Into<String>, source: impl fmt::Display) -> Self {
        Self::with_tags(
            name,
            Tags::from([(SOURCE_TAG.to_owned(), source.to_string())]),
        )
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;

        if !self.tags.is_empty() {
            f.write_str("{")?;
            for (index, (key, value)) in self.tags.iter().enumerate() {
                if index > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{key}={value}")?;
            }
            f.write_str("}")?;
        }

        Ok(())
    }
}

/// Joins an optional prefix and a metric name with a period.
pub(crate) fn qualify(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}.{name}"),
        _ => name.to_owned(),
    }
}

fn is_identifier_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'.' | b':' | b'-')
}

/// Validates a metric name.
///
/// Metric names must be between 1 and 255 characters long and can consist of ASCII
/// alphanumerics, underscores, periods, colons and dashes.
pub fn is_valid_name(name: &str) -> bool {
    (1..=MAX_NAME_LENGTH).contains(&name.len()) && name.bytes().all(is_identifier_byte)
}

/// Validates a tag key.
///
/// Tag keys follow the metric name grammar, but are limited to 64 characters.
pub fn is_valid_tag_key(tag_key: &str) -> bool {
    (1..=MAX_TAG_KEY_LENGTH).contains(&tag_key.len()) && tag_key.bytes().all(is_identifier_byte)
}

/// Validates a tag value.
///
/// Tag values follow the metric name grammar and additionally allow embedded whitespace.
pub fn is_valid_tag_value(tag_value: &str) -> bool {
    (1..=MAX_TAG_VALUE_LENGTH).contains(&tag_value.len())
        && tag_value
            .bytes()
            .all(|b| is_identifier_byte(b) || b.is_ascii_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_equality_ignores_tag_order() {
        let mut first = Tags::new();
        first.insert("region".to_owned(), "us".to_owned());
        first.insert("host".to_owned(), "a".to_owned());

        let mut second = Tags::new();
        second.insert("host".to_owned(), "a".to_owned());
        second.insert("region".to_owned(), "us".to_owned());

        assert_eq!(
            MetricKey::with_tags("requests", first),
            MetricKey::with_tags("requests", second)
        );
    }

    #[test]
    fn test_source_is_a_tag() {
        let key = MetricKey::with_source("jobs.queued", "worker.3");
        assert_eq!(key.tags.get(SOURCE_TAG).map(String::as_str), Some("worker.3"));
        assert_eq!(key.to_string(), "jobs.queued{source=worker.3}");
    }

    #[test]
    fn test_qualify() {
        assert_eq!(qualify(None, "foo"), "foo");
        assert_eq!(qualify(Some(""), "foo"), "foo");
        assert_eq!(qualify(Some("app"), "foo"), "app.foo");
    }

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("request.time.total"));
        assert!(is_valid_name("a-b_c:d.e"));
        assert!(is_valid_name(&"x".repeat(255)));

        assert!(!is_valid_name(""));
        assert!(!is_valid_name("bad name!"));
        assert!(!is_valid_name("invalid metric name"));
        assert!(!is_valid_name("umlaut.ä"));
        assert!(!is_valid_name(&"x".repeat(256)));
    }

    #[test]
    fn test_valid_tags() {
        assert!(is_valid_tag_key("valid_tag_name"));
        assert!(!is_valid_tag_key("invalid_tag_name!"));
        assert!(!is_valid_tag_key(&"k".repeat(65)));
        assert!(!is_valid_tag_key("has space"));

        assert!(is_valid_tag_value("valid_tag_value"));
        assert!(is_valid_tag_value("valid tag value"));
        assert!(!is_valid_tag_value("invalid_tag_value!"));
        assert!(!is_valid_tag_value(""));
        assert!(!is_valid_tag_value(&"v".repeat(256)));
    }
}
