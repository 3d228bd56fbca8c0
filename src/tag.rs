use chrono::{DateTime, Utc};
use std::fmt;

/// The tag applied to the images of one reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagTarget {
    /// Always apply exactly this tag.
    Fixed(String),
    /// Apply `<prefix><unix timestamp>`.
    Prefixed(String),
}

impl TagTarget {
    /// Produces the concrete tag for a run started at `now`.
    pub fn resolve(&self, now: DateTime<Utc>) -> String {
        match self {
            TagTarget::Fixed(tag) => tag.clone(),
            TagTarget::Prefixed(prefix) => format!("{}{}", prefix, now.timestamp()),
        }
    }

    /// Whether an existing tag already marks the image as deployed.
    pub fn is_satisfied_by(&self, tag: &str) -> bool {
        match self {
            TagTarget::Fixed(target) => tag == target,
            TagTarget::Prefixed(prefix) => tag.starts_with(prefix.as_str()),
        }
    }
}

impl fmt::Display for TagTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagTarget::Fixed(tag) => write!(f, "tag '{}'", tag),
            TagTarget::Prefixed(prefix) => write!(f, "tag prefix '{}'", prefix),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_resolve_fixed() {
        let target = TagTarget::Fixed("deployed".to_string());
        assert_eq!(target.resolve(Utc::now()), "deployed");
    }

    #[test]
    fn test_resolve_prefixed_appends_unix_timestamp() {
        let target = TagTarget::Prefixed("deployed-".to_string());
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(target.resolve(now), "deployed-1704164645");
    }

    #[test]
    fn test_fixed_is_satisfied_only_by_equal_tag() {
        let target = TagTarget::Fixed("test-tag".to_string());
        assert!(target.is_satisfied_by("test-tag"));
        assert!(!target.is_satisfied_by("test-tag-2"));
        assert!(!target.is_satisfied_by("latest"));
    }

    #[test]
    fn test_prefixed_is_satisfied_by_any_prefixed_tag() {
        let target = TagTarget::Prefixed("deployed".to_string());
        assert!(target.is_satisfied_by("deployed1704164645"));
        assert!(target.is_satisfied_by("deployed"));
        assert!(!target.is_satisfied_by("latest"));
        assert!(!target.is_satisfied_by("predeployed"));
    }
}
