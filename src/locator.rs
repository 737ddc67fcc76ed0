//! Target locator validation.
//!
//! A source is created from the URL it scrapes. The URL decides the source
//! category: the site root is the home feed, `pop`/`trending`/`popular` are
//! popular listings, and any other first path segment names a user.

use url::Url;

use crate::error::{Result, RunschedError};
use crate::store::SourceCategory;

/// Path segments that denote the popular-content listing.
const POPULAR_SEGMENTS: &[&str] = &["pop", "trending", "popular"];

/// A validated target locator with its derived category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetLocator {
    pub url: String,
    pub category: SourceCategory,
    pub username: Option<String>,
}

impl TargetLocator {
    /// Validate a raw URL and derive category and username.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(RunschedError::InvalidInput("url must not be empty".to_string()));
        }

        let parsed = Url::parse(trimmed).map_err(|e| RunschedError::InvalidInput(format!("invalid url '{}': {}", trimmed, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RunschedError::InvalidInput(format!(
                "url must use http or https, got '{}'",
                parsed.scheme()
            )));
        }
        if parsed.host_str().is_none_or(str::is_empty) {
            return Err(RunschedError::InvalidInput(format!("url '{}' has no host", trimmed)));
        }

        let first_segment = parsed
            .path_segments()
            .and_then(|mut segments| segments.find(|s| !s.is_empty()))
            .map(str::to_lowercase);

        let (category, username) = match first_segment {
            None => (SourceCategory::Home, None),
            Some(segment) if POPULAR_SEGMENTS.contains(&segment.as_str()) => (SourceCategory::Pop, None),
            Some(segment) => (SourceCategory::User, Some(segment)),
        };

        Ok(Self {
            url: trimmed.to_string(),
            category,
            username,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_root_is_home() {
        let locator = TargetLocator::parse("https://savee.it/").unwrap();
        assert_eq!(locator.category, SourceCategory::Home);
        assert!(locator.username.is_none());

        let bare = TargetLocator::parse("https://savee.it").unwrap();
        assert_eq!(bare.category, SourceCategory::Home);
    }

    #[test]
    fn test_popular_paths_are_pop() {
        for url in ["https://savee.it/pop", "https://savee.it/trending/", "https://savee.it/Popular?x=1"] {
            let locator = TargetLocator::parse(url).unwrap();
            assert_eq!(locator.category, SourceCategory::Pop, "{}", url);
            assert!(locator.username.is_none());
        }
    }

    #[test]
    fn test_other_paths_are_users() {
        let locator = TargetLocator::parse("https://savee.it/SomeDesigner/saves").unwrap();
        assert_eq!(locator.category, SourceCategory::User);
        assert_eq!(locator.username.as_deref(), Some("somedesigner"));
    }

    #[test]
    fn test_whitespace_is_trimmed() {
        let locator = TargetLocator::parse("  https://savee.it/pop  ").unwrap();
        assert_eq!(locator.url, "https://savee.it/pop");
    }

    #[test]
    fn test_rejects_empty() {
        let err = TargetLocator::parse("   ").unwrap_err();
        assert!(matches!(err, RunschedError::InvalidInput(_)));
    }

    #[test]
    fn test_rejects_non_http_scheme() {
        assert!(TargetLocator::parse("ftp://savee.it/pop").is_err());
        assert!(TargetLocator::parse("savee.it/pop").is_err());
    }
}
