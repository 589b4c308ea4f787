//! Build discovery from published listing pages.
//!
//! Both feeds are plain HTML pages; build archives are recognised by the URL shape
//! alone, either an embedded build number or an embedded `major.minor.patch` version.

use crate::core::config::BUILD_GROUP;
use crate::core::download::Transport;
use crate::error::{Result, UpdateError};
use regex::{Regex, RegexBuilder};
use reqwest::Url;
use semver::Version;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, info_span, Span};

/// Optional group narrowing a build pattern match down to the URL itself.
pub const URL_GROUP: &str = "url";

/// A published build and where to fetch it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildCandidate<I> {
    pub id: I,
    pub url: String,
}

/// Source of published build numbers for the target application.
pub trait BuildDiscovery: Send + Sync {
    /// Every build id currently published. An empty list means nothing is available.
    fn build_ids(&self) -> Result<Vec<u64>>;

    /// Download URL of `build`.
    fn build_url(&self, build: u64) -> Result<String>;
}

/// Extracts numbered build archives from `page` using `pattern`.
///
/// `pattern` must have a named group `build`. The URL is the `url` group when the pattern
/// has one, the whole match otherwise, and is resolved against `base` when relative.
/// Entries whose id does not parse are logged and skipped.
pub fn parse_build_candidates(
    page: &str,
    pattern: &Regex,
    base: Option<&Url>,
) -> Vec<BuildCandidate<u64>> {
    let mut candidates: Vec<BuildCandidate<u64>> = Vec::new();

    for captures in pattern.captures_iter(page) {
        let (Some(link), Some(build)) = (
            captures.name(URL_GROUP).or_else(|| captures.get(0)),
            captures.name(BUILD_GROUP),
        ) else {
            continue;
        };

        let id = match build.as_str().parse::<u64>() {
            Ok(id) => id,
            Err(e) => {
                error!("Unable to parse build number '{}'. {}", build.as_str(), e);
                continue;
            }
        };

        let url = match resolve_url(link.as_str(), base) {
            Ok(url) => url,
            Err(e) => {
                error!("Unable to resolve build URL '{}'. {}", link.as_str(), e);
                continue;
            }
        };

        if !candidates.iter().any(|c| c.id == id) {
            candidates.push(BuildCandidate { id, url });
        }
    }

    candidates
}

fn resolve_url(raw: &str, base: Option<&Url>) -> Result<String> {
    let resolved = match base {
        Some(base) => base.join(raw),
        None => Url::parse(raw),
    };
    resolved
        .map(|url| url.to_string())
        .map_err(|e| UpdateError::parse(e.to_string()))
}

/// [`BuildDiscovery`] over a listing page fetched through a [`Transport`].
pub struct FeedDiscovery {
    transport: Arc<dyn Transport>,
    feed_url: String,
    pattern: Regex,
    last_seen: Mutex<Vec<BuildCandidate<u64>>>,
    span: Span,
}

impl FeedDiscovery {
    pub fn new(transport: Arc<dyn Transport>, feed_url: &str, pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)?;
        if !pattern.capture_names().flatten().any(|n| n == BUILD_GROUP) {
            return Err(UpdateError::config(format!(
                "build pattern must capture a named group '{BUILD_GROUP}'"
            )));
        }

        Ok(Self {
            transport,
            feed_url: feed_url.to_string(),
            pattern,
            last_seen: Mutex::new(Vec::new()),
            span: info_span!("discovery"),
        })
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    fn fetch_candidates(&self) -> Result<Vec<BuildCandidate<u64>>> {
        let page = self.transport.fetch_text(&self.feed_url)?;
        let base = Url::parse(&self.feed_url).ok();
        let candidates = parse_build_candidates(&page, &self.pattern, base.as_ref());
        debug!("Found {} builds on {}", candidates.len(), self.feed_url);

        *self
            .last_seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = candidates.clone();
        Ok(candidates)
    }
}

impl BuildDiscovery for FeedDiscovery {
    fn build_ids(&self) -> Result<Vec<u64>> {
        let _guard = self.span.enter();
        Ok(self.fetch_candidates()?.into_iter().map(|c| c.id).collect())
    }

    fn build_url(&self, build: u64) -> Result<String> {
        let _guard = self.span.enter();

        let cached = self
            .last_seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .find(|c| c.id == build)
            .map(|c| c.url.clone());

        let url = match cached {
            Some(url) => Some(url),
            None => self
                .fetch_candidates()?
                .into_iter()
                .find(|c| c.id == build)
                .map(|c| c.url),
        };

        url.ok_or_else(|| UpdateError::parse(format!("build {build} is not listed on the feed")))
    }
}

/// Finds the newest `<name>_<major>.<minor>.<patch>.zip` archive linked from `page`.
///
/// Versions compare numerically component by component. A URL whose version does not
/// parse is logged and skipped.
pub fn latest_self_update(page: &str, name: &str) -> Result<Option<BuildCandidate<Version>>> {
    let pattern = RegexBuilder::new(&format!(
        r#"https?://[^\s"'<>]*?{}_(\d+\.\d+\.\d+)\.zip"#,
        regex::escape(name)
    ))
    .case_insensitive(true)
    .build()?;

    info!("Trying to parse out the builds list from the update page");

    let mut latest: Option<BuildCandidate<Version>> = None;
    for captures in pattern.captures_iter(page) {
        let (Some(whole), Some(raw_version)) = (captures.get(0), captures.get(1)) else {
            continue;
        };

        let version = match Version::parse(raw_version.as_str()) {
            Ok(version) => version,
            Err(e) => {
                error!(
                    "An error has occurred while parsing version '{}'. {}",
                    raw_version.as_str(),
                    e
                );
                continue;
            }
        };

        if latest.as_ref().map_or(true, |current| version > current.id) {
            latest = Some(BuildCandidate {
                id: version,
                url: whole.as_str().to_string(),
            });
        }
    }

    if let Some(latest) = &latest {
        info!("Latest build available from the server: {}", latest.id);
    }
    Ok(latest)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Discovery returning a fixed build list.
    pub struct StaticDiscovery {
        pub builds: Vec<u64>,
        pub base: String,
        pub fail: bool,
    }

    impl StaticDiscovery {
        pub fn new(builds: &[u64]) -> Self {
            Self {
                builds: builds.to_vec(),
                base: "http://mirror/nightly".to_string(),
                fail: false,
            }
        }

        pub fn url_of(&self, build: u64) -> String {
            format!("{}/XBMC-{}.zip", self.base, build)
        }
    }

    impl BuildDiscovery for StaticDiscovery {
        fn build_ids(&self) -> Result<Vec<u64>> {
            if self.fail {
                return Err(UpdateError::network(&self.base, "connection refused"));
            }
            Ok(self.builds.clone())
        }

        fn build_url(&self, build: u64) -> Result<String> {
            Ok(self.url_of(build))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::DEFAULT_BUILD_PATTERN;
    use crate::core::download::testing::FakeTransport;
    use pretty_assertions::assert_eq;

    const FEED: &str = "http://mirror.example.org/nightly/";

    const PAGE: &str = r#"
        <html><body>
        <a href="http://mirror.example.org/nightly/XBMC-98.zip">98</a>
        <a href="http://mirror.example.org/nightly/XBMC-103.zip">103</a>
        <a href="http://mirror.example.org/nightly/XBMC-100.zip">100</a>
        <a href="http://mirror.example.org/nightly/XBMC-100.zip">100 again</a>
        <a href="http://mirror.example.org/nightly/XBMC-99999999999999999999999.zip">bogus</a>
        <a href="http://mirror.example.org/nightly/readme.txt">readme</a>
        </body></html>
    "#;

    #[test]
    fn test_parse_build_candidates() {
        let pattern = Regex::new(DEFAULT_BUILD_PATTERN).unwrap();
        let candidates = parse_build_candidates(PAGE, &pattern, None);

        let ids: Vec<u64> = candidates.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![98, 103, 100]);
        assert_eq!(
            candidates[1].url,
            "http://mirror.example.org/nightly/XBMC-103.zip"
        );
    }

    #[test]
    fn test_relative_links_resolve_against_feed() {
        let pattern = Regex::new(r#"href="(?P<url>[^"]*?r(?P<build>\d+)\.zip)""#).unwrap();
        let base = Url::parse(FEED).unwrap();
        let page = r#"<a href="XBMC-r27001.zip">x</a>"#;

        let candidates = parse_build_candidates(page, &pattern, Some(&base));

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, 27001);
        assert_eq!(
            candidates[0].url,
            "http://mirror.example.org/nightly/XBMC-r27001.zip"
        );
    }

    #[test]
    fn test_feed_discovery() {
        let transport = Arc::new(FakeTransport::new().with_page(FEED, PAGE));
        let discovery = FeedDiscovery::new(transport, FEED, DEFAULT_BUILD_PATTERN).unwrap();

        let mut ids = discovery.build_ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec![98, 100, 103]);
        assert_eq!(
            discovery.build_url(100).unwrap(),
            "http://mirror.example.org/nightly/XBMC-100.zip"
        );
        assert!(matches!(
            discovery.build_url(101),
            Err(UpdateError::Parse { .. })
        ));
    }

    #[test]
    fn test_feed_discovery_empty_page() {
        let transport = Arc::new(FakeTransport::new().with_page(FEED, "<html></html>"));
        let discovery = FeedDiscovery::new(transport, FEED, DEFAULT_BUILD_PATTERN).unwrap();
        assert!(discovery.build_ids().unwrap().is_empty());
    }

    #[test]
    fn test_feed_discovery_unreachable() {
        let discovery =
            FeedDiscovery::new(Arc::new(FakeTransport::new()), FEED, DEFAULT_BUILD_PATTERN)
                .unwrap();
        assert!(matches!(
            discovery.build_ids(),
            Err(UpdateError::Network { .. })
        ));
    }

    #[test]
    fn test_feed_discovery_requires_build_group() {
        let result = FeedDiscovery::new(Arc::new(FakeTransport::new()), FEED, r"\d+\.zip");
        assert!(matches!(result, Err(UpdateError::Config { .. })));
    }

    #[test]
    fn test_latest_self_update_picks_highest_version() {
        let page = r#"
            <a href="http://updates.example.org/stagehand_1.2.3.zip">1.2.3</a>
            <a href="http://updates.example.org/stagehand_1.3.0.zip">1.3.0</a>
            <a href="http://updates.example.org/other_9.9.9.zip">other</a>
        "#;

        let latest = latest_self_update(page, "stagehand").unwrap().unwrap();

        assert_eq!(latest.id, Version::new(1, 3, 0));
        assert_eq!(latest.url, "http://updates.example.org/stagehand_1.3.0.zip");
    }

    #[test]
    fn test_latest_self_update_compares_numerically() {
        let page = "
            http://u/stagehand_1.1.99.zip
            http://u/stagehand_1.2.9.zip
            http://u/stagehand_1.2.10.zip
        ";

        let latest = latest_self_update(page, "stagehand").unwrap().unwrap();
        assert_eq!(latest.id, Version::new(1, 2, 10));
        assert!(Version::new(1, 2, 10) > Version::new(1, 2, 9));
        assert!(Version::new(1, 2, 9) > Version::new(1, 1, 99));
    }

    #[test]
    fn test_latest_self_update_skips_unparseable_candidates() {
        let page = "http://u/Stagehand_01.4.0.zip http://u/stagehand_1.0.1.zip";

        let latest = latest_self_update(page, "stagehand").unwrap().unwrap();
        assert_eq!(latest.id, Version::new(1, 0, 1));
    }

    #[test]
    fn test_latest_self_update_with_no_candidates() {
        assert_eq!(latest_self_update("nothing here", "stagehand").unwrap(), None);
    }
}
