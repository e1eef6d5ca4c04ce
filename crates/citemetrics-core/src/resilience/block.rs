//! Heuristic detection of CAPTCHA walls and block pages.
//!
//! A 200 OK can still be a block page, so classification looks at the body
//! and, for search-engine pages, at the host of the final URL.

/// Markers of embedded CAPTCHA widgets.
pub const CAPTCHA_WIDGET_MARKERS: &[&str] = &[
    "gs_captcha_ccl",
    "recaptcha",
    "captcha-form",
    "rc-doscaptcha-body",
];

/// Phrases search engines show when they suspect automation.
pub const AUTOMATION_PHRASES: &[&str] = &[
    "captcha",
    "unusual traffic",
    "automated queries",
    "our systems have detected",
    "sorry, we have detected",
];

/// Interstitial challenge markers (Cloudflare and friends).
pub const CHALLENGE_MARKERS: &[&str] = &[
    "cf-challenge",
    "challenge-platform",
    "cf-browser-verification",
    "just a moment...",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockVerdict {
    Clear,
    /// Body contained this marker.
    Signal(String),
    /// The final URL left the expected host.
    UnexpectedHost(String),
}

impl BlockVerdict {
    pub fn is_blocked(&self) -> bool {
        !matches!(self, Self::Clear)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BlockDetector {
    signals: Vec<String>,
    expected_host: Option<String>,
}

impl BlockDetector {
    pub fn new<S: AsRef<str>>(signals: &[S]) -> Self {
        Self {
            signals: signals
                .iter()
                .map(|s| s.as_ref().to_ascii_lowercase())
                .collect(),
            expected_host: None,
        }
    }

    /// Never classifies anything as blocked.
    pub fn none() -> Self {
        Self::default()
    }

    /// Only CAPTCHA widget markers. Used on DOI redirect landing pages,
    /// where "captcha" may appear legitimately in publisher boilerplate.
    pub fn captcha_widgets() -> Self {
        Self::new(CAPTCHA_WIDGET_MARKERS)
    }

    /// A search-engine results page: widgets, automation phrases, and the
    /// final URL must stay on `host`.
    pub fn search_engine(host: &str) -> Self {
        let mut detector = Self::new(CAPTCHA_WIDGET_MARKERS);
        detector.extend(AUTOMATION_PHRASES);
        detector.expected_host = Some(host.to_ascii_lowercase());
        detector
    }

    /// Everything except the host check. Used for metrics pages and APIs.
    pub fn challenge_pages() -> Self {
        let mut detector = Self::new(CAPTCHA_WIDGET_MARKERS);
        detector.extend(AUTOMATION_PHRASES);
        detector.extend(CHALLENGE_MARKERS);
        detector
    }

    fn extend(&mut self, signals: &[&str]) {
        for signal in signals {
            let signal = signal.to_ascii_lowercase();
            if !self.signals.contains(&signal) {
                self.signals.push(signal);
            }
        }
    }

    pub fn classify(&self, final_url: &str, body: &str) -> BlockVerdict {
        if let Some(expected) = &self.expected_host {
            let host = crate::http::host_of(final_url).unwrap_or_default();
            if !host.contains(expected.as_str()) {
                return BlockVerdict::UnexpectedHost(host);
            }
        }
        if self.signals.is_empty() {
            return BlockVerdict::Clear;
        }
        let lower = body.to_lowercase();
        self.signals
            .iter()
            .find(|signal| lower.contains(signal.as_str()))
            .map(|signal| BlockVerdict::Signal(signal.clone()))
            .unwrap_or(BlockVerdict::Clear)
    }

    pub fn is_blocked(&self, final_url: &str, body: &str) -> bool {
        self.classify(final_url, body).is_blocked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_page_is_clear() {
        let detector = BlockDetector::challenge_pages();
        assert_eq!(
            detector.classify("https://www.altmetric.com/details/1", "<h1>Paper</h1>"),
            BlockVerdict::Clear
        );
    }

    #[test]
    fn ok_page_with_captcha_widget_is_blocked() {
        let detector = BlockDetector::captcha_widgets();
        let body = r#"<div id="gs_captcha_ccl">Please show you're not a robot</div>"#;
        assert_eq!(
            detector.classify("https://doi.org/10.1/x", body),
            BlockVerdict::Signal("gs_captcha_ccl".into())
        );
    }

    #[test]
    fn matching_is_case_insensitive() {
        let detector = BlockDetector::challenge_pages();
        assert!(detector.is_blocked("https://x.org", "Our systems have detected UNUSUAL TRAFFIC"));
    }

    #[test]
    fn widget_detector_ignores_plain_phrases() {
        let detector = BlockDetector::captcha_widgets();
        assert!(!detector.is_blocked("https://x.org", "unusual traffic"));
    }

    #[test]
    fn search_engine_redirect_off_host_is_blocked() {
        let detector = BlockDetector::search_engine("scholar.google.com");
        assert_eq!(
            detector.classify("https://www.google.com/sorry/index?continue=x", "<html></html>"),
            BlockVerdict::UnexpectedHost("www.google.com".into())
        );
        assert!(!detector.is_blocked(
            "https://scholar.google.com/scholar?q=x",
            "<a>Cited by 4</a>"
        ));
    }

    #[test]
    fn challenge_markers() {
        let detector = BlockDetector::challenge_pages();
        assert!(detector.is_blocked("https://x.org", "<div class=\"cf-challenge\"></div>"));
        assert!(!BlockDetector::none().is_blocked("https://x.org", "cf-challenge"));
    }
}
