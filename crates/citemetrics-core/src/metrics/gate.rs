//! Author allowlist gating access to the metrics sources.

use crate::metadata::WorkMetadata;

/// Surnames allowed through when nothing is configured.
pub const DEFAULT_ALLOWED_SURNAMES: &[&str] = &["Rummer", "Bergseth", "Wu"];

/// Passes a work when one of its family names matches an allowlisted
/// surname. Matching is case-insensitive and word-based, so `Wu` admits
/// `Chen-Wu` but not `Wulff`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorGate {
    allowed: Vec<String>,
}

impl Default for AuthorGate {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_SURNAMES)
    }
}

impl AuthorGate {
    pub fn new<S: AsRef<str>>(surnames: &[S]) -> Self {
        Self {
            allowed: surnames
                .iter()
                .map(|s| s.as_ref().trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }

    /// The first allowlisted surname found among the work's authors.
    pub fn admits<'a>(&'a self, work: &WorkMetadata) -> Option<&'a str> {
        self.allowed
            .iter()
            .find(|surname| work.has_family_name(surname))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn work(families: &[&str]) -> WorkMetadata {
        WorkMetadata {
            doi: "10.1111/gcb.12455".into(),
            family_names: families.iter().map(|f| f.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn admits_listed_author() {
        let gate = AuthorGate::default();
        assert_eq!(gate.admits(&work(&["Munday", "Rummer"])), Some("Rummer"));
        assert_eq!(gate.admits(&work(&["rummer"])), Some("Rummer"));
    }

    #[test]
    fn matches_whole_words_only() {
        let gate = AuthorGate::default();
        assert_eq!(gate.admits(&work(&["Chen-Wu"])), Some("Wu"));
        assert_eq!(gate.admits(&work(&["Wulff", "Munday"])), None);
    }

    #[test]
    fn no_authors_is_denied() {
        assert_eq!(AuthorGate::default().admits(&work(&[])), None);
        assert_eq!(AuthorGate::new::<&str>(&[]).admits(&work(&["Rummer"])), None);
    }

    #[test]
    fn custom_allowlist() {
        let gate = AuthorGate::new(&["Munday", " "]);
        assert_eq!(gate.allowed(), ["Munday".to_string()]);
        assert_eq!(gate.admits(&work(&["Munday"])), Some("Munday"));
        assert_eq!(gate.admits(&work(&["Rummer"])), None);
    }
}
