//! DOI discovery and verification.
//!
//! Candidates come from the source URL, page metadata or a full-text scan
//! ([`extract`]). They are checked against the handle registry and the
//! `doi.org` redirect ([`verify`]) before the [`resolver`] accepts one.

pub mod extract;
pub mod registry;
pub mod resolver;
pub mod urls;
pub mod verify;

pub use registry::DoiRegistry;
pub use resolver::{DoiOutcome, DoiResolver, Provenance, VerifiedDoi};
pub use urls::{UrlMatch, compare_urls, urls_equal};

use once_cell::sync::Lazy;
use regex::Regex;

/// Resolver base for `doi_link` values.
pub const DOI_RESOLVER: &str = "https://doi.org/";

static VALID_DOI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^10\.\d{4,9}(\.\d+)*/\S+$").unwrap());

static RESOLVER_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:doi:\s*|https?://(?:dx\.)?doi\.org/|https?://doi\.[a-z]+\.org/)").unwrap()
});

/// File extensions publishers tack onto a DOI-shaped path.
const FILE_EXTENSIONS: &[&str] = &[".pdf", ".html", ".htm", ".xml", ".epub"];

/// Whether `doi` has DOI syntax: `10.NNNN(.NNNN)*/suffix`.
pub fn is_valid_doi(doi: &str) -> bool {
    VALID_DOI.is_match(doi)
}

/// Canonical form of a DOI-ish string.
///
/// Percent-decodes until stable, strips `doi:` and resolver prefixes, and
/// trims trailing punctuation. Case is preserved; compare with
/// [`same_doi`].
pub fn normalize_doi(raw: &str) -> String {
    let mut doi = raw.trim().to_string();
    loop {
        let decoded = match urlencoding::decode(&doi) {
            Ok(d) => d.into_owned(),
            Err(_) => break,
        };
        if decoded == doi {
            break;
        }
        doi = decoded;
    }
    let doi = RESOLVER_PREFIX.replace(doi.trim(), "");
    clean_doi(&doi)
}

/// Case-insensitive DOI equality.
pub fn same_doi(a: &str, b: &str) -> bool {
    normalize_doi(a).eq_ignore_ascii_case(&normalize_doi(b))
}

/// Drop trailing punctuation and unbalanced closing brackets.
fn clean_doi(doi: &str) -> String {
    let mut doi = doi.trim_end_matches(['.', ',', ';', ':']);
    loop {
        let unbalanced = [('(', ')'), ('[', ']'), ('{', '}')]
            .into_iter()
            .any(|(open, close)| doi.ends_with(close) && doi.matches(close).count() > doi.matches(open).count());
        if !unbalanced {
            break;
        }
        doi = &doi[..doi.len() - 1];
        doi = doi.trim_end_matches(['.', ',', ';', ':']);
    }
    doi.to_string()
}

/// Strip a trailing file extension or `/full` from a candidate scraped
/// out of a URL or page text.
pub fn strip_artifacts(doi: &str) -> String {
    let mut doi = doi.trim_end_matches('/');
    loop {
        let lower = doi.to_ascii_lowercase();
        if let Some(ext) = FILE_EXTENSIONS.iter().find(|ext| lower.ends_with(*ext)) {
            doi = &doi[..doi.len() - ext.len()];
        } else if lower.ends_with("/full") {
            doi = &doi[..doi.len() - "/full".len()];
        } else {
            break;
        }
    }
    clean_doi(doi)
}

/// `https://doi.org/<doi>`
pub fn doi_link(doi: &str) -> String {
    format!("{DOI_RESOLVER}{doi}")
}

/// The part of a DOI after its last `/`.
pub fn doi_tail(doi: &str) -> &str {
    doi.rsplit('/').next().unwrap_or(doi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_syntax() {
        assert!(is_valid_doi("10.1038/nclimate2195"));
        assert!(is_valid_doi("10.1016/0021-9681(87)90171-8"));
        assert!(is_valid_doi("10.1000.10/abc"));
        assert!(!is_valid_doi("10.12/abc"));
        assert!(!is_valid_doi("11.1234/abc"));
        assert!(!is_valid_doi("10.1234/"));
        assert!(!is_valid_doi("10.1234/with space"));
    }

    #[test]
    fn normalize_strips_prefixes_and_punctuation() {
        assert_eq!(normalize_doi(" doi:10.1111/gcb.12455. "), "10.1111/gcb.12455");
        assert_eq!(normalize_doi("https://doi.org/10.1038/nclimate2195"), "10.1038/nclimate2195");
        assert_eq!(normalize_doi("http://dx.doi.org/10.1038/nclimate2195;"), "10.1038/nclimate2195");
        assert_eq!(normalize_doi("10.1016/0021-9681(87)90171-8)"), "10.1016/0021-9681(87)90171-8");
    }

    #[test]
    fn normalize_decodes_repeatedly() {
        assert_eq!(normalize_doi("10.1002%252Fece3.1234"), "10.1002/ece3.1234");
        assert_eq!(normalize_doi("10.1002%2Fece3.1234"), "10.1002/ece3.1234");
    }

    #[test]
    fn dois_compare_case_insensitively() {
        assert!(same_doi("10.1111/GCB.12455", "doi:10.1111/gcb.12455"));
        assert!(!same_doi("10.1111/gcb.12455", "10.1111/gcb.12456"));
    }

    #[test]
    fn strips_extensions_and_full() {
        assert_eq!(strip_artifacts("10.1093/conphys/cox003.pdf"), "10.1093/conphys/cox003");
        assert_eq!(strip_artifacts("10.3389/fmars.2021.724913/full"), "10.3389/fmars.2021.724913");
        assert_eq!(strip_artifacts("10.1242/jeb.243973"), "10.1242/jeb.243973");
    }

    #[test]
    fn links_and_tails() {
        assert_eq!(doi_link("10.1/x"), "https://doi.org/10.1/x");
        assert_eq!(doi_tail("10.1242/jeb.243973"), "jeb.243973");
        assert_eq!(doi_tail("10.1093/conphys/cox003"), "cox003");
    }
}
