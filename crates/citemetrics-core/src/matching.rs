use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9]").unwrap());

/// Normalize title for comparison: strips to lowercase alphanumeric only.
///
/// Steps (order matters):
/// 1. Unescape common HTML entities
/// 2. Transliterate the Greek letters common in biology titles
/// 3. Unicode NFKD normalization (decomposes accents)
/// 4. Strip to ASCII
/// 5. Keep only `[a-zA-Z0-9]`, lowercased
pub fn normalize_title(title: &str) -> String {
    let title = title
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'");

    let title = title
        .replace(['α', 'Α'], "alpha")
        .replace(['β', 'Β'], "beta")
        .replace(['γ', 'Γ'], "gamma")
        .replace(['δ', 'Δ'], "delta")
        .replace(['κ', 'Κ'], "kappa")
        .replace(['μ', 'Μ'], "mu")
        .replace(['ω', 'Ω'], "omega");

    let normalized: String = title.nfkd().filter(|c| c.is_ascii()).collect();
    NON_ALNUM.replace_all(&normalized, "").to_lowercase()
}

/// Similarity of two titles after normalization, in `0.0..=1.0`.
pub fn title_similarity(title_a: &str, title_b: &str) -> f64 {
    let norm_a = normalize_title(title_a);
    let norm_b = normalize_title(title_b);
    if norm_a.is_empty() || norm_b.is_empty() {
        return 0.0;
    }
    rapidfuzz::fuzz::ratio(norm_a.chars(), norm_b.chars())
}

/// Check if two titles match using fuzzy comparison (95% threshold).
pub fn titles_match(title_a: &str, title_b: &str) -> bool {
    title_similarity(title_a, title_b) >= 0.95
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_punctuation_and_case() {
        assert_eq!(
            normalize_title("Ocean Acidification: A Review!"),
            "oceanacidificationareview"
        );
    }

    #[test]
    fn normalize_unescapes_entities_and_accents() {
        assert_eq!(normalize_title("Fish &amp; Chips"), normalize_title("Fish & Chips"));
        assert_eq!(normalize_title("Résumé"), "resume");
    }

    #[test]
    fn normalize_greek() {
        assert_eq!(normalize_title("β-adrenergic"), "betaadrenergic");
    }

    #[test]
    fn titles_match_minor_differences() {
        assert!(titles_match(
            "Physiological tipping points in the face of climate change",
            "Physiological tipping points in the face of climate change."
        ));
        assert!(!titles_match(
            "Physiological tipping points",
            "Coral reef fish behaviour"
        ));
    }

    #[test]
    fn empty_titles_never_match() {
        assert!(!titles_match("", ""));
        assert_eq!(title_similarity("!!!", "abc"), 0.0);
    }
}
