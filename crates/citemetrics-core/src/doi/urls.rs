//! Loose equality for publisher URLs.
//!
//! Publishers serve the same article under several paths (`/abs/`,
//! `/article/`, `/doi/full/...`), so exact string comparison is useless.
//! [`compare_urls`] grades how close two URLs are and [`urls_equal`]
//! collapses that into a yes/no.
//!
//! The relation is reflexive and symmetric but not transitive.

const PATH_ALIASES: &[(&str, &str)] = &[
    ("/abs/", "/"),
    ("/article/", "/"),
    ("/articles/", "/"),
    ("http://", "https://"),
    ("//www.", "//"),
];

const PREFIX_ALIASES: &[(&str, &str)] = &[
    ("article-abstract", "article"),
    ("article-lookup", "article"),
];

/// How two URLs relate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlMatch {
    /// Identical after normalisation.
    Exact,
    /// Same host and the same last two path segments.
    LastSegments,
    /// Same host and the same first two path segments after alias
    /// substitution. Weak evidence.
    PossiblePrefix,
    Different,
}

impl UrlMatch {
    pub fn is_equal(self) -> bool {
        !matches!(self, UrlMatch::Different)
    }
}

/// Drop query and fragment, lowercase, strip the trailing slash and
/// collapse known path aliases.
pub fn normalise_url(url: &str) -> String {
    let url = url.trim();
    let end = url.find(['?', '#']).unwrap_or(url.len());
    let mut normalised = url[..end].to_lowercase().trim_end_matches('/').to_string();
    for (from, to) in PATH_ALIASES {
        normalised = normalised.replace(from, to);
    }
    normalised
}

fn path_segments(url: &str) -> Vec<String> {
    reqwest::Url::parse(url.trim())
        .map(|u| {
            u.path()
                .trim_matches('/')
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_lowercase)
                .collect()
        })
        .unwrap_or_default()
}

/// The last non-empty path segment of `url` (query and fragment ignored).
pub fn last_path_segment(url: &str) -> String {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    url[..end]
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Grade how closely two URLs point at the same resource.
pub fn compare_urls(a: &str, b: &str) -> UrlMatch {
    if normalise_url(a) == normalise_url(b) {
        return UrlMatch::Exact;
    }

    let (Some(host_a), Some(host_b)) = (crate::http::host_of(a), crate::http::host_of(b)) else {
        return UrlMatch::Different;
    };
    if host_a != host_b {
        return UrlMatch::Different;
    }

    let segs_a = path_segments(a);
    let segs_b = path_segments(b);
    if segs_a.is_empty() || segs_b.is_empty() {
        return UrlMatch::Different;
    }

    let tail = |segs: &[String]| segs[segs.len().saturating_sub(2)..].join("/");
    if tail(&segs_a) == tail(&segs_b) {
        return UrlMatch::LastSegments;
    }

    let head = |segs: &[String]| {
        segs.iter()
            .take(2)
            .map(|seg| {
                PREFIX_ALIASES
                    .iter()
                    .find(|(from, _)| seg == from)
                    .map_or(seg.as_str(), |(_, to)| to)
                    .to_string()
            })
            .collect::<Vec<_>>()
    };
    if segs_a.len() >= 2 && segs_b.len() >= 2 && head(&segs_a) == head(&segs_b) {
        tracing::warn!(url_a = %a, url_b = %b, "possible URL match");
        return UrlMatch::PossiblePrefix;
    }

    UrlMatch::Different
}

/// Whether two URLs should be treated as the same article.
pub fn urls_equal(a: &str, b: &str) -> bool {
    compare_urls(a, b).is_equal()
}
