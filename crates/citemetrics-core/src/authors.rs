//! Author-name helpers: surname extraction and the `Surname, I. J.`
//! standardised author string.

use once_cell::sync::Lazy;
use std::collections::HashSet;

/// Common surname prefixes (case-insensitive).
static SURNAME_PREFIXES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "van", "von", "de", "del", "della", "di", "da", "al", "el", "la", "le", "ben", "ibn",
        "mac", "mc", "o",
    ]
    .into_iter()
    .collect()
});

/// Name suffixes to strip.
static NAME_SUFFIXES: Lazy<HashSet<&'static str>> =
    Lazy::new(|| ["jr", "sr", "ii", "iii", "iv", "v"].into_iter().collect());

fn is_prefix(word: &str) -> bool {
    SURNAME_PREFIXES.contains(word.to_lowercase().trim_end_matches('.'))
}

fn is_suffix(word: &str) -> bool {
    NAME_SUFFIXES.contains(word.to_lowercase().trim_end_matches(['.', ',']))
}

/// Split a name into (given parts, surname). Handles `Surname, Given`,
/// multi-word surnames like `van Bavel`, and trailing `Jr.`.
fn split_name(name: &str) -> (Vec<String>, String) {
    let name = name.trim();
    if let Some((surname, given)) = name.split_once(',') {
        let given = given.split_whitespace().map(str::to_string).collect();
        return (given, surname.trim().to_string());
    }

    let mut parts: Vec<&str> = name.split_whitespace().collect();
    while parts.len() >= 2 && parts.last().is_some_and(|p| is_suffix(p)) {
        parts.pop();
    }
    let Some(last) = parts.pop() else {
        return (Vec::new(), String::new());
    };

    let mut surname = vec![last];
    while parts.len() >= 2 && parts.last().is_some_and(|p| is_prefix(p)) {
        if let Some(prefix) = parts.pop() {
            surname.insert(0, prefix);
        }
    }
    (
        parts.into_iter().map(str::to_string).collect(),
        surname.join(" "),
    )
}

/// Surname of an author name, as written.
pub fn surname(name: &str) -> String {
    split_name(name).1
}

fn title_case_word(word: &str) -> String {
    word.split_inclusive(['-', '\''])
        .map(|piece| {
            let mut chars = piece.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect()
}

/// Title-case a surname unless it already carries internal capitals (`McDonald`).
fn title_case_surname(surname: &str) -> String {
    let has_mixed_case = surname.chars().any(char::is_uppercase) && surname.chars().any(char::is_lowercase);
    if has_mixed_case {
        return surname.to_string();
    }
    surname
        .split_whitespace()
        .map(title_case_word)
        .collect::<Vec<_>>()
        .join(" ")
}

/// `"Jodie L. Rummer"` → `"Rummer, J. L."`
pub fn initialize(name: &str) -> String {
    let (given, surname) = split_name(name);
    if surname.is_empty() {
        return String::new();
    }
    let initials: Vec<String> = given
        .iter()
        .flat_map(|part| part.split('-'))
        .filter_map(|part| part.chars().find(|c| c.is_alphabetic()))
        .map(|c| format!("{}.", c.to_uppercase()))
        .collect();
    let surname = title_case_surname(&surname);
    if initials.is_empty() {
        surname
    } else {
        format!("{}, {}", surname, initials.join(" "))
    }
}

/// Split a raw `"A and B and C"` author string into names.
pub fn split_authors(raw: &str) -> Vec<String> {
    raw.split(" and ")
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

/// `"Jodie L. Rummer and Philip L. Munday"` → `"Rummer, J. L., Munday, P. L."`
pub fn standardise_authors(raw: &str) -> String {
    split_authors(raw)
        .iter()
        .map(|name| initialize(name))
        .filter(|name| !name.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Case-insensitive check that `surname` is one of the words of `name`'s
/// surname, or the surname as a whole.
pub fn surname_matches(name: &str, surname: &str) -> bool {
    let wanted = surname.trim().to_lowercase();
    if wanted.is_empty() {
        return false;
    }
    let actual = self::surname(name).to_lowercase();
    actual == wanted
        || actual
            .split(|c: char| c.is_whitespace() || c == '-')
            .any(|word| word == wanted)
}
