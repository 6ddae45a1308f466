//! Text normalization shared by alias lookup, credit parsing and scoring.
//!
//! Spreadsheet entry, bulk imports and catalog payloads disagree on casing,
//! accents, punctuation and HTML escaping ("Bill D&#39;Elia" vs "Bill D'Elia").
//! Each consumer needs a different strength of normalization, so each gets
//! its own function here.

use unicode_normalization::UnicodeNormalization;

/// Decode HTML entities that leak into imported text.
///
/// Handles both named entities (`&amp;`, `&uuml;`) and numeric references
/// (`&#39;`, `&#x27;`).
pub(crate) fn decode_html_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    htmlize::unescape(s).to_string()
}

/// Collapse runs of whitespace into single spaces and trim.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Key under which an alias is stored and looked up.
///
/// Only case and whitespace are normalized. Punctuation is significant, so
/// "W.B." and "WB" are distinct aliases unless both are registered.
///
/// # Examples
///
/// ```
/// use canonry::data::names::alias_key;
///
/// assert_eq!(alias_key("  Warner  Bros. TV "), "warner bros. tv");
/// assert_eq!(alias_key("WBTV"), alias_key("wbtv"));
/// ```
pub fn alias_key(s: &str) -> String {
    collapse_whitespace(&s.to_lowercase())
}

/// Strip accents: NFD decompose and drop combining marks.
fn fold_accents(s: &str) -> impl Iterator<Item = char> + '_ {
    s.nfd()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
}

/// Normalize a person name for fuzzy comparison.
///
/// Pipeline: lowercase -> NFD decompose -> strip combining marks ->
/// strip ALL punctuation, hyphens, and whitespace.
///
/// # Examples
///
/// ```
/// use canonry::data::names::normalize_for_matching;
///
/// assert_eq!(normalize_for_matching("Bill D'Elia"), "billdelia");
/// assert_eq!(normalize_for_matching("José García"), "josegarcia");
/// ```
pub fn normalize_for_matching(s: &str) -> String {
    fold_accents(&s.to_lowercase())
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Normalize a show title for similarity scoring.
///
/// Lowercases, folds accents, turns punctuation into spaces and collapses
/// whitespace. Word boundaries survive so the similarity ratio still sees
/// them.
///
/// # Examples
///
/// ```
/// use canonry::data::names::normalize_title;
///
/// assert_eq!(normalize_title("Grey's Anatomy"), "grey s anatomy");
/// assert_eq!(normalize_title("  Amélie:  The Series "), "amelie the series");
/// ```
pub fn normalize_title(s: &str) -> String {
    let decoded = decode_html_entities(s);
    let spaced: String = fold_accents(&decoded.to_lowercase())
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    collapse_whitespace(&spaced)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_apostrophe_entity() {
        assert_eq!(decode_html_entities("Bill D&#39;Elia"), "Bill D'Elia");
    }

    #[test]
    fn decode_umlaut_entity() {
        assert_eq!(decode_html_entities("B&uuml;lent"), "Bülent");
    }

    #[test]
    fn decode_no_entities() {
        assert_eq!(decode_html_entities("Jane Doe"), "Jane Doe");
    }

    #[test]
    fn collapse_inner_and_outer_whitespace() {
        assert_eq!(collapse_whitespace("  David   E.  Kelley "), "David E. Kelley");
        assert_eq!(collapse_whitespace("   "), "");
    }

    #[test]
    fn alias_key_ignores_case_and_spacing() {
        assert_eq!(alias_key("Executive  Producer"), "executive producer");
        assert_eq!(alias_key("\tEP\n"), "ep");
    }

    #[test]
    fn alias_key_keeps_punctuation() {
        assert_ne!(alias_key("W.B."), alias_key("WB"));
    }

    #[test]
    fn normalize_strips_accents() {
        assert_eq!(normalize_for_matching("García"), "garcia");
    }

    #[test]
    fn normalize_strips_apostrophe() {
        assert_eq!(normalize_for_matching("O'Brien"), "obrien");
    }

    #[test]
    fn normalize_strips_spaces_and_periods() {
        assert_eq!(normalize_for_matching("David E. Kelley"), "davidekelley");
    }

    #[test]
    fn normalize_tilde_n() {
        assert_eq!(normalize_for_matching("Muñoz"), "munoz");
    }

    #[test]
    fn title_keeps_word_boundaries() {
        assert_eq!(normalize_title("Law & Order: SVU"), "law order svu");
    }

    #[test]
    fn title_decodes_entities() {
        assert_eq!(normalize_title("Grey&#39;s Anatomy"), "grey s anatomy");
    }

    #[test]
    fn title_of_only_punctuation_is_empty() {
        assert_eq!(normalize_title("?!"), "");
    }
}
