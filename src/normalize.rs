//! Address normalization: the only form ever used as a lookup key.
//!
//! `normalize` repairs the character-set damage we know how to undo, folds
//! the text to NFC, tidies separators and whitespace and finally refuses
//! anything that still looks double-decoded. It is idempotent.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::errors::EncodingError;

/// Characters that only show up in addresses when bytes were decoded with
/// the wrong code page.
pub const BAD_MARKERS: &[char] = &[
    '\u{FFFD}', 'Ã', 'Â', '┬', '├', '┤', '┴', '┼', '┐', '└', '┘', '┌', '─', '│', '▒', '▓', '¶',
];

const SAFE_FIXES: &[(&str, &str)] = &[
    ("Ã¤", "ä"),
    ("Ã¶", "ö"),
    ("Ã¼", "ü"),
    ("ÃŸ", "ß"),
    ("Ã„", "Ä"),
    ("Ã–", "Ö"),
    ("Ãœ", "Ü"),
];

// Longest patterns first; "??" replaced one umlaut or ß in these words.
const QUESTION_MARK_FIXES: &[(&str, &str)] = &[
    ("Berggie??h??bel", "Berggießhübel"),
    ("M??glitztal", "Müglitztal"),
    ("Fr??belstra", "Fröbelstra"),
    ("Cosch??tzer", "Coschützer"),
    ("Basch??tzer", "Baschützer"),
    ("Morgenr??the", "Morgenröthe"),
    ("B??renstein", "Bärenstein"),
    ("Gro??opitz", "Großopitz"),
    ("Glash??tte", "Glashütte"),
    ("Sch??nfeld", "Schönfeld"),
    ("S??gewerk", "Sägewerk"),
    ("L??btau", "Löbtau"),
    ("M??ller", "Müller"),
    ("Stra??e", "Straße"),
    ("stra??e", "straße"),
];

static PIPE_SEP: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*\|\s*").expect("pipe pattern"));
static MULTI_SEP: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*[;,]+\s*").expect("separator pattern"));
static SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace pattern"));
static HALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*[,/]\s*Halle\s+\d+\w*").expect("hall pattern"));
static BRACKETED_OT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\(\s*OT\s+[\w-]+\s*\)|/\s*OT\s+[\w-]+").expect("bracketed OT pattern")
});
static OT_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*(?:[/-]\s*)?\bOT\s+[^,]+").expect("OT suffix pattern"));
static OT_AS_LOCALITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{5})\s+[^,]*?\s*(?:[/-]\s*)?\bOT\s+([^,]+)").expect("OT locality pattern")
});
static ABBREVIATIONS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"str\.", "straße"),
        (r"strasse\b", "straße"),
        (r"pl\.", "platz"),
    ]
    .into_iter()
    .map(|(pattern, replacement)| (Regex::new(pattern).expect("abbreviation pattern"), replacement))
    .collect()
});

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedAddress(String);

impl NormalizedAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NormalizedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NormalizedAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub fn normalize(raw: &str) -> Result<NormalizedAddress, EncodingError> {
    let repaired = repair_mojibake(raw);
    let mut s: String = repaired.nfc().collect();

    if s.contains('|') {
        s = PIPE_SEP.replace_all(&s, ", ").into_owned();
    }
    s = HALL.replace_all(&s, "").into_owned();
    s = BRACKETED_OT.replace_all(&s, "").into_owned();
    s = SPACES.replace_all(&s, " ").into_owned();

    let parts: Vec<&str> = MULTI_SEP
        .split(&s)
        .map(|part| part.trim_matches(|c: char| c == ',' || c == ';' || c == '/' || c.is_whitespace()))
        .filter(|part| !part.is_empty())
        .collect();
    let joined = parts.join(", ");
    let collapsed = SPACES.replace_all(&joined, " ");
    let trimmed = collapsed
        .trim_start_matches(|c: char| c == ',' || c.is_whitespace())
        .trim_end_matches(|c: char| c == '.' || c == ',' || c.is_whitespace());

    assert_clean(trimmed)?;
    Ok(NormalizedAddress(trimmed.to_string()))
}

/// Undo the encoding damage that has an unambiguous repair; leave the rest
/// for the guard to reject.
pub fn repair_mojibake(text: &str) -> String {
    let mut repaired = text.to_string();
    if repaired.contains('Ã') {
        for (bad, good) in SAFE_FIXES {
            if repaired.contains(bad) {
                repaired = repaired.replace(bad, good);
            }
        }
    }
    if repaired.contains("??") {
        for (bad, good) in QUESTION_MARK_FIXES {
            if repaired.contains(bad) {
                repaired = repaired.replace(bad, good);
            }
        }
    }
    repaired
}

pub fn find_markers(text: &str) -> Vec<char> {
    let mut found: Vec<char> = BAD_MARKERS
        .iter()
        .copied()
        .filter(|marker| text.contains(*marker))
        .collect();
    found.dedup();
    found
}

pub fn assert_clean(text: &str) -> Result<(), EncodingError> {
    let markers = find_markers(text);
    if markers.is_empty() {
        Ok(())
    } else {
        Err(EncodingError {
            text: text.to_string(),
            markers,
        })
    }
}

/// Tolerant comparison key: lower case with street abbreviations expanded.
pub fn canonical_key(addr: &str) -> String {
    let folded: String = addr.nfc().collect::<String>().to_lowercase();
    let mut key = folded;
    for (pattern, replacement) in ABBREVIATIONS.iter() {
        key = pattern.replace_all(&key, *replacement).into_owned();
    }
    SPACES.replace_all(key.trim(), " ").into_owned()
}

/// Primary form followed by deterministic fallbacks. Many addresses only
/// resolve once the sub-locality qualifier is dropped or moved.
pub fn variants(addr: &NormalizedAddress, company_name: Option<&str>) -> Vec<String> {
    let primary = addr.as_str().to_string();
    if primary.is_empty() {
        return Vec::new();
    }

    let mut out = vec![primary.clone()];

    if OT_SUFFIX.is_match(&primary) {
        let without = tidy(&OT_SUFFIX.replace_all(&primary, ""));
        push_unique(&mut out, without);

        if OT_AS_LOCALITY.is_match(&primary) {
            let moved = tidy(&OT_AS_LOCALITY.replace(&primary, "$1 $2"));
            push_unique(&mut out, moved);
        }
    }

    if let Some(company) = company_name.map(str::trim).filter(|name| !name.is_empty()) {
        let company: String = company.nfc().collect();
        if !primary.starts_with(company.as_str()) {
            push_unique(&mut out, format!("{company}, {primary}"));
        }
    }

    out
}

fn tidy(value: &str) -> String {
    SPACES
        .replace_all(value, " ")
        .trim_matches(|c: char| c == ',' || c.is_whitespace())
        .to_string()
}

fn push_unique(out: &mut Vec<String>, candidate: String) {
    if !candidate.is_empty() && !out.contains(&candidate) {
        out.push(candidate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: &[&str] = &[
        "Fröbelstraße 1",
        "  Fröbelstraße   1 ,  01159 Dresden.  ",
        "Naumannstr. 12 / Halle 26F, 01809 Heidenau",
        "Hauptstr. 9a | 01728 Bannewitz/OT Possendorf",
        "Gersdorf 43, 01819 Bahretal OT Gersdorf",
        "An der Triebe 25;; 01468 Moritzburg (OT Boxdorf)",
        "MÃ¼llerstraÃŸe 4, 01067 Dresden",
        "Stra??e des Friedens 37, 01723 Kesselsdorf",
        "Fro\u{0308}belstraße 1",
        "",
        ",,, ;",
    ];

    #[test]
    fn normalization_is_idempotent() {
        for sample in SAMPLES {
            let once = normalize(sample).unwrap();
            let twice = normalize(once.as_str()).unwrap();
            assert_eq!(once, twice, "not idempotent for {sample:?}");
        }
    }

    #[test]
    fn collapses_whitespace_and_separators() {
        let normalized = normalize("  Fröbelstraße   1 ,  01159 Dresden.  ").unwrap();
        assert_eq!(normalized.as_str(), "Fröbelstraße 1, 01159 Dresden");

        let piped = normalize("Hauptstr. 9a | 01728 Bannewitz").unwrap();
        assert_eq!(piped.as_str(), "Hauptstr. 9a, 01728 Bannewitz");
    }

    #[test]
    fn folds_to_nfc() {
        let decomposed = normalize("Fro\u{0308}belstraße 1").unwrap();
        assert_eq!(decomposed.as_str(), "Fröbelstraße 1");
    }

    #[test]
    fn strips_hall_and_bracketed_qualifiers() {
        let hall = normalize("Naumannstr. 12 / Halle 26F, 01809 Heidenau").unwrap();
        assert_eq!(hall.as_str(), "Naumannstr. 12, 01809 Heidenau");

        let bracketed = normalize("An der Triebe 25, 01468 Moritzburg (OT Boxdorf)").unwrap();
        assert_eq!(bracketed.as_str(), "An der Triebe 25, 01468 Moritzburg");

        let unbracketed = normalize("Gersdorf 43, 01819 Bahretal OT Gersdorf").unwrap();
        assert_eq!(unbracketed.as_str(), "Gersdorf 43, 01819 Bahretal OT Gersdorf");
    }

    #[test]
    fn repairs_known_mojibake() {
        let fixed = normalize("MÃ¼llerstraÃŸe 4, 01067 Dresden").unwrap();
        assert_eq!(fixed.as_str(), "Müllerstraße 4, 01067 Dresden");

        let question_marks = normalize("Fr??belstra??e 1, 01159 Dresden").unwrap();
        assert_eq!(question_marks.as_str(), "Fröbelstraße 1, 01159 Dresden");
    }

    #[test]
    fn rejects_residual_corruption() {
        let err = normalize("Stra\u{FFFD}e 5, 01067 Dresden").unwrap_err();
        assert_eq!(err.markers, vec!['\u{FFFD}']);

        let err = normalize("KÃ¶nig-Ã-Weg 3").unwrap_err();
        assert!(err.markers.contains(&'Ã'));

        let err = normalize("Hauptstra├ƒe 1").unwrap_err();
        assert!(err.markers.contains(&'├'));
    }

    #[test]
    fn empty_input_normalizes_to_empty() {
        assert!(normalize("").unwrap().is_empty());
        assert!(normalize(" ,; ").unwrap().is_empty());
    }

    #[test]
    fn canonical_key_expands_abbreviations() {
        assert_eq!(
            canonical_key("Dresdner Str. 5,  02977 Hoyerswerda"),
            canonical_key("dresdner straße 5, 02977 hoyerswerda")
        );
        assert_eq!(canonical_key("Am Markt Pl. 1"), "am markt platz 1");
        assert_eq!(canonical_key("Stolpener Strasse 2"), "stolpener straße 2");
    }

    #[test]
    fn variants_drop_and_move_sub_locality() {
        let addr = normalize("Hauptstraße 5, 01731 Kreischa OT Wittgensdorf").unwrap();
        let variants = variants(&addr, Some("Autohaus Müller"));
        assert_eq!(
            variants,
            vec![
                "Hauptstraße 5, 01731 Kreischa OT Wittgensdorf".to_string(),
                "Hauptstraße 5, 01731 Kreischa".to_string(),
                "Hauptstraße 5, 01731 Wittgensdorf".to_string(),
                "Autohaus Müller, Hauptstraße 5, 01731 Kreischa OT Wittgensdorf".to_string(),
            ]
        );
    }

    #[test]
    fn variants_without_qualifier_are_primary_only() {
        let addr = normalize("Fröbelstraße 1, 01159 Dresden").unwrap();
        assert_eq!(variants(&addr, None), vec!["Fröbelstraße 1, 01159 Dresden"]);
        assert_eq!(variants(&addr, Some("  ")).len(), 1);
        assert!(variants(&normalize("").unwrap(), Some("Firma")).is_empty());
    }

    #[test]
    fn dash_ot_suffix_is_recognised() {
        let addr = normalize("Am Bahnhof 2, 09465 Sehmatal-OT Sehma").unwrap();
        let variants = variants(&addr, None);
        assert_eq!(variants[1], "Am Bahnhof 2, 09465 Sehmatal");
        assert_eq!(variants[2], "Am Bahnhof 2, 09465 Sehma");
    }
}
