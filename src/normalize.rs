//!
//! src/normalize.rs
//!
//! Title normalization: strips the cosmetic modifiers that re-uploads
//! attach to a track title (slowed, sped up, nightcore, reverb, 8D).
//! Those edits change the audio runtime and the search relevance but
//! never the underlying lyrics, so providers are queried with the
//! cleaned title and duration matching is disabled for modified titles.
//!

use once_cell::sync::Lazy;
use regex::Regex;

/// Modifier cleanup patterns (applied in order until stable).
static MODIFIER_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // Bracketed variants: "(Slowed + Reverb)", "[Nightcore Edit]", "(8D Audio)"
        Regex::new(
            r"(?i)\s*[\(\[][^\)\]]*\b(?:slowed|sped[\s-]*up|speed[\s-]*up|nightcore|reverb|8\s*d(?:\s+audio)?)\b[^\)\]]*[\)\]]"
        ).unwrap(),
        // Dash-suffixed variants: "- Slowed + Reverb", "— Sped Up", "- Nightcore"
        Regex::new(
            r"(?i)\s*[-–—~|/]\s*(?:slowed(?:[\s-]*down)?|sped[\s-]*up|speed[\s-]*up|nightcore|reverb|8\s*d(?:\s+audio)?)(?:\s*[+&x,]\s*(?:slowed(?:[\s-]*down)?|sped[\s-]*up|speed[\s-]*up|nightcore|reverb|8\s*d(?:\s+audio)?))*\s*$"
        ).unwrap(),
        // Bare trailing tokens: "Toxic Slowed", "Song Sped Up", "Track 8D Audio"
        Regex::new(
            r"(?i)\s+(?:slowed(?:[\s-]*down)?(?:\s*\+\s*reverb)?|sped[\s-]*up|speed[\s-]*up|nightcore|8\s*d(?:\s+audio)?)\s*$"
        ).unwrap(),
    ]
});

/// Separators left dangling once a modifier suffix has been removed
static TRAILING_SEPARATOR: Lazy<Regex> = Lazy::new(||
    Regex::new(r"\s*[-–—~|/+&]+\s*$").unwrap()
);

/// Regex to collapse multiple whitespace into single space
static MULTI_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s{2,}").unwrap());

/// Strip cosmetic modifiers from a raw track title.
///
/// Returns the cleaned title and whether anything was stripped. A title
/// consisting of nothing but modifiers is returned unchanged (there is
/// no searchable remainder), flagged unmodified.
pub fn normalize_title(raw: &str) -> (String, bool) {
    let mut result = raw.trim().to_string();
    let mut modified = false;

    loop {
        let mut changed = false;
        for pattern in MODIFIER_PATTERNS.iter() {
            let replaced = pattern.replace_all(&result, "");
            if replaced != result {
                result = replaced.into_owned();
                changed = true;
            }
        }
        if !changed {
            break;
        }
        modified = true;
    }

    if modified {
        result = TRAILING_SEPARATOR.replace(&result, "").to_string();
        result = MULTI_SPACE.replace_all(&result, " ").trim().to_string();
    }

    if result.is_empty() {
        return (raw.trim().to_string(), false);
    }
    (result, modified)
}
