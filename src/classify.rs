//!
//! src/classify.rs
//!
//! Instrumental classification. Two independent gates:
//!
//! - a pre-fetch heuristic over title and artist that short-circuits
//!   tracks unlikely to carry lyrics before any fetch budget is spent
//!   (false positives are an accepted, logged trade-off), and
//! - a post-fetch word-count floor, because provider metadata is
//!   occasionally wrong about a body actually containing lyrics.
//!

/// Fixed marker vocabulary, matched case-insensitively as substrings
/// against both the title and the primary artist name.
pub const INSTRUMENTAL_MARKERS: [&str; 12] = [
    "instrumental",
    "karaoke",
    "piano version",
    "acoustic version",
    "lofi",
    "lo-fi",
    "beats",
    "study music",
    "relaxing music",
    "background music",
    "ambient",
    "soundscape",
];

pub fn is_likely_instrumental(title: &str, artist: &str) -> bool {
    let title = title.to_lowercase();
    let artist = artist.to_lowercase();
    INSTRUMENTAL_MARKERS
        .iter()
        .any(|marker| title.contains(marker) || artist.contains(marker))
}

/// Post-fetch gate: a body under the configured word floor is treated
/// as instrumental no matter what the pre-fetch heuristic said.
pub fn below_word_floor(text: &str, floor: usize) -> bool {
    text.split_whitespace().count() < floor
}
