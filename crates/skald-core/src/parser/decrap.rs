//! Filename decrapifier.
//!
//! When a file carries no embedded title, its name is the next best source:
//! punctuation is blanked, blacklisted release keywords are removed, and
//! `NUM` / `SE` / `EP` pattern keywords strip numbered fragments while
//! extracting season and episode numbers.

use std::path::Path;

use regex::Regex;
use tracing::warn;

/// A blacklist entry: a plain keyword, or a compiled pattern with optional
/// season / episode capture positions.
#[derive(Clone)]
enum Entry {
    Plain(Regex),
    Pattern {
        regex: Regex,
        season_group: Option<usize>,
        episode_group: Option<usize>,
    },
}

/// Result of one cleaning pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cleaned {
    pub title: String,
    pub season: Option<u32>,
    pub episode: Option<u32>,
}

#[derive(Clone, Default)]
pub struct Decrapifier {
    blacklist: Vec<Entry>,
}

impl Decrapifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one keyword. `NUM` matches an unsigned integer whose value is
    /// discarded; `SE` and `EP` match unsigned integers kept as the season
    /// and episode numbers.
    pub fn add_keyword(&mut self, keyword: &str) {
        if keyword.is_empty() {
            return;
        }

        if !keyword.contains("NUM") && !keyword.contains("SE") && !keyword.contains("EP") {
            match Regex::new(&format!(r"(?i)\b{}\b", regex::escape(keyword))) {
                Ok(regex) => self.blacklist.push(Entry::Plain(regex)),
                Err(e) => warn!(keyword, "invalid blacklist keyword: {e}"),
            }
            return;
        }

        let mut pattern = String::from(r"(?i)\b");
        let mut season_group = None;
        let mut episode_group = None;
        let mut groups = 0;
        let mut rest = keyword;
        while !rest.is_empty() {
            if let Some(tail) = rest.strip_prefix("NUM") {
                pattern.push_str(r"\d+");
                rest = tail;
            } else if let Some(tail) = rest.strip_prefix("SE") {
                pattern.push_str(r"(\d+)");
                groups += 1;
                season_group = Some(groups);
                rest = tail;
            } else if let Some(tail) = rest.strip_prefix("EP") {
                pattern.push_str(r"(\d+)");
                groups += 1;
                episode_group = Some(groups);
                rest = tail;
            } else {
                let ch = rest.chars().next().unwrap_or_default();
                pattern.push_str(&regex::escape(&ch.to_string()));
                rest = &rest[ch.len_utf8()..];
            }
        }
        pattern.push_str(r"\b");

        match Regex::new(&pattern) {
            Ok(regex) => self.blacklist.push(Entry::Pattern {
                regex,
                season_group,
                episode_group,
            }),
            Err(e) => warn!(keyword, "invalid blacklist pattern: {e}"),
        }
    }

    pub fn has_keywords(&self) -> bool {
        !self.blacklist.is_empty()
    }

    /// Clean the filename of `path` (directory and extension stripped).
    pub fn clean_path(&self, path: &Path) -> Cleaned {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        self.clean(stem)
    }

    /// Clean one bare name.
    pub fn clean(&self, name: &str) -> Cleaned {
        // Blank every ASCII byte that is neither alphanumeric nor a space;
        // bytes beyond ASCII are left alone.
        let mut bytes = name.as_bytes().to_vec();
        for b in bytes.iter_mut() {
            if b.is_ascii() && !b.is_ascii_alphanumeric() && !b.is_ascii_whitespace() {
                *b = b' ';
            }
        }
        let mut text = String::from_utf8(bytes).unwrap_or_else(|_| name.to_string());

        let mut season = None;
        let mut episode = None;

        for entry in &self.blacklist {
            match entry {
                Entry::Plain(regex) => {
                    while let Some(m) = regex.find(&text) {
                        let (start, end) = (m.start(), m.end());
                        blank(&mut text, start, end);
                    }
                }
                Entry::Pattern {
                    regex,
                    season_group,
                    episode_group,
                } => {
                    // Passes until the pattern stops matching.
                    while let Some(caps) = regex.captures(&text) {
                        if let Some(idx) = season_group {
                            if season.is_none() {
                                season = caps.get(*idx).and_then(|m| m.as_str().parse().ok());
                            }
                        }
                        if let Some(idx) = episode_group {
                            if episode.is_none() {
                                episode = caps.get(*idx).and_then(|m| m.as_str().parse().ok());
                            }
                        }
                        let Some(m) = caps.get(0) else { break };
                        let (start, end) = (m.start(), m.end());
                        blank(&mut text, start, end);
                    }
                }
            }
        }

        let title = text.split_whitespace().collect::<Vec<_>>().join(" ");
        Cleaned {
            title,
            season,
            episode,
        }
    }
}

/// Overwrite `[start, end)` with spaces, keeping indices stable.
fn blank(text: &mut String, start: usize, end: usize) {
    // The range always covers ASCII matches, so byte-wise blanking cannot
    // split a multi-byte character.
    let mut bytes = std::mem::take(text).into_bytes();
    for b in &mut bytes[start..end] {
        if b.is_ascii() {
            *b = b' ';
        }
    }
    *text = String::from_utf8(bytes).unwrap_or_default();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decrap() -> Decrapifier {
        let mut d = Decrapifier::new();
        for kw in ["xvid", "foobar", "fileNUM", "sSEeEP"] {
            d.add_keyword(kw);
        }
        d
    }

    #[test]
    fn test_release_name_cleanup() {
        let d = decrap();
        let cleaned = d.clean_path(Path::new("/v/{XvID-Foobar}.file01.My_Movie.s02e10.avi"));
        assert_eq!(cleaned.title, "My Movie");
        assert_eq!(cleaned.season, Some(2));
        assert_eq!(cleaned.episode, Some(10));
    }

    #[test]
    fn test_idempotent_on_own_output() {
        let d = decrap();
        let first = d.clean_path(Path::new("/v/{XvID-Foobar}.file01.My_Movie.s02e10.avi"));
        let second = d.clean(&first.title);
        assert_eq!(second.title, first.title);
        assert_eq!(second.season, None);
    }

    #[test]
    fn test_plain_keywords_are_whole_word() {
        let mut d = Decrapifier::new();
        d.add_keyword("xvid");
        assert_eq!(d.clean("xvidly Movie xvid").title, "xvidly Movie");
        assert_eq!(d.clean("XVID Movie").title, "Movie");
    }

    #[test]
    fn test_num_pattern_discards_value() {
        let mut d = Decrapifier::new();
        d.add_keyword("cdNUM");
        let cleaned = d.clean("Some Film cd2");
        assert_eq!(cleaned.title, "Some Film");
        assert_eq!(cleaned.season, None);
        assert_eq!(cleaned.episode, None);
    }

    #[test]
    fn test_pattern_applies_repeatedly() {
        let mut d = Decrapifier::new();
        d.add_keyword("cdNUM");
        assert_eq!(d.clean("Film cd1 cd2 cd3").title, "Film");
    }

    #[test]
    fn test_no_blacklist_still_cleans_punctuation() {
        let d = Decrapifier::new();
        assert_eq!(d.clean("My_Movie__(2009)").title, "My Movie 2009");
    }

    #[test]
    fn test_non_ascii_is_preserved()  {
        let d = Decrapifier::new();
        assert_eq!(d.clean("Amélie_Poulain").title, "Amélie Poulain");
    }
}
