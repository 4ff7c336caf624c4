//! In-memory metadata model.
//!
//! A [`MetaEntry`] is one key/value pair together with its semantic group,
//! language and priority; parser and grabbers accumulate entries in a
//! [`MetaList`] which the DB-Manager flushes into the store.

use crate::config::{priority, MetaPriority};

/// Well-known metadata keys.
pub mod keys {
    pub const ALBUM: &str = "album";
    pub const ARTIST: &str = "artist";
    pub const AUTHOR: &str = "author";
    pub const ACTOR: &str = "actor";
    pub const CASTING: &str = "casting";
    pub const CATEGORY: &str = "category";
    pub const COMPOSER: &str = "composer";
    pub const COUNTRY: &str = "country";
    pub const COVER: &str = "cover";
    pub const DATE: &str = "date";
    pub const DIRECTOR: &str = "director";
    pub const DURATION: &str = "duration";
    pub const EPISODE: &str = "episode";
    pub const FAN_ART: &str = "fan_art";
    pub const FILESIZE: &str = "filesize";
    pub const GENRE: &str = "genre";
    pub const LYRICS: &str = "lyrics";
    pub const MPAA: &str = "mpaa";
    pub const PLAY_COUNT: &str = "play_count";
    pub const PRODUCER: &str = "producer";
    pub const RATING: &str = "rating";
    pub const RUNTIME: &str = "runtime";
    pub const SEASON: &str = "season";
    pub const STUDIO: &str = "studio";
    pub const SYNOPSIS: &str = "synopsis";
    pub const THUMBNAIL: &str = "thumbnail";
    pub const TITLE: &str = "title";
    pub const TITLE_ALTERNATIVE: &str = "title_alternative";
    pub const TRACK: &str = "track";
    pub const YEAR: &str = "year";
}

/// Semantic bucket of a metadata pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaGroup {
    Classification,
    Commercial,
    Contact,
    Entities,
    Identifier,
    Legal,
    Miscellaneous,
    Musical,
    Organizational,
    Personal,
    Spacial,
    Technical,
    Temporal,
    Titles,
}

impl MetaGroup {
    pub const ALL: [MetaGroup; 14] = [
        MetaGroup::Classification,
        MetaGroup::Commercial,
        MetaGroup::Contact,
        MetaGroup::Entities,
        MetaGroup::Identifier,
        MetaGroup::Legal,
        MetaGroup::Miscellaneous,
        MetaGroup::Musical,
        MetaGroup::Organizational,
        MetaGroup::Personal,
        MetaGroup::Spacial,
        MetaGroup::Technical,
        MetaGroup::Temporal,
        MetaGroup::Titles,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MetaGroup::Classification => "classification",
            MetaGroup::Commercial => "commercial",
            MetaGroup::Contact => "contact",
            MetaGroup::Entities => "entities",
            MetaGroup::Identifier => "identifier",
            MetaGroup::Legal => "legal",
            MetaGroup::Miscellaneous => "miscellaneous",
            MetaGroup::Musical => "musical",
            MetaGroup::Organizational => "organizational",
            MetaGroup::Personal => "personal",
            MetaGroup::Spacial => "spacial",
            MetaGroup::Technical => "technical",
            MetaGroup::Temporal => "temporal",
            MetaGroup::Titles => "titles",
        }
    }

    /// Stable row id in the `grp` table (seeded at schema creation).
    pub(crate) fn db_id(self) -> i64 {
        MetaGroup::ALL
            .iter()
            .position(|g| *g == self)
            .map(|p| p as i64 + 1)
            .unwrap_or(0)
    }

    pub(crate) fn from_db_id(id: i64) -> Option<Self> {
        if id < 1 {
            return None;
        }
        MetaGroup::ALL.get(id as usize - 1).copied()
    }
}

/// Language of a metadata value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lang {
    #[default]
    Undef,
    En,
    Fr,
    De,
    Es,
    It,
}

impl Lang {
    pub const ALL: [Lang; 6] = [Lang::Undef, Lang::En, Lang::Fr, Lang::De, Lang::Es, Lang::It];

    pub fn short(self) -> &'static str {
        match self {
            Lang::Undef => "",
            Lang::En => "en",
            Lang::Fr => "fr",
            Lang::De => "de",
            Lang::Es => "es",
            Lang::It => "it",
        }
    }

    pub fn long(self) -> &'static str {
        match self {
            Lang::Undef => "undefined",
            Lang::En => "english",
            Lang::Fr => "french",
            Lang::De => "german",
            Lang::Es => "spanish",
            Lang::It => "italian",
        }
    }

    pub(crate) fn db_id(self) -> i64 {
        Lang::ALL
            .iter()
            .position(|l| *l == self)
            .map(|p| p as i64 + 1)
            .unwrap_or(1)
    }

    pub(crate) fn from_db_id(id: i64) -> Self {
        if id < 1 {
            return Lang::Undef;
        }
        Lang::ALL.get(id as usize - 1).copied().unwrap_or(Lang::Undef)
    }
}

/// Default group attribution for well-known keys; anything unknown lands in
/// the miscellaneous bucket.
const GROUP_MAPPING: &[(&str, MetaGroup)] = &[
    // Classification
    (keys::CATEGORY, MetaGroup::Classification),
    (keys::EPISODE, MetaGroup::Classification),
    (keys::GENRE, MetaGroup::Classification),
    (keys::MPAA, MetaGroup::Classification),
    (keys::RUNTIME, MetaGroup::Classification),
    (keys::SEASON, MetaGroup::Classification),
    (keys::SYNOPSIS, MetaGroup::Classification),
    // Commercial
    (keys::COUNTRY, MetaGroup::Commercial),
    (keys::STUDIO, MetaGroup::Commercial),
    ("budget", MetaGroup::Commercial),
    ("revenue", MetaGroup::Commercial),
    // Entities
    (keys::ACTOR, MetaGroup::Entities),
    (keys::ARTIST, MetaGroup::Entities),
    (keys::AUTHOR, MetaGroup::Entities),
    (keys::CASTING, MetaGroup::Entities),
    (keys::COMPOSER, MetaGroup::Entities),
    (keys::DIRECTOR, MetaGroup::Entities),
    (keys::PRODUCER, MetaGroup::Entities),
    // Miscellaneous
    (keys::COVER, MetaGroup::Miscellaneous),
    (keys::FAN_ART, MetaGroup::Miscellaneous),
    (keys::LYRICS, MetaGroup::Miscellaneous),
    (keys::THUMBNAIL, MetaGroup::Miscellaneous),
    // Organizational
    (keys::TRACK, MetaGroup::Organizational),
    // Personal
    (keys::PLAY_COUNT, MetaGroup::Personal),
    (keys::RATING, MetaGroup::Personal),
    ("watched", MetaGroup::Personal),
    // Technical
    (keys::DURATION, MetaGroup::Technical),
    (keys::FILESIZE, MetaGroup::Technical),
    ("width", MetaGroup::Technical),
    ("height", MetaGroup::Technical),
    ("audio_bitrate", MetaGroup::Technical),
    ("audio_channels", MetaGroup::Technical),
    ("audio_codec", MetaGroup::Technical),
    ("video_codec", MetaGroup::Technical),
    // Temporal
    (keys::DATE, MetaGroup::Temporal),
    (keys::YEAR, MetaGroup::Temporal),
    ("premiered", MetaGroup::Temporal),
    // Titles
    (keys::ALBUM, MetaGroup::Titles),
    (keys::TITLE, MetaGroup::Titles),
    (keys::TITLE_ALTERNATIVE, MetaGroup::Titles),
];

/// Group attribution for `name`, case-insensitive.
pub fn group_for(name: &str) -> MetaGroup {
    GROUP_MAPPING
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, grp)| *grp)
        .unwrap_or(MetaGroup::Miscellaneous)
}

/// One key/value metadata pair.
#[derive(Debug, Clone)]
pub struct MetaEntry {
    pub name: String,
    pub value: String,
    pub group: MetaGroup,
    pub lang: Lang,
    pub priority: MetaPriority,
}

/// Ordered list of metadata entries.
#[derive(Debug, Clone, Default)]
pub struct MetaList {
    entries: Vec<MetaEntry>,
}

impl MetaList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry; the key is lower-cased on the way in.
    pub fn add(
        &mut self,
        name: &str,
        value: &str,
        group: MetaGroup,
        lang: Lang,
        priority: MetaPriority,
    ) {
        tracing::trace!(name, value, "adding metadata");
        self.entries.push(MetaEntry {
            name: name.to_ascii_lowercase(),
            value: value.to_string(),
            group,
            lang,
            priority,
        });
    }

    /// Append an entry with the group derived from the key name.
    pub fn add_auto(&mut self, name: &str, value: &str, lang: Lang, priority: MetaPriority) {
        self.add(name, value, group_for(name), lang, priority);
    }

    /// Append with the default priority.
    pub fn add_default(&mut self, name: &str, value: &str) {
        self.add_auto(name, value, Lang::Undef, priority::NORMAL);
    }

    /// First entry named `name` (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&MetaEntry> {
        self.entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetaEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of all entries, in insertion order.
    pub fn key_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }
}

impl IntoIterator for MetaList {
    type Item = MetaEntry;
    type IntoIter = std::vec::IntoIter<MetaEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Priority list of a grabber: a default plus per-key overrides.
#[derive(Debug, Clone)]
pub struct PriorityList {
    default: MetaPriority,
    overrides: Vec<(String, MetaPriority)>,
}

impl PriorityList {
    pub fn new(default: MetaPriority) -> Self {
        Self {
            default,
            overrides: Vec::new(),
        }
    }

    /// Override the priority for one key, or the default when `meta` is
    /// `None`.
    pub fn set(&mut self, meta: Option<&str>, priority: MetaPriority) {
        match meta {
            None => self.default = priority,
            Some(meta) => {
                let meta = meta.to_ascii_lowercase();
                if let Some(slot) = self.overrides.iter_mut().find(|(k, _)| *k == meta) {
                    slot.1 = priority;
                } else {
                    self.overrides.push((meta, priority));
                }
            }
        }
    }

    /// Effective priority for `meta`.
    pub fn get(&self, meta: &str) -> MetaPriority {
        self.overrides
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(meta))
            .map(|(_, p)| *p)
            .unwrap_or(self.default)
    }

    pub fn default_priority(&self) -> MetaPriority {
        self.default
    }
}

impl Default for PriorityList {
    fn default() -> Self {
        Self::new(priority::NORMAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_for_known_keys() {
        assert_eq!(group_for("title"), MetaGroup::Titles);
        assert_eq!(group_for("Artist"), MetaGroup::Entities);
        assert_eq!(group_for("date"), MetaGroup::Temporal);
        assert_eq!(group_for("genre"), MetaGroup::Classification);
        assert_eq!(group_for("track"), MetaGroup::Organizational);
        assert_eq!(group_for("filesize"), MetaGroup::Technical);
        assert_eq!(group_for("whatever"), MetaGroup::Miscellaneous);
    }

    #[test]
    fn test_meta_list_lowercases_keys() {
        let mut list = MetaList::new();
        list.add_default("TITLE", "A");
        assert!(list.get("title").is_some());
        assert_eq!(list.get("Title").unwrap().value, "A");
    }

    #[test]
    fn test_group_ids_round_trip() {
        for grp in MetaGroup::ALL {
            assert_eq!(MetaGroup::from_db_id(grp.db_id()), Some(grp));
        }
        assert_eq!(MetaGroup::from_db_id(0), None);
        assert_eq!(MetaGroup::from_db_id(99), None);
    }

    #[test]
    fn test_lang_ids_round_trip() {
        for lang in Lang::ALL {
            assert_eq!(Lang::from_db_id(lang.db_id()), lang);
        }
        assert_eq!(Lang::from_db_id(42), Lang::Undef);
    }

    #[test]
    fn test_priority_list_overrides() {
        let mut pl = PriorityList::new(priority::NORMAL);
        pl.set(Some("cover"), priority::HIGH);
        assert_eq!(pl.get("cover"), priority::HIGH);
        assert_eq!(pl.get("title"), priority::NORMAL);
        pl.set(None, priority::LOW);
        assert_eq!(pl.get("title"), priority::LOW);
        assert_eq!(pl.get("cover"), priority::HIGH);
    }
}
