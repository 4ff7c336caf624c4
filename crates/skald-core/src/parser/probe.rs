//! Media probe adapter.
//!
//! Classification runs cheapest-first: a magic-byte sniff for images, the
//! suffix table for containers the tag reader does not cover, then a real
//! tag read through `lofty` for everything that looks like audio. A file
//! that defeats all three stays `Null` and travels on with no metadata.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use lofty::file::TaggedFileExt;
use lofty::prelude::Accessor;
use lofty::probe::Probe;
use lofty::tag::ItemKey;

use crate::error::{Result, SkaldError};
use crate::filedata::FileType;

/// Classification plus the embedded tags found during the probe.
#[derive(Debug, Default)]
pub struct Probed {
    pub file_type: FileType,
    /// Lower-cased key / value pairs.
    pub tags: Vec<(String, String)>,
}

const VIDEO_SUFFIXES: &[&str] = &[
    "mkv", "avi", "mp4", "m4v", "mov", "mpg", "mpeg", "ts", "webm", "wmv", "flv", "ogv",
];

const PLAYLIST_SUFFIXES: &[&str] = &["m3u", "m3u8", "pls", "xspf"];

const IMAGE_SUFFIXES: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp", "tbn"];

fn suffix(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Identify an image by its leading bytes.
fn sniff_image(head: &[u8]) -> bool {
    head.starts_with(&[0xFF, 0xD8, 0xFF])
        || head.starts_with(&[0x89, b'P', b'N', b'G'])
        || head.starts_with(b"GIF8")
        || head.starts_with(b"BM")
        || (head.len() >= 12 && head.starts_with(b"RIFF") && &head[8..12] == b"WEBP")
}

fn read_head(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path).map_err(|e| SkaldError::Io {
        message: format!("cannot open for probing: {e}"),
        path: Some(path.to_path_buf()),
        source: Some(e),
    })?;
    let mut head = vec![0u8; 16];
    let n = file.read(&mut head)?;
    head.truncate(n);
    Ok(head)
}

/// Pull the well-known tags out of a parsed audio file.
fn collect_tags(tagged: &lofty::file::TaggedFile) -> Vec<(String, String)> {
    let mut tags = Vec::new();
    let Some(tag) = tagged.primary_tag().or_else(|| tagged.first_tag()) else {
        return tags;
    };

    if let Some(title) = tag.title() {
        tags.push(("title".into(), title.into_owned()));
    }
    if let Some(artist) = tag.artist() {
        tags.push(("artist".into(), artist.into_owned()));
    }
    if let Some(album) = tag.album() {
        tags.push(("album".into(), album.into_owned()));
    }
    if let Some(genre) = tag.genre() {
        tags.push(("genre".into(), genre.into_owned()));
    }
    if let Some(track) = tag.track() {
        tags.push(("track".into(), track.to_string()));
    }
    if let Some(year) = tag.year() {
        tags.push(("year".into(), year.to_string()));
    }
    for (key, name) in [
        (ItemKey::AlbumArtist, "album_artist"),
        (ItemKey::Composer, "composer"),
        (ItemKey::RecordingDate, "date"),
    ] {
        if let Some(value) = tag.get_string(&key) {
            tags.push((name.into(), value.to_string()));
        }
    }
    tags
}

/// Probe one file: classify it and extract whatever tags the container
/// carries.
pub fn probe(path: &Path) -> Result<Probed> {
    let head = read_head(path)?;
    if sniff_image(&head) {
        return Ok(Probed {
            file_type: FileType::Image,
            tags: Vec::new(),
        });
    }

    let sfx = suffix(path);
    if let Some(sfx) = sfx.as_deref() {
        if PLAYLIST_SUFFIXES.contains(&sfx) {
            return Ok(Probed {
                file_type: FileType::Playlist,
                tags: Vec::new(),
            });
        }
        if IMAGE_SUFFIXES.contains(&sfx) {
            // Extension says image but the magic did not confirm it; keep
            // the claim, downstream consumers only group by type.
            return Ok(Probed {
                file_type: FileType::Image,
                tags: Vec::new(),
            });
        }
        if VIDEO_SUFFIXES.contains(&sfx) {
            return Ok(Probed {
                file_type: FileType::Video,
                tags: Vec::new(),
            });
        }
    }

    // Audio (or unknown): let the tag reader decide.
    match Probe::open(path).and_then(|p| p.read()) {
        Ok(tagged) => Ok(Probed {
            file_type: FileType::Audio,
            tags: collect_tags(&tagged),
        }),
        Err(e) => Err(SkaldError::Io {
            message: format!("demuxer cannot open file: {e}"),
            path: Some(path.to_path_buf()),
            source: None,
        }),
    }
}
