//! Local artwork grabber.
//!
//! Looks next to the media file for cover art: first an image named after
//! the file itself, then the usual per-directory covers (`cover.*`,
//! `front.*`, `folder.*`). No network involved; the found path is stored as
//! the `cover` metadata so applications can use it directly.

use std::path::{Path, PathBuf};

use tracing::trace;

use crate::error::Result;
use crate::filedata::FileData;
use crate::meta::{keys, Lang, PriorityList};

use super::{Caps, Grabber};

const KNOWN_NAMES: &[&str] = &["cover", "COVER", "front", "FRONT", "folder"];
const KNOWN_EXTENSIONS: &[&str] = &["jpg", "JPG", "jpeg", "JPEG", "png", "PNG", "tbn", "TBN"];

#[derive(Debug, Default)]
pub struct LocalGrabber;

impl LocalGrabber {
    pub fn new() -> Self {
        Self
    }

    fn find_cover(path: &Path) -> Option<PathBuf> {
        let dir = path.parent()?;
        let stem = path.file_stem()?.to_str()?;

        // Exact match on the file's own name first.
        for ext in KNOWN_EXTENSIONS {
            let cover = dir.join(format!("{stem}.{ext}"));
            if cover.is_file() {
                return Some(cover);
            }
        }

        // Then a generic cover for the whole directory.
        for name in KNOWN_NAMES {
            for ext in KNOWN_EXTENSIONS {
                let cover = dir.join(format!("{name}.{ext}"));
                if cover.is_file() {
                    return Some(cover);
                }
            }
        }

        None
    }
}

impl Grabber for LocalGrabber {
    fn name(&self) -> &'static str {
        "local"
    }

    fn caps(&self) -> Caps {
        Caps::AUDIO.union(Caps::VIDEO)
    }

    fn grab(&mut self, data: &FileData, pl: &PriorityList) -> Result<()> {
        if let Some(cover) = Self::find_cover(data.path()) {
            trace!(cover = %cover.display(), "local artwork found");
            data.add_grabber_meta(
                keys::COVER,
                &cover.to_string_lossy(),
                Lang::Undef,
                pl.get(keys::COVER),
            );
        }
        Ok(())
    }
}
