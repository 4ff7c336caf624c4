//! Diagnostic grabber: compatible with everything, produces nothing.
//!
//! Useful to exercise the grabbing machinery (selection, gating, the done
//! list) without touching the network.

use tracing::trace;

use crate::error::Result;
use crate::filedata::FileData;
use crate::meta::PriorityList;

use super::{Caps, Grabber};

#[derive(Debug, Default)]
pub struct DummyGrabber;

impl DummyGrabber {
    pub fn new() -> Self {
        Self
    }
}

impl Grabber for DummyGrabber {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn caps(&self) -> Caps {
        Caps::AUDIO.union(Caps::VIDEO).union(Caps::IMAGE)
    }

    fn grab(&mut self, data: &FileData, _pl: &PriorityList) -> Result<()> {
        trace!(path = %data.path().display(), "dummy grab");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fifo::Band;
    use crate::filedata::{OdKind, Step};

    #[test]
    fn test_dummy_always_succeeds() {
        let mut g = DummyGrabber::new();
        let data = FileData::new(
            "/m/a.mp3", 0, 0, false, OdKind::Scan, Band::Normal, Step::Grabbing,
        );
        assert!(g.grab(&data, &PriorityList::default()).is_ok());
        assert!(data.meta_grabber().is_empty());
    }
}
