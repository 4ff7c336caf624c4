//! End-to-end pipeline scenarios against a real store and real files.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use skald_library::db::Database;
use skald_library::{
    Callbacks, Caps, Config, FileData, FileType, GlEvent, Grabber, LibraryOptions, MetaGroup,
    OdEvent, PriorityList, Result, RunOptions, Skald, SkaldError,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(30);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Minimal PCM WAV with a RIFF INFO list carrying title and artist.
fn wav_bytes(title: &str, artist: &str) -> Vec<u8> {
    fn chunk(id: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = id.to_vec();
        out.extend((body.len() as u32).to_le_bytes());
        out.extend(body);
        if body.len() % 2 == 1 {
            out.push(0);
        }
        out
    }

    fn info_entry(id: &[u8; 4], text: &str) -> Vec<u8> {
        let mut body = text.as_bytes().to_vec();
        body.push(0);
        chunk(id, &body)
    }

    // PCM, mono, 8 kHz, 8 bit.
    let mut fmt = Vec::new();
    fmt.extend(1u16.to_le_bytes());
    fmt.extend(1u16.to_le_bytes());
    fmt.extend(8000u32.to_le_bytes());
    fmt.extend(8000u32.to_le_bytes());
    fmt.extend(1u16.to_le_bytes());
    fmt.extend(8u16.to_le_bytes());

    let samples = [0u8; 64];

    let mut info = b"INFO".to_vec();
    info.extend(info_entry(b"INAM", title));
    info.extend(info_entry(b"IART", artist));

    let mut riff_body = b"WAVE".to_vec();
    riff_body.extend(chunk(b"fmt ", &fmt));
    riff_body.extend(chunk(b"data", &samples));
    riff_body.extend(chunk(b"LIST", &info));

    let mut out = b"RIFF".to_vec();
    out.extend((riff_body.len() as u32).to_le_bytes());
    out.extend(riff_body);
    out
}

fn write_wav(path: &Path, title: &str, artist: &str) {
    std::fs::write(path, wav_bytes(title, artist)).unwrap();
}

fn fs_mtime(path: &Path) -> i64 {
    std::fs::metadata(path)
        .unwrap()
        .modified()
        .unwrap()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

fn bump_mtime(path: &Path, seconds: u64) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(seconds))
        .unwrap();
}

struct Fixture {
    media: tempfile::TempDir,
    state: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        init_tracing();
        Self {
            media: tempfile::tempdir().unwrap(),
            state: tempfile::tempdir().unwrap(),
        }
    }

    fn media_path(&self, name: &str) -> PathBuf {
        self.media.path().join(name)
    }

    fn db_path(&self) -> PathBuf {
        self.state.path().join("library.db")
    }

    fn open(&self, callbacks: Callbacks) -> Skald {
        let skald = Skald::open(LibraryOptions::new(self.db_path()), callbacks).unwrap();
        skald
            .configure(Config::ScannerPath {
                path: self.media.path().to_path_buf(),
                recursive: true,
            })
            .unwrap();
        skald
            .configure(Config::ScannerSuffix("wav".into()))
            .unwrap();
        skald
    }
}

fn run_one_loop(skald: &Skald) {
    skald.run(RunOptions::default()).unwrap();
    skald.wait();
}

#[test]
fn first_scan_indexes_audio_file() {
    let fx = Fixture::new();
    let media = fx.media_path("a.wav");
    write_wav(&media, "Alpha", "Xenia");
    let mtime = fs_mtime(&media);
    let size = std::fs::metadata(&media).unwrap().len();

    let skald = fx.open(Callbacks::default());
    run_one_loop(&skald);

    let row = skald
        .database()
        .file_row(&media)
        .unwrap()
        .expect("file row");
    assert_eq!(row.mtime, mtime);
    assert_eq!(row.checked, 1);
    assert_eq!(row.interrupted, 0);
    assert_eq!(row.outofpath, 0);
    assert_eq!(row.file_type, FileType::Audio);

    let rows = skald.file_get(media.as_path(), &[]).unwrap();
    let title = rows.iter().find(|r| r.name == "title").expect("title row");
    assert_eq!(title.value, "Alpha");
    assert_eq!(title.group, MetaGroup::Titles);
    assert!(!title.external);

    let artist = rows.iter().find(|r| r.name == "artist").expect("artist row");
    assert_eq!(artist.value, "Xenia");
    assert_eq!(artist.group, MetaGroup::Entities);

    let filesize = rows.iter().find(|r| r.name == "filesize").expect("filesize");
    assert_eq!(filesize.value, size.to_string());
    assert_eq!(filesize.group, MetaGroup::Technical);
}

#[test]
fn mtime_change_replaces_metadata() {
    let fx = Fixture::new();
    let media = fx.media_path("a.wav");
    write_wav(&media, "Alpha", "Xenia");

    let skald = fx.open(Callbacks::default());
    run_one_loop(&skald);

    // Rewrite with a new title and a guaranteed-different mtime.
    write_wav(&media, "Beta", "Xenia");
    bump_mtime(&media, 10);
    let new_mtime = fs_mtime(&media);

    run_one_loop(&skald);

    let row = skald.database().file_row(&media).unwrap().unwrap();
    assert_eq!(row.mtime, new_mtime);

    let rows = skald.file_get(media.as_path(), &[]).unwrap();
    let titles: Vec<&str> = rows
        .iter()
        .filter(|r| r.name == "title")
        .map(|r| r.value.as_str())
        .collect();
    assert_eq!(titles, vec!["Beta"]);

    // The stale value is fully collected.
    let stale = skald
        .metalist(&skald_library::SearchSpec::value("Alpha"), None, &[])
        .unwrap();
    assert!(stale.is_empty());
}

#[test]
fn removed_file_is_swept_with_its_metadata() {
    let fx = Fixture::new();
    let media = fx.media_path("a.wav");
    write_wav(&media, "Alpha", "Xenia");

    let skald = fx.open(Callbacks::default());
    run_one_loop(&skald);
    assert!(skald.database().file_row(&media).unwrap().is_some());

    std::fs::remove_file(&media).unwrap();
    run_one_loop(&skald);

    assert!(skald.database().file_row(&media).unwrap().is_none());
    let orphans = skald
        .metalist(&skald_library::SearchSpec::pair("artist", "Xenia"), None, &[])
        .unwrap();
    assert!(orphans.is_empty());
}

#[test]
fn external_metadata_survives_rescans_and_content_changes() {
    let fx = Fixture::new();
    let media = fx.media_path("a.wav");
    write_wav(&media, "Alpha", "Xenia");

    let skald = fx.open(Callbacks::default());
    run_one_loop(&skald);

    skald
        .metadata_insert(
            &media,
            "rating",
            "5",
            skald_library::Lang::Undef,
            MetaGroup::Personal,
        )
        .unwrap();

    // Rescan with unchanged mtime.
    run_one_loop(&skald);
    let rows = skald.file_get(media.as_path(), &[]).unwrap();
    let rating = rows.iter().find(|r| r.name == "rating").expect("rating");
    assert_eq!(rating.value, "5");
    assert!(rating.external);

    // Content change: internal metadata is replaced, the external row stays.
    write_wav(&media, "Beta", "Xenia");
    bump_mtime(&media, 10);
    run_one_loop(&skald);

    let rows = skald.file_get(media.as_path(), &[]).unwrap();
    let rating = rows.iter().find(|r| r.name == "rating").expect("rating");
    assert_eq!(rating.value, "5");
    assert!(rating.external);
}

#[test]
fn scan_loop_event_order() {
    let fx = Fixture::new();
    for i in 0..5 {
        write_wav(&fx.media_path(&format!("f{i}.wav")), "T", "A");
    }

    let (tx, rx) = mpsc::channel();
    let skald = fx.open(Callbacks {
        global: Some(Box::new(move |event| {
            let _ = tx.send(event);
        })),
        ..Default::default()
    });

    skald.run(RunOptions::default()).unwrap();

    // The ack barrier guarantees this order; receive before tearing down so
    // the queued events cannot be dropped by shutdown.
    let mut events = Vec::new();
    while events.last() != Some(&GlEvent::ScannerExit) {
        events.push(rx.recv_timeout(RECV_TIMEOUT).expect("scanner event"));
    }
    skald.wait();

    assert_eq!(
        events,
        vec![
            GlEvent::ScannerBegin,
            GlEvent::ScannerEnd,
            GlEvent::ScannerAcks,
            GlEvent::ScannerExit,
        ]
    );

    assert_eq!(skald.filelist(Some(FileType::Audio), &[]).unwrap().len(), 5);
}

#[test]
fn ondemand_ingests_file_outside_roots() {
    let fx = Fixture::new();
    write_wav(&fx.media_path("in.wav"), "In", "A");

    let outside = tempfile::tempdir().unwrap();
    let target = outside.path().join("out.wav");
    write_wav(&target, "Out", "B");

    let (od_tx, od_rx) = mpsc::channel();
    let skald = fx.open(Callbacks {
        on_demand: Some(Box::new(move |path, event, _| {
            let _ = od_tx.send((path.to_path_buf(), event));
        })),
        ..Default::default()
    });

    // Two loops with a long sleep: the request lands between them.
    skald
        .run(RunOptions {
            loops: 2,
            timeout: Some(Duration::from_secs(600)),
            delay: None,
        })
        .unwrap();

    skald.ondemand(&target).unwrap();

    // Drive the request to completion before releasing the scanner.
    loop {
        let (path, event) = od_rx.recv_timeout(RECV_TIMEOUT).expect("ondemand event");
        assert_eq!(path, target);
        if event == OdEvent::Ended {
            break;
        }
    }

    let row = skald
        .database()
        .file_row(&target)
        .unwrap()
        .expect("ingested row");
    assert_eq!(row.outofpath, 1);

    skald.scanner_wakeup();
    skald.wait();

    // Out-of-path files are exempt from the disappeared-file sweep.
    let row = skald.database().file_row(&target).unwrap();
    assert!(row.is_some());
    let rows = skald.file_get(target.as_path(), &[]).unwrap();
    assert!(rows.iter().any(|r| r.name == "title" && r.value == "Out"));
}

struct CountingGrabber {
    calls: Arc<AtomicUsize>,
}

impl Grabber for CountingGrabber {
    fn name(&self) -> &'static str {
        "count"
    }

    fn caps(&self) -> Caps {
        Caps::AUDIO
    }

    fn grab(&mut self, data: &FileData, pl: &PriorityList) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        data.add_grabber_meta("category", "counted", skald_library::Lang::Undef, pl.get("category"));
        Ok(())
    }
}

#[test]
fn registered_grabber_runs_and_persists() {
    let fx = Fixture::new();
    let media = fx.media_path("a.wav");
    write_wav(&media, "Alpha", "Xenia");

    let calls = Arc::new(AtomicUsize::new(0));
    let skald = fx.open(Callbacks::default());
    skald
        .register_grabber(Box::new(CountingGrabber {
            calls: Arc::clone(&calls),
        }))
        .unwrap();

    run_one_loop(&skald);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(skald
        .database()
        .grabbers_for_file(&media)
        .unwrap()
        .contains(&"count".to_string()));
    let rows = skald.file_get(media.as_path(), &[]).unwrap();
    assert!(rows.iter().any(|r| r.name == "category" && r.value == "counted"));
}

#[test]
fn interrupted_run_skips_already_done_grabbers() {
    let fx = Fixture::new();
    let media = fx.media_path("a.wav");
    write_wav(&media, "Alpha", "Xenia");
    let mtime = fs_mtime(&media);

    // Forge the aftermath of a crash: the file is known, marked interrupted,
    // and the "count" grabber already ran for it.
    {
        let db = Database::open(fx.db_path()).unwrap();
        let data = FileData::new(
            &media,
            mtime,
            std::fs::metadata(&media).unwrap().len(),
            false,
            skald_library::filedata::OdKind::Scan,
            skald_library::fifo::Band::Normal,
            skald_library::filedata::Step::Parsing,
        );
        db.file_insert(&data).unwrap();
        db.interrupted_fix().unwrap();
        db.file_grab_write(&media, &skald_library::MetaList::new(), Some("count"))
            .unwrap();
        assert_eq!(db.file_interrupted(&media).unwrap(), Some(1));
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let skald = fx.open(Callbacks::default());
    skald
        .register_grabber(Box::new(CountingGrabber {
            calls: Arc::clone(&calls),
        }))
        .unwrap();
    // Leave only the forged grabber in play.
    skald
        .configure(Config::GrabberState {
            grabber: "dummy".into(),
            enabled: false,
        })
        .unwrap();
    skald
        .configure(Config::GrabberState {
            grabber: "local".into(),
            enabled: false,
        })
        .unwrap();

    run_one_loop(&skald);

    // The file went through the pipeline again, but the finished grabber was
    // not repeated.
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let row = skald.database().file_row(&media).unwrap().unwrap();
    assert_eq!(row.interrupted, 0);
}

#[test]
fn unchanged_file_is_not_reprocessed() {
    let fx = Fixture::new();
    let media = fx.media_path("a.wav");
    write_wav(&media, "Alpha", "Xenia");

    let calls = Arc::new(AtomicUsize::new(0));
    let skald = fx.open(Callbacks::default());
    skald
        .register_grabber(Box::new(CountingGrabber {
            calls: Arc::clone(&calls),
        }))
        .unwrap();

    run_one_loop(&skald);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    run_one_loop(&skald);
    // Unchanged and complete: the grabbers did not run again.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let row = skald.database().file_row(&media).unwrap().unwrap();
    assert_eq!(row.interrupted, 0);
    assert_eq!(row.checked, 1);
}

#[test]
fn run_twice_without_wait_is_refused() {
    let fx = Fixture::new();
    write_wav(&fx.media_path("a.wav"), "A", "B");
    let skald = fx.open(Callbacks::default());
    skald.run(RunOptions::default()).unwrap();
    let err = skald.run(RunOptions::default()).unwrap_err();
    assert!(matches!(err, SkaldError::AlreadyRunning));
    skald.wait();
}

#[test]
fn configuration_is_frozen_while_running() {
    let fx = Fixture::new();
    write_wav(&fx.media_path("a.wav"), "A", "B");
    let skald = fx.open(Callbacks::default());
    skald
        .run(RunOptions {
            loops: 2,
            timeout: Some(Duration::from_secs(600)),
            delay: None,
        })
        .unwrap();

    let err = skald
        .configure(Config::ScannerSuffix("flac".into()))
        .unwrap_err();
    assert!(matches!(err, SkaldError::Config { .. }));

    // Grabber state stays adjustable at runtime.
    skald
        .configure(Config::GrabberState {
            grabber: "dummy".into(),
            enabled: false,
        })
        .unwrap();

    skald.scanner_wakeup();
    skald.wait();
}
