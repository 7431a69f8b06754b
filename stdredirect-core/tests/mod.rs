use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serial_test::serial;
use stdredirect_core::{
    Chunk, ChunkSink, ErrorKind, FdStream, LifecycleState, Mode, RedirectConfig, Redirector,
    WriterSink,
};

// ============================================================================
// Fixtures
// ============================================================================

/// A fake console: a temp file behind a descriptor we can redirect.
struct Console {
    file: tempfile::NamedTempFile,
    stream: Arc<FdStream>,
}

impl Console {
    fn new() -> Self {
        let file = tempfile::NamedTempFile::new().unwrap();
        let stream = Arc::new(FdStream::new("console", file.reopen().unwrap()));
        Self { file, stream }
    }

    fn write(&self, text: &str) {
        self.stream.write_all(text.as_bytes()).unwrap();
    }

    fn text(&self) -> String {
        read(self.file.path())
    }
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

#[derive(Clone, Default)]
struct Collector {
    chunks: Arc<Mutex<Vec<String>>>,
}

impl Collector {
    fn sink(&self) -> Arc<dyn ChunkSink> {
        let chunks = self.chunks.clone();
        Arc::new(move |chunk: &Chunk<'_>| {
            chunks
                .lock()
                .unwrap()
                .push(chunk.to_string_lossy().into_owned());
        })
    }

    fn chunks(&self) -> Vec<String> {
        self.chunks.lock().unwrap().clone()
    }

    fn joined(&self) -> String {
        self.chunks().concat()
    }
}

fn config() -> RedirectConfig {
    RedirectConfig::default().with_teardown_timeout(Duration::from_secs(2))
}

fn redirector(console: &Console, collector: &Collector, mode: Mode) -> Redirector {
    Redirector::create_with_config(console.stream.clone(), collector.sink(), mode, config())
        .unwrap()
}

#[cfg(target_os = "linux")]
fn open_descriptors() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

// ============================================================================
// Capture Tests
// ============================================================================

#[test]
#[serial]
fn test_capture_fidelity() {
    let console = Console::new();
    let collector = Collector::default();
    let redirector = redirector(&console, &collector, Mode::Redirect);

    redirector.activate().unwrap();
    console.write("short line\n");
    redirector.deactivate().unwrap();

    assert_eq!(collector.chunks(), vec!["short line\n".to_string()]);
    assert_eq!(console.text(), "");
}

#[test]
#[serial]
fn test_duplicate_fidelity() {
    let console = Console::new();
    let collector = Collector::default();
    let redirector = redirector(&console, &collector, Mode::Duplicate);

    redirector.activate().unwrap();
    console.write("mirrored\n");
    redirector.deactivate().unwrap();

    assert_eq!(collector.chunks(), vec!["mirrored\n".to_string()]);
    assert_eq!(console.text(), "mirrored\n");
}

#[test]
#[serial]
fn test_chunk_splitting() {
    let console = Console::new();
    let collector = Collector::default();
    let redirector = redirector(&console, &collector, Mode::Redirect);
    let text: String = "0123456789".repeat(25);

    redirector.activate().unwrap();
    console.write(&text);
    redirector.deactivate().unwrap();

    let chunks = collector.chunks();
    assert!(chunks.len() >= 4);
    assert!(chunks.iter().all(|c| c.len() <= 80));
    assert_eq!(chunks.concat(), text);
}

#[test]
#[serial]
fn test_custom_capacity_bounds_chunks() {
    let console = Console::new();
    let collector = Collector::default();
    let redirector = Redirector::create_with_config(
        console.stream.clone(),
        collector.sink(),
        Mode::Redirect,
        config().with_buffer_capacity(5),
    )
    .unwrap();

    redirector.activate().unwrap();
    console.write("abcdefghij");
    redirector.deactivate().unwrap();

    assert!(collector.chunks().iter().all(|c| c.len() <= 4));
    assert_eq!(collector.joined(), "abcdefghij");
}

#[test]
#[serial]
fn test_writes_keep_their_order() {
    let console = Console::new();
    let collector = Collector::default();
    let redirector = redirector(&console, &collector, Mode::Redirect);

    redirector.activate().unwrap();
    for i in 0..50 {
        console.write(&format!("{};", i));
    }
    redirector.deactivate().unwrap();

    let expected: String = (0..50).map(|i| format!("{};", i)).collect();
    assert_eq!(collector.joined(), expected);
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[test]
#[serial]
fn test_round_trip_leaves_console_untouched() {
    let console = Console::new();
    let collector = Collector::default();
    let redirector = redirector(&console, &collector, Mode::Redirect);

    console.write("a");
    redirector.activate().unwrap();
    redirector.deactivate().unwrap();
    console.write("b");
    console.write("c");

    assert_eq!(console.text(), "abc");
    assert!(collector.chunks().is_empty());
}

#[test]
#[serial]
fn test_idle_deactivate_is_noop() {
    let console = Console::new();
    let collector = Collector::default();
    let redirector = redirector(&console, &collector, Mode::Redirect);

    redirector.deactivate().unwrap();
    console.write("still here");

    assert_eq!(redirector.state(), LifecycleState::Created);
    assert_eq!(redirector.last_error(), ErrorKind::NoError);
    assert_eq!(console.text(), "still here");
}

#[cfg(target_os = "linux")]
#[test]
#[serial]
fn test_reentrant_redirect_does_not_leak() {
    let console = Console::new();
    let collector = Collector::default();
    let redirector = redirector(&console, &collector, Mode::Duplicate);

    let baseline = open_descriptors();
    redirector.activate().unwrap();
    let active = open_descriptors();
    redirector.activate().unwrap();
    assert_eq!(open_descriptors(), active);
    redirector.deactivate().unwrap();

    assert_eq!(open_descriptors(), baseline);
}

#[test]
#[serial]
fn test_destroy_reports_deactivation_outcome() {
    let console = Console::new();
    let collector = Collector::default();
    let redirector = redirector(&console, &collector, Mode::Redirect);

    redirector.activate().unwrap();
    console.write("last words");
    redirector.destroy().unwrap();
    console.write("after");

    assert_eq!(collector.joined(), "last words");
    assert_eq!(console.text(), "after");
}

#[test]
#[serial]
fn test_writer_sink_mirrors_into_file() {
    let console = Console::new();
    let mirror = tempfile::NamedTempFile::new().unwrap();
    let sink = Arc::new(WriterSink::new(mirror.reopen().unwrap()));
    let redirector =
        Redirector::create_with_config(console.stream.clone(), sink, Mode::Redirect, config())
            .unwrap();

    redirector.activate().unwrap();
    console.write("into the mirror");
    redirector.deactivate().unwrap();

    assert_eq!(read(mirror.path()), "into the mirror");
    assert_eq!(console.text(), "");
}

#[test]
#[serial]
fn test_two_records_on_different_descriptors() {
    let first = Console::new();
    let second = Console::new();
    let first_sink = Collector::default();
    let second_sink = Collector::default();
    let a = redirector(&first, &first_sink, Mode::Redirect);
    let b = redirector(&second, &second_sink, Mode::Redirect);

    a.activate().unwrap();
    b.activate().unwrap();
    first.write("for a");
    second.write("for b");
    a.deactivate().unwrap();
    b.deactivate().unwrap();

    assert_eq!(first_sink.joined(), "for a");
    assert_eq!(second_sink.joined(), "for b");
}

#[test]
#[serial]
fn test_two_records_on_one_descriptor() {
    let console = Console::new();
    let first_sink = Collector::default();
    let second_sink = Collector::default();
    let a = redirector(&console, &first_sink, Mode::Redirect);
    let b = redirector(&console, &second_sink, Mode::Redirect);

    a.activate().unwrap();
    assert_eq!(b.activate().unwrap_err().kind(), ErrorKind::Redirect);
    assert_eq!(a.state(), LifecycleState::Active);
    assert_eq!(b.state(), LifecycleState::Inactive);

    console.write("for a");
    a.deactivate().unwrap();
    b.deactivate().unwrap();

    b.activate().unwrap();
    console.write("for b");
    b.deactivate().unwrap();
    console.write("after");

    assert_eq!(first_sink.joined(), "for a");
    assert_eq!(second_sink.joined(), "for b");
    assert_eq!(console.text(), "after");
}
