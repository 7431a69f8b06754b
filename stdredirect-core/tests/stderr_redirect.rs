//! Redirects the real fd 2. The test harness only writes to stdout, so
//! nothing but these tests lands on stderr while a redirection is live.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serial_test::serial;
use stdredirect_core::{
    Chunk, ChunkSink, ErrorKind, LifecycleState, Mode, RedirectConfig, Redirector, Registry,
    StdStream, console,
};

fn config() -> RedirectConfig {
    RedirectConfig::default().with_teardown_timeout(Duration::from_secs(2))
}

fn collector() -> (Arc<dyn ChunkSink>, Arc<Mutex<Vec<u8>>>) {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink_captured = captured.clone();
    let sink: Arc<dyn ChunkSink> = Arc::new(move |chunk: &Chunk<'_>| {
        sink_captured
            .lock()
            .unwrap()
            .extend_from_slice(chunk.bytes());
    });
    (sink, captured)
}

fn text(captured: &Arc<Mutex<Vec<u8>>>) -> String {
    String::from_utf8_lossy(&captured.lock().unwrap()).into_owned()
}

#[test]
#[serial]
fn test_rust_stderr_is_captured() {
    let (sink, captured) = collector();
    let redirector =
        Redirector::create_with_config(Arc::new(StdStream::Error), sink, Mode::Redirect, config())
            .unwrap();

    redirector.activate().unwrap();
    std::io::stderr().write_all(b"from rust\n").unwrap();
    redirector.deactivate().unwrap();

    assert_eq!(text(&captured), "from rust\n");
    assert_eq!(redirector.state(), LifecycleState::Inactive);
}

#[test]
#[serial]
fn test_raw_descriptor_writes_are_captured() {
    let (sink, captured) = collector();
    let redirector =
        Redirector::create_with_config(Arc::new(StdStream::Error), sink, Mode::Redirect, config())
            .unwrap();

    redirector.activate().unwrap();
    let msg = b"from fd 2\n";
    let written = nix::unistd::write(std::io::stderr(), msg).unwrap();
    assert_eq!(written, msg.len());
    redirector.deactivate().unwrap();

    assert_eq!(text(&captured), "from fd 2\n");
}

#[test]
#[serial]
fn test_child_processes_inherit_redirection() {
    let (sink, captured) = collector();
    let redirector =
        Redirector::create_with_config(Arc::new(StdStream::Error), sink, Mode::Redirect, config())
            .unwrap();

    redirector.activate().unwrap();
    let status = std::process::Command::new("sh")
        .args(["-c", "echo from-child >&2"])
        .status()
        .unwrap();
    redirector.deactivate().unwrap();

    assert!(status.success());
    assert_eq!(text(&captured), "from-child\n");
}

#[test]
#[serial]
fn test_console_write_bypasses_redirection() {
    let (sink, captured) = collector();
    let redirector =
        Redirector::create_with_config(Arc::new(StdStream::Error), sink, Mode::Redirect, config())
            .unwrap();

    redirector.activate().unwrap();
    console::write(StdStream::Error, b"").unwrap();
    console::diagnostic("stdredirect test: this line bypasses the capture");
    std::io::stderr().write_all(b"captured").unwrap();
    redirector.deactivate().unwrap();

    assert_eq!(text(&captured), "captured");
}

#[test]
#[serial]
fn test_registry_duplicate_and_unredirect() {
    let registry = Registry::new(config());
    let (sink, captured) = collector();

    registry
        .redirect(StdStream::Error, sink, Mode::Duplicate)
        .unwrap();
    assert!(registry.is_redirected(StdStream::Error));
    std::io::stderr().write_all(b"seen twice\n").unwrap();

    registry.unredirect_stderr().unwrap();
    assert_eq!(registry.state(StdStream::Error), Some(LifecycleState::Inactive));
    assert_eq!(text(&captured), "seen twice\n");

    registry.reactivate(StdStream::Error).unwrap();
    std::io::stderr().write_all(b"again\n").unwrap();
    registry.destroy(StdStream::Error).unwrap();

    assert_eq!(text(&captured), "seen twice\nagain\n");
    assert_eq!(registry.state(StdStream::Error), None);
    assert_eq!(
        registry.unredirect_stderr().unwrap_err().kind(),
        ErrorKind::NullPtr
    );
}

#[test]
#[serial]
fn test_registry_replaces_existing_record() {
    let registry = Registry::new(config());
    let (first, first_captured) = collector();
    let (second, second_captured) = collector();

    registry.redirect(StdStream::Error, first, Mode::Redirect).unwrap();
    std::io::stderr().write_all(b"one").unwrap();
    registry.redirect(StdStream::Error, second, Mode::Redirect).unwrap();
    std::io::stderr().write_all(b"two").unwrap();
    registry.unredirect_all().unwrap();

    assert_eq!(text(&first_captured), "one");
    assert_eq!(text(&second_captured), "two");
}

#[test]
#[serial]
fn test_registry_drop_restores_stderr() {
    let (sink, captured) = collector();
    {
        let registry = Registry::new(config());
        registry.redirect(StdStream::Error, sink, Mode::Redirect).unwrap();
        std::io::stderr().write_all(b"inside").unwrap();
    }
    assert_eq!(text(&captured), "inside");

    // Back on the console: a fresh capture sees only its own output.
    let (sink, captured) = collector();
    let redirector =
        Redirector::create_with_config(Arc::new(StdStream::Error), sink, Mode::Redirect, config())
            .unwrap();
    redirector.activate().unwrap();
    redirector.deactivate().unwrap();
    assert!(text(&captured).is_empty());
}
