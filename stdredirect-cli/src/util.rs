use stdredirect_core::{ConsoleWriter, StdStream, console};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    // Capture the console before anything is redirected; the log writer
    // has to keep reaching it afterwards.
    console::init();

    // RUST_LOG=stdredirect_core=trace,stdredirect::debugger=debug
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,stdredirect_core=debug,stdredirect::debugger=debug")
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(ConsoleWriter::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .compact()
        .try_init();
}

/// Panics are reported on the real console, never through fd 2, which may be
/// a pipe whose reader is the thread that just panicked.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| info.payload().downcast_ref::<String>().map(String::as_str))
            .unwrap_or("<non-string panic payload>");
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "<unknown>".to_string());
        let thread = std::thread::current();
        let thread = thread.name().unwrap_or("<unnamed>");

        console::diagnostic(&panic_line(thread, &location, payload));
        tracing::error!(%thread, %location, %payload, "panic");
    }));
}

fn panic_line(thread: &str, location: &str, payload: &str) -> String {
    format!("panic in thread '{}' at {}: {}", thread, location, payload)
}

/// Status line for the operator. Goes to the console even while stderr is captured.
pub fn status(message: &str) {
    let line = format!("[stdredirect-cli] {}\n", message);
    let _ = console::write(StdStream::Error, line.as_bytes());
}
