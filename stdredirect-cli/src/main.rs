// stdredirect-cli/src/main.rs

mod util;

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use stdredirect_core::{Mode, RedirectConfig, Registry, StdStream};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::util::status;

const USAGE: &str = "usage: stdredirect-cli [--duplicate] [--stderr]

Redirects stdout (or stderr) to the debug log, prints through it, and then
echoes every stdin line into the redirected stream until EOF or Ctrl+C.

  --duplicate   keep writing to the console as well
  --stderr      work on stderr instead of stdout

Environment: RUST_LOG, STDREDIRECT_BUFFER_CAPACITY, STDREDIRECT_TEARDOWN_TIMEOUT";

struct Options {
    stream: StdStream,
    mode: Mode,
}

fn parse_args() -> Result<Option<Options>> {
    let mut options = Options {
        stream: StdStream::Output,
        mode: Mode::Redirect,
    };
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--duplicate" => options.mode = Mode::Duplicate,
            "--stderr" => options.stream = StdStream::Error,
            "-h" | "--help" => return Ok(None),
            other => bail!("unknown argument '{}'\n\n{}", other, USAGE),
        }
    }
    Ok(Some(options))
}

/// Print one line through the ordinary std handle for `stream`.
fn emit(stream: StdStream, line: &str) -> Result<()> {
    match stream {
        StdStream::Output => {
            let mut out = std::io::stdout().lock();
            writeln!(out, "{}", line)?;
            out.flush()?;
        }
        StdStream::Error => {
            let mut err = std::io::stderr().lock();
            writeln!(err, "{}", line)?;
            err.flush()?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let Some(options) = parse_args()? else {
        println!("{}", USAGE);
        return Ok(());
    };

    util::init_tracing();
    util::install_panic_hook();

    let config = RedirectConfig::from_env();
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid redirect configuration")?;
    tracing::info!(?config, stream = %options.stream, mode = ?options.mode, "demo starting");

    let registry = Registry::new(config);
    let stream = options.stream;

    status("starting… (Ctrl+C to exit)");
    emit(stream, "1. printed before the redirect")?;

    registry
        .redirect_to_debugger(stream, options.mode)
        .with_context(|| format!("redirecting {} failed", stream))?;
    emit(stream, "2. printed while redirected")?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    registry
        .unredirect(stream)
        .with_context(|| format!("unredirecting {} failed", stream))?;
    emit(stream, "3. printed after the redirect was undone")?;

    registry
        .reactivate(stream)
        .with_context(|| format!("reactivating {} failed", stream))?;
    status(&format!(
        "{} is redirected again; type lines to send them through it",
        stream
    ));

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                status("Ctrl+C received, exiting…");
                break;
            }

            line = lines.next_line() => {
                let Some(line) = line.context("stdin read failed")? else {
                    status("stdin closed, exiting…");
                    break;
                };
                emit(stream, &line)?;
            }
        }
    }

    registry
        .destroy_all()
        .context("restoring the console failed")?;
    emit(stream, "4. printed after teardown")?;
    status("done");

    Ok(())
}
