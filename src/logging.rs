//! Global log-sink configuration.
//!
//! The source models the stdout/syslog/file trio as a small, fixed,
//! process-wide configuration computed once from CLI flags and never
//! touched again (see the "Global log sinks" design note): `{stdout: bool,
//! syslog: bool, file: Vec<PathBuf>}`. We fan every formatted line out to
//! whichever of those are configured through a single `tracing-subscriber`
//! `fmt` layer rather than installing one subscriber per sink.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tracing_subscriber::fmt::MakeWriter;

/// One `-o <sink>` flag, parsed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sink {
    Stdout,
    Syslog,
    File(PathBuf),
}

impl std::str::FromStr for Sink {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        if s == "stdout" {
            Ok(Sink::Stdout)
        } else if s == "syslog" {
            Ok(Sink::Syslog)
        } else if let Some(path) = s.strip_prefix("file:") {
            Ok(Sink::File(PathBuf::from(path)))
        } else {
            anyhow::bail!("unrecognized log sink {:?}, want stdout, syslog, or file:<path>", s)
        }
    }
}

/// Installs the global `tracing` subscriber. `verbose` follows the CLI's
/// repeated `-v` flag: 0 is info, 1 is debug, 2+ is trace.
pub fn init(sinks: &[Sink], verbose: u8) -> anyhow::Result<()> {
    let filter = match verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    let writer = FanOutWriter::new(sinks).context("opening log sinks")?;

    tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Ok(())
}

/// A `MakeWriter` that writes every formatted log line to all configured
/// sinks. Each underlying sink handles its own synchronization so this is
/// safe to hand out to any number of worker threads.
#[derive(Clone)]
struct FanOutWriter {
    handles: Vec<Arc<Mutex<dyn Write + Send>>>,
}

impl FanOutWriter {
    fn new(sinks: &[Sink]) -> anyhow::Result<Self> {
        let mut handles: Vec<Arc<Mutex<dyn Write + Send>>> = Vec::new();

        // stdout is the default sink when none is given explicitly.
        let want_stdout = sinks.is_empty() || sinks.iter().any(|s| *s == Sink::Stdout);
        if want_stdout {
            handles.push(Arc::new(Mutex::new(io::stdout())));
        }

        for sink in sinks {
            match sink {
                Sink::Stdout => {}
                Sink::Syslog => {
                    handles.push(Arc::new(Mutex::new(SyslogWriter::connect()?)));
                }
                Sink::File(path) => {
                    let f = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)
                        .with_context(|| format!("opening log file {:?}", path))?;
                    handles.push(Arc::new(Mutex::new(f)));
                }
            }
        }

        Ok(FanOutWriter { handles })
    }
}

impl Write for FanOutWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for handle in &self.handles {
            // A single wedged sink shouldn't silently swallow every log
            // line; but we also don't want one bad sink to stop another
            // from getting the message, so we just best-effort each one.
            if let Ok(mut h) = handle.lock() {
                let _ = h.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        for handle in &self.handles {
            if let Ok(mut h) = handle.lock() {
                let _ = h.flush();
            }
        }
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for FanOutWriter {
    type Writer = FanOutWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// A minimal RFC 3164 syslog client over the local `/dev/log` datagram
/// socket. No external crate is pulled in for this: the wire format is a
/// handful of bytes over a socket `std` already exposes.
struct SyslogWriter {
    sock: UnixDatagram,
}

const SYSLOG_FACILITY_DAEMON: u8 = 3;
const SYSLOG_SEVERITY_INFO: u8 = 6;

impl SyslogWriter {
    fn connect() -> anyhow::Result<Self> {
        let sock = UnixDatagram::unbound().context("creating syslog socket")?;
        sock.connect("/dev/log").context("connecting to /dev/log")?;
        Ok(SyslogWriter { sock })
    }
}

impl Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let pri = (SYSLOG_FACILITY_DAEMON * 8) + SYSLOG_SEVERITY_INFO;
        let msg = String::from_utf8_lossy(buf);
        let line = format!("<{}>hostagentd[{}]: {}", pri, std::process::id(), msg.trim_end());
        self.sock.send(line.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
