//! SIGTERM/SIGINT handling for a clean shutdown of the listener.
//!
//! In-flight sessions are not torn down: they have no cancellation point
//! of their own (see the concurrency model's "Cancellation and timeouts"
//! note) and are expected to be short relative to an operator's patience.
//! We just stop accepting new connections and exit.

use std::thread;

use anyhow::Context;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::iterator::Signals;
use tracing::info;

pub struct Handler {
    signals: Signals,
}

impl Handler {
    pub fn new() -> anyhow::Result<Self> {
        let signals = Signals::new(TERM_SIGNALS).context("registering signal handlers")?;
        Ok(Handler { signals })
    }

    /// Spawns the background thread that waits for a term signal and exits
    /// the process once one arrives.
    pub fn spawn(mut self) -> anyhow::Result<()> {
        thread::Builder::new()
            .name("signal-handler".to_string())
            .spawn(move || {
                if let Some(sig) = self.signals.forever().next() {
                    info!(signal = sig, "received shutdown signal, exiting");
                    std::process::exit(0);
                }
            })
            .context("spawning signal handler thread")?;
        Ok(())
    }
}
