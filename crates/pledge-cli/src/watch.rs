//! Filesystem watch with event coalescing.
//!
//! Watches the input directory recursively and fires one trigger per burst
//! of changes: the first event opens a five-second window, everything
//! inside the window is swallowed, then the trigger runs once.

use std::path::Path;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{RecursiveMode, Watcher};
use tracing::{debug, error};

/// Coalescing window after the first event of a burst.
pub const THROTTLE: Duration = Duration::from_secs(5);

/// Watch `input` and invoke `trigger` once per coalesced change burst.
/// Runs until the watcher channel breaks; trigger failures are logged and
/// watching continues.
///
/// # Errors
///
/// Fails when the watcher cannot be installed on `input`.
pub fn watch_loop(input: &Path, mut trigger: impl FnMut() -> Result<()>) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    let mut watcher = notify::recommended_watcher(move |event| {
        let _ = tx.send(event);
    })
    .context("create watcher")?;
    watcher
        .watch(input, RecursiveMode::Recursive)
        .with_context(|| format!("watch {}", input.display()))?;

    loop {
        // Block for the first event of a burst.
        match rx.recv() {
            Ok(Ok(event)) => debug!(?event, "change detected"),
            Ok(Err(e)) => {
                error!(error = %e, "watch event");
                continue;
            },
            Err(_) => return Ok(()), // watcher gone
        }

        // Swallow everything else inside the window.
        let deadline = Instant::now() + THROTTLE;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok(_) => {},
                Err(mpsc::RecvTimeoutError::Timeout) => break,
                Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }

        if let Err(e) = trigger() {
            error!(error = %e, "watch trigger");
        }
    }
}
