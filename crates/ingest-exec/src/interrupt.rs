//! Termination signal handling.
//!
//! A dedicated thread owns a current-thread runtime that waits for SIGINT,
//! SIGTERM or SIGHUP. The first signal cancels the run token and then runs the
//! caller's hook (which normally persists the manifest and exits).

use std::io;
use std::thread::{self, JoinHandle};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct InterruptController {
    _thread: JoinHandle<()>,
}

impl InterruptController {
    pub fn install<F>(cancel: CancellationToken, on_signal: F) -> io::Result<Self>
    where
        F: FnOnce(&'static str) + Send + 'static,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let thread = thread::Builder::new()
            .name("ingest-signals".into())
            .spawn(move || {
                let name = runtime.block_on(wait_for_signal());
                let Some(name) = name else { return };
                info!(signal = name, "termination signal received");
                cancel.cancel();
                on_signal(name);
            })?;
        Ok(Self { _thread: thread })
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Option<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut int, mut term, mut hup) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(int), Ok(term), Ok(hup)) => (int, term, hup),
        _ => {
            warn!("could not register unix signal handlers; falling back to ctrl-c");
            return tokio::signal::ctrl_c().await.ok().map(|_| "SIGINT");
        }
    };
    tokio::select! {
        _ = int.recv() => Some("SIGINT"),
        _ = term.recv() => Some("SIGTERM"),
        _ = hup.recv() => Some("SIGHUP"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Option<&'static str> {
    match tokio::signal::ctrl_c().await {
        Ok(()) => Some("ctrl-c"),
        Err(e) => {
            warn!(error = %e, "could not listen for ctrl-c");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_leaves_token_live_until_a_signal_arrives() {
        let cancel = CancellationToken::new();
        let _controller = InterruptController::install(cancel.clone(), |_| {}).unwrap();
        assert!(!cancel.is_cancelled());
    }
}
