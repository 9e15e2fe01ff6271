use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{info, warn};

/// First SIGINT/SIGTERM asks the scheduler to finish its current tick
/// and exit; a second one exits immediately.
pub fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                warn!("failed to install SIGTERM handler: {err}");
                return;
            }
        };

        let mut asked_once = false;
        loop {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if res.is_err() {
                        return;
                    }
                }
                _ = term.recv() => {}
            }

            if !asked_once {
                asked_once = true;
                info!("shutdown requested, finishing the current tick");
                let _ = shutdown_tx.send(true);
            } else {
                warn!("forced shutdown");
                std::process::exit(130);
            }
        }
    });
}
