//! Network-availability watcher.
//!
//! Armed once per playback session, disarmed once on stop.  A small task
//! probes a known endpoint (default `1.1.1.1:53`) on a fixed interval and
//! emits `NetworkRestored` on every down→up edge so the controller can
//! resume a pending-retry session without user action.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use rewind_proto::config::NetworkConfig;

use crate::controller::DaemonEvent;

pub struct WatcherHandle {
    cancel: CancellationToken,
}

impl WatcherHandle {
    pub fn disarm(self) {
        self.cancel.cancel();
    }
}

pub fn arm(config: NetworkConfig, event_tx: mpsc::Sender<DaemonEvent>) -> WatcherHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        let interval = Duration::from_millis(config.probe_interval_ms);
        let timeout = Duration::from_millis(config.probe_timeout_ms);
        // Assume up at arm time: the session just connected, and the first
        // probe must not fire a spurious restore event.
        let mut was_up = true;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("network watcher: disarmed");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            let up = probe(&config.probe_address, timeout).await;
            if up && !was_up {
                info!("network watcher: connectivity restored");
                if event_tx.send(DaemonEvent::NetworkRestored).await.is_err() {
                    return;
                }
            }
            was_up = up;
        }
    });

    WatcherHandle { cancel }
}

async fn probe(address: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(address)).await,
        Ok(Ok(_))
    )
}
