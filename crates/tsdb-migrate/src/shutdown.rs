//! Process signal handling.

use std::future::Future;

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exit status used when a second signal forces the process down.
const FORCED_EXIT_CODE: i32 = 130;

/// Cancels `token` on SIGINT (Ctrl+C) or SIGTERM.
///
/// A second signal while the run is winding down exits the process
/// immediately. The returned task ends when the token is cancelled by someone
/// else before any signal arrives; abort it once the run is over.
pub fn listen_for_shutdown(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(watch(token, shutdown_signal, || {
        std::process::exit(FORCED_EXIT_CODE);
    }))
}

async fn watch<S, F>(token: CancellationToken, mut next_signal: S, force_exit: impl FnOnce())
where
    S: FnMut() -> F,
    F: Future<Output = ()>,
{
    tokio::select! {
        () = next_signal() => {
            println!("- Execution cancelled");
            token.cancel();
        }
        () = token.cancelled() => return,
    }

    next_signal().await;
    warn!("Second signal received, exiting without waiting for in-flight work");
    force_exit();
}

/// Listen for SIGTERM and SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, cancelling migration"),
        () = terminate => info!("Received SIGTERM, cancelling migration"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_listener_exits_when_token_cancelled_elsewhere() {
        let token = CancellationToken::new();
        let listener = listen_for_shutdown(token.clone());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), listener)
            .await
            .expect("listener should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_first_signal_cancels_second_forces_exit() {
        let token = CancellationToken::new();
        let notify = Arc::new(Notify::new());
        let forced = Arc::new(AtomicBool::new(false));

        let signal = {
            let notify = notify.clone();
            move || {
                let notify = notify.clone();
                async move { notify.notified().await }
            }
        };
        let force_exit = {
            let forced = forced.clone();
            move || forced.store(true, Ordering::SeqCst)
        };
        let watcher = tokio::spawn(watch(token.clone(), signal, force_exit));

        notify.notify_one();
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("first signal should cancel the run");
        assert!(!forced.load(Ordering::SeqCst));

        notify.notify_one();
        tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .expect("second signal should end the watcher")
            .unwrap();
        assert!(forced.load(Ordering::SeqCst));
    }
}
