//! Signal handling for a backup run.
//!
//! The token returned by [`install_signal_handler`] is shared by the catalog
//! retries, the download producer and every worker. Once it fires nothing new
//! is queued, retry sleeps end early and the deletion pass is skipped, while
//! the units workers already hold run to completion.

use tokio_util::sync::CancellationToken;

/// Spawn a listener for SIGINT, SIGTERM and SIGHUP (Ctrl+C only off unix).
///
/// The first signal cancels the returned token. A second one exits the
/// process with status 130 without waiting for in-flight units.
pub(crate) fn install_signal_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();

    #[cfg(unix)]
    let mut signals = {
        use tokio::signal::unix::{signal, SignalKind};
        [
            signal(SignalKind::interrupt())?,
            signal(SignalKind::terminate())?,
            signal(SignalKind::hangup())?,
        ]
    };

    let run_token = token.clone();
    tokio::spawn(async move {
        let mut received = 0u32;
        loop {
            #[cfg(unix)]
            {
                let [interrupt, terminate, hangup] = &mut signals;
                tokio::select! {
                    _ = interrupt.recv() => {}
                    _ = terminate.recv() => {}
                    _ = hangup.recv() => {}
                }
            }

            #[cfg(not(unix))]
            {
                if tokio::signal::ctrl_c().await.is_err() {
                    tracing::warn!("Ctrl+C listener failed; stop the process to abort the run");
                    return;
                }
            }

            received += 1;
            if received == 1 {
                tracing::info!(
                    "Stopping: no further units will be queued, waiting for active downloads"
                );
                tracing::info!("Signal again to exit immediately");
                run_token.cancel();
            } else {
                tracing::warn!("Exiting without waiting for active downloads");
                std::process::exit(130);
            }
        }
    });

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_starts_uncancelled() {
        let token = install_signal_handler().unwrap();
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_wakes_pending_waiters() {
        let token = install_signal_handler().unwrap();
        let waiter = tokio::spawn({
            let token = token.clone();
            async move { token.cancelled().await }
        });
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
