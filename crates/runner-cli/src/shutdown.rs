use tokio_util::sync::CancellationToken;

/// Waits for either SIGINT or SIGTERM, then cancels `token` once. The
/// runner's own loops (`heartbeat`/`poll`/`dispatch`) watch this token
/// and abandon in-flight tasks rather than waiting for them to finish
/// (spec §4.9).
pub async fn wait_for_shutdown_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                token.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    token.cancel();
}
