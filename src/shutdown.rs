use std::future::Future;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Stop token for one worker process, cancelled on SIGTERM or SIGINT.
///
/// A leader drains its jobs and releases the lease when this fires, so a
/// standby can take over without waiting for the ttl.
pub fn install_shutdown_handler(worker_id: &str) -> std::io::Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let token = CancellationToken::new();
    let signalled = async move {
        tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        }
    };
    tokio::spawn(cancel_on(token.clone(), worker_id.to_string(), signalled));
    Ok(token)
}

/// Cancel `token` once `signalled` resolves. Returns early if the token is
/// cancelled some other way.
async fn cancel_on<F>(token: CancellationToken, worker_id: String, signalled: F)
where
    F: Future<Output = &'static str>,
{
    tokio::select! {
        _ = token.cancelled() => {}
        name = signalled => {
            tracing::info!(worker_id = %worker_id, signal = name, "Stopping worker");
            token.cancel();
        }
    }
}
