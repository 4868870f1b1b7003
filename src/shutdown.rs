
use std::{future::Future, io};

use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

/// Installs SIGINT and SIGTERM handlers and returns a future that resolves
/// on whichever arrives first. The handlers are registered before this
/// returns, so a signal delivered before the future is polled is not lost.
pub fn shutdown_signal() -> io::Result<impl Future<Output = ()> + Send + 'static> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => info!("received SIGINT"),
            _ = terminate.recv() => info!("received SIGTERM"),
        }
    })
}
