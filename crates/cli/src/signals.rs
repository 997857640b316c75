use flume::Sender;
use tokio::signal::unix::{SignalKind, signal};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// SIGINT or SIGTERM: stop the watcher and exit.
    Shutdown,
    /// SIGUSR1: log the current metrics.
    DumpMetrics,
}

/// Forward process signals to `tx` until the receiver goes away.
pub async fn wait_for_signal(tx: Sender<SignalEvent>) -> anyhow::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    loop {
        let event = tokio::select! {
            _ = sigint.recv() => SignalEvent::Shutdown,
            _ = sigterm.recv() => SignalEvent::Shutdown,
            _ = sigusr1.recv() => SignalEvent::DumpMetrics,
        };
        debug!(?event, "received signal");
        tx.send_async(event).await?;
    }
}
