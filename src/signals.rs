/// Signal handling for graceful shutdown.
///
/// First SIGINT or SIGTERM: trigger [`Shutdown`], which the daemon loop honors
/// between states, while sleeping, and during a running session.
/// Second signal: exit immediately.
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

/// Cancellation token observed by the daemon loop.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// The sending half of a [`Shutdown`] token.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

impl Shutdown {
    /// A token that is never triggered.
    #[cfg(test)]
    pub fn never() -> Self {
        let (_trigger, shutdown) = channel();
        shutdown
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been requested.
    ///
    /// If every trigger is dropped without firing, this never resolves.
    pub async fn wait(&mut self) {
        if self.rx.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Install SIGINT/SIGTERM handlers and return the token they trigger.
pub fn install() -> std::io::Result<Shutdown> {
    let (trigger, shutdown) = channel();
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down after current step"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down after current step"),
        }
        trigger.trigger();

        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        tracing::warn!("second signal received, exiting immediately");
        std::process::exit(130);
    });

    Ok(shutdown)
}
