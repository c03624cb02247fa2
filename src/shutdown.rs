use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Tokens driven by SIGTERM/SIGINT.
///
/// The first signal cancels `graceful`: the agent records that it left the
/// cluster and drains its loops. A second signal cancels `immediate`, which
/// abandons the leave and exits as soon as possible.
#[derive(Clone)]
pub struct Shutdown {
    pub graceful: CancellationToken,
    pub immediate: CancellationToken,
}

pub fn install_shutdown_handler() -> std::io::Result<Shutdown> {
    let shutdown = Shutdown {
        graceful: CancellationToken::new(),
        immediate: CancellationToken::new(),
    };
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let tokens = shutdown.clone();
    tokio::spawn(async move {
        let mut received = 0u32;
        loop {
            let name = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            };
            received += 1;
            if received == 1 {
                tracing::info!(signal = name, "Leaving the cluster and shutting down");
                tokens.graceful.cancel();
            } else {
                tracing::warn!(signal = name, "Second signal, skipping graceful leave");
                tokens.immediate.cancel();
                return;
            }
        }
    });

    Ok(shutdown)
}
