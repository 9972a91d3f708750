use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Exit status used when a second signal forces the process down.
pub const FORCED_EXIT_CODE: i32 = 130;

/// Install a handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal arrives.
/// The batch runner watches it and stops dispatching new jobs. A second signal
/// exits the process immediately with [`FORCED_EXIT_CODE`].
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::error!(error = %e, "Failed to install signal handlers");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping batch");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, stopping batch");
            }
        }

        token_clone.cancel();

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        tracing::warn!("Received second signal, exiting without waiting for running jobs");
        std::process::exit(FORCED_EXIT_CODE);
    });

    token
}
