use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Exit status used when a second signal cuts cleanup short.
const FORCED_EXIT_STATUS: i32 = 130;

/// Cancel the returned token on the first SIGTERM or SIGINT.
///
/// The first signal lets the CLI kill whatever it submitted. A second one
/// exits the process immediately, leaving scheduler jobs behind.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let cancel = token.clone();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        let name = next_signal(&mut sigterm, &mut sigint).await;
        tracing::info!(signal = name, "Shutting down, cancelling submitted jobs");
        cancel.cancel();

        let name = next_signal(&mut sigterm, &mut sigint).await;
        tracing::warn!(signal = name, "Second signal, exiting without cleanup");
        std::process::exit(FORCED_EXIT_STATUS);
    });

    Ok(token)
}

async fn next_signal(sigterm: &mut Signal, sigint: &mut Signal) -> &'static str {
    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    }
}
