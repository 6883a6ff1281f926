//! Activation events
//!
//! External triggers (a hardware token, a watched file, an operator
//! process) feed `ActivationEvent`s into a channel. The listener turns them
//! into assemble or lockdown calls on the runtime, one at a time.

use crate::runtime::Cynapse;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationEvent {
    /// Reassemble a secret to prove the media are present and intact.
    Assemble { secret_id: String, threshold: Option<u8> },
    Lockdown { reason: String },
}

pub fn channel(buffer: usize) -> (mpsc::Sender<ActivationEvent>, mpsc::Receiver<ActivationEvent>) {
    mpsc::channel(buffer.max(1))
}

/// Drain `events` until every sender is dropped or a lockdown is handled.
/// Returns the number of events processed.
pub async fn listen(runtime: Arc<Cynapse>, mut events: mpsc::Receiver<ActivationEvent>) -> usize {
    let mut handled = 0;
    while let Some(event) = events.recv().await {
        handled += 1;
        match event {
            ActivationEvent::Assemble { secret_id, threshold } => {
                let rt = Arc::clone(&runtime);
                let id = secret_id.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    rt.assemble(&id, threshold).map(|session| session.len())
                })
                .await;
                match outcome {
                    // The session drops (and wipes) inside the task.
                    Ok(Ok(bytes)) => info!(secret_id = %secret_id, bytes, "Activation assembled secret"),
                    Ok(Err(e)) => warn!(secret_id = %secret_id, error = %e, "Activation assemble failed"),
                    Err(e) => error!(secret_id = %secret_id, error = %e, "Activation task failed"),
                }
            }
            ActivationEvent::Lockdown { reason } => {
                if let Err(e) = runtime.lockdown(&reason) {
                    error!(error = %e, "Lockdown could not be recorded");
                }
                break;
            }
        }
    }
    handled
}

/// Install SIGTERM and Ctrl-C handlers that turn the first signal into a
/// lockdown event. The SIGTERM handler is registered before this returns,
/// so the default action no longer applies once the future exists.
pub fn forward_signals(
    events: mpsc::Sender<ActivationEvent>,
) -> std::io::Result<impl Future<Output = ()> + Send + 'static> {
    #[cfg(unix)]
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    Ok(async move {
        let interrupt = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Ctrl-C handler unavailable");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let reason = tokio::select! {
            _ = term.recv() => "terminate signal",
            _ = interrupt => "interrupt",
        };
        #[cfg(not(unix))]
        let reason = {
            interrupt.await;
            "interrupt"
        };

        info!(reason, "Signal received, requesting lockdown");
        let _ = events
            .send(ActivationEvent::Lockdown {
                reason: reason.to_string(),
            })
            .await;
    })
}
