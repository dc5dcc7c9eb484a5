use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Turns SIGTERM or SIGINT into a cancelled [`CancellationToken`].
///
/// The HTTP server awaits [`SigDown::graceful`] so in-flight settlements
/// finish their current polling round before the process exits.
pub struct SigDown {
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl SigDown {
    pub fn try_new() -> Result<Self, std::io::Error> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let token = CancellationToken::new();
        let task_tracker = TaskTracker::new();
        let listener_token = token.clone();
        task_tracker.spawn(async move {
            let signal_name = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
                _ = listener_token.cancelled() => return,
            };
            tracing::info!(signal = signal_name, "Shutdown signal received");
            listener_token.cancel();
        });
        task_tracker.close();
        Ok(Self {
            task_tracker,
            cancellation_token: token,
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Resolves once shutdown was requested and the listener task has exited.
    pub fn graceful(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.cancellation_token.clone();
        let tracker = self.task_tracker.clone();
        async move {
            token.cancelled().await;
            tracker.wait().await;
        }
    }
}
