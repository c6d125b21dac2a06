use tokio::sync::mpsc;

/// Receives errors that occur in background tasks, where there is no caller to return them to.
///
/// Errors are always logged. If the sink was built with a channel, they are also forwarded to it
/// so that the owner of the process may decide how to react. A sink whose receiver has gone away
/// only logs.
#[derive(Clone, Debug, Default)]
pub struct ErrorSink {
    tx: Option<mpsc::UnboundedSender<anyhow::Error>>,
}

impl ErrorSink {
    /// Returns a sink that only logs.
    pub fn log_only() -> Self {
        Self::default()
    }

    /// Returns a sink that forwards errors to the returned receiver.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<anyhow::Error>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn post(&self, error: impl Into<anyhow::Error>) {
        let error = error.into();
        tracing::error!("{error:#}");
        if let Some(tx) = self.tx.as_ref() {
            // The receiver may have been dropped; the error has already been logged.
            let _ = tx.send(error);
        }
    }
}
