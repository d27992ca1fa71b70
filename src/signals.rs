use super::Result;

use std::pin::Pin;

use futures::stream::{select_all, Stream, StreamExt};
use tokio::signal::unix::{signal, SignalKind};
use tokio_stream::wrappers::SignalStream;

/// Signals that ask a process to shut down
const SHUTDOWN_SIGNALS: [SignalKind; 2] = [SignalKind::interrupt(), SignalKind::terminate()];

/// Merged stream of shutdown signals.
///
/// Each item is the signal that arrived, so callers can log which one.
pub struct Signals {
    stream: Pin<Box<dyn Stream<Item = SignalKind> + Send>>,
}

impl Signals {
    pub fn new() -> Result<Self> {
        let mut signal_streams = Vec::with_capacity(SHUTDOWN_SIGNALS.len());
        for kind in SHUTDOWN_SIGNALS {
            let stream = SignalStream::new(signal(kind)?).map(move |_| kind);
            signal_streams.push(stream);
        }

        Ok(Signals {
            stream: Box::pin(select_all(signal_streams)),
        })
    }

    /// Waits for the next shutdown signal
    pub async fn next(&mut self) -> Option<SignalKind> {
        self.stream.next().await
    }
}

/// Human-readable name of a shutdown signal for logs
pub fn signal_name(kind: SignalKind) -> &'static str {
    if kind == SignalKind::interrupt() {
        "SIGINT"
    } else if kind == SignalKind::terminate() {
        "SIGTERM"
    } else {
        "signal"
    }
}
