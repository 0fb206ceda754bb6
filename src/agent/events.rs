use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Progress notifications for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Chunk(String),
    ToolCallStarted(String),
    ToolResult { name: String, output: String },
    Finished(String),
    Error(String),
}

pub type EventSender = mpsc::UnboundedSender<AgentEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<AgentEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Sends events until the request is cancelled, then drops them.
#[derive(Clone, Copy)]
pub(crate) struct Notifier<'a> {
    tx: &'a EventSender,
    cancel: &'a CancellationToken,
}

impl<'a> Notifier<'a> {
    pub(crate) fn new(tx: &'a EventSender, cancel: &'a CancellationToken) -> Self {
        Self { tx, cancel }
    }

    /// Returns false when the event was dropped because of cancellation.
    pub(crate) fn emit(&self, event: AgentEvent) -> bool {
        if self.cancel.is_cancelled() {
            trace!(?event, "dropping event after cancellation");
            return false;
        }
        // receiver gone means nobody is listening any more
        let _ = self.tx.send(event);
        true
    }
}
