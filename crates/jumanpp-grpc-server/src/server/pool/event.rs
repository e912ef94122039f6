use super::manager::Dispatcher;
use jumanpp_grpc_core::proto::AnalysisRequest;
use tokio::sync::oneshot;

/// Stable handle of a live call in the [`Dispatcher`] arena.
pub type CallId = u64;

/// What just happened to a call.
pub enum Tag {
    /// The call was accepted.
    Start,
    /// A unary call is ready to run its analysis.
    Compute,
    /// A read on the inbound stream completed; `None` once the client
    /// half-closed (or, with `ok == false`, the read failed).
    InputReady(Option<AnalysisRequest>),
    /// The last reply (or final status) was handed to the transport.
    OutputReady,
}

impl Tag {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Compute => "compute",
            Self::InputReady(_) => "input_ready",
            Self::OutputReady => "output_ready",
        }
    }
}

/// A completion delivered to a call, with its success flag.
pub struct Event {
    pub call: CallId,
    pub tag: Tag,
    pub ok: bool,
}

impl Event {
    pub const fn new(call: CallId, tag: Tag) -> Self {
        Self { call, tag, ok: true }
    }
}

/// A message sent from the [`Dispatcher`] to an individual worker.
pub enum WorkRequest {
    /// Advance the call the event belongs to.
    Event(Event),

    /// Request the worker to shut down gracefully.
    ///
    /// - `response`: One-shot channel for acknowledging that the worker has
    ///   completed its shutdown routine.
    Shutdown { response: oneshot::Sender<()> },
}

/// Which workers should handle an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Queue {
    /// Accept, read and write completions. Must never block.
    Io,
    /// Analyzer acquisition and analysis.
    Compute,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    Pending,
    /// The call reached its terminal state and can be disposed.
    Done,
}

/// A per-RPC state machine driven by the dispatch loop.
///
/// Events for the same call may arrive concurrently from both queues, so
/// implementations keep their mutable state behind a lock.
pub trait Call: Send + Sync {
    fn name(&self) -> &'static str;

    fn proceed(&self, id: CallId, tag: Tag, ok: bool, dispatcher: &Dispatcher) -> Progress;
}
