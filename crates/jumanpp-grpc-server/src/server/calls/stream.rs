//! Bidirectional streaming call.
//!
//! ```text
//! Initial -> WaitCall -> Working <-> Replying
//!                           \          /
//!                            -> Failed
//! ```
//!
//! `WaitCall` covers the time between accepting the stream and its first
//! message.
//!
//! Every inbound message leases its own analyzer, so several messages of one
//! stream are analyzed in parallel on the compute workers. As soon as a
//! message has been read into its analyzer, the next read is issued (read
//! ahead) and only then is the message analyzed.
//!
//! Replies must still go out in arrival order. Leased analyzers wait in a
//! pending queue: new entries are pushed at the front, replies are taken from
//! the back, and only when the back entry has a result. At most one write is
//! in flight (`Replying`); its completion picks the next reply, and an
//! analysis finishing while no write is in flight starts one.
//!
//! Any error fails the stream for good: every queued analyzer is released,
//! the status is sent once the in-flight write (if any) completes, and the
//! call is disposed. A client half-close lets the queue drain, then ends the
//! stream with `OK`.

use super::CallKind;
use crate::server::{
    cache::AnalyzerLease,
    pool::{Call, CallId, Dispatcher, Event, Progress, Queue, Tag},
    service::env::ServiceEnv,
    telemetry::{
        decrement_streams_inflight, increment_analyses, increment_errors,
        increment_streams_inflight, record_request_duration,
    },
};
use bytes::Bytes;
use core::pin::Pin;
use futures::{Stream, StreamExt};
use jumanpp_grpc_core::{
    Error,
    proto::{AnalysisRequest, JumanppConfig},
};
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc, time::Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Status;

pub type Inbound = Pin<Box<dyn Stream<Item = Result<AnalysisRequest, Status>> + Send>>;
pub type Writer<R> = mpsc::Sender<Result<R, Status>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamPhase {
    Initial,
    WaitCall,
    Working,
    Replying,
    Failed,
}

/// An inbound message waiting for its reply. The lease is out while the
/// message is being analyzed.
struct PendingReply {
    seq: u64,
    lease: Option<AnalyzerLease>,
}

impl PendingReply {
    fn is_ready(&self) -> bool {
        self.lease.as_ref().is_some_and(|l| l.has_result())
    }
}

struct StreamState<K: CallKind> {
    phase: StreamPhase,
    config: Option<JumanppConfig>,
    pending: VecDeque<PendingReply>,
    next_seq: u64,
    input_closed: bool,
    /// Final status held back until the in-flight write completes.
    error: Option<Status>,
    writer: Option<Writer<K::Reply>>,
    kind: K,
}

pub struct StreamCall<K: CallKind> {
    env: Arc<ServiceEnv>,
    header: Option<Bytes>,
    inbound: Arc<tokio::sync::Mutex<Inbound>>,
    cancel: CancellationToken,
    name: &'static str,
    started: Instant,
    state: Mutex<StreamState<K>>,
}

impl<K: CallKind> StreamCall<K> {
    pub fn new(
        env: Arc<ServiceEnv>,
        header: Option<Bytes>,
        inbound: Inbound,
        kind: K,
        writer: Writer<K::Reply>,
        cancel: CancellationToken,
    ) -> Self {
        increment_streams_inflight();
        Self {
            env,
            header,
            inbound: Arc::new(tokio::sync::Mutex::new(inbound)),
            cancel,
            name: kind.name(),
            started: Instant::now(),
            state: Mutex::new(StreamState {
                phase: StreamPhase::Initial,
                config: None,
                pending: VecDeque::new(),
                next_seq: 0,
                input_closed: false,
                error: None,
                writer: Some(writer),
                kind,
            }),
        }
    }

    /// Reads the next inbound message in the background and posts it to the
    /// compute queue. A client that stops listening fails the read.
    fn issue_read(&self, id: CallId, dispatcher: &Dispatcher) {
        let Some(writer) = self.state.lock().writer.clone() else {
            return;
        };
        let inbound = Arc::clone(&self.inbound);
        let cancel = self.cancel.clone();
        let d = dispatcher.clone();

        dispatcher.spawn(async move {
            let next = tokio::select! {
                () = cancel.cancelled() => Some(Err(Status::cancelled("stream abandoned"))),
                () = writer.closed() => Some(Err(Status::cancelled("client stopped receiving"))),
                next = async { inbound.lock().await.next().await } => next,
            };
            drop(writer);
            let event = match next {
                Some(Ok(request)) => Event::new(id, Tag::InputReady(Some(request))),
                None => Event::new(id, Tag::InputReady(None)),
                Some(Err(_status)) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Read on stream {id} failed: {_status}");
                    Event {
                        call: id,
                        tag: Tag::InputReady(None),
                        ok: false,
                    }
                }
            };
            d.post(Queue::Compute, event);
        });
    }

    /// Hands `item` to the transport; its completion comes back as
    /// `OutputReady`.
    fn spawn_write(
        &self,
        st: &StreamState<K>,
        id: CallId,
        item: Result<K::Reply, Status>,
        dispatcher: &Dispatcher,
    ) -> Progress {
        let Some(writer) = st.writer.clone() else {
            return Progress::Done;
        };
        let d = dispatcher.clone();
        dispatcher.spawn(async move {
            let ok = writer.send(item).await.is_ok();
            d.post(
                Queue::Io,
                Event {
                    call: id,
                    tag: Tag::OutputReady,
                    ok,
                },
            );
        });
        Progress::Pending
    }

    /// Terminal failure. Releases every queued analyzer and sends `status`
    /// as soon as no other write is in flight.
    fn fail(
        &self,
        st: &mut StreamState<K>,
        id: CallId,
        status: Status,
        dispatcher: &Dispatcher,
    ) -> Progress {
        if st.phase == StreamPhase::Failed {
            return Progress::Pending;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("{} stream {id} failed: {status}", self.name);
        increment_errors();

        let replying = st.phase == StreamPhase::Replying;
        st.phase = StreamPhase::Failed;
        st.pending.clear();
        self.cancel.cancel();

        if replying {
            st.error = Some(status);
            Progress::Pending
        } else {
            self.spawn_write(st, id, Err(status), dispatcher)
        }
    }

    /// Ends the stream with `OK`.
    fn finish(&self, st: &mut StreamState<K>) -> Progress {
        st.writer = None;
        self.cancel.cancel();
        Progress::Done
    }

    /// Abandons the stream without sending anything more.
    fn abandon(&self, st: &mut StreamState<K>) -> Progress {
        st.pending.clear();
        st.writer = None;
        self.cancel.cancel();
        Progress::Done
    }

    /// Starts the next write if the oldest pending message has its result,
    /// otherwise goes back to waiting.
    fn reply_next(&self, st: &mut StreamState<K>, id: CallId, dispatcher: &Dispatcher) -> Progress {
        if !st.pending.back().is_some_and(PendingReply::is_ready) {
            st.phase = StreamPhase::Working;
            if st.pending.is_empty() && st.input_closed {
                return self.finish(st);
            }
            return Progress::Pending;
        }

        let Some(PendingReply {
            lease: Some(lease), ..
        }) = st.pending.pop_back()
        else {
            return Progress::Pending;
        };

        // No write is in flight from here on, so a failure below is sent
        // right away.
        st.phase = StreamPhase::Working;
        let reply = match st.config.as_ref() {
            Some(config) => st.kind.handle_output(&lease, config),
            None => Err(Error::internal("stream has no configuration")),
        };
        drop(lease);

        match reply {
            Ok(reply) => {
                st.phase = StreamPhase::Replying;
                self.spawn_write(st, id, Ok(reply), dispatcher)
            }
            Err(e) => self.fail(st, id, e.into(), dispatcher),
        }
    }

    fn on_start(&self, id: CallId, dispatcher: &Dispatcher) -> Progress {
        {
            let mut st = self.state.lock();
            if st.phase != StreamPhase::Initial {
                return Progress::Pending;
            }
            st.phase = StreamPhase::WaitCall;
        }
        self.issue_read(id, dispatcher);
        Progress::Pending
    }

    fn on_input(
        &self,
        id: CallId,
        request: Option<AnalysisRequest>,
        ok: bool,
        dispatcher: &Dispatcher,
    ) -> Progress {
        if !ok {
            let mut st = self.state.lock();
            let err = if dispatcher.is_shutting_down() {
                Error::ServiceShutdown
            } else {
                Error::RequestCancelled
            };
            return self.fail(&mut st, id, err.into(), dispatcher);
        }

        let Some(request) = request else {
            let mut st = self.state.lock();
            st.input_closed = true;
            let idle = matches!(st.phase, StreamPhase::WaitCall | StreamPhase::Working);
            if idle && st.pending.is_empty() {
                return self.finish(&mut st);
            }
            return Progress::Pending;
        };

        let (config, all_features) = {
            let mut st = self.state.lock();
            match st.phase {
                StreamPhase::Failed => return Progress::Pending,
                StreamPhase::Initial | StreamPhase::WaitCall => st.phase = StreamPhase::Working,
                StreamPhase::Working | StreamPhase::Replying => {}
            }
            let config = match &st.config {
                Some(config) => config.clone(),
                None => match self.env.decode_config(self.header.as_ref()) {
                    Ok(config) => {
                        st.config = Some(config.clone());
                        config
                    }
                    Err(e) => return self.fail(&mut st, id, e.into(), dispatcher),
                },
            };
            (config, st.kind.all_features())
        };

        // Acquisition may rebuild an analyzer; keep the stream unlocked.
        let leased = self
            .env
            .analyzers()
            .acquire(&config, &request, all_features)
            .and_then(|mut lease| lease.read_input(&request).map(|()| lease));
        let mut lease = match leased {
            Ok(lease) => lease,
            Err(e) => {
                let mut st = self.state.lock();
                return self.fail(&mut st, id, e.into(), dispatcher);
            }
        };

        let seq = {
            let mut st = self.state.lock();
            if st.phase == StreamPhase::Failed {
                return Progress::Pending;
            }
            let seq = st.next_seq;
            st.next_seq += 1;
            st.pending.push_front(PendingReply { seq, lease: None });
            seq
        };

        self.issue_read(id, dispatcher);

        let analyzed = lease.analyze();

        let mut st = self.state.lock();
        if st.phase == StreamPhase::Failed {
            return Progress::Pending;
        }
        if let Err(e) = analyzed {
            st.pending.retain(|p| p.seq != seq);
            drop(lease);
            return self.fail(&mut st, id, e.into(), dispatcher);
        }

        increment_analyses();
        if let Some(entry) = st.pending.iter_mut().find(|p| p.seq == seq) {
            entry.lease = Some(lease);
        }
        if st.phase == StreamPhase::Working {
            return self.reply_next(&mut st, id, dispatcher);
        }
        Progress::Pending
    }

    fn on_output(&self, id: CallId, ok: bool, dispatcher: &Dispatcher) -> Progress {
        let mut st = self.state.lock();
        if !ok {
            #[cfg(feature = "tracing")]
            tracing::debug!("{} stream {id}: client stopped receiving", self.name);
            return self.abandon(&mut st);
        }

        if st.phase == StreamPhase::Failed {
            if let Some(status) = st.error.take() {
                return self.spawn_write(&st, id, Err(status), dispatcher);
            }
            return self.abandon(&mut st);
        }

        self.reply_next(&mut st, id, dispatcher)
    }
}

impl<K: CallKind> Call for StreamCall<K> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn proceed(&self, id: CallId, tag: Tag, ok: bool, dispatcher: &Dispatcher) -> Progress {
        match tag {
            Tag::Start => self.on_start(id, dispatcher),
            Tag::InputReady(request) => self.on_input(id, request, ok, dispatcher),
            Tag::OutputReady => self.on_output(id, ok, dispatcher),
            Tag::Compute => Progress::Pending,
        }
    }
}

impl<K: CallKind> Drop for StreamCall<K> {
    fn drop(&mut self) {
        self.cancel.cancel();
        decrement_streams_inflight();
        record_request_duration(self.started.elapsed().as_secs_f64() * 1000.0);
    }
}
