//! Unary call: `Created -> Compute -> Finished`.
//!
//! The start event arrives on the I/O queue and only forwards the call to the
//! compute queue, where the whole request is handled in one step: decode the
//! config header, lease an analyzer, read, analyze, format and reply. The
//! lease is scoped to that step, so it is released on every path. Once the
//! reply is handed off, an `OutputReady` event is posted back and the call is
//! disposed when the loop delivers it.

use super::CallKind;
use crate::server::{
    pool::{Call, CallId, Dispatcher, Event, Progress, Queue, Tag},
    service::env::ServiceEnv,
    telemetry::{increment_analyses, increment_errors, record_request_duration},
};
use bytes::Bytes;
use jumanpp_grpc_core::{Result, proto::AnalysisRequest};
use parking_lot::Mutex;
use std::{sync::Arc, time::Instant};
use tokio::sync::oneshot;
use tonic::Status;

pub type Replier<R> = oneshot::Sender<core::result::Result<R, Status>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UnaryPhase {
    Created,
    Compute,
    Finished,
}

struct UnaryState<K: CallKind> {
    phase: UnaryPhase,
    kind: K,
    replier: Option<Replier<K::Reply>>,
}

pub struct UnaryCall<K: CallKind> {
    env: Arc<ServiceEnv>,
    header: Option<Bytes>,
    request: AnalysisRequest,
    name: &'static str,
    started: Instant,
    state: Mutex<UnaryState<K>>,
}

impl<K: CallKind> UnaryCall<K> {
    pub fn new(
        env: Arc<ServiceEnv>,
        header: Option<Bytes>,
        request: AnalysisRequest,
        kind: K,
        replier: Replier<K::Reply>,
    ) -> Self {
        Self {
            env,
            header,
            request,
            name: kind.name(),
            started: Instant::now(),
            state: Mutex::new(UnaryState {
                phase: UnaryPhase::Created,
                kind,
                replier: Some(replier),
            }),
        }
    }

    fn handle_call(&self, kind: &mut K) -> Result<K::Reply> {
        let config = self.env.decode_config(self.header.as_ref())?;
        let mut analyzer =
            self.env
                .analyzers()
                .acquire(&config, &self.request, kind.all_features())?;
        analyzer.read_input(&self.request)?;
        analyzer.analyze()?;
        increment_analyses();
        kind.handle_output(&analyzer, &config)
    }
}

impl<K: CallKind> Call for UnaryCall<K> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn proceed(&self, id: CallId, tag: Tag, _ok: bool, dispatcher: &Dispatcher) -> Progress {
        let mut st = self.state.lock();
        match (st.phase, tag) {
            (UnaryPhase::Created, Tag::Start) => {
                st.phase = UnaryPhase::Compute;
                dispatcher.post(Queue::Compute, Event::new(id, Tag::Compute));
                Progress::Pending
            }
            (UnaryPhase::Compute, Tag::Compute) => {
                st.phase = UnaryPhase::Finished;
                let Some(replier) = st.replier.take() else {
                    return Progress::Done;
                };
                if replier.is_closed() {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Client left {} call {id} before it was computed", self.name);
                    return Progress::Done;
                }

                let st = &mut *st;
                let reply = self.handle_call(&mut st.kind).map_err(|e| {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("{} call {id} failed: {e}", self.name);
                    increment_errors();
                    Status::from(e)
                });
                record_request_duration(self.started.elapsed().as_secs_f64() * 1000.0);

                let ok = replier.send(reply).is_ok();
                dispatcher.post(
                    Queue::Io,
                    Event {
                        call: id,
                        tag: Tag::OutputReady,
                        ok,
                    },
                );
                Progress::Pending
            }
            (UnaryPhase::Finished, _) => Progress::Done,
            (_phase, _tag) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "{} call {id} got {} in {:?}",
                    self.name,
                    _tag.name(),
                    _phase
                );
                Progress::Pending
            }
        }
    }
}
