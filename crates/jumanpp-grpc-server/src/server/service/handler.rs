//! gRPC service implementation for Juman++ lattice analysis.
//!
//! This module defines [`AnalysisService`], the concrete implementation of the
//! [`JumanppJumandic`] gRPC service. Every RPC is turned into a call object
//! ([`UnaryCall`] or [`StreamCall`]) and handed to the [`Dispatcher`], which
//! drives it to completion over the I/O and compute queues.
//!
//! ## Responsibilities
//!
//! - Build the shared [`ServiceEnv`] and start the dispatcher.
//! - Extract the binary configuration header from call metadata.
//! - Bridge call replies back to tonic (oneshot for unary calls, a bounded
//!   channel for streams).
//! - Graceful shutdown.

use crate::server::{
    backend::AnalysisEnv,
    calls::{CallKind, LatticeDumpCall, StreamCall, UnaryCall, stream::Inbound},
    config::ServerConfig,
    pool::Dispatcher,
    service::env::ServiceEnv,
    telemetry::increment_requests,
};
use bytes::Bytes;
use core::pin::Pin;
use jumanpp_grpc_core::{
    Error,
    proto::{AnalysisRequest, LatticeDump, jumanpp_jumandic_server::JumanppJumandic},
    types::CONFIG_HEADER,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tonic::{Request, Response, Status, Streaming, metadata::MetadataMap};

pub type ReplyStream<R> = Pin<Box<dyn Stream<Item = Result<R, Status>> + Send>>;

/// Juman++ analysis over gRPC.
///
/// Cheap to clone; clones share the environment and the dispatcher.
#[derive(Clone)]
pub struct AnalysisService {
    env: Arc<ServiceEnv>,
    dispatcher: Dispatcher,
    stream_buffer_size: usize,
}

impl AnalysisService {
    /// Creates the service environment around `backend` and starts the
    /// dispatcher's workers.
    ///
    /// # Errors
    ///
    /// Fails if the default configuration or cache capacity is invalid, or
    /// the workers cannot be started.
    pub fn new(config: &ServerConfig, backend: Arc<dyn AnalysisEnv>) -> Result<Self, Error> {
        let env = ServiceEnv::initialize(backend, config.model.defaults(), config.cache_capacity)?;
        let dispatcher = Dispatcher::start(
            config.io_workers,
            config.num_workers,
            config.shutdown_timeout,
        )?;

        Ok(Self {
            env: Arc::new(env),
            dispatcher,
            stream_buffer_size: config.stream_buffer_size,
        })
    }

    /// Runs a unary call and waits for its reply.
    pub async fn unary<K: CallKind>(
        &self,
        kind: K,
        header: Option<Bytes>,
        request: AnalysisRequest,
    ) -> Result<K::Reply, Status> {
        let (replier, reply) = oneshot::channel();
        let call = UnaryCall::new(Arc::clone(&self.env), header, request, kind, replier);
        self.dispatcher.accept(Arc::new(call))?;

        // The call is only ever dropped without replying when the dispatcher
        // abandons it on shutdown.
        reply.await.map_err(|_| Status::from(Error::ServiceShutdown))?
    }

    /// Starts a streaming call over `inbound` and returns its replies.
    ///
    /// Replies arrive in the order of the inbound messages. The stream ends
    /// after the client half-closes and every reply was sent, or with the
    /// first error.
    pub fn open_stream<K: CallKind>(
        &self,
        kind: K,
        header: Option<Bytes>,
        inbound: Inbound,
    ) -> Result<ReplyStream<K::Reply>, Status> {
        let (writer, replies) = mpsc::channel(self.stream_buffer_size);
        let call = StreamCall::new(
            Arc::clone(&self.env),
            header,
            inbound,
            kind,
            writer,
            self.dispatcher.call_token(),
        );
        self.dispatcher.accept(Arc::new(call))?;
        Ok(Box::pin(ReceiverStream::new(replies)))
    }

    /// Initiates a graceful shutdown of the dispatcher.
    ///
    /// New calls are refused, in-flight calls get the configured grace
    /// period, and the call returns once every worker acknowledged.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.dispatcher.shutdown().await
    }
}

/// The raw `jumanpp-config-bin` entry, if the client sent one.
fn config_header(metadata: &MetadataMap) -> Result<Option<Bytes>, Status> {
    metadata
        .get_bin(CONFIG_HEADER)
        .map(|value| {
            value
                .to_bytes()
                .map_err(|_| Error::invalid_argument("config header is not valid base64").into())
        })
        .transpose()
}

#[tonic::async_trait]
impl JumanppJumandic for AnalysisService {
    type LatticeDumpStreamStream = ReplyStream<LatticeDump>;
    type LatticeDumpWithFeaturesStreamStream = ReplyStream<LatticeDump>;

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(key = %req.get_ref().key)))]
    async fn lattice_dump(
        &self,
        req: Request<AnalysisRequest>,
    ) -> Result<Response<LatticeDump>, Status> {
        increment_requests("lattice_dump");
        let header = config_header(req.metadata())?;
        let reply = self
            .unary(LatticeDumpCall::plain(), header, req.into_inner())
            .await?;
        Ok(Response::new(reply))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(key = %req.get_ref().key)))]
    async fn lattice_dump_with_features(
        &self,
        req: Request<AnalysisRequest>,
    ) -> Result<Response<LatticeDump>, Status> {
        increment_requests("lattice_dump_with_features");
        let header = config_header(req.metadata())?;
        let reply = self
            .unary(LatticeDumpCall::with_features(), header, req.into_inner())
            .await?;
        Ok(Response::new(reply))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
    async fn lattice_dump_stream(
        &self,
        req: Request<Streaming<AnalysisRequest>>,
    ) -> Result<Response<Self::LatticeDumpStreamStream>, Status> {
        increment_requests("lattice_dump_stream");
        let header = config_header(req.metadata())?;
        let replies =
            self.open_stream(LatticeDumpCall::plain(), header, Box::pin(req.into_inner()))?;
        Ok(Response::new(replies))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
    async fn lattice_dump_with_features_stream(
        &self,
        req: Request<Streaming<AnalysisRequest>>,
    ) -> Result<Response<Self::LatticeDumpWithFeaturesStreamStream>, Status> {
        increment_requests("lattice_dump_with_features_stream");
        let header = config_header(req.metadata())?;
        let replies = self.open_stream(
            LatticeDumpCall::with_features(),
            header,
            Box::pin(req.into_inner()),
        )?;
        Ok(Response::new(replies))
    }
}
