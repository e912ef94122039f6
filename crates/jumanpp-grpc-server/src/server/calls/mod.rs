//! Per-RPC state machines.
//!
//! - [`unary`] - [`UnaryCall`]: one request, one reply.
//! - [`stream`] - [`StreamCall`]: bidirectional stream with pipelined
//!   analysis and in-order replies.
//! - [`output`] - [`LatticeDumpFormatter`], turning results into replies.
//!
//! What a call does with an analysis result is decided by its [`CallKind`].

pub mod output;
pub mod stream;
pub mod unary;

pub use output::LatticeDumpFormatter;
pub use stream::StreamCall;
pub use unary::UnaryCall;

use crate::server::cache::CachedAnalyzer;
use jumanpp_grpc_core::{
    Result,
    proto::{JumanppConfig, LatticeDump},
};

/// The method-specific part of a call.
pub trait CallKind: Send + 'static {
    type Reply: Send + 'static;

    fn name(&self) -> &'static str;

    /// Whether analyzers must keep every feature for this method.
    fn all_features(&self) -> bool;

    /// Turns the analyzer's current result into a reply.
    fn handle_output(
        &mut self,
        analyzer: &CachedAnalyzer,
        config: &JumanppConfig,
    ) -> Result<Self::Reply>;
}

/// `LatticeDump` and `LatticeDumpWithFeatures`, unary or streaming.
#[derive(Debug)]
pub struct LatticeDumpCall {
    formatter: LatticeDumpFormatter,
    with_features: bool,
}

impl LatticeDumpCall {
    pub const fn plain() -> Self {
        Self {
            formatter: LatticeDumpFormatter::new(false),
            with_features: false,
        }
    }

    pub const fn with_features() -> Self {
        Self {
            formatter: LatticeDumpFormatter::new(true),
            with_features: true,
        }
    }
}

impl CallKind for LatticeDumpCall {
    type Reply = LatticeDump;

    fn name(&self) -> &'static str {
        if self.with_features {
            "lattice_dump_with_features"
        } else {
            "lattice_dump"
        }
    }

    fn all_features(&self) -> bool {
        self.with_features
    }

    fn handle_output(
        &mut self,
        analyzer: &CachedAnalyzer,
        config: &JumanppConfig,
    ) -> Result<LatticeDump> {
        if !self.formatter.is_initialized() {
            self.formatter.initialize(analyzer)?;
        }
        self.formatter.format(analyzer, config.top_n)
    }
}
