//! Wire messages and generated service stubs for `jumanpp.grpc.JumanppJumandic`.
//!
//! Messages are declared with `prost` derives; the client and server modules
//! (`jumanpp_jumandic_client`, `jumanpp_jumandic_server`) are generated by the
//! build script and included at the bottom of this module.

/// Input format of an [`AnalysisRequest`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum RequestType {
    /// A single line of raw text.
    Normal = 0,
    /// Raw text interleaved with tab-prefixed, pre-annotated morphemes.
    PartialAnnotation = 1,
}

/// A single sentence to analyze.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AnalysisRequest {
    #[prost(string, tag = "1")]
    pub sentence: String,
    /// Free-text label echoed back as the reply's `comment`.
    #[prost(string, tag = "2")]
    pub key: String,
    #[prost(enumeration = "RequestType", tag = "3")]
    pub r#type: i32,
}

/// Per-call analyzer configuration.
///
/// Sent by clients as a serialized override in the `jumanpp-config-bin`
/// metadata entry and merged over the service defaults.
#[derive(Clone, PartialEq, prost::Message)]
pub struct JumanppConfig {
    #[prost(int32, tag = "1")]
    pub local_beam: i32,
    #[prost(int32, tag = "2")]
    pub global_beam_left: i32,
    #[prost(int32, tag = "3")]
    pub global_beam_right: i32,
    #[prost(bool, tag = "4")]
    pub global_beam_check: bool,
    /// Score with the primary scorer only.
    #[prost(bool, tag = "5")]
    pub ignore_rnn: bool,
    /// Number of ranked paths to report per node; `0` reports all of them.
    #[prost(int32, tag = "6")]
    pub top_n: i32,
}

/// The analysis lattice of one sentence.
#[derive(Clone, PartialEq, prost::Message)]
pub struct LatticeDump {
    #[prost(string, tag = "1")]
    pub surface: String,
    #[prost(string, tag = "2")]
    pub comment: String,
    #[prost(message, repeated, tag = "3")]
    pub nodes: Vec<LatticeNode>,
    #[prost(float, repeated, tag = "4")]
    pub scorer_weights: Vec<f32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LatticeNode {
    /// Character offset of the node in the sentence.
    #[prost(uint32, tag = "1")]
    pub boundary: u32,
    /// Length of the node in characters.
    #[prost(uint32, tag = "2")]
    pub length: u32,
    #[prost(string, tag = "3")]
    pub surface: String,
    #[prost(string, tag = "4")]
    pub tag: String,
    /// Ranks of the scored paths that go through this node.
    #[prost(int32, repeated, tag = "5")]
    pub ranks: Vec<i32>,
    /// Per-scorer contributions.
    #[prost(float, repeated, tag = "6")]
    pub scores: Vec<f32>,
    #[prost(float, tag = "7")]
    pub score: f32,
    /// Feature hashes; only populated by the `WithFeatures` methods.
    #[prost(uint64, repeated, tag = "8")]
    pub features: Vec<u64>,
}

include!(concat!(env!("OUT_DIR"), "/jumanpp.grpc.JumanppJumandic.rs"));
