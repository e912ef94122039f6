//! Boundary to the analysis engine.
//!
//! The serving layer treats analysis as an opaque, heavyweight compute step.
//! An [`AnalysisEnv`] is the process-wide, read-only model handle; it builds
//! [`Analyzer`] instances that the analyzer cache keeps around and re-purposes
//! between requests.
//!
//! - [`charclass`] - Reference backend used by the server binary.

pub mod charclass;

use jumanpp_grpc_core::Error;
use serde::Deserialize;

/// Errors reported by an analysis backend.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BackendError {
    /// The input text could not be read.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The analyzer cannot be built with the requested configuration.
    #[error("invalid analyzer config: {0}")]
    InvalidConfig(String),

    /// Analysis itself failed.
    #[error("analysis failed: {0}")]
    Failed(String),
}

/// Unreadable input is the client's fault; everything else is ours.
impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::InvalidInput(reason) => Self::InvalidArgument { reason },
            BackendError::InvalidConfig(context) | BackendError::Failed(context) => {
                Self::Internal { context }
            }
        }
    }
}

/// A single feature scorer and its mixing weight.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ScorerSpec {
    pub name: String,
    pub weight: f32,
}

/// The scorers an analyzer combines. The first one is the primary scorer.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct ScorerDef {
    pub scorers: Vec<ScorerSpec>,
}

impl ScorerDef {
    pub fn len(&self) -> usize {
        self.scorers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scorers.is_empty()
    }

    /// Keeps only the primary scorer, reusing its weight.
    pub fn primary_only(&self) -> Self {
        Self {
            scorers: self.scorers.iter().take(1).cloned().collect(),
        }
    }

    pub fn weights(&self) -> Vec<f32> {
        self.scorers.iter().map(|s| s.weight).collect()
    }
}

/// Search parameters that are fixed for the lifetime of a built analyzer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AnalyzerConfig {
    pub global_beam_left: i32,
    pub global_beam_right: i32,
    pub global_beam_check: bool,
    /// Keep every intermediate feature so a full dump can be produced.
    pub store_all_features: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScoringConfig {
    pub beam_size: i32,
    pub num_scorers: usize,
}

/// A pre-annotated span of a partially annotated sentence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Annotation {
    pub surface: String,
    pub fields: Vec<(String, String)>,
}

impl Annotation {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    Raw(String),
    Annotated(Annotation),
}

/// A sentence whose morphemes are partially fixed by the client.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartialExample {
    pub segments: Vec<Segment>,
}

impl PartialExample {
    pub fn surface(&self) -> String {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Raw(text) => text.as_str(),
                Segment::Annotated(a) => a.surface.as_str(),
            })
            .collect()
    }
}

/// Parsed input ready to be fed into an [`Analyzer`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnalysisInput {
    Plain(String),
    Partial(PartialExample),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LatticeNode {
    /// Character offset.
    pub boundary: usize,
    /// Length in characters.
    pub length: usize,
    pub surface: String,
    pub tag: String,
    /// One entry per active scorer.
    pub scores: Vec<f32>,
    /// Empty unless the analyzer stores all features.
    pub features: Vec<u64>,
}

impl LatticeNode {
    pub fn score(&self) -> f32 {
        self.scores.iter().sum()
    }
}

/// A segmentation of the sentence, as indices into [`Lattice::nodes`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScoredPath {
    pub nodes: Vec<usize>,
    pub score: f32,
}

/// Result of analyzing one sentence. Paths are ordered best first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Lattice {
    pub surface: String,
    pub nodes: Vec<LatticeNode>,
    pub paths: Vec<ScoredPath>,
}

/// Process-wide model handle shared by every analyzer.
pub trait AnalysisEnv: Send + Sync {
    /// Scorers configured for the loaded model.
    fn scorer_def(&self) -> &ScorerDef;

    fn scorer_count(&self) -> usize {
        self.scorer_def().len()
    }

    /// Field names accepted in partial annotations.
    fn field_names(&self) -> &[String];

    /// Builds a fresh analyzer for the given configuration.
    ///
    /// `scorers` is either [`AnalysisEnv::scorer_def`] or a reduced copy of it
    /// when the analyzer runs with fewer scorers than the model provides.
    fn build_analyzer(
        &self,
        config: &AnalyzerConfig,
        scoring: &ScoringConfig,
        scorers: &ScorerDef,
    ) -> Result<Box<dyn Analyzer>, BackendError>;
}

/// A reusable, stateful analysis engine instance.
pub trait Analyzer: Send {
    /// Analyzes `input`, replacing the previous result.
    fn analyze(&mut self, input: &AnalysisInput) -> Result<(), BackendError>;

    /// The lattice produced by the last successful [`Analyzer::analyze`].
    fn lattice(&self) -> &Lattice;

    fn scorer_weights(&self) -> &[f32];

    fn retains_features(&self) -> bool;
}
