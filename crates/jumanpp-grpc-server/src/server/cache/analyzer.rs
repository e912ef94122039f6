use super::reader::{InputReader, PartialReaderTemplate};
use crate::server::backend::{
    AnalysisEnv, AnalysisInput, Analyzer, AnalyzerConfig, Lattice, ScorerDef, ScoringConfig,
};
use jumanpp_grpc_core::{
    Error, Result,
    proto::{AnalysisRequest, JumanppConfig, RequestType},
};
use std::time::Instant;

/// Lifecycle of a cached analyzer.
///
/// `Uninitialized -> InUse -> WithResult -> NotInUse -> InUse -> ...`. A
/// slot only ever goes back to `Uninitialized` when it is first created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnalyzerState {
    Uninitialized,
    InUse,
    WithResult,
    NotInUse,
}

/// Everything that must match for an idle analyzer to be reused as-is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompatibilityKey {
    pub request_type: RequestType,
    pub local_beam: i32,
    pub global_beam_left: i32,
    pub global_beam_right: i32,
    pub global_beam_check: bool,
    pub all_features: bool,
    pub ignore_rnn: bool,
}

impl CompatibilityKey {
    /// # Errors
    ///
    /// Returns [`Error::NotImplemented`] if the request kind is unknown.
    pub fn new(config: &JumanppConfig, request: &AnalysisRequest, all_features: bool) -> Result<Self> {
        Ok(Self {
            request_type: RequestType::from_wire(request.r#type)?,
            local_beam: config.local_beam,
            global_beam_left: config.global_beam_left,
            global_beam_right: config.global_beam_right,
            global_beam_check: config.global_beam_check,
            all_features,
            ignore_rnn: config.ignore_rnn,
        })
    }
}

/// A reusable analyzer plus the bookkeeping the cache needs to decide whether
/// it can serve a request without being rebuilt.
pub struct CachedAnalyzer {
    index: usize,
    state: AnalyzerState,
    key: Option<CompatibilityKey>,
    config: AnalyzerConfig,
    scoring: ScoringConfig,
    analyzer: Option<Box<dyn Analyzer>>,
    reader: Option<InputReader>,
    input: Option<AnalysisInput>,
    comment: String,
    last_used: Option<Instant>,
}

impl CachedAnalyzer {
    pub(super) fn new(index: usize) -> Self {
        Self {
            index,
            state: AnalyzerState::Uninitialized,
            key: None,
            config: AnalyzerConfig::default(),
            scoring: ScoringConfig::default(),
            analyzer: None,
            reader: None,
            input: None,
            comment: String::new(),
            last_used: None,
        }
    }

    pub const fn index(&self) -> usize {
        self.index
    }

    pub const fn state(&self) -> AnalyzerState {
        self.state
    }

    pub const fn has_result(&self) -> bool {
        matches!(self.state, AnalyzerState::WithResult)
    }

    /// The key of the request whose input was read last.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub const fn local_beam(&self) -> i32 {
        self.scoring.beam_size
    }

    pub(super) const fn last_used(&self) -> Option<Instant> {
        self.last_used
    }

    pub(super) const fn set_state(&mut self, state: AnalyzerState) {
        self.state = state;
    }

    pub(super) fn key(&self) -> Option<&CompatibilityKey> {
        self.key.as_ref()
    }

    pub(super) fn invalidate(&mut self) {
        self.key = None;
        self.analyzer = None;
    }

    /// Whether this analyzer can serve a request with `key` without a rebuild.
    ///
    /// The ignore flag only matters when the model has more than one scorer;
    /// with a single scorer both settings produce the same analyzer.
    pub fn is_available_for(&self, key: &CompatibilityKey, env_scorers: usize) -> bool {
        if matches!(self.state, AnalyzerState::InUse | AnalyzerState::WithResult) {
            return false;
        }
        let Some(own) = &self.key else {
            return false;
        };

        if own.request_type != key.request_type
            || own.local_beam != key.local_beam
            || own.global_beam_left != key.global_beam_left
            || own.global_beam_right != key.global_beam_right
            || own.global_beam_check != key.global_beam_check
            || own.all_features != key.all_features
        {
            return false;
        }

        if env_scorers > 1 && (self.scoring.num_scorers == 1) != key.ignore_rnn {
            return false;
        }

        true
    }

    /// Resets the search parameters to the service defaults.
    pub(super) fn set_base_config(
        &mut self,
        defaults: &JumanppConfig,
        env_scorers: usize,
        all_features: bool,
    ) {
        self.config = AnalyzerConfig {
            global_beam_left: defaults.global_beam_left,
            global_beam_right: defaults.global_beam_right,
            global_beam_check: defaults.global_beam_check,
            store_all_features: all_features,
        };
        self.scoring = ScoringConfig {
            beam_size: defaults.local_beam,
            num_scorers: env_scorers,
        };
    }

    /// Applies the per-call configuration on top of the base config.
    pub(super) fn set_proto_config(&mut self, config: &JumanppConfig) {
        self.scoring.beam_size = config.local_beam;
        self.config.global_beam_left = config.global_beam_left;
        self.config.global_beam_right = config.global_beam_right;
        self.config.global_beam_check = config.global_beam_check;
        if config.ignore_rnn {
            self.scoring.num_scorers = 1;
        }
    }

    /// Rebuilds the analyzer from the current configuration.
    pub(super) fn build(&mut self, env: &dyn AnalysisEnv, key: CompatibilityKey) -> Result<()> {
        // Running with fewer scorers than the model has: hand the backend a
        // primary-only definition instead of the full one.
        let reduced: ScorerDef;
        let scorers = if self.scoring.num_scorers == env.scorer_count() {
            env.scorer_def()
        } else {
            reduced = env.scorer_def().primary_only();
            &reduced
        };

        let analyzer = env.build_analyzer(&self.config, &self.scoring, scorers)?;
        self.analyzer = Some(analyzer);
        self.input = None;
        self.key = Some(key);
        self.last_used = Some(Instant::now());
        Ok(())
    }

    /// Parses the request text, replacing the reader if the request kind
    /// differs from the one served last.
    ///
    /// # Errors
    ///
    /// - [`Error::NotImplemented`] for unknown request kinds.
    /// - [`Error::InvalidArgument`] if the text cannot be read.
    pub fn read_input(
        &mut self,
        request: &AnalysisRequest,
        template: &PartialReaderTemplate,
    ) -> Result<()> {
        let kind = RequestType::from_wire(request.r#type)?;
        let reader = match self.reader.take() {
            Some(reader) if reader.kind() == kind => reader,
            _ => InputReader::for_kind(kind, template),
        };

        self.input = None;
        let input = reader.read(&request.sentence);
        self.reader = Some(reader);
        self.input = Some(input?);
        self.comment.clone_from(&request.key);
        self.last_used = Some(Instant::now());
        Ok(())
    }

    /// Runs the analyzer on the last input read.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if nothing was read or analysis failed.
    pub fn analyze(&mut self) -> Result<()> {
        let (Some(analyzer), Some(input)) = (self.analyzer.as_mut(), self.input.as_ref()) else {
            return Err(Error::internal("analyzer has no input to analyze"));
        };
        analyzer.analyze(input)?;
        self.last_used = Some(Instant::now());
        self.state = AnalyzerState::WithResult;
        Ok(())
    }

    /// The lattice of the last analysis, if any.
    pub fn lattice(&self) -> Option<&Lattice> {
        self.analyzer
            .as_deref()
            .filter(|_| self.has_result())
            .map(|a| a.lattice())
    }

    pub fn scorer_weights(&self) -> &[f32] {
        self.analyzer
            .as_deref()
            .map(|a| a.scorer_weights())
            .unwrap_or_default()
    }

    pub fn retains_features(&self) -> bool {
        self.analyzer
            .as_deref()
            .is_some_and(|a| a.retains_features())
    }
}

/// Placeholder left behind in a lease once its analyzer went back to the cache.
impl Default for CachedAnalyzer {
    fn default() -> Self {
        Self::new(0)
    }
}
