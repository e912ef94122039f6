//! Scripted analysis backend for engine tests.
//!
//! The analyzer echoes its input as a single-node lattice. Sentences drive its
//! behavior:
//!
//! - `sleep <ms> ...` blocks the compute thread for `<ms>` milliseconds.
//! - `fail ...` makes analysis fail.
//!
//! [`FailingDump`] does the same for output formatting.

use crate::server::{
    backend::{
        AnalysisEnv, AnalysisInput, Analyzer, AnalyzerConfig, BackendError, Lattice, LatticeNode,
        ScoredPath, ScorerDef, ScorerSpec, ScoringConfig,
    },
    cache::{AnalyzerCache, CachedAnalyzer},
    calls::{CallKind, LatticeDumpCall},
};
use jumanpp_grpc_core::{
    Error, Result,
    proto::{AnalysisRequest, JumanppConfig, LatticeDump, RequestType},
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

pub struct ScriptedEnv {
    scorers: ScorerDef,
    fields: Vec<String>,
    builds: AtomicUsize,
    fail_beam: Option<i32>,
}

impl ScriptedEnv {
    pub fn new(num_scorers: usize) -> Self {
        Self {
            scorers: ScorerDef {
                scorers: (0..num_scorers)
                    .map(|i| ScorerSpec {
                        name: format!("scorer{i}"),
                        weight: 1.0 / (i + 1) as f32,
                    })
                    .collect(),
            },
            fields: vec!["pos".into()],
            builds: AtomicUsize::new(0),
            fail_beam: None,
        }
    }

    /// Makes every build with this local beam fail.
    pub fn failing_on_beam(mut self, beam: i32) -> Self {
        self.fail_beam = Some(beam);
        self
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl AnalysisEnv for ScriptedEnv {
    fn scorer_def(&self) -> &ScorerDef {
        &self.scorers
    }

    fn field_names(&self) -> &[String] {
        &self.fields
    }

    fn build_analyzer(
        &self,
        config: &AnalyzerConfig,
        scoring: &ScoringConfig,
        scorers: &ScorerDef,
    ) -> core::result::Result<Box<dyn Analyzer>, BackendError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if self.fail_beam == Some(scoring.beam_size) {
            return Err(BackendError::InvalidConfig("scripted failure".into()));
        }
        Ok(Box::new(ScriptedAnalyzer {
            retain: config.store_all_features,
            weights: scorers.weights(),
            lattice: Lattice::default(),
        }))
    }
}

struct ScriptedAnalyzer {
    retain: bool,
    weights: Vec<f32>,
    lattice: Lattice,
}

impl Analyzer for ScriptedAnalyzer {
    fn analyze(&mut self, input: &AnalysisInput) -> core::result::Result<(), BackendError> {
        let surface = match input {
            AnalysisInput::Plain(text) => text.clone(),
            AnalysisInput::Partial(example) => example.surface(),
        };

        if surface.starts_with("fail") {
            return Err(BackendError::Failed("scripted failure".into()));
        }
        if let Some(ms) = surface
            .strip_prefix("sleep ")
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|ms| ms.parse().ok())
        {
            std::thread::sleep(Duration::from_millis(ms));
        }

        let node = LatticeNode {
            boundary: 0,
            length: surface.chars().count(),
            surface: surface.clone(),
            tag: "echo".into(),
            scores: self.weights.clone(),
            features: if self.retain { vec![42] } else { Vec::new() },
        };
        self.lattice = Lattice {
            surface,
            nodes: vec![node],
            paths: vec![ScoredPath {
                nodes: vec![0],
                score: self.weights.iter().sum(),
            }],
        };
        Ok(())
    }

    fn lattice(&self) -> &Lattice {
        &self.lattice
    }

    fn scorer_weights(&self) -> &[f32] {
        &self.weights
    }

    fn retains_features(&self) -> bool {
        self.retain
    }
}

pub fn defaults() -> JumanppConfig {
    JumanppConfig {
        local_beam: 5,
        ..Default::default()
    }
}

pub fn beam(local_beam: i32) -> JumanppConfig {
    JumanppConfig {
        local_beam,
        ..defaults()
    }
}

pub fn request(sentence: &str) -> AnalysisRequest {
    AnalysisRequest {
        sentence: sentence.to_string(),
        key: sentence.to_string(),
        r#type: RequestType::Normal as i32,
    }
}

pub fn cache(env: &Arc<ScriptedEnv>, capacity: usize) -> Arc<AnalyzerCache> {
    AnalyzerCache::initialize(Arc::clone(env) as Arc<dyn AnalysisEnv>, defaults(), capacity)
}

/// A plain lattice dump whose `fail_on`-th reply (1-based) fails to format.
pub struct FailingDump {
    inner: LatticeDumpCall,
    fail_on: usize,
    formatted: usize,
}

impl FailingDump {
    pub fn on_reply(fail_on: usize) -> Self {
        Self {
            inner: LatticeDumpCall::plain(),
            fail_on,
            formatted: 0,
        }
    }
}

impl CallKind for FailingDump {
    type Reply = LatticeDump;

    fn name(&self) -> &'static str {
        "failing_dump"
    }

    fn all_features(&self) -> bool {
        false
    }

    fn handle_output(
        &mut self,
        analyzer: &CachedAnalyzer,
        config: &JumanppConfig,
    ) -> Result<LatticeDump> {
        self.formatted += 1;
        if self.formatted == self.fail_on {
            return Err(Error::internal("scripted formatting failure"));
        }
        self.inner.handle_output(analyzer, config)
    }
}
