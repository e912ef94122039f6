use crate::server::cache::CachedAnalyzer;
use jumanpp_grpc_core::{
    Error, Result,
    proto::{LatticeDump, LatticeNode},
};

/// Formats analysis results as [`LatticeDump`] messages.
///
/// Reusable across results of one call: [`Self::initialize`] captures the
/// scorer weights once, [`Self::format`] is then run per result.
#[derive(Debug)]
pub struct LatticeDumpFormatter {
    with_features: bool,
    weights: Option<Vec<f32>>,
}

impl LatticeDumpFormatter {
    pub const fn new(with_features: bool) -> Self {
        Self {
            with_features,
            weights: None,
        }
    }

    pub const fn is_initialized(&self) -> bool {
        self.weights.is_some()
    }

    /// # Errors
    ///
    /// Returns [`Error::Internal`] if a full dump is requested from an
    /// analyzer that did not keep its features.
    pub fn initialize(&mut self, analyzer: &CachedAnalyzer) -> Result<()> {
        if self.with_features && !analyzer.retains_features() {
            return Err(Error::internal(
                "analyzer was not configured to keep all features",
            ));
        }
        self.weights = Some(analyzer.scorer_weights().to_vec());
        Ok(())
    }

    /// Dumps the analyzer's current result. Each node lists the ranks of the
    /// best `top_n` paths that pass through it (`0` means every path).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the formatter was not initialized or the
    /// analyzer holds no result.
    pub fn format(&self, analyzer: &CachedAnalyzer, top_n: i32) -> Result<LatticeDump> {
        let weights = self
            .weights
            .as_ref()
            .ok_or_else(|| Error::internal("formatter used before initialization"))?;
        let lattice = analyzer
            .lattice()
            .ok_or_else(|| Error::internal("analyzer holds no result"))?;

        let limit = match usize::try_from(top_n) {
            Ok(n) if n > 0 => n.min(lattice.paths.len()),
            _ => lattice.paths.len(),
        };

        let mut ranks = vec![Vec::new(); lattice.nodes.len()];
        for (rank, path) in lattice.paths.iter().take(limit).enumerate() {
            for &node in &path.nodes {
                if let Some(r) = ranks.get_mut(node) {
                    r.push(rank as i32);
                }
            }
        }

        let nodes = lattice
            .nodes
            .iter()
            .zip(ranks)
            .map(|(node, ranks)| LatticeNode {
                boundary: node.boundary as u32,
                length: node.length as u32,
                surface: node.surface.clone(),
                tag: node.tag.clone(),
                ranks,
                scores: node.scores.clone(),
                score: node.score(),
                features: if self.with_features {
                    node.features.clone()
                } else {
                    Vec::new()
                },
            })
            .collect();

        Ok(LatticeDump {
            surface: lattice.surface.clone(),
            comment: analyzer.comment().to_string(),
            nodes,
            scorer_weights: weights.clone(),
        })
    }
}
