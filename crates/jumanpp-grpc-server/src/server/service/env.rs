use crate::server::{backend::AnalysisEnv, cache::AnalyzerCache};
use bytes::Bytes;
use jumanpp_grpc_core::{Error, Result, proto::JumanppConfig};
use std::sync::Arc;

/// Process-wide state shared by every call: the default configuration and
/// the analyzer cache. Immutable once built.
pub struct ServiceEnv {
    default_config: JumanppConfig,
    analyzers: Arc<AnalyzerCache>,
}

impl ServiceEnv {
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the defaults are out of range or
    /// `capacity` is zero.
    pub fn initialize(
        backend: Arc<dyn AnalysisEnv>,
        default_config: JumanppConfig,
        capacity: usize,
    ) -> Result<Self> {
        default_config.validate()?;
        if capacity == 0 {
            return Err(Error::invalid_argument(
                "analyzer cache capacity must be positive",
            ));
        }

        let analyzers = AnalyzerCache::initialize(backend, default_config.clone(), capacity);
        Ok(Self {
            default_config,
            analyzers,
        })
    }

    pub fn analyzers(&self) -> &Arc<AnalyzerCache> {
        &self.analyzers
    }

    /// The configuration of one call: defaults, overridden by the client's
    /// header if there is one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the header does not decode or
    /// the merged configuration is out of range.
    pub fn decode_config(&self, header: Option<&Bytes>) -> Result<JumanppConfig> {
        let mut config = self.default_config.clone();
        if let Some(bytes) = header {
            config.merge_header(bytes)?;
        }
        config.validate()?;
        Ok(config)
    }
}
