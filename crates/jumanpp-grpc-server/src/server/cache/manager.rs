//! Bounded pool of reusable analyzers.
//!
//! The [`AnalyzerCache`] owns a fixed number of slots. A call leases an
//! analyzer with [`AnalyzerCache::acquire`] and gives it back by dropping the
//! returned [`AnalyzerLease`]. While leased, the analyzer is moved out of its
//! slot, so no two leases can ever observe the same analyzer.
//!
//! Acquisition, in order of preference:
//!
//! 1. The first idle analyzer already configured for the request.
//! 2. An uninitialized slot, configured on the spot.
//! 3. The least recently used idle analyzer, reconfigured on the spot.
//!
//! If every analyzer is leased the call fails with
//! [`Error::ResourceExhausted`]; there is no waiting and no retry.
//! (Re)initialization happens under the cache lock.

use super::{
    analyzer::{AnalyzerState, CachedAnalyzer, CompatibilityKey},
    reader::PartialReaderTemplate,
};
use crate::server::{backend::AnalysisEnv, telemetry::record_cache_outcome};
use core::ops::{Deref, DerefMut};
use jumanpp_grpc_core::{
    Error, Result,
    proto::{AnalysisRequest, JumanppConfig},
};
use parking_lot::Mutex;
use std::sync::Arc;

pub struct AnalyzerCache {
    env: Arc<dyn AnalysisEnv>,
    defaults: JumanppConfig,
    template: PartialReaderTemplate,
    /// `None` while the slot's analyzer is leased out.
    slots: Mutex<Vec<Option<Box<CachedAnalyzer>>>>,
}

impl AnalyzerCache {
    pub fn initialize(
        env: Arc<dyn AnalysisEnv>,
        defaults: JumanppConfig,
        capacity: usize,
    ) -> Arc<Self> {
        let template = PartialReaderTemplate::new(env.field_names());
        let slots = (0..capacity)
            .map(|i| Some(Box::new(CachedAnalyzer::new(i))))
            .collect();

        Arc::new(Self {
            env,
            defaults,
            template,
            slots: Mutex::new(slots),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// Number of analyzers not currently leased.
    pub fn idle(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    /// Leases an analyzer able to serve `request` with `config`.
    ///
    /// # Errors
    ///
    /// - [`Error::NotImplemented`] if the request kind is unknown.
    /// - [`Error::ResourceExhausted`] if every analyzer is leased.
    /// - [`Error::Internal`] if the chosen analyzer failed to initialize. Its
    ///   slot is invalidated and will not be reused until rebuilt.
    pub fn acquire(
        self: &Arc<Self>,
        config: &JumanppConfig,
        request: &AnalysisRequest,
        all_features: bool,
    ) -> Result<AnalyzerLease> {
        let key = CompatibilityKey::new(config, request, all_features)?;
        let env_scorers = self.env.scorer_count();

        let mut slots = self.slots.lock();

        let reusable = slots.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|a| a.is_available_for(&key, env_scorers))
        });
        if let Some(mut analyzer) = reusable.and_then(|i| slots[i].take()) {
            analyzer.set_state(AnalyzerState::InUse);
            record_cache_outcome("hit");
            return Ok(self.lease(analyzer));
        }

        let victim = slots
            .iter()
            .filter_map(Option::as_deref)
            .min_by_key(|a| match a.state() {
                AnalyzerState::Uninitialized => (0, None),
                _ => (1, a.last_used()),
            })
            .map(CachedAnalyzer::index);

        let Some(mut analyzer) = victim.and_then(|i| slots[i].take()) else {
            #[cfg(feature = "tracing")]
            tracing::debug!("No idle analyzer among {}", slots.len());
            record_cache_outcome("exhausted");
            return Err(Error::ResourceExhausted);
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Configuring analyzer {} (was {:?}) for {:?}",
            analyzer.index(),
            analyzer.key(),
            key
        );

        analyzer.set_base_config(&self.defaults, env_scorers, all_features);
        analyzer.set_proto_config(config);

        if let Err(e) = analyzer.build(self.env.as_ref(), key) {
            #[cfg(feature = "tracing")]
            tracing::error!("Failed to initialize analyzer {}: {e}", analyzer.index());
            analyzer.invalidate();
            let index = analyzer.index();
            slots[index] = Some(analyzer);
            record_cache_outcome("init_failure");
            return Err(Error::internal(format!(
                "failed to initialize analyzer: {e}"
            )));
        }

        analyzer.set_state(AnalyzerState::InUse);
        record_cache_outcome("init");
        Ok(self.lease(analyzer))
    }

    fn lease(self: &Arc<Self>, analyzer: Box<CachedAnalyzer>) -> AnalyzerLease {
        AnalyzerLease {
            cache: Arc::clone(self),
            analyzer,
        }
    }

    fn release(&self, mut analyzer: Box<CachedAnalyzer>) {
        analyzer.set_state(AnalyzerState::NotInUse);
        let index = analyzer.index();
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(index) {
            *slot = Some(analyzer);
        }
    }
}

/// Exclusive use of one cached analyzer.
///
/// Dropping the lease returns the analyzer to its slot, exactly once, on every
/// path (success, error, cancellation, or the owning call being disposed).
pub struct AnalyzerLease {
    cache: Arc<AnalyzerCache>,
    analyzer: Box<CachedAnalyzer>,
}

impl AnalyzerLease {
    /// Reads the request text with the cache's shared reader template.
    ///
    /// # Errors
    ///
    /// See [`CachedAnalyzer::read_input`].
    pub fn read_input(&mut self, request: &AnalysisRequest) -> Result<()> {
        self.analyzer.read_input(request, &self.cache.template)
    }
}

impl Deref for AnalyzerLease {
    type Target = CachedAnalyzer;

    fn deref(&self) -> &CachedAnalyzer {
        &self.analyzer
    }
}

impl DerefMut for AnalyzerLease {
    fn deref_mut(&mut self) -> &mut CachedAnalyzer {
        &mut self.analyzer
    }
}

impl Drop for AnalyzerLease {
    fn drop(&mut self) {
        let analyzer = core::mem::take(&mut self.analyzer);
        self.cache.release(analyzer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testing::{ScriptedEnv, beam, cache, defaults, request};
    use jumanpp_grpc_core::proto::RequestType;
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    #[test]
    fn compatible_analyzer_is_reused() {
        let env = Arc::new(ScriptedEnv::new(2));
        let cache = cache(&env, 4);

        let first = cache.acquire(&beam(5), &request("a"), false).unwrap();
        let index = first.index();
        assert_eq!(first.state(), AnalyzerState::InUse);
        assert_eq!(cache.idle(), 3);
        drop(first);
        assert_eq!(cache.idle(), 4);

        let second = cache.acquire(&beam(5), &request("b"), false).unwrap();
        assert_eq!(second.index(), index);
        assert_eq!(env.builds(), 1);
    }

    #[test]
    fn eviction_prefers_uninitialized_slots() {
        let env = Arc::new(ScriptedEnv::new(2));
        let cache = cache(&env, 3);

        let a = cache.acquire(&beam(5), &request("a"), false).unwrap();
        assert_eq!(a.index(), 0);
        drop(a);

        // The idle slot 0 is not compatible; fresh slot 1 is used instead of
        // throwing slot 0's analyzer away.
        let b = cache.acquire(&beam(3), &request("b"), false).unwrap();
        assert_eq!(b.index(), 1);
        drop(b);

        let a = cache.acquire(&beam(5), &request("a"), false).unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(env.builds(), 2);
    }

    #[test]
    fn least_recently_used_is_evicted_when_full() {
        let env = Arc::new(ScriptedEnv::new(2));
        let cache = cache(&env, 2);

        drop(cache.acquire(&beam(1), &request("a"), false).unwrap());
        thread::sleep(Duration::from_millis(2));
        drop(cache.acquire(&beam(2), &request("b"), false).unwrap());
        thread::sleep(Duration::from_millis(2));

        // beam 1 (slot 0) is older than beam 2 (slot 1).
        let c = cache.acquire(&beam(3), &request("c"), false).unwrap();
        assert_eq!(c.index(), 0);
        drop(c);
        thread::sleep(Duration::from_millis(2));

        let a = cache.acquire(&beam(1), &request("a"), false).unwrap();
        assert_eq!(a.index(), 1);
        assert_eq!(a.local_beam(), 1);
        assert_eq!(env.builds(), 4);
    }

    #[test]
    fn full_cache_reports_exhaustion() {
        let env = Arc::new(ScriptedEnv::new(1));
        let cache = cache(&env, 1);

        let held = cache.acquire(&beam(5), &request("a"), false).unwrap();
        let err = cache.acquire(&beam(5), &request("b"), false).err();
        assert!(matches!(err, Some(Error::ResourceExhausted)));

        drop(held);
        assert!(cache.acquire(&beam(5), &request("b"), false).is_ok());
        assert_eq!(env.builds(), 1);
    }

    #[test]
    fn retry_after_exhaustion_reuses_released_slot() {
        let env = Arc::new(ScriptedEnv::new(2));
        let cache = cache(&env, 2);

        let a = cache.acquire(&defaults(), &request("a"), false).unwrap();
        let b = cache.acquire(&defaults(), &request("b"), false).unwrap();
        let a_slot = a.index();
        assert_ne!(a_slot, b.index());
        assert_eq!(env.builds(), 2);

        let err = cache.acquire(&defaults(), &request("c"), false).err();
        assert!(matches!(err, Some(Error::ResourceExhausted)));

        drop(a);
        let c = cache.acquire(&defaults(), &request("c"), false).unwrap();
        assert_eq!(c.index(), a_slot);
        assert_eq!(env.builds(), 2);

        drop(b);
        drop(c);
        assert_eq!(cache.idle(), 2);
    }

    #[test]
    fn two_configs_fit_in_two_slots_without_rebuilds() {
        let env = Arc::new(ScriptedEnv::new(2));
        let cache = cache(&env, 2);

        let with_features = |i: usize| i % 2 == 1;
        for i in 0..10 {
            let lease = cache
                .acquire(&defaults(), &request("x"), with_features(i))
                .unwrap();
            assert_eq!(lease.retains_features(), with_features(i));
        }
        assert_eq!(env.builds(), 2);
        assert_eq!(cache.idle(), 2);
    }

    #[test]
    fn failed_initialization_invalidates_slot() {
        let env = Arc::new(ScriptedEnv::new(2).failing_on_beam(99));
        let cache = cache(&env, 2);

        for _ in 0..2 {
            let err = cache.acquire(&beam(99), &request("a"), false).err();
            assert!(matches!(err, Some(Error::Internal { .. })));
        }
        // Never treated as configured: every attempt rebuilds.
        assert_eq!(env.builds(), 2);
        assert_eq!(cache.idle(), 2);

        let ok = cache.acquire(&beam(5), &request("a"), false).unwrap();
        assert_eq!(ok.local_beam(), 5);
    }

    #[test]
    fn ignoring_secondary_scorers_builds_cheap_analyzer() {
        let env = Arc::new(ScriptedEnv::new(2));
        let cache = cache(&env, 2);

        let ignoring = JumanppConfig {
            ignore_rnn: true,
            ..defaults()
        };
        let lease = cache.acquire(&ignoring, &request("a"), false).unwrap();
        assert_eq!(lease.scorer_weights().len(), 1);
        drop(lease);

        let full = cache.acquire(&defaults(), &request("a"), false).unwrap();
        assert_eq!(full.scorer_weights().len(), 2);
        assert_eq!(env.builds(), 2);
    }

    #[test]
    fn unknown_request_type_is_rejected_before_building() {
        let env = Arc::new(ScriptedEnv::new(1));
        let cache = cache(&env, 1);

        let mut req = request("a");
        req.r#type = 9;
        let err = cache.acquire(&defaults(), &req, false).err();
        assert!(matches!(err, Some(Error::NotImplemented { .. })));
        assert_eq!(env.builds(), 0);

        req.r#type = RequestType::PartialAnnotation as i32;
        assert!(cache.acquire(&defaults(), &req, false).is_ok());
    }

    #[test]
    fn lease_reads_and_analyzes() {
        let env = Arc::new(ScriptedEnv::new(1));
        let cache = cache(&env, 1);

        let mut lease = cache.acquire(&defaults(), &request("ok"), false).unwrap();
        lease.read_input(&request("hello\nignored")).unwrap();
        lease.analyze().unwrap();
        assert!(lease.has_result());
        assert_eq!(lease.comment(), "hello\nignored");
        assert_eq!(lease.lattice().unwrap().surface, "hello");
        drop(lease);

        // A released analyzer holds no result.
        let lease = cache.acquire(&defaults(), &request("ok"), false).unwrap();
        assert!(!lease.has_result());
    }

    #[test]
    fn at_most_one_owner_under_contention() {
        const CAPACITY: usize = 4;
        let env = Arc::new(ScriptedEnv::new(2));
        let cache = cache(&env, CAPACITY);
        let owned: Vec<AtomicBool> = (0..CAPACITY).map(|_| AtomicBool::new(false)).collect();
        let granted = AtomicUsize::new(0);
        let exhausted = AtomicUsize::new(0);

        thread::scope(|s| {
            for t in 0..8 {
                let (cache, owned, granted, exhausted) = (&cache, &owned, &granted, &exhausted);
                s.spawn(move || {
                    for i in 0..200 {
                        let config = beam(1 + ((t + i) % 3) as i32);
                        match cache.acquire(&config, &request("x"), i % 5 == 0) {
                            Ok(lease) => {
                                let slot = &owned[lease.index()];
                                assert!(!slot.swap(true, Ordering::SeqCst), "double lease");
                                thread::yield_now();
                                slot.store(false, Ordering::SeqCst);
                                granted.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(Error::ResourceExhausted) => {
                                exhausted.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                });
            }
        });

        assert_eq!(
            granted.load(Ordering::Relaxed) + exhausted.load(Ordering::Relaxed),
            8 * 200
        );
        assert_eq!(cache.idle(), CAPACITY);
    }
}
