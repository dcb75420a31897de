use std::collections::HashMap;

use crate::hammerer::{HammerEngine, HammerMode, HammerReport, Hammering};
use crate::memory::{AggressorPtr, CandidatePool, PoolError};
use crate::util::PAGE_MASK;
use itertools::Itertools;
use log::debug;

/// Same-set addresses read alongside every aggressor.
///
/// A 12-way last-level cache needs at least 13 lines of one set to evict
/// itself; two spare ways absorb replacement-policy noise.
pub const DEFAULT_EVICTORS: usize = 13;

/// Precomputed eviction groups for a fixed set of aggressors.
///
/// Each group holds an aggressor followed by addresses of the same cache set.
/// Hammering reads the group of each requested aggressor in turn, for the full
/// iteration count, in [`HammerMode::CacheEviction`]. The aggressors reach
/// DRAM without any flush instruction.
#[derive(Debug, Clone)]
pub struct EvictionPlan {
    groups: HashMap<usize, Vec<AggressorPtr>>,
    iterations: u64,
}

impl EvictionPlan {
    /// Builds one eviction group of `evictors` addresses per aggressor.
    ///
    /// # Errors
    ///
    /// Returns an error if an aggressor is not part of `pool` or its cache set
    /// holds fewer than `evictors` other pages.
    pub fn build(
        pool: &CandidatePool,
        aggressors: &[AggressorPtr],
        evictors: usize,
        iterations: u64,
    ) -> Result<Self, PoolError> {
        let mut groups = HashMap::with_capacity(aggressors.len());
        for &aggressor in aggressors.iter().unique() {
            let mut group = Vec::with_capacity(evictors + 1);
            group.push(aggressor);
            group.extend(
                pool.find_same_cache_set(aggressor, evictors)?
                    .into_iter()
                    .map(|p| p as AggressorPtr),
            );
            debug!("Eviction group of {:p}: {} addresses", aggressor, group.len());
            groups.insert(aggressor as usize, group);
        }
        Ok(EvictionPlan { groups, iterations })
    }

    /// Rounds over the groups per [`Hammering::hammer`] call.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Number of planned aggressors.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether the plan holds no aggressor.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// The eviction group of `aggressor`, starting with the aggressor itself.
    pub fn group(&self, aggressor: AggressorPtr) -> Option<&[AggressorPtr]> {
        self.groups.get(&(aggressor as usize)).map(Vec::as_slice)
    }

    /// Every page touched by the plan, sorted and deduplicated.
    pub fn pages(&self) -> Vec<AggressorPtr> {
        self.groups
            .values()
            .flatten()
            .map(|&p| (p as usize & !PAGE_MASK) as AggressorPtr)
            .sorted()
            .dedup()
            .collect()
    }
}

impl Hammering for EvictionPlan {
    type Error = PoolError;

    fn hammer(&self, aggressors: &[AggressorPtr]) -> Result<HammerReport, Self::Error> {
        let mut report = HammerReport::default();
        for &aggressor in aggressors {
            let group = self
                .group(aggressor)
                .ok_or(PoolError::UnknownAddress(aggressor as usize))?;
            let run =
                unsafe { HammerEngine::run(group, self.iterations, HammerMode::CacheEviction) };
            debug!(
                "{:p}: {:.0} accesses per address per refresh period",
                aggressor,
                run.accesses_per_refresh() / group.len() as f64
            );
            report = report.merge(run);
        }
        Ok(report)
    }
}

/// Plans eviction groups from a pool on every hammer call.
///
/// Use this when the aggressors are not known in advance, for instance while
/// narrowing random candidate sets.
pub struct PoolEviction<'p> {
    pool: &'p CandidatePool,
    evictors: usize,
    iterations: u64,
}

impl<'p> PoolEviction<'p> {
    /// Creates a hammerer drawing its eviction groups from `pool`.
    pub fn new(pool: &'p CandidatePool, evictors: usize, iterations: u64) -> Self {
        PoolEviction {
            pool,
            evictors,
            iterations,
        }
    }
}

impl Hammering for PoolEviction<'_> {
    type Error = PoolError;

    fn hammer(&self, aggressors: &[AggressorPtr]) -> Result<HammerReport, Self::Error> {
        EvictionPlan::build(self.pool, aggressors, self.evictors, self.iterations)?
            .hammer(aggressors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BytePointer, Memory, PoolConfig, XorSliceHash};
    use crate::test_util::IdentityResolver;
    use crate::util::PAGE_SIZE;

    fn pool(pages: usize) -> anyhow::Result<CandidatePool> {
        let memory = Memory::mmap(pages * PAGE_SIZE)?;
        Ok(CandidatePool::build(
            memory,
            &mut IdentityResolver,
            Some(Box::new(XorSliceHash::sandy_bridge(1)?)),
            PoolConfig::default(),
            None,
        )?)
    }

    // With identity translation, pages `i` and `i + 32` share a set of the
    // 2048-set single-slice cache, so 128 pages give every page 3 evictors.
    #[test]
    fn test_plan_groups() -> anyhow::Result<()> {
        let pool = pool(32 * 4)?;
        let aggressor = pool.memory().addr(0x80) as AggressorPtr;
        assert!(pool.find_same_cache_set(aggressor, 4).is_err());
        let plan = EvictionPlan::build(&pool, &[aggressor, aggressor], 3, 10)?;
        assert_eq!(plan.len(), 1);
        let group = plan.group(aggressor).ok_or(anyhow::anyhow!("no group"))?;
        assert_eq!(group.len(), 4);
        assert_eq!(group[0], aggressor);
        assert_eq!(plan.pages().len(), 4);
        let report = plan.hammer(&[aggressor])?;
        assert_eq!(report.accesses, 40);
        Ok(())
    }

    #[test]
    fn test_unplanned_aggressor() -> anyhow::Result<()> {
        let pool = pool(32 * 4)?;
        let planned = pool.memory().addr(0) as AggressorPtr;
        let other = pool.memory().addr(PAGE_SIZE) as AggressorPtr;
        let plan = EvictionPlan::build(&pool, &[planned], 1, 1)?;
        assert!(matches!(plan.hammer(&[other]), Err(PoolError::UnknownAddress(_))));
        Ok(())
    }

    #[test]
    fn test_pool_eviction_insufficient() -> anyhow::Result<()> {
        let pool = pool(4)?;
        let aggressor = pool.memory().addr(0) as AggressorPtr;
        let hammerer = PoolEviction::new(&pool, DEFAULT_EVICTORS, 1);
        assert!(matches!(
            hammerer.hammer(&[aggressor]),
            Err(PoolError::InsufficientCandidates { .. })
        ));
        Ok(())
    }
}
