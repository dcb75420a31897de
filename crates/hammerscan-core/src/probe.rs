//! Eviction latency probe for validating a cache geometry model.
//!
//! If the cache model is right, re-reading an address after touching enough
//! addresses of its cache set becomes a DRAM access. Plotting the latency
//! over the number of touched addresses shows a step at the associativity of
//! the last-level cache.

use crate::memory::{AggressorPtr, CandidatePool, PoolError, eviction_latency};
use log::info;
use serde::Serialize;

/// Median re-read latency for one group size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ProbePoint {
    /// Addresses in the group, including the probed address
    pub addr_count: usize,
    /// Median latency of re-reading the probed address in nanoseconds
    pub latency_ns: u64,
}

/// Measures eviction latency over growing same-set groups.
#[derive(Clone, Copy, Debug)]
pub struct EvictionProbe {
    /// Largest group size
    pub max_addrs: usize,
    /// Measurements per group size
    pub runs: usize,
}

impl Default for EvictionProbe {
    fn default() -> Self {
        EvictionProbe {
            max_addrs: 13 * 4,
            runs: 10,
        }
    }
}

impl EvictionProbe {
    /// Probes `target` with groups of 1 to `max_addrs` addresses from its cache set.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool has no cache model or `target` is not part
    /// of it. Group sizes the pool cannot fill end the probe early.
    pub fn run(
        &self,
        pool: &CandidatePool,
        target: AggressorPtr,
    ) -> Result<Vec<ProbePoint>, PoolError> {
        let mut points = Vec::with_capacity(self.max_addrs);
        for addr_count in 1..=self.max_addrs {
            let others = match pool.find_same_cache_set(target, addr_count - 1) {
                Ok(others) => others,
                Err(PoolError::InsufficientCandidates { found, .. }) => {
                    info!("Cache set of {:p} holds only {} other pages", target, found);
                    break;
                }
                Err(e) => return Err(e),
            };
            let mut addrs = Vec::with_capacity(addr_count);
            addrs.push(target);
            addrs.extend(others.into_iter().map(|p| p as AggressorPtr));
            let Some(latency_ns) = (unsafe { eviction_latency(&addrs, self.runs) }) else {
                continue;
            };
            info!("{} addresses: {} ns", addr_count, latency_ns);
            points.push(ProbePoint {
                addr_count,
                latency_ns,
            });
        }
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BytePointer, Memory, PoolConfig, XorSliceHash};
    use crate::test_util::IdentityResolver;
    use crate::util::PAGE_SIZE;

    #[test]
    fn test_probe_stops_at_set_size() -> anyhow::Result<()> {
        // sets repeat every 32 pages, so 64 pages give every page one partner
        let memory = Memory::mmap(64 * PAGE_SIZE)?;
        let pool = CandidatePool::build(
            memory,
            &mut IdentityResolver,
            Some(Box::new(XorSliceHash::sandy_bridge(1)?)),
            PoolConfig::default(),
            None,
        )?;
        let target = pool.memory().addr(0) as AggressorPtr;
        let points = EvictionProbe::default().run(&pool, target)?;
        assert_eq!(
            points.iter().map(|p| p.addr_count).collect::<Vec<_>>(),
            vec![1, 2]
        );
        Ok(())
    }

    #[test]
    fn test_probe_requires_cache_model() -> anyhow::Result<()> {
        let memory = Memory::mmap(2 * PAGE_SIZE)?;
        let pool = CandidatePool::build(
            memory,
            &mut IdentityResolver,
            None,
            PoolConfig::default(),
            None,
        )?;
        let target = pool.memory().addr(0) as AggressorPtr;
        assert!(matches!(
            EvictionProbe::default().run(&pool, target),
            Err(PoolError::NoCacheModel)
        ));
        Ok(())
    }
}
