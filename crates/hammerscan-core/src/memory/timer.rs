use crate::memory::AggressorPtr;
use crate::util::{clflush, median, mfence};
use std::hint::black_box;
use std::time::Instant;

/// Measures the latency of one read of `p` in nanoseconds.
///
/// # Safety
///
/// `p` must point into mapped memory.
pub unsafe fn time_access(p: AggressorPtr) -> u64 {
    mfence();
    let start = Instant::now();
    black_box(unsafe { p.read_volatile() });
    mfence();
    start.elapsed().as_nanos() as u64
}

/// Median latency of re-reading `addrs[0]` after reading every other address of `addrs`.
///
/// If all addresses share a cache set and there are more of them than the set
/// has ways, the first address is evicted and the re-read goes to DRAM.
///
/// # Safety
///
/// Every address must point into mapped memory.
pub unsafe fn eviction_latency(addrs: &[AggressorPtr], runs: usize) -> Option<u64> {
    let (&target, others) = addrs.split_first()?;
    let mut times = Vec::with_capacity(runs);
    for _ in 0..runs {
        unsafe {
            clflush(target);
            mfence();
            black_box(target.read_volatile());
            for &p in others {
                black_box(p.read_volatile());
            }
            times.push(time_access(target));
        }
    }
    median(&mut times)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BytePointer, Memory};
    use crate::util::PAGE_SIZE;

    #[test]
    fn test_eviction_latency_needs_addresses() {
        assert_eq!(unsafe { eviction_latency(&[], 10) }, None);
    }

    #[test]
    fn test_eviction_latency_measures() -> anyhow::Result<()> {
        let memory = Memory::mmap(PAGE_SIZE * 4)?;
        let addrs = (0..4)
            .map(|i| memory.addr(i * PAGE_SIZE) as AggressorPtr)
            .collect::<Vec<_>>();
        let latency = unsafe { eviction_latency(&addrs, 5) };
        assert!(latency.is_some());
        Ok(())
    }
}
