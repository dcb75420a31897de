use crate::memory::{AggressorPtr, CandidatePool, PoolError};
use crate::util::Rng;
use log::{debug, info, warn};
use rand::seq::index::sample;

/// Supplies candidate aggressor sets to a [`Narrowing`](crate::Narrowing) run.
///
/// Every iterator over address sets is a source. Returning `None` ends the run.
pub trait CandidateSource {
    /// The next set to hammer, or `None` if the source is exhausted.
    fn next_set(&mut self) -> Option<Vec<AggressorPtr>>;
}

impl<I: Iterator<Item = Vec<AggressorPtr>>> CandidateSource for I {
    fn next_set(&mut self) -> Option<Vec<AggressorPtr>> {
        self.next()
    }
}

/// Draws `count` distinct random pages of a pool per set.
///
/// The generator seed is logged so a run can be repeated.
pub struct RandomPages<'p> {
    pool: &'p CandidatePool,
    count: usize,
    rng: Rng,
}

impl<'p> RandomPages<'p> {
    /// Creates a source drawing from `pool` with `rng`.
    pub fn new(pool: &'p CandidatePool, count: usize, rng: Rng) -> Self {
        info!(
            "Picking {} random pages per set, seed {:#x}",
            count,
            rng.seed()
        );
        RandomPages { pool, count, rng }
    }
}

impl Iterator for RandomPages<'_> {
    type Item = Vec<AggressorPtr>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pool.len() < self.count {
            warn!(
                "Pool holds {} pages, cannot pick {} distinct pages",
                self.pool.len(),
                self.count
            );
            return None;
        }
        let entries = self.pool.entries();
        Some(
            sample(&mut self.rng, entries.len(), self.count)
                .into_iter()
                .map(|i| entries[i].virt as AggressorPtr)
                .collect(),
        )
    }
}

/// Row-pair-row candidates: pages of the rows directly above and below every row.
///
/// Every row between the lowest and highest row of the pool is a potential
/// victim, whether or not the pool holds pages of it. Rows whose neighbours
/// hold fewer than `per_row` pages are skipped.
pub struct RowPairs<'p> {
    pool: &'p CandidatePool,
    per_row: usize,
    rows: std::vec::IntoIter<usize>,
}

impl<'p> RowPairs<'p> {
    /// Creates a source over every row of `pool`, taking `per_row` pages of each neighbour.
    pub fn new(pool: &'p CandidatePool, per_row: usize) -> Self {
        let rows = match (pool.row_indices().next(), pool.row_indices().last()) {
            (Some(first), Some(last)) => (first..=last).collect(),
            _ => vec![],
        };
        RowPairs {
            pool,
            per_row,
            rows: rows.into_iter(),
        }
    }

    fn neighbours(&self, row: usize) -> Result<Vec<AggressorPtr>, PoolError> {
        let below = row.checked_sub(1).ok_or(PoolError::InsufficientCandidates {
            context: format!("row below {}", row),
            wanted: self.per_row,
            found: 0,
        })?;
        let mut set = Vec::with_capacity(2 * self.per_row);
        for neighbour in [below, row + 1] {
            set.extend(
                self.pool
                    .pages_in_row(neighbour, self.per_row)?
                    .into_iter()
                    .take(self.per_row)
                    .map(|p| p as AggressorPtr),
            );
        }
        Ok(set)
    }
}

impl Iterator for RowPairs<'_> {
    type Item = Vec<AggressorPtr>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let row = self.rows.next()?;
            match self.neighbours(row) {
                Ok(set) => return Some(set),
                Err(e) => debug!("Skipping row {}: {}", row, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BytePointer, Memory, PhysAddr, PoolConfig};
    use crate::test_util::TableResolver;
    use crate::util::PAGE_SIZE;
    use std::collections::HashSet;

    /// Rows 10, 11 and 13 with two pages each.
    fn pool() -> anyhow::Result<CandidatePool> {
        let memory = Memory::mmap(6 * PAGE_SIZE)?;
        let frames = [10usize, 10, 11, 11, 13, 13]
            .iter()
            .enumerate()
            .map(|(i, row)| Some(PhysAddr::new((row << 18) + i * PAGE_SIZE)))
            .collect();
        let mut resolver = TableResolver::new(memory.ptr as usize, frames);
        Ok(CandidatePool::build(
            memory,
            &mut resolver,
            None,
            PoolConfig::default(),
            None,
        )?)
    }

    #[test]
    fn test_random_pages_distinct_and_seeded() -> anyhow::Result<()> {
        let pool = pool()?;
        let mut a = RandomPages::new(&pool, 4, Rng::from_seed(3));
        let mut b = RandomPages::new(&pool, 4, Rng::from_seed(3));
        for _ in 0..10 {
            let set = a.next_set().ok_or(anyhow::anyhow!("exhausted"))?;
            assert_eq!(set.len(), 4);
            assert_eq!(set.iter().collect::<HashSet<_>>().len(), 4);
            assert_eq!(Some(set), b.next_set());
        }
        assert!(RandomPages::new(&pool, 7, Rng::from_seed(0)).next_set().is_none());
        Ok(())
    }

    #[test]
    fn test_row_pairs_sandwich() -> anyhow::Result<()> {
        let pool = pool()?;
        let sets = RowPairs::new(&pool, 2).collect::<Vec<_>>();
        // only row 12 has both neighbours, rows 11 and 13
        assert_eq!(sets.len(), 1);
        let expected = [2, 3, 4, 5]
            .iter()
            .map(|i| pool.memory().addr(i * PAGE_SIZE) as AggressorPtr)
            .collect::<Vec<_>>();
        assert_eq!(sets[0], expected);
        Ok(())
    }
}
