use hammerscan::hammerer::{HammerEngine, HammerMode, Hammering};
use hammerscan::memory::{
    AggressorPtr, BitFlipDetector, BytePointer, CandidatePool, LinuxPageMap, Memory, PhysAddr,
    PoolConfig, TranslationError, VictimRegion, VirtToPhysResolver, XorSliceHash,
};
use hammerscan::report::{WriterLog, parse_pairs};
use hammerscan::util::{PAGE_MASK, PAGE_SIZE};
use hammerscan::{MemCheck, Narrowing, NarrowingConfig};
use hammerscan_dummy::FaultInjector;

/// Physical address equals virtual address.
struct Identity;

impl VirtToPhysResolver for Identity {
    fn get_phys(&mut self, virt: u64) -> Result<PhysAddr, TranslationError> {
        Ok(PhysAddr::new(virt as usize))
    }

    fn get_phys_range(
        &mut self,
        virt: u64,
        pages: usize,
    ) -> Result<Vec<Option<PhysAddr>>, TranslationError> {
        let start = virt as usize & !PAGE_MASK;
        Ok((0..pages)
            .map(|i| Some(PhysAddr::new(start + i * PAGE_SIZE)))
            .collect())
    }
}

fn pool(pages: usize) -> anyhow::Result<CandidatePool> {
    let memory = Memory::mmap(pages * PAGE_SIZE)?;
    Ok(CandidatePool::build(
        memory,
        &mut Identity,
        Some(Box::new(XorSliceHash::sandy_bridge(2)?)),
        PoolConfig::default(),
        None,
    )?)
}

fn page(pool: &CandidatePool, i: usize) -> AggressorPtr {
    pool.memory().addr(i * PAGE_SIZE) as AggressorPtr
}

#[test]
fn test_narrowing_reports_injected_pair() -> anyhow::Result<()> {
    let pool = pool(16)?;
    let target = pool.memory().addr(11 * PAGE_SIZE + 0x238);
    let injector = FaultInjector::new((page(&pool, 3), page(&pool, 9)), target.into(), 5);
    let victim = MemCheck::new(
        VictimRegion::from_memory(pool.memory()),
        BitFlipDetector::default(),
    );
    let mut narrowing = Narrowing::builder(injector, victim)
        .config(NarrowingConfig {
            time_budget: None,
            max_sets: Some(3),
            max_pairs: None,
            ..Default::default()
        })
        .build()?;
    let sets = vec![
        (0..8).map(|i| page(&pool, i)).collect(),
        (2..12).map(|i| page(&pool, i)).collect::<Vec<_>>(),
        vec![page(&pool, 3)],
    ];
    let mut out = vec![];
    let report = narrowing.run(sets.into_iter(), &mut Identity, WriterLog::new(&mut out))?;
    // the single-address set is skipped and not counted
    assert_eq!(report.sets_tried, 2);
    assert_eq!(report.confirmed.len(), 1);
    assert_eq!(report.abandoned, 0);
    let confirmed = report.confirmed[0];
    assert_eq!(confirmed.agg1, page(&pool, 3) as usize);
    assert_eq!(confirmed.agg2, page(&pool, 9) as usize);
    assert_eq!(confirmed.flip.bit, 5);
    assert_eq!(confirmed.flip.offset, 11 * PAGE_SIZE + 0x238);

    let text = String::from_utf8(out)?;
    assert!(text.starts_with("RESULT START_TIME,"));
    assert!(text.lines().any(|l| l.starts_with("RESULT STAT,")));
    let pairs = parse_pairs(text.as_bytes())?;
    assert_eq!(pairs, vec![confirmed.pair]);
    assert_eq!(pairs[0].victim, PhysAddr::new(target as usize));
    assert_eq!(pool.find_page(pairs[0].agg2), Some(page(&pool, 9) as *mut u8));
    Ok(())
}

#[test]
fn test_narrowing_abandons_transient_flip() -> anyhow::Result<()> {
    let pool = pool(8)?;
    let target = pool.memory().addr(7 * PAGE_SIZE);
    let injector =
        FaultInjector::new((page(&pool, 0), page(&pool, 1)), target.into(), 60).with_limit(1);
    let victim = MemCheck::new(
        VictimRegion::from_memory(pool.memory()),
        BitFlipDetector::default(),
    );
    let mut narrowing = Narrowing::builder(injector, victim)
        .config(NarrowingConfig {
            time_budget: None,
            max_sets: Some(1),
            ..Default::default()
        })
        .build()?;
    let sets = vec![(0..4).map(|i| page(&pool, i)).collect::<Vec<_>>()];
    let mut out = vec![];
    let report = narrowing.run(sets.into_iter(), &mut Identity, WriterLog::new(&mut out))?;
    assert_eq!(report.errors, 1);
    assert_eq!(report.abandoned, 1);
    assert!(report.confirmed.is_empty());
    assert!(parse_pairs(out.as_slice())?.is_empty());
    let (injector, _) = narrowing.into_parts();
    assert_eq!(injector.fired(), 1);
    Ok(())
}

#[test]
fn test_cache_sets_of_real_mapping() -> anyhow::Result<()> {
    // sets repeat every 32 pages, about half of those share the slice
    let pool = pool(512)?;
    let others = pool.find_same_cache_set(page(&pool, 0), 2)?;
    assert_eq!(others.len(), 2);
    for other in others {
        assert_ne!(other as usize, page(&pool, 0) as usize);
        assert_eq!((other as usize - page(&pool, 0) as usize) % PAGE_SIZE, 0);
    }
    Ok(())
}

#[test]
#[ignore]
fn test_pagemap_translation_is_stable() -> anyhow::Result<()> {
    let memory = Memory::mmap(4 * PAGE_SIZE)?;
    let mut pagemap = LinuxPageMap::new()?;
    let first = pagemap.get_phys(memory.addr(PAGE_SIZE + 0x10) as u64)?;
    let second = pagemap.get_phys(memory.addr(PAGE_SIZE + 0x10) as u64)?;
    assert_eq!(first, second);
    assert_eq!(first.page_offset(), 0x10);
    Ok(())
}

#[test]
#[ignore]
fn test_hammer_real_pool() -> anyhow::Result<()> {
    env_logger::init();
    let memory = Memory::mmap(64 * PAGE_SIZE)?;
    let pool = CandidatePool::build(
        memory,
        &mut LinuxPageMap::new()?,
        None,
        PoolConfig::default(),
        None,
    )?;
    let hammerer = HammerEngine::new(HammerMode::ExplicitFlush, 100_000);
    let report = hammerer.hammer(&[page(&pool, 0), page(&pool, 1)])?;
    assert_eq!(report.accesses, 200_000);
    println!(
        "{:.1} ns per access, {:.0} accesses per refresh period",
        report.ns_per_access(),
        report.accesses_per_refresh()
    );
    Ok(())
}
