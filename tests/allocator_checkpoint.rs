use pgcore::allocator::{AllocError, AllocatorConfig, Extent, ExtentAllocator};
use proptest::prelude::*;

fn first_fit() -> AllocatorConfig {
    AllocatorConfig {
        bf_threshold: 0,
        bf_free_pct: 0,
        ..AllocatorConfig::default()
    }
}

fn seeded(size: u64, block: u64, config: AllocatorConfig) -> ExtentAllocator {
    let alloc = ExtentAllocator::new("checkpoint", size, block, config);
    alloc.init_add_free(0, size);
    alloc
}

#[test]
fn same_size_requests_land_sequentially() {
    for config in [first_fit(), AllocatorConfig::default()] {
        let alloc = seeded(1000, 1, config);
        let mut first = Vec::new();
        assert_eq!(alloc.allocate(100, 1, 100, &mut first), Ok(100));
        let mut second = Vec::new();
        assert_eq!(alloc.allocate(100, 1, 100, &mut second), Ok(100));
        assert_eq!(first, vec![Extent::new(0, 100)]);
        assert_eq!(second, vec![Extent::new(100, 100)]);
        assert_eq!(alloc.free_bytes(), 800);
    }
}

#[test]
fn oversized_request_shrinks_to_largest_extent() {
    let alloc = ExtentAllocator::new("low", 0x100000, 0x1000, AllocatorConfig::default());
    alloc.init_add_free(0x10000, 0x3800);
    let mut extents = Vec::new();
    let got = alloc.allocate(0x8000, 0x1000, 0, &mut extents).unwrap();
    assert_eq!(got, 0x3000);
    assert_eq!(extents, vec![Extent::new(0x10000, 0x3000)]);
    assert_eq!(alloc.dump(), vec![Extent::new(0x13000, 0x800)]);
    alloc.validate().unwrap();
}

#[test]
fn partial_allocation_gathers_several_extents() {
    let alloc = ExtentAllocator::new("split", 0x100000, 0x1000, AllocatorConfig::default());
    alloc.init_add_free(0, 0x2000);
    alloc.init_add_free(0x8000, 0x1000);
    alloc.init_add_free(0x20000, 0x1000);
    let mut extents = Vec::new();
    assert_eq!(alloc.allocate(0x5000, 0x1000, 0, &mut extents), Ok(0x4000));
    assert_eq!(extents.len(), 3);
    assert_eq!(alloc.free_bytes(), 0);
    let mut more = Vec::new();
    assert_eq!(
        alloc.allocate(0x1000, 0x1000, 0, &mut more),
        Err(AllocError::NoSpace {
            want: 0x1000,
            unit: 0x1000
        })
    );
}

#[test]
fn picks_are_rounded_up_to_the_unit() {
    let alloc = ExtentAllocator::new("align", 0x100000, 0x1000, AllocatorConfig::default());
    // 0x3000 bytes, but only 0x2000 of it on a 0x2000 boundary
    alloc.init_add_free(0x1000, 0x3000);
    let mut extents = Vec::new();
    assert_eq!(alloc.allocate(0x2000, 0x2000, 0, &mut extents), Ok(0x2000));
    assert_eq!(extents, vec![Extent::new(0x2000, 0x2000)]);
    assert_eq!(alloc.dump(), vec![Extent::new(0x1000, 0x1000)]);
}

#[test]
fn misaligned_extent_is_used_after_halving() {
    let alloc = ExtentAllocator::new("halve", 0x100000, 0x800, AllocatorConfig::default());
    alloc.init_add_free(0x800, 0x3000);
    let mut extents = Vec::new();
    assert_eq!(alloc.allocate(0x3000, 0x1000, 0, &mut extents), Ok(0x2000));
    assert_eq!(
        extents,
        vec![Extent::new(0x1000, 0x1000), Extent::new(0x2000, 0x1000)]
    );
    assert_eq!(
        alloc.dump(),
        vec![Extent::new(0x800, 0x800), Extent::new(0x3000, 0x800)]
    );
}

#[test]
fn release_restores_free_shape() {
    let alloc = seeded(0x40000, 0x1000, first_fit());
    alloc.init_rm_free(0x8000, 0x4000);
    let before = alloc.dump();
    let mut extents = Vec::new();
    alloc.allocate(0x6000, 0x1000, 0, &mut extents).unwrap();
    alloc.release_extents(&extents);
    assert_eq!(alloc.dump(), before);
    alloc.validate().unwrap();
}

#[test]
fn dump_with_visits_extents_in_offset_order() {
    let alloc = ExtentAllocator::new("dump", 0x10000, 0x1000, AllocatorConfig::default());
    alloc.init_add_free(0x8000, 0x1000);
    alloc.init_add_free(0x2000, 0x2000);
    alloc.init_add_free(0x0, 0x0);
    let mut seen = Vec::new();
    alloc.dump_with(|offset, length| seen.push((offset, length)));
    assert_eq!(seen, vec![(0x2000, 0x2000), (0x8000, 0x1000)]);
    assert_eq!(alloc.free_extent_count(), 2);
}

#[test]
#[should_panic(expected = "is not free")]
fn removing_space_that_is_not_free_panics() {
    let alloc = seeded(0x10000, 0x1000, AllocatorConfig::default());
    alloc.init_rm_free(0x2000, 0x1000);
    alloc.init_rm_free(0x1000, 0x2000);
}

#[test]
fn cap_below_block_size_still_allocates_unit_chunks() {
    let config = AllocatorConfig {
        max_alloc_size_cap: 0x800,
        ..AllocatorConfig::default()
    };
    let alloc = seeded(0x10000, 0x1000, config);
    let mut extents = Vec::new();
    assert_eq!(alloc.allocate(0x2000, 0x1000, 0, &mut extents), Ok(0x2000));
    assert_eq!(
        extents,
        vec![Extent::new(0, 0x1000), Extent::new(0x1000, 0x1000)]
    );
    assert_eq!(alloc.free_bytes(), 0xe000);
    alloc.validate().unwrap();
}

#[test]
#[should_panic(expected = "beyond device size")]
fn releasing_past_the_device_end_panics() {
    let alloc = ExtentAllocator::new("bounds", 0x10000, 0x1000, AllocatorConfig::default());
    alloc.init_add_free(0, 0x8000);
    alloc.release(0x20000, 0x1000);
}

#[test]
#[should_panic(expected = "beyond device size")]
fn seeding_past_the_device_end_panics() {
    let alloc = ExtentAllocator::new("bounds", 0x10000, 0x1000, AllocatorConfig::default());
    alloc.init_add_free(0xf000, 0x2000);
}

#[derive(Debug, Clone)]
enum Op {
    Allocate { blocks: u64, max_blocks: u64 },
    Release { index: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u64..=16, 0u64..=4).prop_map(|(blocks, max_blocks)| Op::Allocate { blocks, max_blocks }),
        any::<usize>().prop_map(|index| Op::Release { index }),
    ]
}

fn config_strategy() -> impl Strategy<Value = AllocatorConfig> {
    prop_oneof![Just(first_fit()), Just(AllocatorConfig::default())]
}

proptest! {
    /// Free extents never touch or overlap, both indices agree, and every
    /// byte is either free or held by exactly one caller.
    #[test]
    fn free_space_stays_coalesced(
        config in config_strategy(),
        ops in prop::collection::vec(op_strategy(), 1..64),
    ) {
        const BLOCK: u64 = 0x1000;
        const SIZE: u64 = 64 * BLOCK;
        let alloc = seeded(SIZE, BLOCK, config);
        let mut held: Vec<Extent> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate { blocks, max_blocks } => {
                    let mut extents = Vec::new();
                    match alloc.allocate(blocks * BLOCK, BLOCK, max_blocks * BLOCK, &mut extents) {
                        Ok(got) => {
                            prop_assert!(got <= blocks * BLOCK);
                            prop_assert_eq!(got, extents.iter().map(|e| e.length).sum::<u64>());
                            held.extend(extents);
                        }
                        Err(AllocError::NoSpace { .. }) => prop_assert!(extents.is_empty()),
                    }
                }
                Op::Release { index } => {
                    if !held.is_empty() {
                        let extent = held.swap_remove(index % held.len());
                        alloc.release(extent.offset, extent.length);
                    }
                }
            }
            prop_assert!(alloc.validate().is_ok(), "{:?}", alloc.validate());
            let held_bytes: u64 = held.iter().map(|e| e.length).sum();
            prop_assert_eq!(alloc.free_bytes() + held_bytes, SIZE);
        }

        alloc.release_extents(&held);
        prop_assert_eq!(alloc.dump(), vec![Extent::new(0, SIZE)]);
    }
}
