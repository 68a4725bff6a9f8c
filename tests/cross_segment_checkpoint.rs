//! Cross-segment FEC scenarios: blocks decoded in one segment unblock a
//! cross-segment, whose reconstruction cascades back into other segments.

mod support;

use rand::rngs::StdRng;
use rand::SeedableRng;
use splitstor::{
    CrossSegmentGeometry, FecCodec, ReedSolomonCodec, StoreConfig, BLOCK_DATA_LENGTH,
};
use support::*;
use tempfile::tempdir;

#[test]
fn cross_segment_cascades_recovery_across_segments() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("splitfile.bin");

    // Two segments, one data block each plus one cross-check block. The
    // cross-segment spans both segments' data blocks and owns both
    // cross-check blocks.
    let d0 = plaintext_block(1);
    let d1 = plaintext_block(2);
    let codec = ReedSolomonCodec::new();
    let mut cross_check = vec![vec![0u8; BLOCK_DATA_LENGTH]; 2];
    codec
        .encode(
            &[d0.clone(), d1.clone()],
            &mut cross_check,
            &[false, false],
            BLOCK_DATA_LENGTH,
        )
        .unwrap();

    let plan0 = plan_segment(vec![d0.clone(), cross_check[0].clone()], 1, 1);
    let plan1 = plan_segment(vec![d1.clone(), cross_check[1].clone()], 1, 1);
    let cross = CrossSegmentGeometry {
        data_segments: vec![0, 1],
        check_segments: vec![0, 1],
    };
    let fixture = create_store(&path, &[&plan0, &plan1], vec![cross], StoreConfig::default());

    let cross_segment = fixture.store.cross_segment(0).unwrap().clone();
    let refs = cross_segment.block_refs().to_vec();
    assert_eq!(refs.len(), 4);
    // With one data and one cross-check block per segment the allocation
    // has no freedom: block 0 then block 1 of each segment.
    assert_eq!((refs[0].segment, refs[0].block_number), (0, 0));
    assert_eq!((refs[1].segment, refs[1].block_number), (1, 0));
    assert_eq!((refs[2].segment, refs[2].block_number), (0, 1));
    assert_eq!((refs[3].segment, refs[3].block_number), (1, 1));

    // Feed only segment 0. Its decode satisfies the cross-segment, which
    // reconstructs segment 1's data block and hands it back; that in turn
    // lets segment 1 decode without ever seeing the network.
    assert!(deliver(&fixture.store, &plan0, 0));
    assert!(deliver(&fixture.store, &plan0, 1));

    assert!(wait_for(wait_timeout(), || fixture.store.all_succeeded()));
    assert!(cross_segment.has_succeeded());
    assert!(wait_for(wait_timeout(), || fixture.store.all_finished()));

    let mut out = Vec::new();
    fixture.store.write_out(&mut out).unwrap();
    let expected: Vec<u8> = d0.iter().chain(d1.iter()).copied().collect();
    assert_eq!(out, expected);

    let events = fixture.callbacks.events();
    assert!(events.contains(&("success", 0)));
    assert!(events.contains(&("success", 1)));
}

#[test]
fn cross_block_allocation_is_deterministic() {
    let plan = plan_segment(
        (0u8..8).map(|i| plaintext_block(40 + i)).collect(),
        2,
        2,
    );

    let picks = |seed: u64| -> (Vec<usize>, Vec<usize>) {
        let dir = tempdir().unwrap();
        let fixture = create_store(
            &dir.path().join("splitfile.bin"),
            &[&plan],
            Vec::new(),
            StoreConfig::default(),
        );
        let segment = fixture.store.segment(0).unwrap().clone();
        let mut rng = StdRng::seed_from_u64(seed);
        let data: Vec<usize> = (0..3)
            .map(|_| segment.allocate_cross_data_block(0, &mut rng).unwrap())
            .collect();
        let check: Vec<usize> = (0..2)
            .map(|_| segment.allocate_cross_check_block(0, &mut rng).unwrap())
            .collect();
        (data, check)
    };

    let (data_a, check_a) = picks(7);
    let (data_b, check_b) = picks(7);
    assert_eq!(data_a, data_b);
    assert_eq!(check_a, check_b);

    // Data picks come from the data range, check picks from the
    // cross-check range, all distinct.
    let segment_data_blocks = 8 - 2;
    for &block in &data_a {
        assert!(block < segment_data_blocks);
    }
    for &block in &check_a {
        assert!((segment_data_blocks..8).contains(&block));
    }
    let mut all = data_a.clone();
    all.extend(&check_a);
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 5);
}
