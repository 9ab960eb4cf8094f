//! Scenario: process A creates an MMF, allocates pages, writes a known
//! pattern; process B (simulated by a second `MmfAllocator` handle on
//! the same tempfile) opens, `AddRef`s, reads the pattern back, frees;
//! process A frees; directory slot and bitfield bits must end up clear.

use std::sync::Arc;

use anchormem::process::DefaultProcessProvider;
use anchormem::{MmfAllocator, Stats};

#[test]
fn two_handles_share_pages_and_converge_to_empty() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let path = tmp.path().to_path_buf();

    let process_a = MmfAllocator::create(
        &path,
        1024 * 1024 * 1024,
        4 * 1024 * 1024,
        Arc::new(DefaultProcessProvider),
        64,
        Arc::new(Stats::default()),
    )
    .unwrap();

    let segment = process_a.allocate_pages(10).unwrap();
    let pattern: Vec<u8> = (0..segment.len()).map(|i| (i % 251) as u8).collect();
    unsafe {
        segment.as_mut_slice().copy_from_slice(&pattern);
    }
    let id = process_a.to_block_id(segment);

    let process_b = MmfAllocator::open(&path, Arc::new(DefaultProcessProvider), 64, Arc::new(Stats::default())).unwrap();
    let seg_b = process_b.from_block_id(id);
    assert_eq!(seg_b.len(), segment.len());
    unsafe {
        assert_eq!(seg_b.as_slice(), pattern.as_slice());
    }
    assert_eq!(process_b.add_ref_pages(seg_b).unwrap(), 2);
    assert_eq!(process_b.free_pages(seg_b).unwrap(), false);

    assert!(process_a.free_pages(segment).unwrap());
    process_a.debug_validate().unwrap();
    process_b.debug_validate().unwrap();

    let reused = process_a.allocate_pages(10).unwrap();
    assert_eq!(reused.len(), segment.len());
    process_a.free_pages(reused).unwrap();
}
