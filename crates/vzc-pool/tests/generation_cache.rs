//! Frame-to-frame reuse, eviction and reference counting through the
//! public API.

use std::sync::Arc;
use std::thread;
use vzc_pool::mock::{MockAllocator, MockPicture, MockPort};
use vzc_pool::{
    default_completion, HardwarePort, PictureRef, PoolConfig, PoolController, PortStatus, Rect,
    ZeroCopyPool,
};

fn controller(max_free: usize) -> (PoolController, Arc<MockAllocator>) {
    let allocator = Arc::new(MockAllocator::new());
    let config = PoolConfig::default().with_max_free_entries(max_free);
    (PoolController::new(&config, allocator.clone()).unwrap(), allocator)
}

#[test]
fn three_recycled_entries_with_bound_two_evict_the_first() {
    let (pool, allocator) = controller(2);

    let entries: Vec<_> = (0..3).map(|_| pool.acquire(1000).unwrap()).collect();
    let ids: Vec<_> = entries.iter().map(|e| e.id()).collect();
    for entry in entries {
        drop(entry);
    }

    let stats = pool.stats();
    assert_eq!(stats.free, 2);
    assert_eq!(stats.evictions, 1);
    assert_eq!(allocator.live_blocks(), 2);

    let survivors = [pool.acquire(1000).unwrap(), pool.acquire(1000).unwrap()];
    assert!(survivors.iter().all(|e| e.id() != ids[0]));
}

#[test]
fn same_picture_two_frames_allocates_once() {
    let (pool, allocator) = controller(8);
    let pic: PictureRef = MockPicture::yuv420(320, 240, 16);

    let first = pool.submit_for_frame(&pic, true).unwrap();
    let seq = first.entry.seq();
    let second = pool.submit_for_frame(&pic, true).unwrap();

    assert_eq!(second.entry.id(), first.entry.id());
    assert_eq!(second.entry.seq(), seq);
    assert_eq!(allocator.allocations(), 1);
    assert_eq!(pool.stats().copies, 1);
}

#[test]
fn small_request_then_larger_request_best_fits_same_entry() {
    let (pool, allocator) = controller(8);

    let small = pool.acquire(5000).unwrap();
    assert_eq!(small.size(), 65536);
    let id = small.id();
    drop(small);

    let larger = pool.acquire(60000).unwrap();
    assert_eq!(larger.id(), id);
    assert_eq!(allocator.allocations(), 1);
}

#[test]
fn free_pool_never_exceeds_bound() {
    let (pool, _allocator) = controller(3);

    for round in 0..20usize {
        let held: Vec<_> = (0..(round % 7) + 1)
            .map(|i| pool.acquire(1000 * (i + 1)).unwrap())
            .collect();
        drop(held);
        assert!(pool.stats().free <= 3);
    }
}

#[test]
fn sequence_numbers_are_never_zero_and_increase() {
    let (pool, _allocator) = controller(2);
    let mut last = 0;
    for _ in 0..100 {
        let e = pool.acquire(10).unwrap();
        assert_ne!(e.seq(), 0);
        assert!(e.seq() > last);
        last = e.seq();
    }
}

#[test]
fn missed_frame_hints_still_find_pictures() {
    let (pool, allocator) = controller(8);
    let pics: Vec<PictureRef> = (0..3)
        .map(|i| MockPicture::solid(16, 16, i) as PictureRef)
        .collect();

    for _frame in 0..10 {
        // No frame ever starts with the hint set.
        for pic in &pics {
            drop(pool.submit_for_frame(pic, false).unwrap());
        }
    }
    assert_eq!(allocator.allocations(), 3);
    assert_eq!(pool.stats().copies, 3);
}

#[test]
fn changing_pictures_cycle_through_free_pool() {
    let (pool, allocator) = controller(4);

    for frame in 0..50u8 {
        let pic: PictureRef = MockPicture::solid(64, 64, frame);
        drop(pool.submit_for_frame(&pic, true).unwrap());
    }

    // Two generations plus the free pool; nothing grows without bound.
    assert!(allocator.live_blocks() <= 3);
    assert_eq!(pool.stats().copies, 50);
}

#[test]
fn concurrent_completions_free_every_block_exactly_once() {
    let allocator = Arc::new(MockAllocator::new());
    let config = PoolConfig::default()
        .with_max_free_entries(4)
        .with_header_count(64);
    let pool = ZeroCopyPool::new(&config, allocator.clone()).unwrap();
    let port = Arc::new(MockPort::new("display"));
    port.enable(default_completion("display")).unwrap();

    let completer = {
        let port = Arc::clone(&port);
        thread::spawn(move || {
            for _ in 0..2000 {
                port.complete_all(PortStatus::Ok);
                thread::yield_now();
            }
        })
    };

    let mut kept: Vec<PictureRef> = Vec::new();
    for frame in 0..300u32 {
        if frame % 3 == 0 {
            kept.clear();
        }
        while kept.len() < 3 {
            kept.push(MockPicture::solid(32, 32, (frame % 251) as u8));
        }
        for (i, pic) in kept.iter().enumerate() {
            match pool.buffer_from_picture(pic, i == 0, Rect::default(), 255) {
                Ok(buf) => {
                    if let Err(e) = port.send(buf) {
                        drop(e.buffer);
                    }
                }
                Err(e) => assert!(e.is_transient(), "unexpected error: {e}"),
            }
        }
    }

    completer.join().unwrap();
    port.disable();
    pool.shutdown();
    drop(kept);
    drop(pool);

    assert_eq!(allocator.live_blocks(), 0);
    assert_eq!(allocator.frees(), allocator.allocations());
}
