//! End-to-end tests for the scan pipeline.
//!
//! Every test runs the real detection loop, lifecycle and worker pool
//! against `ImageInspector`, so client appearance, memory layout and OS
//! failures are fully scripted.

use crossbeam::channel::Receiver;
use keygrab::comms::events::{ChannelSink, ScanEvent};
use keygrab::config::Config;
use keygrab::inspect::image::{ImageInspector, MemoryImage};
use keygrab::inspect::ProcessInspector;
use keygrab::keys::{ClaimError, Direction};
use keygrab::scanner::process::{MonitoredProcess, QueueEntry};
use keygrab::scanner::worker::spawn_worker;
use keygrab::scanner::{encode_block, KeyGrabber, LifecycleState, MemoryRegion};
use keygrab::KeyStore;
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

const GAME: &str = "PathOfExile_x64.exe";
const KEY: [u32; 8] = [
    0x1111_1111, 0x2222_2222, 0x3333_3333, 0x4444_4444,
    0x5555_5555, 0x6666_6666, 0x7777_7777, 0x8888_8888,
];
const IV: [u32; 2] = [0xAAAA_AAAA, 0xBBBB_BBBB];
const TIMEOUT: Duration = Duration::from_secs(5);

fn fast_config() -> Config {
    let mut cfg = Config::default();
    cfg.detection.idle_poll = Duration::from_millis(10);
    cfg.detection.active_poll = Duration::from_millis(10);
    cfg.scanner.query_backoff = Duration::from_millis(10);
    cfg.scanner.queue_wait = Duration::from_millis(10);
    cfg.scanner.empty_queue_sleep = Duration::from_millis(2);
    cfg
}

fn heap_with_key(offset: usize, key: [u32; 8], iv: [u32; 2]) -> Vec<u8> {
    let mut bytes = vec![0u8; 4096];
    let block = encode_block(&key, &iv);
    bytes[offset..offset + block.len()].copy_from_slice(&block);
    bytes
}

fn grabber(inspector: &ImageInspector) -> (Arc<KeyGrabber>, Receiver<ScanEvent>) {
    let (sink, rx) = ChannelSink::unbounded();
    let grabber = KeyGrabber::new(fast_config(), Arc::new(inspector.clone()), Arc::new(sink));
    (Arc::new(grabber), rx)
}

fn start(grabber: &Arc<KeyGrabber>) -> thread::JoinHandle<()> {
    let grabber = Arc::clone(grabber);
    thread::spawn(move || grabber.run())
}

/// Receives events until one matches `wanted`.
fn wait_for(rx: &Receiver<ScanEvent>, wanted: &ScanEvent) {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(left) {
            Ok(ev) if &ev == wanted => return,
            Ok(_) => continue,
            Err(_) => panic!("timed out waiting for {wanted:?}"),
        }
    }
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting until {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn found_key_is_claimed_and_scan_stopped() {
    let inspector = ImageInspector::new();
    inspector.spawn(100, GAME, MemoryImage::new().with_heap(0x50000, heap_with_key(0x200, KEY, IV)));
    let (grabber, rx) = grabber(&inspector);
    let detector = start(&grabber);

    wait_for(&rx, &ScanEvent::ClientStarted { pid: 100 });
    wait_for(&rx, &ScanEvent::CandidateFound { pid: 100, address: 0x50200 });

    let store = grabber.store();
    let key = store.search(1, Direction::Receive, None).expect("candidate offered");
    assert_eq!(key.key(), &KEY);
    assert_eq!(key.iv(), &IV);
    assert_eq!(key.found_address(), Some(0x50200));
    assert_eq!(store.claim(&key, 1), Ok(()));

    assert!(grabber.stop_scan(100));
    wait_for(&rx, &ScanEvent::ScanEnded { pid: 100 });
    assert_eq!(grabber.client_state(100), Some(LifecycleState::Stopped));
    assert_eq!(inspector.open_handles(), 0);

    // a claimed key is gone for good
    assert_eq!(store.claim(&key, 1), Err(ClaimError::NotPresent { stream_id: 1, pid: 100 }));
    wait_for(&rx, &ScanEvent::ClaimError { stream_id: 1, pid: 100 });

    grabber.shutdown();
    detector.join().unwrap();
}

#[test]
fn unclaimed_candidates_are_purged_when_scan_ends() {
    let inspector = ImageInspector::new();
    let image = MemoryImage::new()
        .with_heap(0x50000, heap_with_key(0, KEY, IV))
        .with_heap(0x60000, heap_with_key(0x400, [9; 8], [1, 2]));
    inspector.spawn(101, GAME, image);
    let (grabber, rx) = grabber(&inspector);
    let detector = start(&grabber);

    wait_for(&rx, &ScanEvent::ScanStarted { pid: 101 });
    let store = grabber.store();
    // two workers, so the regions may finish in either order
    wait_until("both keys are found", || store.len() == 2);

    grabber.stop_scan(101);
    wait_for(&rx, &ScanEvent::ScanEnded { pid: 101 });
    assert!(store.is_empty());
    assert_eq!(store.stats().purged, 2);

    grabber.shutdown();
    detector.join().unwrap();
}

#[test]
fn rescanning_does_not_duplicate_candidates() {
    let inspector = ImageInspector::new();
    inspector.spawn(102, GAME, MemoryImage::new().with_heap(0x50000, heap_with_key(0, KEY, IV)));
    let (grabber, rx) = grabber(&inspector);
    let detector = start(&grabber);

    wait_for(&rx, &ScanEvent::CandidateFound { pid: 102, address: 0x50000 });
    let store = grabber.store();
    // several passes over the same memory
    wait_until("duplicates are seen", || store.stats().duplicates >= 2);
    assert_eq!(store.len(), 1);

    grabber.shutdown();
    detector.join().unwrap();
}

#[test]
fn zeroed_slots_never_reach_the_pool() {
    let mut wiped = KEY;
    wiped[0] = 0;
    wiped[3] = 0;
    wiped[7] = 0;
    let inspector = ImageInspector::new();
    inspector.spawn(103, GAME, MemoryImage::new().with_heap(0x50000, heap_with_key(0x100, wiped, IV)));
    let (grabber, rx) = grabber(&inspector);
    let detector = start(&grabber);

    wait_for(&rx, &ScanEvent::ScanStarted { pid: 103 });
    let store = grabber.store();
    wait_until("the zeroed slot is scanned", || store.stats().zeroed >= 1);
    assert!(store.is_empty());

    grabber.shutdown();
    detector.join().unwrap();
}

#[test]
fn unreadable_regions_do_not_stop_the_scan() {
    let inspector = ImageInspector::new();
    let image = MemoryImage::new()
        .with_heap(0x40000, heap_with_key(0, [3; 8], [3, 3]))
        .with_heap(0x50000, heap_with_key(0, [4; 8], [4, 4]))
        .with_heap(0x60000, heap_with_key(0x300, KEY, IV))
        .with_partial_copy(0x40000)
        .with_read_error(0x50000, 299);
    inspector.spawn(104, GAME, image);
    let (grabber, rx) = grabber(&inspector);
    let detector = start(&grabber);

    wait_for(&rx, &ScanEvent::CandidateFound { pid: 104, address: 0x60300 });
    assert_eq!(grabber.store().len(), 1);

    grabber.shutdown();
    detector.join().unwrap();
}

#[test]
fn access_denied_ends_the_scan_until_rescan_is_requested() {
    let inspector = ImageInspector::new();
    inspector.spawn(105, GAME, MemoryImage::new().with_heap(0x50000, vec![0; 4096]).deny_queries_after(4));
    let (grabber, rx) = grabber(&inspector);

    // the lifecycle runs inline, so this returns once the scan has ended
    assert_eq!(grabber.poll_once(), 1);
    assert_eq!(grabber.client_state(105), Some(LifecycleState::Stopped));
    assert_eq!(inspector.open_handles(), 0);
    let events: Vec<_> = rx.try_iter().collect();
    assert_eq!(
        events,
        vec![
            ScanEvent::ClientStarted { pid: 105 },
            ScanEvent::ScanStarted { pid: 105 },
            ScanEvent::ScanEnded { pid: 105 },
        ]
    );

    // still listed, but already done
    grabber.poll_once();
    assert_eq!(inspector.opened_total(), 1);

    assert!(grabber.request_rescan(105));
    grabber.poll_once();
    assert_eq!(inspector.opened_total(), 2);
    assert_eq!(inspector.open_handles(), 0);
}

#[test]
fn exited_client_is_reported_and_forgotten() {
    let inspector = ImageInspector::new();
    inspector.spawn(106, GAME, MemoryImage::new().with_heap(0x50000, heap_with_key(0, KEY, IV)));
    let (grabber, rx) = grabber(&inspector);
    let detector = start(&grabber);

    wait_for(&rx, &ScanEvent::CandidateFound { pid: 106, address: 0x50000 });
    inspector.kill(106);
    wait_for(&rx, &ScanEvent::ScanEnded { pid: 106 });
    wait_for(&rx, &ScanEvent::ClientStopped { pid: 106 });
    wait_until("the record is dropped", || grabber.client_state(106).is_none());
    assert!(grabber.store().is_empty());
    assert_eq!(inspector.open_handles(), 0);

    grabber.shutdown();
    detector.join().unwrap();
}

#[test]
fn clients_are_scanned_one_after_another() {
    let inspector = ImageInspector::new();
    inspector.spawn(200, GAME, MemoryImage::new().with_heap(0x50000, heap_with_key(0, KEY, IV)));
    inspector.spawn(201, "PathOfExile.exe", MemoryImage::new().with_heap(0x70000, heap_with_key(0, [5; 8], IV)));
    let (grabber, rx) = grabber(&inspector);
    let detector = start(&grabber);

    wait_for(&rx, &ScanEvent::CandidateFound { pid: 200, address: 0x50000 });
    assert_eq!(grabber.client_state(201), None);

    grabber.stop_scan(200);
    wait_for(&rx, &ScanEvent::ScanEnded { pid: 200 });
    wait_for(&rx, &ScanEvent::ClientStarted { pid: 201 });
    wait_for(&rx, &ScanEvent::CandidateFound { pid: 201, address: 0x70000 });
    assert_eq!(grabber.client_state(200), Some(LifecycleState::Stopped));

    grabber.shutdown();
    detector.join().unwrap();
    assert_eq!(grabber.client_state(201), Some(LifecycleState::Stopped));
    assert_eq!(inspector.open_handles(), 0);
}

#[test]
fn one_sentinel_per_worker_stops_every_worker() {
    const WORKERS: usize = 3;
    let inspector = ImageInspector::new();
    inspector.spawn(300, GAME, MemoryImage::new().with_heap(0x50000, heap_with_key(0, KEY, IV)));
    let process = MonitoredProcess::new(300);
    process.install_handle(inspector.open(300).unwrap());

    let store = Arc::new(KeyStore::default());
    let cfg = fast_config().scanner;
    let handles: Vec<_> = (0..WORKERS)
        .map(|i| {
            let guard = process.enter_worker().unwrap();
            spawn_worker(i, guard, Arc::clone(&store), &cfg).unwrap()
        })
        .collect();
    assert_eq!(process.active_workers(), WORKERS);

    process.queue().push(MemoryRegion { base: 0x50000, len: 4096 });
    process.queue().push_terminate(WORKERS);
    process.wait_workers_idle();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(process.active_workers(), 0);
    // every sentinel was consumed, so no worker took two
    assert_eq!(process.queue().pop_within(Duration::ZERO), None::<QueueEntry>);
    assert_eq!(store.len(), 1);

    process.close_handle();
    assert_eq!(inspector.open_handles(), 0);
}
