#![allow(unsafe_code)]

use config::Config;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use watcher::{
    BacktraceSymbolizer, CoreState, Error, EventFilter, EventRecord, FaultBackend, FilterAction,
    ManualBackend, MutationDepth, PageBuffer, RegionId, RegionMetadata, Services, SystemClock,
    TrackFlags, UffdBackend, Watcher,
};

fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.engine.workers = 1;
    config.engine.poll_interval = Duration::from_millis(10);
    config.persistence.output_dir = dir.to_path_buf();
    config.persistence.fsync = false;
    config
}

fn services(backend: Arc<dyn FaultBackend>) -> Services {
    Services {
        backend,
        clock: Arc::new(SystemClock),
        symbolizer: Box::new(BacktraceSymbolizer),
        filter: None,
        scopes: None,
    }
}

fn wait_for(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out");
        std::thread::sleep(Duration::from_millis(2));
    }
}

unsafe fn register(
    watcher: &Watcher,
    buffer: &PageBuffer,
    depth: MutationDepth,
) -> Result<RegionId, Error> {
    // SAFETY: forwarded to the caller.
    unsafe {
        watcher.register_region(
            buffer.base_address(),
            buffer.len(),
            "value",
            TrackFlags::THREADS,
            depth,
        )
    }
}

#[test]
fn lifecycle_rejects_out_of_order_calls() {
    let dir = tempfile::tempdir().unwrap();
    let watcher = Watcher::new(
        test_config(dir.path()),
        services(Arc::new(ManualBackend::new())),
    );
    assert_eq!(watcher.state(), CoreState::Uninitialized);
    assert!(matches!(watcher.start(), Err(Error::State { .. })));

    watcher.initialize(dir.path(), 100).unwrap();
    assert!(matches!(
        watcher.pause(),
        Err(Error::State {
            operation: "pause",
            state: CoreState::Initialized
        })
    ));
    assert!(matches!(watcher.initialize(dir.path(), 100), Err(Error::State { .. })));

    watcher.start().unwrap();
    watcher.pause().unwrap();
    assert_eq!(watcher.state(), CoreState::Paused);
    watcher.resume().unwrap();
    assert!(watcher.stop(Duration::from_secs(5)).unwrap());
    assert_eq!(watcher.state(), CoreState::Stopped);

    let buffer = PageBuffer::new(1).unwrap();
    // SAFETY: the call fails before touching memory.
    let result = unsafe { register(&watcher, &buffer, MutationDepth::Full) };
    assert!(matches!(
        result,
        Err(Error::State {
            state: CoreState::Stopped,
            ..
        })
    ));
    assert!(matches!(watcher.stop(Duration::ZERO), Err(Error::State { .. })));
}

#[test]
fn unavailable_backend_moves_to_error() {
    let dir = tempfile::tempdir().unwrap();
    let watcher = Watcher::new(
        test_config(dir.path()),
        services(Arc::new(ManualBackend::unavailable("write interception disabled"))),
    );

    let err = watcher.initialize(dir.path(), 100).unwrap_err();
    assert!(matches!(err, Error::Platform(_)));
    assert_eq!(watcher.state(), CoreState::Error);
    assert!(watcher.error_message().contains("write interception disabled"));

    let buffer = PageBuffer::new(1).unwrap();
    // SAFETY: the call fails before touching memory.
    let result = unsafe { register(&watcher, &buffer, MutationDepth::Full) };
    assert!(matches!(result, Err(Error::State { state: CoreState::Error, .. })));
}

#[test]
fn registrations_are_armed_by_start_and_resume() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(ManualBackend::new());
    let watcher = Watcher::new(test_config(dir.path()), services(backend.clone()));
    watcher.initialize(dir.path(), 100).unwrap();

    let early = PageBuffer::new(1).unwrap();
    let late = PageBuffer::new(1).unwrap();
    // SAFETY: both buffers outlive the watcher.
    let early_id = unsafe { register(&watcher, &early, MutationDepth::Full) }.unwrap();
    assert!(!backend.is_armed(early.base_address()));

    watcher.start().unwrap();
    assert!(backend.is_armed(early.base_address()));

    watcher.pause().unwrap();
    // SAFETY: as above.
    let late_id = unsafe { register(&watcher, &late, MutationDepth::Full) }.unwrap();
    assert!(!backend.is_armed(late.base_address()));
    // Armed regions keep reporting while paused.
    early.write(0, &[1]);
    assert!(backend.notify_write(early.base_address()));

    watcher.resume().unwrap();
    assert!(backend.is_armed(late.base_address()));
    wait_for(|| watcher.metrics().events_processed == 1);

    let regions = watcher.regions();
    assert_eq!(regions.len(), 2);
    assert!(regions.iter().all(|r| r.armed));
    assert_eq!(watcher.read_snapshot(&early_id)[0], 1);
    assert!(watcher.update_metadata(
        &late_id,
        RegionMetadata {
            name: "renamed".into(),
            flags: TrackFlags::ALL,
            depth: MutationDepth::Full,
        }
    ));
    assert!(watcher.regions().iter().any(|r| r.name == "renamed"));

    watcher.stop(Duration::from_secs(5)).unwrap();
    assert_eq!(backend.armed_ranges(), 0);
    assert!(watcher.regions().is_empty());
}

#[test]
fn snapshot_round_trip_through_watcher() {
    let dir = tempfile::tempdir().unwrap();
    let watcher = Watcher::new(
        test_config(dir.path()),
        services(Arc::new(ManualBackend::new())),
    );
    watcher.initialize(dir.path(), 100).unwrap();
    let buffer = PageBuffer::new(1).unwrap();
    // SAFETY: buffer outlives the watcher.
    let id = unsafe { register(&watcher, &buffer, MutationDepth::Full) }.unwrap();

    let mut bytes = vec![0u8; buffer.len()];
    bytes[..3].copy_from_slice(&[1, 2, 3]);
    assert!(watcher.write_snapshot(&id, bytes.clone()));
    assert_eq!(watcher.read_snapshot(&id), bytes);
    assert!(!watcher.write_snapshot(&id, vec![1, 2, 3]));

    assert!(watcher.unregister(&id));
    assert!(watcher.read_snapshot(&id).is_empty());
}

#[test]
fn range_depth_ignores_writes_outside_window() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(ManualBackend::new());
    let watcher = Watcher::new(test_config(dir.path()), services(backend.clone()));
    watcher.initialize(dir.path(), 100).unwrap();
    watcher.start().unwrap();

    let buffer = PageBuffer::new(1).unwrap();
    // SAFETY: buffer outlives the watcher.
    unsafe { register(&watcher, &buffer, MutationDepth::Range { offset: 64, len: 8 }) }.unwrap();

    buffer.write(0, &[9]);
    backend.notify_write(buffer.base_address());
    wait_for(|| watcher.metrics().events_filtered == 1);
    buffer.write(66, &[9]);
    backend.notify_write(buffer.base_address() + 66);
    wait_for(|| watcher.metrics().events_processed == 1);
    watcher.stop(Duration::from_secs(5)).unwrap();
}

#[test]
fn forced_stop_counts_abandoned_events() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(ManualBackend::new());
    let filter: Arc<dyn EventFilter> =
        Arc::new(|_: &EventRecord| -> Result<FilterAction, Error> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(FilterAction::Pass)
        });
    let mut config = test_config(dir.path());
    config.enrichment.filter_timeout = Duration::from_secs(2);
    let mut services = services(backend.clone());
    services.filter = Some(filter);
    let watcher = Watcher::new(config, services);
    watcher.initialize(dir.path(), 100).unwrap();
    watcher.start().unwrap();

    let buffer = PageBuffer::new(1).unwrap();
    // SAFETY: buffer outlives the watcher.
    unsafe { register(&watcher, &buffer, MutationDepth::Full) }.unwrap();
    for i in 0..5u8 {
        buffer.write(usize::from(i), &[1]);
        backend.notify_write(buffer.base_address());
    }
    wait_for(|| watcher.metrics().events_received == 5);

    // The single worker is stuck in the filter with four events queued.
    let graceful = watcher.stop(Duration::from_millis(50)).unwrap();
    assert!(!graceful);
    let metrics = watcher.metrics();
    assert_eq!(metrics.events_lost_on_stop, 4);
    assert!(metrics.forced_detaches >= 1);
    assert!(metrics.events_dropped >= 4);
    assert_eq!(watcher.state(), CoreState::Stopped);
}

#[test]
fn queue_capacity_is_shared_by_all_workers() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(ManualBackend::new());
    let (entered_tx, entered_rx) = flume::bounded::<()>(1);
    let (gate_tx, gate_rx) = flume::bounded::<()>(0);
    let filter: Arc<dyn EventFilter> =
        Arc::new(move |_: &EventRecord| -> Result<FilterAction, Error> {
            let _ = entered_tx.try_send(());
            let _ = gate_rx.recv_timeout(Duration::from_secs(10));
            Ok(FilterAction::Pass)
        });
    let mut config = test_config(dir.path());
    config.engine.workers = 3;
    config.enrichment.filter_timeout = Duration::from_secs(10);
    let mut services = services(backend.clone());
    services.filter = Some(filter);
    let watcher = Watcher::new(config, services);
    watcher.initialize(dir.path(), 2).unwrap();
    watcher.start().unwrap();

    let buffer = PageBuffer::new(1).unwrap();
    // SAFETY: buffer outlives the watcher.
    unsafe { register(&watcher, &buffer, MutationDepth::Full) }.unwrap();
    buffer.write(0, &[1]);
    backend.notify_write(buffer.base_address());
    // The region's worker now holds the first event inside the filter.
    entered_rx.recv_timeout(Duration::from_secs(10)).unwrap();

    for _ in 0..10 {
        backend.notify_write(buffer.base_address());
    }
    wait_for(|| {
        let metrics = watcher.metrics();
        metrics.events_received + metrics.events_dropped == 11
    });
    let metrics = watcher.metrics();
    assert_eq!(metrics.events_received, 3);
    assert_eq!(metrics.events_dropped, 8);
    assert_eq!(metrics.queue_depth, 2);

    drop(gate_tx);
    wait_for(|| watcher.metrics().events_processed == 3);
    assert!(watcher.stop(Duration::from_secs(5)).unwrap());
    assert_eq!(watcher.metrics().events_dropped, 8);
}

#[test]
fn short_stop_wakes_an_idle_handler() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.engine.poll_interval = Duration::from_secs(30);
    let watcher = Watcher::new(config, services(Arc::new(ManualBackend::new())));
    watcher.initialize(dir.path(), 100).unwrap();
    watcher.start().unwrap();

    let started = Instant::now();
    assert!(watcher.stop(Duration::from_millis(200)).unwrap());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(watcher.metrics().forced_detaches, 0);
}

#[test]
fn userfaultfd_round_trip_or_clean_error() {
    let dir = tempfile::tempdir().unwrap();
    let watcher = Watcher::new(test_config(dir.path()), services(Arc::new(UffdBackend::new())));

    if let Err(err) = watcher.initialize(dir.path(), 100) {
        assert!(matches!(err, Error::Platform(_)));
        assert_eq!(watcher.state(), CoreState::Error);
        assert!(!watcher.error_message().is_empty());
        return;
    }
    watcher.start().unwrap();

    let buffer = PageBuffer::new(1).unwrap();
    // SAFETY: buffer outlives the watcher.
    if let Err(err) = unsafe { register(&watcher, &buffer, MutationDepth::Full) } {
        // Kernels without anonymous write-protect support refuse registration.
        assert!(matches!(err, Error::Platform(_)), "{err}");
        watcher.stop(Duration::from_secs(5)).unwrap();
        return;
    }

    buffer.write(0, &[5]);
    wait_for(|| watcher.metrics().events_processed == 1);
    buffer.write(1, &[6]);
    wait_for(|| watcher.metrics().events_processed == 2);
    assert!(watcher.stop(Duration::from_secs(5)).unwrap());

    let log = std::fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
    let records: Vec<EventRecord> = log
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].deltas[0].after, 5);
    assert_eq!(records[1].deltas[0].offset, 1);
    assert!(records.iter().all(|r| r.thread_id.is_some()));
}
