//! Dispatcher/worker rendezvous under uneven worker speed.

use probe_daq::error::DaqError;
use probe_daq::sync::WorkerSync;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn spawn_worker(sync: Arc<WorkerSync>, delay: Duration, done: Arc<AtomicUsize>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut seen = 0;
        let mut last = Ok(());
        while sync.wake(last, &mut seen) {
            thread::sleep(delay);
            done.fetch_add(1, Ordering::SeqCst);
            last = Ok(());
        }
    })
}

#[test]
fn test_dispatch_waits_for_slow_worker() {
    let sync = Arc::new(WorkerSync::new(Duration::from_millis(1)));
    let done = Arc::new(AtomicUsize::new(0));
    let fast = spawn_worker(Arc::clone(&sync), Duration::ZERO, Arc::clone(&done));
    let slow = spawn_worker(Arc::clone(&sync), Duration::from_millis(60), Arc::clone(&done));
    sync.wait_ready(2);

    let t = Instant::now();
    let mut local_ran = false;
    sync.dispatch(2, || {
        local_ran = true;
        Ok(())
    })
    .expect("dispatch");

    assert!(local_ran);
    assert!(t.elapsed() >= Duration::from_millis(60));
    assert_eq!(done.load(Ordering::SeqCst), 2);
    assert_eq!(sync.awake_count(), 2);
    assert_eq!(sync.asleep_count(), 2);

    sync.kill();
    fast.join().expect("fast worker");
    slow.join().expect("slow worker");
}

#[test]
fn test_kill_releases_sleeping_workers() {
    let sync = Arc::new(WorkerSync::new(Duration::from_millis(1)));
    let done = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..3)
        .map(|_| spawn_worker(Arc::clone(&sync), Duration::ZERO, Arc::clone(&done)))
        .collect();
    sync.wait_ready(3);
    sync.kill();
    for h in handles {
        h.join().expect("worker");
    }
    assert_eq!(done.load(Ordering::SeqCst), 0);
}

#[test]
fn test_worker_error_reaches_dispatcher() {
    let sync = Arc::new(WorkerSync::new(Duration::from_millis(1)));
    let h = {
        let sync = Arc::clone(&sync);
        thread::spawn(move || {
            let mut seen = 0;
            let mut last = Ok(());
            while sync.wake(last, &mut seen) {
                last = Err(DaqError::storage("imec0", "disk full"));
            }
        })
    };
    sync.wait_ready(1);
    let err = sync.dispatch(1, || Ok(())).expect_err("worker failure");
    assert!(err.is_fatal());
    assert_eq!(err.to_string(), "Storage error on imec0: disk full");

    // The next cycle starts clean.
    let err = sync.dispatch(1, || Ok(())).expect_err("still failing");
    assert!(matches!(err, DaqError::Storage { .. }));
    sync.kill();
    h.join().expect("worker");
}
