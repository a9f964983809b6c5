//! Whole-run tests: synthetic sources, every thread running.

use probe_daq::acquire::{ScanSource, SyntheticConfig, SyntheticSource};
use probe_daq::config::Settings;
use probe_daq::data::MemoryStorage;
use probe_daq::error::DaqError;
use probe_daq::remote::FetchRequest;
use probe_daq::stream::StreamId;
use probe_daq::{Run, RunChannels};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const TIMED: &str = r#"
    [run]
    run_name = "timed"
    queue_secs = 2.0
    loop_ms = 10

    [nidq]
    sample_rate = 2000.0
    n_chans = 3

    [gate]
    mode = "software"

    [trigger]
    mode = "timed"

    [trigger.timed]
    th_secs = 0.1
    tl_secs = 0.05
    n_high = 2

    [display]
    fetch_ms = 10
"#;

fn sources(settings: &Settings) -> HashMap<StreamId, Box<dyn ScanSource>> {
    settings
        .stream_specs()
        .expect("specs")
        .into_iter()
        .map(|spec| {
            let id = spec.id;
            let src = SyntheticSource::new(spec, SyntheticConfig::default()).expect("source");
            (id, Box::new(src) as Box<dyn ScanSource>)
        })
        .collect()
}

#[test]
fn test_timed_run_writes_n_high_segments() {
    let settings = Settings::from_toml_str(TIMED).expect("parse");
    let mem = MemoryStorage::new();
    let src = sources(&settings);
    let (gtx, mut grx) = mpsc::channel(64);
    let channels = RunChannels {
        graph: Some(gtx),
        events: None,
    };
    let mut run = Run::start(settings, Arc::new(mem.clone()), src, channels).expect("start");

    assert!(run.set_software_gate(true).expect("gate"));
    let deadline = Instant::now() + Duration::from_secs(5);
    while run.is_recording_enabled() && Instant::now() < deadline {
        assert!(run.poll().is_none());
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!run.is_recording_enabled(), "timed trigger never finished");

    let reply = run
        .fetch(&FetchRequest::new(StreamId::Nidq, 0, 50))
        .expect("fetch while running");
    assert_eq!(reply.n_chans, 3);
    assert!(grx.try_recv().is_ok(), "display saw no data");

    run.stop();
    let segs = mem.segments();
    assert_eq!(segs.len(), 2);
    for (i, s) in segs.iter().enumerate() {
        assert!(s.closed);
        assert_eq!(s.n_scans(), 200);
        assert_eq!((s.key.g, s.key.t), (0, i as u32));
    }
    assert_eq!(run.stats().segments_closed, 2);
}

#[test]
fn test_stop_releases_queues_after_threads() {
    let settings = Settings::from_toml_str(TIMED).expect("parse");
    let mem = MemoryStorage::new();
    let src = sources(&settings);
    let mut run = Run::start(settings, Arc::new(mem.clone()), src, RunChannels::default()).expect("start");

    let q = run.queue(StreamId::Nidq).expect("queue while running");
    run.set_software_gate(true).expect("gate");
    thread::sleep(Duration::from_millis(120));
    run.stop();

    // Readers are joined: the queue no longer grows.
    let head = q.head_ct();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(q.head_ct(), head);
    assert!(head > 0);

    // The trigger closed its segment before the queues were released.
    assert!(mem.segments().iter().all(|s| s.closed));
    assert!(run.queue(StreamId::Nidq).is_none());
    assert_eq!(run.scan_count(StreamId::Nidq), 0);
    assert!(matches!(run.rgt_set_gate(true), Err(DaqError::NotRunning)));
    assert!(matches!(run.reset_counters(), Err(DaqError::NotRunning)));

    run.stop();
    assert!(run.failure().is_none());
}

#[test]
fn test_counters_can_be_forced_and_reset() {
    let settings = Settings::from_toml_str(TIMED).expect("parse");
    let src = sources(&settings);
    let run = Run::start(settings, Arc::new(MemoryStorage::new()), src, RunChannels::default()).expect("start");

    run.force_counters(4, 7).expect("force");
    let c = run.counters();
    assert_eq!((c.g, c.t), (4, 7));
    run.reset_counters().expect("reset");
    let c = run.counters();
    assert_eq!((c.g, c.t), (0, 0));
}
