//! The shipped configuration loads and validates.

use probe_daq::config::{GateMode, Settings, TriggerMode};
use probe_daq::stream::StreamId;
use std::io::Write;

#[test]
fn test_shipped_config_is_valid() {
    let settings = Settings::load_from("config/probe_daq.toml").expect("load shipped config");
    settings.validate().expect("valid");
    assert_eq!(settings.trigger.mode, TriggerMode::Spike);
    assert_eq!(settings.gate.mode, GateMode::Immediate);

    let specs = settings.stream_specs().expect("specs");
    assert_eq!(specs.len(), 2);
    assert_eq!(specs[0].id, StreamId::Imec(0));
    assert_eq!(specs[0].saved_channels().len(), 65);
    assert_eq!(specs[1].id, StreamId::Nidq);
}

#[test]
fn test_config_from_temp_file() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().expect("tempfile");
    writeln!(
        file,
        r#"
        [nidq]
        n_chans = 2

        [trigger]
        mode = "remote_gate"
        "#
    )
    .expect("write");

    let settings = Settings::load_from(file.path()).expect("load");
    // remote_gate needs the remote gate.
    assert!(settings.validate().is_err());
}
