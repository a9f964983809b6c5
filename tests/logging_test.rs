//! Global subscriber installation; kept in its own binary since it claims
//! the process-wide dispatcher.

use probe_daq::config::Settings;
use probe_daq::logging::{self, LoggingConfig, OutputFormat};
use tracing::Level;

#[test]
fn test_init_is_idempotent() {
    assert!(logging::init(LoggingConfig::new(Level::WARN)).is_ok());
    assert!(logging::init(LoggingConfig::new(Level::DEBUG).with_format(OutputFormat::Json)).is_ok());
    assert!(logging::init_from_settings(&Settings::default()).is_ok());
    tracing::warn!("logging installed");
}
