//! # Probe DAQ Core Library
//!
//! Acquisition core for multi-probe electrophysiology rigs. Every active
//! stream (one per probe plus an optional auxiliary "nidq" stream) is
//! buffered in a bounded [`data::SampleQueue`]; a gate enables a trigger
//! policy which decides when segments are written; segments from all streams
//! are recorded in parallel by a pool of writer threads.
//!
//! ## Crate Structure
//!
//! - **`acquire`**: Scan sources and the reader threads that fill the queues.
//! - **`config`**: Figment-backed `Settings`, loaded from TOML and environment.
//! - **`data`**: Sample queues, IIR filters, edge scanning, channel subsets and
//!   segment storage.
//! - **`display`**: The graph fetcher feeding a live display.
//! - **`error`**: The `DaqError` enum used across the crate.
//! - **`gate`**: Immediate, software, TTL and remote gate sources.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`remote`**: Remote data fetch requests and their binary replies.
//! - **`run`**: The run controller, owning every thread of one acquisition.
//! - **`stream`**: Stream identities, descriptors and the registry.
//! - **`sync`**: Stop flags and the worker wake/dispatch rendezvous.
//! - **`timing`**: Scan counter to time mapping.
//! - **`trigger`**: The trigger thread, its policies and the writer pool.

pub mod acquire;
pub mod config;
pub mod data;
pub mod display;
pub mod error;
pub mod gate;
pub mod logging;
pub mod remote;
pub mod run;
pub mod stream;
pub mod sync;
pub mod timing;
pub mod trigger;

pub use error::{AppResult, DaqError};
pub use run::{Run, RunChannels};
