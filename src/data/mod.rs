//! Sample buffering, filtering, edge search and segment storage.
pub mod edge;
pub mod iir_filter;
pub mod sample_queue;
pub mod storage;
pub mod subset;

pub use edge::{EdgeFilter, EdgeScanner, Polarity};
pub use sample_queue::{Fetch, QueueBlock, SampleQueue};
pub use storage::{FileStorage, MemoryStorage, SegmentKey, SegmentStorage, SegmentWriter};
