//! Event transport pipeline: bounded queue, dedicated worker, gzip framing,
//! HTTP delivery and failure back-off (`spec.md` §4.6-§4.8).

mod buffer;
mod queue;
mod sender;
mod state;
mod sync;

pub use buffer::GzipBuffer;
pub use queue::{EventQueue, EventRecord, WorkerConfig, WorkerHandle};
pub use sender::{HttpSender, Sender};
pub use state::FailureState;
pub use sync::SyncPipeline;
