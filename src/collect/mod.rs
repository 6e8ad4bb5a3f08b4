//! Ingest path: the bounded queue/consumer (C4) and the line-protocol
//! server in front of it (C5).

pub mod queue;
pub mod server;

pub use queue::{spawn_queue_thread, QueueHandle, Sample};
pub use server::serve;
