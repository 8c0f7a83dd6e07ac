//! Coordinator background tasks.
//!
//! Each task loops until its `CancellationToken` is cancelled.

pub mod event_consumer;
pub mod health_checker;
pub mod resync;
pub mod sfu_directory;

pub use event_consumer::start_viewer_event_consumer;
pub use health_checker::start_sfu_health_checker;
pub use resync::start_viewer_resync;
pub use sfu_directory::start_sfu_directory_sync;
