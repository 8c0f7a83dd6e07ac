//! # Stream Controller Test Utilities
//!
//! Test doubles and fixtures shared by the coordinator, quality controller
//! and chat store integration tests.
//!
//! - `mock_bus` - event buses that duplicate, reorder or refuse delivery
//! - `mock_dispatcher` - layer switch dispatcher with scripted failures
//! - `fixtures` - SFU fleets, bitrate series and chat bursts
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sc_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let bus = Arc::new(ChaoticEventBus::new());
//!     let coordinator = TestFleet::new()
//!         .with_server("sfu-a", 100)
//!         .with_server("sfu-b", 100)
//!         .build_with_bus(bus.clone());
//!     // ...
//! }
//! ```

pub mod fixtures;
pub mod mock_bus;
pub mod mock_dispatcher;

pub use fixtures::*;
pub use mock_bus::*;
pub use mock_dispatcher::*;
