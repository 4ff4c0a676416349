//! # Split Keeper
//!
//! Records speedrun splits and tracks the best run per category.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       SPLIT KEEPER                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  splits/          - Run records (filesystem only)            │
//! │  ├── codec.rs     - Run document JSON format                 │
//! │  ├── store.rs     - Run and best documents on disk           │
//! │  └── reconcile.rs - Best-time policy, per-category locking   │
//! │                                                              │
//! │  network/         - Serving                                  │
//! │  ├── http.rs      - HTTP/1.x request and response framing    │
//! │  ├── router.rs    - Method/path dispatch, status mapping     │
//! │  └── server.rs    - TCP accept loop and shutdown             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Layout on disk
//!
//! Every request path names a category directory under the serving root.
//! Each submission is kept as `<category>/<timestamp>.json`; the fastest
//! run so far lives in `<category>/best.json`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod network;
pub mod splits;

// Re-export commonly used types
pub use network::server::{ServerConfig, SplitServer, SplitServerError};
pub use splits::{GameSplit, ReconcileOutcome, Reconciler, SplitEntry};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Port listened on when none is given.
pub const DEFAULT_PORT: u16 = 60000;
