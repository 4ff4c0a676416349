//! Split Records
//!
//! Run documents, their on-disk store, and the best-time policy.
//! Everything here works on an already resolved category directory.

pub mod codec;
pub mod reconcile;
pub mod store;

pub use codec::{decode, encode, DecodeError, GameSplit, SplitEntry};
pub use reconcile::{compare, ReconcileOutcome, Reconciler, Verdict};
pub use store::{read_best, read_document, replace_best, write_run, RunId, StoreError, BEST_FILE};
