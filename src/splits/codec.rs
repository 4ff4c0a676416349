//! Split Document Codec
//!
//! JSON wire format for run documents. Only the structural shape is
//! validated: every entry needs a label, and times may not be negative.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A named checkpoint within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitEntry {
    /// Split title.
    pub label: String,
    /// Accumulated time from the start of the run. Zero means unset.
    #[serde(default)]
    pub time: i64,
}

impl SplitEntry {
    /// Create a split entry.
    pub fn new(label: impl Into<String>, time: i64) -> Self {
        Self {
            label: label.into(),
            time,
        }
    }
}

/// One complete attempt: the ordered splits with accumulated times.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSplit {
    /// Splits in run order.
    pub entries: Vec<SplitEntry>,
}

impl GameSplit {
    /// Create a run document from its entries.
    pub fn new(entries: Vec<SplitEntry>) -> Self {
        Self { entries }
    }

    /// Accumulated time of the last split, if there is one.
    pub fn final_time(&self) -> Option<i64> {
        self.entries.last().map(|e| e.time)
    }

    /// Number of splits.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the run has no splits.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Document decoding errors.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not JSON, or not shaped like a run document.
    #[error("Malformed split document: {0}")]
    Malformed(#[from] serde_json::Error),

    /// An entry carries a negative time.
    #[error("Split {index} ('{label}') has negative time {time}")]
    NegativeTime {
        /// Position of the offending entry.
        index: usize,
        /// Its label.
        label: String,
        /// The rejected time.
        time: i64,
    },
}

/// Parse a run document.
pub fn decode(bytes: &[u8]) -> Result<GameSplit, DecodeError> {
    let split: GameSplit = serde_json::from_slice(bytes)?;

    if let Some((index, entry)) = split.entries.iter().enumerate().find(|(_, e)| e.time < 0) {
        return Err(DecodeError::NegativeTime {
            index,
            label: entry.label.clone(),
            time: entry.time,
        });
    }

    Ok(split)
}

/// Serialize a run document. Entry order is preserved.
pub fn encode(split: &GameSplit) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(split)
}
