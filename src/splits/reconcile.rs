//! Best-Time Reconciler
//!
//! Decides whether a submitted run replaces a category's best document and
//! performs the replacement. Only the final split's accumulated time is
//! compared; per-split bests are not tracked.
//!
//! The load, compare and replace steps for one category run under a single
//! per-category lock, so concurrent submissions cannot lose an update.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use super::codec::GameSplit;
use super::store::{read_best, replace_best, StoreError};

/// Result of comparing a submitted run against the stored best.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Submitted run becomes the new best.
    Supersede,
    /// Stored best stays.
    Keep,
    /// Split counts disagree; runs are not comparable.
    ShapeMismatch {
        /// Split count of the stored best.
        expected: usize,
        /// Split count of the submitted run.
        actual: usize,
    },
}

/// What a reconciliation did to the best document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Best document was replaced by the submitted run.
    Promoted,
    /// Submitted run was not faster; best untouched.
    Retained,
    /// Submitted run has a different number of splits; best untouched.
    ShapeMismatch {
        /// Split count of the stored best.
        expected: usize,
        /// Split count of the submitted run.
        actual: usize,
    },
}

/// Comparison policy.
///
/// An empty best, or one whose final time is unset (zero), is always
/// superseded. Otherwise the submitted run must finish strictly faster.
pub fn compare(best: &GameSplit, submitted: &GameSplit) -> Verdict {
    let best_final = match best.final_time() {
        None => return Verdict::Supersede,
        Some(t) => t,
    };

    if best.len() != submitted.len() {
        return Verdict::ShapeMismatch {
            expected: best.len(),
            actual: submitted.len(),
        };
    }

    match submitted.final_time() {
        Some(t) if best_final == 0 || t < best_final => Verdict::Supersede,
        _ => Verdict::Keep,
    }
}

/// Serializes best-document updates per category.
///
/// Locks are keyed by the category path as given. Callers pass canonical
/// paths so that two spellings of one directory share a lock.
#[derive(Debug, Default)]
pub struct Reconciler {
    /// Category path -> lock guarding its best document.
    locks: Mutex<BTreeMap<PathBuf, Arc<Mutex<()>>>>,
}

impl Reconciler {
    /// Create a reconciler with no tracked categories.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile a submitted run against the category's best.
    ///
    /// A missing best document counts as "no best yet". A corrupt one is an
    /// error and is left as is.
    pub async fn reconcile(
        &self,
        category: &Path,
        submitted: &GameSplit,
    ) -> Result<ReconcileOutcome, StoreError> {
        let lock = self.acquire(category).await;
        let result = {
            let _guard = lock.lock().await;
            Self::reconcile_locked(category, submitted).await
        };
        self.release(category, lock).await;
        result
    }

    async fn reconcile_locked(
        category: &Path,
        submitted: &GameSplit,
    ) -> Result<ReconcileOutcome, StoreError> {
        let best = match read_best(category).await {
            Ok(best) => best,
            Err(StoreError::NotFound(_)) => GameSplit::default(),
            Err(e) => return Err(e),
        };

        match compare(&best, submitted) {
            Verdict::Supersede => {
                replace_best(category, submitted).await?;
                debug!(
                    "Promoted new best for {}: {:?} -> {:?}",
                    category.display(),
                    best.final_time(),
                    submitted.final_time()
                );
                Ok(ReconcileOutcome::Promoted)
            }
            Verdict::Keep => Ok(ReconcileOutcome::Retained),
            Verdict::ShapeMismatch { expected, actual } => {
                Ok(ReconcileOutcome::ShapeMismatch { expected, actual })
            }
        }
    }

    /// Get (or create) the lock for a category.
    async fn acquire(&self, category: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(category.to_path_buf()).or_default().clone()
    }

    /// Drop the category's lock entry once nobody else holds it.
    async fn release(&self, category: &Path, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        // Map entry plus ours.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(category);
        }
    }

    /// Number of categories with an update in flight.
    pub async fn tracked_categories(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splits::codec::SplitEntry;
    use crate::splits::store::{write_run, BEST_FILE};
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn run(times: &[i64]) -> GameSplit {
        GameSplit::new(
            times
                .iter()
                .enumerate()
                .map(|(i, t)| SplitEntry::new(format!("s{}", i), *t))
                .collect(),
        )
    }

    #[test]
    fn test_compare_empty_best_always_superseded() {
        assert_eq!(compare(&GameSplit::default(), &run(&[5, 9])), Verdict::Supersede);
        assert_eq!(compare(&GameSplit::default(), &GameSplit::default()), Verdict::Supersede);
    }

    #[test]
    fn test_compare_faster_final_time() {
        assert_eq!(compare(&run(&[100, 250]), &run(&[120, 240])), Verdict::Supersede);
    }

    #[test]
    fn test_compare_slower_or_equal_final_time() {
        assert_eq!(compare(&run(&[100, 250]), &run(&[90, 400])), Verdict::Keep);
        assert_eq!(compare(&run(&[100, 250]), &run(&[90, 250])), Verdict::Keep);
    }

    #[test]
    fn test_compare_unset_best_final_time() {
        assert_eq!(compare(&run(&[100, 0]), &run(&[100, 9999])), Verdict::Supersede);
    }

    #[test]
    fn test_compare_shape_mismatch() {
        assert_eq!(
            compare(&run(&[1, 2, 3]), &run(&[1, 2])),
            Verdict::ShapeMismatch { expected: 3, actual: 2 }
        );
        assert_eq!(
            compare(&run(&[1]), &GameSplit::default()),
            Verdict::ShapeMismatch { expected: 1, actual: 0 }
        );
    }

    #[tokio::test]
    async fn test_first_submission_becomes_best() {
        let dir = tempdir().unwrap();
        let reconciler = Reconciler::new();

        let outcome = reconciler.reconcile(dir.path(), &run(&[100, 250])).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Promoted);
        assert_eq!(read_best(dir.path()).await.unwrap(), run(&[100, 250]));
    }

    #[tokio::test]
    async fn test_slower_run_retains_best() {
        let dir = tempdir().unwrap();
        let reconciler = Reconciler::new();
        reconciler.reconcile(dir.path(), &run(&[100, 250])).await.unwrap();

        let outcome = reconciler.reconcile(dir.path(), &run(&[80, 400])).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Retained);
        assert_eq!(read_best(dir.path()).await.unwrap(), run(&[100, 250]));
    }

    #[tokio::test]
    async fn test_promotion_copies_every_split() {
        let dir = tempdir().unwrap();
        let reconciler = Reconciler::new();
        reconciler.reconcile(dir.path(), &run(&[100, 250])).await.unwrap();

        let faster = run(&[130, 200]);
        let outcome = reconciler.reconcile(dir.path(), &faster).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Promoted);
        assert_eq!(read_best(dir.path()).await.unwrap(), faster);
    }

    #[tokio::test]
    async fn test_shape_mismatch_keeps_best_and_raw_run() {
        let dir = tempdir().unwrap();
        let reconciler = Reconciler::new();
        reconciler.reconcile(dir.path(), &run(&[100, 250])).await.unwrap();

        let odd = run(&[10, 20, 30]);
        let id = write_run(dir.path(), &odd).await.unwrap();
        let outcome = reconciler.reconcile(dir.path(), &odd).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::ShapeMismatch { expected: 2, actual: 3 });
        assert_eq!(read_best(dir.path()).await.unwrap(), run(&[100, 250]));
        assert!(dir.path().join(id.file_name()).exists());
    }

    #[tokio::test]
    async fn test_corrupt_best_is_an_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(BEST_FILE), b"not json").unwrap();
        let reconciler = Reconciler::new();

        let result = reconciler.reconcile(dir.path(), &run(&[1])).await;
        assert!(matches!(result, Err(StoreError::Decode { .. })));
        assert_eq!(std::fs::read(dir.path().join(BEST_FILE)).unwrap(), b"not json");
    }

    #[tokio::test]
    async fn test_failed_promotion_is_an_error() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join(BEST_FILE);
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), b"x").unwrap();

        let reconciler = Reconciler::new();
        let result = reconciler.reconcile(dir.path(), &run(&[5, 9])).await;
        assert!(matches!(result, Err(StoreError::Io { .. })));
        assert_eq!(reconciler.tracked_categories().await, 0);
    }

    #[tokio::test]
    async fn test_locks_released_after_reconcile() {
        let dir = tempdir().unwrap();
        let reconciler = Reconciler::new();
        reconciler.reconcile(dir.path(), &run(&[1])).await.unwrap();
        assert_eq!(reconciler.tracked_categories().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submissions_keep_minimum() {
        let dir = tempdir().unwrap();
        let reconciler = Arc::new(Reconciler::new());
        reconciler.reconcile(dir.path(), &run(&[10, 10_000])).await.unwrap();

        let mut handles = Vec::new();
        for final_time in (500..564).rev() {
            let reconciler = reconciler.clone();
            let category = dir.path().to_path_buf();
            handles.push(tokio::spawn(async move {
                reconciler.reconcile(&category, &run(&[1, final_time])).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(read_best(dir.path()).await.unwrap().final_time(), Some(500));
        assert_eq!(reconciler.tracked_categories().await, 0);
    }

    proptest! {
        #[test]
        fn prop_best_is_minimum_of_submissions(
            finals in proptest::collection::vec(1i64..1_000_000, 1..12)
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let dir = tempdir().unwrap();
            let reconciler = Reconciler::new();

            rt.block_on(async {
                for t in &finals {
                    reconciler.reconcile(dir.path(), &run(&[0, *t])).await.unwrap();
                }
            });

            let best = rt.block_on(read_best(dir.path())).unwrap();
            prop_assert_eq!(best.final_time(), finals.iter().min().copied());
        }
    }
}
