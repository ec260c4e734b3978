use crate::error::{FrameError, Result};
use arrow::record_batch::RecordBatch;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tracing::trace;

/// Grid coordinates of a partition inside its originating frame. Deferred
/// failures carry these so a lazily surfaced error points back at the cell
/// that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GridCoord {
    pub row: usize,
    pub col: usize,
}

impl GridCoord {
    pub fn new(row: usize, col: usize) -> Self {
        GridCoord { row, col }
    }
}

/// A deferred computation producing one table fragment.
pub type PartitionTask = Box<dyn FnOnce() -> Result<RecordBatch> + Send>;

enum PartitionState {
    Deferred(PartitionTask),
    Ready(RecordBatch),
    Failed(String),
}

/// One cell of a partitioned frame: a single table fragment that may not
/// have been computed yet.
///
/// A partition only ever moves forward: `Deferred` resolves into `Ready` or
/// `Failed` exactly once, and a resolved value is never replaced. Frames
/// share partitions through `Arc`, so a no-op on one operand can hand the
/// same unmaterialized cell to several result frames.
pub struct Partition {
    coords: GridCoord,
    state: Mutex<PartitionState>,
    num_rows: OnceLock<usize>,
    num_cols: OnceLock<usize>,
}

impl Partition {
    /// A partition whose fragment is already in memory.
    pub fn ready(coords: GridCoord, batch: RecordBatch) -> Self {
        let part = Partition {
            coords,
            state: Mutex::new(PartitionState::Ready(batch.clone())),
            num_rows: OnceLock::new(),
            num_cols: OnceLock::new(),
        };
        let _ = part.num_rows.set(batch.num_rows());
        let _ = part.num_cols.set(batch.num_columns());
        part
    }

    /// A partition backed by a deferred computation.
    pub fn deferred(coords: GridCoord, task: PartitionTask) -> Self {
        Partition {
            coords,
            state: Mutex::new(PartitionState::Deferred(task)),
            num_rows: OnceLock::new(),
            num_cols: OnceLock::new(),
        }
    }

    /// A deferred partition whose shape is already known analytically, so
    /// shape introspection does not force materialization.
    pub fn deferred_with_shape(
        coords: GridCoord,
        task: PartitionTask,
        num_rows: Option<usize>,
        num_cols: Option<usize>,
    ) -> Self {
        let part = Partition::deferred(coords, task);
        if let Some(n) = num_rows {
            let _ = part.num_rows.set(n);
        }
        if let Some(n) = num_cols {
            let _ = part.num_cols.set(n);
        }
        part
    }

    /// A partition that already failed, e.g. recorded by an eager executor.
    pub fn failed(coords: GridCoord, message: String) -> Self {
        Partition {
            coords,
            state: Mutex::new(PartitionState::Failed(message)),
            num_rows: OnceLock::new(),
            num_cols: OnceLock::new(),
        }
    }

    pub fn coords(&self) -> GridCoord {
        self.coords
    }

    pub fn is_ready(&self) -> bool {
        matches!(&*self.lock(), PartitionState::Ready(_))
    }

    /// Row count known without materializing, if any.
    pub fn cached_num_rows(&self) -> Option<usize> {
        self.num_rows.get().copied()
    }

    /// Column count known without materializing, if any.
    pub fn cached_num_cols(&self) -> Option<usize> {
        self.num_cols.get().copied()
    }

    /// Resolve the fragment, running the deferred task at most once.
    ///
    /// A failed task stays failed: every later call reports the original
    /// failure as a `DeferredPartition` error tagged with this partition's
    /// coordinates.
    pub fn materialize(&self) -> Result<RecordBatch> {
        let mut state = self.lock();
        let current = std::mem::replace(
            &mut *state,
            PartitionState::Failed("partition task was interrupted".to_string()),
        );
        match current {
            PartitionState::Ready(batch) => {
                *state = PartitionState::Ready(batch.clone());
                Ok(batch)
            }
            PartitionState::Failed(message) => {
                let err = self.deferred_error(&message);
                *state = PartitionState::Failed(message);
                Err(err)
            }
            PartitionState::Deferred(task) => {
                trace!(row = self.coords.row, col = self.coords.col, "resolving deferred partition");
                match task() {
                    Ok(batch) => {
                        let _ = self.num_rows.set(batch.num_rows());
                        let _ = self.num_cols.set(batch.num_columns());
                        *state = PartitionState::Ready(batch.clone());
                        Ok(batch)
                    }
                    Err(err) => {
                        let message = err.to_string();
                        let surfaced = self.deferred_error(&message);
                        *state = PartitionState::Failed(message);
                        Err(surfaced)
                    }
                }
            }
        }
    }

    /// Row count, materializing if it was never cached.
    pub fn num_rows(&self) -> Result<usize> {
        if let Some(n) = self.num_rows.get() {
            return Ok(*n);
        }
        let batch = self.materialize()?;
        Ok(*self.num_rows.get_or_init(|| batch.num_rows()))
    }

    /// Column count, materializing if it was never cached.
    pub fn num_cols(&self) -> Result<usize> {
        if let Some(n) = self.num_cols.get() {
            return Ok(*n);
        }
        let batch = self.materialize()?;
        Ok(*self.num_cols.get_or_init(|| batch.num_columns()))
    }

    /// Derive a new deferred partition from this one. The source stays
    /// unresolved until the derived partition (or the source itself) is
    /// materialized.
    pub fn map<F>(self: &Arc<Self>, coords: GridCoord, func: F) -> Partition
    where
        F: FnOnce(RecordBatch) -> Result<RecordBatch> + Send + 'static,
    {
        let source = Arc::clone(self);
        Partition::deferred(coords, Box::new(move || func(source.materialize()?)))
    }

    fn deferred_error(&self, message: &str) -> FrameError {
        FrameError::DeferredPartition {
            row: self.coords.row,
            col: self.coords.col,
            message: message.to_string(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PartitionState> {
        // A poisoned lock means a panic mid-resolve; the placeholder Failed
        // state left behind is still coherent, so keep going.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl fmt::Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.lock() {
            PartitionState::Deferred(_) => "deferred",
            PartitionState::Ready(_) => "ready",
            PartitionState::Failed(_) => "failed",
        };
        f.debug_struct("Partition")
            .field("coords", &self.coords)
            .field("state", &state)
            .field("num_rows", &self.num_rows.get())
            .field("num_cols", &self.num_cols.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn batch(values: &[i64]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, true)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values.to_vec()))]).unwrap()
    }

    #[test]
    fn deferred_task_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let part = Partition::deferred(
            GridCoord::new(0, 0),
            Box::new(move || {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(batch(&[1, 2, 3]))
            }),
        );
        assert!(!part.is_ready());
        assert_eq!(part.materialize().unwrap().num_rows(), 3);
        assert_eq!(part.materialize().unwrap().num_rows(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(part.is_ready());
    }

    #[test]
    fn failure_surfaces_on_materialize_with_coordinates() {
        let part = Partition::deferred(
            GridCoord::new(2, 5),
            Box::new(|| Err(FrameError::ShapeMismatch("boom".to_string()))),
        );
        // The failure is remembered and re-reported on every access.
        for _ in 0..2 {
            match part.materialize() {
                Err(FrameError::DeferredPartition { row, col, message }) => {
                    assert_eq!((row, col), (2, 5));
                    assert!(message.contains("boom"));
                }
                other => panic!("expected deferred failure, got {other:?}"),
            }
        }
    }

    #[test]
    fn shape_hint_avoids_materialization() {
        let part = Partition::deferred_with_shape(
            GridCoord::new(0, 0),
            Box::new(|| Ok(batch(&[1]))),
            Some(1),
            Some(1),
        );
        assert_eq!(part.num_rows().unwrap(), 1);
        assert_eq!(part.num_cols().unwrap(), 1);
        assert!(!part.is_ready());
    }

    #[test]
    fn map_chains_lazily() {
        let source = Arc::new(Partition::ready(GridCoord::new(0, 0), batch(&[1, 2])));
        let derived = source.map(GridCoord::new(1, 0), |b| Ok(b.slice(0, 1)));
        assert!(!derived.is_ready());
        assert_eq!(derived.materialize().unwrap().num_rows(), 1);
    }
}
