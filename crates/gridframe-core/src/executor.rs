use crate::error::Result;
use crate::partition::{GridCoord, Partition, PartitionTask};
use arrow::record_batch::RecordBatch;
use rayon::prelude::*;
use std::sync::Arc;

/// One independent unit of work: compute the fragment for one grid cell.
///
/// Tasks carry no shared mutable state, so an executor may run them in any
/// order on any number of workers.
pub struct CellTask {
    coords: GridCoord,
    rows_hint: Option<usize>,
    cols_hint: Option<usize>,
    run: PartitionTask,
}

impl CellTask {
    pub fn new<F>(coords: GridCoord, run: F) -> Self
    where
        F: FnOnce() -> Result<RecordBatch> + Send + 'static,
    {
        CellTask {
            coords,
            rows_hint: None,
            cols_hint: None,
            run: Box::new(run),
        }
    }

    /// Attach the analytically known result shape so shape introspection on
    /// the produced partition does not force computation.
    pub fn with_shape_hint(mut self, num_rows: Option<usize>, num_cols: Option<usize>) -> Self {
        self.rows_hint = num_rows;
        self.cols_hint = num_cols;
        self
    }

    pub fn coords(&self) -> GridCoord {
        self.coords
    }

    /// Run the computation, consuming the task.
    pub fn execute(self) -> Result<RecordBatch> {
        (self.run)()
    }
}

/// Executes cell tasks, returning one partition handle per task in task
/// order. Handles may be returned before the work has run; a failed task is
/// recorded in the partition state and surfaces on materialization.
pub trait PartitionExecutor: Send + Sync {
    fn submit(&self, tasks: Vec<CellTask>) -> Vec<Arc<Partition>>;
}

/// Defers every task; work runs on the first materialization of each
/// partition. Chained operators therefore fuse: intermediate frames never
/// compute anything until an endpoint is observed.
#[derive(Clone, Copy, Debug, Default)]
pub struct LazyExecutor;

impl PartitionExecutor for LazyExecutor {
    fn submit(&self, tasks: Vec<CellTask>) -> Vec<Arc<Partition>> {
        tasks
            .into_iter()
            .map(|task| {
                let coords = task.coords;
                let (rows, cols) = (task.rows_hint, task.cols_hint);
                Arc::new(Partition::deferred_with_shape(
                    coords,
                    Box::new(move || task.execute()),
                    rows,
                    cols,
                ))
            })
            .collect()
    }
}

/// Runs tasks eagerly on the rayon thread pool. Failures are captured per
/// partition rather than failing the whole submission, preserving the lazy
/// failure-propagation contract.
#[derive(Clone, Copy, Debug, Default)]
pub struct RayonExecutor;

impl PartitionExecutor for RayonExecutor {
    fn submit(&self, tasks: Vec<CellTask>) -> Vec<Arc<Partition>> {
        tasks
            .into_par_iter()
            .map(|task| {
                let coords = task.coords;
                Arc::new(match task.execute() {
                    Ok(batch) => Partition::ready(coords, batch),
                    Err(err) => Partition::failed(coords, err.to_string()),
                })
            })
            .collect()
    }
}
