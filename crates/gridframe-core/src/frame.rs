use crate::error::{FrameError, Result};
use crate::executor::{CellTask, PartitionExecutor};
use crate::label::Label;
use crate::local;
use crate::partition::{GridCoord, Partition};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Frame axis: 0 = row-wise, 1 = column-wise.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    #[default]
    Rows,
    Columns,
}

/// Split `n` elements into `chunks` contiguous runs of near-equal size.
pub fn even_chunks(n: usize, chunks: usize) -> Vec<usize> {
    let chunks = chunks.max(1);
    if n == 0 {
        return vec![0];
    }
    let base = n / chunks;
    let remainder = n % chunks;
    (0..chunks)
        .map(|i| if i < remainder { base + 1 } else { base })
        .filter(|len| *len > 0)
        .collect()
}

/// One logical table modeled as a rectangular grid of partitions.
///
/// Row partition `i` holds `row_lengths[i]` rows and column partition `j`
/// holds `column_widths[j]` columns; concatenating partitions in order
/// reconstructs the row and column label sequences. Frames are never mutated:
/// every operation produces a new frame, and partitions may be shared between
/// frames freely since they are read-only.
#[derive(Clone)]
pub struct PartitionedFrame {
    grid: Vec<Vec<Arc<Partition>>>,
    row_index: Vec<Label>,
    column_index: Vec<Label>,
    row_lengths: Vec<usize>,
    column_widths: Vec<usize>,
    dtypes: OnceLock<BTreeMap<Label, DataType>>,
    executor: Arc<dyn PartitionExecutor>,
}

impl PartitionedFrame {
    /// Build a frame from an explicit grid, validating the shape invariants.
    pub fn try_new(
        grid: Vec<Vec<Arc<Partition>>>,
        row_index: Vec<Label>,
        column_index: Vec<Label>,
        row_lengths: Vec<usize>,
        column_widths: Vec<usize>,
        executor: Arc<dyn PartitionExecutor>,
    ) -> Result<Self> {
        let row_total: usize = row_lengths.iter().sum();
        if row_total != row_index.len() {
            return Err(FrameError::Configuration(format!(
                "row partition lengths sum to {} but there are {} row labels",
                row_total,
                row_index.len()
            )));
        }
        let col_total: usize = column_widths.iter().sum();
        if col_total != column_index.len() {
            return Err(FrameError::Configuration(format!(
                "column partition widths sum to {} but there are {} column labels",
                col_total,
                column_index.len()
            )));
        }
        if grid.len() != row_lengths.len() {
            return Err(FrameError::Configuration(format!(
                "grid has {} partition rows but {} row boundaries",
                grid.len(),
                row_lengths.len()
            )));
        }
        for (i, row) in grid.iter().enumerate() {
            if row.len() != column_widths.len() {
                return Err(FrameError::Configuration(format!(
                    "grid row {} has {} partitions but there are {} column boundaries",
                    i,
                    row.len(),
                    column_widths.len()
                )));
            }
            for (j, part) in row.iter().enumerate() {
                if let Some(n) = part.cached_num_rows() {
                    if n != row_lengths[i] {
                        return Err(FrameError::Configuration(format!(
                            "partition ({i}, {j}) has {n} rows, boundary expects {}",
                            row_lengths[i]
                        )));
                    }
                }
                if let Some(n) = part.cached_num_cols() {
                    if n != column_widths[j] {
                        return Err(FrameError::Configuration(format!(
                            "partition ({i}, {j}) has {n} columns, boundary expects {}",
                            column_widths[j]
                        )));
                    }
                }
            }
        }
        Ok(PartitionedFrame {
            grid,
            row_index,
            column_index,
            row_lengths,
            column_widths,
            dtypes: OnceLock::new(),
            executor,
        })
    }

    /// Single-partition frame over one fragment. Column labels come from the
    /// fragment schema; row labels are positional.
    pub fn from_batch(batch: RecordBatch, executor: Arc<dyn PartitionExecutor>) -> Result<Self> {
        Self::from_batch_chunked(batch, None, 1, 1, executor)
    }

    /// Split one fragment into a `row_chunks` x `col_chunks` grid of ready
    /// partitions. `row_labels`, when given, must match the fragment's row
    /// count; otherwise rows get positional labels.
    pub fn from_batch_chunked(
        batch: RecordBatch,
        row_labels: Option<Vec<Label>>,
        row_chunks: usize,
        col_chunks: usize,
        executor: Arc<dyn PartitionExecutor>,
    ) -> Result<Self> {
        let batch = normalize_nullable(&batch)
            .map_err(|e| FrameError::local(0, 0, e))?;
        let row_index = match row_labels {
            Some(labels) => {
                if labels.len() != batch.num_rows() {
                    return Err(FrameError::ShapeMismatch(format!(
                        "{} row labels supplied for a fragment with {} rows",
                        labels.len(),
                        batch.num_rows()
                    )));
                }
                labels
            }
            None => Label::range(batch.num_rows()),
        };
        let column_index: Vec<Label> = batch
            .schema()
            .fields()
            .iter()
            .map(|f| Label::from(f.name().as_str()))
            .collect();
        let row_lengths = even_chunks(batch.num_rows(), row_chunks);
        let column_widths = even_chunks(batch.num_columns(), col_chunks);

        let mut grid = Vec::with_capacity(row_lengths.len());
        let mut row_offset = 0;
        for (i, rows) in row_lengths.iter().enumerate() {
            let mut grid_row = Vec::with_capacity(column_widths.len());
            let mut col_offset = 0;
            for (j, cols) in column_widths.iter().enumerate() {
                let picks: Vec<usize> = (col_offset..col_offset + cols).collect();
                let cell = batch
                    .project(&picks)
                    .map_err(|e| FrameError::local(i, j, e))?
                    .slice(row_offset, *rows);
                grid_row.push(Arc::new(Partition::ready(GridCoord::new(i, j), cell)));
                col_offset += cols;
            }
            grid.push(grid_row);
            row_offset += rows;
        }
        Self::try_new(
            grid,
            row_index,
            column_index,
            row_lengths,
            column_widths,
            executor,
        )
    }

    /// Attach an eagerly computed dtype mapping. Keys must match the column
    /// labels exactly.
    pub fn with_dtypes(self, dtypes: BTreeMap<Label, DataType>) -> Result<Self> {
        if !self.dtypes_compatible(&dtypes) {
            return Err(FrameError::Configuration(
                "dtype mapping keys do not match the column labels".to_string(),
            ));
        }
        let frame = PartitionedFrame {
            dtypes: OnceLock::new(),
            ..self
        };
        let _ = frame.dtypes.set(dtypes);
        Ok(frame)
    }

    /// Whether a dtype mapping covers exactly this frame's column label set.
    pub fn dtypes_compatible(&self, dtypes: &BTreeMap<Label, DataType>) -> bool {
        let labels: BTreeSet<&Label> = self.column_index.iter().collect();
        labels.len() == dtypes.len() && dtypes.keys().all(|k| labels.contains(k))
    }

    pub fn row_index(&self) -> &[Label] {
        &self.row_index
    }

    pub fn column_index(&self) -> &[Label] {
        &self.column_index
    }

    pub fn row_lengths(&self) -> &[usize] {
        &self.row_lengths
    }

    pub fn column_widths(&self) -> &[usize] {
        &self.column_widths
    }

    pub fn num_rows(&self) -> usize {
        self.row_index.len()
    }

    pub fn num_cols(&self) -> usize {
        self.column_index.len()
    }

    /// Grid dimensions (partition rows, partition columns).
    pub fn grid_shape(&self) -> (usize, usize) {
        (self.row_lengths.len(), self.column_widths.len())
    }

    pub fn partition(&self, row: usize, col: usize) -> &Arc<Partition> {
        &self.grid[row][col]
    }

    pub fn executor(&self) -> &Arc<dyn PartitionExecutor> {
        &self.executor
    }

    /// A frame standing in for a single column or row.
    pub fn is_series_like(&self) -> bool {
        self.num_cols() == 1
    }

    /// The dtype mapping if it has already been computed or attached.
    pub fn known_dtypes(&self) -> Option<&BTreeMap<Label, DataType>> {
        self.dtypes.get()
    }

    /// Column types, derived from fragment schemas on first access and cached.
    /// Columns of a frame with no row partitions report the missing-value
    /// marker type.
    pub fn materialize_dtypes(&self) -> Result<&BTreeMap<Label, DataType>> {
        if let Some(dtypes) = self.dtypes.get() {
            return Ok(dtypes);
        }
        let mut derived = BTreeMap::new();
        if self.grid.is_empty() {
            for label in &self.column_index {
                derived.insert(label.clone(), local::MISSING_DTYPE);
            }
        } else {
            let mut offset = 0;
            for (j, width) in self.column_widths.iter().enumerate() {
                let batch = self.grid[0][j].materialize()?;
                for (k, label) in self.column_index[offset..offset + width].iter().enumerate() {
                    derived.insert(label.clone(), batch.schema().field(k).data_type().clone());
                }
                offset += width;
            }
        }
        Ok(self.dtypes.get_or_init(|| derived))
    }

    /// Apply a fragment transformation to every cell independently. Local
    /// engine errors come back tagged with the cell's coordinates.
    pub fn map<F>(
        &self,
        func: F,
        dtypes: Option<BTreeMap<Label, DataType>>,
    ) -> Result<PartitionedFrame>
    where
        F: Fn(&RecordBatch) -> anyhow::Result<RecordBatch> + Send + Sync + 'static,
    {
        let func = Arc::new(func);
        let (rows, cols) = self.grid_shape();
        let mut tasks = Vec::with_capacity(rows * cols);
        for i in 0..rows {
            for j in 0..cols {
                let part = Arc::clone(&self.grid[i][j]);
                let func = Arc::clone(&func);
                tasks.push(
                    CellTask::new(GridCoord::new(i, j), move || {
                        let batch = part.materialize()?;
                        func(&batch).map_err(|e| FrameError::local(i, j, e))
                    })
                    .with_shape_hint(Some(self.row_lengths[i]), Some(self.column_widths[j])),
                );
            }
        }
        let parts = self.executor.submit(tasks);
        let frame = Self::try_new(
            assemble_grid(parts, rows, cols),
            self.row_index.clone(),
            self.column_index.clone(),
            self.row_lengths.clone(),
            self.column_widths.clone(),
            Arc::clone(&self.executor),
        )?;
        match dtypes {
            Some(d) if frame.dtypes_compatible(&d) => frame.with_dtypes(d),
            _ => Ok(frame),
        }
    }

    /// Materialize the whole frame into one fragment, in label order.
    pub fn to_batch(&self) -> Result<RecordBatch> {
        let (rows, cols) = self.grid_shape();
        let mut strips = Vec::with_capacity(rows);
        for i in 0..rows {
            let mut cells = Vec::with_capacity(cols);
            for j in 0..cols {
                cells.push(self.grid[i][j].materialize()?);
            }
            strips.push(local::concat_columns(&cells).map_err(|e| FrameError::local(i, 0, e))?);
        }
        if strips.is_empty() {
            return local::concat_rows(&[]).map_err(|e| FrameError::local(0, 0, e));
        }
        local::concat_rows(&strips).map_err(|e| FrameError::local(0, 0, e))
    }
}

fn normalize_nullable(
    batch: &RecordBatch,
) -> std::result::Result<RecordBatch, arrow::error::ArrowError> {
    use arrow::datatypes::Schema;
    use arrow::record_batch::RecordBatchOptions;
    let fields = local::nullable_fields(&batch.schema());
    if fields.is_empty() {
        let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
        return RecordBatch::try_new_with_options(batch.schema(), vec![], &options);
    }
    RecordBatch::try_new(
        Arc::new(Schema::new(fields)),
        batch.columns().to_vec(),
    )
}

/// Chunk a flat, row-major partition list back into a grid.
pub fn assemble_grid(
    parts: Vec<Arc<Partition>>,
    rows: usize,
    cols: usize,
) -> Vec<Vec<Arc<Partition>>> {
    debug_assert_eq!(parts.len(), rows * cols);
    let mut iter = parts.into_iter();
    (0..rows)
        .map(|_| (0..cols).map(|_| iter.next().expect("grid size")).collect())
        .collect()
}

impl fmt::Debug for PartitionedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionedFrame")
            .field("grid_shape", &self.grid_shape())
            .field("num_rows", &self.num_rows())
            .field("num_cols", &self.num_cols())
            .field("row_lengths", &self.row_lengths)
            .field("column_widths", &self.column_widths)
            .field("dtypes", &self.dtypes.get())
            .finish()
    }
}
