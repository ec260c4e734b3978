//! Builder for frame-level binary operators.
//!
//! A registered operator wraps a per-fragment transformation and dispatches
//! on the kind of the right operand: another frame (aligned cell-by-cell), a
//! broadcastable single-column frame, an array-like, or a scalar. All data
//! movement happens through lazy cell tasks; the only eager work is dtype
//! inference and label reconciliation.

use crate::align::{copartition, JoinPolicy};
use crate::dtypes::{self, DtypeMap};
use arrow::array::{Array, ArrayRef};
use arrow::record_batch::RecordBatch;
use gridframe_core::error::{FrameError, Result};
use gridframe_core::frame::{assemble_grid, Axis, PartitionedFrame};
use gridframe_core::local::ScalarValue;
use gridframe_core::partition::{GridCoord, Partition};
use gridframe_core::{CellTask, Label};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// What labels the result of a binary operation carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelPolicy {
    /// Keep the left frame's original labels.
    Keep,
    /// Adopt the reconciled label set produced by alignment.
    Replace,
    /// Drop the row labels; the result falls back to positional labels.
    Drop,
}

/// How result column types are inferred before any data is touched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtypePolicy {
    /// Cast each shared column to the common type of its operands.
    CommonCast,
    /// `CommonCast`, then integers upgraded to floats (division-like ops).
    Float,
    /// Every result column is boolean (comparison ops).
    Bool,
    /// Do not infer; types are derived lazily from data when accessed.
    None,
}

/// Per-invocation dtype handling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DtypeOverride {
    /// Apply the operator's dtype policy (or leave types lazy).
    #[default]
    Infer,
    /// Carry the left frame's existing dtypes over unchanged.
    Copy,
}

/// Per-invocation options, hints passed down from the high-level API.
#[derive(Clone, Copy, Debug, Default)]
pub struct BinaryOpts {
    /// The right frame stands for a single column/row and should be
    /// broadcast rather than aligned.
    pub broadcast: bool,
    pub axis: Axis,
    pub dtypes: DtypeOverride,
}

/// The right operand, resolved to its kind once before any dispatch.
#[derive(Clone, Debug)]
pub enum Operand {
    Frame(PartitionedFrame),
    ArrayLike(ArrayRef),
    Scalar(ScalarValue),
}

/// The right-hand side a fragment function actually sees.
#[derive(Clone, Debug)]
pub enum FragmentOperand {
    /// The aligned fragment at the same grid position.
    Fragment(RecordBatch),
    /// A broadcast vector covering this fragment's slice of the axis.
    Values { values: ArrayRef, axis: Axis },
    Scalar(ScalarValue),
}

/// A per-fragment transformation. Must be pure: it is invoked independently
/// per partition, possibly concurrently, with no shared state.
pub type FragmentFn =
    Arc<dyn Fn(&RecordBatch, &FragmentOperand) -> anyhow::Result<RecordBatch> + Send + Sync>;

/// A frame-level binary operator built from a fragment function and the
/// join/label/dtype policies it runs under.
#[derive(Clone)]
pub struct BinaryOperator {
    func: FragmentFn,
    join: JoinPolicy,
    labels: LabelPolicy,
    dtypes: DtypePolicy,
}

impl BinaryOperator {
    /// Build a frame-level operator from a fragment transformation.
    pub fn register(
        func: FragmentFn,
        join: JoinPolicy,
        labels: LabelPolicy,
        dtypes: DtypePolicy,
    ) -> Self {
        BinaryOperator {
            func,
            join,
            labels,
            dtypes,
        }
    }

    pub fn join_policy(&self) -> JoinPolicy {
        self.join
    }

    /// Apply the operator to `left` and the resolved right operand.
    pub fn apply(
        &self,
        left: &PartitionedFrame,
        other: &Operand,
        opts: BinaryOpts,
    ) -> Result<PartitionedFrame> {
        debug!(
            join = ?self.join,
            labels = ?self.labels,
            broadcast = opts.broadcast,
            axis = ?opts.axis,
            "dispatching binary operator"
        );
        match other {
            Operand::Frame(right) if opts.broadcast => self.apply_broadcast(left, right, opts),
            Operand::Frame(right) => self.apply_frames(left, right, opts),
            _ if opts.broadcast => Err(FrameError::Configuration(
                "broadcast hint requires a frame operand".to_string(),
            )),
            Operand::ArrayLike(values) => self.apply_array(left, values, opts),
            Operand::Scalar(value) => self.apply_scalar(left, value, opts),
        }
    }

    /// Broadcast a single-column frame along one of `left`'s axes. The vector
    /// is materialized once; each partition receives the zero-copy slice
    /// covering its boundary range. No alignment runs: the vector is assumed
    /// already ordered like the target axis.
    fn apply_broadcast(
        &self,
        left: &PartitionedFrame,
        right: &PartitionedFrame,
        opts: BinaryOpts,
    ) -> Result<PartitionedFrame> {
        if right.num_cols() != 1 {
            return Err(FrameError::ShapeMismatch(format!(
                "broadcast operand must have exactly one column, got {}",
                right.num_cols()
            )));
        }
        let vector: ArrayRef = right.to_batch()?.column(0).clone();
        let axis_len = match opts.axis {
            Axis::Rows => left.num_rows(),
            Axis::Columns => left.num_cols(),
        };
        if vector.len() != axis_len {
            return Err(FrameError::ShapeMismatch(format!(
                "broadcast vector has {} values, axis has {}",
                vector.len(),
                axis_len
            )));
        }
        let bounds = match opts.axis {
            Axis::Rows => left.row_lengths(),
            Axis::Columns => left.column_widths(),
        };
        let offsets = prefix_offsets(bounds);
        let axis = opts.axis;
        let slices: Vec<ArrayRef> = bounds
            .iter()
            .zip(&offsets)
            .map(|(len, offset)| vector.slice(*offset, *len))
            .collect();
        let result_dtypes = match opts.dtypes {
            DtypeOverride::Copy => left.known_dtypes().cloned(),
            DtypeOverride::Infer => None,
        };
        self.apply_cellwise(left, result_dtypes, |i, j| {
            let strip = match axis {
                Axis::Rows => i,
                Axis::Columns => j,
            };
            FragmentOperand::Values {
                values: Arc::clone(&slices[strip]),
                axis,
            }
        })
    }

    /// Full frame-on-frame application: infer result dtypes analytically when
    /// possible, align both operands to one grid, then pair cells
    /// position-wise.
    fn apply_frames(
        &self,
        left: &PartitionedFrame,
        right: &PartitionedFrame,
        opts: BinaryOpts,
    ) -> Result<PartitionedFrame> {
        let mut inferred: Option<DtypeMap> = None;
        if let (Some(left_dtypes), Some(right_dtypes)) =
            (left.known_dtypes(), right.known_dtypes())
        {
            if !right.is_series_like() {
                inferred = match self.dtypes {
                    DtypePolicy::Bool => Some(dtypes::all_bool(right.column_index().iter())),
                    DtypePolicy::CommonCast => Some(dtypes::common_cast(left_dtypes, right_dtypes)),
                    DtypePolicy::Float => Some(dtypes::int_to_float(&dtypes::common_cast(
                        left_dtypes,
                        right_dtypes,
                    ))),
                    DtypePolicy::None => None,
                };
            }
        }
        if inferred.is_none() && opts.dtypes == DtypeOverride::Copy {
            inferred = left.known_dtypes().cloned();
        }

        let co = copartition(left, right, self.join)?;
        let (rows, cols) = co.left.grid_shape();
        let mut tasks = Vec::with_capacity(rows * cols);
        for i in 0..rows {
            for j in 0..cols {
                let left_part = Arc::clone(co.left.partition(i, j));
                let right_part = Arc::clone(co.right.partition(i, j));
                let func = Arc::clone(&self.func);
                tasks.push(
                    CellTask::new(GridCoord::new(i, j), move || {
                        let left_batch = left_part.materialize()?;
                        let right_batch = right_part.materialize()?;
                        func(&left_batch, &FragmentOperand::Fragment(right_batch))
                            .map_err(|e| FrameError::local(i, j, e))
                    })
                    .with_shape_hint(
                        Some(co.left.row_lengths()[i]),
                        Some(co.left.column_widths()[j]),
                    ),
                );
            }
        }
        let parts = left.executor().submit(tasks);

        let (row_labels, column_labels) = match self.labels {
            LabelPolicy::Replace => (co.row_labels.clone(), co.column_labels.clone()),
            LabelPolicy::Keep => (left.row_index().to_vec(), left.column_index().to_vec()),
            LabelPolicy::Drop => (Label::range(co.row_labels.len()), co.column_labels.clone()),
        };
        let frame = PartitionedFrame::try_new(
            assemble_grid(parts, rows, cols),
            row_labels,
            column_labels,
            co.left.row_lengths().to_vec(),
            co.left.column_widths().to_vec(),
            Arc::clone(left.executor()),
        )?;
        attach_dtypes(frame, inferred)
    }

    /// Array-like right operand: the transformation runs once per full axis
    /// strip (every strip sees the entire array), and the strip result is
    /// lazily re-sliced to the frame's original partition boundaries.
    fn apply_array(
        &self,
        left: &PartitionedFrame,
        values: &ArrayRef,
        opts: BinaryOpts,
    ) -> Result<PartitionedFrame> {
        let axis_len = match opts.axis {
            Axis::Rows => left.num_rows(),
            Axis::Columns => left.num_cols(),
        };
        if values.len() != axis_len {
            return Err(FrameError::ShapeMismatch(format!(
                "array-like operand has {} values, axis has {}",
                values.len(),
                axis_len
            )));
        }
        let (rows, cols) = left.grid_shape();
        let axis = opts.axis;
        let mut tasks = Vec::with_capacity(rows * cols);
        match axis {
            Axis::Rows => {
                // One transformed strip per column chunk, shared by its cells.
                for j in 0..cols {
                    let strip = full_column_strip(left, j, Arc::clone(&self.func), values, axis);
                    let mut offset = 0;
                    for (i, len) in left.row_lengths().iter().enumerate() {
                        let strip = Arc::clone(&strip);
                        let (start, take) = (offset, *len);
                        tasks.push(
                            CellTask::new(GridCoord::new(i, j), move || {
                                Ok(strip.materialize()?.slice(start, take))
                            })
                            .with_shape_hint(Some(take), Some(left.column_widths()[j])),
                        );
                        offset += len;
                    }
                }
                // Tasks were built strip-major; reorder to row-major.
                tasks.sort_by_key(|t| (t.coords().row, t.coords().col));
            }
            Axis::Columns => {
                for i in 0..rows {
                    let strip = full_row_strip(left, i, Arc::clone(&self.func), values, axis);
                    let mut offset = 0;
                    for (j, width) in left.column_widths().iter().enumerate() {
                        let strip = Arc::clone(&strip);
                        let picks: Vec<usize> = (offset..offset + width).collect();
                        tasks.push(
                            CellTask::new(GridCoord::new(i, j), move || {
                                let batch = strip.materialize()?;
                                batch
                                    .project(&picks)
                                    .map_err(|e| FrameError::local(i, j, e))
                            })
                            .with_shape_hint(Some(left.row_lengths()[i]), Some(*width)),
                        );
                        offset += width;
                    }
                }
            }
        }
        let parts = left.executor().submit(tasks);
        let frame = PartitionedFrame::try_new(
            assemble_grid(parts, rows, cols),
            left.row_index().to_vec(),
            left.column_index().to_vec(),
            left.row_lengths().to_vec(),
            left.column_widths().to_vec(),
            Arc::clone(left.executor()),
        )?;
        let result_dtypes = match opts.dtypes {
            DtypeOverride::Copy => left.known_dtypes().cloned(),
            DtypeOverride::Infer => None,
        };
        attach_dtypes(frame, result_dtypes)
    }

    /// Scalar right operand: applied independently per partition, no
    /// alignment, no cross-partition coordination.
    fn apply_scalar(
        &self,
        left: &PartitionedFrame,
        value: &ScalarValue,
        opts: BinaryOpts,
    ) -> Result<PartitionedFrame> {
        let result_dtypes = match opts.dtypes {
            DtypeOverride::Copy => left.known_dtypes().cloned(),
            DtypeOverride::Infer => None,
        };
        let value = value.clone();
        self.apply_cellwise(left, result_dtypes, move |_, _| {
            FragmentOperand::Scalar(value.clone())
        })
    }

    /// Cell-by-cell application over `left`'s own grid, with a per-cell
    /// right-hand operand.
    fn apply_cellwise(
        &self,
        left: &PartitionedFrame,
        result_dtypes: Option<DtypeMap>,
        operand_for: impl Fn(usize, usize) -> FragmentOperand,
    ) -> Result<PartitionedFrame> {
        let (rows, cols) = left.grid_shape();
        let mut tasks = Vec::with_capacity(rows * cols);
        for i in 0..rows {
            for j in 0..cols {
                let part = Arc::clone(left.partition(i, j));
                let func = Arc::clone(&self.func);
                let operand = operand_for(i, j);
                tasks.push(
                    CellTask::new(GridCoord::new(i, j), move || {
                        let batch = part.materialize()?;
                        func(&batch, &operand).map_err(|e| FrameError::local(i, j, e))
                    })
                    .with_shape_hint(Some(left.row_lengths()[i]), Some(left.column_widths()[j])),
                );
            }
        }
        let parts = left.executor().submit(tasks);
        let frame = PartitionedFrame::try_new(
            assemble_grid(parts, rows, cols),
            left.row_index().to_vec(),
            left.column_index().to_vec(),
            left.row_lengths().to_vec(),
            left.column_widths().to_vec(),
            Arc::clone(left.executor()),
        )?;
        attach_dtypes(frame, result_dtypes)
    }
}

fn attach_dtypes(frame: PartitionedFrame, dtypes: Option<DtypeMap>) -> Result<PartitionedFrame> {
    match dtypes {
        Some(d) if frame.dtypes_compatible(&d) => frame.with_dtypes(d),
        _ => Ok(frame),
    }
}

fn prefix_offsets(bounds: &[usize]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(bounds.len());
    let mut acc = 0;
    for len in bounds {
        offsets.push(acc);
        acc += len;
    }
    offsets
}

/// A deferred full-height strip: column chunk `j` concatenated across all
/// row partitions, with the fragment function already applied.
fn full_column_strip(
    frame: &PartitionedFrame,
    j: usize,
    func: FragmentFn,
    values: &ArrayRef,
    axis: Axis,
) -> Arc<Partition> {
    let (rows, _) = frame.grid_shape();
    let cells: Vec<Arc<Partition>> = (0..rows).map(|i| Arc::clone(frame.partition(i, j))).collect();
    let values = Arc::clone(values);
    Arc::new(Partition::deferred(
        GridCoord::new(0, j),
        Box::new(move || {
            let batches = cells
                .iter()
                .map(|p| p.materialize())
                .collect::<Result<Vec<_>>>()?;
            let strip = gridframe_core::local::concat_rows(&batches)
                .map_err(|e| FrameError::local(0, j, e))?;
            func(&strip, &FragmentOperand::Values { values, axis })
                .map_err(|e| FrameError::local(0, j, e))
        }),
    ))
}

/// A deferred full-width strip: row chunk `i` concatenated across all column
/// partitions, with the fragment function already applied.
fn full_row_strip(
    frame: &PartitionedFrame,
    i: usize,
    func: FragmentFn,
    values: &ArrayRef,
    axis: Axis,
) -> Arc<Partition> {
    let (_, cols) = frame.grid_shape();
    let cells: Vec<Arc<Partition>> = (0..cols).map(|j| Arc::clone(frame.partition(i, j))).collect();
    let values = Arc::clone(values);
    Arc::new(Partition::deferred(
        GridCoord::new(i, 0),
        Box::new(move || {
            let batches = cells
                .iter()
                .map(|p| p.materialize())
                .collect::<Result<Vec<_>>>()?;
            let strip = gridframe_core::local::concat_columns(&batches)
                .map_err(|e| FrameError::local(i, 0, e))?;
            func(&strip, &FragmentOperand::Values { values, axis })
                .map_err(|e| FrameError::local(i, 0, e))
        }),
    ))
}
