//! Label reconciliation and repartitioning for two-operand frame operations.
//!
//! Alignment is pure bookkeeping over label sequences: it produces a
//! reconciled sequence per axis plus a positional "taker" per operand, and
//! the repartition step turns those takers into lazy data-movement tasks
//! (concat a strip, gather rows or project columns). No values are derived,
//! only moved.

use arrow::array::Int64Array;
use gridframe_core::error::{FrameError, Result};
use gridframe_core::frame::{assemble_grid, even_chunks, PartitionedFrame};
use gridframe_core::local;
use gridframe_core::partition::{GridCoord, Partition};
use gridframe_core::{CellTask, Label};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::trace;

/// How two differing label sequences are reconciled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinPolicy {
    Left,
    Right,
    Outer,
    Inner,
    /// No reconciliation: the sequences must already be identical.
    None,
}

/// The reconciled label sequence for one axis, plus the positional plan
/// bringing each operand to it. A `None` position has no source on that
/// operand and is null-filled during repartitioning.
#[derive(Clone, Debug, PartialEq)]
pub struct AxisPlan {
    pub labels: Vec<Label>,
    pub left_taker: Vec<Option<usize>>,
    pub right_taker: Vec<Option<usize>>,
}

impl AxisPlan {
    /// Whether applying this plan to the left operand is a no-op.
    pub fn is_left_identity(&self, original: &[Label]) -> bool {
        self.labels == original && is_identity(&self.left_taker, original.len())
    }

    /// Whether applying this plan to the right operand is a no-op.
    pub fn is_right_identity(&self, original: &[Label]) -> bool {
        self.labels == original && is_identity(&self.right_taker, original.len())
    }
}

fn is_identity(taker: &[Option<usize>], len: usize) -> bool {
    taker.len() == len && taker.iter().enumerate().all(|(i, t)| *t == Some(i))
}

fn identity_taker(len: usize) -> Vec<Option<usize>> {
    (0..len).map(Some).collect()
}

/// First occurrence of each label of `keep` inside `other`.
fn first_match_taker(keep: &[Label], other: &[Label]) -> Vec<Option<usize>> {
    let mut first: HashMap<&Label, usize> = HashMap::with_capacity(other.len());
    for (i, label) in other.iter().enumerate() {
        first.entry(label).or_insert(i);
    }
    keep.iter().map(|label| first.get(label).copied()).collect()
}

/// Reconcile two ordered label sequences under a join policy.
///
/// Duplicate labels follow equality-join semantics for `outer` and `inner`:
/// a label with m occurrences on the left and n on the right expands to m*n
/// entries, ordered by (left occurrence, right occurrence). For `left`,
/// `right` and `none` the kept sequence is authoritative and the other
/// operand contributes its first matching occurrence per position.
pub fn reconcile(policy: JoinPolicy, left: &[Label], right: &[Label]) -> Result<AxisPlan> {
    trace!(?policy, left = left.len(), right = right.len(), "reconciling axis labels");
    match policy {
        JoinPolicy::None => {
            if left != right {
                return Err(FrameError::AlignmentFailure(format!(
                    "join policy is `none` but the label sequences differ \
                     ({} vs {} labels)",
                    left.len(),
                    right.len()
                )));
            }
            Ok(AxisPlan {
                labels: left.to_vec(),
                left_taker: identity_taker(left.len()),
                right_taker: identity_taker(left.len()),
            })
        }
        JoinPolicy::Left => Ok(AxisPlan {
            labels: left.to_vec(),
            left_taker: identity_taker(left.len()),
            right_taker: first_match_taker(left, right),
        }),
        JoinPolicy::Right => Ok(AxisPlan {
            labels: right.to_vec(),
            left_taker: first_match_taker(right, left),
            right_taker: identity_taker(right.len()),
        }),
        JoinPolicy::Outer => {
            // BTreeMap keys give the ascending sorted union.
            let mut merged: BTreeMap<&Label, (Vec<usize>, Vec<usize>)> = BTreeMap::new();
            for (i, label) in left.iter().enumerate() {
                merged.entry(label).or_default().0.push(i);
            }
            for (i, label) in right.iter().enumerate() {
                merged.entry(label).or_default().1.push(i);
            }
            let mut plan = AxisPlan {
                labels: Vec::new(),
                left_taker: Vec::new(),
                right_taker: Vec::new(),
            };
            for (label, (ls, rs)) in &merged {
                expand_label(&mut plan, label, ls, rs);
            }
            Ok(plan)
        }
        JoinPolicy::Inner => {
            let mut left_pos: HashMap<&Label, Vec<usize>> = HashMap::new();
            for (i, label) in left.iter().enumerate() {
                left_pos.entry(label).or_default().push(i);
            }
            let mut right_pos: HashMap<&Label, Vec<usize>> = HashMap::new();
            for (i, label) in right.iter().enumerate() {
                right_pos.entry(label).or_default().push(i);
            }
            let mut plan = AxisPlan {
                labels: Vec::new(),
                left_taker: Vec::new(),
                right_taker: Vec::new(),
            };
            let mut seen: HashSet<&Label> = HashSet::new();
            for label in left {
                if !seen.insert(label) {
                    continue;
                }
                if let Some(rs) = right_pos.get(label) {
                    expand_label(&mut plan, label, &left_pos[label], rs);
                }
            }
            Ok(plan)
        }
    }
}

fn expand_label(plan: &mut AxisPlan, label: &Label, left_occ: &[usize], right_occ: &[usize]) {
    match (left_occ.is_empty(), right_occ.is_empty()) {
        (true, true) => {}
        (false, true) => {
            for &l in left_occ {
                plan.labels.push(label.clone());
                plan.left_taker.push(Some(l));
                plan.right_taker.push(None);
            }
        }
        (true, false) => {
            for &r in right_occ {
                plan.labels.push(label.clone());
                plan.left_taker.push(None);
                plan.right_taker.push(Some(r));
            }
        }
        (false, false) => {
            for &l in left_occ {
                for &r in right_occ {
                    plan.labels.push(label.clone());
                    plan.left_taker.push(Some(l));
                    plan.right_taker.push(Some(r));
                }
            }
        }
    }
}

/// Two operands brought to one shared grid shape, ready for position-wise
/// cell pairing.
#[derive(Debug)]
pub struct Copartitioned {
    pub left: PartitionedFrame,
    pub right: PartitionedFrame,
    pub row_labels: Vec<Label>,
    pub column_labels: Vec<Label>,
}

/// Reconcile rows and columns independently, then repartition both operands
/// to identical boundaries.
pub fn copartition(
    left: &PartitionedFrame,
    right: &PartitionedFrame,
    policy: JoinPolicy,
) -> Result<Copartitioned> {
    let row_plan = reconcile(policy, left.row_index(), right.row_index())?;
    let column_plan = reconcile(policy, left.column_index(), right.column_index())?;

    let row_lengths = target_boundaries(
        &row_plan,
        left.row_index(),
        left.row_lengths(),
        right.row_index(),
        right.row_lengths(),
    );
    let column_widths = target_boundaries(
        &column_plan,
        left.column_index(),
        left.column_widths(),
        right.column_index(),
        right.column_widths(),
    );

    let new_left = reindex_columns(
        &reindex_rows(left, &row_plan.labels, &row_plan.left_taker, &row_lengths)?,
        &column_plan.labels,
        &column_plan.left_taker,
        &column_widths,
    )?;
    let new_right = reindex_columns(
        &reindex_rows(right, &row_plan.labels, &row_plan.right_taker, &row_lengths)?,
        &column_plan.labels,
        &column_plan.right_taker,
        &column_widths,
    )?;

    Ok(Copartitioned {
        left: new_left,
        right: new_right,
        row_labels: row_plan.labels,
        column_labels: column_plan.labels,
    })
}

fn target_boundaries(
    plan: &AxisPlan,
    left_labels: &[Label],
    left_bounds: &[usize],
    right_labels: &[Label],
    right_bounds: &[usize],
) -> Vec<usize> {
    if plan.is_left_identity(left_labels) {
        left_bounds.to_vec()
    } else if plan.is_right_identity(right_labels) {
        right_bounds.to_vec()
    } else {
        even_chunks(plan.labels.len(), left_bounds.len().max(right_bounds.len()))
    }
}

/// Re-slice a frame's rows to a new label sequence. Each target row chunk is
/// gathered from a lazily concatenated column strip; `None` taker positions
/// become null-filled rows.
pub fn reindex_rows(
    frame: &PartitionedFrame,
    labels: &[Label],
    taker: &[Option<usize>],
    target_lengths: &[usize],
) -> Result<PartitionedFrame> {
    if is_identity(taker, frame.num_rows())
        && labels == frame.row_index()
        && target_lengths == frame.row_lengths()
    {
        return Ok(frame.clone());
    }
    let (rows, cols) = frame.grid_shape();

    // One shared concat per column strip; every chunk task of that strip
    // resolves it exactly once.
    let mut strips: Vec<Arc<Partition>> = Vec::with_capacity(cols);
    let mut col_offset = 0;
    for (j, width) in frame.column_widths().iter().enumerate() {
        let cells: Vec<Arc<Partition>> =
            (0..rows).map(|i| Arc::clone(frame.partition(i, j))).collect();
        let strip_names: Vec<String> = frame.column_index()[col_offset..col_offset + width]
            .iter()
            .map(|l| l.to_string())
            .collect();
        strips.push(Arc::new(Partition::deferred(
            GridCoord::new(0, j),
            Box::new(move || {
                if cells.is_empty() {
                    let picks: Vec<(Option<usize>, String)> =
                        strip_names.iter().map(|n| (None, n.clone())).collect();
                    let empty = local::concat_rows(&[])
                        .map_err(|e| FrameError::local(0, j, e))?;
                    return local::select_columns(&empty, &picks)
                        .map_err(|e| FrameError::local(0, j, e));
                }
                let batches = cells
                    .iter()
                    .map(|p| p.materialize())
                    .collect::<Result<Vec<_>>>()?;
                local::concat_rows(&batches).map_err(|e| FrameError::local(0, j, e))
            }),
        )));
        col_offset += width;
    }

    let mut tasks = Vec::with_capacity(target_lengths.len() * cols);
    let mut offset = 0;
    for (i, len) in target_lengths.iter().enumerate() {
        let indices = Int64Array::from(
            taker[offset..offset + len]
                .iter()
                .map(|t| t.map(|v| v as i64))
                .collect::<Vec<_>>(),
        );
        for (j, width) in frame.column_widths().iter().enumerate() {
            let strip = Arc::clone(&strips[j]);
            let indices = indices.clone();
            tasks.push(
                CellTask::new(GridCoord::new(i, j), move || {
                    let batch = strip.materialize()?;
                    local::take_rows(&batch, &indices).map_err(|e| FrameError::local(i, j, e))
                })
                .with_shape_hint(Some(*len), Some(*width)),
            );
        }
        offset += len;
    }

    let parts = frame.executor().submit(tasks);
    PartitionedFrame::try_new(
        assemble_grid(parts, target_lengths.len(), cols),
        labels.to_vec(),
        frame.column_index().to_vec(),
        target_lengths.to_vec(),
        frame.column_widths().to_vec(),
        Arc::clone(frame.executor()),
    )
}

/// Re-slice a frame's columns to a new label sequence. Each target column
/// chunk projects out of a lazily concatenated row strip; `None` taker
/// positions become null-filled marker columns.
pub fn reindex_columns(
    frame: &PartitionedFrame,
    labels: &[Label],
    taker: &[Option<usize>],
    target_widths: &[usize],
) -> Result<PartitionedFrame> {
    if is_identity(taker, frame.num_cols())
        && labels == frame.column_index()
        && target_widths == frame.column_widths()
    {
        return Ok(frame.clone());
    }
    let (rows, cols) = frame.grid_shape();
    if rows == 0 {
        return PartitionedFrame::try_new(
            Vec::new(),
            frame.row_index().to_vec(),
            labels.to_vec(),
            frame.row_lengths().to_vec(),
            target_widths.to_vec(),
            Arc::clone(frame.executor()),
        );
    }

    let mut strips: Vec<Arc<Partition>> = Vec::with_capacity(rows);
    for i in 0..rows {
        let cells: Vec<Arc<Partition>> =
            (0..cols).map(|j| Arc::clone(frame.partition(i, j))).collect();
        strips.push(Arc::new(Partition::deferred(
            GridCoord::new(i, 0),
            Box::new(move || {
                let batches = cells
                    .iter()
                    .map(|p| p.materialize())
                    .collect::<Result<Vec<_>>>()?;
                local::concat_columns(&batches).map_err(|e| FrameError::local(i, 0, e))
            }),
        )));
    }

    let mut tasks = Vec::with_capacity(rows * target_widths.len());
    for (i, len) in frame.row_lengths().iter().enumerate() {
        let mut offset = 0;
        for (j, width) in target_widths.iter().enumerate() {
            let picks: Vec<(Option<usize>, String)> = taker[offset..offset + width]
                .iter()
                .zip(&labels[offset..offset + width])
                .map(|(t, label)| (*t, label.to_string()))
                .collect();
            let strip = Arc::clone(&strips[i]);
            tasks.push(
                CellTask::new(GridCoord::new(i, j), move || {
                    let batch = strip.materialize()?;
                    local::select_columns(&batch, &picks).map_err(|e| FrameError::local(i, j, e))
                })
                .with_shape_hint(Some(*len), Some(*width)),
            );
            offset += width;
        }
    }

    let parts = frame.executor().submit(tasks);
    PartitionedFrame::try_new(
        assemble_grid(parts, rows, target_widths.len()),
        frame.row_index().to_vec(),
        labels.to_vec(),
        frame.row_lengths().to_vec(),
        target_widths.to_vec(),
        Arc::clone(frame.executor()),
    )
}
