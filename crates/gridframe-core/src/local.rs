//! The local table engine: elementwise compute, concatenation, and reindex
//! primitives over single Arrow fragments.
//!
//! The algebra layer treats this module as its collaborator for everything
//! that touches values inside one partition. Errors here are opaque
//! `anyhow`/Arrow errors; callers annotate them with grid coordinates.

use crate::frame::Axis;
use anyhow::ensure;
use arrow::array::{
    new_null_array, Array, ArrayRef, BooleanArray, Float64Array, Int64Array, Scalar, StringArray,
};
use arrow::compute;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::error::ArrowError;
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The column type standing in for entirely absent columns: such a column is
/// null-filled, and null is representable in any float.
pub const MISSING_DTYPE: DataType = DataType::Float64;

/// Elementwise arithmetic supported by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// Elementwise comparisons supported by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A scalar right-hand operand.
#[derive(Clone, Debug, PartialEq)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

impl ScalarValue {
    pub fn data_type(&self) -> DataType {
        match self {
            ScalarValue::Null => MISSING_DTYPE,
            ScalarValue::Bool(_) => DataType::Boolean,
            ScalarValue::Int64(_) => DataType::Int64,
            ScalarValue::Float64(_) => DataType::Float64,
            ScalarValue::Utf8(_) => DataType::Utf8,
        }
    }

    /// A one-element array carrying this value, for use as an Arrow scalar
    /// datum.
    pub fn to_array(&self) -> ArrayRef {
        match self {
            ScalarValue::Null => new_null_array(&MISSING_DTYPE, 1),
            ScalarValue::Bool(v) => Arc::new(BooleanArray::from(vec![*v])),
            ScalarValue::Int64(v) => Arc::new(Int64Array::from(vec![*v])),
            ScalarValue::Float64(v) => Arc::new(Float64Array::from(vec![*v])),
            ScalarValue::Utf8(v) => Arc::new(StringArray::from(vec![v.as_str()])),
        }
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue::Int64(v)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::Float64(v)
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        ScalarValue::Bool(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        ScalarValue::Utf8(v.to_string())
    }
}

pub fn is_integer(dt: &DataType) -> bool {
    matches!(
        dt,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
    )
}

fn is_float(dt: &DataType) -> bool {
    matches!(
        dt,
        DataType::Float16 | DataType::Float32 | DataType::Float64
    )
}

fn is_datetime_like(dt: &DataType) -> bool {
    matches!(
        dt,
        DataType::Timestamp(_, _)
            | DataType::Date32
            | DataType::Date64
            | DataType::Time32(_)
            | DataType::Time64(_)
            | DataType::Duration(_)
            | DataType::Interval(_)
    )
}

fn int_width(dt: &DataType) -> (u8, bool) {
    match dt {
        DataType::Int8 => (8, true),
        DataType::Int16 => (16, true),
        DataType::Int32 => (32, true),
        DataType::Int64 => (64, true),
        DataType::UInt8 => (8, false),
        DataType::UInt16 => (16, false),
        DataType::UInt32 => (32, false),
        DataType::UInt64 => (64, false),
        _ => (0, true),
    }
}

fn signed_of(bits: u8) -> DataType {
    match bits {
        8 => DataType::Int8,
        16 => DataType::Int16,
        32 => DataType::Int32,
        _ => DataType::Int64,
    }
}

fn unsigned_of(bits: u8) -> DataType {
    match bits {
        8 => DataType::UInt8,
        16 => DataType::UInt16,
        32 => DataType::UInt32,
        _ => DataType::UInt64,
    }
}

/// The narrowest type both operand types can be represented in, following the
/// total promotion order boolean < integer < float < text.
///
/// Mixed-signedness integers widen to the next signed width, spilling to
/// `Float64` past 64 bits. Integer against float takes the float operand's
/// type. Datetime-like types promote to text unless identical. Anything the
/// order does not cover falls back to text as the generic type.
pub fn find_common_type(left: &DataType, right: &DataType) -> DataType {
    if left == right {
        return left.clone();
    }
    if is_datetime_like(left) || is_datetime_like(right) {
        return DataType::Utf8;
    }
    match (left, right) {
        (DataType::Null, other) | (other, DataType::Null) => {
            if is_float(other) || *other == DataType::Utf8 {
                other.clone()
            } else {
                MISSING_DTYPE
            }
        }
        (DataType::Boolean, other) | (other, DataType::Boolean)
            if is_integer(other) || is_float(other) =>
        {
            other.clone()
        }
        (l, r) if is_integer(l) && is_integer(r) => {
            let (lw, ls) = int_width(l);
            let (rw, rs) = int_width(r);
            match (ls, rs) {
                (true, true) => signed_of(lw.max(rw)),
                (false, false) => unsigned_of(lw.max(rw)),
                _ => {
                    let (uw, sw) = if ls { (rw, lw) } else { (lw, rw) };
                    if uw < sw {
                        signed_of(sw)
                    } else if uw >= 64 {
                        DataType::Float64
                    } else {
                        signed_of(uw * 2)
                    }
                }
            }
        }
        (l, r) if is_integer(l) && is_float(r) => r.clone(),
        (l, r) if is_float(l) && is_integer(r) => l.clone(),
        (l, r) if is_float(l) && is_float(r) => {
            let width = |dt: &DataType| match dt {
                DataType::Float16 => 16u8,
                DataType::Float32 => 32,
                _ => 64,
            };
            match width(l).max(width(r)) {
                16 => DataType::Float16,
                32 => DataType::Float32,
                _ => DataType::Float64,
            }
        }
        _ => DataType::Utf8,
    }
}

fn numeric_kernel(
    op: ArithOp,
    left: &dyn arrow::array::Datum,
    right: &dyn arrow::array::Datum,
) -> Result<ArrayRef, ArrowError> {
    use arrow::compute::kernels::numeric;
    match op {
        ArithOp::Add => numeric::add(left, right),
        ArithOp::Sub => numeric::sub(left, right),
        ArithOp::Mul => numeric::mul(left, right),
        ArithOp::Div => numeric::div(left, right),
        ArithOp::Rem => numeric::rem(left, right),
    }
}

fn cmp_kernel(
    op: CmpOp,
    left: &dyn arrow::array::Datum,
    right: &dyn arrow::array::Datum,
) -> Result<BooleanArray, ArrowError> {
    use arrow::compute::kernels::cmp;
    match op {
        CmpOp::Eq => cmp::eq(left, right),
        CmpOp::Ne => cmp::neq(left, right),
        CmpOp::Lt => cmp::lt(left, right),
        CmpOp::Le => cmp::lt_eq(left, right),
        CmpOp::Gt => cmp::gt(left, right),
        CmpOp::Ge => cmp::gt_eq(left, right),
    }
}

fn arith_target(op: ArithOp, left: &DataType, right: &DataType) -> DataType {
    let common = find_common_type(left, right);
    // Integer division is not guaranteed to be integral.
    if op == ArithOp::Div && is_integer(&common) {
        DataType::Float64
    } else {
        common
    }
}

/// Elementwise arithmetic over two same-length columns, casting both sides to
/// their common type first.
pub fn arith_columns(op: ArithOp, left: &ArrayRef, right: &ArrayRef) -> anyhow::Result<ArrayRef> {
    let target = arith_target(op, left.data_type(), right.data_type());
    let l = compute::cast(left.as_ref(), &target)?;
    let r = compute::cast(right.as_ref(), &target)?;
    Ok(numeric_kernel(op, &l, &r)?)
}

/// Elementwise comparison over two same-length columns.
pub fn cmp_columns(op: CmpOp, left: &ArrayRef, right: &ArrayRef) -> anyhow::Result<ArrayRef> {
    let target = find_common_type(left.data_type(), right.data_type());
    let l = compute::cast(left.as_ref(), &target)?;
    let r = compute::cast(right.as_ref(), &target)?;
    Ok(Arc::new(cmp_kernel(op, &l, &r)?))
}

fn arith_column_scalar(
    op: ArithOp,
    left: &ArrayRef,
    scalar: &ArrayRef,
) -> anyhow::Result<ArrayRef> {
    let target = arith_target(op, left.data_type(), scalar.data_type());
    let l = compute::cast(left.as_ref(), &target)?;
    let s = compute::cast(scalar.as_ref(), &target)?;
    Ok(numeric_kernel(op, &l, &Scalar::new(s))?)
}

fn cmp_column_scalar(op: CmpOp, left: &ArrayRef, scalar: &ArrayRef) -> anyhow::Result<ArrayRef> {
    let target = find_common_type(left.data_type(), scalar.data_type());
    let l = compute::cast(left.as_ref(), &target)?;
    let s = compute::cast(scalar.as_ref(), &target)?;
    Ok(Arc::new(cmp_kernel(op, &l, &Scalar::new(s))?))
}

fn rebuild(batch: &RecordBatch, columns: Vec<ArrayRef>) -> anyhow::Result<RecordBatch> {
    let fields: Vec<Field> = batch
        .schema()
        .fields()
        .iter()
        .zip(&columns)
        .map(|(field, column)| Field::new(field.name(), column.data_type().clone(), true))
        .collect();
    if fields.is_empty() {
        let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
        return Ok(RecordBatch::try_new_with_options(
            Arc::new(Schema::empty()),
            vec![],
            &options,
        )?);
    }
    Ok(RecordBatch::try_new(
        Arc::new(Schema::new(fields)),
        columns,
    )?)
}

/// Position-wise arithmetic between two fragments with identical column
/// layout (the shape alignment produces).
pub fn arith_batches(
    op: ArithOp,
    left: &RecordBatch,
    right: &RecordBatch,
) -> anyhow::Result<RecordBatch> {
    ensure!(
        left.num_columns() == right.num_columns(),
        "fragment column counts differ: {} vs {}",
        left.num_columns(),
        right.num_columns()
    );
    let columns = left
        .columns()
        .iter()
        .zip(right.columns())
        .map(|(l, r)| arith_columns(op, l, r))
        .collect::<anyhow::Result<Vec<_>>>()?;
    rebuild(left, columns)
}

/// Position-wise comparison between two fragments with identical column
/// layout.
pub fn cmp_batches(
    op: CmpOp,
    left: &RecordBatch,
    right: &RecordBatch,
) -> anyhow::Result<RecordBatch> {
    ensure!(
        left.num_columns() == right.num_columns(),
        "fragment column counts differ: {} vs {}",
        left.num_columns(),
        right.num_columns()
    );
    let columns = left
        .columns()
        .iter()
        .zip(right.columns())
        .map(|(l, r)| cmp_columns(op, l, r))
        .collect::<anyhow::Result<Vec<_>>>()?;
    rebuild(left, columns)
}

/// Arithmetic against a broadcast vector. On the row axis the vector runs
/// down the fragment's rows; on the column axis it holds one value per
/// fragment column.
pub fn arith_with_values(
    op: ArithOp,
    left: &RecordBatch,
    values: &ArrayRef,
    axis: Axis,
) -> anyhow::Result<RecordBatch> {
    let columns = match axis {
        Axis::Rows => {
            ensure!(
                values.len() == left.num_rows(),
                "vector length {} does not match fragment rows {}",
                values.len(),
                left.num_rows()
            );
            left.columns()
                .iter()
                .map(|col| arith_columns(op, col, values))
                .collect::<anyhow::Result<Vec<_>>>()?
        }
        Axis::Columns => {
            ensure!(
                values.len() == left.num_columns(),
                "vector length {} does not match fragment columns {}",
                values.len(),
                left.num_columns()
            );
            left.columns()
                .iter()
                .enumerate()
                .map(|(j, col)| arith_column_scalar(op, col, &values.slice(j, 1)))
                .collect::<anyhow::Result<Vec<_>>>()?
        }
    };
    rebuild(left, columns)
}

/// Comparison against a broadcast vector; see [`arith_with_values`].
pub fn cmp_with_values(
    op: CmpOp,
    left: &RecordBatch,
    values: &ArrayRef,
    axis: Axis,
) -> anyhow::Result<RecordBatch> {
    let columns = match axis {
        Axis::Rows => {
            ensure!(
                values.len() == left.num_rows(),
                "vector length {} does not match fragment rows {}",
                values.len(),
                left.num_rows()
            );
            left.columns()
                .iter()
                .map(|col| cmp_columns(op, col, values))
                .collect::<anyhow::Result<Vec<_>>>()?
        }
        Axis::Columns => {
            ensure!(
                values.len() == left.num_columns(),
                "vector length {} does not match fragment columns {}",
                values.len(),
                left.num_columns()
            );
            left.columns()
                .iter()
                .enumerate()
                .map(|(j, col)| cmp_column_scalar(op, col, &values.slice(j, 1)))
                .collect::<anyhow::Result<Vec<_>>>()?
        }
    };
    rebuild(left, columns)
}

/// Arithmetic against a scalar, applied to every column.
pub fn arith_with_scalar(
    op: ArithOp,
    left: &RecordBatch,
    value: &ScalarValue,
) -> anyhow::Result<RecordBatch> {
    let scalar = value.to_array();
    let columns = left
        .columns()
        .iter()
        .map(|col| arith_column_scalar(op, col, &scalar))
        .collect::<anyhow::Result<Vec<_>>>()?;
    rebuild(left, columns)
}

/// Comparison against a scalar, applied to every column.
pub fn cmp_with_scalar(
    op: CmpOp,
    left: &RecordBatch,
    value: &ScalarValue,
) -> anyhow::Result<RecordBatch> {
    let scalar = value.to_array();
    let columns = left
        .columns()
        .iter()
        .map(|col| cmp_column_scalar(op, col, &scalar))
        .collect::<anyhow::Result<Vec<_>>>()?;
    rebuild(left, columns)
}

/// Every field made nullable; reindexing introduces nulls into any column.
pub fn nullable_fields(schema: &Schema) -> Vec<Field> {
    schema
        .fields()
        .iter()
        .map(|f| f.as_ref().clone().with_nullable(true))
        .collect()
}

/// Stack fragments vertically. All fragments must share a schema.
pub fn concat_rows(batches: &[RecordBatch]) -> Result<RecordBatch, ArrowError> {
    let Some(first) = batches.first() else {
        let options = RecordBatchOptions::new().with_row_count(Some(0));
        return RecordBatch::try_new_with_options(Arc::new(Schema::empty()), vec![], &options);
    };
    if first.num_columns() == 0 {
        let rows = batches.iter().map(|b| b.num_rows()).sum();
        let options = RecordBatchOptions::new().with_row_count(Some(rows));
        return RecordBatch::try_new_with_options(first.schema(), vec![], &options);
    }
    compute::concat_batches(&first.schema(), batches)
}

/// Stack fragments horizontally. All fragments must have the same row count.
pub fn concat_columns(batches: &[RecordBatch]) -> Result<RecordBatch, ArrowError> {
    let rows = batches.first().map(|b| b.num_rows()).unwrap_or(0);
    let mut fields = Vec::new();
    let mut columns = Vec::new();
    for batch in batches {
        fields.extend(nullable_fields(&batch.schema()));
        columns.extend(batch.columns().iter().cloned());
    }
    if fields.is_empty() {
        let options = RecordBatchOptions::new().with_row_count(Some(rows));
        return RecordBatch::try_new_with_options(Arc::new(Schema::empty()), vec![], &options);
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
}

/// Gather rows by position. A null index produces a null-filled row, which is
/// how alignment represents labels absent from one operand.
pub fn take_rows(batch: &RecordBatch, indices: &Int64Array) -> Result<RecordBatch, ArrowError> {
    if batch.num_columns() == 0 {
        let options = RecordBatchOptions::new().with_row_count(Some(indices.len()));
        return RecordBatch::try_new_with_options(batch.schema(), vec![], &options);
    }
    let columns = batch
        .columns()
        .iter()
        .map(|col| compute::take(col.as_ref(), indices, None))
        .collect::<Result<Vec<_>, _>>()?;
    RecordBatch::try_new(
        Arc::new(Schema::new(nullable_fields(&batch.schema()))),
        columns,
    )
}

/// Project columns by position under new names. A `None` pick synthesizes a
/// null-filled column of the missing-value marker type.
pub fn select_columns(
    batch: &RecordBatch,
    picks: &[(Option<usize>, String)],
) -> Result<RecordBatch, ArrowError> {
    let rows = batch.num_rows();
    if picks.is_empty() {
        let options = RecordBatchOptions::new().with_row_count(Some(rows));
        return RecordBatch::try_new_with_options(Arc::new(Schema::empty()), vec![], &options);
    }
    let mut fields = Vec::with_capacity(picks.len());
    let mut columns = Vec::with_capacity(picks.len());
    for (pick, name) in picks {
        match pick {
            Some(idx) => {
                let column = batch.column(*idx).clone();
                fields.push(Field::new(name, column.data_type().clone(), true));
                columns.push(column);
            }
            None => {
                fields.push(Field::new(name, MISSING_DTYPE, true));
                columns.push(new_null_array(&MISSING_DTYPE, rows));
            }
        }
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Float64Array;

    fn int_batch(name: &str, values: &[i64]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new(
            name,
            DataType::Int64,
            true,
        )]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values.to_vec()))]).unwrap()
    }

    #[test]
    fn common_type_follows_promotion_order() {
        assert_eq!(
            find_common_type(&DataType::Boolean, &DataType::Int32),
            DataType::Int32
        );
        assert_eq!(
            find_common_type(&DataType::Int32, &DataType::Float32),
            DataType::Float32
        );
        assert_eq!(
            find_common_type(&DataType::Float32, &DataType::Float64),
            DataType::Float64
        );
        assert_eq!(
            find_common_type(&DataType::Int64, &DataType::Utf8),
            DataType::Utf8
        );
        assert_eq!(
            find_common_type(&DataType::Boolean, &DataType::Boolean),
            DataType::Boolean
        );
    }

    #[test]
    fn mixed_signedness_widens_to_signed() {
        assert_eq!(
            find_common_type(&DataType::UInt8, &DataType::Int32),
            DataType::Int32
        );
        assert_eq!(
            find_common_type(&DataType::UInt32, &DataType::Int32),
            DataType::Int64
        );
        assert_eq!(
            find_common_type(&DataType::UInt64, &DataType::Int64),
            DataType::Float64
        );
    }

    #[test]
    fn datetime_mismatch_promotes_to_text() {
        assert_eq!(
            find_common_type(&DataType::Date32, &DataType::Date64),
            DataType::Utf8
        );
        assert_eq!(
            find_common_type(&DataType::Date32, &DataType::Date32),
            DataType::Date32
        );
    }

    #[test]
    fn division_of_integers_produces_floats() {
        let left = int_batch("x", &[7, 8]);
        let right = int_batch("x", &[2, 4]);
        let result = arith_batches(ArithOp::Div, &left, &right).unwrap();
        let col = result
            .column(0)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(col.value(0), 3.5);
        assert_eq!(col.value(1), 2.0);
    }

    #[test]
    fn take_rows_null_fills_missing_positions() {
        let batch = int_batch("x", &[10, 20, 30]);
        let indices = Int64Array::from(vec![Some(2), None, Some(0)]);
        let taken = take_rows(&batch, &indices).unwrap();
        let col = taken
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(col.value(0), 30);
        assert!(col.is_null(1));
        assert_eq!(col.value(2), 10);
    }

    #[test]
    fn select_columns_synthesizes_missing_marker() {
        let batch = int_batch("x", &[1, 2]);
        let picks = vec![
            (Some(0), "x".to_string()),
            (None, "y".to_string()),
        ];
        let selected = select_columns(&batch, &picks).unwrap();
        assert_eq!(selected.schema().field(1).data_type(), &MISSING_DTYPE);
        assert_eq!(selected.column(1).null_count(), 2);
    }

    #[test]
    fn scalar_comparison_yields_booleans() {
        let batch = int_batch("x", &[1, 5, 9]);
        let result = cmp_with_scalar(CmpOp::Gt, &batch, &ScalarValue::Int64(4)).unwrap();
        assert_eq!(result.schema().field(0).data_type(), &DataType::Boolean);
        let col = result
            .column(0)
            .as_any()
            .downcast_ref::<BooleanArray>()
            .unwrap();
        assert_eq!(
            (col.value(0), col.value(1), col.value(2)),
            (false, true, true)
        );
    }
}
