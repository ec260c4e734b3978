//! End-to-end operator behavior over partitioned frames.

use arrow::array::{Array, ArrayRef, BooleanArray, Float64Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use gridframe_algebra::{
    BinaryOpts, DtypeOverride, JoinPolicy, Operand, OperatorRegistry,
};
use gridframe_core::local::ScalarValue;
use gridframe_core::{FrameError, Label, LazyExecutor, PartitionedFrame, RayonExecutor};
use std::sync::Arc;

fn int_batch(columns: &[(&str, Vec<i64>)]) -> RecordBatch {
    let fields: Vec<Field> = columns
        .iter()
        .map(|(name, _)| Field::new(*name, DataType::Int64, true))
        .collect();
    let arrays: Vec<ArrayRef> = columns
        .iter()
        .map(|(_, values)| Arc::new(Int64Array::from(values.clone())) as ArrayRef)
        .collect();
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).unwrap()
}

fn frame(
    batch: RecordBatch,
    row_labels: &[i64],
    row_chunks: usize,
    col_chunks: usize,
) -> PartitionedFrame {
    let labels = row_labels.iter().map(|&i| Label::from(i)).collect();
    PartitionedFrame::from_batch_chunked(
        batch,
        Some(labels),
        row_chunks,
        col_chunks,
        Arc::new(LazyExecutor),
    )
    .unwrap()
}

fn i64_values(batch: &RecordBatch, col: usize) -> Vec<Option<i64>> {
    let array = batch
        .column(col)
        .as_any()
        .downcast_ref::<Int64Array>()
        .unwrap();
    (0..array.len())
        .map(|i| array.is_valid(i).then(|| array.value(i)))
        .collect()
}

fn registry() -> OperatorRegistry {
    OperatorRegistry::with_standard_operators().unwrap()
}

#[test]
fn outer_add_unions_labels_and_null_fills() {
    let left = frame(
        int_batch(&[("a", vec![1, 2, 3]), ("b", vec![4, 5, 6])]),
        &[0, 1, 2],
        2,
        1,
    );
    let right = frame(
        int_batch(&[("b", vec![7, 9, 11]), ("c", vec![10, 20, 30])]),
        &[1, 2, 3],
        1,
        2,
    );
    let add = registry().build("add").unwrap();
    let result = add
        .apply(&left, &Operand::Frame(right), BinaryOpts::default())
        .unwrap();

    let expected_rows: Vec<Label> = vec![0.into(), 1.into(), 2.into(), 3.into()];
    assert_eq!(result.row_index(), expected_rows.as_slice());
    let expected_cols: Vec<Label> = vec!["a".into(), "b".into(), "c".into()];
    assert_eq!(result.column_index(), expected_cols.as_slice());

    let batch = result.to_batch().unwrap();
    // Shared column: null where either side lacks the row label.
    assert_eq!(i64_values(&batch, 1), vec![None, Some(12), Some(15), None]);
    // One-sided columns pick up the missing-value marker type and stay null.
    assert_eq!(batch.column(0).data_type(), &DataType::Float64);
    assert_eq!(batch.column(0).null_count(), 4);
    assert_eq!(batch.column(2).data_type(), &DataType::Float64);
    assert_eq!(batch.column(2).null_count(), 4);
}

#[test]
fn result_partitioning_is_consistent() {
    let left = frame(
        int_batch(&[("a", vec![1, 2, 3]), ("b", vec![4, 5, 6])]),
        &[0, 1, 2],
        2,
        2,
    );
    let right = frame(
        int_batch(&[("a", vec![7, 8, 9]), ("b", vec![1, 1, 1])]),
        &[0, 1, 2],
        3,
        1,
    );
    let add = registry().build("add").unwrap();
    let result = add
        .apply(&left, &Operand::Frame(right), BinaryOpts::default())
        .unwrap();
    assert_eq!(result.row_lengths().iter().sum::<usize>(), result.num_rows());
    assert_eq!(
        result.column_widths().iter().sum::<usize>(),
        result.num_cols()
    );
    let (rows, cols) = result.grid_shape();
    assert_eq!(rows, result.row_lengths().len());
    assert_eq!(cols, result.column_widths().len());
}

#[test]
fn operands_are_left_untouched() {
    let left = frame(int_batch(&[("a", vec![1, 2, 3, 4])]), &[0, 1, 2, 3], 2, 1);
    let right = frame(int_batch(&[("a", vec![9, 9, 9])]), &[2, 3, 4], 1, 1);
    let left_before = left.to_batch().unwrap();
    let right_before = right.to_batch().unwrap();

    let sub = registry().build("sub").unwrap();
    let result = sub
        .apply(&left, &Operand::Frame(right.clone()), BinaryOpts::default())
        .unwrap();
    result.to_batch().unwrap();

    assert_eq!(left.to_batch().unwrap(), left_before);
    assert_eq!(right.to_batch().unwrap(), right_before);
    assert_eq!(left.row_index().len(), 4);
}

#[test]
fn broadcast_applies_column_vector_down_the_rows() {
    let left = frame(
        int_batch(&[("a", vec![1, 2, 3, 4]), ("b", vec![10, 20, 30, 40])]),
        &[0, 1, 2, 3],
        2,
        2,
    );
    let right = frame(int_batch(&[("v", vec![1, 1, 2, 2])]), &[0, 1, 2, 3], 2, 1);
    let add = registry().build("add").unwrap();
    let opts = BinaryOpts {
        broadcast: true,
        ..Default::default()
    };
    let result = add.apply(&left, &Operand::Frame(right), opts).unwrap();

    // Broadcast never changes the left frame's labels or partitioning.
    assert_eq!(result.column_index(), left.column_index());
    assert_eq!(result.grid_shape(), left.grid_shape());
    let batch = result.to_batch().unwrap();
    assert_eq!(
        i64_values(&batch, 0),
        vec![Some(2), Some(3), Some(5), Some(6)]
    );
    assert_eq!(
        i64_values(&batch, 1),
        vec![Some(11), Some(21), Some(32), Some(42)]
    );
}

#[test]
fn broadcast_requires_a_single_column_operand() {
    let left = frame(int_batch(&[("a", vec![1, 2])]), &[0, 1], 1, 1);
    let wide = frame(
        int_batch(&[("a", vec![1, 2]), ("b", vec![3, 4])]),
        &[0, 1],
        1,
        1,
    );
    let add = registry().build("add").unwrap();
    let opts = BinaryOpts {
        broadcast: true,
        ..Default::default()
    };
    let err = add.apply(&left, &Operand::Frame(wide), opts);
    assert!(matches!(err, Err(FrameError::ShapeMismatch(_))));
}

#[test]
fn array_like_operand_spans_partition_boundaries() {
    let left = frame(
        int_batch(&[("a", vec![1, 2, 3, 4]), ("b", vec![5, 6, 7, 8])]),
        &[0, 1, 2, 3],
        2,
        2,
    );
    let values: ArrayRef = Arc::new(Int64Array::from(vec![100, 200, 300, 400]));
    let add = registry().build("add").unwrap();
    let result = add
        .apply(&left, &Operand::ArrayLike(values), BinaryOpts::default())
        .unwrap();
    let batch = result.to_batch().unwrap();
    assert_eq!(
        i64_values(&batch, 0),
        vec![Some(101), Some(202), Some(303), Some(404)]
    );
    assert_eq!(
        i64_values(&batch, 1),
        vec![Some(105), Some(206), Some(307), Some(408)]
    );
}

#[test]
fn array_like_length_must_match_the_axis() {
    let left = frame(int_batch(&[("a", vec![1, 2, 3, 4])]), &[0, 1, 2, 3], 2, 1);
    let values: ArrayRef = Arc::new(Int64Array::from(vec![1, 2, 3]));
    let add = registry().build("add").unwrap();
    let err = add.apply(&left, &Operand::ArrayLike(values), BinaryOpts::default());
    assert!(matches!(err, Err(FrameError::ShapeMismatch(_))));
}

#[test]
fn scalar_results_agree_across_executors() {
    let batch = int_batch(&[("a", vec![1, 2, 3, 4]), ("b", vec![5, 6, 7, 8])]);
    let lazy = PartitionedFrame::from_batch_chunked(
        batch.clone(),
        None,
        2,
        2,
        Arc::new(LazyExecutor),
    )
    .unwrap();
    let eager =
        PartitionedFrame::from_batch_chunked(batch, None, 2, 2, Arc::new(RayonExecutor)).unwrap();

    let mul = registry().build("mul").unwrap();
    let scalar = Operand::Scalar(ScalarValue::from(10));
    let from_lazy = mul.apply(&lazy, &scalar, BinaryOpts::default()).unwrap();
    let from_eager = mul.apply(&eager, &scalar, BinaryOpts::default()).unwrap();

    assert!(!from_lazy.partition(0, 0).is_ready());
    assert!(from_eager.partition(0, 0).is_ready());
    assert_eq!(
        from_lazy.to_batch().unwrap(),
        from_eager.to_batch().unwrap()
    );
    assert_eq!(
        i64_values(&from_lazy.to_batch().unwrap(), 0),
        vec![Some(10), Some(20), Some(30), Some(40)]
    );
}

#[test]
fn comparison_infers_all_boolean_dtypes() {
    let left = frame(
        int_batch(&[("a", vec![1, 2, 3]), ("b", vec![4, 5, 6])]),
        &[0, 1, 2],
        1,
        1,
    );
    let right = frame(
        int_batch(&[("a", vec![1, 9, 3]), ("b", vec![9, 5, 9])]),
        &[0, 1, 2],
        1,
        1,
    );
    left.materialize_dtypes().unwrap();
    right.materialize_dtypes().unwrap();

    let eq = registry().build("eq").unwrap();
    let result = eq
        .apply(&left, &Operand::Frame(right), BinaryOpts::default())
        .unwrap();
    let dtypes = result.known_dtypes().expect("comparison dtypes are eager");
    assert_eq!(dtypes.len(), 2);
    assert!(dtypes.values().all(|t| *t == DataType::Boolean));

    let batch = result.to_batch().unwrap();
    let a = batch
        .column(0)
        .as_any()
        .downcast_ref::<BooleanArray>()
        .unwrap();
    assert_eq!(
        (0..a.len()).map(|i| a.value(i)).collect::<Vec<_>>(),
        vec![true, false, true]
    );
}

#[test]
fn division_promotes_integers_to_floats() {
    let right = frame(
        int_batch(&[("a", vec![2, 2, 2]), ("b", vec![4, 4, 4])]),
        &[0, 1, 2],
        1,
        1,
    );
    right.materialize_dtypes().unwrap();
    let left = frame(
        int_batch(&[("a", vec![1, 3, 5]), ("b", vec![8, 12, 16])]),
        &[0, 1, 2],
        1,
        1,
    );
    left.materialize_dtypes().unwrap();

    let div = registry().build("div").unwrap();
    let result = div
        .apply(&left, &Operand::Frame(right), BinaryOpts::default())
        .unwrap();
    let dtypes = result.known_dtypes().expect("division dtypes are eager");
    assert!(dtypes.values().all(|t| *t == DataType::Float64));

    let batch = result.to_batch().unwrap();
    let a = batch
        .column(0)
        .as_any()
        .downcast_ref::<Float64Array>()
        .unwrap();
    assert_eq!(
        (0..a.len()).map(|i| a.value(i)).collect::<Vec<_>>(),
        vec![0.5, 1.5, 2.5]
    );
}

#[test]
fn series_like_operand_defers_dtype_inference() {
    let left = frame(int_batch(&[("a", vec![1, 2, 3])]), &[0, 1, 2], 1, 1);
    let right = frame(int_batch(&[("a", vec![4, 5, 6])]), &[0, 1, 2], 1, 1);
    left.materialize_dtypes().unwrap();
    right.materialize_dtypes().unwrap();

    let add = registry().build("add").unwrap();
    let result = add
        .apply(&left, &Operand::Frame(right), BinaryOpts::default())
        .unwrap();
    assert!(result.known_dtypes().is_none());
    // Still derivable from the data on demand.
    assert_eq!(
        result.materialize_dtypes().unwrap()[&Label::from("a")],
        DataType::Int64
    );
}

#[test]
fn dtype_copy_carries_the_left_mapping() {
    let left = frame(int_batch(&[("a", vec![1, 2, 3])]), &[0, 1, 2], 1, 1);
    left.materialize_dtypes().unwrap();
    let add = registry().build("add").unwrap();
    let opts = BinaryOpts {
        dtypes: DtypeOverride::Copy,
        ..Default::default()
    };
    let result = add
        .apply(&left, &Operand::Scalar(ScalarValue::from(1)), opts)
        .unwrap();
    assert_eq!(result.known_dtypes(), left.known_dtypes());
}

#[test]
fn failed_cells_surface_only_on_materialization() {
    let left = frame(int_batch(&[("a", vec![1, 2, 3, 4])]), &[0, 1, 2, 3], 2, 1);
    let rem = registry().build("rem").unwrap();
    let result = rem
        .apply(&left, &Operand::Scalar(ScalarValue::from(0)), BinaryOpts::default())
        .unwrap();
    // Building the frame succeeds; the divide-by-zero is a partition failure.
    assert!(result.to_batch().is_err());
}

#[test]
fn configured_operator_honors_join_and_label_policies() {
    let mut registry = OperatorRegistry::new();
    let config: serde_yaml::Value =
        serde_yaml::from_str("op: add\njoin: inner\nlabels: drop").unwrap();
    registry.register_from_config("add_inner", &config).unwrap();
    let op = registry.build("add_inner").unwrap();
    assert_eq!(op.join_policy(), JoinPolicy::Inner);

    let left = frame(int_batch(&[("a", vec![1, 2, 3])]), &[0, 1, 2], 1, 1);
    let right = frame(int_batch(&[("a", vec![10, 20, 30])]), &[1, 2, 3], 1, 1);
    let result = op
        .apply(&left, &Operand::Frame(right), BinaryOpts::default())
        .unwrap();
    // Intersection keeps labels 1 and 2; the drop policy renumbers them.
    let expected: Vec<Label> = vec![0.into(), 1.into()];
    assert_eq!(result.row_index(), expected.as_slice());
    let batch = result.to_batch().unwrap();
    assert_eq!(i64_values(&batch, 0), vec![Some(12), Some(23)]);
}

#[test]
fn broadcast_hint_rejects_non_frame_operands() {
    let left = frame(int_batch(&[("a", vec![1, 2])]), &[0, 1], 1, 1);
    let add = registry().build("add").unwrap();
    let opts = BinaryOpts {
        broadcast: true,
        ..Default::default()
    };
    let err = add.apply(&left, &Operand::Scalar(ScalarValue::from(1)), opts);
    assert!(matches!(err, Err(FrameError::Configuration(_))));
}
