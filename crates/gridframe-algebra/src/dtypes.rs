//! Result-type inference for binary operations, computed from the operands'
//! dtype mappings without touching any data.

use arrow::datatypes::DataType;
use gridframe_core::local::{find_common_type, is_integer, MISSING_DTYPE};
use gridframe_core::Label;
use std::collections::BTreeMap;

/// Column-label to element-type mapping, kept sorted by label so repeated
/// inference runs compare identically.
pub type DtypeMap = BTreeMap<Label, DataType>;

/// Result types for an operation that casts each shared column to the common
/// type of its operands. Columns present in only one operand are entirely
/// absent on the other side, so they get the missing-value marker type.
pub fn common_cast(first: &DtypeMap, second: &DtypeMap) -> DtypeMap {
    let mut result = DtypeMap::new();
    for (label, dtype) in first {
        let inferred = match second.get(label) {
            Some(other) => find_common_type(dtype, other),
            None => MISSING_DTYPE,
        };
        result.insert(label.clone(), inferred);
    }
    for label in second.keys() {
        if !first.contains_key(label) {
            result.insert(label.clone(), MISSING_DTYPE);
        }
    }
    result
}

/// Upgrade every integer-family result type to 64-bit float. Applied after
/// [`common_cast`] for division-like operators, since integer division is not
/// guaranteed to be integral.
pub fn int_to_float(dtypes: &DtypeMap) -> DtypeMap {
    dtypes
        .iter()
        .map(|(label, dtype)| {
            let dtype = if is_integer(dtype) {
                DataType::Float64
            } else {
                dtype.clone()
            };
            (label.clone(), dtype)
        })
        .collect()
}

/// Every column forced to boolean, for comparison-style operators.
pub fn all_bool<'a>(labels: impl IntoIterator<Item = &'a Label>) -> DtypeMap {
    labels
        .into_iter()
        .map(|label| (label.clone(), DataType::Boolean))
        .collect()
}
