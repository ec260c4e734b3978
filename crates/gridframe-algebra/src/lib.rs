pub mod align;
pub mod binary;
pub mod dtypes;
pub mod registry;

pub use align::{copartition, reconcile, AxisPlan, Copartitioned, JoinPolicy};
pub use binary::{
    BinaryOperator, BinaryOpts, DtypeOverride, DtypePolicy, FragmentFn, FragmentOperand,
    LabelPolicy, Operand,
};
pub use dtypes::{all_bool, common_cast, int_to_float, DtypeMap};
pub use registry::{OperatorRegistry, OperatorSpec};
