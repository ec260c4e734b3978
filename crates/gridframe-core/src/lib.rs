pub mod error;
pub mod executor;
pub mod frame;
pub mod label;
pub mod local;
pub mod partition;

pub use error::{FrameError, Result};
pub use executor::{CellTask, LazyExecutor, PartitionExecutor, RayonExecutor};
pub use frame::{Axis, PartitionedFrame};
pub use label::Label;
pub use partition::{GridCoord, Partition};
