//! `ucl` standard runtime types.
//!
//! The high-level surface: [`Context`] owns drivers and accelerators,
//! [`Accelerator`] owns streams, buffers and kernels, [`Stream`] orders
//! submissions, [`Buffer`] and [`Kernel`] carry the data and the code.

mod accelerator;
mod buffer;
mod context;
mod event;
mod kernel;
mod spatial_dims;
mod stream;

pub use self::accelerator::{Accelerator, AcceleratorStatus, DeviceError};
pub use self::buffer::{
    Buffer, BufferBuilder, BufferCopyCmd, BufferReadCmd, BufferView, BufferWriteCmd, MemLayout,
    MemoryError, PinnedGuard, UclPrm,
};
pub use self::context::{Context, ContextBuilder, RuntimeConfig};
pub use self::event::{Event, EventList};
pub use self::kernel::{Kernel, LaunchCmd, LaunchError};
pub use self::spatial_dims::SpatialDims;
pub use self::stream::{Stream, StreamState};

use num_traits::ToPrimitive;
use std::fmt::Debug;

/// Types describing the amount of work to be done in up to three
/// dimensions.
pub trait WorkDims {
    /// Number of dimensions defined.
    fn dim_count(&self) -> u32;

    /// Per-axis extents; unspecified dimensions are `1`.
    fn to_extent(&self) -> [u32; 3];

    /// Total element count across every axis.
    fn count(&self) -> u64 {
        let [x, y, z] = self.to_extent();
        x as u64 * y as u64 * z as u64
    }
}

pub(crate) fn to_u32<T: ToPrimitive + Debug + Copy>(val: T) -> u32 {
    val.to_u32()
        .unwrap_or_else(|| panic!("unable to convert {:?} into a work dimension", val))
}
