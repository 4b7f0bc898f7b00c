pub mod types;
pub mod ops;
pub mod record;

pub use ops::{
    AcquireOutcome, DiscardTarget, Driver, DriverCaps, MultiDrawIndexedItem, MultiDrawItem,
    PresentOutcome, SurfaceConfig, SurfaceDriver, SurfaceTransform,
};
pub use record::{RecordedOp, RecordingDriver, SurfaceEvent, TestSurface};
pub use types::{
    read_barriers, write_barriers, BarrierBits, ContextKey, IndexType, NativeObject,
    PrimitiveMode, ResourceId, Topology, UsageBits,
};
