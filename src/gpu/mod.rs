//! The rendering-command runtime: a logical context that records "set state /
//! bind / draw" calls, commits them as minimal deltas to a pluggable native
//! driver, and paces presentation through a multi-buffered swapchain.

pub mod error;
pub mod structs;
pub mod driver;
pub mod barriers;
pub mod bindings;
pub mod caches;
pub mod state;
pub mod render_pass;
pub mod device;
pub mod context;
pub mod swapchain;

pub use error::*;
pub use structs::*;
pub use driver::{
    read_barriers, write_barriers, AcquireOutcome, BarrierBits, ContextKey, DiscardTarget, Driver,
    DriverCaps, IndexType, MultiDrawIndexedItem, MultiDrawItem, NativeObject, PresentOutcome,
    PrimitiveMode, RecordedOp, RecordingDriver, ResourceId, SurfaceConfig, SurfaceDriver,
    SurfaceEvent, SurfaceTransform, TestSurface, Topology, UsageBits,
};
pub use barriers::HazardTracker;
pub use bindings::{BindingState, GroupMask, MAX_BIND_GROUPS};
pub use caches::{AttachmentSetKey, ContextCaches, DeviceCaches, StreamKey, VertexBindingKey};
pub use state::{
    BoundAttachments, ContextState, DirtyFlags, IndexBinding, RenderState, VertexStream,
};
pub use render_pass::{
    AttachmentDesc, Framebuffer, FramebufferInfo, RenderPass, RenderPassInfo, SubpassDesc,
    SubpassInfo,
};
pub use device::Device;
pub use context::{
    BeginRenderPassInfo, Context, DrawArgs, DrawIndexedArgs, MultiDrawIndexedEntry,
    SLOTS_PER_GROUP,
};
pub use swapchain::{Swapchain, SwapchainInfo};
