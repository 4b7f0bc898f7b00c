use super::types::{
    BarrierBits, ContextKey, IndexType, NativeObject, PrimitiveMode,
};
use crate::gpu::caches::{AttachmentSetKey, VertexBindingKey};
use crate::gpu::error::GpuError;
use crate::gpu::structs::{
    Access, Buffer, BlendDesc, ComputePipeline, DepthStencilDesc, Extent, Fence, Format,
    GraphicsPipeline, Image, ImageView, Query, RasterDesc, Rect2D, Sampler, Semaphore, Viewport,
};
use crate::utils::Handle;

/// What the active driver can do. Queried once at device creation; the
/// commit engine consults it to pick native versus emulated paths and to
/// clamp counts the backend cannot represent.
#[derive(Debug, Clone)]
pub struct DriverCaps {
    pub max_render_targets: u32,
    pub max_bind_groups: u32,
    pub max_vertex_streams: u32,
    pub max_viewports: u32,
    pub native_multi_draw: bool,
    pub native_multi_draw_indirect: bool,
    /// Whether the backend tracks subpass dependencies itself. Without it,
    /// the render-pass emulator inserts attachment barriers between
    /// subpasses.
    pub native_subpass_sync: bool,
    pub tessellation: bool,
    pub compute: bool,
    pub attachmentless_rendering: bool,
}

impl Default for DriverCaps {
    fn default() -> Self {
        Self {
            max_render_targets: 8,
            max_bind_groups: 4,
            max_vertex_streams: 8,
            max_viewports: 8,
            native_multi_draw: false,
            native_multi_draw_indirect: false,
            native_subpass_sync: false,
            tessellation: true,
            compute: true,
            attachmentless_rendering: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MultiDrawItem {
    pub vertex_count: u32,
    pub first_vertex: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MultiDrawIndexedItem {
    pub index_count: u32,
    pub first_index_offset: u64,
    pub base_vertex: i32,
}

/// Which parts of the currently bound attachment set a discard hint names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardTarget {
    Color(u32),
    Depth,
    Stencil,
}

/// The native-API surface the commit engine drives. One implementation per
/// backend, selected at device creation. All calls apply to the native
/// context identified by [`Driver::context_key`]; composite objects
/// returned by the `create_*` constructors are bound to that context and
/// die with it.
pub trait Driver {
    fn caps(&self) -> &DriverCaps;
    fn context_key(&self) -> ContextKey;

    // Composite constructors, reached through the object caches only.
    fn create_vertex_binding(&mut self, key: &VertexBindingKey) -> NativeObject;
    fn create_attachment_set(&mut self, key: &AttachmentSetKey) -> NativeObject;

    // Pipeline-global state.
    fn apply_raster_state(&mut self, raster: &RasterDesc);
    fn apply_blend_state(&mut self, blend: &BlendDesc, sample_mask: u32);
    fn apply_depth_stencil_state(&mut self, depth_stencil: &DepthStencilDesc, stencil_ref: u32);
    fn set_stencil_ref(&mut self, reference: u32);
    fn set_blend_factors(&mut self, factors: [f32; 4]);
    fn set_viewports(&mut self, viewports: &[Viewport]);
    fn set_scissors(&mut self, scissors: &[Rect2D]);
    fn set_patch_control_points(&mut self, count: u32);

    // Binds.
    fn bind_graphics_program(&mut self, pipeline: Handle<GraphicsPipeline>);
    fn bind_compute_program(&mut self, pipeline: Handle<ComputePipeline>);
    fn bind_attachment_set(&mut self, set: NativeObject);
    fn bind_default_surface(&mut self);
    fn set_draw_buffers(&mut self, count: u32, write_mask: u32);
    fn bind_vertex_binding(&mut self, binding: NativeObject);
    fn bind_uniform_buffer(&mut self, slot: u32, buffer: Handle<Buffer>, offset: u64, size: u64);
    fn bind_storage_buffer(&mut self, slot: u32, buffer: Handle<Buffer>, offset: u64, size: u64);
    fn bind_sampled_image(&mut self, slot: u32, view: ImageView, sampler: Handle<Sampler>);
    fn bind_storage_image(&mut self, slot: u32, view: ImageView, access: Access);
    fn bind_indirect_buffer(&mut self, buffer: Handle<Buffer>);

    // Hazards, clears, pass bookkeeping.
    fn memory_barrier(&mut self, barriers: BarrierBits);
    fn clear_color(&mut self, target: u32, value: [f32; 4]);
    fn clear_depth_stencil(&mut self, depth: Option<f32>, stencil: Option<u8>);
    fn discard_attachments(&mut self, attachments: &[DiscardTarget]);
    fn resolve_attachments(&mut self, dst: Option<NativeObject>, extent: Extent);

    // Draws and dispatches.
    fn draw(
        &mut self,
        mode: PrimitiveMode,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    #[allow(clippy::too_many_arguments)]
    fn draw_indexed(
        &mut self,
        mode: PrimitiveMode,
        index_type: IndexType,
        index_count: u32,
        instance_count: u32,
        first_index_offset: u64,
        base_vertex: i32,
        first_instance: u32,
    );
    fn multi_draw(&mut self, mode: PrimitiveMode, draws: &[MultiDrawItem]);
    fn multi_draw_indexed(
        &mut self,
        mode: PrimitiveMode,
        index_type: IndexType,
        draws: &[MultiDrawIndexedItem],
    );
    fn draw_indirect(&mut self, mode: PrimitiveMode, offset: u64);
    fn draw_indexed_indirect(&mut self, mode: PrimitiveMode, index_type: IndexType, offset: u64);
    fn multi_draw_indirect(&mut self, mode: PrimitiveMode, offset: u64, draw_count: u32, stride: u32);
    fn dispatch(&mut self, groups: [u32; 3]);
    fn dispatch_indirect(&mut self, offset: u64);

    // Submission-side synchronization.
    fn wait_semaphore(&mut self, semaphore: Handle<Semaphore>);
    fn signal_semaphore(&mut self, semaphore: Handle<Semaphore>);
    fn prepare_present(&mut self, image: Handle<Image>);

    fn begin_query(&mut self, query: Handle<Query>);
    fn end_query(&mut self, query: Handle<Query>);

    fn enqueue_fence_signal(&mut self, fence: Handle<Fence>, value: u64);
    fn device_wait_fence(&mut self, fence: Handle<Fence>, value: u64);
    /// Block the calling thread until the fence reaches `value`.
    fn host_wait_fence(&mut self, fence: Handle<Fence>, value: u64) -> Result<(), GpuError>;
    fn flush(&mut self);
    fn wait_idle(&mut self);
}

// --- Presentation surface -----------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SurfaceTransform {
    #[default]
    Optimal,
    Identity,
    Rotate90,
    Rotate180,
    Rotate270,
}

/// Mutable swapchain configuration handed to [`SurfaceDriver::recreate`];
/// the driver clamps it to what the surface supports.
#[derive(Debug, Clone)]
pub struct SurfaceConfig {
    pub extent: Extent,
    pub buffer_count: u32,
    pub format: Format,
    pub vsync: bool,
    pub transform: SurfaceTransform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Success { image: u32, suboptimal: bool },
    OutOfDate,
    SurfaceLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Success,
    Suboptimal,
    OutOfDate,
    SurfaceLost,
}

/// Presentation-engine surface: image acquisition and queue presentation.
/// Swapchain recreation funnels through [`SurfaceDriver::recreate`], which
/// may reuse the previous native swapchain as a seed.
pub trait SurfaceDriver {
    fn min_image_count(&self) -> u32;
    /// Zero means no upper bound.
    fn max_image_count(&self) -> u32;
    /// The extent currently dictated by the surface, if any.
    fn current_extent(&self) -> Option<Extent>;

    /// Tear down the image ring and build a new one for `config`, clamping
    /// the config to surface capabilities. Returns the image count.
    fn recreate(&mut self, config: &mut SurfaceConfig) -> Result<u32, GpuError>;
    /// Rebuild the underlying OS surface after it was lost.
    fn rebuild_surface(&mut self) -> Result<(), GpuError>;

    fn acquire(&mut self, signal: Handle<Semaphore>) -> AcquireOutcome;
    fn present(&mut self, image: u32, wait: Handle<Semaphore>) -> PresentOutcome;
}
