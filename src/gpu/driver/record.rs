//! The in-tree reference driver: executes the command protocol against an
//! in-memory op log. Used for headless operation and by the test suite,
//! which asserts on the exact native-op sequences the runtime emits.

use std::collections::{HashMap, VecDeque};

use super::ops::{
    AcquireOutcome, DiscardTarget, Driver, DriverCaps, MultiDrawIndexedItem, MultiDrawItem,
    PresentOutcome, SurfaceConfig, SurfaceDriver,
};
use super::types::{BarrierBits, ContextKey, IndexType, NativeObject, PrimitiveMode};
use crate::gpu::caches::{AttachmentSetKey, VertexBindingKey};
use crate::gpu::error::GpuError;
use crate::gpu::structs::{
    Access, BlendDesc, Buffer, ComputePipeline, DepthStencilDesc, Extent, Fence, GraphicsPipeline,
    Image, ImageView, Query, RasterDesc, Rect2D, Sampler, Semaphore, Viewport,
};
use crate::utils::Handle;

/// One recorded native op. Mirrors the [`Driver`] surface one to one.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedOp {
    CreateVertexBinding(NativeObject),
    CreateAttachmentSet(NativeObject),
    ApplyRasterState,
    ApplyBlendState,
    ApplyDepthStencilState { stencil_ref: u32 },
    SetStencilRef(u32),
    SetBlendFactors([f32; 4]),
    SetViewports(usize),
    SetScissors(usize),
    SetPatchControlPoints(u32),
    BindGraphicsProgram(Handle<GraphicsPipeline>),
    BindComputeProgram(Handle<ComputePipeline>),
    BindAttachmentSet(NativeObject),
    BindDefaultSurface,
    SetDrawBuffers { count: u32, write_mask: u32 },
    BindVertexBinding(NativeObject),
    BindUniformBuffer { slot: u32, buffer: Handle<Buffer>, offset: u64, size: u64 },
    BindStorageBuffer { slot: u32, buffer: Handle<Buffer>, offset: u64, size: u64 },
    BindSampledImage { slot: u32, image: Handle<Image> },
    BindStorageImage { slot: u32, image: Handle<Image>, access: Access },
    BindIndirectBuffer(Handle<Buffer>),
    MemoryBarrier(BarrierBits),
    ClearColor { target: u32, value: [f32; 4] },
    ClearDepthStencil { depth: Option<f32>, stencil: Option<u8> },
    DiscardAttachments(Vec<DiscardTarget>),
    ResolveAttachments { dst: Option<NativeObject> },
    Draw { mode: PrimitiveMode, vertex_count: u32, instance_count: u32 },
    DrawIndexed { index_count: u32, instance_count: u32 },
    MultiDraw { draw_count: usize },
    MultiDrawIndexed { draw_count: usize },
    DrawIndirect { offset: u64 },
    DrawIndexedIndirect { offset: u64 },
    MultiDrawIndirect { offset: u64, draw_count: u32, stride: u32 },
    Dispatch([u32; 3]),
    DispatchIndirect { offset: u64 },
    WaitSemaphore(Handle<Semaphore>),
    SignalSemaphore(Handle<Semaphore>),
    PreparePresent(Handle<Image>),
    BeginQuery(Handle<Query>),
    EndQuery(Handle<Query>),
    EnqueueFenceSignal { value: u64 },
    DeviceWaitFence { value: u64 },
    HostWaitFence { value: u64 },
    Flush,
    WaitIdle,
}

#[derive(Default, Clone, Copy)]
struct FenceSim {
    enqueued: u64,
    completed: u64,
}

pub struct RecordingDriver {
    caps: DriverCaps,
    key: ContextKey,
    ops: Vec<RecordedOp>,
    next_object: u64,
    fences: HashMap<Handle<Fence>, FenceSim>,
}

impl Default for RecordingDriver {
    fn default() -> Self {
        Self::with_caps(DriverCaps::default())
    }
}

impl RecordingDriver {
    pub fn with_caps(caps: DriverCaps) -> Self {
        Self {
            caps,
            key: ContextKey(1),
            ops: Vec::new(),
            next_object: 1,
            fences: HashMap::new(),
        }
    }

    pub fn ops(&self) -> &[RecordedOp] {
        &self.ops
    }

    pub fn take_ops(&mut self) -> Vec<RecordedOp> {
        std::mem::take(&mut self.ops)
    }

    pub fn clear_ops(&mut self) {
        self.ops.clear();
    }

    pub fn count_ops<F>(&self, pred: F) -> usize
    where
        F: Fn(&RecordedOp) -> bool,
    {
        self.ops.iter().filter(|op| pred(op)).count()
    }

    /// Latest fence value the simulated GPU has completed.
    pub fn completed_fence_value(&self, fence: Handle<Fence>) -> u64 {
        self.fences.get(&fence).map(|f| f.completed).unwrap_or(0)
    }

    fn alloc_object(&mut self) -> NativeObject {
        let obj = NativeObject(self.next_object);
        self.next_object += 1;
        obj
    }

    fn retire_submitted(&mut self) {
        for sim in self.fences.values_mut() {
            sim.completed = sim.enqueued;
        }
    }
}

impl Driver for RecordingDriver {
    fn caps(&self) -> &DriverCaps {
        &self.caps
    }

    fn context_key(&self) -> ContextKey {
        self.key
    }

    fn create_vertex_binding(&mut self, _key: &VertexBindingKey) -> NativeObject {
        let obj = self.alloc_object();
        self.ops.push(RecordedOp::CreateVertexBinding(obj));
        obj
    }

    fn create_attachment_set(&mut self, _key: &AttachmentSetKey) -> NativeObject {
        let obj = self.alloc_object();
        self.ops.push(RecordedOp::CreateAttachmentSet(obj));
        obj
    }

    fn apply_raster_state(&mut self, _raster: &RasterDesc) {
        self.ops.push(RecordedOp::ApplyRasterState);
    }

    fn apply_blend_state(&mut self, _blend: &BlendDesc, _sample_mask: u32) {
        self.ops.push(RecordedOp::ApplyBlendState);
    }

    fn apply_depth_stencil_state(&mut self, _ds: &DepthStencilDesc, stencil_ref: u32) {
        self.ops
            .push(RecordedOp::ApplyDepthStencilState { stencil_ref });
    }

    fn set_stencil_ref(&mut self, reference: u32) {
        self.ops.push(RecordedOp::SetStencilRef(reference));
    }

    fn set_blend_factors(&mut self, factors: [f32; 4]) {
        self.ops.push(RecordedOp::SetBlendFactors(factors));
    }

    fn set_viewports(&mut self, viewports: &[Viewport]) {
        self.ops.push(RecordedOp::SetViewports(viewports.len()));
    }

    fn set_scissors(&mut self, scissors: &[Rect2D]) {
        self.ops.push(RecordedOp::SetScissors(scissors.len()));
    }

    fn set_patch_control_points(&mut self, count: u32) {
        self.ops.push(RecordedOp::SetPatchControlPoints(count));
    }

    fn bind_graphics_program(&mut self, pipeline: Handle<GraphicsPipeline>) {
        self.ops.push(RecordedOp::BindGraphicsProgram(pipeline));
    }

    fn bind_compute_program(&mut self, pipeline: Handle<ComputePipeline>) {
        self.ops.push(RecordedOp::BindComputeProgram(pipeline));
    }

    fn bind_attachment_set(&mut self, set: NativeObject) {
        self.ops.push(RecordedOp::BindAttachmentSet(set));
    }

    fn bind_default_surface(&mut self) {
        self.ops.push(RecordedOp::BindDefaultSurface);
    }

    fn set_draw_buffers(&mut self, count: u32, write_mask: u32) {
        self.ops
            .push(RecordedOp::SetDrawBuffers { count, write_mask });
    }

    fn bind_vertex_binding(&mut self, binding: NativeObject) {
        self.ops.push(RecordedOp::BindVertexBinding(binding));
    }

    fn bind_uniform_buffer(&mut self, slot: u32, buffer: Handle<Buffer>, offset: u64, size: u64) {
        self.ops.push(RecordedOp::BindUniformBuffer {
            slot,
            buffer,
            offset,
            size,
        });
    }

    fn bind_storage_buffer(&mut self, slot: u32, buffer: Handle<Buffer>, offset: u64, size: u64) {
        self.ops.push(RecordedOp::BindStorageBuffer {
            slot,
            buffer,
            offset,
            size,
        });
    }

    fn bind_sampled_image(&mut self, slot: u32, view: ImageView, _sampler: Handle<Sampler>) {
        self.ops.push(RecordedOp::BindSampledImage {
            slot,
            image: view.img,
        });
    }

    fn bind_storage_image(&mut self, slot: u32, view: ImageView, access: Access) {
        self.ops.push(RecordedOp::BindStorageImage {
            slot,
            image: view.img,
            access,
        });
    }

    fn bind_indirect_buffer(&mut self, buffer: Handle<Buffer>) {
        self.ops.push(RecordedOp::BindIndirectBuffer(buffer));
    }

    fn memory_barrier(&mut self, barriers: BarrierBits) {
        self.ops.push(RecordedOp::MemoryBarrier(barriers));
    }

    fn clear_color(&mut self, target: u32, value: [f32; 4]) {
        self.ops.push(RecordedOp::ClearColor { target, value });
    }

    fn clear_depth_stencil(&mut self, depth: Option<f32>, stencil: Option<u8>) {
        self.ops
            .push(RecordedOp::ClearDepthStencil { depth, stencil });
    }

    fn discard_attachments(&mut self, attachments: &[DiscardTarget]) {
        self.ops
            .push(RecordedOp::DiscardAttachments(attachments.to_vec()));
    }

    fn resolve_attachments(&mut self, dst: Option<NativeObject>, _extent: Extent) {
        self.ops.push(RecordedOp::ResolveAttachments { dst });
    }

    fn draw(
        &mut self,
        mode: PrimitiveMode,
        vertex_count: u32,
        instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        self.ops.push(RecordedOp::Draw {
            mode,
            vertex_count,
            instance_count,
        });
    }

    fn draw_indexed(
        &mut self,
        _mode: PrimitiveMode,
        _index_type: IndexType,
        index_count: u32,
        instance_count: u32,
        _first_index_offset: u64,
        _base_vertex: i32,
        _first_instance: u32,
    ) {
        self.ops.push(RecordedOp::DrawIndexed {
            index_count,
            instance_count,
        });
    }

    fn multi_draw(&mut self, _mode: PrimitiveMode, draws: &[MultiDrawItem]) {
        self.ops.push(RecordedOp::MultiDraw {
            draw_count: draws.len(),
        });
    }

    fn multi_draw_indexed(
        &mut self,
        _mode: PrimitiveMode,
        _index_type: IndexType,
        draws: &[MultiDrawIndexedItem],
    ) {
        self.ops.push(RecordedOp::MultiDrawIndexed {
            draw_count: draws.len(),
        });
    }

    fn draw_indirect(&mut self, _mode: PrimitiveMode, offset: u64) {
        self.ops.push(RecordedOp::DrawIndirect { offset });
    }

    fn draw_indexed_indirect(&mut self, _mode: PrimitiveMode, _index_type: IndexType, offset: u64) {
        self.ops.push(RecordedOp::DrawIndexedIndirect { offset });
    }

    fn multi_draw_indirect(
        &mut self,
        _mode: PrimitiveMode,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) {
        self.ops.push(RecordedOp::MultiDrawIndirect {
            offset,
            draw_count,
            stride,
        });
    }

    fn dispatch(&mut self, groups: [u32; 3]) {
        self.ops.push(RecordedOp::Dispatch(groups));
    }

    fn dispatch_indirect(&mut self, offset: u64) {
        self.ops.push(RecordedOp::DispatchIndirect { offset });
    }

    fn wait_semaphore(&mut self, semaphore: Handle<Semaphore>) {
        self.ops.push(RecordedOp::WaitSemaphore(semaphore));
    }

    fn signal_semaphore(&mut self, semaphore: Handle<Semaphore>) {
        self.ops.push(RecordedOp::SignalSemaphore(semaphore));
    }

    fn prepare_present(&mut self, image: Handle<Image>) {
        self.ops.push(RecordedOp::PreparePresent(image));
    }

    fn begin_query(&mut self, query: Handle<Query>) {
        self.ops.push(RecordedOp::BeginQuery(query));
    }

    fn end_query(&mut self, query: Handle<Query>) {
        self.ops.push(RecordedOp::EndQuery(query));
    }

    fn enqueue_fence_signal(&mut self, fence: Handle<Fence>, value: u64) {
        let sim = self.fences.entry(fence).or_default();
        sim.enqueued = sim.enqueued.max(value);
        self.ops.push(RecordedOp::EnqueueFenceSignal { value });
    }

    fn device_wait_fence(&mut self, _fence: Handle<Fence>, value: u64) {
        self.ops.push(RecordedOp::DeviceWaitFence { value });
    }

    fn host_wait_fence(&mut self, fence: Handle<Fence>, value: u64) -> Result<(), GpuError> {
        self.ops.push(RecordedOp::HostWaitFence { value });
        let sim = self.fences.entry(fence).or_default();
        if value > sim.enqueued {
            return Err(GpuError::FenceNeverSignaled {
                requested: value,
                enqueued: sim.enqueued,
            });
        }
        if sim.completed < value {
            sim.completed = value;
        }
        Ok(())
    }

    fn flush(&mut self) {
        self.ops.push(RecordedOp::Flush);
        self.retire_submitted();
    }

    fn wait_idle(&mut self) {
        self.ops.push(RecordedOp::WaitIdle);
        self.retire_submitted();
    }
}

// --- Test surface -------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceEvent {
    Recreated { buffer_count: u32, extent: Extent },
    SurfaceRebuilt,
    Acquired { image: u32 },
    Presented { image: u32 },
}

/// Scriptable presentation surface for the recording backend. Acquisition
/// round-robins through the ring unless outcomes are queued, which lets
/// tests replay suboptimal/out-of-date/lost sequences.
pub struct TestSurface {
    pub extent: Extent,
    pub min_images: u32,
    pub max_images: u32,
    pub scripted_acquires: VecDeque<AcquireOutcome>,
    pub scripted_presents: VecDeque<PresentOutcome>,
    /// The next N recreates fail as if the surface were lost.
    pub fail_recreates: u32,
    pub events: Vec<SurfaceEvent>,
    image_count: u32,
    next_image: u32,
}

impl TestSurface {
    pub fn new(extent: Extent) -> Self {
        Self {
            extent,
            min_images: 2,
            max_images: 0,
            scripted_acquires: VecDeque::new(),
            scripted_presents: VecDeque::new(),
            fail_recreates: 0,
            events: Vec::new(),
            image_count: 0,
            next_image: 0,
        }
    }

    pub fn image_count(&self) -> u32 {
        self.image_count
    }
}

impl SurfaceDriver for TestSurface {
    fn min_image_count(&self) -> u32 {
        self.min_images
    }

    fn max_image_count(&self) -> u32 {
        self.max_images
    }

    fn current_extent(&self) -> Option<Extent> {
        Some(self.extent)
    }

    fn recreate(&mut self, config: &mut SurfaceConfig) -> Result<u32, GpuError> {
        if self.fail_recreates > 0 {
            self.fail_recreates -= 1;
            return Err(GpuError::SurfaceLost);
        }
        if config.buffer_count < self.min_images {
            config.buffer_count = self.min_images;
        }
        if self.max_images != 0 && config.buffer_count > self.max_images {
            config.buffer_count = self.max_images;
        }
        self.extent = config.extent;
        self.image_count = config.buffer_count;
        self.next_image = 0;
        self.events.push(SurfaceEvent::Recreated {
            buffer_count: self.image_count,
            extent: self.extent,
        });
        Ok(self.image_count)
    }

    fn rebuild_surface(&mut self) -> Result<(), GpuError> {
        self.events.push(SurfaceEvent::SurfaceRebuilt);
        Ok(())
    }

    fn acquire(&mut self, _signal: Handle<Semaphore>) -> AcquireOutcome {
        let outcome = self.scripted_acquires.pop_front().unwrap_or_else(|| {
            let image = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count.max(1);
            AcquireOutcome::Success {
                image,
                suboptimal: false,
            }
        });
        if let AcquireOutcome::Success { image, .. } = outcome {
            self.events.push(SurfaceEvent::Acquired { image });
        }
        outcome
    }

    fn present(&mut self, image: u32, _wait: Handle<Semaphore>) -> PresentOutcome {
        let outcome = self
            .scripted_presents
            .pop_front()
            .unwrap_or(PresentOutcome::Success);
        if outcome == PresentOutcome::Success || outcome == PresentOutcome::Suboptimal {
            self.events.push(SurfaceEvent::Presented { image });
        }
        outcome
    }
}
