//! The logical command-recording context. Every `set_*` call mutates only
//! the desired half of the state snapshot in O(1); the driver sees nothing
//! until the next draw or dispatch, where the commit engine pushes the
//! minimal delta. The exceptions are pipeline-global toggles, which some
//! backends apply globally rather than per draw and are therefore pushed
//! when the pipeline is set.

use log::error;
use smallvec::SmallVec;

use super::barriers::HazardTracker;
use super::bindings::{BindingState, MAX_BIND_GROUPS};
use super::caches::{AttachmentSetKey, StreamKey, VertexBindingKey};
use super::device::Device;
use super::driver::types::{
    read_barriers, write_barriers, IndexType, PrimitiveMode, ResourceId, Topology, UsageBits,
};
use super::driver::{DiscardTarget, Driver, MultiDrawIndexedItem, MultiDrawItem};
use super::error::GpuError;
use super::render_pass::{Framebuffer, RenderPass};
use super::state::{
    uses_default_surface, BoundAttachments, ContextState, DirtyFlags, IndexBinding, VertexStream,
};
use super::structs::*;
use crate::utils::Handle;

/// Width of the driver-slot window reserved for each bind group: group N's
/// slot S binds at driver slot `N * SLOTS_PER_GROUP + S`.
pub const SLOTS_PER_GROUP: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawArgs {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

impl Default for DrawArgs {
    fn default() -> Self {
        Self {
            vertex_count: 0,
            instance_count: 1,
            first_vertex: 0,
            first_instance: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawIndexedArgs {
    pub index_count: u32,
    pub index_type: IndexType,
    pub first_index: u32,
    pub base_vertex: i32,
    pub instance_count: u32,
    pub first_instance: u32,
}

impl Default for DrawIndexedArgs {
    fn default() -> Self {
        Self {
            index_count: 0,
            index_type: IndexType::U32,
            first_index: 0,
            base_vertex: 0,
            instance_count: 1,
            first_instance: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MultiDrawIndexedEntry {
    pub index_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
}

pub struct BeginRenderPassInfo<'a> {
    pub render_pass: Handle<RenderPass>,
    pub framebuffer: Handle<Framebuffer>,
    pub clear_values: &'a [Option<ClearValue>],
}

struct ActivePass {
    render_pass: Handle<RenderPass>,
    framebuffer: Handle<Framebuffer>,
    subpass: u32,
    clear_values: Vec<Option<ClearValue>>,
}

pub struct Context<D: Driver> {
    device: Device<D>,
    state: ContextState,
    binds: BindingState,
    hazards: HazardTracker,
    active_pass: Option<ActivePass>,
    surface_extent: Extent,
}

impl<D: Driver> Context<D> {
    pub fn new(device: Device<D>) -> Self {
        Self {
            device,
            state: ContextState::default(),
            binds: BindingState::default(),
            hazards: HazardTracker::default(),
            active_pass: None,
            surface_extent: Extent::default(),
        }
    }

    pub fn device(&self) -> &Device<D> {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut Device<D> {
        &mut self.device
    }

    pub fn into_device(self) -> Device<D> {
        self.device
    }

    pub fn render_state(&self) -> &super::state::RenderState {
        &self.state.desired
    }

    pub fn is_in_render_pass(&self) -> bool {
        self.active_pass.is_some()
    }

    /// Size of the implicit default surface targets. Maintained by the
    /// swapchain across recreation.
    pub fn set_surface_extent(&mut self, extent: Extent) {
        self.surface_extent = extent;
    }

    fn deny_inside_pass(&self, what: &str) -> Result<(), GpuError> {
        if self.active_pass.is_some() {
            error!("{what} is not allowed inside an active render pass");
            debug_assert!(false, "{what} inside an active render pass");
            return Err(GpuError::InsideRenderPass);
        }
        Ok(())
    }

    // --- State setting --------------------------------------------------------

    pub fn set_pipeline(&mut self, pipeline: Handle<GraphicsPipeline>) -> Result<(), GpuError> {
        if self.state.desired.pipeline == Some(pipeline) {
            return Ok(());
        }
        let Device {
            driver,
            graphics_pipelines,
            ..
        } = &mut self.device;
        let desc = &graphics_pipelines
            .get_ref(pipeline)
            .ok_or(GpuError::StaleHandle("graphics pipeline"))?
            .desc;

        // Global-state toggles go out immediately.
        driver.apply_raster_state(&desc.raster);
        driver.apply_blend_state(&desc.blend, desc.blend.sample_mask);
        driver.apply_depth_stencil_state(&desc.depth_stencil, self.state.desired.stencil_ref);

        self.state.desired.pipeline = Some(pipeline);
        // Topology or attribute layout may have changed.
        self.state.invalidate_vertex_binding();
        self.state.draw_buffers_committed = false;
        Ok(())
    }

    pub fn set_compute_pipeline(
        &mut self,
        pipeline: Handle<ComputePipeline>,
    ) -> Result<(), GpuError> {
        if self.device.compute_pipelines.get_ref(pipeline).is_none() {
            return Err(GpuError::StaleHandle("compute pipeline"));
        }
        self.state.desired.compute_pipeline = Some(pipeline);
        Ok(())
    }

    pub fn set_render_targets(
        &mut self,
        colors: &[RenderTarget],
        depth: Option<RenderTarget>,
    ) -> Result<(), GpuError> {
        self.deny_inside_pass("SetRenderTargets")?;

        let limit = (self.device.caps().max_render_targets as usize).min(MAX_RENDER_TARGETS);
        let colors = if colors.len() > limit {
            error!(
                "{} render targets exceed the device limit of {limit}; extra targets are ignored",
                colors.len()
            );
            &colors[..limit]
        } else {
            colors
        };

        let slots: SmallVec<[Option<RenderTarget>; MAX_RENDER_TARGETS]> =
            colors.iter().copied().map(Some).collect();
        if let Err(err) = uses_default_surface(&slots, depth.as_ref()) {
            // Leave the previous valid binding untouched.
            error!("{err}");
            return Err(err);
        }

        if self.state.desired.color_targets.as_slice() == colors
            && self.state.desired.depth_target == depth
        {
            return Ok(());
        }

        self.state.desired.color_targets = SmallVec::from_slice(colors);
        self.state.desired.depth_target = depth;
        self.state.mark(DirtyFlags::ATTACHMENTS);
        self.state.invalidate_attachments();

        if let Some(extent) = self.bound_target_extent() {
            self.state.desired.fb_extent = extent;
            self.state.desired.viewports = SmallVec::from_slice(&[Viewport {
                area: FRect2D {
                    x: 0.0,
                    y: 0.0,
                    w: extent.width as f32,
                    h: extent.height as f32,
                },
                ..Default::default()
            }]);
            self.state.desired.scissors = SmallVec::from_slice(&[Rect2D {
                x: 0,
                y: 0,
                w: extent.width,
                h: extent.height,
            }]);
            self.state.mark(DirtyFlags::VIEWPORTS | DirtyFlags::SCISSORS);
        }
        Ok(())
    }

    pub fn reset_render_targets(&mut self) {
        self.state.desired.color_targets.clear();
        self.state.desired.depth_target = None;
        self.state.mark(DirtyFlags::ATTACHMENTS);
        self.state.invalidate_attachments();
    }

    fn bound_target_extent(&self) -> Option<Extent> {
        let first = self
            .state
            .desired
            .color_targets
            .first()
            .or(self.state.desired.depth_target.as_ref())?;
        match first {
            RenderTarget::Surface => Some(self.surface_extent),
            RenderTarget::View(view) => {
                let img = self.device.images.get_ref(view.img)?;
                Some(Extent::new(
                    (img.dim[0] >> view.mip_level).max(1),
                    (img.dim[1] >> view.mip_level).max(1),
                ))
            }
        }
    }

    pub fn set_vertex_buffers(&mut self, streams: &[VertexStream]) {
        let limit = (self.device.caps().max_vertex_streams as usize).min(MAX_VERTEX_STREAMS);
        let streams = if streams.len() > limit {
            error!(
                "{} vertex streams exceed the device limit of {limit}; extra streams are ignored",
                streams.len()
            );
            &streams[..limit]
        } else {
            streams
        };
        self.state.desired.vertex_streams = SmallVec::from_slice(streams);
        self.state.invalidate_vertex_binding();
    }

    pub fn set_index_buffer(&mut self, buffer: Handle<Buffer>, offset: u64) {
        self.state.desired.index_binding = Some(IndexBinding { buffer, offset });
        self.state.invalidate_vertex_binding();
    }

    pub fn set_viewports(&mut self, viewports: &[Viewport]) {
        let limit = (self.device.caps().max_viewports as usize).min(MAX_VIEWPORTS);
        let viewports = if viewports.len() > limit {
            error!(
                "{} viewports exceed the device limit of {limit}; extra viewports are ignored",
                viewports.len()
            );
            &viewports[..limit]
        } else {
            viewports
        };
        self.state.desired.viewports = SmallVec::from_slice(viewports);
        self.state.mark(DirtyFlags::VIEWPORTS);

        if self.active_pass.is_none() && !self.state.desired.has_targets() {
            // Rendering without attachments: the viewport defines the
            // framebuffer size. A size change needs a different sized
            // composite, so force re-consultation at the next draw.
            debug_assert!(
                viewports.len() == 1,
                "a single viewport is expected when rendering without attachments"
            );
            if let Some(vp) = viewports.first() {
                let extent = Extent::new(vp.area.w as u32, vp.area.h as u32);
                if self.state.desired.fb_extent != extent {
                    self.state.invalidate_attachments();
                }
                self.state.desired.fb_extent = extent;
            }
        }
    }

    pub fn set_scissors(&mut self, scissors: &[Rect2D]) {
        let limit = (self.device.caps().max_viewports as usize).min(MAX_VIEWPORTS);
        let scissors = if scissors.len() > limit {
            error!(
                "{} scissor rects exceed the device limit of {limit}; extra rects are ignored",
                scissors.len()
            );
            &scissors[..limit]
        } else {
            scissors
        };
        self.state.desired.scissors = SmallVec::from_slice(scissors);
        self.state.mark(DirtyFlags::SCISSORS);
    }

    pub fn set_stencil_ref(&mut self, reference: u32) {
        if self.state.desired.stencil_ref != reference {
            self.state.desired.stencil_ref = reference;
            self.state.mark(DirtyFlags::STENCIL_REF);
        }
    }

    pub fn set_blend_factors(&mut self, factors: [f32; 4]) {
        if self.state.desired.blend_factors != factors {
            self.state.desired.blend_factors = factors;
            self.state.mark(DirtyFlags::BLEND_FACTORS);
        }
    }

    pub fn set_bind_group(
        &mut self,
        index: usize,
        group: Handle<BindGroup>,
    ) -> Result<(), GpuError> {
        let limit = (self.device.caps().max_bind_groups as usize).min(MAX_BIND_GROUPS);
        if index >= limit {
            error!("bind group index {index} exceeds the device limit of {limit}; ignored");
            return Ok(());
        }
        let has_dynamic = self
            .device
            .bind_groups
            .get_ref(group)
            .ok_or(GpuError::StaleHandle("bind group"))?
            .has_dynamic_resources();
        self.binds.set_group(index, group, has_dynamic);
        Ok(())
    }

    /// Move the offsets of dynamic uniform buffers in an already-committed
    /// group. Only the moved offsets are rebound at the next draw.
    pub fn set_dynamic_offsets(
        &mut self,
        index: usize,
        offsets: &[(u32, u64)],
    ) -> Result<(), GpuError> {
        let Some(group_handle) = self.binds.group(index) else {
            error!("no bind group is committed at index {index}");
            return Err(GpuError::StaleHandle("bind group"));
        };
        let group = self
            .device
            .bind_groups
            .get_mut_ref(group_handle)
            .ok_or(GpuError::StaleHandle("bind group"))?;
        for (slot, new_offset) in offsets {
            let entry = group.bindings.iter_mut().find(|b| b.slot == *slot);
            match entry {
                Some(IndexedResource {
                    resource: ShaderResource::DynamicUniformBuffer { offset, .. },
                    ..
                }) => *offset = *new_offset,
                _ => {
                    error!("slot {slot} of bind group {index} holds no dynamic uniform buffer");
                }
            }
        }
        Ok(())
    }

    /// Forget everything the driver is believed to have — bound composites,
    /// committed state, binding sets. Used after external code touched the
    /// native context.
    pub fn invalidate_state(&mut self) -> Result<(), GpuError> {
        self.deny_inside_pass("InvalidateState")?;
        self.state.invalidate();
        self.binds.invalidate();
        Ok(())
    }

    // --- Commit engine --------------------------------------------------------

    fn commit_attachments(&mut self) -> Result<(), GpuError> {
        let rebind =
            self.state.take(DirtyFlags::ATTACHMENTS) || self.state.bound_attachments.is_none();
        if !rebind {
            return Ok(());
        }
        if !self.state.desired.has_targets() {
            self.state.committed.color_targets.clear();
            self.state.committed.depth_target = None;
            return Ok(());
        }

        let Device {
            driver,
            caches,
            images,
            ..
        } = &mut self.device;

        let slots: SmallVec<[Option<RenderTarget>; MAX_RENDER_TARGETS]> = self
            .state
            .desired
            .color_targets
            .iter()
            .copied()
            .map(Some)
            .collect();
        if uses_default_surface(&slots, self.state.desired.depth_target.as_ref())? {
            driver.bind_default_surface();
            self.state.bound_attachments = Some(BoundAttachments::DefaultSurface);
        } else {
            let colors: SmallVec<[Option<ImageView>; MAX_RENDER_TARGETS]> = self
                .state
                .desired
                .color_targets
                .iter()
                .map(|t| match t {
                    RenderTarget::View(view) => Some(*view),
                    RenderTarget::Surface => None,
                })
                .collect();
            let depth = match self.state.desired.depth_target {
                Some(RenderTarget::View(view)) => Some(view),
                _ => None,
            };
            let extent = colors
                .iter()
                .flatten()
                .chain(depth.iter())
                .next()
                .and_then(|view| {
                    let img = images.get_ref(view.img)?;
                    Some(Extent::new(
                        (img.dim[0] >> view.mip_level).max(1),
                        (img.dim[1] >> view.mip_level).max(1),
                    ))
                })
                .unwrap_or_default();

            let key = AttachmentSetKey::Targets {
                colors,
                depth,
                extent,
            };
            let ctx_key = driver.context_key();
            let obj = caches.context(ctx_key).attachment_set(driver, &key);
            driver.bind_attachment_set(obj);
            self.state.bound_attachments = Some(BoundAttachments::Composite(obj));
        }

        self.state.committed.color_targets = self.state.desired.color_targets.clone();
        self.state.committed.depth_target = self.state.desired.depth_target;
        self.state.draw_buffers_committed = false;
        Ok(())
    }

    fn commit_fixed_state(&mut self) {
        let Device { driver, .. } = &mut self.device;
        if self.state.take(DirtyFlags::VIEWPORTS) {
            driver.set_viewports(&self.state.desired.viewports);
            self.state.committed.viewports = self.state.desired.viewports.clone();
        }
        if self.state.take(DirtyFlags::SCISSORS) {
            driver.set_scissors(&self.state.desired.scissors);
            self.state.committed.scissors = self.state.desired.scissors.clone();
        }
        if self.state.take(DirtyFlags::STENCIL_REF) {
            driver.set_stencil_ref(self.state.desired.stencil_ref);
            self.state.committed.stencil_ref = self.state.desired.stencil_ref;
        }
        if self.state.take(DirtyFlags::BLEND_FACTORS) {
            driver.set_blend_factors(self.state.desired.blend_factors);
            self.state.committed.blend_factors = self.state.desired.blend_factors;
        }
    }

    /// Walk the stale/dynamic set vector: stale sets rebind every slot,
    /// dynamic-only sets rebind just the moved buffer offsets — most frames
    /// only move ring-buffered uniform data, so the cheap path dominates.
    fn commit_bind_groups(&mut self) {
        let mask = self.binds.commit_mask();
        if mask.is_empty() {
            return;
        }
        let Device {
            driver,
            bind_groups,
            ..
        } = &mut self.device;

        for index in mask.iter() {
            let Some(handle) = self.binds.group(index) else {
                continue;
            };
            let Some(group) = bind_groups.get_ref(handle) else {
                error!("bind group at index {index} no longer exists; skipping rebind");
                continue;
            };
            let full = self.binds.is_stale(index);
            debug_assert!(
                full || self.binds.is_dynamic(index),
                "a set in the commit mask must be stale or dynamic"
            );
            let base = index as u32 * SLOTS_PER_GROUP;

            for entry in group.bindings() {
                let slot = base + entry.slot;
                match entry.resource {
                    ShaderResource::UniformBuffer {
                        buffer,
                        offset,
                        size,
                    } => {
                        if full {
                            self.hazards.flush_for_read(
                                driver,
                                ResourceId::Buffer(buffer),
                                read_barriers(UsageBits::UNIFORM_READ),
                            );
                            driver.bind_uniform_buffer(slot, buffer, offset, size);
                        }
                    }
                    ShaderResource::DynamicUniformBuffer {
                        buffer,
                        offset,
                        size,
                    } => {
                        // Rebound on both paths: the offset is the part
                        // that moves.
                        self.hazards.flush_for_read(
                            driver,
                            ResourceId::Buffer(buffer),
                            read_barriers(UsageBits::UNIFORM_READ),
                        );
                        driver.bind_uniform_buffer(slot, buffer, offset, size);
                    }
                    ShaderResource::StorageBuffer {
                        buffer,
                        offset,
                        size,
                        access,
                    } => {
                        if full {
                            let reads = read_barriers(entry.resource.read_usage());
                            if !reads.is_empty() {
                                self.hazards.flush_for_read(
                                    driver,
                                    ResourceId::Buffer(buffer),
                                    reads,
                                );
                            }
                            driver.bind_storage_buffer(slot, buffer, offset, size);
                        }
                        if access.writes() {
                            self.hazards.note_write(
                                ResourceId::Buffer(buffer),
                                write_barriers(UsageBits::STORAGE_WRITE),
                            );
                        }
                    }
                    ShaderResource::SampledImage { view, sampler } => {
                        if full {
                            self.hazards.flush_for_read(
                                driver,
                                ResourceId::Image(view.img),
                                read_barriers(UsageBits::SAMPLED),
                            );
                            driver.bind_sampled_image(slot, view, sampler);
                        }
                    }
                    ShaderResource::StorageImage { view, access } => {
                        if full {
                            let reads = read_barriers(entry.resource.read_usage());
                            if !reads.is_empty() {
                                self.hazards.flush_for_read(
                                    driver,
                                    ResourceId::Image(view.img),
                                    reads,
                                );
                            }
                            driver.bind_storage_image(slot, view, access);
                        }
                        if access.writes() {
                            self.hazards.note_write(
                                ResourceId::Image(view.img),
                                write_barriers(UsageBits::UAV_WRITE),
                            );
                        }
                    }
                }
            }
        }
        self.binds.clear_stale();
    }

    fn resolve_vertex_binding(&mut self) -> Result<(), GpuError> {
        if self.state.bound_vertex_binding.is_some() {
            return Ok(());
        }
        let Device {
            driver,
            caches,
            graphics_pipelines,
            ..
        } = &mut self.device;
        let pipeline_handle = self.state.desired.pipeline.ok_or(GpuError::NoPipelineBound)?;
        let pipeline = graphics_pipelines
            .get_ref(pipeline_handle)
            .ok_or(GpuError::StaleHandle("graphics pipeline"))?;

        let key = if pipeline.desc.vertex_streams.is_empty()
            && self.state.desired.index_binding.is_none()
        {
            // No vertex input at all (e.g. the shader derives positions
            // from the vertex index); draws still need a valid binding.
            VertexBindingKey::empty()
        } else {
            let mut streams: SmallVec<[StreamKey; MAX_VERTEX_STREAMS]> = SmallVec::new();
            for (i, layout) in pipeline.desc.vertex_streams.iter().enumerate() {
                let Some(stream) = self.state.desired.vertex_streams.get(i) else {
                    error!(
                        "pipeline '{}' expects vertex stream {i} but none is bound",
                        pipeline.debug_name
                    );
                    debug_assert!(false, "missing vertex stream");
                    continue;
                };
                streams.push(StreamKey {
                    buffer: stream.buffer,
                    offset: stream.offset,
                    stride: layout.stride,
                });
            }
            VertexBindingKey {
                pipeline: Some(pipeline_handle),
                streams,
                index_buffer: self
                    .state
                    .desired
                    .index_binding
                    .map(|b| (b.buffer, b.offset)),
            }
        };

        for stream in &key.streams {
            self.hazards.flush_for_read(
                driver,
                ResourceId::Buffer(stream.buffer),
                read_barriers(UsageBits::VERTEX_READ),
            );
        }
        if let Some((index_buffer, _)) = key.index_buffer {
            self.hazards.flush_for_read(
                driver,
                ResourceId::Buffer(index_buffer),
                read_barriers(UsageBits::INDEX_READ),
            );
        }

        let ctx_key = driver.context_key();
        let obj = caches.context(ctx_key).vertex_binding(driver, &key);
        driver.bind_vertex_binding(obj);
        self.state.bound_vertex_binding = Some(obj);
        Ok(())
    }

    fn resolve_topology(&mut self) -> Result<Option<PrimitiveMode>, GpuError> {
        let pipeline_handle = self.state.desired.pipeline.ok_or(GpuError::NoPipelineBound)?;
        let pipeline = self
            .device
            .graphics_pipelines
            .get_ref(pipeline_handle)
            .ok_or(GpuError::StaleHandle("graphics pipeline"))?;
        let mode = match pipeline.desc.topology {
            Topology::PointList => PrimitiveMode::Points,
            Topology::LineList => PrimitiveMode::Lines,
            Topology::LineStrip => PrimitiveMode::LineStrip,
            Topology::TriangleList => PrimitiveMode::Triangles,
            Topology::TriangleStrip => PrimitiveMode::TriangleStrip,
            Topology::PatchList(control_points) => {
                if !self.device.caps().tessellation {
                    error!("patch topologies require tessellation support; draw is skipped");
                    return Ok(None);
                }
                self.device.driver.set_patch_control_points(control_points);
                PrimitiveMode::Patches
            }
        };
        Ok(Some(mode))
    }

    /// Run immediately before every draw: resolve attachment and vertex
    /// composites through the caches, commit the pending state delta and
    /// the stale/dynamic binding sets. Returns `None` when a capability
    /// gap turns the draw into a no-op.
    fn prepare_for_draw(&mut self) -> Result<Option<PrimitiveMode>, GpuError> {
        let pipeline_handle = self.state.desired.pipeline.ok_or_else(|| {
            error!("draw issued with no graphics pipeline bound");
            debug_assert!(false, "draw without a pipeline");
            GpuError::NoPipelineBound
        })?;

        if self.state.bound_attachments.is_none() && !self.state.desired.has_targets() {
            // Rendering without attachments: bind a sized composite.
            let extent = self.state.desired.fb_extent;
            if extent.is_zero() {
                error!("attachment-less rendering requires a viewport-defined framebuffer size");
                debug_assert!(false, "attachment-less draw without a framebuffer size");
                return Err(GpuError::InvalidRenderTargets(
                    "attachment-less rendering requires a viewport-defined size",
                ));
            }
            if !self.device.caps().attachmentless_rendering {
                error!("rendering without attachments is not supported; draw is skipped");
                return Ok(None);
            }
            let Device { driver, caches, .. } = &mut self.device;
            let key = AttachmentSetKey::Sized { extent, samples: 1 };
            let ctx_key = driver.context_key();
            let obj = caches.context(ctx_key).attachment_set(driver, &key);
            driver.bind_attachment_set(obj);
            self.state.bound_attachments = Some(BoundAttachments::Composite(obj));
        } else {
            self.commit_attachments()?;
        }

        // Color write masks are their own axis, committed lazily on the
        // first draw after a pipeline or attachment change.
        if !self.state.draw_buffers_committed {
            if !self.state.desired.color_targets.is_empty()
                && matches!(
                    self.state.bound_attachments,
                    Some(BoundAttachments::Composite(_))
                )
            {
                let Device {
                    driver,
                    graphics_pipelines,
                    ..
                } = &mut self.device;
                if let Some(pipeline) = graphics_pipelines.get_ref(pipeline_handle) {
                    debug_assert!(
                        pipeline.desc.color_target_count as usize
                            == self.state.desired.color_targets.len(),
                        "pipeline '{}' declares {} color targets but {} are bound",
                        pipeline.debug_name,
                        pipeline.desc.color_target_count,
                        self.state.desired.color_targets.len(),
                    );
                    driver.set_draw_buffers(
                        self.state.desired.color_targets.len() as u32,
                        pipeline.desc.rt_write_mask,
                    );
                }
            }
            self.state.draw_buffers_committed = true;
        }

        self.commit_fixed_state();

        if self.state.committed.pipeline != Some(pipeline_handle) {
            self.device.driver.bind_graphics_program(pipeline_handle);
            self.state.committed.pipeline = Some(pipeline_handle);
        }

        self.commit_bind_groups();
        self.resolve_vertex_binding()?;
        self.resolve_topology()
    }

    fn prepare_for_dispatch(&mut self) -> Result<bool, GpuError> {
        if !self.device.caps().compute {
            error!("compute is not supported by the active driver; dispatch is skipped");
            return Ok(false);
        }
        let pipeline_handle = self.state.desired.compute_pipeline.ok_or_else(|| {
            error!("dispatch issued with no compute pipeline bound");
            debug_assert!(false, "dispatch without a pipeline");
            GpuError::NoPipelineBound
        })?;
        if self.state.committed.compute_pipeline != Some(pipeline_handle) {
            self.device.driver.bind_compute_program(pipeline_handle);
            self.state.committed.compute_pipeline = Some(pipeline_handle);
        }
        self.commit_bind_groups();
        Ok(true)
    }

    /// Convert the written set of the command just issued into barriers
    /// pending on each resource, to be inserted before their next read.
    fn post_draw(&mut self) {
        self.hazards.commit_writes();
    }

    // --- Draws and dispatches -------------------------------------------------

    pub fn draw(&mut self, args: &DrawArgs) -> Result<(), GpuError> {
        let Some(mode) = self.prepare_for_draw()? else {
            return Ok(());
        };
        if args.vertex_count > 0 && args.instance_count > 0 {
            self.device.driver.draw(
                mode,
                args.vertex_count,
                args.instance_count,
                args.first_vertex,
                args.first_instance,
            );
        }
        self.post_draw();
        Ok(())
    }

    pub fn draw_indexed(&mut self, args: &DrawIndexedArgs) -> Result<(), GpuError> {
        let Some(mode) = self.prepare_for_draw()? else {
            return Ok(());
        };
        let index_binding = self.state.desired.index_binding.ok_or_else(|| {
            error!("indexed draw issued with no index buffer bound");
            debug_assert!(false, "indexed draw without an index buffer");
            GpuError::NoIndexBuffer
        })?;
        let first_index_offset =
            index_binding.offset + args.index_type.byte_size() * args.first_index as u64;
        if args.index_count > 0 && args.instance_count > 0 {
            self.device.driver.draw_indexed(
                mode,
                args.index_type,
                args.index_count,
                args.instance_count,
                first_index_offset,
                args.base_vertex,
                args.first_instance,
            );
        }
        self.post_draw();
        Ok(())
    }

    /// Issue a batch of draws in one call. Uses the native multi-draw op
    /// when the driver has one and degrades to a per-item loop otherwise.
    pub fn multi_draw(
        &mut self,
        draws: &[MultiDrawItem],
        instance_count: u32,
        first_instance: u32,
    ) -> Result<(), GpuError> {
        let Some(mode) = self.prepare_for_draw()? else {
            return Ok(());
        };
        if instance_count > 0 {
            let items: SmallVec<[MultiDrawItem; 16]> = draws
                .iter()
                .copied()
                .filter(|d| d.vertex_count > 0)
                .collect();
            let native = self.device.caps().native_multi_draw
                && instance_count == 1
                && first_instance == 0;
            if native {
                if !items.is_empty() {
                    self.device.driver.multi_draw(mode, &items);
                }
            } else {
                for item in &items {
                    self.device.driver.draw(
                        mode,
                        item.vertex_count,
                        instance_count,
                        item.first_vertex,
                        first_instance,
                    );
                }
            }
        }
        self.post_draw();
        Ok(())
    }

    pub fn multi_draw_indexed(
        &mut self,
        draws: &[MultiDrawIndexedEntry],
        index_type: IndexType,
        instance_count: u32,
        first_instance: u32,
    ) -> Result<(), GpuError> {
        let Some(mode) = self.prepare_for_draw()? else {
            return Ok(());
        };
        let index_binding = self.state.desired.index_binding.ok_or_else(|| {
            error!("indexed draw issued with no index buffer bound");
            debug_assert!(false, "indexed draw without an index buffer");
            GpuError::NoIndexBuffer
        })?;
        if instance_count > 0 {
            let items: SmallVec<[MultiDrawIndexedItem; 16]> = draws
                .iter()
                .filter(|d| d.index_count > 0)
                .map(|d| MultiDrawIndexedItem {
                    index_count: d.index_count,
                    first_index_offset: index_binding.offset
                        + index_type.byte_size() * d.first_index as u64,
                    base_vertex: d.base_vertex,
                })
                .collect();
            let native = self.device.caps().native_multi_draw
                && instance_count == 1
                && first_instance == 0;
            if native {
                if !items.is_empty() {
                    self.device
                        .driver
                        .multi_draw_indexed(mode, index_type, &items);
                }
            } else {
                for item in &items {
                    self.device.driver.draw_indexed(
                        mode,
                        index_type,
                        item.index_count,
                        instance_count,
                        item.first_index_offset,
                        item.base_vertex,
                        first_instance,
                    );
                }
            }
        }
        self.post_draw();
        Ok(())
    }

    pub fn draw_indirect(
        &mut self,
        args_buffer: Handle<Buffer>,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) -> Result<(), GpuError> {
        let Some(mode) = self.prepare_for_draw()? else {
            return Ok(());
        };
        self.bind_indirect_args(args_buffer)?;
        if draw_count > 1 && self.device.caps().native_multi_draw_indirect {
            self.device
                .driver
                .multi_draw_indirect(mode, offset, draw_count, stride);
        } else {
            for i in 0..draw_count as u64 {
                self.device
                    .driver
                    .draw_indirect(mode, offset + i * stride as u64);
            }
        }
        self.post_draw();
        Ok(())
    }

    pub fn draw_indexed_indirect(
        &mut self,
        args_buffer: Handle<Buffer>,
        index_type: IndexType,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) -> Result<(), GpuError> {
        let Some(mode) = self.prepare_for_draw()? else {
            return Ok(());
        };
        if self.state.desired.index_binding.is_none() {
            error!("indexed indirect draw issued with no index buffer bound");
            debug_assert!(false, "indexed draw without an index buffer");
            return Err(GpuError::NoIndexBuffer);
        }
        self.bind_indirect_args(args_buffer)?;
        if draw_count > 1 && self.device.caps().native_multi_draw_indirect {
            self.device
                .driver
                .multi_draw_indirect(mode, offset, draw_count, stride);
        } else {
            for i in 0..draw_count as u64 {
                self.device
                    .driver
                    .draw_indexed_indirect(mode, index_type, offset + i * stride as u64);
            }
        }
        self.post_draw();
        Ok(())
    }

    fn bind_indirect_args(&mut self, args_buffer: Handle<Buffer>) -> Result<(), GpuError> {
        if self.device.buffers.get_ref(args_buffer).is_none() {
            return Err(GpuError::StaleHandle("indirect argument buffer"));
        }
        let Device { driver, .. } = &mut self.device;
        // Indirect argument fetches read the buffer on the GPU front end;
        // writes to it must be visible first.
        self.hazards.flush_for_read(
            driver,
            ResourceId::Buffer(args_buffer),
            read_barriers(UsageBits::INDIRECT_READ),
        );
        driver.bind_indirect_buffer(args_buffer);
        Ok(())
    }

    pub fn dispatch(&mut self, groups: [u32; 3]) -> Result<(), GpuError> {
        if !self.prepare_for_dispatch()? {
            return Ok(());
        }
        if groups.iter().all(|g| *g > 0) {
            self.device.driver.dispatch(groups);
        }
        self.post_draw();
        Ok(())
    }

    pub fn dispatch_indirect(
        &mut self,
        args_buffer: Handle<Buffer>,
        offset: u64,
    ) -> Result<(), GpuError> {
        if !self.prepare_for_dispatch()? {
            return Ok(());
        }
        self.bind_indirect_args(args_buffer)?;
        self.device.driver.dispatch_indirect(offset);
        self.post_draw();
        Ok(())
    }

    // --- Clears ---------------------------------------------------------------

    /// Clear a currently bound color target, bypassing write masks and
    /// scissor. Clearing an unbound target is a logged no-op.
    pub fn clear_render_target(
        &mut self,
        target: RenderTarget,
        value: [f32; 4],
    ) -> Result<(), GpuError> {
        self.deny_inside_pass("ClearRenderTarget")?;
        let Some(index) = self
            .state
            .desired
            .color_targets
            .iter()
            .position(|t| *t == target)
        else {
            error!("render target must be bound to the context to be cleared");
            return Ok(());
        };
        self.commit_attachments()?;
        self.device.driver.clear_color(index as u32, value);
        Ok(())
    }

    /// Clear the currently bound depth-stencil target. Clearing an unbound
    /// target is a logged no-op.
    pub fn clear_depth_stencil(
        &mut self,
        target: RenderTarget,
        depth: Option<f32>,
        stencil: Option<u8>,
    ) -> Result<(), GpuError> {
        self.deny_inside_pass("ClearDepthStencil")?;
        if self.state.desired.depth_target != Some(target) {
            error!("depth-stencil target must be bound to the context to be cleared");
            return Ok(());
        }
        self.commit_attachments()?;
        self.device.driver.clear_depth_stencil(depth, stencil);
        Ok(())
    }

    // --- Render-pass emulation ------------------------------------------------

    pub fn begin_render_pass(&mut self, info: &BeginRenderPassInfo) -> Result<(), GpuError> {
        self.deny_inside_pass("BeginRenderPass")?;
        let render_pass = self
            .device
            .render_passes
            .get_ref(info.render_pass)
            .ok_or(GpuError::StaleHandle("render pass"))?;
        let framebuffer = self
            .device
            .framebuffers
            .get_ref(info.framebuffer)
            .ok_or(GpuError::StaleHandle("framebuffer"))?;
        if framebuffer.render_pass != info.render_pass {
            error!("framebuffer was built for a different render pass");
            return Err(GpuError::InvalidRenderTargets(
                "framebuffer does not belong to the render pass",
            ));
        }

        let mut clear_values = info.clear_values.to_vec();
        clear_values.resize(render_pass.attachments.len(), None);
        let extent = framebuffer.extent;

        // Subpasses own the attachment binding for the duration of the
        // pass; whatever was bound before must not leak into it.
        self.reset_render_targets();

        // The pass renders at framebuffer size.
        self.state.desired.viewports = SmallVec::from_slice(&[Viewport {
            area: FRect2D {
                x: 0.0,
                y: 0.0,
                w: extent.width as f32,
                h: extent.height as f32,
            },
            ..Default::default()
        }]);
        self.state.desired.scissors = SmallVec::from_slice(&[Rect2D {
            x: 0,
            y: 0,
            w: extent.width,
            h: extent.height,
        }]);
        self.state.mark(DirtyFlags::VIEWPORTS | DirtyFlags::SCISSORS);
        self.commit_fixed_state();

        self.active_pass = Some(ActivePass {
            render_pass: info.render_pass,
            framebuffer: info.framebuffer,
            subpass: 0,
            clear_values,
        });
        self.begin_subpass()
    }

    pub fn next_subpass(&mut self) -> Result<(), GpuError> {
        let Some(pass) = self.active_pass.as_ref() else {
            error!("NextSubpass called with no active render pass");
            return Err(GpuError::NoActiveRenderPass);
        };
        let subpass_count = self
            .device
            .render_passes
            .get_ref(pass.render_pass)
            .map(|rp| rp.subpass_count())
            .unwrap_or(0);
        if pass.subpass + 1 >= subpass_count {
            error!("NextSubpass called on the last subpass");
            debug_assert!(false, "subpass index out of range");
            return Err(GpuError::SubpassOutOfRange);
        }
        self.end_subpass()?;
        if let Some(pass) = self.active_pass.as_mut() {
            pass.subpass += 1;
        }
        self.begin_subpass()
    }

    pub fn end_render_pass(&mut self) -> Result<(), GpuError> {
        if self.active_pass.is_none() {
            error!("EndRenderPass called with no active render pass");
            return Err(GpuError::NoActiveRenderPass);
        }
        self.end_subpass()?;
        self.active_pass = None;
        self.state.invalidate_attachments();
        Ok(())
    }

    /// Bind the subpass's precomputed composite, make the previous
    /// subpass's attachment writes visible, and clear attachments whose
    /// first use this is.
    fn begin_subpass(&mut self) -> Result<(), GpuError> {
        let pass = self
            .active_pass
            .as_ref()
            .ok_or(GpuError::NoActiveRenderPass)?;
        let (rp_handle, fb_handle, subpass) = (pass.render_pass, pass.framebuffer, pass.subpass);

        let Device {
            driver,
            render_passes,
            framebuffers,
            ..
        } = &mut self.device;
        let render_pass = render_passes
            .get_ref(rp_handle)
            .ok_or(GpuError::StaleHandle("render pass"))?;
        let framebuffer = framebuffers
            .get_ref(fb_handle)
            .ok_or(GpuError::StaleHandle("framebuffer"))?;
        let subpass_desc = &render_pass.subpasses[subpass as usize];
        let composites = &framebuffer.subpasses[subpass as usize];

        match composites.target {
            BoundAttachments::DefaultSurface => driver.bind_default_surface(),
            BoundAttachments::Composite(obj) => driver.bind_attachment_set(obj),
        }
        self.state.bound_attachments = Some(composites.target);
        self.state.draw_buffers_committed = false;

        let needs_barriers = !driver.caps().native_subpass_sync;
        let clear_values = &self
            .active_pass
            .as_ref()
            .ok_or(GpuError::NoActiveRenderPass)?
            .clear_values;

        for (rt_index, reference) in subpass_desc.colors.iter().enumerate() {
            let Some(attachment_index) = reference else {
                continue;
            };
            let attachment_index = *attachment_index as usize;
            let Some(RenderTarget::View(view)) = framebuffer.attachments.get(attachment_index)
            else {
                continue;
            };
            if needs_barriers {
                self.hazards.flush_for_read(
                    driver,
                    ResourceId::Image(view.img),
                    read_barriers(UsageBits::RT_WRITE),
                );
            }
            let desc = &render_pass.attachments[attachment_index];
            let first_use = render_pass
                .attachment_first_last_use(attachment_index as u32)
                .map(|(first, _)| first);
            if first_use == Some(subpass) && desc.load_op == LoadOp::Clear {
                let value = match clear_values.get(attachment_index) {
                    Some(Some(ClearValue::Color(color))) => *color,
                    _ => [0.0; 4],
                };
                driver.clear_color(rt_index as u32, value);
            }
        }

        if let Some(attachment_index) = subpass_desc.depth {
            let attachment_index = attachment_index as usize;
            if let Some(RenderTarget::View(view)) = framebuffer.attachments.get(attachment_index) {
                if needs_barriers {
                    self.hazards.flush_for_read(
                        driver,
                        ResourceId::Image(view.img),
                        read_barriers(UsageBits::DEPTH_WRITE),
                    );
                }
                let desc = &render_pass.attachments[attachment_index];
                let first_use = render_pass
                    .attachment_first_last_use(attachment_index as u32)
                    .map(|(first, _)| first);
                if first_use == Some(subpass) && desc.load_op == LoadOp::Clear {
                    let (depth, stencil) = match clear_values.get(attachment_index) {
                        Some(Some(ClearValue::DepthStencil { depth, stencil })) => {
                            (*depth, *stencil)
                        }
                        _ => (1.0, 0),
                    };
                    let stencil = desc.format.has_stencil().then_some(stencil);
                    driver.clear_depth_stencil(Some(depth), stencil);
                }
            }
        }
        Ok(())
    }

    /// Resolve multisampled attachments while the source is still bound,
    /// emit discard hints for attachments leaving their last use, record
    /// the subpass's attachment writes, then drop the binding.
    fn end_subpass(&mut self) -> Result<(), GpuError> {
        let pass = self
            .active_pass
            .as_ref()
            .ok_or(GpuError::NoActiveRenderPass)?;
        let (rp_handle, fb_handle, subpass) = (pass.render_pass, pass.framebuffer, pass.subpass);

        let Device {
            driver,
            render_passes,
            framebuffers,
            ..
        } = &mut self.device;
        let render_pass = render_passes
            .get_ref(rp_handle)
            .ok_or(GpuError::StaleHandle("render pass"))?;
        let framebuffer = framebuffers
            .get_ref(fb_handle)
            .ok_or(GpuError::StaleHandle("framebuffer"))?;
        let subpass_desc = &render_pass.subpasses[subpass as usize];
        let composites = &framebuffer.subpasses[subpass as usize];

        // Discard hints are computed first, but emitted after the resolve:
        // the resolve still reads the attachment contents.
        let mut discards: SmallVec<[DiscardTarget; MAX_RENDER_TARGETS + 2]> = SmallVec::new();
        for (rt_index, reference) in subpass_desc.colors.iter().enumerate() {
            let Some(attachment_index) = reference else {
                continue;
            };
            let last_use = render_pass
                .attachment_first_last_use(*attachment_index)
                .map(|(_, last)| last);
            if last_use == Some(subpass)
                && render_pass.attachments[*attachment_index as usize].store_op == StoreOp::Discard
            {
                discards.push(DiscardTarget::Color(rt_index as u32));
            }
        }
        if let Some(attachment_index) = subpass_desc.depth {
            let desc = &render_pass.attachments[attachment_index as usize];
            let last_use = render_pass
                .attachment_first_last_use(attachment_index)
                .map(|(_, last)| last);
            if last_use == Some(subpass) && desc.store_op == StoreOp::Discard {
                discards.push(DiscardTarget::Depth);
                if desc.format.has_stencil() {
                    discards.push(DiscardTarget::Stencil);
                }
            }
        }

        if let Some(resolve) = &composites.resolve {
            let dst = match resolve {
                BoundAttachments::DefaultSurface => None,
                BoundAttachments::Composite(obj) => Some(*obj),
            };
            driver.resolve_attachments(dst, framebuffer.extent);
        }

        if !discards.is_empty() {
            driver.discard_attachments(&discards);
        }

        // Writes this subpass produced become pending hazards, consumed by
        // the next subpass (or any later read) through the usual path.
        for reference in subpass_desc.colors.iter().flatten() {
            if let Some(RenderTarget::View(view)) = framebuffer.attachments.get(*reference as usize)
            {
                self.hazards.note_write(
                    ResourceId::Image(view.img),
                    write_barriers(UsageBits::RT_WRITE),
                );
            }
        }
        if let Some(attachment_index) = subpass_desc.depth {
            if let Some(RenderTarget::View(view)) =
                framebuffer.attachments.get(attachment_index as usize)
            {
                self.hazards.note_write(
                    ResourceId::Image(view.img),
                    write_barriers(UsageBits::DEPTH_WRITE),
                );
            }
        }
        self.hazards.commit_writes();

        self.state.invalidate_attachments();
        Ok(())
    }

    // --- Submission-side operations -------------------------------------------

    /// Push all recorded work to the queue. Binding sets must be
    /// re-committed afterwards.
    pub fn flush(&mut self) -> Result<(), GpuError> {
        self.deny_inside_pass("Flush")?;
        self.device.driver.flush();
        self.binds.reset();
        Ok(())
    }

    /// Block until the device has finished all submitted work.
    pub fn wait_for_idle(&mut self) {
        self.device.driver.wait_idle();
    }

    pub fn enqueue_signal(&mut self, fence: Handle<Fence>, value: u64) -> Result<(), GpuError> {
        self.deny_inside_pass("EnqueueSignal")?;
        if self.device.fences.get_ref(fence).is_none() {
            return Err(GpuError::StaleHandle("fence"));
        }
        self.device.driver.enqueue_fence_signal(fence, value);
        Ok(())
    }

    pub fn device_wait_for_fence(
        &mut self,
        fence: Handle<Fence>,
        value: u64,
    ) -> Result<(), GpuError> {
        self.deny_inside_pass("DeviceWaitForFence")?;
        if self.device.fences.get_ref(fence).is_none() {
            return Err(GpuError::StaleHandle("fence"));
        }
        self.device.driver.device_wait_fence(fence, value);
        Ok(())
    }

    pub fn begin_query(&mut self, query: Handle<Query>) -> Result<(), GpuError> {
        let q = self
            .device
            .queries
            .get_mut_ref(query)
            .ok_or(GpuError::StaleHandle("query"))?;
        if q.active {
            error!("query '{}' is already active", q.debug_name);
            return Err(GpuError::StaleHandle("query"));
        }
        q.active = true;
        self.device.driver.begin_query(query);
        Ok(())
    }

    pub fn end_query(&mut self, query: Handle<Query>) -> Result<(), GpuError> {
        let q = self
            .device
            .queries
            .get_mut_ref(query)
            .ok_or(GpuError::StaleHandle("query"))?;
        if !q.active {
            error!("query '{}' is not active", q.debug_name);
            return Err(GpuError::StaleHandle("query"));
        }
        q.active = false;
        self.device.driver.end_query(query);
        Ok(())
    }

    /// The next submission waits on `semaphore` before executing.
    pub fn add_wait_semaphore(&mut self, semaphore: Handle<Semaphore>) -> Result<(), GpuError> {
        if self.device.semaphores.get_ref(semaphore).is_none() {
            return Err(GpuError::StaleHandle("semaphore"));
        }
        self.device.driver.wait_semaphore(semaphore);
        Ok(())
    }

    /// The next submission signals `semaphore` when it completes.
    pub fn add_signal_semaphore(&mut self, semaphore: Handle<Semaphore>) -> Result<(), GpuError> {
        if self.device.semaphores.get_ref(semaphore).is_none() {
            return Err(GpuError::StaleHandle("semaphore"));
        }
        self.device.driver.signal_semaphore(semaphore);
        Ok(())
    }

    /// Transition an image for presentation.
    pub fn prepare_present(&mut self, image: Handle<Image>) -> Result<(), GpuError> {
        if self.device.images.get_ref(image).is_none() {
            return Err(GpuError::StaleHandle("image"));
        }
        self.device.driver.prepare_present(image);
        Ok(())
    }
}
