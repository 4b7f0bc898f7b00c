//! The device: owns the driver, the handle pools behind every resource
//! descriptor, and the per-native-context composite caches. Resource
//! constructors here are thin — they validate and store descriptors; the
//! actual GPU objects live with the driver and its collaborators.

use log::error;

use super::caches::DeviceCaches;
use super::driver::types::ContextKey;
use super::driver::{Driver, DriverCaps};
use super::error::GpuError;
use super::render_pass::{build_subpass_composites, Framebuffer, FramebufferInfo, RenderPass, RenderPassInfo};
use super::structs::*;
use crate::utils::{Handle, Pool};

pub struct Device<D: Driver> {
    pub(crate) driver: D,
    pub(crate) caches: DeviceCaches,
    pub(crate) images: Pool<Image>,
    pub(crate) buffers: Pool<Buffer>,
    pub(crate) samplers: Pool<Sampler>,
    pub(crate) fences: Pool<Fence>,
    pub(crate) semaphores: Pool<Semaphore>,
    pub(crate) queries: Pool<Query>,
    pub(crate) graphics_pipelines: Pool<GraphicsPipeline>,
    pub(crate) compute_pipelines: Pool<ComputePipeline>,
    pub(crate) bind_groups: Pool<BindGroup>,
    pub(crate) render_passes: Pool<RenderPass>,
    pub(crate) framebuffers: Pool<Framebuffer>,
}

impl<D: Driver> Device<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            caches: DeviceCaches::default(),
            images: Pool::default(),
            buffers: Pool::default(),
            samplers: Pool::default(),
            fences: Pool::default(),
            semaphores: Pool::default(),
            queries: Pool::default(),
            graphics_pipelines: Pool::default(),
            compute_pipelines: Pool::default(),
            bind_groups: Pool::default(),
            render_passes: Pool::default(),
            framebuffers: Pool::default(),
        }
    }

    pub fn caps(&self) -> &DriverCaps {
        self.driver.caps()
    }

    pub fn context_key(&self) -> ContextKey {
        self.driver.context_key()
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    // --- Constructors ---------------------------------------------------------

    pub fn make_image(&mut self, info: &ImageInfo) -> Result<Handle<Image>, GpuError> {
        self.images
            .insert(Image {
                dim: info.dim,
                layers: info.layers,
                mip_levels: info.mip_levels,
                format: info.format,
                samples: info.samples,
                debug_name: info.debug_name.to_string(),
            })
            .ok_or(GpuError::SlotExhausted("image"))
    }

    pub fn make_image_view(&self, info: &ImageViewInfo) -> Result<ImageView, GpuError> {
        let img = self
            .images
            .get_ref(info.img)
            .ok_or(GpuError::StaleHandle("image"))?;
        if info.mip_level >= img.mip_levels || info.layer >= img.layers {
            error!(
                "image view of '{}' references mip {} layer {} outside the image",
                img.debug_name, info.mip_level, info.layer
            );
            return Err(GpuError::StaleHandle("image subresource"));
        }
        Ok(ImageView {
            img: info.img,
            mip_level: info.mip_level,
            layer: info.layer,
            aspect: info.aspect,
        })
    }

    pub fn make_buffer(&mut self, info: &BufferInfo) -> Result<Handle<Buffer>, GpuError> {
        self.buffers
            .insert(Buffer {
                byte_size: info.byte_size,
                usage: info.usage,
                visibility: info.visibility,
                debug_name: info.debug_name.to_string(),
            })
            .ok_or(GpuError::SlotExhausted("buffer"))
    }

    pub fn make_sampler(&mut self, info: &SamplerInfo) -> Result<Handle<Sampler>, GpuError> {
        self.samplers
            .insert(Sampler {
                info: *info,
                debug_name: String::new(),
            })
            .ok_or(GpuError::SlotExhausted("sampler"))
    }

    pub fn make_fence(&mut self, debug_name: &str) -> Result<Handle<Fence>, GpuError> {
        self.fences
            .insert(Fence {
                debug_name: debug_name.to_string(),
            })
            .ok_or(GpuError::SlotExhausted("fence"))
    }

    pub fn make_semaphore(&mut self, debug_name: &str) -> Result<Handle<Semaphore>, GpuError> {
        self.semaphores
            .insert(Semaphore {
                debug_name: debug_name.to_string(),
            })
            .ok_or(GpuError::SlotExhausted("semaphore"))
    }

    pub fn make_query(&mut self, info: &QueryInfo) -> Result<Handle<Query>, GpuError> {
        self.queries
            .insert(Query {
                kind: info.kind,
                debug_name: info.debug_name.to_string(),
                active: false,
            })
            .ok_or(GpuError::SlotExhausted("query"))
    }

    pub fn make_graphics_pipeline(
        &mut self,
        info: &GraphicsPipelineInfo,
    ) -> Result<Handle<GraphicsPipeline>, GpuError> {
        let desc = &info.desc;
        if desc.color_target_count as usize != desc.color_formats.len() {
            error!(
                "pipeline '{}' declares {} color targets but {} formats",
                info.debug_name,
                desc.color_target_count,
                desc.color_formats.len()
            );
            return Err(GpuError::InvalidRenderTargets(
                "pipeline color format list does not match its target count",
            ));
        }
        self.graphics_pipelines
            .insert(GraphicsPipeline {
                desc: info.desc.clone(),
                debug_name: info.debug_name.to_string(),
            })
            .ok_or(GpuError::SlotExhausted("graphics pipeline"))
    }

    pub fn make_compute_pipeline(
        &mut self,
        info: &ComputePipelineInfo,
    ) -> Result<Handle<ComputePipeline>, GpuError> {
        self.compute_pipelines
            .insert(ComputePipeline {
                debug_name: info.debug_name.to_string(),
            })
            .ok_or(GpuError::SlotExhausted("compute pipeline"))
    }

    pub fn make_bind_group(&mut self, info: &BindGroupInfo) -> Result<Handle<BindGroup>, GpuError> {
        self.bind_groups
            .insert(BindGroup {
                bindings: info.bindings.to_vec(),
                debug_name: info.debug_name.to_string(),
            })
            .ok_or(GpuError::SlotExhausted("bind group"))
    }

    pub fn make_render_pass(
        &mut self,
        info: &RenderPassInfo,
    ) -> Result<Handle<RenderPass>, GpuError> {
        let pass = RenderPass::new(info)?;
        self.render_passes
            .insert(pass)
            .ok_or(GpuError::SlotExhausted("render pass"))
    }

    /// Binds concrete attachment views to a render pass, producing one
    /// cached composite per subpass (plus one per resolve set) up front.
    pub fn make_framebuffer(
        &mut self,
        info: &FramebufferInfo,
    ) -> Result<Handle<Framebuffer>, GpuError> {
        let key = self.driver.context_key();
        let render_pass = self
            .render_passes
            .get_ref(info.render_pass)
            .ok_or(GpuError::StaleHandle("render pass"))?;
        let subpasses = build_subpass_composites(
            &mut self.driver,
            self.caches.context(key),
            render_pass,
            info.attachments,
            info.extent,
        )?;
        self.framebuffers
            .insert(Framebuffer {
                render_pass: info.render_pass,
                attachments: info.attachments.to_vec(),
                extent: info.extent,
                subpasses,
                debug_name: info.debug_name.to_string(),
            })
            .ok_or(GpuError::SlotExhausted("framebuffer"))
    }

    // --- Accessors ------------------------------------------------------------

    pub fn image(&self, handle: Handle<Image>) -> Option<&Image> {
        self.images.get_ref(handle)
    }

    pub fn buffer(&self, handle: Handle<Buffer>) -> Option<&Buffer> {
        self.buffers.get_ref(handle)
    }

    pub fn bind_group(&self, handle: Handle<BindGroup>) -> Option<&BindGroup> {
        self.bind_groups.get_ref(handle)
    }

    pub fn graphics_pipeline(&self, handle: Handle<GraphicsPipeline>) -> Option<&GraphicsPipeline> {
        self.graphics_pipelines.get_ref(handle)
    }

    pub fn render_pass(&self, handle: Handle<RenderPass>) -> Option<&RenderPass> {
        self.render_passes.get_ref(handle)
    }

    pub fn framebuffer(&self, handle: Handle<Framebuffer>) -> Option<&Framebuffer> {
        self.framebuffers.get_ref(handle)
    }

    // --- Destruction ----------------------------------------------------------

    pub fn destroy_image(&mut self, handle: Handle<Image>) {
        self.images.release(handle);
    }

    pub fn destroy_buffer(&mut self, handle: Handle<Buffer>) {
        self.buffers.release(handle);
    }

    pub fn destroy_sampler(&mut self, handle: Handle<Sampler>) {
        self.samplers.release(handle);
    }

    pub fn destroy_fence(&mut self, handle: Handle<Fence>) {
        self.fences.release(handle);
    }

    pub fn destroy_semaphore(&mut self, handle: Handle<Semaphore>) {
        self.semaphores.release(handle);
    }

    pub fn destroy_query(&mut self, handle: Handle<Query>) {
        self.queries.release(handle);
    }

    pub fn destroy_bind_group(&mut self, handle: Handle<BindGroup>) {
        self.bind_groups.release(handle);
    }

    pub fn destroy_graphics_pipeline(&mut self, handle: Handle<GraphicsPipeline>) {
        self.graphics_pipelines.release(handle);
    }

    pub fn destroy_compute_pipeline(&mut self, handle: Handle<ComputePipeline>) {
        self.compute_pipelines.release(handle);
    }

    pub fn destroy_render_pass(&mut self, handle: Handle<RenderPass>) {
        self.render_passes.release(handle);
    }

    pub fn destroy_framebuffer(&mut self, handle: Handle<Framebuffer>) {
        self.framebuffers.release(handle);
    }

    // --- Synchronization ------------------------------------------------------

    /// Block the calling thread until `fence` reaches `value`.
    pub fn wait_for_fence(&mut self, fence: Handle<Fence>, value: u64) -> Result<(), GpuError> {
        if self.fences.get_ref(fence).is_none() {
            return Err(GpuError::StaleHandle("fence"));
        }
        self.driver.host_wait_fence(fence, value)
    }

    /// Drop every composite object created on the given native context.
    pub fn purge_context_caches(&mut self, key: ContextKey) {
        self.caches.purge(key);
    }
}
