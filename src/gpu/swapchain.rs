//! Frame pacing and presentation. A ring of presentable images with
//! per-image synchronization primitives: acquisition semaphores rotate
//! with a ring index, while draw-complete semaphores are indexed by the
//! image index the presentation engine actually returned — the engine may
//! legitimately hand out the same index on consecutive acquisitions, and
//! ring-indexing would then wait on a semaphore that was never signalled.
//! A monotonically increasing frame-complete fence bounds the number of
//! frames in flight to the buffer count.

use log::{info, warn};
use raw_window_handle::RawWindowHandle;

use super::context::Context;
use super::driver::{
    AcquireOutcome, Driver, PresentOutcome, SurfaceConfig, SurfaceDriver, SurfaceTransform,
};
use super::error::GpuError;
use super::structs::{
    AspectMask, Extent, Fence, Format, Image, ImageInfo, ImageView, ImageViewInfo, RenderTarget,
    SampleCount, Semaphore,
};
use crate::utils::{Handle, PerFrame};

pub struct SwapchainInfo {
    pub extent: Extent,
    pub buffer_count: u32,
    pub format: Format,
    pub depth_format: Option<Format>,
    pub vsync: bool,
    pub transform: SurfaceTransform,
    /// OS window backing the surface, for drivers that need it. The
    /// reference backend presents off-screen and ignores it.
    pub window: Option<RawWindowHandle>,
}

impl Default for SwapchainInfo {
    fn default() -> Self {
        Self {
            extent: Extent::new(1280, 1024),
            buffer_count: 2,
            format: Format::BGRA8Unorm,
            depth_format: Some(Format::D24S8),
            vsync: true,
            transform: SurfaceTransform::Optimal,
            window: None,
        }
    }
}

pub struct Swapchain<S: SurfaceDriver> {
    surface: S,
    config: SurfaceConfig,
    depth_format: Option<Format>,
    window: Option<RawWindowHandle>,

    images: Vec<Handle<Image>>,
    views: Vec<ImageView>,
    depth_image: Option<Handle<Image>>,
    depth_view: Option<ImageView>,

    // Rotating ring of acquisition semaphores.
    acquire_sems: PerFrame<Handle<Semaphore>>,
    // Indexed by acquired image index, never by ring position.
    draw_done_sems: Vec<Handle<Semaphore>>,
    image_initialized: Vec<bool>,

    frame_fence: Handle<Fence>,
    frame_index: u64,
    image_index: u32,
    image_acquired: bool,
    minimized: bool,
}

impl<S: SurfaceDriver> Swapchain<S> {
    pub fn new<D: Driver>(
        ctx: &mut Context<D>,
        surface: S,
        info: &SwapchainInfo,
    ) -> Result<Self, GpuError> {
        let config = SurfaceConfig {
            extent: info.extent,
            buffer_count: info.buffer_count,
            format: info.format,
            vsync: info.vsync,
            transform: info.transform,
        };
        let mut sc = Self {
            surface,
            config,
            depth_format: info.depth_format,
            window: info.window,
            images: Vec::new(),
            views: Vec::new(),
            depth_image: None,
            depth_view: None,
            acquire_sems: PerFrame::from_frames(Vec::new()),
            draw_done_sems: Vec::new(),
            image_initialized: Vec::new(),
            frame_fence: Handle::default(),
            frame_index: 1,
            image_index: 0,
            image_acquired: false,
            minimized: false,
        };

        let requested = info.buffer_count;
        let count = sc.surface.recreate(&mut sc.config)?;
        if count != requested {
            info!("surface adjusted the requested buffer count from {requested} to {count}");
        }
        sc.config.buffer_count = count;
        sc.frame_fence = ctx.device_mut().make_fence("frame complete fence")?;
        sc.build_ring(ctx, count)?;
        ctx.set_surface_extent(sc.config.extent);

        // The image may be immediately out of date (e.g. mid-resize); the
        // first present recovers through the usual path.
        sc.acquire_next_image(ctx)?;
        Ok(sc)
    }

    pub fn buffer_count(&self) -> u32 {
        self.config.buffer_count
    }

    pub fn extent(&self) -> Extent {
        self.config.extent
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    pub fn is_acquired(&self) -> bool {
        self.image_acquired
    }

    pub fn is_minimized(&self) -> bool {
        self.minimized
    }

    pub fn window(&self) -> Option<RawWindowHandle> {
        self.window
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    /// View of the back buffer acquired most recently.
    pub fn current_back_buffer(&self) -> RenderTarget {
        RenderTarget::View(self.views[self.image_index as usize])
    }

    pub fn depth_buffer(&self) -> Option<RenderTarget> {
        self.depth_view.map(RenderTarget::View)
    }

    /// Wait until the frame `buffer_count` frames back has fully retired.
    /// Bounds frames in flight and guarantees the acquisition semaphore
    /// about to be reused is no longer in use.
    fn throttle<D: Driver>(&mut self, ctx: &mut Context<D>) -> Result<(), GpuError> {
        let buffer_count = self.config.buffer_count as u64;
        if self.frame_index > buffer_count {
            ctx.device_mut()
                .wait_for_fence(self.frame_fence, self.frame_index - buffer_count)?;
        }
        Ok(())
    }

    fn acquire_next_image<D: Driver>(
        &mut self,
        ctx: &mut Context<D>,
    ) -> Result<AcquireOutcome, GpuError> {
        self.throttle(ctx)?;

        let sem = *self.acquire_sems.curr();
        let outcome = self.surface.acquire(sem);
        match outcome {
            AcquireOutcome::Success { image, .. } => {
                self.image_index = image;
                self.image_acquired = true;
                // Waiting on the semaphore also unsignals it; the next
                // submission consumes it exactly once.
                ctx.add_wait_semaphore(sem)?;

                if !self.image_initialized[image as usize] {
                    // Fresh swapchain memory is undefined; clear it before
                    // anything can read it.
                    let back = RenderTarget::View(self.views[image as usize]);
                    let depth = self.depth_view.map(RenderTarget::View);
                    ctx.set_render_targets(&[back], depth)?;
                    ctx.clear_render_target(back, [0.0; 4])?;
                    self.image_initialized[image as usize] = true;
                    ctx.reset_render_targets();
                }
            }
            AcquireOutcome::OutOfDate | AcquireOutcome::SurfaceLost => {
                // Caller must skip presenting this frame.
                self.image_acquired = false;
            }
        }
        Ok(outcome)
    }

    /// Present the acquired image and acquire the next one. `sync_interval`
    /// zero disables vsync; a change funnels through swapchain recreation.
    pub fn present<D: Driver>(
        &mut self,
        ctx: &mut Context<D>,
        sync_interval: u32,
    ) -> Result<(), GpuError> {
        if sync_interval > 1 {
            warn!("only sync intervals 0 and 1 are supported; treating {sync_interval} as 1");
        }

        let draw_done = self.draw_done_sems[self.image_index as usize];
        if self.image_acquired && !self.minimized {
            ctx.prepare_present(self.images[self.image_index as usize])?;
            ctx.add_signal_semaphore(draw_done)?;
        }

        // Signalled even when presentation is skipped, so that frame
        // throttling accounting stays correct.
        ctx.enqueue_signal(self.frame_fence, self.frame_index)?;
        self.frame_index += 1;
        ctx.flush()?;

        if !self.minimized {
            let outcome = if self.image_acquired {
                self.surface.present(self.image_index, draw_done)
            } else {
                PresentOutcome::OutOfDate
            };
            match outcome {
                PresentOutcome::Success => {}
                PresentOutcome::Suboptimal | PresentOutcome::OutOfDate => {
                    self.recreate(ctx)?;
                    // Restart acquisition at ring slot 0 after the advance
                    // below.
                    self.reset_ring_index_for_reacquire();
                }
                PresentOutcome::SurfaceLost => {
                    self.recreate(ctx)?;
                    self.reset_ring_index_for_reacquire();
                }
            }
        }

        if !self.minimized {
            self.acquire_sems.advance_next_frame();

            let vsync_wanted = sync_interval != 0;
            let outcome = if self.config.vsync == vsync_wanted {
                self.acquire_next_image(ctx)?
            } else {
                AcquireOutcome::OutOfDate
            };
            let retry = match outcome {
                AcquireOutcome::Success { suboptimal, .. } => suboptimal,
                _ => true,
            };
            if retry {
                self.config.vsync = vsync_wanted;
                // The rebuilt ring restarts acquisition at slot 0.
                self.recreate(ctx)?;
                let second = self.acquire_next_image(ctx)?;
                if second == AcquireOutcome::SurfaceLost {
                    return Err(GpuError::SurfaceLost);
                }
                // The image may still be out of date while the window
                // keeps changing size; the next present retries.
            }
        } else {
            // Deferred resource release must not race ongoing GPU use.
            self.throttle(ctx)?;
        }
        Ok(())
    }

    fn reset_ring_index_for_reacquire(&mut self) {
        let len = self.acquire_sems.len();
        if len > 0 {
            self.acquire_sems.advance_to_frame(len - 1);
        }
    }

    /// Resize the presentable surface. Zero dimensions enter the minimized
    /// state, which suspends acquisition and presentation but keeps frame
    /// throttling running.
    pub fn resize<D: Driver>(
        &mut self,
        ctx: &mut Context<D>,
        width: u32,
        height: u32,
        transform: SurfaceTransform,
    ) -> Result<(), GpuError> {
        let minimized = width == 0 && height == 0;
        let new_extent = Extent::new(width.max(1), height.max(1));
        let changed = (!minimized && new_extent != self.config.extent)
            || transform != self.config.transform;

        if changed {
            self.config.extent = new_extent;
            self.config.transform = transform;
            self.recreate(ctx)?;
            // May be immediately out of date if the window keeps resizing.
            self.acquire_next_image(ctx)?;
        }
        self.minimized = minimized;
        Ok(())
    }

    /// Full teardown and rebuild of the image ring, reusing the surface's
    /// previous swapchain as a seed where the driver supports it. Recovers
    /// once from a lost surface; a second loss propagates.
    fn recreate<D: Driver>(&mut self, ctx: &mut Context<D>) -> Result<(), GpuError> {
        self.release_ring(ctx)?;

        let mut config = self.config.clone();
        let count = match self.surface.recreate(&mut config) {
            Ok(count) => count,
            Err(GpuError::SurfaceLost) => {
                self.surface.rebuild_surface()?;
                let mut retry_config = self.config.clone();
                let count = self
                    .surface
                    .recreate(&mut retry_config)
                    .map_err(|_| GpuError::SurfaceLost)?;
                config = retry_config;
                count
            }
            Err(err) => return Err(err),
        };
        config.buffer_count = count;
        self.config = config;

        self.build_ring(ctx, count)?;
        ctx.set_surface_extent(self.config.extent);
        info!(
            "recreated swapchain: {}x{}, {} images",
            self.config.extent.width, self.config.extent.height, count
        );
        Ok(())
    }

    fn release_ring<D: Driver>(&mut self, ctx: &mut Context<D>) -> Result<(), GpuError> {
        // Submit pending work and semaphores before the ring goes away.
        ctx.flush()?;

        let binds_backbuffer = {
            let state = ctx.render_state();
            let view_bound = |target: &RenderTarget| match target {
                RenderTarget::View(view) => {
                    self.views.contains(view) || self.depth_view.as_ref() == Some(view)
                }
                RenderTarget::Surface => false,
            };
            state.color_targets.iter().any(view_bound)
                || state.depth_target.as_ref().map(view_bound).unwrap_or(false)
        };
        if binds_backbuffer {
            ctx.reset_render_targets();
            info!(
                "swapchain targets were unbound from the context; rebind them after recreation"
            );
        }

        ctx.wait_for_idle();
        // Idling alone is not sufficient accounting; the last frame's
        // fence value must be observed as well.
        if self.frame_index > 1 {
            ctx.device_mut()
                .wait_for_fence(self.frame_fence, self.frame_index - 1)?;
        }

        let device = ctx.device_mut();
        for image in self.images.drain(..) {
            device.destroy_image(image);
        }
        self.views.clear();
        if let Some(depth) = self.depth_image.take() {
            device.destroy_image(depth);
        }
        self.depth_view = None;
        let old_acquire =
            std::mem::replace(&mut self.acquire_sems, PerFrame::from_frames(Vec::new()));
        for sem in old_acquire.frames() {
            device.destroy_semaphore(*sem);
        }
        for sem in self.draw_done_sems.drain(..) {
            device.destroy_semaphore(sem);
        }
        self.image_initialized.clear();
        self.image_acquired = false;
        Ok(())
    }

    fn build_ring<D: Driver>(&mut self, ctx: &mut Context<D>, count: u32) -> Result<(), GpuError> {
        let device = ctx.device_mut();
        let extent = self.config.extent;

        let mut acquire = Vec::with_capacity(count as usize);
        for i in 0..count {
            let image = device.make_image(&ImageInfo {
                debug_name: &format!("back buffer {i}"),
                dim: [extent.width, extent.height, 1],
                layers: 1,
                format: self.config.format,
                mip_levels: 1,
                samples: SampleCount::S1,
            })?;
            let view = device.make_image_view(&ImageViewInfo {
                img: image,
                aspect: AspectMask::Color,
                ..Default::default()
            })?;
            self.images.push(image);
            self.views.push(view);

            acquire.push(device.make_semaphore(&format!("image acquired semaphore {i}"))?);
            self.draw_done_sems
                .push(device.make_semaphore(&format!("draw complete semaphore {i}"))?);
        }
        self.acquire_sems = PerFrame::from_frames(acquire);

        if let Some(depth_format) = self.depth_format {
            let depth = device.make_image(&ImageInfo {
                debug_name: "swapchain depth buffer",
                dim: [extent.width, extent.height, 1],
                layers: 1,
                format: depth_format,
                mip_levels: 1,
                samples: SampleCount::S1,
            })?;
            let aspect = if depth_format.has_stencil() {
                AspectMask::DepthStencil
            } else {
                AspectMask::Depth
            };
            self.depth_view = Some(device.make_image_view(&ImageViewInfo {
                img: depth,
                aspect,
                ..Default::default()
            })?);
            self.depth_image = Some(depth);
        }

        self.image_initialized = vec![false; count as usize];
        self.image_index = 0;
        Ok(())
    }

    /// Tear the swapchain down, waiting for all of its frames to retire.
    pub fn destroy<D: Driver>(mut self, ctx: &mut Context<D>) -> Result<(), GpuError> {
        self.release_ring(ctx)?;
        ctx.device_mut().destroy_fence(self.frame_fence);
        Ok(())
    }
}
