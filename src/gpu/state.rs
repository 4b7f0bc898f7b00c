//! The desired/committed state snapshot for one logical context. Set-calls
//! touch only the desired half and flip a dirty marker; the commit engine
//! pushes deltas to the driver at draw/dispatch points and mirrors them
//! into the committed half, which therefore always equals the last state
//! the driver actually saw.

use bitflags::bitflags;
use smallvec::SmallVec;

use super::driver::types::NativeObject;
use super::error::GpuError;
use super::structs::{
    Buffer, Extent, Rect2D, RenderTarget, Viewport, MAX_RENDER_TARGETS, MAX_VERTEX_STREAMS,
    MAX_VIEWPORTS,
};
use super::structs::{ComputePipeline, GraphicsPipeline};
use crate::utils::Handle;

bitflags! {
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DirtyFlags: u16 {
        const ATTACHMENTS   = 0x1;
        const VIEWPORTS     = 0x2;
        const SCISSORS      = 0x4;
        const STENCIL_REF   = 0x8;
        const BLEND_FACTORS = 0x10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundAttachments {
    DefaultSurface,
    Composite(NativeObject),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VertexStream {
    pub buffer: Handle<Buffer>,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBinding {
    pub buffer: Handle<Buffer>,
    pub offset: u64,
}

#[derive(Default, Clone)]
pub struct RenderState {
    pub pipeline: Option<Handle<GraphicsPipeline>>,
    pub compute_pipeline: Option<Handle<ComputePipeline>>,
    pub color_targets: SmallVec<[RenderTarget; MAX_RENDER_TARGETS]>,
    pub depth_target: Option<RenderTarget>,
    pub viewports: SmallVec<[Viewport; MAX_VIEWPORTS]>,
    pub scissors: SmallVec<[Rect2D; MAX_VIEWPORTS]>,
    pub vertex_streams: SmallVec<[VertexStream; MAX_VERTEX_STREAMS]>,
    pub index_binding: Option<IndexBinding>,
    pub stencil_ref: u32,
    pub blend_factors: [f32; 4],
    /// Framebuffer size used when rendering without attachments; driven by
    /// the viewport while no targets are bound.
    pub fb_extent: Extent,
}

impl RenderState {
    pub fn has_targets(&self) -> bool {
        !self.color_targets.is_empty() || self.depth_target.is_some()
    }
}

pub struct ContextState {
    pub desired: RenderState,
    pub committed: RenderState,
    dirty: DirtyFlags,
    /// Driver-side composite currently bound, if known. `None` forces
    /// re-consultation of the cache on the next commit even when the
    /// eventual result is unchanged.
    pub(crate) bound_vertex_binding: Option<NativeObject>,
    pub(crate) bound_attachments: Option<BoundAttachments>,
    pub(crate) draw_buffers_committed: bool,
}

impl Default for ContextState {
    fn default() -> Self {
        Self {
            desired: RenderState {
                blend_factors: [1.0; 4],
                ..Default::default()
            },
            committed: Default::default(),
            dirty: DirtyFlags::all(),
            bound_vertex_binding: None,
            bound_attachments: None,
            draw_buffers_committed: false,
        }
    }
}

impl ContextState {
    pub fn mark(&mut self, flags: DirtyFlags) {
        self.dirty |= flags;
    }

    pub fn is_dirty(&self, flags: DirtyFlags) -> bool {
        self.dirty.intersects(flags)
    }

    /// Consume a dirty marker; returns whether it was set.
    pub fn take(&mut self, flags: DirtyFlags) -> bool {
        let was = self.dirty.intersects(flags);
        self.dirty.remove(flags);
        was
    }

    pub fn invalidate_vertex_binding(&mut self) {
        self.bound_vertex_binding = None;
    }

    pub fn invalidate_attachments(&mut self) {
        self.bound_attachments = None;
        self.draw_buffers_committed = false;
    }

    /// Forget everything the driver is believed to have. Used on context
    /// loss or external interference with the native context.
    pub fn invalidate(&mut self) {
        self.desired = RenderState {
            blend_factors: [1.0; 4],
            ..Default::default()
        };
        self.committed = Default::default();
        self.dirty = DirtyFlags::all();
        self.bound_vertex_binding = None;
        self.bound_attachments = None;
        self.draw_buffers_committed = false;
    }
}

/// Decide whether a target combination binds the implicit default surface,
/// enforcing the pairing rule: the default color target can only be
/// combined with the default depth-stencil target and vice versa. Slots
/// holding `None` are unused.
pub(crate) fn uses_default_surface(
    colors: &[Option<RenderTarget>],
    depth: Option<&RenderTarget>,
) -> Result<bool, GpuError> {
    let mut use_default = false;
    let bound_colors = colors.iter().filter(|c| c.is_some()).count();
    for (index, target) in colors.iter().enumerate() {
        if matches!(target, Some(RenderTarget::Surface)) {
            if index == 0 && bound_colors == 1 {
                use_default = true;
            } else {
                return Err(GpuError::InvalidRenderTargets(
                    "the default surface color target must be the only color target",
                ));
            }
        }
    }

    if let Some(depth) = depth {
        match depth {
            RenderTarget::Surface => {
                if !use_default && bound_colors != 0 {
                    return Err(GpuError::InvalidRenderTargets(
                        "the default surface depth-stencil target can only be paired with the default surface color target",
                    ));
                }
                use_default = true;
            }
            RenderTarget::View(_) => {
                if use_default {
                    return Err(GpuError::InvalidRenderTargets(
                        "the default surface color target can only be paired with the default surface depth-stencil target",
                    ));
                }
            }
        }
    }

    Ok(use_default)
}
