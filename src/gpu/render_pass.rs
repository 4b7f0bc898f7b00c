//! Render passes as data: a static attachment list with load/store policy
//! and per-subpass references, plus the framebuffer that binds concrete
//! views to it. Backends without a native pass model get the pass behavior
//! synthesized on top of the state tracker (clears on first use, barriers
//! between subpasses, discard hints on last use, resolves).

use smallvec::SmallVec;

use super::caches::{AttachmentSetKey, ContextCaches};
use super::driver::Driver;
use super::error::GpuError;
use super::state::{uses_default_surface, BoundAttachments};
use super::structs::{
    Extent, Format, ImageView, LoadOp, RenderTarget, SampleCount, StoreOp, MAX_RENDER_TARGETS,
};
use crate::utils::Handle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentDesc {
    pub format: Format,
    pub samples: SampleCount,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
}

impl Default for AttachmentDesc {
    fn default() -> Self {
        Self {
            format: Format::RGBA8,
            samples: SampleCount::S1,
            load_op: LoadOp::DontCare,
            store_op: StoreOp::Store,
        }
    }
}

/// Attachment references of one subpass, as indices into the pass's
/// attachment list. `None` marks an unused slot.
#[derive(Debug, Clone, Default)]
pub struct SubpassInfo<'a> {
    pub colors: &'a [Option<u32>],
    pub depth: Option<u32>,
    pub resolves: &'a [Option<u32>],
}

pub struct RenderPassInfo<'a> {
    pub debug_name: &'a str,
    pub attachments: &'a [AttachmentDesc],
    pub subpasses: &'a [SubpassInfo<'a>],
}

impl<'a> Default for RenderPassInfo<'a> {
    fn default() -> Self {
        Self {
            debug_name: "",
            attachments: &[],
            subpasses: &[],
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubpassDesc {
    pub colors: SmallVec<[Option<u32>; MAX_RENDER_TARGETS]>,
    pub depth: Option<u32>,
    pub resolves: SmallVec<[Option<u32>; MAX_RENDER_TARGETS]>,
}

pub struct RenderPass {
    pub attachments: Vec<AttachmentDesc>,
    pub subpasses: Vec<SubpassDesc>,
    // Subpass index of the first and last reference of each attachment.
    first_last_use: Vec<Option<(u32, u32)>>,
    pub debug_name: String,
}

impl RenderPass {
    pub fn new(info: &RenderPassInfo) -> Result<Self, GpuError> {
        if info.subpasses.is_empty() {
            return Err(GpuError::InvalidRenderTargets(
                "a render pass needs at least one subpass",
            ));
        }

        let attachment_count = info.attachments.len() as u32;
        let mut first_last_use: Vec<Option<(u32, u32)>> = vec![None; info.attachments.len()];
        let mut note_use = |attachment: Option<u32>, subpass: u32| -> Result<(), GpuError> {
            let Some(index) = attachment else {
                return Ok(());
            };
            if index >= attachment_count {
                return Err(GpuError::InvalidRenderTargets(
                    "subpass references an attachment outside the pass",
                ));
            }
            let entry = &mut first_last_use[index as usize];
            *entry = match *entry {
                None => Some((subpass, subpass)),
                Some((first, _)) => Some((first, subpass)),
            };
            Ok(())
        };

        for (subpass_index, subpass) in info.subpasses.iter().enumerate() {
            let subpass_index = subpass_index as u32;
            for color in subpass.colors {
                note_use(*color, subpass_index)?;
            }
            note_use(subpass.depth, subpass_index)?;
            for resolve in subpass.resolves {
                note_use(*resolve, subpass_index)?;
            }
        }

        Ok(Self {
            attachments: info.attachments.to_vec(),
            subpasses: info
                .subpasses
                .iter()
                .map(|s| SubpassDesc {
                    colors: SmallVec::from_slice(s.colors),
                    depth: s.depth,
                    resolves: SmallVec::from_slice(s.resolves),
                })
                .collect(),
            first_last_use,
            debug_name: info.debug_name.to_string(),
        })
    }

    pub fn subpass_count(&self) -> u32 {
        self.subpasses.len() as u32
    }

    /// First and last subpass referencing the attachment, or `None` if it
    /// is never referenced.
    pub fn attachment_first_last_use(&self, attachment: u32) -> Option<(u32, u32)> {
        self.first_last_use
            .get(attachment as usize)
            .copied()
            .flatten()
    }
}

/// Driver-side composites backing one subpass of a framebuffer.
pub struct SubpassComposites {
    pub target: BoundAttachments,
    pub resolve: Option<BoundAttachments>,
}

pub struct Framebuffer {
    pub render_pass: Handle<RenderPass>,
    pub attachments: Vec<RenderTarget>,
    pub extent: Extent,
    pub(crate) subpasses: Vec<SubpassComposites>,
    pub debug_name: String,
}

pub struct FramebufferInfo<'a> {
    pub debug_name: &'a str,
    pub render_pass: Handle<RenderPass>,
    pub attachments: &'a [RenderTarget],
    pub extent: Extent,
}

impl<'a> Default for FramebufferInfo<'a> {
    fn default() -> Self {
        Self {
            debug_name: "",
            render_pass: Default::default(),
            attachments: &[],
            extent: Default::default(),
        }
    }
}

fn resolve_target(
    attachments: &[RenderTarget],
    reference: Option<u32>,
) -> Result<Option<RenderTarget>, GpuError> {
    match reference {
        None => Ok(None),
        Some(index) => attachments
            .get(index as usize)
            .copied()
            .map(Some)
            .ok_or(GpuError::InvalidRenderTargets(
                "framebuffer provides fewer attachments than the pass references",
            )),
    }
}

fn composite_for<D: Driver>(
    driver: &mut D,
    caches: &mut ContextCaches,
    colors: &[Option<RenderTarget>],
    depth: Option<&RenderTarget>,
    extent: Extent,
) -> Result<BoundAttachments, GpuError> {
    if uses_default_surface(colors, depth)? {
        return Ok(BoundAttachments::DefaultSurface);
    }

    let color_views: SmallVec<[Option<ImageView>; MAX_RENDER_TARGETS]> = colors
        .iter()
        .map(|c| match c {
            Some(RenderTarget::View(view)) => Some(*view),
            _ => None,
        })
        .collect();
    let depth_view = match depth {
        Some(RenderTarget::View(view)) => Some(*view),
        _ => None,
    };
    let key = AttachmentSetKey::Targets {
        colors: color_views,
        depth: depth_view,
        extent,
    };
    Ok(BoundAttachments::Composite(
        caches.attachment_set(driver, &key),
    ))
}

/// Build the per-subpass composite objects for a framebuffer, one cache
/// entry per subpass plus one per resolve set.
pub(crate) fn build_subpass_composites<D: Driver>(
    driver: &mut D,
    caches: &mut ContextCaches,
    render_pass: &RenderPass,
    attachments: &[RenderTarget],
    extent: Extent,
) -> Result<Vec<SubpassComposites>, GpuError> {
    let mut out = Vec::with_capacity(render_pass.subpasses.len());
    for subpass in &render_pass.subpasses {
        let mut colors: SmallVec<[Option<RenderTarget>; MAX_RENDER_TARGETS]> = SmallVec::new();
        for reference in &subpass.colors {
            colors.push(resolve_target(attachments, *reference)?);
        }
        let depth = resolve_target(attachments, subpass.depth)?;

        let target = composite_for(driver, caches, &colors, depth.as_ref(), extent)?;

        let resolve = if subpass.resolves.iter().any(|r| r.is_some()) {
            let mut resolve_colors: SmallVec<[Option<RenderTarget>; MAX_RENDER_TARGETS]> =
                SmallVec::new();
            for reference in &subpass.resolves {
                resolve_colors.push(resolve_target(attachments, *reference)?);
            }
            Some(composite_for(
                driver,
                caches,
                &resolve_colors,
                None,
                extent,
            )?)
        } else {
            None
        };

        out.push(SubpassComposites { target, resolve });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_last_use_spans_referencing_subpasses() {
        let attachments = [AttachmentDesc::default(); 3];
        let subpasses = [
            SubpassInfo {
                colors: &[Some(0), Some(1)],
                ..Default::default()
            },
            SubpassInfo {
                colors: &[Some(1)],
                depth: Some(2),
                ..Default::default()
            },
            SubpassInfo {
                colors: &[Some(1)],
                ..Default::default()
            },
        ];
        let rp = RenderPass::new(&RenderPassInfo {
            attachments: &attachments,
            subpasses: &subpasses,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(rp.attachment_first_last_use(0), Some((0, 0)));
        assert_eq!(rp.attachment_first_last_use(1), Some((0, 2)));
        assert_eq!(rp.attachment_first_last_use(2), Some((1, 1)));
    }

    #[test]
    fn out_of_range_reference_is_rejected() {
        let attachments = [AttachmentDesc::default()];
        let subpasses = [SubpassInfo {
            colors: &[Some(3)],
            ..Default::default()
        }];
        assert!(RenderPass::new(&RenderPassInfo {
            attachments: &attachments,
            subpasses: &subpasses,
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn empty_pass_is_rejected() {
        assert!(RenderPass::new(&RenderPassInfo::default()).is_err());
    }
}
