// Not every test binary exercises every helper.
#![allow(dead_code)]

use kiln::utils::Handle;
use kiln::*;

pub fn test_context() -> Context<RecordingDriver> {
    test_context_with_caps(DriverCaps::default())
}

pub fn test_context_with_caps(caps: DriverCaps) -> Context<RecordingDriver> {
    let _ = env_logger::builder().is_test(true).try_init();
    Context::new(Device::new(RecordingDriver::with_caps(caps)))
}

pub fn color_view(ctx: &mut Context<RecordingDriver>, name: &str, size: u32) -> ImageView {
    let img = ctx
        .device_mut()
        .make_image(&ImageInfo {
            debug_name: name,
            dim: [size, size, 1],
            ..Default::default()
        })
        .unwrap();
    ctx.device_mut()
        .make_image_view(&ImageViewInfo {
            img,
            ..Default::default()
        })
        .unwrap()
}

/// Pipeline without vertex input; draws read nothing but the vertex index.
pub fn streamless_pipeline(
    ctx: &mut Context<RecordingDriver>,
    name: &str,
    color_targets: u32,
) -> Handle<GraphicsPipeline> {
    ctx.device_mut()
        .make_graphics_pipeline(&GraphicsPipelineInfo {
            debug_name: name,
            desc: GraphicsPipelineDesc {
                color_target_count: color_targets,
                color_formats: vec![Format::RGBA8; color_targets as usize],
                ..Default::default()
            },
        })
        .unwrap()
}

/// Pipeline consuming one vertex stream of 16-byte vertices.
pub fn streamed_pipeline(
    ctx: &mut Context<RecordingDriver>,
    name: &str,
    color_targets: u32,
) -> Handle<GraphicsPipeline> {
    ctx.device_mut()
        .make_graphics_pipeline(&GraphicsPipelineInfo {
            debug_name: name,
            desc: GraphicsPipelineDesc {
                color_target_count: color_targets,
                color_formats: vec![Format::RGBA8; color_targets as usize],
                vertex_streams: vec![VertexStreamLayout {
                    stride: 16,
                    rate: VertexRate::Vertex,
                    entries: vec![VertexEntry {
                        format: VertexFormat::Vec4,
                        location: 0,
                        offset: 0,
                    }],
                }],
                ..Default::default()
            },
        })
        .unwrap()
}

pub fn op_count(ctx: &Context<RecordingDriver>, pred: fn(&RecordedOp) -> bool) -> usize {
    ctx.device().driver().count_ops(pred)
}

pub fn op_position(ctx: &Context<RecordingDriver>, pred: fn(&RecordedOp) -> bool) -> Option<usize> {
    ctx.device().driver().ops().iter().position(pred)
}

pub fn clear_ops(ctx: &mut Context<RecordingDriver>) {
    ctx.device_mut().driver_mut().clear_ops();
}
