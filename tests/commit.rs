//! Commit-engine behavior: minimal deltas, composite-cache hits, the
//! stale/dynamic binding paths, and deferred hazard barriers.

mod common;

use common::*;
use kiln::*;

#[test]
fn identical_targets_create_one_attachment_set() {
    let mut ctx = test_context();
    let a = color_view(&mut ctx, "a", 64);
    let b = color_view(&mut ctx, "b", 64);
    let pipeline = streamless_pipeline(&mut ctx, "two_targets", 2);

    ctx.set_pipeline(pipeline).unwrap();
    ctx.set_render_targets(&[RenderTarget::View(a), RenderTarget::View(b)], None)
        .unwrap();
    ctx.draw(&DrawArgs {
        vertex_count: 3,
        ..Default::default()
    })
    .unwrap();

    let creations = |ctx: &Context<RecordingDriver>| {
        op_count(ctx, |op| matches!(op, RecordedOp::CreateAttachmentSet(_)))
    };
    let binds = |ctx: &Context<RecordingDriver>| {
        op_count(ctx, |op| matches!(op, RecordedOp::BindAttachmentSet(_)))
    };
    assert_eq!(creations(&ctx), 1);
    assert_eq!(binds(&ctx), 1);

    // Identical targets: no new object, no redundant rebind.
    ctx.draw(&DrawArgs {
        vertex_count: 3,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(creations(&ctx), 1);
    assert_eq!(binds(&ctx), 1);

    // Re-setting the same combination is a no-op as well.
    ctx.set_render_targets(&[RenderTarget::View(a), RenderTarget::View(b)], None)
        .unwrap();
    ctx.draw(&DrawArgs {
        vertex_count: 3,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(creations(&ctx), 1);
    assert_eq!(binds(&ctx), 1);

    // A different ordering is a different structural identity.
    ctx.set_render_targets(&[RenderTarget::View(b), RenderTarget::View(a)], None)
        .unwrap();
    ctx.draw(&DrawArgs {
        vertex_count: 3,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(creations(&ctx), 2);
    assert_eq!(binds(&ctx), 2);
}

#[test]
fn pipeline_toggles_push_eagerly_and_program_binds_lazily() {
    let mut ctx = test_context();
    let a = color_view(&mut ctx, "a", 32);
    let pipeline = streamless_pipeline(&mut ctx, "p", 1);

    ctx.set_pipeline(pipeline).unwrap();
    assert_eq!(
        op_count(&ctx, |op| matches!(op, RecordedOp::ApplyRasterState)),
        1
    );
    assert_eq!(
        op_count(&ctx, |op| matches!(op, RecordedOp::ApplyBlendState)),
        1
    );
    assert_eq!(
        op_count(&ctx, |op| matches!(
            op,
            RecordedOp::ApplyDepthStencilState { .. }
        )),
        1
    );
    // No program bind until a commit point.
    assert_eq!(
        op_count(&ctx, |op| matches!(op, RecordedOp::BindGraphicsProgram(_))),
        0
    );

    // Redundant set is fully absorbed.
    ctx.set_pipeline(pipeline).unwrap();
    assert_eq!(
        op_count(&ctx, |op| matches!(op, RecordedOp::ApplyRasterState)),
        1
    );

    ctx.set_render_targets(&[RenderTarget::View(a)], None)
        .unwrap();
    ctx.draw(&DrawArgs {
        vertex_count: 3,
        ..Default::default()
    })
    .unwrap();
    ctx.draw(&DrawArgs {
        vertex_count: 3,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(
        op_count(&ctx, |op| matches!(op, RecordedOp::BindGraphicsProgram(_))),
        1
    );
}

#[test]
fn pipeline_change_invalidates_vertex_binding_but_not_the_cache() {
    let mut ctx = test_context();
    let a = color_view(&mut ctx, "a", 32);
    let p1 = streamed_pipeline(&mut ctx, "p1", 1);
    let p2 = streamed_pipeline(&mut ctx, "p2", 1);
    let vbo = ctx
        .device_mut()
        .make_buffer(&BufferInfo {
            debug_name: "vbo",
            usage: BufferUsage::Vertex,
            ..Default::default()
        })
        .unwrap();

    ctx.set_render_targets(&[RenderTarget::View(a)], None)
        .unwrap();
    ctx.set_vertex_buffers(&[VertexStream {
        buffer: vbo,
        offset: 0,
    }]);

    let creations = |ctx: &Context<RecordingDriver>| {
        op_count(ctx, |op| matches!(op, RecordedOp::CreateVertexBinding(_)))
    };

    ctx.set_pipeline(p1).unwrap();
    ctx.draw(&DrawArgs {
        vertex_count: 3,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(creations(&ctx), 1);

    // New pipeline, new layout identity.
    ctx.set_pipeline(p2).unwrap();
    ctx.draw(&DrawArgs {
        vertex_count: 3,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(creations(&ctx), 2);

    // Back to the first pipeline: the lookup reruns but hits the cache.
    ctx.set_pipeline(p1).unwrap();
    ctx.draw(&DrawArgs {
        vertex_count: 3,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(creations(&ctx), 2);
    assert_eq!(
        op_count(&ctx, |op| matches!(op, RecordedOp::BindVertexBinding(_))),
        3
    );
}

#[test]
fn dynamic_sets_rebind_only_moved_offsets() {
    let mut ctx = test_context();
    let a = color_view(&mut ctx, "a", 32);
    let tex = color_view(&mut ctx, "tex", 16);
    let pipeline = streamless_pipeline(&mut ctx, "p", 1);
    let sampler = ctx.device_mut().make_sampler(&Default::default()).unwrap();
    let ubo = ctx
        .device_mut()
        .make_buffer(&BufferInfo {
            debug_name: "ring",
            ..Default::default()
        })
        .unwrap();
    let group = ctx
        .device_mut()
        .make_bind_group(&BindGroupInfo {
            debug_name: "material",
            bindings: &[
                IndexedResource {
                    slot: 0,
                    resource: ShaderResource::DynamicUniformBuffer {
                        buffer: ubo,
                        offset: 0,
                        size: 256,
                    },
                },
                IndexedResource {
                    slot: 1,
                    resource: ShaderResource::SampledImage { view: tex, sampler },
                },
            ],
        })
        .unwrap();

    ctx.set_pipeline(pipeline).unwrap();
    ctx.set_render_targets(&[RenderTarget::View(a)], None)
        .unwrap();
    ctx.set_bind_group(0, group).unwrap();

    // First draw: the set is stale, every slot is rebound.
    ctx.draw(&DrawArgs {
        vertex_count: 3,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(
        op_count(&ctx, |op| matches!(op, RecordedOp::BindSampledImage { .. })),
        1
    );
    assert_eq!(
        op_count(&ctx, |op| matches!(op, RecordedOp::BindUniformBuffer { .. })),
        1
    );

    // Offset move: only the buffer is rebound, at the new offset.
    ctx.set_dynamic_offsets(0, &[(0, 256)]).unwrap();
    ctx.draw(&DrawArgs {
        vertex_count: 3,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(
        op_count(&ctx, |op| matches!(op, RecordedOp::BindSampledImage { .. })),
        1
    );
    let offsets: Vec<u64> = ctx
        .device()
        .driver()
        .ops()
        .iter()
        .filter_map(|op| match op {
            RecordedOp::BindUniformBuffer { offset, .. } => Some(*offset),
            _ => None,
        })
        .collect();
    assert_eq!(offsets, vec![0, 256]);
}

#[test]
fn write_barrier_is_deferred_until_the_next_read() {
    let mut ctx = test_context();
    let a = color_view(&mut ctx, "a", 32);
    let storage = color_view(&mut ctx, "storage", 16);
    let sampler = ctx.device_mut().make_sampler(&Default::default()).unwrap();
    let compute = ctx
        .device_mut()
        .make_compute_pipeline(&Default::default())
        .unwrap();
    let write_group = ctx
        .device_mut()
        .make_bind_group(&BindGroupInfo {
            debug_name: "writes",
            bindings: &[IndexedResource {
                slot: 0,
                resource: ShaderResource::StorageImage {
                    view: storage,
                    access: Access::Write,
                },
            }],
        })
        .unwrap();

    ctx.set_compute_pipeline(compute).unwrap();
    ctx.set_bind_group(0, write_group).unwrap();
    ctx.dispatch([8, 8, 1]).unwrap();

    // The write itself must not emit a barrier.
    assert_eq!(
        op_count(&ctx, |op| matches!(op, RecordedOp::MemoryBarrier(_))),
        0
    );

    let read_group = ctx
        .device_mut()
        .make_bind_group(&BindGroupInfo {
            debug_name: "reads",
            bindings: &[IndexedResource {
                slot: 0,
                resource: ShaderResource::SampledImage {
                    view: storage,
                    sampler,
                },
            }],
        })
        .unwrap();
    let pipeline = streamless_pipeline(&mut ctx, "p", 1);
    ctx.set_pipeline(pipeline).unwrap();
    ctx.set_render_targets(&[RenderTarget::View(a)], None)
        .unwrap();
    ctx.set_bind_group(0, read_group).unwrap();
    ctx.draw(&DrawArgs {
        vertex_count: 3,
        ..Default::default()
    })
    .unwrap();

    let barrier = op_position(&ctx, |op| {
        matches!(op, RecordedOp::MemoryBarrier(bits) if bits.contains(BarrierBits::TEXTURE_FETCH))
    });
    let read_bind = op_position(&ctx, |op| matches!(op, RecordedOp::BindSampledImage { .. }));
    assert!(barrier.is_some(), "a barrier must precede the read");
    assert!(barrier.unwrap() < read_bind.unwrap());

    // The barrier class is consumed; a second read stays silent.
    clear_ops(&mut ctx);
    ctx.set_bind_group(0, read_group).unwrap();
    ctx.draw(&DrawArgs {
        vertex_count: 3,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(
        op_count(&ctx, |op| matches!(op, RecordedOp::MemoryBarrier(_))),
        0
    );
}

#[test]
fn attachmentless_draws_use_a_sized_composite() {
    let mut ctx = test_context();
    let pipeline = streamless_pipeline(&mut ctx, "p", 1);
    ctx.set_pipeline(pipeline).unwrap();
    ctx.set_viewports(&[Viewport {
        area: FRect2D {
            x: 0.0,
            y: 0.0,
            w: 512.0,
            h: 512.0,
        },
        ..Default::default()
    }]);

    let creations = |ctx: &Context<RecordingDriver>| {
        op_count(ctx, |op| matches!(op, RecordedOp::CreateAttachmentSet(_)))
    };

    ctx.draw(&DrawArgs {
        vertex_count: 3,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(creations(&ctx), 1);

    // Same size: cached.
    ctx.draw(&DrawArgs {
        vertex_count: 3,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(creations(&ctx), 1);

    // The viewport defines the framebuffer size; a new size is a new
    // composite.
    ctx.set_viewports(&[Viewport {
        area: FRect2D {
            x: 0.0,
            y: 0.0,
            w: 256.0,
            h: 256.0,
        },
        ..Default::default()
    }]);
    ctx.draw(&DrawArgs {
        vertex_count: 3,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(creations(&ctx), 2);
}

#[test]
fn patch_topologies_route_control_points() {
    let mut ctx = test_context();
    let a = color_view(&mut ctx, "a", 32);
    let pipeline = ctx
        .device_mut()
        .make_graphics_pipeline(&GraphicsPipelineInfo {
            debug_name: "tess",
            desc: GraphicsPipelineDesc {
                topology: Topology::PatchList(4),
                ..Default::default()
            },
        })
        .unwrap();

    ctx.set_pipeline(pipeline).unwrap();
    ctx.set_render_targets(&[RenderTarget::View(a)], None)
        .unwrap();
    ctx.draw(&DrawArgs {
        vertex_count: 8,
        ..Default::default()
    })
    .unwrap();

    assert_eq!(
        op_count(&ctx, |op| matches!(
            op,
            RecordedOp::SetPatchControlPoints(4)
        )),
        1
    );
    assert_eq!(
        op_count(&ctx, |op| matches!(
            op,
            RecordedOp::Draw {
                mode: PrimitiveMode::Patches,
                ..
            }
        )),
        1
    );
}

#[test]
fn patch_topologies_without_tessellation_skip_the_draw() {
    let mut ctx = test_context_with_caps(DriverCaps {
        tessellation: false,
        ..Default::default()
    });
    let a = color_view(&mut ctx, "a", 32);
    let pipeline = ctx
        .device_mut()
        .make_graphics_pipeline(&GraphicsPipelineInfo {
            debug_name: "tess",
            desc: GraphicsPipelineDesc {
                topology: Topology::PatchList(3),
                ..Default::default()
            },
        })
        .unwrap();

    ctx.set_pipeline(pipeline).unwrap();
    ctx.set_render_targets(&[RenderTarget::View(a)], None)
        .unwrap();
    ctx.draw(&DrawArgs {
        vertex_count: 3,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(op_count(&ctx, |op| matches!(op, RecordedOp::Draw { .. })), 0);
}

#[test]
fn multi_draw_degrades_to_a_loop_without_native_support() {
    let items = [
        MultiDrawItem {
            vertex_count: 3,
            first_vertex: 0,
        },
        MultiDrawItem {
            vertex_count: 6,
            first_vertex: 3,
        },
        MultiDrawItem {
            vertex_count: 0,
            first_vertex: 9,
        },
    ];

    let mut emulated = test_context();
    let a = color_view(&mut emulated, "a", 32);
    let pipeline = streamless_pipeline(&mut emulated, "p", 1);
    emulated.set_pipeline(pipeline).unwrap();
    emulated
        .set_render_targets(&[RenderTarget::View(a)], None)
        .unwrap();
    emulated.multi_draw(&items, 1, 0).unwrap();
    // Zero-sized entries are dropped; the rest issue one draw each.
    assert_eq!(
        op_count(&emulated, |op| matches!(op, RecordedOp::Draw { .. })),
        2
    );
    assert_eq!(
        op_count(&emulated, |op| matches!(op, RecordedOp::MultiDraw { .. })),
        0
    );

    let mut native = test_context_with_caps(DriverCaps {
        native_multi_draw: true,
        ..Default::default()
    });
    let a = color_view(&mut native, "a", 32);
    let pipeline = streamless_pipeline(&mut native, "p", 1);
    native.set_pipeline(pipeline).unwrap();
    native
        .set_render_targets(&[RenderTarget::View(a)], None)
        .unwrap();
    native.multi_draw(&items, 1, 0).unwrap();
    assert_eq!(
        op_count(&native, |op| matches!(
            op,
            RecordedOp::MultiDraw { draw_count: 2 }
        )),
        1
    );
    assert_eq!(op_count(&native, |op| matches!(op, RecordedOp::Draw { .. })), 0);
}

#[test]
fn indirect_draws_loop_and_flush_argument_hazards() {
    let mut ctx = test_context();
    let a = color_view(&mut ctx, "a", 32);
    let pipeline = streamless_pipeline(&mut ctx, "p", 1);
    let compute = ctx
        .device_mut()
        .make_compute_pipeline(&Default::default())
        .unwrap();
    let args = ctx
        .device_mut()
        .make_buffer(&BufferInfo {
            debug_name: "args",
            usage: BufferUsage::Indirect,
            ..Default::default()
        })
        .unwrap();
    // A compute pass fills the argument buffer first.
    let fill_group = ctx
        .device_mut()
        .make_bind_group(&BindGroupInfo {
            debug_name: "fill",
            bindings: &[IndexedResource {
                slot: 0,
                resource: ShaderResource::StorageBuffer {
                    buffer: args,
                    offset: 0,
                    size: 64,
                    access: Access::Write,
                },
            }],
        })
        .unwrap();
    ctx.set_compute_pipeline(compute).unwrap();
    ctx.set_bind_group(0, fill_group).unwrap();
    ctx.dispatch([1, 1, 1]).unwrap();

    ctx.set_pipeline(pipeline).unwrap();
    ctx.set_render_targets(&[RenderTarget::View(a)], None)
        .unwrap();
    ctx.draw_indirect(args, 16, 3, 16).unwrap();

    let barrier = op_position(&ctx, |op| {
        matches!(op, RecordedOp::MemoryBarrier(bits) if bits.contains(BarrierBits::INDIRECT))
    });
    let bind = op_position(&ctx, |op| matches!(op, RecordedOp::BindIndirectBuffer(_)));
    assert!(barrier.unwrap() < bind.unwrap());

    let offsets: Vec<u64> = ctx
        .device()
        .driver()
        .ops()
        .iter()
        .filter_map(|op| match op {
            RecordedOp::DrawIndirect { offset } => Some(*offset),
            _ => None,
        })
        .collect();
    assert_eq!(offsets, vec![16, 32, 48]);
}

#[test]
fn rejected_target_combination_keeps_the_previous_binding() {
    let mut ctx = test_context();
    let a = color_view(&mut ctx, "a", 32);
    let d = color_view(&mut ctx, "d", 32);

    ctx.set_render_targets(&[RenderTarget::View(a)], Some(RenderTarget::View(d)))
        .unwrap();

    // The implicit default color target cannot pair with an explicit
    // depth-stencil target.
    let err = ctx.set_render_targets(&[RenderTarget::Surface], Some(RenderTarget::View(d)));
    assert!(matches!(err, Err(GpuError::InvalidRenderTargets(_))));

    let state = ctx.render_state();
    assert_eq!(state.color_targets.as_slice(), &[RenderTarget::View(a)]);
    assert_eq!(state.depth_target, Some(RenderTarget::View(d)));
}

#[test]
fn target_count_clamps_to_the_device_limit() {
    let mut ctx = test_context_with_caps(DriverCaps {
        max_render_targets: 2,
        ..Default::default()
    });
    let views: Vec<RenderTarget> = (0..4)
        .map(|i| RenderTarget::View(color_view(&mut ctx, &format!("t{i}"), 16)))
        .collect();
    ctx.set_render_targets(&views, None).unwrap();
    assert_eq!(ctx.render_state().color_targets.len(), 2);
}

#[test]
fn clearing_an_unbound_target_is_a_noop() {
    let mut ctx = test_context();
    let a = color_view(&mut ctx, "a", 32);
    ctx.clear_render_target(RenderTarget::View(a), [1.0, 0.0, 0.0, 1.0])
        .unwrap();
    assert_eq!(
        op_count(&ctx, |op| matches!(op, RecordedOp::ClearColor { .. })),
        0
    );

    ctx.set_render_targets(&[RenderTarget::View(a)], None)
        .unwrap();
    ctx.clear_render_target(RenderTarget::View(a), [1.0, 0.0, 0.0, 1.0])
        .unwrap();
    assert_eq!(
        op_count(&ctx, |op| matches!(op, RecordedOp::ClearColor { .. })),
        1
    );
}

#[test]
fn fixed_state_commits_only_when_changed() {
    let mut ctx = test_context();
    let a = color_view(&mut ctx, "a", 32);
    let pipeline = streamless_pipeline(&mut ctx, "p", 1);
    ctx.set_pipeline(pipeline).unwrap();
    ctx.set_render_targets(&[RenderTarget::View(a)], None)
        .unwrap();
    ctx.draw(&DrawArgs {
        vertex_count: 3,
        ..Default::default()
    })
    .unwrap();
    clear_ops(&mut ctx);

    ctx.set_stencil_ref(7);
    ctx.set_blend_factors([0.5, 0.5, 0.5, 1.0]);
    ctx.draw(&DrawArgs {
        vertex_count: 3,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(
        op_count(&ctx, |op| matches!(op, RecordedOp::SetStencilRef(7))),
        1
    );
    assert_eq!(
        op_count(&ctx, |op| matches!(op, RecordedOp::SetBlendFactors(_))),
        1
    );

    // Unchanged values stay uncommitted.
    ctx.set_stencil_ref(7);
    ctx.draw(&DrawArgs {
        vertex_count: 3,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(
        op_count(&ctx, |op| matches!(op, RecordedOp::SetStencilRef(_))),
        1
    );
}

#[test]
fn queries_must_be_paired() {
    let mut ctx = test_context();
    let query = ctx
        .device_mut()
        .make_query(&QueryInfo {
            debug_name: "occlusion",
            kind: QueryKind::Occlusion,
        })
        .unwrap();

    ctx.begin_query(query).unwrap();
    // Nesting the same query is rejected without side effects.
    assert!(ctx.begin_query(query).is_err());
    ctx.end_query(query).unwrap();
    assert!(ctx.end_query(query).is_err());

    assert_eq!(
        op_count(&ctx, |op| matches!(op, RecordedOp::BeginQuery(_))),
        1
    );
    assert_eq!(op_count(&ctx, |op| matches!(op, RecordedOp::EndQuery(_))), 1);
}

#[test]
fn fence_ops_forward_to_the_driver() {
    let mut ctx = test_context();
    let fence = ctx.device_mut().make_fence("frame fence").unwrap();

    ctx.enqueue_signal(fence, 5).unwrap();
    ctx.device_wait_for_fence(fence, 5).unwrap();
    ctx.flush().unwrap();
    ctx.device_mut().wait_for_fence(fence, 5).unwrap();

    // Waiting for a value that was never enqueued can only deadlock.
    assert!(matches!(
        ctx.device_mut().wait_for_fence(fence, 9),
        Err(GpuError::FenceNeverSignaled { .. })
    ));
}

#[test]
fn flush_drops_binding_commitment() {
    let mut ctx = test_context();
    let a = color_view(&mut ctx, "a", 32);
    let pipeline = streamless_pipeline(&mut ctx, "p", 1);
    let ubo = ctx
        .device_mut()
        .make_buffer(&BufferInfo::default())
        .unwrap();
    let group = ctx
        .device_mut()
        .make_bind_group(&BindGroupInfo {
            debug_name: "g",
            bindings: &[IndexedResource {
                slot: 0,
                resource: ShaderResource::UniformBuffer {
                    buffer: ubo,
                    offset: 0,
                    size: 64,
                },
            }],
        })
        .unwrap();

    ctx.set_pipeline(pipeline).unwrap();
    ctx.set_render_targets(&[RenderTarget::View(a)], None)
        .unwrap();
    ctx.set_bind_group(0, group).unwrap();
    ctx.draw(&DrawArgs {
        vertex_count: 3,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(
        op_count(&ctx, |op| matches!(op, RecordedOp::BindUniformBuffer { .. })),
        1
    );

    // A flush invalidates committed binding sets; nothing is rebound
    // until the application commits a group again.
    ctx.flush().unwrap();
    ctx.draw(&DrawArgs {
        vertex_count: 3,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(
        op_count(&ctx, |op| matches!(op, RecordedOp::BindUniformBuffer { .. })),
        1
    );

    ctx.set_bind_group(0, group).unwrap();
    ctx.draw(&DrawArgs {
        vertex_count: 3,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(
        op_count(&ctx, |op| matches!(op, RecordedOp::BindUniformBuffer { .. })),
        2
    );
}
