//! Frame pacing and presentation: in-flight throttling, image-indexed
//! semaphores, recreation on stale surfaces, and minimized behavior.

mod common;

use common::*;
use kiln::utils::Handle;
use kiln::*;

fn setup(buffer_count: u32) -> (Context<RecordingDriver>, Swapchain<TestSurface>) {
    let mut ctx = test_context();
    let surface = TestSurface::new(Extent::new(64, 64));
    let swapchain = Swapchain::new(
        &mut ctx,
        surface,
        &SwapchainInfo {
            extent: Extent::new(64, 64),
            buffer_count,
            ..Default::default()
        },
    )
    .unwrap();
    (ctx, swapchain)
}

fn host_waits(ctx: &Context<RecordingDriver>) -> Vec<u64> {
    ctx.device()
        .driver()
        .ops()
        .iter()
        .filter_map(|op| match op {
            RecordedOp::HostWaitFence { value } => Some(*value),
            _ => None,
        })
        .collect()
}

fn signalled_semaphores(ctx: &Context<RecordingDriver>) -> Vec<Handle<Semaphore>> {
    ctx.device()
        .driver()
        .ops()
        .iter()
        .filter_map(|op| match op {
            RecordedOp::SignalSemaphore(sem) => Some(*sem),
            _ => None,
        })
        .collect()
}

fn recreations(swapchain: &Swapchain<TestSurface>) -> usize {
    swapchain
        .surface()
        .events
        .iter()
        .filter(|e| matches!(e, SurfaceEvent::Recreated { .. }))
        .count()
}

#[test]
fn throttling_bounds_frames_in_flight_to_the_buffer_count() {
    let (mut ctx, mut swapchain) = setup(3);
    assert_eq!(swapchain.buffer_count(), 3);

    for _ in 0..5 {
        swapchain.present(&mut ctx, 1).unwrap();
    }

    // Acquisitions 1..3 (construction plus the first two presents) run
    // unthrottled; from the fourth on, each waits for the frame that is
    // `buffer_count` frames behind — starting with frame 1.
    assert_eq!(host_waits(&ctx), vec![1, 2, 3]);
}

#[test]
fn draw_complete_semaphore_follows_the_acquired_image_index() {
    let (mut ctx, mut swapchain) = setup(2);

    // The presentation engine may hand out the same image index on
    // consecutive acquisitions; that is expected behavior.
    swapchain
        .surface_mut()
        .scripted_acquires
        .push_back(AcquireOutcome::Success {
            image: 1,
            suboptimal: false,
        });
    swapchain
        .surface_mut()
        .scripted_acquires
        .push_back(AcquireOutcome::Success {
            image: 1,
            suboptimal: false,
        });

    swapchain.present(&mut ctx, 1).unwrap(); // presents image 0, acquires 1
    swapchain.present(&mut ctx, 1).unwrap(); // presents image 1, acquires 1
    swapchain.present(&mut ctx, 1).unwrap(); // presents image 1 again

    let signals = signalled_semaphores(&ctx);
    assert_eq!(signals.len(), 3);
    // Ring-position indexing would rotate here; image indexing must not.
    assert_ne!(signals[0], signals[1]);
    assert_eq!(signals[1], signals[2]);

    let presented: Vec<u32> = swapchain
        .surface()
        .events
        .iter()
        .filter_map(|e| match e {
            SurfaceEvent::Presented { image } => Some(*image),
            _ => None,
        })
        .collect();
    assert_eq!(presented, vec![0, 1, 1]);
}

#[test]
fn stale_present_triggers_full_recreation() {
    let (mut ctx, mut swapchain) = setup(2);
    assert_eq!(recreations(&swapchain), 1);

    swapchain
        .surface_mut()
        .scripted_presents
        .push_back(PresentOutcome::OutOfDate);
    swapchain.present(&mut ctx, 1).unwrap();

    assert_eq!(recreations(&swapchain), 2);
    assert!(swapchain.is_acquired());

    // The rebuilt images are cleared defensively again on first use.
    let clears = op_count(&ctx, |op| matches!(op, RecordedOp::ClearColor { .. }));
    assert!(clears >= 2);
}

#[test]
fn fence_is_signalled_even_when_presentation_is_skipped() {
    let (mut ctx, mut swapchain) = setup(2);
    swapchain.resize(&mut ctx, 0, 0, SurfaceTransform::Optimal).unwrap();
    assert!(swapchain.is_minimized());

    clear_ops(&mut ctx);
    let presented_before = swapchain.surface().events.len();

    for _ in 0..3 {
        swapchain.present(&mut ctx, 1).unwrap();
    }

    // No presentation, no image transitions...
    assert_eq!(swapchain.surface().events.len(), presented_before);
    assert_eq!(
        op_count(&ctx, |op| matches!(op, RecordedOp::PreparePresent(_))),
        0
    );
    // ...but the frame fence keeps advancing and throttling keeps
    // waiting, so deferred release cannot race the GPU.
    assert_eq!(
        op_count(&ctx, |op| matches!(op, RecordedOp::EnqueueFenceSignal { .. })),
        3
    );
    assert!(!host_waits(&ctx).is_empty());
}

#[test]
fn resize_funnels_through_recreation_and_reacquires() {
    let (mut ctx, mut swapchain) = setup(2);
    clear_ops(&mut ctx);

    swapchain
        .resize(&mut ctx, 800, 600, SurfaceTransform::Optimal)
        .unwrap();

    assert_eq!(swapchain.extent(), Extent::new(800, 600));
    assert_eq!(recreations(&swapchain), 2);
    assert!(swapchain.is_acquired());
    let last_recreate = swapchain
        .surface()
        .events
        .iter()
        .rev()
        .find_map(|e| match e {
            SurfaceEvent::Recreated { extent, .. } => Some(*extent),
            _ => None,
        });
    assert_eq!(last_recreate, Some(Extent::new(800, 600)));
}

#[test]
fn lost_surface_is_rebuilt_once_then_propagates() {
    let (mut ctx, mut swapchain) = setup(2);
    swapchain.surface_mut().fail_recreates = 1;
    swapchain
        .surface_mut()
        .scripted_presents
        .push_back(PresentOutcome::OutOfDate);
    swapchain.present(&mut ctx, 1).unwrap();
    assert!(swapchain
        .surface()
        .events
        .iter()
        .any(|e| matches!(e, SurfaceEvent::SurfaceRebuilt)));

    let (mut ctx, mut swapchain) = setup(2);
    swapchain.surface_mut().fail_recreates = 2;
    swapchain
        .surface_mut()
        .scripted_presents
        .push_back(PresentOutcome::OutOfDate);
    assert!(matches!(
        swapchain.present(&mut ctx, 1),
        Err(GpuError::SurfaceLost)
    ));
}

#[test]
fn back_buffers_are_cleared_once_per_image() {
    let (mut ctx, mut swapchain) = setup(2);
    for _ in 0..4 {
        swapchain.present(&mut ctx, 1).unwrap();
    }
    // Two images, each defensively cleared exactly once.
    assert_eq!(
        op_count(&ctx, |op| matches!(op, RecordedOp::ClearColor { .. })),
        2
    );
}

#[test]
fn vsync_change_funnels_through_recreation() {
    let (mut ctx, mut swapchain) = setup(2);
    assert_eq!(recreations(&swapchain), 1);

    // The swapchain was built with vsync on; presenting with interval 0
    // requires a different present mode.
    swapchain.present(&mut ctx, 0).unwrap();
    assert_eq!(recreations(&swapchain), 2);

    // The new mode sticks; no further recreation.
    swapchain.present(&mut ctx, 0).unwrap();
    assert_eq!(recreations(&swapchain), 2);
}

#[test]
fn back_buffer_accessors_track_the_acquired_image() {
    let (mut ctx, mut swapchain) = setup(2);
    let first = swapchain.current_back_buffer();
    assert!(swapchain.depth_buffer().is_some());

    swapchain.present(&mut ctx, 1).unwrap();
    let second = swapchain.current_back_buffer();
    assert_ne!(first, second);
    assert_eq!(swapchain.image_index(), 1);
}
