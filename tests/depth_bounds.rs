use merlin_render::renderer::depth_bounds::{ReadbackRing, DEPTH_BOUNDS_SLOTS};

// Simulates the frame loop's view of the readback ring: each frame issues a
// reduction into the current slot and harvests whatever an earlier frame's
// copy has finished mapping.

#[test]
fn constant_scene_depth_converges_within_the_ring_latency() {
    let mut ring = ReadbackRing::new(DEPTH_BOUNDS_SLOTS);
    let scene_min = 7.25f32;

    // Results only become visible once a slot has gone the full way around.
    let mut frames_until_bound = 0;
    for frame in 1..=DEPTH_BOUNDS_SLOTS + 1 {
        ring.advance();
        if frame > DEPTH_BOUNDS_SLOTS - 1 {
            ring.harvest(scene_min);
        }
        if ring.bound().is_some() && frames_until_bound == 0 {
            frames_until_bound = frame;
        }
    }

    assert!(frames_until_bound <= DEPTH_BOUNDS_SLOTS);
    assert_eq!(ring.bound(), Some(scene_min));
}

#[test]
fn bound_tracks_the_newest_harvested_value() {
    let mut ring = ReadbackRing::new(DEPTH_BOUNDS_SLOTS);
    ring.harvest(12.0);
    assert_eq!(ring.bound(), Some(12.0));

    // Camera pulled closer to geometry.
    ring.advance();
    ring.harvest(3.5);
    assert_eq!(ring.bound(), Some(3.5));

    // A frame whose copy is still in flight harvests nothing; the stale
    // value keeps serving until fresh data lands.
    ring.advance();
    assert_eq!(ring.bound(), Some(3.5));

    ring.advance();
    ring.harvest(9.0);
    assert_eq!(ring.bound(), Some(9.0));
}

#[test]
fn sentinel_and_non_finite_reductions_never_become_bounds() {
    let mut ring = ReadbackRing::new(DEPTH_BOUNDS_SLOTS);
    ring.harvest(f32::MAX);
    ring.harvest(f32::INFINITY);
    ring.harvest(f32::NAN);
    assert_eq!(ring.bound(), None);

    ring.harvest(4.0);
    ring.harvest(f32::MAX);
    assert_eq!(ring.bound(), Some(4.0));
}
