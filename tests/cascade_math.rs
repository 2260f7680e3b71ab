use glam::{Mat4, Vec3, Vec4};
use merlin_render::camera3d::{Camera3D, CameraSnapshot};
use merlin_render::renderer::shadow_math::{
    build_cascades, cascade_boundaries, fit_light_projection, frustum_diagonal, light_view,
    world_from_ndc,
};
use winit::dpi::PhysicalSize;

const VIEWPORT: PhysicalSize<u32> = PhysicalSize::new(1280, 720);

fn snapshot(position: Vec3, target: Vec3) -> CameraSnapshot {
    Camera3D::new(position, target, 60f32.to_radians(), 0.1, 50.0).snapshot(VIEWPORT)
}

fn ndc_corners() -> [Vec3; 8] {
    let mut corners = [Vec3::ZERO; 8];
    let mut i = 0;
    for x in [-1.0, 1.0] {
        for y in [-1.0, 1.0] {
            for z in [-1.0, 1.0] {
                corners[i] = Vec3::new(x, y, z);
                i += 1;
            }
        }
    }
    corners
}

#[test]
fn frustum_diagonal_ignores_camera_orientation() {
    let looking_east = snapshot(Vec3::new(0.0, 0.0, 3.0), Vec3::new(10.0, 0.0, 3.0));
    let looking_down = snapshot(Vec3::new(-4.0, 7.0, 20.0), Vec3::new(-4.0, 7.0, 0.0));

    let d_east = frustum_diagonal(
        (looking_east.slice_projection(0.1, 50.0) * looking_east.view).inverse(),
    );
    let d_down = frustum_diagonal(
        (looking_down.slice_projection(0.1, 50.0) * looking_down.view).inverse(),
    );

    assert!(d_east > 0.0);
    assert!((d_east - d_down).abs() < d_east * 1e-4, "expected {d_east}, got {d_down}");
}

#[test]
fn diagonal_bounds_every_corner_pair() {
    let camera = snapshot(Vec3::new(2.0, -3.0, 1.5), Vec3::new(0.0, 5.0, 0.0));
    let inv_view_proj = (camera.slice_projection(0.5, 12.0) * camera.view).inverse();
    let diagonal = frustum_diagonal(inv_view_proj);

    let corners: Vec<Vec3> =
        ndc_corners().iter().map(|ndc| world_from_ndc(*ndc, inv_view_proj)).collect();
    for a in &corners {
        for b in &corners {
            let dist = a.distance(*b);
            assert!(dist <= diagonal * 1.0001, "corner pair {dist} exceeds diagonal {diagonal}");
        }
    }
}

#[test]
fn diagonal_covers_wide_fov_short_slices() {
    // A short, wide slice: the far-plane diagonal exceeds the cross
    // diagonal, so the far plane alone must still fit inside the result.
    let camera = Camera3D::new(Vec3::new(0.0, 0.0, 2.0), Vec3::new(8.0, 0.0, 2.0), 90f32.to_radians(), 0.1, 50.0)
        .snapshot(VIEWPORT);
    let inv_view_proj = (camera.slice_projection(10.0, 12.0) * camera.view).inverse();
    let diagonal = frustum_diagonal(inv_view_proj);

    let far_bottom_left = world_from_ndc(Vec3::new(-1.0, -1.0, 1.0), inv_view_proj);
    let far_top_right = world_from_ndc(Vec3::new(1.0, 1.0, 1.0), inv_view_proj);
    let near_bottom_left = world_from_ndc(Vec3::new(-1.0, -1.0, -1.0), inv_view_proj);
    let far_plane_diagonal = far_top_right.distance(far_bottom_left);
    assert!(far_plane_diagonal > far_top_right.distance(near_bottom_left));
    assert!(diagonal >= far_plane_diagonal);
}

#[test]
fn fitted_projection_contains_the_whole_sub_frustum() {
    let camera = snapshot(Vec3::new(1.0, 2.0, 4.0), Vec3::new(-6.0, 9.0, 0.0));
    let projection = camera.slice_projection(0.4, 9.0);
    let inv_view_proj = (projection * camera.view).inverse();

    let resolution = 1024.0f32;
    let diagonal = frustum_diagonal(inv_view_proj);
    let bounding_box_size = diagonal * (resolution + 1.0) / resolution;
    let texel_world_size = bounding_box_size / resolution;

    let view = light_view(Vec3::new(0.3, -0.5, -0.8).normalize());
    let light_view_proj =
        fit_light_projection(view, inv_view_proj, texel_world_size, bounding_box_size);

    for ndc in ndc_corners() {
        let world = world_from_ndc(ndc, inv_view_proj);
        let clip = light_view_proj * Vec4::new(world.x, world.y, world.z, 1.0);
        // Orthographic projection: w stays 1, no divide needed.
        assert!(clip.x >= -1.0001 && clip.x <= 1.0001, "x out of range: {}", clip.x);
        assert!(clip.y >= -1.0001 && clip.y <= 1.0001, "y out of range: {}", clip.y);
        assert!(clip.z >= -0.0001 && clip.z <= 1.0001, "z out of range: {}", clip.z);
    }
}

#[test]
fn build_cascades_produces_ordered_boundaries_and_zeroed_tail() {
    let camera = snapshot(Vec3::new(0.0, -8.0, 3.0), Vec3::ZERO);
    let set = build_cascades(&camera, Vec3::new(0.2, 0.3, -0.9).normalize(), 3, 1024, None)
        .expect("cascade build should succeed");

    assert_eq!(set.count, 3);
    assert_eq!(set.depth_boundaries[0], 0.0);
    assert!(set.depth_boundaries[1] > set.depth_boundaries[0]);
    assert!(set.depth_boundaries[2] > set.depth_boundaries[1]);
    assert!(set.depth_boundaries[2] < 1.0);
    assert!((set.effective_near - camera.near).abs() < f32::EPSILON);

    // Trailing slot stays at its default; the consumer never reads past count.
    assert_eq!(set.matrices[3], Mat4::IDENTITY);
    assert_eq!(set.sample_sizes[3], 0.0);
    assert_eq!(set.depth_boundaries[3], 0.0);

    for i in 0..3 {
        assert!(set.sample_sizes[i] > 0.0);
    }
    // Farther cascades cover more ground per texel.
    assert!(set.sample_sizes[1] > set.sample_sizes[0]);
    assert!(set.sample_sizes[2] > set.sample_sizes[1]);
}

fn covering_cascade(near: f32, far: f32, depth: f32) -> usize {
    let boundaries = cascade_boundaries(near, far, 4).expect("boundaries");
    boundaries
        .windows(2)
        .position(|pair| depth >= pair[0] && depth < pair[1])
        .expect("depth inside the partition")
}

#[test]
fn depth_bound_tightens_the_partition_near_plane() {
    let camera = snapshot(Vec3::new(0.0, -8.0, 3.0), Vec3::ZERO);
    let light = Vec3::new(0.2, 0.3, -0.9).normalize();

    let loose = build_cascades(&camera, light, 4, 2048, None).expect("loose build");
    let tight = build_cascades(&camera, light, 4, 2048, Some(5.0)).expect("tight build");

    assert!((tight.effective_near - 5.0).abs() < f32::EPSILON);
    // A fragment partway into the depth range lands in a nearer slice once
    // the partition stops spending cascades on empty foreground, and that
    // slice covers less ground per texel.
    let depth = 12.0;
    let loose_index = covering_cascade(camera.near, camera.far, depth);
    let tight_index = covering_cascade(5.0, camera.far, depth);
    assert!(tight_index < loose_index, "tight {tight_index} vs loose {loose_index}");
    assert!(tight.sample_sizes[tight_index] < loose.sample_sizes[loose_index]);

    // Out-of-range bounds are advisory only and must be ignored.
    let ignored = build_cascades(&camera, light, 4, 2048, Some(camera.far * 2.0)).expect("build");
    assert!((ignored.effective_near - camera.near).abs() < f32::EPSILON);
    let sentinel = build_cascades(&camera, light, 4, 2048, Some(f32::MAX)).expect("build");
    assert!((sentinel.effective_near - camera.near).abs() < f32::EPSILON);
}

#[test]
fn build_cascades_rejects_bad_counts_and_resolution() {
    let camera = snapshot(Vec3::new(0.0, -8.0, 3.0), Vec3::ZERO);
    let light = Vec3::NEG_Z;
    assert!(build_cascades(&camera, light, 0, 1024, None).is_err());
    assert!(build_cascades(&camera, light, 5, 1024, None).is_err());
    assert!(build_cascades(&camera, light, 4, 0, None).is_err());
}
