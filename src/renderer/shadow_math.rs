//! Cascade shadow math: frustum geometry, depth partitioning, light-space
//! fitting. Pure functions over glam types, exercised by `ShadowPass`.

use anyhow::{ensure, Result};
use glam::{Mat4, Vec3};

use super::MAX_SHADOW_CASCADES;
use crate::camera3d::CameraSnapshot;

/// World-up reference used to derive the light basis.
pub const WORLD_UP: Vec3 = Vec3::Z;

/// Transforms a normalized-device-space point back to world space.
pub fn world_from_ndc(ndc: Vec3, inv_view_proj: Mat4) -> Vec3 {
    let clip = inv_view_proj * ndc.extend(1.0);
    clip.truncate() / clip.w
}

/// Diameter of the bounding-sphere approximation of a frustum.
///
/// Returns the larger of the two candidate diagonals: near-bottom-left to
/// far-top-right (the full cross diagonal) and far-bottom-left to
/// far-top-right (the far-plane diagonal). One of the two is always the
/// maximum distance between any pair of frustum corners, so a box of this
/// size contains the whole frustum. A degenerate projection (near == far)
/// yields a value near zero; callers must reject it.
pub fn frustum_diagonal(inv_view_proj: Mat4) -> f32 {
    let near_bottom_left = world_from_ndc(Vec3::new(-1.0, -1.0, -1.0), inv_view_proj);
    let far_bottom_left = world_from_ndc(Vec3::new(-1.0, -1.0, 1.0), inv_view_proj);
    let far_top_right = world_from_ndc(Vec3::new(1.0, 1.0, 1.0), inv_view_proj);
    far_top_right.distance(near_bottom_left).max(far_top_right.distance(far_bottom_left))
}

/// Splits [near, far] into `count` sub-ranges on a geometric progression.
///
/// Returns `count + 1` boundaries with `boundaries[0] == near` and the last
/// entry assigned the literal `far` so float drift in the power series can
/// never leave the range short.
pub fn cascade_boundaries(near: f32, far: f32, count: usize) -> Result<Vec<f32>> {
    ensure!(count >= 1, "cascade count must be at least 1, got {count}");
    ensure!(
        near > 0.0 && near < far,
        "invalid cascade depth range [{near}, {far}]: need 0 < near < far"
    );
    let ratio = far / near;
    let mut boundaries = Vec::with_capacity(count + 1);
    for i in 0..count {
        boundaries.push(near * ratio.powf(i as f32 / count as f32));
    }
    boundaries.push(far);
    Ok(boundaries)
}

/// Light-space up vector: the world-up reference re-orthogonalized against
/// the light direction. Falls back to an arbitrary perpendicular axis when
/// the light shines straight along world-up.
pub fn light_up(direction: Vec3) -> Vec3 {
    let dir = direction.normalize();
    let rejected = WORLD_UP - dir * WORLD_UP.dot(dir);
    if rejected.length_squared() > 1e-6 {
        rejected.normalize()
    } else {
        dir.cross(Vec3::Y).normalize()
    }
}

/// View matrix of the directional light: a look-at with no translation,
/// since the light sits at infinity.
pub fn light_view(direction: Vec3) -> Mat4 {
    let dir = direction.normalize();
    Mat4::look_at_rh(Vec3::ZERO, dir, light_up(dir))
}

/// Snaps `value` down to the nearest multiple of `step`. Idempotent.
pub fn snap_down(value: f32, step: f32) -> f32 {
    (value / step).floor() * step
}

// Light space as produced by `light_view` is right-handed: depth along the
// light runs toward -z. Flipping z makes "distance from light" grow
// positively, which is the space the orthographic box is measured in.
const FLIP_Z: Mat4 = Mat4::from_cols(
    glam::Vec4::new(1.0, 0.0, 0.0, 0.0),
    glam::Vec4::new(0.0, 1.0, 0.0, 0.0),
    glam::Vec4::new(0.0, 0.0, -1.0, 0.0),
    glam::Vec4::new(0.0, 0.0, 0.0, 1.0),
);

/// Fits a tight orthographic projection around a sub-frustum in light space.
///
/// The 8 NDC corners of the sub-frustum are taken to world space through
/// `inv_view_proj`, then into z-flipped light space. The XY minimum of their
/// bounding box is snapped down to the texel grid so the shadow frustum's
/// origin only ever moves in whole-texel steps (removes edge swimming), and
/// the XY maximum is placed `bounding_box_size` above the snapped minimum so
/// the footprint stays constant per cascade. Depth bounds stay exact, so
/// they can shrink independently of the XY footprint.
pub fn fit_light_projection(
    light_view: Mat4,
    inv_view_proj: Mat4,
    texel_world_size: f32,
    bounding_box_size: f32,
) -> Mat4 {
    let to_light = FLIP_Z * light_view;
    let mut min = Vec3::splat(f32::MAX);
    let mut max = Vec3::splat(f32::MIN);
    for &x in &[-1.0, 1.0] {
        for &y in &[-1.0, 1.0] {
            for &z in &[-1.0, 1.0] {
                let world = world_from_ndc(Vec3::new(x, y, z), inv_view_proj);
                let light_space = to_light.transform_point3(world);
                min = min.min(light_space);
                max = max.max(light_space);
            }
        }
    }

    let min_x = snap_down(min.x, texel_world_size);
    let min_y = snap_down(min.y, texel_world_size);
    let max_x = min_x + bounding_box_size;
    let max_y = min_y + bounding_box_size;

    // The box is measured in z-flipped light space, where depth grows with
    // +z, so a left-handed orthographic maps [min.z, max.z] onto [0, 1].
    let projection = Mat4::orthographic_lh(min_x, max_x, min_y, max_y, min.z, max.z);
    projection * to_light
}

/// Per-frame output of the cascade builder, consumed by the shadow pass and
/// the lit pass. Slots past `count` stay at their zero/identity defaults and
/// must not be read.
#[derive(Debug, Clone, Copy)]
pub struct CascadeSet {
    pub matrices: [Mat4; MAX_SHADOW_CASCADES],
    pub sample_sizes: [f32; MAX_SHADOW_CASCADES],
    pub depth_boundaries: [f32; MAX_SHADOW_CASCADES],
    /// Near plane the partition actually used, after any depth-bound
    /// tightening. The lighting shader normalizes against this value.
    pub effective_near: f32,
    pub count: usize,
}

impl Default for CascadeSet {
    fn default() -> Self {
        Self {
            matrices: [Mat4::IDENTITY; MAX_SHADOW_CASCADES],
            sample_sizes: [0.0; MAX_SHADOW_CASCADES],
            depth_boundaries: [0.0; MAX_SHADOW_CASCADES],
            effective_near: 0.0,
            count: 0,
        }
    }
}

/// Builds every cascade's light-space transform and the per-cascade scalars
/// the lighting shader needs.
///
/// `min_depth_bound` is the advisory minimum scene depth produced by the
/// depth-bounds pipeline a few frames ago; when it lands inside (near, far)
/// it tightens the partition's near plane.
pub fn build_cascades(
    camera: &CameraSnapshot,
    light_direction: Vec3,
    count: usize,
    resolution: u32,
    min_depth_bound: Option<f32>,
) -> Result<CascadeSet> {
    ensure!(
        count >= 1 && count <= MAX_SHADOW_CASCADES,
        "cascade count must be in [1, {MAX_SHADOW_CASCADES}], got {count}"
    );
    ensure!(resolution >= 1, "shadow resolution must be positive");

    let mut near = camera.near;
    if let Some(bound) = min_depth_bound {
        if bound.is_finite() && bound > near && bound < camera.far {
            near = bound;
        }
    }
    let far = camera.far;

    let boundaries = cascade_boundaries(near, far, count)?;
    let view = light_view(light_direction);
    let resolution_f = resolution as f32;
    let padding = (resolution_f + 1.0) / resolution_f;

    let mut set = CascadeSet::default();
    for i in 0..count {
        let slice_near = boundaries[i];
        let slice_far = boundaries[i + 1];
        let projection = camera.slice_projection(slice_near, slice_far);
        let inv_view_proj = (projection * camera.view).inverse();

        let diagonal = frustum_diagonal(inv_view_proj);
        ensure!(
            diagonal > f32::EPSILON,
            "degenerate cascade frustum for slice [{slice_near}, {slice_far}]"
        );
        let bounding_box_size = diagonal * padding;
        let texel_world_size = bounding_box_size / resolution_f;

        set.matrices[i] = fit_light_projection(view, inv_view_proj, texel_world_size, bounding_box_size);
        set.sample_sizes[i] = texel_world_size;
        // Perspective-correct remap of the slice's near edge into the
        // normalized depth the lighting shader compares against.
        set.depth_boundaries[i] = (slice_near - near) / (far - near) * far / slice_near;
    }
    set.effective_near = near;
    set.count = count;
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundaries_follow_geometric_progression() {
        let boundaries = cascade_boundaries(0.1, 20.0, 4).unwrap();
        assert_eq!(boundaries.len(), 5);
        assert_eq!(boundaries[0], 0.1);
        assert_eq!(boundaries[4], 20.0);
        // ratio per step = 200^(1/4) ~= 3.7606
        let expected = [0.1, 0.37606, 1.41421, 5.31830, 20.0];
        for (b, e) in boundaries.iter().zip(expected.iter()) {
            assert!((b - e).abs() < 1e-3, "expected {e}, got {b}");
        }
    }

    #[test]
    fn boundaries_are_monotone() {
        let boundaries = cascade_boundaries(0.25, 500.0, 4).unwrap();
        for pair in boundaries.windows(2) {
            assert!(pair[0] < pair[1], "boundaries must increase: {pair:?}");
        }
    }

    #[test]
    fn boundaries_reject_invalid_ranges() {
        assert!(cascade_boundaries(0.1, 20.0, 0).is_err());
        assert!(cascade_boundaries(0.0, 20.0, 4).is_err());
        assert!(cascade_boundaries(-1.0, 20.0, 4).is_err());
        assert!(cascade_boundaries(20.0, 0.1, 4).is_err());
        assert!(cascade_boundaries(5.0, 5.0, 2).is_err());
    }

    #[test]
    fn light_up_is_unit_and_orthogonal() {
        for dir in [
            Vec3::new(1.0, 0.0, -1.0),
            Vec3::new(0.3, -0.7, -0.2),
            Vec3::new(-2.0, 1.0, 0.5),
        ] {
            let up = light_up(dir);
            assert!((up.length() - 1.0).abs() < 1e-5);
            assert!(up.dot(dir.normalize()).abs() < 1e-5, "up not orthogonal for {dir:?}");
        }
    }

    #[test]
    fn light_up_biases_toward_world_up() {
        // dir = (1,0,-1)/sqrt(2): re-orthogonalized +Z is (0.5,0,0.5) normalized.
        let up = light_up(Vec3::new(1.0, 0.0, -1.0));
        let expected = Vec3::new(0.5, 0.0, 0.5).normalize();
        assert!((up - expected).length() < 1e-5, "got {up:?}");
        assert!(up.z > 0.0);
    }

    #[test]
    fn light_up_handles_direction_parallel_to_world_up() {
        let up = light_up(Vec3::Z);
        assert!((up.length() - 1.0).abs() < 1e-5);
        assert!(up.dot(Vec3::Z).abs() < 1e-5);
    }

    #[test]
    fn light_view_has_no_translation() {
        let view = light_view(Vec3::new(0.2, -0.8, -0.4));
        let origin = view.transform_point3(Vec3::ZERO);
        assert!(origin.length() < 1e-6);
    }

    #[test]
    fn snap_down_is_idempotent() {
        for value in [-13.7, -0.2, 0.0, 0.05, 3.14, 812.9] {
            let once = snap_down(value, 0.25);
            assert_eq!(snap_down(once, 0.25), once, "re-snapping {value} moved the result");
            assert!(once <= value);
        }
    }
}
