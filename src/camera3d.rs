use glam::{Mat4, Vec3};
use winit::dpi::PhysicalSize;

const DEFAULT_UP: Vec3 = Vec3::Z;

/// Perspective camera driving the shadow cascades and the lit pass.
#[derive(Debug, Clone)]
pub struct Camera3D {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub fov_y_radians: f32,
    pub near: f32,
    pub far: f32,
}

/// Plain-data view of the camera taken once per frame.
///
/// The shadow subsystem never holds a camera reference; it consumes one of
/// these snapshots per call, so camera ownership stays with the host loop.
#[derive(Debug, Clone, Copy)]
pub struct CameraSnapshot {
    pub view: Mat4,
    pub near: f32,
    pub far: f32,
    pub fov_y_radians: f32,
    pub aspect: f32,
}

impl Camera3D {
    pub fn new(position: Vec3, target: Vec3, fov_y_radians: f32, near: f32, far: f32) -> Self {
        Self { position, target, up: DEFAULT_UP, fov_y_radians, near, far }
    }

    pub fn view_matrix(&self) -> Mat4 {
        let forward = (self.target - self.position).try_normalize().unwrap_or(Vec3::X);
        Mat4::look_at_rh(self.position, self.position + forward, self.orthonormal_up(forward))
    }

    /// Up vector re-orthogonalized against the view direction, with a
    /// perpendicular fallback when the camera looks straight along it.
    /// A raw look-at with a parallel up would produce a NaN basis.
    fn orthonormal_up(&self, forward: Vec3) -> Vec3 {
        let rejected = self.up - forward * self.up.dot(forward);
        if rejected.length_squared() > 1e-6 {
            return rejected.normalize();
        }
        let fallback = forward.cross(Vec3::Y);
        if fallback.length_squared() > 1e-6 {
            fallback.normalize()
        } else {
            forward.cross(Vec3::X).normalize()
        }
    }

    pub fn projection_matrix(&self, aspect: f32) -> Mat4 {
        Mat4::perspective_rh_gl(self.fov_y_radians, aspect.max(0.0001), self.near, self.far)
    }

    pub fn view_projection(&self, viewport: PhysicalSize<u32>) -> Mat4 {
        self.projection_matrix(Self::aspect(viewport)) * self.view_matrix()
    }

    pub fn snapshot(&self, viewport: PhysicalSize<u32>) -> CameraSnapshot {
        CameraSnapshot {
            view: self.view_matrix(),
            near: self.near,
            far: self.far,
            fov_y_radians: self.fov_y_radians,
            aspect: Self::aspect(viewport),
        }
    }

    fn aspect(viewport: PhysicalSize<u32>) -> f32 {
        if viewport.height > 0 { viewport.width as f32 / viewport.height as f32 } else { 1.0 }
    }
}

impl CameraSnapshot {
    /// Perspective projection for a sub-range of the camera's depth interval.
    pub fn slice_projection(&self, near: f32, far: f32) -> Mat4 {
        Mat4::perspective_rh_gl(self.fov_y_radians, self.aspect.max(0.0001), near, far)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera3d_view_projection_is_finite() {
        let camera = Camera3D::new(Vec3::new(0.0, 5.0, 1.0), Vec3::ZERO, 60.0_f32.to_radians(), 0.1, 1000.0);
        let vp = camera.view_projection(PhysicalSize::new(1280, 720));
        assert!(!vp.to_cols_array().iter().any(|v| v.is_nan() || v.is_infinite()));
    }

    #[test]
    fn snapshot_matches_camera() {
        let camera = Camera3D::new(Vec3::new(3.0, -4.0, 2.0), Vec3::ZERO, 45.0_f32.to_radians(), 0.5, 200.0);
        let snapshot = camera.snapshot(PhysicalSize::new(1600, 900));
        assert_eq!(snapshot.view, camera.view_matrix());
        assert_eq!(snapshot.near, 0.5);
        assert_eq!(snapshot.far, 200.0);
        assert!((snapshot.aspect - 1600.0 / 900.0).abs() < 1e-6);
    }

    #[test]
    fn straight_down_camera_keeps_view_finite() {
        let camera = Camera3D::new(Vec3::new(-4.0, 7.0, 20.0), Vec3::new(-4.0, 7.0, 0.0), 60.0_f32.to_radians(), 0.1, 100.0);
        let view = camera.view_matrix();
        assert!(view.to_cols_array().iter().all(|v| v.is_finite()), "view has NaN: {view:?}");
        // The derived basis must still look down the world-up axis.
        let forward = -view.transpose().z_axis.truncate();
        assert!((forward - Vec3::NEG_Z).length() < 1e-5, "forward is {forward:?}");
    }

    #[test]
    fn straight_up_camera_keeps_view_finite() {
        let camera = Camera3D::new(Vec3::ZERO, Vec3::new(0.0, 0.0, 30.0), 60.0_f32.to_radians(), 0.1, 100.0);
        let view = camera.view_matrix();
        assert!(view.to_cols_array().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn snapshot_zero_height_viewport_falls_back_to_square() {
        let camera = Camera3D::new(Vec3::ONE, Vec3::ZERO, 45.0_f32.to_radians(), 0.1, 100.0);
        let snapshot = camera.snapshot(PhysicalSize::new(1280, 0));
        assert_eq!(snapshot.aspect, 1.0);
    }
}
