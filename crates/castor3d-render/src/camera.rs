//! Camera and view management.

use glam::{Mat4, Vec3};

/// Camera the pass chains place their grids and cascades around.
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub direction: Vec3,
    pub up: Vec3,
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 5.0),
            direction: Vec3::NEG_Z,
            up: Vec3::Y,
            fov: std::f32::consts::FRAC_PI_4,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Camera {
    /// Create a camera at `position` looking at `target`.
    pub fn new(
        position: Vec3,
        target: Vec3,
        up: Vec3,
        fov: f32,
        aspect: f32,
        near: f32,
        far: f32,
    ) -> Self {
        let direction = (target - position).normalize_or(Vec3::NEG_Z);
        Self {
            position,
            direction,
            up,
            fov,
            aspect,
            near,
            far,
        }
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    /// Look at a target position.
    pub fn look_at(&mut self, target: Vec3) {
        self.direction = (target - self.position).normalize_or(self.direction);
    }

    pub fn set_aspect(&mut self, aspect: f32) {
        self.aspect = aspect;
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.direction, self.up)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov, self.aspect, self.near, self.far)
    }

    /// Get the view-projection matrix.
    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }
}

/// Camera uniform buffer data for GPU.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CameraUniforms {
    pub view: [[f32; 4]; 4],
    pub projection: [[f32; 4]; 4],
    pub position: [f32; 4],
}

impl From<&Camera> for CameraUniforms {
    fn from(camera: &Camera) -> Self {
        Self {
            view: camera.view_matrix().to_cols_array_2d(),
            projection: camera.projection_matrix().to_cols_array_2d(),
            position: camera.position.extend(1.0).to_array(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn look_at_points_at_target() {
        let mut camera = Camera::default();
        camera.set_position(Vec3::ZERO);
        camera.look_at(Vec3::new(10.0, 0.0, 0.0));
        assert_relative_eq!(camera.direction.x, 1.0);
        // Looking at the own position keeps the previous direction.
        camera.look_at(Vec3::ZERO);
        assert_relative_eq!(camera.direction.x, 1.0);
    }

    #[test]
    fn view_moves_position_to_origin() {
        let camera = Camera::new(
            Vec3::new(1.0, 2.0, 3.0),
            Vec3::new(1.0, 2.0, 0.0),
            Vec3::Y,
            1.0,
            1.0,
            0.1,
            100.0,
        );
        let origin = camera.view_matrix().transform_point3(camera.position);
        assert_relative_eq!(origin.length(), 0.0, epsilon = 1e-5);
    }
}
