// Scene snapshot handed to the backend each frame
//
// The backend never owns scene data; callers build one of these from their
// own world state and pass it by reference.

use glam::{Mat4, Vec3, Vec4};

/// Perspective camera
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    /// Normalized up direction
    pub up: Vec3,
    /// Vertical field of view, in degrees
    pub fov: f32,
    pub near_plane: f32,
    pub far_plane: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 5.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            fov: 90.0,
            near_plane: 0.1,
            far_plane: 100_000.0,
        }
    }
}

impl Camera {
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    /// Vulkan clip space: depth 0..1, Y pointing down
    pub fn projection_matrix(&self, aspect_ratio: f32) -> Mat4 {
        let mut projection =
            Mat4::perspective_rh(self.fov.to_radians(), aspect_ratio, self.near_plane, self.far_plane);
        projection.y_axis.y *= -1.0;
        projection
    }
}

/// One object to draw: a unit cube under `transform`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawItem {
    pub transform: Mat4,
    pub color: Vec4,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    pub camera: Camera,
    pub clear_color: [f32; 4],
    /// Direction the light travels, world space
    pub light_direction: Vec3,
    pub ambient: f32,
    pub items: Vec<DrawItem>,
}

impl Default for Scene {
    fn default() -> Self {
        Self {
            camera: Camera::default(),
            clear_color: [0.1, 0.2, 0.8, 1.0],
            light_direction: Vec3::new(-0.4, -1.0, -0.6).normalize(),
            ambient: 0.15,
            items: Vec::new(),
        }
    }
}
