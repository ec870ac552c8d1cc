//! Camera and view management.

use glam::{Mat4, Vec3};

/// Anything that can provide view and projection matrices.
pub trait Camera {
    /// Advance camera motion by `dt` seconds.
    fn update(&mut self, dt: f32);

    /// World-to-view transform.
    fn view(&self) -> Mat4;

    /// View-to-clip transform, in Vulkan clip space.
    fn projection(&self) -> Mat4;

    /// Match the projection to a new viewport.
    fn set_aspect(&mut self, aspect: f32);

    /// Eye position in world space.
    fn position(&self) -> Vec3;

    fn view_projection(&self) -> Mat4 {
        self.projection() * self.view()
    }

    /// Camera uniforms for GPU.
    fn uniforms(&self) -> CameraUniforms {
        let view = self.view();
        let projection = self.projection();
        let position = self.position();
        CameraUniforms {
            view: view.to_cols_array_2d(),
            projection: projection.to_cols_array_2d(),
            view_projection: (projection * view).to_cols_array_2d(),
            position: [position.x, position.y, position.z, 1.0],
        }
    }
}

/// Circular motion around a target point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Orbit {
    pub target: Vec3,
    pub radius: f32,
    /// Height above the target.
    pub height: f32,
    /// Angular speed in radians per second.
    pub speed: f32,
    pub angle: f32,
}

impl Orbit {
    pub fn new(target: Vec3, radius: f32, height: f32, speed: f32) -> Self {
        Self {
            target,
            radius,
            height,
            speed,
            angle: 0.0,
        }
    }

    /// Eye position for the current angle.
    pub fn position(&self) -> Vec3 {
        self.target
            + Vec3::new(
                self.radius * self.angle.sin(),
                self.height,
                self.radius * self.angle.cos(),
            )
    }

    fn advance(&mut self, dt: f32) {
        self.angle = (self.angle + self.speed * dt).rem_euclid(std::f32::consts::TAU);
    }
}

/// Perspective camera, optionally orbiting a target.
#[derive(Debug, Clone)]
pub struct PerspectiveCamera {
    pub position: Vec3,
    pub direction: Vec3,
    pub up: Vec3,
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
    pub orbit: Option<Orbit>,
}

impl Default for PerspectiveCamera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 3.0),
            direction: Vec3::NEG_Z,
            up: Vec3::Y,
            fov: std::f32::consts::FRAC_PI_4,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 100.0,
            orbit: None,
        }
    }
}

impl PerspectiveCamera {
    /// Create a camera looking from `position` at `target`.
    pub fn new(position: Vec3, target: Vec3, fov: f32, aspect: f32) -> Self {
        Self {
            position,
            direction: (target - position).normalize_or(Vec3::NEG_Z),
            fov,
            aspect,
            ..Default::default()
        }
    }

    /// Make the camera circle around `orbit.target`, always facing it.
    pub fn with_orbit(mut self, orbit: Orbit) -> Self {
        self.orbit = Some(orbit);
        self.follow_orbit();
        self
    }

    /// Look at a target position.
    pub fn look_at(&mut self, target: Vec3) {
        self.direction = (target - self.position).normalize_or(self.direction);
    }

    fn follow_orbit(&mut self) {
        if let Some(orbit) = self.orbit {
            self.position = orbit.position();
            self.look_at(orbit.target);
        }
    }
}

impl Camera for PerspectiveCamera {
    fn update(&mut self, dt: f32) {
        if let Some(orbit) = &mut self.orbit {
            orbit.advance(dt);
        }
        self.follow_orbit();
    }

    fn view(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.direction, self.up)
    }

    fn projection(&self) -> Mat4 {
        let mut projection = Mat4::perspective_rh(self.fov, self.aspect, self.near, self.far);
        // Vulkan clip space has Y pointing down
        projection.y_axis.y *= -1.0;
        projection
    }

    fn set_aspect(&mut self, aspect: f32) {
        if aspect.is_finite() && aspect > 0.0 {
            self.aspect = aspect;
        }
    }

    fn position(&self) -> Vec3 {
        self.position
    }
}

/// Camera uniform buffer data for GPU.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CameraUniforms {
    pub view: [[f32; 4]; 4],
    pub projection: [[f32; 4]; 4],
    pub view_projection: [[f32; 4]; 4],
    pub position: [f32; 4],
}
