// src/camera/rig.rs
//! Camera state machine data + the pure framing/easing math.

use bevy::prelude::*;

use crate::api::Axis;

pub const TRANSITION_DURATION: f32 = 1.2;
pub const AUTO_ORBIT_DURATION: f32 = 10.0;
pub const AUTO_ORBIT_SPEED: f32 = 0.3;
/// Orthographic fits pad the visible extent by 10%.
pub const FIT_PADDING: f32 = 1.1;
/// Axis views sit at this multiple of the scene box diagonal.
pub const AXIS_DISTANCE_FACTOR: f32 = 1.5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraMode {
    Perspective,
    Orthographic,
}

#[derive(Clone, Copy, Debug)]
pub struct SavedPerspective {
    pub position: Vec3,
    pub target: Vec3,
}

#[derive(Clone, Copy, Debug)]
pub struct SavedOrtho {
    pub position: Vec3,
    pub target: Vec3,
    pub extent: Vec2,
}

/// One animated focus/frame move. Position and look-target use different
/// easing curves so the camera visibly looks first, then travels.
#[derive(Clone, Copy, Debug)]
pub struct CameraTransition {
    pub from_position: Vec3,
    pub to_position: Vec3,
    pub from_target: Vec3,
    pub to_target: Vec3,
    /// Orthographic frustum animation; None in perspective mode.
    pub from_extent: Option<Vec2>,
    pub to_extent: Option<Vec2>,
    pub elapsed: f32,
    pub duration: f32,
    /// Perspective focus starts a timed orbit once the move lands.
    pub orbit_on_arrival: bool,
}

/// Timed automatic orbit around a focused target; cancelled by the next
/// navigation or focus action.
#[derive(Clone, Copy, Debug)]
pub struct AutoOrbit {
    pub center: Vec3,
    pub radius: f32,
    pub height: f32,
    pub angle: f32,
    pub remaining: f32,
}

/// Exactly one of these is live; transitions are exclusive.
#[derive(Resource)]
pub struct CameraRig {
    pub mode: CameraMode,
    /// Current look target of the active camera.
    pub target: Vec3,
    pub saved_perspective: Option<SavedPerspective>,
    pub saved_ortho: Option<SavedOrtho>,
    pub transition: Option<CameraTransition>,
    pub orbit: Option<AutoOrbit>,
}

impl Default for CameraRig {
    fn default() -> Self {
        Self {
            mode: CameraMode::Perspective,
            target: Vec3::ZERO,
            saved_perspective: None,
            saved_ortho: None,
            transition: None,
            orbit: None,
        }
    }
}

impl CameraRig {
    /// Navigation input is ignored while an animation owns the camera.
    pub fn animating(&self) -> bool {
        self.transition.is_some()
    }

    /// Any new focus or axis request cancels an in-flight animation wholesale.
    pub fn cancel_animation(&mut self) {
        self.transition = None;
        self.orbit = None;
    }
}

/// Notifies the render orchestrator (outline parameter swap) and the scheduler
/// (mode-dependent visibility math) of mode flips.
#[derive(Event, Clone, Copy, Debug)]
pub struct CameraModeChanged(pub CameraMode);

// ---------- Easing ----------

/// Fast ease for the look-target (ease-out cubic): orientation leads.
pub fn ease_look(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    1.0 - (1.0 - t).powi(3)
}

/// Slow ease for translation (smoothstep): the camera travels after it looks.
pub fn ease_travel(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

// ---------- Framing math ----------

/// The box extents visible when looking down `axis`: (width, height) in the
/// view plane.
pub fn axis_visible_extent(size: Vec3, axis: Axis) -> Vec2 {
    match axis {
        Axis::X => Vec2::new(size.z, size.y),
        Axis::Y => Vec2::new(size.x, size.z),
        Axis::Z => Vec2::new(size.x, size.y),
    }
}

/// Fit an orthographic frustum around `visible` (already in view-plane space),
/// padded, while keeping the frustum's aspect equal to the viewport's.
pub fn fit_extent(visible: Vec2, aspect: f32, padding: f32) -> Vec2 {
    let aspect = if aspect.is_finite() && aspect > 0.0 { aspect } else { 1.0 };
    let padded = visible.max(Vec2::splat(f32::EPSILON)) * padding;
    let width = padded.x.max(padded.y * aspect);
    Vec2::new(width, width / aspect)
}

/// Distance at which a sphere of `radius` fills a comfortable share of a
/// perspective view.
pub fn framing_distance(radius: f32, fov_y: f32) -> f32 {
    let half = (fov_y * 0.5).clamp(0.05, 1.5);
    (radius.max(0.5) * 2.2) / half.tan()
}

/// Zero-size boxes are substituted with a unit box so distance/framing math
/// stays well-defined.
pub fn sanitize_bounds(center: Vec3, size: Vec3) -> (Vec3, Vec3) {
    if size.max_element() < 1e-4 || !size.is_finite() {
        (center, Vec3::ONE)
    } else {
        (center, size.max(Vec3::splat(1e-4)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn look_easing_leads_travel_easing() {
        for i in 1..20 {
            let t = i as f32 / 20.0;
            assert!(ease_look(t) >= ease_travel(t), "t={t}");
        }
        assert_eq!(ease_look(1.0), 1.0);
        assert_eq!(ease_travel(1.0), 1.0);
        assert_eq!(ease_travel(0.0), 0.0);
    }

    #[test]
    fn fitted_extent_matches_viewport_aspect_and_covers_the_box() {
        let visible = Vec2::new(40.0, 10.0);
        let aspect = 16.0 / 9.0;
        let extent = fit_extent(visible, aspect, FIT_PADDING);
        assert!((extent.x / extent.y - aspect).abs() < 1e-4);
        assert!(extent.x >= visible.x * FIT_PADDING - 1e-4);
        assert!(extent.y >= visible.y * FIT_PADDING - 1e-4);

        // Tall box: height drives the fit instead.
        let tall = fit_extent(Vec2::new(5.0, 50.0), aspect, FIT_PADDING);
        assert!((tall.x / tall.y - aspect).abs() < 1e-4);
        assert!(tall.y >= 50.0 * FIT_PADDING - 1e-4);
    }

    #[test]
    fn axis_extents_pick_the_right_faces() {
        let size = Vec3::new(2.0, 3.0, 4.0);
        assert_eq!(axis_visible_extent(size, Axis::X), Vec2::new(4.0, 3.0));
        assert_eq!(axis_visible_extent(size, Axis::Y), Vec2::new(2.0, 4.0));
        assert_eq!(axis_visible_extent(size, Axis::Z), Vec2::new(2.0, 3.0));
    }

    #[test]
    fn degenerate_bounds_fall_back_to_a_unit_box() {
        let (_, size) = sanitize_bounds(Vec3::ONE, Vec3::ZERO);
        assert_eq!(size, Vec3::ONE);
        let (_, kept) = sanitize_bounds(Vec3::ZERO, Vec3::new(2.0, 3.0, 4.0));
        assert_eq!(kept, Vec3::new(2.0, 3.0, 4.0));
    }

    #[test]
    fn rig_transitions_are_exclusive_and_cancellable() {
        let mut rig = CameraRig::default();
        assert!(!rig.animating());
        rig.transition = Some(CameraTransition {
            from_position: Vec3::ZERO,
            to_position: Vec3::X,
            from_target: Vec3::ZERO,
            to_target: Vec3::ZERO,
            from_extent: None,
            to_extent: None,
            elapsed: 0.0,
            duration: TRANSITION_DURATION,
            orbit_on_arrival: true,
        });
        rig.orbit = Some(AutoOrbit {
            center: Vec3::ZERO,
            radius: 5.0,
            height: 1.0,
            angle: 0.0,
            remaining: AUTO_ORBIT_DURATION,
        });
        assert!(rig.animating());
        rig.cancel_animation();
        assert!(!rig.animating());
        assert!(rig.orbit.is_none());
    }

    #[test]
    fn framing_distance_grows_with_radius() {
        let fov = std::f32::consts::FRAC_PI_4;
        assert!(framing_distance(10.0, fov) > framing_distance(1.0, fov));
        assert!(framing_distance(0.0, fov) > 0.0);
    }
}
