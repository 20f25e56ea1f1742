// src/world/scheduler.rs
//! Per-frame visibility/intensity pass over the instance batches.
//!
//! A scene can hold far more instances than we can afford to re-evaluate every
//! frame, so each batch is walked with a bounded rotating window that resumes
//! from the previous frame's cursor; every slot is revisited within
//! `ceil(slots / budget)` frames. Dominant bodies and loaded models fade on
//! their own material emissive instead, every frame.

use bevy::prelude::*;
use bevy::render::mesh::Mesh;
use bevy::render::primitives::{Frustum, Sphere};

use crate::setup::MainCamera;
use crate::world::batches::{
    billboard_corners, write_slot, BillboardShapes, InstanceBatch, InstanceRecord,
};
use crate::world::core::MIN_LUMINOSITY;

// ---------- Tunables ----------

/// All constants here are tunable; the load-bearing behaviors are hysteresis,
/// the near fade, the far falloff, and the fog tail.
#[derive(Resource, Clone)]
pub struct SchedulerConfig {
    /// Rotating-window budget per batch per frame.
    pub slots_per_frame: usize,
    /// Base visibility distance at luminosity 1.0.
    pub base_distance: f32,
    /// Absolute cap on the personal visibility distance (before mode scaling).
    pub distance_cap: f32,
    /// Already-visible instances stay visible out to `distance * hysteresis`.
    /// Must be > 1.
    pub hysteresis: f32,
    /// Flat distance multiplier applied in perspective mode.
    pub perspective_boost: f32,
    /// Orthographic viewport height at which the mode multiplier is 1.0.
    pub ortho_reference_height: f32,
    /// Exponential smoothing rates, per second. Fade-out is faster so
    /// disappearance reads as a snap and appearance as a glow-up.
    pub fade_in_rate: f32,
    pub fade_out_rate: f32,
    /// Perspective proximity fade: full dimming at distance 0, none beyond
    /// `near_fade_distance`.
    pub near_fade_distance: f32,
    pub near_fade_floor: f32,
    /// Fog starts at this fraction of the visibility distance.
    pub fog_start_fraction: f32,
    /// How much of the intensity the fog tail can remove (0..1).
    pub fog_strength: f32,
    pub max_intensity_perspective: f32,
    pub max_intensity_ortho: f32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            slots_per_frame: 800,
            base_distance: 600.0,
            distance_cap: 4_000.0,
            hysteresis: 1.25,
            perspective_boost: 1.15,
            ortho_reference_height: 1_000.0,
            fade_in_rate: 3.0,
            fade_out_rate: 9.0,
            near_fade_distance: 25.0,
            near_fade_floor: 0.12,
            fog_start_fraction: 0.65,
            fog_strength: 0.5,
            max_intensity_perspective: 4.0,
            max_intensity_ortho: 2.0,
        }
    }
}

/// Intensity below this rounds to zero and the slot gets a zero color write.
pub const INTENSITY_EPSILON: f32 = 1e-3;

// ---------- View context ----------

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ViewMode {
    Perspective,
    /// Carries the current orthographic viewport height (zoom).
    Orthographic { height: f32 },
}

impl ViewMode {
    fn from_projection(projection: &Projection) -> Self {
        match projection {
            Projection::Orthographic(o) => ViewMode::Orthographic {
                height: o.area.height().max(1.0),
            },
            _ => ViewMode::Perspective,
        }
    }

    pub fn is_perspective(self) -> bool {
        matches!(self, ViewMode::Perspective)
    }
}

// ---------- Pure fade model ----------

/// Mode-dependent multiplier on the personal visibility distance: perspective
/// gets a flat boost, orthographic scales with zoom.
pub fn mode_distance_multiplier(mode: ViewMode, cfg: &SchedulerConfig) -> f32 {
    match mode {
        ViewMode::Perspective => cfg.perspective_boost,
        ViewMode::Orthographic { height } => {
            (height / cfg.ortho_reference_height).clamp(0.25, 8.0)
        }
    }
}

/// Personal visibility distance = min(base × luminosity, cap) × mode multiplier.
pub fn visibility_distance(luminosity: f32, mode: ViewMode, cfg: &SchedulerConfig) -> f32 {
    let lum = if luminosity.is_finite() {
        luminosity.max(MIN_LUMINOSITY)
    } else {
        1.0
    };
    (cfg.base_distance * lum).min(cfg.distance_cap) * mode_distance_multiplier(mode, cfg)
}

/// Hysteresis: an already-visible instance survives out to `vis × hysteresis`;
/// one that is not yet visible must come inside `vis` to appear.
pub fn hysteresis_visible(was_visible: bool, distance: f32, vis: f32, cfg: &SchedulerConfig) -> bool {
    if was_visible {
        distance <= vis * cfg.hysteresis
    } else {
        distance <= vis
    }
}

/// Near = peak, far = base, smoothstepped over the visibility distance.
fn distance_blend(distance: f32, vis: f32) -> f32 {
    let x = 1.0 - (distance / vis.max(f32::EPSILON)).clamp(0.0, 1.0);
    x * x * (3.0 - 2.0 * x)
}

/// Perspective-only: dim instances extremely close to the camera so an
/// oversized glow never fills the screen.
fn near_fade(distance: f32, cfg: &SchedulerConfig) -> f32 {
    let x = (distance / cfg.near_fade_distance.max(f32::EPSILON)).clamp(0.0, 1.0);
    cfg.near_fade_floor + (1.0 - cfg.near_fade_floor) * (x * x * (3.0 - 2.0 * x))
}

/// Perspective-only fog tail beyond a fraction of the visibility distance.
fn fog_attenuation(distance: f32, vis: f32, cfg: &SchedulerConfig) -> f32 {
    let start = vis * cfg.fog_start_fraction;
    if distance <= start {
        return 1.0;
    }
    let span = (vis * cfg.hysteresis - start).max(f32::EPSILON);
    let x = ((distance - start) / span).clamp(0.0, 1.0);
    1.0 - cfg.fog_strength * x
}

pub fn max_intensity(mode: ViewMode, cfg: &SchedulerConfig) -> f32 {
    if mode.is_perspective() {
        cfg.max_intensity_perspective
    } else {
        cfg.max_intensity_ortho
    }
}

/// Target brightness for a visible instance at `distance`. Always finite and
/// within [0, max-intensity-for-mode], whatever the record holds.
pub fn target_intensity(
    rec: &InstanceRecord,
    distance: f32,
    vis: f32,
    mode: ViewMode,
    cfg: &SchedulerConfig,
) -> f32 {
    let blend = distance_blend(distance, vis);
    let mut intensity = rec.base_intensity + (rec.peak_intensity - rec.base_intensity) * blend;
    intensity *= rec.brightness.clamp(0.0, 1.0);
    if mode.is_perspective() {
        intensity *= near_fade(distance, cfg);
        intensity *= fog_attenuation(distance, vis, cfg);
    }
    if !intensity.is_finite() {
        return 0.0;
    }
    intensity.clamp(0.0, max_intensity(mode, cfg))
}

/// Exponential smoothing toward the target, with asymmetric rates.
pub fn step_intensity(current: f32, target: f32, dt: f32, cfg: &SchedulerConfig) -> f32 {
    let rate = if target >= current {
        cfg.fade_in_rate
    } else {
        cfg.fade_out_rate
    };
    let alpha = 1.0 - (-rate * dt.max(0.0)).exp();
    let next = current + (target - current) * alpha;
    if !next.is_finite() {
        return 0.0;
    }
    if next < INTENSITY_EPSILON && target < INTENSITY_EPSILON {
        0.0
    } else {
        next.max(0.0)
    }
}

/// The slots visited by one frame's window, plus the advanced cursor.
pub fn window_slots(cursor: usize, budget: usize, len: usize) -> (Vec<usize>, usize) {
    if len == 0 || budget == 0 {
        return (Vec::new(), 0);
    }
    let visit = budget.min(len);
    let slots = (0..visit).map(|k| (cursor + k) % len).collect();
    (slots, (cursor + visit) % len)
}

/// What one visited slot needs written into the mesh this frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SlotWrite {
    /// Zero out the slot's vertex colors.
    Clear,
    /// Re-orient the billboard and write this premultiplied color.
    Draw([f32; 4]),
}

/// Advance one slot's fade state. Returns the mesh write the slot needs, or
/// `None` when it is already dark and settled; the mesh is only borrowed when
/// at least one visited slot returns `Some`. Forced slots (proxy commits,
/// group ops) always get a write, since their vertices may hold stale data.
pub fn step_slot(
    rec: &mut InstanceRecord,
    force: bool,
    in_frustum: bool,
    distance: f32,
    mode: ViewMode,
    dt: f32,
    cfg: &SchedulerConfig,
) -> Option<SlotWrite> {
    if rec.manually_hidden {
        let was_lit = rec.current_intensity > 0.0;
        rec.current_intensity = 0.0;
        rec.visible = false;
        return (force || was_lit).then_some(SlotWrite::Clear);
    }

    let vis = visibility_distance(rec.luminosity, mode, cfg);
    rec.visible = in_frustum && hysteresis_visible(rec.visible, distance, vis, cfg);

    let target = if rec.visible {
        target_intensity(rec, distance, vis, mode, cfg)
    } else {
        0.0
    };
    let previous = rec.current_intensity;
    rec.current_intensity = step_intensity(previous, target, dt, cfg);

    if rec.current_intensity < INTENSITY_EPSILON {
        rec.current_intensity = 0.0;
        return (force || previous >= INTENSITY_EPSILON).then_some(SlotWrite::Clear);
    }

    let k = rec.current_intensity;
    Some(SlotWrite::Draw([
        rec.color[0] * k,
        rec.color[1] * k,
        rec.color[2] * k,
        1.0,
    ]))
}

// ---------- Batch pass ----------

pub fn advance_instance_window(
    time: Res<Time>,
    cfg: Res<SchedulerConfig>,
    shapes: Res<BillboardShapes>,
    mut meshes: ResMut<Assets<Mesh>>,
    q_cam: Query<(&GlobalTransform, &Frustum, &Projection), With<MainCamera>>,
    mut q_batch: Query<&mut InstanceBatch>,
) {
    let Ok((cam_gt, frustum, projection)) = q_cam.single() else { return };
    let mode = ViewMode::from_projection(projection);
    let cam_pos = cam_gt.translation();
    let cam_rot = cam_gt.rotation();
    let dt = time.delta_secs();

    for mut batch in q_batch.iter_mut() {
        let len = batch.records.len();
        if len == 0 {
            batch.pending_slots.clear();
            continue;
        }

        // Forced rewrites (proxy commits, group ops) first, then the window.
        let mut slots = std::mem::take(&mut batch.pending_slots);
        let forced = slots.len();
        let (window, next_cursor) = window_slots(batch.cursor, cfg.slots_per_frame, len);
        slots.extend(window);
        batch.cursor = next_cursor;

        let template = shapes.template(batch.shape).clone();
        let verts = template.vertex_count();
        let mut writes: Vec<(usize, Option<Vec<Vec3>>, [f32; 4])> = Vec::with_capacity(slots.len());

        for (i, slot) in slots.into_iter().enumerate() {
            let force = i < forced;
            let Some(rec) = batch.records.get_mut(slot) else { continue };

            let pos = rec.transform.translation;
            let radius = rec.bounding_radius().max(crate::world::core::MIN_SCALE);
            let in_frustum = frustum.intersects_sphere(
                &Sphere { center: pos.into(), radius },
                false,
            );
            let distance = pos.distance(cam_pos);

            match step_slot(rec, force, in_frustum, distance, mode, dt, &cfg) {
                None => {}
                Some(SlotWrite::Clear) => writes.push((slot, None, [0.0; 4])),
                Some(SlotWrite::Draw(color)) => {
                    // Billboard orientation: face the camera in perspective,
                    // fixed screen orientation in orthographic.
                    let orientation = if mode.is_perspective() {
                        let dir = (cam_pos - pos).normalize_or_zero();
                        if dir == Vec3::ZERO {
                            cam_rot
                        } else {
                            Quat::from_rotation_arc(Vec3::Z, dir)
                        }
                    } else {
                        cam_rot
                    };
                    let corners = billboard_corners(&template, &rec.transform, orientation);
                    writes.push((slot, Some(corners), color));
                }
            }
        }

        // One asset touch per batch per frame, never one per slot; batches
        // whose visited slots are all settled dark skip the borrow entirely.
        if !writes.is_empty() {
            if let Some(mesh) = meshes.get_mut(&batch.mesh) {
                for (slot, corners, color) in &writes {
                    write_slot(mesh, verts, *slot, corners.as_deref(), *color);
                }
            }
        }
    }
}

// ---------- Dominant bodies / loaded models ----------

/// Analogous falloff applied directly to a node's material emissive, smoothed
/// every frame rather than scheduled through the window.
#[derive(Component, Clone, Debug)]
pub struct EmissiveFade {
    pub color: [f32; 3],
    pub base_intensity: f32,
    pub peak_intensity: f32,
    pub luminosity: f32,
    pub brightness: f32,
    pub current: f32,
}

pub fn fade_emissive_nodes(
    time: Res<Time>,
    cfg: Res<SchedulerConfig>,
    mut materials: ResMut<Assets<StandardMaterial>>,
    q_cam: Query<(&GlobalTransform, &Projection), With<MainCamera>>,
    mut q_nodes: Query<(
        &GlobalTransform,
        &ViewVisibility,
        &mut EmissiveFade,
        &MeshMaterial3d<StandardMaterial>,
    )>,
) {
    let Ok((cam_gt, projection)) = q_cam.single() else { return };
    let mode = ViewMode::from_projection(projection);
    let cam_pos = cam_gt.translation();
    let dt = time.delta_secs();

    for (gt, view_vis, mut fade, material) in q_nodes.iter_mut() {
        let distance = gt.translation().distance(cam_pos);
        let vis = visibility_distance(fade.luminosity, mode, &cfg);
        let target = if view_vis.get() && distance <= vis * cfg.hysteresis {
            let blend = distance_blend(distance, vis);
            let mut t = fade.base_intensity + (fade.peak_intensity - fade.base_intensity) * blend;
            t *= fade.brightness.clamp(0.0, 1.0);
            if mode.is_perspective() {
                t *= near_fade(distance, &cfg);
            }
            t.clamp(0.0, max_intensity(mode, &cfg))
        } else {
            0.0
        };
        fade.current = step_intensity(fade.current, target, dt, &cfg);

        if let Some(mat) = materials.get_mut(&material.0) {
            mat.emissive = LinearRgba::rgb(
                fade.color[0] * fade.current,
                fade.color[1] * fade.current,
                fade.color[2] * fade.current,
            );
        }
    }
}

/// Loaded model scenes keep their authored (shared) gltf materials, so their
/// distance falloff toggles visibility at the personal distance instead of
/// ramping an emissive.
#[derive(Component, Clone, Debug)]
pub struct ModelFade {
    pub luminosity: f32,
    pub manually_hidden: bool,
    /// Hysteresis latch, as for batched instances.
    pub visible: bool,
}

pub fn fade_model_nodes(
    cfg: Res<SchedulerConfig>,
    q_cam: Query<(&GlobalTransform, &Projection), With<MainCamera>>,
    mut q_models: Query<(&GlobalTransform, &mut ModelFade, &mut Visibility)>,
) {
    let Ok((cam_gt, projection)) = q_cam.single() else { return };
    let mode = ViewMode::from_projection(projection);
    let cam_pos = cam_gt.translation();

    for (gt, mut fade, mut visibility) in q_models.iter_mut() {
        if fade.manually_hidden {
            continue;
        }
        let distance = gt.translation().distance(cam_pos);
        let vis = visibility_distance(fade.luminosity, mode, &cfg);
        let was = fade.visible;
        fade.visible = hysteresis_visible(was, distance, vis, &cfg);
        if fade.visible != was {
            *visibility = if fade.visible { Visibility::Inherited } else { Visibility::Hidden };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::core::EntityId;

    fn rec(luminosity: f32) -> InstanceRecord {
        InstanceRecord {
            id: EntityId(1),
            name: "s".into(),
            transform: Transform::default(),
            color: [1.0, 1.0, 1.0],
            base_intensity: 0.3,
            peak_intensity: 1.2,
            luminosity,
            brightness: 1.0,
            manually_hidden: false,
            current_intensity: 0.0,
            visible: false,
        }
    }

    #[test]
    fn intensity_stays_finite_and_in_range_for_degenerate_records() {
        let cfg = SchedulerConfig::default();
        for lum in [0.0, f32::NAN, 1.0, 1000.0] {
            let vis = visibility_distance(lum, ViewMode::Perspective, &cfg);
            assert!(vis.is_finite() && vis > 0.0);
            for d in [0.0, 1.0, vis * 0.5, vis, vis * 10.0] {
                let t = target_intensity(&rec(lum), d, vis, ViewMode::Perspective, &cfg);
                assert!(t.is_finite());
                assert!((0.0..=cfg.max_intensity_perspective).contains(&t));
            }
        }
    }

    #[test]
    fn hysteresis_keeps_visible_instances_visible_longer() {
        let cfg = SchedulerConfig::default();
        assert!(cfg.hysteresis > 1.0);
        let vis = 100.0;
        // Between vis and vis*hysteresis: stays if already visible, never appears.
        let d = vis * (1.0 + (cfg.hysteresis - 1.0) * 0.5);
        assert!(hysteresis_visible(true, d, vis, &cfg));
        assert!(!hysteresis_visible(false, d, vis, &cfg));
        // Past the hysteresis band everything is gone.
        assert!(!hysteresis_visible(true, vis * cfg.hysteresis + 1.0, vis, &cfg));
        // Inside the plain distance everything appears.
        assert!(hysteresis_visible(false, vis * 0.9, vis, &cfg));
    }

    #[test]
    fn fade_out_is_faster_than_fade_in() {
        let cfg = SchedulerConfig::default();
        let dt = 1.0 / 60.0;
        let up = step_intensity(0.0, 1.0, dt, &cfg);
        let down = 1.0 - step_intensity(1.0, 0.0, dt, &cfg);
        assert!(down > up);
        // Both converge.
        let mut v = 0.0;
        for _ in 0..1000 {
            v = step_intensity(v, 1.0, dt, &cfg);
        }
        assert!((v - 1.0).abs() < 1e-3);
    }

    #[test]
    fn step_never_goes_negative_or_nan() {
        let cfg = SchedulerConfig::default();
        assert_eq!(step_intensity(0.0, 0.0, 1.0 / 60.0, &cfg), 0.0);
        assert!(step_intensity(f32::NAN, 1.0, 1.0 / 60.0, &cfg).is_finite());
        assert!(step_intensity(0.5, 0.0, 10.0, &cfg) >= 0.0);
    }

    #[test]
    fn rotating_window_visits_every_slot_within_bound() {
        let n = 5000;
        let budget = 800;
        let mut visited = vec![false; n];
        let mut cursor = 0;
        let ticks = n.div_ceil(budget);
        for _ in 0..ticks {
            let (slots, next) = window_slots(cursor, budget, n);
            for s in slots {
                visited[s] = true;
            }
            cursor = next;
        }
        assert!(visited.iter().all(|&v| v));
    }

    #[test]
    fn window_handles_empty_and_tiny_batches() {
        assert_eq!(window_slots(0, 800, 0).0.len(), 0);
        let (slots, next) = window_slots(1, 800, 3);
        assert_eq!(slots, vec![1, 2, 0]);
        assert_eq!(next, 1);
    }

    #[test]
    fn settled_blank_slots_need_no_write() {
        let cfg = SchedulerConfig::default();
        let mode = ViewMode::Perspective;
        let dt = 1.0 / 60.0;

        // Far outside the visibility distance and already dark: nothing to do.
        let mut far = rec(1.0);
        let beyond = visibility_distance(1.0, mode, &cfg) * 10.0;
        assert_eq!(step_slot(&mut far, false, true, beyond, mode, dt, &cfg), None);
        // A forced visit always writes, even when the state did not change.
        assert_eq!(
            step_slot(&mut far, true, true, beyond, mode, dt, &cfg),
            Some(SlotWrite::Clear)
        );

        // A lit slot drifting out writes a clear exactly once, then settles.
        let mut lit = rec(1.0);
        lit.visible = true;
        lit.current_intensity = 0.8;
        assert_eq!(
            step_slot(&mut lit, false, true, beyond, mode, 10.0, &cfg),
            Some(SlotWrite::Clear)
        );
        assert_eq!(step_slot(&mut lit, false, true, beyond, mode, dt, &cfg), None);
    }

    #[test]
    fn visible_slots_draw_their_faded_color() {
        let cfg = SchedulerConfig::default();
        let mode = ViewMode::Perspective;
        let mut r = rec(1.0);
        r.color = [1.0, 0.5, 0.25];
        let vis = visibility_distance(1.0, mode, &cfg);
        let write = step_slot(&mut r, false, true, vis * 0.5, mode, 1.0 / 60.0, &cfg);
        let Some(SlotWrite::Draw(color)) = write else {
            panic!("expected a draw, got {write:?}");
        };
        let k = r.current_intensity;
        assert!(k > 0.0);
        assert_eq!(color, [k, 0.5 * k, 0.25 * k, 1.0]);
    }

    #[test]
    fn ortho_multiplier_tracks_zoom() {
        let cfg = SchedulerConfig::default();
        let near = mode_distance_multiplier(
            ViewMode::Orthographic { height: cfg.ortho_reference_height * 0.5 },
            &cfg,
        );
        let far = mode_distance_multiplier(
            ViewMode::Orthographic { height: cfg.ortho_reference_height * 4.0 },
            &cfg,
        );
        assert!(near < 1.0 && far > 1.0);
    }
}
