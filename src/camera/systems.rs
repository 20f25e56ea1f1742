// src/camera/systems.rs
//! Camera operations (toggle / axis view / focus / frame) and the per-frame
//! transition + auto-orbit stepping.

use bevy::prelude::*;
use bevy::render::camera::ScalingMode;
use bevy::window::PrimaryWindow;

use crate::api::{Axis, FocusObject, FrameScene, SetAxisView, ToggleCameraMode};
use crate::camera::rig::{
    axis_visible_extent, ease_look, ease_travel, fit_extent, framing_distance, sanitize_bounds,
    AutoOrbit, CameraMode, CameraModeChanged, CameraRig, CameraTransition, SavedOrtho,
    SavedPerspective, AUTO_ORBIT_DURATION, AUTO_ORBIT_SPEED, AXIS_DISTANCE_FACTOR, FIT_PADDING,
    TRANSITION_DURATION,
};
use crate::setup::MainCamera;
use crate::world::batches::InstanceBatch;
use crate::world::core::{EntityId, WorldObject};
use crate::world::proxy::{resolve_interactive, ActiveProxies, Resolved};
use crate::world::registry::EntityRegistry;

const DEFAULT_TOGGLE_AXIS: Axis = Axis::Y;

// ---------- Scene bounds ----------

/// World bounding box over every direct node and every batched instance.
/// Returns None on an empty scene; degenerate boxes come back unit-sized.
fn scene_bounds(
    q_world: &Query<&GlobalTransform, With<WorldObject>>,
    q_batch: &Query<&InstanceBatch>,
) -> Option<(Vec3, Vec3)> {
    let mut min = Vec3::MAX;
    let mut max = Vec3::MIN;
    let mut any = false;

    for gt in q_world.iter() {
        let pos = gt.translation();
        let half = gt.scale().abs().max_element().max(0.5);
        min = min.min(pos - half);
        max = max.max(pos + half);
        any = true;
    }
    for batch in q_batch.iter() {
        for rec in &batch.records {
            let pos = rec.transform.translation;
            let half = rec.bounding_radius();
            min = min.min(pos - half);
            max = max.max(pos + half);
            any = true;
        }
    }
    if !any {
        return None;
    }
    Some(sanitize_bounds((min + max) * 0.5, max - min))
}

fn viewport_aspect(windows: &Query<&Window, With<PrimaryWindow>>) -> f32 {
    windows
        .single()
        .map(|w| w.width() / w.height().max(1.0))
        .unwrap_or(16.0 / 9.0)
}

fn current_ortho_extent(projection: &Projection) -> Option<Vec2> {
    match projection {
        Projection::Orthographic(o) => Some(Vec2::new(o.area.width(), o.area.height())),
        _ => None,
    }
}

fn set_ortho_projection(projection: &mut Projection, extent: Vec2, depth: f32) {
    let mut ortho = OrthographicProjection::default_3d();
    ortho.near = -depth;
    ortho.far = depth;
    ortho.scaling_mode = ScalingMode::Fixed { width: extent.x, height: extent.y };
    *projection = Projection::Orthographic(ortho);
}

/// Up vector that never degenerates against the view direction.
fn safe_up(view_dir: Vec3) -> Vec3 {
    if view_dir.normalize_or_zero().dot(Vec3::Y).abs() > 0.99 {
        Vec3::NEG_Z
    } else {
        Vec3::Y
    }
}

fn look_at(tf: &mut Transform, target: Vec3) {
    let dir = target - tf.translation;
    tf.look_at(target, safe_up(dir));
}

// ---------- Request handling ----------

#[allow(clippy::too_many_arguments)]
pub fn handle_camera_requests(
    mut toggles: EventReader<ToggleCameraMode>,
    mut axes: EventReader<SetAxisView>,
    mut focuses: EventReader<FocusObject>,
    mut frames: EventReader<FrameScene>,
    mut rig: ResMut<CameraRig>,
    registry: Res<EntityRegistry>,
    proxies: Res<ActiveProxies>,
    mut mode_changed: EventWriter<CameraModeChanged>,
    windows: Query<&Window, With<PrimaryWindow>>,
    mut q_cam: Query<(&mut Transform, &mut Projection), With<MainCamera>>,
    q_world: Query<&GlobalTransform, With<WorldObject>>,
    q_batch: Query<&InstanceBatch>,
    q_gt: Query<&GlobalTransform>,
) {
    let Ok((mut tf, mut projection)) = q_cam.single_mut() else { return };
    let aspect = viewport_aspect(&windows);

    for _ in toggles.read() {
        // Toggle is not a cancelling trigger; it is simply rejected mid-flight.
        if rig.animating() {
            info!("Camera: mode toggle ignored while a transition is in flight");
            continue;
        }
        rig.orbit = None;
        match rig.mode {
            CameraMode::Perspective => {
                rig.saved_perspective =
                    Some(SavedPerspective { position: tf.translation, target: rig.target });
                rig.mode = CameraMode::Orthographic;
                if let Some(saved) = rig.saved_ortho {
                    // Round trip back to the orthographic pose the user left.
                    let depth = scene_bounds(&q_world, &q_batch)
                        .map(|(_, size)| size.length() * AXIS_DISTANCE_FACTOR * 2.0)
                        .unwrap_or(1_000.0);
                    tf.translation = saved.position;
                    rig.target = saved.target;
                    look_at(&mut tf, saved.target);
                    set_ortho_projection(&mut projection, saved.extent, depth);
                } else if let Some((center, size)) = scene_bounds(&q_world, &q_batch) {
                    place_axis_view(
                        &mut rig, &mut tf, &mut projection, aspect, DEFAULT_TOGGLE_AXIS, center,
                        size,
                    );
                } else {
                    // Empty scene: no box to frame; swap projection in place.
                    set_ortho_projection(
                        &mut projection,
                        fit_extent(Vec2::splat(10.0), aspect, FIT_PADDING),
                        1_000.0,
                    );
                }
                mode_changed.write(CameraModeChanged(rig.mode));
            }
            CameraMode::Orthographic => {
                let extent = current_ortho_extent(&projection).unwrap_or(Vec2::splat(10.0));
                rig.saved_ortho = Some(SavedOrtho {
                    position: tf.translation,
                    target: rig.target,
                    extent,
                });
                rig.mode = CameraMode::Perspective;
                *projection = Projection::Perspective(PerspectiveProjection::default());
                if let Some(saved) = rig.saved_perspective {
                    tf.translation = saved.position;
                    rig.target = saved.target;
                    look_at(&mut tf, saved.target);
                } else {
                    // No perspective pose to restore: derive a safe one from
                    // the orthographic pose and the scene's bounding size so
                    // the camera never lands inside geometry.
                    let diag = scene_bounds(&q_world, &q_batch)
                        .map(|(_, size)| size.length())
                        .unwrap_or(20.0);
                    let dir = (tf.translation - rig.target).normalize_or_zero();
                    let dir = if dir == Vec3::ZERO { Vec3::new(0.6, 0.5, 0.6).normalize() } else { dir };
                    let target = rig.target;
                    tf.translation = target + dir * diag * AXIS_DISTANCE_FACTOR;
                    look_at(&mut tf, target);
                }
                mode_changed.write(CameraModeChanged(rig.mode));
            }
        }
    }

    for SetAxisView(axis) in axes.read() {
        rig.cancel_animation();
        // Requires a scene bounding box; no-op on an empty scene.
        let Some((center, size)) = scene_bounds(&q_world, &q_batch) else { continue };
        if rig.mode != CameraMode::Orthographic {
            rig.saved_perspective =
                Some(SavedPerspective { position: tf.translation, target: rig.target });
            rig.mode = CameraMode::Orthographic;
            mode_changed.write(CameraModeChanged(rig.mode));
        }
        place_axis_view(&mut rig, &mut tf, &mut projection, aspect, *axis, center, size);
    }

    for FocusObject(id) in focuses.read() {
        let Some((pos, radius)) = object_pose(&registry, &proxies, &q_batch, &q_gt, *id) else {
            warn!("Focus on unknown entity {id:?}; ignoring");
            continue;
        };
        rig.cancel_animation();
        start_framing_transition(&mut rig, &tf, &projection, aspect, pos, radius, true);
    }

    for _ in frames.read() {
        let Some((center, size)) = scene_bounds(&q_world, &q_batch) else { continue };
        rig.cancel_animation();
        start_framing_transition(&mut rig, &tf, &projection, aspect, center, size.length() * 0.5, false);
    }
}

fn place_axis_view(
    rig: &mut CameraRig,
    tf: &mut Transform,
    projection: &mut Projection,
    aspect: f32,
    axis: Axis,
    center: Vec3,
    size: Vec3,
) {
    let diag = size.length();
    let position = center + axis.direction() * diag * AXIS_DISTANCE_FACTOR;
    let extent = fit_extent(axis_visible_extent(size, axis), aspect, FIT_PADDING);

    tf.translation = position;
    look_at(tf, center);
    rig.target = center;
    set_ortho_projection(projection, extent, diag * AXIS_DISTANCE_FACTOR * 2.0);
    rig.saved_ortho = Some(SavedOrtho { position, target: center, extent });
}

/// Resolve an id to a world position + bounding radius, through proxy and
/// instance indirection.
fn object_pose(
    registry: &EntityRegistry,
    proxies: &ActiveProxies,
    q_batch: &Query<&InstanceBatch>,
    q_gt: &Query<&GlobalTransform>,
    id: EntityId,
) -> Option<(Vec3, f32)> {
    match resolve_interactive(registry, proxies, id)? {
        Resolved::Direct(e) | Resolved::Proxy { entity: e, .. } => {
            let gt = q_gt.get(e).ok()?;
            Some((gt.translation(), gt.scale().abs().max_element().max(0.5)))
        }
        Resolved::Instance { batch, slot } => {
            let rec = q_batch.get(batch).ok()?.records.get(slot)?.clone();
            Some((rec.transform.translation, rec.bounding_radius().max(0.5)))
        }
    }
}

fn start_framing_transition(
    rig: &mut CameraRig,
    tf: &Transform,
    projection: &Projection,
    aspect: f32,
    target: Vec3,
    radius: f32,
    orbit: bool,
) {
    let (to_position, from_extent, to_extent, orbit_on_arrival) = match rig.mode {
        CameraMode::Perspective => {
            let fov = match projection {
                Projection::Perspective(p) => p.fov,
                _ => std::f32::consts::FRAC_PI_4,
            };
            let dir = (tf.translation - target).normalize_or_zero();
            let dir = if dir == Vec3::ZERO { Vec3::new(0.6, 0.5, 0.6).normalize() } else { dir };
            (target + dir * framing_distance(radius, fov), None, None, orbit)
        }
        CameraMode::Orthographic => {
            // Keep the viewing direction; slide sideways and refit the frustum
            // with the same logic the axis views use.
            let offset = tf.translation - rig.target;
            let extent = fit_extent(Vec2::splat(radius * 2.0), aspect, FIT_PADDING);
            (target + offset, current_ortho_extent(projection), Some(extent), false)
        }
    };

    rig.transition = Some(CameraTransition {
        from_position: tf.translation,
        to_position,
        from_target: rig.target,
        to_target: target,
        from_extent,
        to_extent,
        elapsed: 0.0,
        duration: TRANSITION_DURATION,
        orbit_on_arrival,
    });
}

// ---------- Per-frame stepping ----------

pub fn step_camera_transition(
    time: Res<Time>,
    mut rig: ResMut<CameraRig>,
    mut q_cam: Query<(&mut Transform, &mut Projection), With<MainCamera>>,
) {
    let Ok((mut tf, mut projection)) = q_cam.single_mut() else { return };
    let dt = time.delta_secs();

    if let Some(mut tr) = rig.transition.take() {
        tr.elapsed += dt;
        let t = (tr.elapsed / tr.duration).min(1.0);

        let position = tr.from_position.lerp(tr.to_position, ease_travel(t));
        let target = tr.from_target.lerp(tr.to_target, ease_look(t));
        tf.translation = position;
        look_at(&mut tf, target);
        rig.target = target;

        if let (Some(from), Some(to)) = (tr.from_extent, tr.to_extent) {
            let extent = from.lerp(to, ease_travel(t));
            if let Projection::Orthographic(o) = &mut *projection {
                o.scaling_mode = ScalingMode::Fixed { width: extent.x, height: extent.y };
            }
        }

        if t < 1.0 {
            rig.transition = Some(tr);
        } else if tr.orbit_on_arrival && rig.mode == CameraMode::Perspective {
            let offset = tf.translation - rig.target;
            let radius = offset.xz().length().max(0.1);
            rig.orbit = Some(AutoOrbit {
                center: rig.target,
                radius,
                height: offset.y,
                angle: offset.z.atan2(offset.x),
                remaining: AUTO_ORBIT_DURATION,
            });
        }
        return;
    }

    if let Some(mut orbit) = rig.orbit.take() {
        orbit.angle += AUTO_ORBIT_SPEED * dt;
        orbit.remaining -= dt;
        tf.translation = orbit.center
            + Vec3::new(
                orbit.angle.cos() * orbit.radius,
                orbit.height,
                orbit.angle.sin() * orbit.radius,
            );
        look_at(&mut tf, orbit.center);
        rig.target = orbit.center;
        if orbit.remaining > 0.0 {
            rig.orbit = Some(orbit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bevy::window::Window;

    fn request_app() -> App {
        let mut app = App::new();
        app.add_event::<ToggleCameraMode>()
            .add_event::<SetAxisView>()
            .add_event::<FocusObject>()
            .add_event::<FrameScene>()
            .add_event::<CameraModeChanged>()
            .init_resource::<CameraRig>()
            .init_resource::<EntityRegistry>()
            .init_resource::<ActiveProxies>()
            .add_systems(Update, handle_camera_requests);
        app.world_mut().spawn((Window::default(), PrimaryWindow));
        app
    }

    #[test]
    fn toggle_restores_the_stored_orthographic_view() {
        let mut app = request_app();
        let cam = app
            .world_mut()
            .spawn((
                Transform::from_xyz(0.0, 0.0, 50.0),
                Projection::Perspective(PerspectiveProjection::default()),
                MainCamera,
            ))
            .id();

        let saved = SavedOrtho {
            position: Vec3::new(0.0, 90.0, 0.0),
            target: Vec3::new(4.0, 0.0, 2.0),
            extent: Vec2::new(64.0, 36.0),
        };
        app.world_mut().resource_mut::<CameraRig>().saved_ortho = Some(saved);
        app.world_mut().send_event(ToggleCameraMode);
        app.update();

        let rig = app.world().resource::<CameraRig>();
        assert_eq!(rig.mode, CameraMode::Orthographic);
        assert!((rig.target - saved.target).length() < 1e-4);

        let tf = app.world().get::<Transform>(cam).unwrap();
        assert!((tf.translation - saved.position).length() < 1e-4);

        let projection = app.world().get::<Projection>(cam).unwrap();
        let Projection::Orthographic(o) = projection else {
            panic!("expected an orthographic projection after the toggle");
        };
        match o.scaling_mode {
            ScalingMode::Fixed { width, height } => {
                assert_eq!(width, saved.extent.x);
                assert_eq!(height, saved.extent.y);
            }
            other => panic!("expected a fixed scaling mode, got {other:?}"),
        }
    }

    #[test]
    fn first_toggle_without_a_stored_view_frames_the_default_axis() {
        let mut app = request_app();
        let cam = app
            .world_mut()
            .spawn((
                Transform::from_xyz(0.0, 0.0, 50.0),
                Projection::Perspective(PerspectiveProjection::default()),
                MainCamera,
            ))
            .id();

        app.world_mut().send_event(ToggleCameraMode);
        app.update();

        // Empty scene, no stored pose: the projection still swaps over.
        let rig = app.world().resource::<CameraRig>();
        assert_eq!(rig.mode, CameraMode::Orthographic);
        assert!(rig.saved_perspective.is_some());
        assert!(matches!(
            app.world().get::<Projection>(cam),
            Some(Projection::Orthographic(_))
        ));
    }
}
