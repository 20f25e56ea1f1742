use bevy::input::mouse::{MouseMotion, MouseScrollUnit, MouseWheel};
use bevy::prelude::*;
use bevy::render::camera::ScalingMode;
use bevy::window::PrimaryWindow;

use crate::api::{
    Axis, FocusObject, FrameScene, SetAxisView, SetSelection, SetToolMode, ToggleCameraMode,
    ToolMode,
};
use crate::camera::rig::{CameraMode, CameraRig};
use crate::setup::MainCamera;
use crate::world::batches::InstanceBatch;
use crate::world::core::{EntityId, WorldObject, MIN_SCALE};
use crate::world::proxy::{
    resolve_interactive, ActiveProxies, DragEnded, HoverTarget, Resolved, Selection,
};
use crate::world::registry::EntityRegistry;

pub const MOVE_SPEED: f32 = 250.0;
pub const ROTATE_SPEED: f32 = 0.2;
pub const MAX_CAMERA_DT: f32 = 0.05; // never use a dt larger than 50ms

/// Orbit-style navigation state for the main camera. Re-derived from the
/// camera pose whenever the rig has moved it, so manual navigation always
/// resumes from wherever a transition or auto-orbit left off.
#[derive(Component)]
pub struct CameraOrbit {
    pub focus: Vec3,
    pub radius: f32,
    pub yaw: f32,
    pub pitch: f32,
}

impl CameraOrbit {
    pub fn from_pose(position: Vec3, focus: Vec3) -> Self {
        let offset = position - focus;
        let radius = offset.length().max(1.0);
        Self {
            focus,
            radius,
            yaw: offset.z.atan2(offset.x),
            pitch: (offset.y / radius).clamp(-1.0, 1.0).asin(),
        }
    }
}

// ---------- Navigation ----------

pub fn camera_controller(
    time: Res<Time>,
    keys: Res<ButtonInput<KeyCode>>,
    mouse_buttons: Res<ButtonInput<MouseButton>>,
    mut motion_evr: EventReader<MouseMotion>,
    mut scroll_evr: EventReader<MouseWheel>,
    mut rig: ResMut<CameraRig>,
    mut query: Query<(&mut Transform, &mut Projection, &mut CameraOrbit), With<MainCamera>>,
) {
    // 0) Clamp delta
    let mut dt = time.delta_secs();
    if dt > MAX_CAMERA_DT {
        dt = MAX_CAMERA_DT;
    }

    let Ok((mut tf, mut projection, mut orbit)) = query.single_mut() else { return };

    // 1) Gather this frame's input
    let mut pan = Vec2::ZERO;
    if keys.pressed(KeyCode::KeyW) {
        pan.y += 1.0;
    }
    if keys.pressed(KeyCode::KeyS) {
        pan.y -= 1.0;
    }
    if keys.pressed(KeyCode::KeyA) {
        pan.x -= 1.0;
    }
    if keys.pressed(KeyCode::KeyD) {
        pan.x += 1.0;
    }

    let mut zoom = 0.0;
    for ev in scroll_evr.read() {
        zoom += match ev.unit {
            MouseScrollUnit::Line => ev.y,
            MouseScrollUnit::Pixel => ev.y * 0.02,
        };
    }

    let mut look = Vec2::ZERO;
    if mouse_buttons.pressed(MouseButton::Middle) {
        for ev in motion_evr.read() {
            look += ev.delta;
        }
    }

    if pan == Vec2::ZERO && zoom == 0.0 && look == Vec2::ZERO {
        return;
    }

    // 2) Scripted transitions keep exclusive control of the camera; manual
    //    navigation only cancels the auto orbit.
    if rig.transition.is_some() {
        return;
    }
    rig.orbit = None;

    match rig.mode {
        CameraMode::Perspective => {
            *orbit = CameraOrbit::from_pose(tf.translation, rig.target);

            // Camera-relative ground-plane movement
            let forward = Vec2::new(-orbit.yaw.cos(), -orbit.yaw.sin());
            let right = Vec2::new(-forward.y, forward.x);
            let dir = forward * pan.y + right * pan.x;
            if dir != Vec2::ZERO {
                let delta = dir.normalize() * MOVE_SPEED * dt;
                orbit.focus.x += delta.x;
                orbit.focus.z += delta.y;
            }

            // Zoom
            orbit.radius = (orbit.radius - zoom * orbit.radius * 0.1).clamp(2.0, 20_000.0);

            // Orbit
            orbit.yaw += look.x * ROTATE_SPEED * dt;
            orbit.pitch = (orbit.pitch + look.y * ROTATE_SPEED * dt).clamp(
                -std::f32::consts::FRAC_PI_2 + 0.01,
                std::f32::consts::FRAC_PI_2 - 0.01,
            );

            // Position camera
            let xz_radius = orbit.radius * orbit.pitch.cos();
            tf.translation = orbit.focus
                + Vec3::new(
                    xz_radius * orbit.yaw.cos(),
                    orbit.radius * orbit.pitch.sin(),
                    xz_radius * orbit.yaw.sin(),
                );
            tf.look_at(orbit.focus, Vec3::Y);
            rig.target = orbit.focus;
        }
        CameraMode::Orthographic => {
            // Axis views keep their viewing direction: pan slides the view
            // plane and the wheel zooms the fixed extent.
            let right = *tf.right();
            let up = *tf.up();
            let delta = (right * pan.x + up * pan.y) * MOVE_SPEED * dt;
            tf.translation += delta;
            rig.target += delta;

            if zoom != 0.0 {
                if let Projection::Orthographic(o) = &mut *projection {
                    if let ScalingMode::Fixed { width, height } = o.scaling_mode {
                        let f = (1.0 - zoom * 0.1).clamp(0.2, 5.0);
                        o.scaling_mode = ScalingMode::Fixed {
                            width: (width * f).max(0.1),
                            height: (height * f).max(0.1),
                        };
                    }
                }
            }
        }
    }
}

// ---------- Picking ----------

/// Cursor picking against bounding spheres: direct nodes by their transform,
/// batched instances by their slot record. Nearest hit wins.
pub fn pick_hover_target(
    windows: Query<&Window, With<PrimaryWindow>>,
    q_cam: Query<(&Camera, &GlobalTransform), With<MainCamera>>,
    q_world: Query<(&WorldObject, &GlobalTransform)>,
    q_batch: Query<&InstanceBatch>,
    mut hover: ResMut<HoverTarget>,
) {
    let Ok(window) = windows.single() else { return };
    let Some(cursor) = window.cursor_position() else {
        hover.id = None;
        return;
    };
    let Ok((camera, cam_gt)) = q_cam.single() else { return };
    let Ok(ray) = camera.viewport_to_world(cam_gt, cursor) else {
        hover.id = None;
        return;
    };

    let mut best: Option<(f32, EntityId)> = None;
    for (obj, gt) in q_world.iter() {
        let radius = gt.scale().abs().max_element().max(0.5);
        if let Some(t) = ray_sphere(&ray, gt.translation(), radius) {
            if best.is_none_or(|(bt, _)| t < bt) {
                best = Some((t, obj.id));
            }
        }
    }
    for batch in q_batch.iter() {
        for rec in &batch.records {
            // Only what is actually on screen is pickable.
            if rec.manually_hidden || rec.current_intensity <= 0.0 {
                continue;
            }
            let radius = rec.bounding_radius().max(0.25);
            if let Some(t) = ray_sphere(&ray, rec.transform.translation, radius) {
                if best.is_none_or(|(bt, _)| t < bt) {
                    best = Some((t, rec.id));
                }
            }
        }
    }
    hover.id = best.map(|(_, id)| id);
}

fn ray_sphere(ray: &Ray3d, center: Vec3, radius: f32) -> Option<f32> {
    let oc = center - ray.origin;
    let t_mid = oc.dot(*ray.direction);
    if t_mid < 0.0 {
        return None;
    }
    let d2 = oc.length_squared() - t_mid * t_mid;
    let r2 = radius * radius;
    if d2 > r2 {
        return None;
    }
    Some(t_mid - (r2 - d2).sqrt())
}

// ---------- Selection + drag ----------

pub fn select_on_click(
    mouse_buttons: Res<ButtonInput<MouseButton>>,
    tool: Res<ToolMode>,
    hover: Res<HoverTarget>,
    selection: Res<Selection>,
    mut requests: EventWriter<SetSelection>,
) {
    if !mouse_buttons.just_pressed(MouseButton::Left) {
        return;
    }
    match *tool {
        // Clicking empty space with the select tool deselects.
        ToolMode::Select => {
            requests.write(SetSelection(hover.id));
        }
        // Transform tools only retarget on a real hit; a miss starts a drag on
        // the current selection instead.
        _ => {
            if hover.id.is_some() && hover.id != selection.current {
                requests.write(SetSelection(hover.id));
            }
        }
    }
}

/// Left-drag with a transform tool manipulates the selected node (or its
/// proxy, for batched instances). The commit back into the slot record happens
/// on `DragEnded`, before the scheduler pass of the same frame.
#[allow(clippy::too_many_arguments)]
pub fn drag_selected(
    tool: Res<ToolMode>,
    mouse_buttons: Res<ButtonInput<MouseButton>>,
    mut motion_evr: EventReader<MouseMotion>,
    selection: Res<Selection>,
    registry: Res<EntityRegistry>,
    proxies: Res<ActiveProxies>,
    q_cam: Query<&GlobalTransform, With<MainCamera>>,
    mut q_transform: Query<&mut Transform>,
    mut drag_ended: EventWriter<DragEnded>,
    mut dragging: Local<bool>,
) {
    if *tool == ToolMode::Select {
        return;
    }
    if mouse_buttons.just_released(MouseButton::Left) && *dragging {
        *dragging = false;
        drag_ended.write(DragEnded);
        return;
    }
    if !mouse_buttons.pressed(MouseButton::Left) {
        return;
    }

    let mut delta = Vec2::ZERO;
    for ev in motion_evr.read() {
        delta += ev.delta;
    }
    if delta == Vec2::ZERO {
        return;
    }

    let Some(id) = selection.current else { return };
    let target = match resolve_interactive(&registry, &proxies, id) {
        Some(Resolved::Direct(e)) | Some(Resolved::Proxy { entity: e, .. }) => e,
        _ => return,
    };
    let Ok(cam) = q_cam.single() else { return };
    let Ok(mut tf) = q_transform.get_mut(target) else { return };

    match *tool {
        ToolMode::Move => {
            // Slide in the camera-facing plane, scaled with depth so a pixel
            // of mouse travel covers the same screen distance at any range.
            let right = cam.rotation() * Vec3::X;
            let up = cam.rotation() * Vec3::Y;
            let depth = (tf.translation - cam.translation()).length().max(1.0);
            tf.translation += (right * delta.x - up * delta.y) * depth * 0.002;
        }
        ToolMode::Rotate => {
            tf.rotate_y(-delta.x * 0.01);
        }
        ToolMode::Scale => {
            let f = (1.0 - delta.y * 0.01).clamp(0.5, 2.0);
            tf.scale = (tf.scale * f).max(Vec3::splat(MIN_SCALE));
        }
        ToolMode::Select => {}
    }
    *dragging = true;
}

// ---------- Shortcuts ----------

/// Local keyboard shortcuts for the same requests the external UI can send.
pub fn editor_shortcuts(
    keys: Res<ButtonInput<KeyCode>>,
    selection: Res<Selection>,
    mut tool: EventWriter<SetToolMode>,
    mut toggle: EventWriter<ToggleCameraMode>,
    mut axis: EventWriter<SetAxisView>,
    mut focus: EventWriter<FocusObject>,
    mut frame: EventWriter<FrameScene>,
) {
    if keys.just_pressed(KeyCode::Digit1) {
        tool.write(SetToolMode(ToolMode::Select));
    }
    if keys.just_pressed(KeyCode::Digit2) {
        tool.write(SetToolMode(ToolMode::Move));
    }
    if keys.just_pressed(KeyCode::Digit3) {
        tool.write(SetToolMode(ToolMode::Rotate));
    }
    if keys.just_pressed(KeyCode::Digit4) {
        tool.write(SetToolMode(ToolMode::Scale));
    }
    if keys.just_pressed(KeyCode::Tab) {
        toggle.write(ToggleCameraMode);
    }
    if keys.just_pressed(KeyCode::KeyX) {
        axis.write(SetAxisView(Axis::X));
    }
    if keys.just_pressed(KeyCode::KeyY) {
        axis.write(SetAxisView(Axis::Y));
    }
    if keys.just_pressed(KeyCode::KeyZ) {
        axis.write(SetAxisView(Axis::Z));
    }
    if keys.just_pressed(KeyCode::KeyF) {
        match selection.current {
            Some(id) => {
                focus.write(FocusObject(id));
            }
            None => {
                frame.write(FrameScene);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orbit_pose_round_trips() {
        let focus = Vec3::new(10.0, 2.0, -4.0);
        let position = Vec3::new(40.0, 32.0, 26.0);
        let orbit = CameraOrbit::from_pose(position, focus);
        let xz = orbit.radius * orbit.pitch.cos();
        let rebuilt = focus
            + Vec3::new(
                xz * orbit.yaw.cos(),
                orbit.radius * orbit.pitch.sin(),
                xz * orbit.yaw.sin(),
            );
        assert!((rebuilt - position).length() < 1e-3);
    }

    #[test]
    fn ray_sphere_hits_front_spheres_only() {
        let ray = Ray3d::new(Vec3::ZERO, Dir3::Z);
        assert!(ray_sphere(&ray, Vec3::new(0.0, 0.0, 10.0), 1.0).is_some());
        // Behind the origin
        assert!(ray_sphere(&ray, Vec3::new(0.0, 0.0, -10.0), 1.0).is_none());
        // Off to the side, outside the radius
        assert!(ray_sphere(&ray, Vec3::new(5.0, 0.0, 10.0), 1.0).is_none());
        // Nearer spheres report smaller t.
        let near = ray_sphere(&ray, Vec3::new(0.0, 0.0, 5.0), 1.0).unwrap();
        let far = ray_sphere(&ray, Vec3::new(0.0, 0.0, 10.0), 1.0).unwrap();
        assert!(near < far);
    }
}
