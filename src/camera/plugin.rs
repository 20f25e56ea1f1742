use bevy::prelude::*;

use crate::camera::rig::{CameraModeChanged, CameraRig};
use crate::camera::systems::{handle_camera_requests, step_camera_transition};
use crate::EditorSet;

pub struct CameraRigPlugin;

impl Plugin for CameraRigPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<CameraRig>()
            .add_event::<CameraModeChanged>()
            .add_systems(
                Update,
                (handle_camera_requests, step_camera_transition)
                    .chain()
                    .in_set(EditorSet::Camera),
            );
    }
}
