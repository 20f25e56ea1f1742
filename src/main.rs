use bevy::prelude::*;
use bevy::render::{settings::WgpuSettings, RenderPlugin};

mod api;
mod camera;
mod input;
mod render;
mod setup;
mod world;

use api::ApiPlugin;
use camera::plugin::CameraRigPlugin;
use input::{camera_controller, drag_selected, editor_shortcuts, pick_hover_target, select_on_click};
use render::RenderStagePlugin;
use world::WorldPlugin;

/// Frame order: camera requests and navigation first, then interactions that
/// queue slot edits, then the fade pass that writes the batch meshes, then the
/// deferred publications to the outside.
#[derive(SystemSet, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EditorSet {
    Camera,
    Interact,
    Fade,
    Publish,
}

fn main() {
    // Start with Bevy's default settings, but raise the max 2D texture size to
    // 16K so stitched planet surfaces fit in one texture.
    let mut wgpu_settings = WgpuSettings::default();
    wgpu_settings.limits.max_texture_dimension_2d = 16_384;

    App::new()
        .add_plugins(DefaultPlugins.set(RenderPlugin {
            render_creation: wgpu_settings.into(),
            ..Default::default()
        }))
        .configure_sets(
            Update,
            (
                EditorSet::Camera,
                EditorSet::Interact,
                EditorSet::Fade,
                EditorSet::Publish,
            )
                .chain(),
        )
        .add_plugins((ApiPlugin, WorldPlugin, CameraRigPlugin, RenderStagePlugin))
        .add_systems(Startup, setup::setup)
        .add_systems(
            Update,
            (editor_shortcuts, camera_controller)
                .chain()
                .in_set(EditorSet::Camera)
                .before(camera::systems::handle_camera_requests),
        )
        .add_systems(
            Update,
            (pick_hover_target, select_on_click, drag_selected)
                .chain()
                .in_set(EditorSet::Interact)
                .before(world::proxy::apply_selection_requests),
        )
        .run();
}
