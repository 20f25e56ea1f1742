use bevy::prelude::*;

use crate::world::batches::{init_billboard_shapes, InstanceBatches};
use crate::world::loader::{
    load_manifest, monitor_manifest_ready, populate_scene, track_population_progress,
    PendingPopulate, WorldManifestHandle, WorldSettings,
};
use crate::world::manifest::WorldManifestAssetPlugin;
use crate::world::proxy::{
    apply_selection_requests, apply_transform_updates, commit_on_drag_end, orient_proxies,
    update_hover_proxy, ActiveProxies, DragEnded, HoverTarget, Selection,
};
use crate::world::registry::{
    apply_group_brightness, apply_group_visibility, apply_rename_requests, publish_scene_index,
    EntityRegistry, SceneIndex, SceneIndexChanged,
};
use crate::world::scheduler::{
    advance_instance_window, fade_emissive_nodes, fade_model_nodes, SchedulerConfig,
};
use crate::EditorSet;

pub struct WorldPlugin;

impl Plugin for WorldPlugin {
    fn build(&self, app: &mut App) {
        app.add_plugins(WorldManifestAssetPlugin)
            .init_resource::<EntityRegistry>()
            .init_resource::<InstanceBatches>()
            .init_resource::<Selection>()
            .init_resource::<HoverTarget>()
            .init_resource::<ActiveProxies>()
            .init_resource::<SceneIndex>()
            .init_resource::<SchedulerConfig>()
            .init_resource::<WorldSettings>()
            .init_resource::<WorldManifestHandle>()
            .init_resource::<PendingPopulate>()
            .add_event::<DragEnded>()
            .add_event::<SceneIndexChanged>()
            .add_systems(Startup, (init_billboard_shapes, load_manifest).chain())
            .add_systems(
                Update,
                (
                    monitor_manifest_ready,
                    populate_scene,
                    apply_selection_requests,
                    update_hover_proxy,
                    commit_on_drag_end,
                    apply_transform_updates,
                    apply_rename_requests,
                    apply_group_visibility,
                    apply_group_brightness,
                    orient_proxies,
                )
                    .chain()
                    .in_set(EditorSet::Interact),
            )
            // Every queued slot edit lands before the scheduler's pass, so the
            // mesh is rewritten exactly once this frame.
            .add_systems(
                Update,
                (advance_instance_window, fade_emissive_nodes, fade_model_nodes)
                    .in_set(EditorSet::Fade),
            )
            .add_systems(
                Update,
                (publish_scene_index, track_population_progress).in_set(EditorSet::Publish),
            );
    }
}
