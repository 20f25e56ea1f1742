// src/world/proxy.rs
//! Proxy selection controller.
//!
//! A batched instance cannot be outlined or dragged on its own, so picking one
//! materializes a proxy: a short-lived node built from the batch's shared shape
//! template, carrying the instance's EntityId. Downstream code (outline pass,
//! gizmo, drag, label) treats it exactly like a direct node. On drag end or
//! when selection moves away, the proxy pose is committed back into the slot
//! record and the slot is queued for rewrite on the next scheduler pass.

use bevy::prelude::*;

use crate::api::{SelectionChanged, SetSelection, TransformPath, UpdateTransformRequest};
use crate::render::OutlineAssets;
use crate::setup::MainCamera;
use crate::world::batches::{BillboardShapes, InstanceBatch, InstanceRecord};
use crate::world::core::{sanitize_scale, EntityId};
use crate::world::registry::{EntityRef, EntityRegistry};

/// Proxies render marginally larger than their instance so the selection
/// outline never z-fights the billboard underneath.
pub const PROXY_SCALE: f32 = 1.05;

// ---------- State ----------

#[derive(Clone, Copy, Debug)]
pub struct ProxyHandle {
    pub entity: Entity,
    pub id: EntityId,
    pub batch: Entity,
    pub slot: usize,
}

/// At most one selection proxy and one hover proxy exist at any time.
#[derive(Resource, Default)]
pub struct ActiveProxies {
    pub selection: Option<ProxyHandle>,
    pub hover: Option<ProxyHandle>,
}

#[derive(Resource, Default)]
pub struct Selection {
    pub current: Option<EntityId>,
}

/// Written by cursor picking each frame; consumed by the hover system.
#[derive(Resource, Default)]
pub struct HoverTarget {
    pub id: Option<EntityId>,
}

/// Raised by the drag handler when the user releases a transform drag.
#[derive(Event, Clone, Copy, Debug)]
pub struct DragEnded;

// ---------- Components ----------

#[derive(Component, Clone, Copy)]
pub struct InstanceProxy {
    pub id: EntityId,
    pub batch: Entity,
    pub slot: usize,
}

#[derive(Component)]
pub struct SelectionProxy;

#[derive(Component)]
pub struct HoverProxy;

/// Marker on a directly-selected node.
#[derive(Component)]
pub struct Selected;

/// Outline shell spawned as a child of a directly-selected node.
#[derive(Component)]
pub struct OutlineShell;

/// Proxies are flat billboards; keep them facing the camera.
#[derive(Component)]
pub struct FaceCamera;

// ---------- Resolver ----------

/// Interactive resolution, proxy-aware: call sites that would otherwise treat
/// a proxy as persistent state get an explicit `Proxy` variant instead.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Resolved {
    Direct(Entity),
    Instance { batch: Entity, slot: usize },
    Proxy { entity: Entity, batch: Entity, slot: usize },
}

pub fn resolve_interactive(
    registry: &EntityRegistry,
    proxies: &ActiveProxies,
    id: EntityId,
) -> Option<Resolved> {
    match registry.resolve(id)? {
        EntityRef::Direct(e) => Some(Resolved::Direct(e)),
        EntityRef::Instance { batch, slot } => {
            for handle in [proxies.selection, proxies.hover].into_iter().flatten() {
                if handle.id == id {
                    return Some(Resolved::Proxy { entity: handle.entity, batch, slot });
                }
            }
            Some(Resolved::Instance { batch, slot })
        }
    }
}

// ---------- Commit ----------

/// Decompose the proxy's pose back into the record's authoritative transform.
/// The proxy's inflation factor is divided back out of the scale.
pub fn commit_proxy_pose(proxy_transform: &Transform, rec: &mut InstanceRecord) {
    rec.transform = Transform {
        translation: proxy_transform.translation,
        rotation: proxy_transform.rotation,
        scale: sanitize_scale(proxy_transform.scale / PROXY_SCALE),
    };
}

fn proxy_transform_for(rec: &InstanceRecord) -> Transform {
    Transform {
        translation: rec.transform.translation,
        rotation: rec.transform.rotation,
        scale: rec.transform.scale * PROXY_SCALE,
    }
}

fn teardown_proxy(
    commands: &mut Commands,
    handle: ProxyHandle,
    commit: bool,
    q_transform: &Query<&Transform, With<InstanceProxy>>,
    q_batch: &mut Query<&mut InstanceBatch>,
) {
    if commit {
        if let (Ok(tf), Ok(mut batch)) = (q_transform.get(handle.entity), q_batch.get_mut(handle.batch)) {
            if let Some(rec) = batch.records.get_mut(handle.slot) {
                commit_proxy_pose(tf, rec);
            }
            batch.invalidate_slot(handle.slot);
        }
    }
    commands.entity(handle.entity).try_despawn();
}

fn spawn_proxy(
    commands: &mut Commands,
    shapes: &BillboardShapes,
    material: Handle<StandardMaterial>,
    id: EntityId,
    batch_entity: Entity,
    slot: usize,
    batch: &InstanceBatch,
) -> Option<ProxyHandle> {
    let rec = batch.records.get(slot)?;
    let entity = commands
        .spawn((
            InstanceProxy { id, batch: batch_entity, slot },
            FaceCamera,
            Name::new(rec.name.clone()),
            // Same shared template mesh as the batch, so the outline's
            // silhouette matches the instance exactly.
            Mesh3d(shapes.mesh(batch.shape)),
            MeshMaterial3d(material),
            proxy_transform_for(rec),
            GlobalTransform::default(),
            Visibility::Visible,
        ))
        .id();
    Some(ProxyHandle { entity, id, batch: batch_entity, slot })
}

/// Drop every piece of interaction state when the scene is repopulated: both
/// proxies (their slots are about to stop existing, so no commit), the hover
/// target, and the selection. Returns the proxy entities to despawn and
/// whether a selection was actually cleared (so the caller can notify).
pub fn reset_interaction_state(
    selection: &mut Selection,
    hover: &mut HoverTarget,
    proxies: &mut ActiveProxies,
) -> (Vec<Entity>, bool) {
    let doomed = [proxies.selection.take(), proxies.hover.take()]
        .into_iter()
        .flatten()
        .map(|h| h.entity)
        .collect();
    hover.id = None;
    let had_selection = selection.current.take().is_some();
    (doomed, had_selection)
}

// ---------- Systems ----------

pub fn apply_selection_requests(
    mut commands: Commands,
    mut events: EventReader<SetSelection>,
    mut selection: ResMut<Selection>,
    mut proxies: ResMut<ActiveProxies>,
    registry: Res<EntityRegistry>,
    shapes: Res<BillboardShapes>,
    outlines: Res<OutlineAssets>,
    mut q_batch: Query<&mut InstanceBatch>,
    q_proxy_tf: Query<&Transform, With<InstanceProxy>>,
    q_selected: Query<Entity, With<Selected>>,
    q_shells: Query<Entity, With<OutlineShell>>,
    q_mesh: Query<&Mesh3d>,
    mut changed: EventWriter<SelectionChanged>,
) {
    for request in events.read() {
        // Missing references resolve to a deselect, never an error.
        let resolved = request.0.and_then(|id| registry.resolve(id).map(|r| (id, r)));
        let next = resolved.map(|(id, _)| id);
        if selection.current == next {
            continue;
        }

        // Tear down whatever the previous selection materialized.
        if let Some(handle) = proxies.selection.take() {
            teardown_proxy(&mut commands, handle, true, &q_proxy_tf, &mut q_batch);
        }
        for e in q_selected.iter() {
            commands.entity(e).remove::<Selected>();
        }
        for e in q_shells.iter() {
            commands.entity(e).try_despawn();
        }

        match resolved {
            Some((_, EntityRef::Direct(node))) => {
                commands.entity(node).insert(Selected);
                // Outline shell: same mesh, inflated, outline material. Nodes
                // without their own mesh (scene roots) get no shell.
                if let Ok(mesh) = q_mesh.get(node) {
                    let shell = commands
                        .spawn((
                            OutlineShell,
                            Mesh3d(mesh.0.clone()),
                            MeshMaterial3d(outlines.selection.clone()),
                            Transform::from_scale(Vec3::splat(outlines.params.shell_scale)),
                            GlobalTransform::default(),
                            Visibility::Inherited,
                        ))
                        .id();
                    commands.entity(node).add_child(shell);
                }
            }
            Some((id, EntityRef::Instance { batch, slot })) => {
                // Selection wins over hover: never two proxies for one id.
                if let Some(handle) = proxies.hover.take_if(|h| h.id == id) {
                    teardown_proxy(&mut commands, handle, false, &q_proxy_tf, &mut q_batch);
                }
                if let Ok(b) = q_batch.get(batch) {
                    proxies.selection = spawn_proxy(
                        &mut commands,
                        &shapes,
                        outlines.selection.clone(),
                        id,
                        batch,
                        slot,
                        b,
                    );
                }
            }
            None => {}
        }

        selection.current = next;
        changed.write(SelectionChanged(next));
    }
}

pub fn update_hover_proxy(
    mut commands: Commands,
    hover: Res<HoverTarget>,
    selection: Res<Selection>,
    mut proxies: ResMut<ActiveProxies>,
    registry: Res<EntityRegistry>,
    shapes: Res<BillboardShapes>,
    outlines: Res<OutlineAssets>,
    mut q_batch: Query<&mut InstanceBatch>,
    q_proxy_tf: Query<&Transform, With<InstanceProxy>>,
) {
    // Hovering the current selection creates no hover proxy; the selection
    // outline takes precedence.
    let wanted = hover.id.filter(|id| selection.current != Some(*id));
    if proxies.hover.map(|h| h.id) == wanted {
        return;
    }
    if let Some(handle) = proxies.hover.take() {
        teardown_proxy(&mut commands, handle, false, &q_proxy_tf, &mut q_batch);
    }
    let Some(id) = wanted else { return };
    let Some(EntityRef::Instance { batch, slot }) = registry.resolve(id) else {
        return;
    };
    if let Ok(b) = q_batch.get(batch) {
        proxies.hover =
            spawn_proxy(&mut commands, &shapes, outlines.hover.clone(), id, batch, slot, b);
    }
}

/// Drag end: write the selection proxy's pose through to the slot record and
/// queue the slot rewrite, before the scheduler pass runs this frame.
pub fn commit_on_drag_end(
    mut events: EventReader<DragEnded>,
    proxies: Res<ActiveProxies>,
    q_proxy_tf: Query<&Transform, With<InstanceProxy>>,
    mut q_batch: Query<&mut InstanceBatch>,
) {
    if events.read().next().is_none() {
        return;
    }
    let Some(handle) = proxies.selection else { return };
    let (Ok(tf), Ok(mut batch)) = (q_proxy_tf.get(handle.entity), q_batch.get_mut(handle.batch))
    else {
        return;
    };
    if let Some(rec) = batch.records.get_mut(handle.slot) {
        commit_proxy_pose(tf, rec);
    }
    batch.invalidate_slot(handle.slot);
}

/// Debounced property-editor writes from the external UI: write through to the
/// node or record immediately, keeping any live proxy in sync.
pub fn apply_transform_updates(
    mut events: EventReader<UpdateTransformRequest>,
    registry: Res<EntityRegistry>,
    proxies: Res<ActiveProxies>,
    mut q_batch: Query<&mut InstanceBatch>,
    mut q_transform: Query<&mut Transform>,
) {
    for req in events.read() {
        let Some(entity_ref) = registry.resolve(req.id) else {
            warn!("Transform update for unknown entity {:?}; ignoring", req.id);
            continue;
        };
        match entity_ref {
            EntityRef::Direct(node) => {
                if let Ok(mut tf) = q_transform.get_mut(node) {
                    apply_path(&mut tf, req.path, req.value);
                }
            }
            EntityRef::Instance { batch, slot } => {
                if let Ok(mut b) = q_batch.get_mut(batch) {
                    if let Some(rec) = b.records.get_mut(slot) {
                        apply_path(&mut rec.transform, req.path, req.value);
                        rec.transform.scale = sanitize_scale(rec.transform.scale);
                    }
                    b.invalidate_slot(slot);
                }
                for handle in [proxies.selection, proxies.hover].into_iter().flatten() {
                    if handle.id == req.id {
                        if let Ok(mut tf) = q_transform.get_mut(handle.entity) {
                            apply_path(&mut tf, req.path, req.value);
                            if req.path == TransformPath::Scale {
                                tf.scale *= PROXY_SCALE;
                            }
                        }
                    }
                }
            }
        }
    }
}

fn apply_path(tf: &mut Transform, path: TransformPath, value: Vec3) {
    match path {
        TransformPath::Position => tf.translation = value,
        TransformPath::Rotation => {
            tf.rotation = Quat::from_euler(EulerRot::XYZ, value.x, value.y, value.z)
        }
        TransformPath::Scale => tf.scale = sanitize_scale(value),
    }
}

/// Keep proxy billboards facing the active camera.
pub fn orient_proxies(
    q_cam: Query<&GlobalTransform, With<MainCamera>>,
    mut q_proxy: Query<&mut Transform, With<FaceCamera>>,
) {
    let Ok(cam) = q_cam.single() else { return };
    let cam_pos = cam.translation();
    for mut tf in q_proxy.iter_mut() {
        let dir = (cam_pos - tf.translation).normalize_or_zero();
        if dir != Vec3::ZERO {
            tf.rotation = Quat::from_rotation_arc(Vec3::Z, dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::batches::InstanceRecord;
    use crate::world::registry::EntityKindTag;

    fn record() -> InstanceRecord {
        InstanceRecord {
            id: EntityId(42),
            name: "vega".into(),
            transform: Transform::from_xyz(1.0, 2.0, 3.0),
            color: [1.0; 3],
            base_intensity: 0.3,
            peak_intensity: 1.0,
            luminosity: 1.0,
            brightness: 1.0,
            manually_hidden: false,
            current_intensity: 0.5,
            visible: true,
        }
    }

    #[test]
    fn proxy_scale_keeps_outline_clear_of_the_instance() {
        assert!(PROXY_SCALE > 1.0);
    }

    #[test]
    fn commit_round_trips_the_dragged_pose() {
        let mut rec = record();
        let mut proxy_tf = proxy_transform_for(&rec);
        // Drag the proxy somewhere else and spin it.
        proxy_tf.translation = Vec3::new(-4.0, 9.0, 0.5);
        proxy_tf.rotation = Quat::from_rotation_y(1.1);
        proxy_tf.scale = Vec3::splat(3.0) * PROXY_SCALE;

        commit_proxy_pose(&proxy_tf, &mut rec);
        assert!((rec.transform.translation - proxy_tf.translation).length() < 1e-5);
        assert!((rec.transform.scale - Vec3::splat(3.0)).length() < 1e-4);
        // Re-materializing the proxy reproduces the committed pose.
        let again = proxy_transform_for(&rec);
        assert!((again.scale - proxy_tf.scale).length() < 1e-4);
    }

    #[test]
    fn repopulation_reset_clears_selection_and_proxies() {
        let batch = Entity::from_raw(5);
        let mut selection = Selection { current: Some(EntityId(2)) };
        let mut hover = HoverTarget { id: Some(EntityId(3)) };
        let mut proxies = ActiveProxies {
            selection: Some(ProxyHandle {
                entity: Entity::from_raw(90),
                id: EntityId(2),
                batch,
                slot: 0,
            }),
            hover: Some(ProxyHandle {
                entity: Entity::from_raw(91),
                id: EntityId(3),
                batch,
                slot: 1,
            }),
        };

        let (doomed, had_selection) =
            reset_interaction_state(&mut selection, &mut hover, &mut proxies);
        assert_eq!(doomed, vec![Entity::from_raw(90), Entity::from_raw(91)]);
        assert!(had_selection);
        assert!(selection.current.is_none());
        assert!(hover.id.is_none());
        assert!(proxies.selection.is_none() && proxies.hover.is_none());

        // Already-clean state stays a no-op, with nothing to notify.
        let (doomed, had_selection) =
            reset_interaction_state(&mut selection, &mut hover, &mut proxies);
        assert!(doomed.is_empty());
        assert!(!had_selection);
    }

    #[test]
    fn resolver_reports_proxies_explicitly() {
        let mut registry = EntityRegistry::default();
        let batch = Entity::from_raw(5);
        registry.insert_direct(EntityId(1), Entity::from_raw(9), EntityKindTag::Model);
        registry.insert_instance(EntityId(2), batch, 7);

        let mut proxies = ActiveProxies::default();
        assert_eq!(
            resolve_interactive(&registry, &proxies, EntityId(2)),
            Some(Resolved::Instance { batch, slot: 7 })
        );
        proxies.selection = Some(ProxyHandle {
            entity: Entity::from_raw(99),
            id: EntityId(2),
            batch,
            slot: 7,
        });
        assert_eq!(
            resolve_interactive(&registry, &proxies, EntityId(2)),
            Some(Resolved::Proxy { entity: Entity::from_raw(99), batch, slot: 7 })
        );
        assert_eq!(resolve_interactive(&registry, &proxies, EntityId(3)), None);
    }
}
