// src/world/registry.rs
//! Canonical identity table: maps every persistent EntityId to either a direct
//! scene-graph node or a (batch, slot) instance reference, and publishes a
//! name-sorted snapshot of the world for the external entity panel.

use bevy::prelude::*;
use std::collections::HashMap;

use crate::api::{RenameRequest, SetGroupBrightness, SetGroupVisibility};
use crate::world::batches::{InstanceBatch, InstanceBatches};
use crate::world::core::EntityId;
use crate::world::proxy::ActiveProxies;
use crate::world::scheduler::{EmissiveFade, ModelFade};

// ---------- Identity ----------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityRef {
    Direct(Entity),
    Instance { batch: Entity, slot: usize },
}

/// Coarse kind tag kept alongside the reference, for the snapshot and for
/// group operations. (The full ObjectKind stays with the spawned node.)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityKindTag {
    Primitive,
    Light,
    Camera,
    Model,
    Planet,
    Celestial,
}

#[derive(Resource, Default)]
pub struct EntityRegistry {
    refs: HashMap<EntityId, EntityRef>,
    kinds: HashMap<EntityId, EntityKindTag>,
    /// Structural change since the last published snapshot.
    dirty: bool,
}

impl EntityRegistry {
    pub fn insert_direct(&mut self, id: EntityId, entity: Entity, kind: EntityKindTag) {
        self.refs.insert(id, EntityRef::Direct(entity));
        self.kinds.insert(id, kind);
        self.dirty = true;
    }

    pub fn insert_instance(&mut self, id: EntityId, batch: Entity, slot: usize) {
        self.refs.insert(id, EntityRef::Instance { batch, slot });
        self.kinds.insert(id, EntityKindTag::Celestial);
        self.dirty = true;
    }

    /// Missing ids resolve to None; interactions treat that as a deselect.
    pub fn resolve(&self, id: EntityId) -> Option<EntityRef> {
        self.refs.get(&id).copied()
    }

    pub fn kind(&self, id: EntityId) -> Option<EntityKindTag> {
        self.kinds.get(&id).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = (EntityId, EntityRef)> + '_ {
        self.refs.iter().map(|(id, r)| (*id, *r))
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Flag a non-structural edit (rename) that still invalidates the snapshot.
    pub fn mark_changed(&mut self) {
        self.dirty = true;
    }

    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    fn reset(&mut self) {
        self.refs.clear();
        self.kinds.clear();
        self.dirty = true;
    }
}

/// Scene clear: despawn every registered direct node and every batch entity,
/// dropping per-batch meshes. System objects (editor cameras, ambient light)
/// are never registered, so they survive; the shared billboard shape meshes and
/// the cached glow texture are singletons owned by `BillboardShapes` and must
/// not be touched here.
pub fn clear_world(
    commands: &mut Commands,
    registry: &mut EntityRegistry,
    batches: &mut InstanceBatches,
    meshes: &mut Assets<Mesh>,
    q_batch: &Query<&mut InstanceBatch>,
) {
    for (_, entity_ref) in registry.ids() {
        if let EntityRef::Direct(e) = entity_ref {
            commands.entity(e).try_despawn();
        }
    }
    for (_, batch_entity) in batches.by_key.drain() {
        if let Ok(batch) = q_batch.get(batch_entity) {
            // Owned exclusively by this batch; shared templates live elsewhere.
            meshes.remove(&batch.mesh);
        }
        commands.entity(batch_entity).try_despawn();
    }
    registry.reset();
}

// ---------- Rename ----------

/// Renames update the in-scene name only, never the external record. Instance
/// renames go to the slot record (and any live proxy label); direct renames go
/// to the node's `Name`.
pub fn apply_rename_requests(
    mut events: EventReader<RenameRequest>,
    mut registry: ResMut<EntityRegistry>,
    proxies: Res<ActiveProxies>,
    mut q_batch: Query<&mut InstanceBatch>,
    mut q_name: Query<&mut Name>,
) {
    for RenameRequest { id, name } in events.read() {
        let Some(entity_ref) = registry.resolve(*id) else {
            warn!("Rename for unknown entity {id:?}; ignoring");
            continue;
        };
        match entity_ref {
            EntityRef::Direct(e) => {
                if let Ok(mut n) = q_name.get_mut(e) {
                    n.set(name.clone());
                }
            }
            EntityRef::Instance { batch, slot } => {
                if let Ok(mut b) = q_batch.get_mut(batch) {
                    if let Some(rec) = b.records.get_mut(slot) {
                        rec.name = name.clone();
                    }
                }
                for proxy in [proxies.selection, proxies.hover].into_iter().flatten() {
                    if proxy.id == *id {
                        if let Ok(mut n) = q_name.get_mut(proxy.entity) {
                            n.set(name.clone());
                        }
                    }
                }
            }
        }
        registry.mark_changed();
    }
}

// ---------- Group operations ----------

/// Bulk hide/show from the entity-group panel. Direct nodes toggle their
/// `Visibility`; instances set `manually_hidden` and get their slot blanked on
/// the next scheduler pass.
pub fn apply_group_visibility(
    mut events: EventReader<SetGroupVisibility>,
    registry: Res<EntityRegistry>,
    mut q_batch: Query<&mut InstanceBatch>,
    mut q_visibility: Query<&mut Visibility>,
    mut q_model_fade: Query<&mut ModelFade>,
) {
    for ev in events.read() {
        for id in &ev.ids {
            match registry.resolve(*id) {
                Some(EntityRef::Direct(e)) => {
                    if let Ok(mut vis) = q_visibility.get_mut(e) {
                        *vis = if ev.visible { Visibility::Inherited } else { Visibility::Hidden };
                    }
                    // Keep the distance fade from re-showing a hidden model.
                    if let Ok(mut fade) = q_model_fade.get_mut(e) {
                        fade.manually_hidden = !ev.visible;
                    }
                }
                Some(EntityRef::Instance { batch, slot }) => {
                    if let Ok(mut b) = q_batch.get_mut(batch) {
                        if let Some(rec) = b.records.get_mut(slot) {
                            rec.manually_hidden = !ev.visible;
                        }
                        b.invalidate_slot(slot);
                    }
                }
                None => {}
            }
        }
    }
}

/// Bulk dimming, independent of distance fade. Instances scale through the
/// record's brightness factor; direct emissive bodies through their fade.
pub fn apply_group_brightness(
    mut events: EventReader<SetGroupBrightness>,
    registry: Res<EntityRegistry>,
    mut q_batch: Query<&mut InstanceBatch>,
    mut q_fade: Query<&mut EmissiveFade>,
) {
    for ev in events.read() {
        let brightness = ev.brightness.clamp(0.0, 1.0);
        for id in &ev.ids {
            match registry.resolve(*id) {
                Some(EntityRef::Direct(e)) => {
                    if let Ok(mut fade) = q_fade.get_mut(e) {
                        fade.brightness = brightness;
                    }
                }
                Some(EntityRef::Instance { batch, slot }) => {
                    if let Ok(mut b) = q_batch.get_mut(batch) {
                        if let Some(rec) = b.records.get_mut(slot) {
                            rec.brightness = brightness;
                        }
                        b.invalidate_slot(slot);
                    }
                }
                None => {}
            }
        }
    }
}

// ---------- Scene index ----------

#[derive(Clone, Debug, PartialEq)]
pub struct SceneEntry {
    pub id: EntityId,
    pub name: String,
    pub kind: EntityKindTag,
}

/// Stable, name-sorted view for the external UI. Recomputed wholesale (not
/// diffed) and published one frame after the mutation, so the caller's own
/// render cycle never feeds back into ours.
#[derive(Resource, Default)]
pub struct SceneIndex {
    pub version: u64,
    pub entries: Vec<SceneEntry>,
}

#[derive(Event, Clone, Copy)]
pub struct SceneIndexChanged {
    pub version: u64,
}

pub fn sort_entries(entries: &mut Vec<SceneEntry>) {
    entries.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
}

pub fn publish_scene_index(
    mut registry: ResMut<EntityRegistry>,
    mut index: ResMut<SceneIndex>,
    q_name: Query<&Name>,
    q_batch: Query<&InstanceBatch>,
    mut changed: EventWriter<SceneIndexChanged>,
) {
    if !registry.take_dirty() {
        return;
    }
    let mut entries = Vec::with_capacity(registry.len());
    for (id, entity_ref) in registry.ids() {
        let kind = registry.kind(id).unwrap_or(EntityKindTag::Celestial);
        let name = match entity_ref {
            EntityRef::Direct(e) => q_name
                .get(e)
                .map(|n| n.as_str().to_owned())
                .unwrap_or_else(|_| format!("object-{}", id.0)),
            EntityRef::Instance { batch, slot } => q_batch
                .get(batch)
                .ok()
                .and_then(|b| b.records.get(slot))
                .map(|r| r.name.clone())
                .unwrap_or_else(|| format!("object-{}", id.0)),
        };
        entries.push(SceneEntry { id, name, kind });
    }
    sort_entries(&mut entries);
    index.entries = entries;
    index.version += 1;
    changed.write(SceneIndexChanged { version: index.version });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_round_trips_direct_and_instance_refs() {
        let mut reg = EntityRegistry::default();
        let node = Entity::from_raw(11);
        let batch = Entity::from_raw(22);
        reg.insert_direct(EntityId(1), node, EntityKindTag::Primitive);
        reg.insert_instance(EntityId(2), batch, 140);

        assert_eq!(reg.resolve(EntityId(1)), Some(EntityRef::Direct(node)));
        assert_eq!(
            reg.resolve(EntityId(2)),
            Some(EntityRef::Instance { batch, slot: 140 })
        );
        assert_eq!(reg.resolve(EntityId(3)), None);
        assert_eq!(reg.kind(EntityId(2)), Some(EntityKindTag::Celestial));
    }

    #[test]
    fn dirty_flag_is_set_by_mutation_and_consumed_once() {
        let mut reg = EntityRegistry::default();
        assert!(!reg.take_dirty());
        reg.insert_direct(EntityId(1), Entity::from_raw(1), EntityKindTag::Light);
        assert!(reg.take_dirty());
        assert!(!reg.take_dirty());
        reg.mark_changed();
        assert!(reg.take_dirty());
    }

    #[test]
    fn scene_entries_sort_by_name_then_id() {
        let mut entries = vec![
            SceneEntry { id: EntityId(9), name: "beta".into(), kind: EntityKindTag::Celestial },
            SceneEntry { id: EntityId(2), name: "alpha".into(), kind: EntityKindTag::Model },
            SceneEntry { id: EntityId(1), name: "beta".into(), kind: EntityKindTag::Celestial },
        ];
        sort_entries(&mut entries);
        assert_eq!(entries[0].name, "alpha");
        assert_eq!(entries[1].id, EntityId(1));
        assert_eq!(entries[2].id, EntityId(9));
    }
}
