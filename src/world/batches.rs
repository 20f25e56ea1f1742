// src/world/batches.rs
//! Instanced batch store for celestial billboards.
//! Groups same-material records into one batch entity holding a single merged
//! mesh; vertex range `slot * shape_verts .. (slot + 1) * shape_verts` belongs
//! to that slot. The scheduler rewrites visited slots in place through a
//! single mesh borrow per batch per frame.

use bevy::prelude::*;
use bevy::render::mesh::{Indices, Mesh, PrimitiveTopology, VertexAttributeValues};
use bevy::render::render_resource::{Extent3d, TextureDimension, TextureFormat};
use bevy::render::view::NoFrustumCulling;
use std::collections::HashMap;

use bevy::render::view::RenderLayers;

use crate::render::GLOW_LAYER;
use crate::world::core::{
    sanitize_color, sanitize_luminosity, BillboardShape, EntityId, MaterialKey, ObjectRecord,
};

pub const GLOW_TEXTURE_SIZE: u32 = 128;
pub const DISC_SEGMENTS: usize = 16;

// ---------- Shape templates ----------

/// Unit-space billboard geometry shared by every batch of that shape and by
/// every proxy. Vertices live in the XY plane, centered on the origin.
#[derive(Clone)]
pub struct ShapeTemplate {
    pub positions: Vec<Vec3>,
    pub uvs: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
}

impl ShapeTemplate {
    pub fn quad() -> Self {
        Self {
            positions: vec![
                Vec3::new(-0.5, -0.5, 0.0),
                Vec3::new(0.5, -0.5, 0.0),
                Vec3::new(0.5, 0.5, 0.0),
                Vec3::new(-0.5, 0.5, 0.0),
            ],
            uvs: vec![[0.0, 1.0], [1.0, 1.0], [1.0, 0.0], [0.0, 0.0]],
            indices: vec![0, 1, 2, 0, 2, 3],
        }
    }

    pub fn disc() -> Self {
        let mut positions = vec![Vec3::ZERO];
        let mut uvs = vec![[0.5, 0.5]];
        let mut indices = Vec::with_capacity(DISC_SEGMENTS * 3);
        for i in 0..DISC_SEGMENTS {
            let a = (i as f32 / DISC_SEGMENTS as f32) * std::f32::consts::TAU;
            let (s, c) = a.sin_cos();
            positions.push(Vec3::new(c * 0.5, s * 0.5, 0.0));
            uvs.push([0.5 + c * 0.5, 0.5 - s * 0.5]);
            let next = if i + 1 == DISC_SEGMENTS { 1 } else { i as u32 + 2 };
            indices.extend_from_slice(&[0, i as u32 + 1, next]);
        }
        Self { positions, uvs, indices }
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }
}

/// Process-wide singletons: shape templates, the proxy meshes built from them,
/// the cached radial-glow texture, and the default glow material. None of these
/// may ever be disposed when batches are cleared.
#[derive(Resource)]
pub struct BillboardShapes {
    pub quad: ShapeTemplate,
    pub disc: ShapeTemplate,
    pub quad_mesh: Handle<Mesh>,
    pub disc_mesh: Handle<Mesh>,
    pub glow_texture: Handle<Image>,
    pub glow_material: Handle<StandardMaterial>,
}

impl BillboardShapes {
    pub fn template(&self, shape: BillboardShape) -> &ShapeTemplate {
        match shape {
            BillboardShape::Quad => &self.quad,
            BillboardShape::Disc => &self.disc,
        }
    }

    pub fn mesh(&self, shape: BillboardShape) -> Handle<Mesh> {
        match shape {
            BillboardShape::Quad => self.quad_mesh.clone(),
            BillboardShape::Disc => self.disc_mesh.clone(),
        }
    }
}

/// Startup: build the shared templates, proxy meshes, and glow material once.
pub fn init_billboard_shapes(
    mut commands: Commands,
    mut meshes: ResMut<Assets<Mesh>>,
    mut materials: ResMut<Assets<StandardMaterial>>,
    mut images: ResMut<Assets<Image>>,
) {
    let quad = ShapeTemplate::quad();
    let disc = ShapeTemplate::disc();
    let quad_mesh = meshes.add(template_mesh(&quad));
    let disc_mesh = meshes.add(template_mesh(&disc));

    let glow_texture = images.add(radial_glow_image(GLOW_TEXTURE_SIZE));
    let glow_material = materials.add(StandardMaterial {
        base_color: Color::WHITE,
        base_color_texture: Some(glow_texture.clone()),
        unlit: true,
        alpha_mode: AlphaMode::Add,
        cull_mode: None,
        ..default()
    });

    commands.insert_resource(BillboardShapes {
        quad,
        disc,
        quad_mesh,
        disc_mesh,
        glow_texture,
        glow_material,
    });
}

/// A single standalone mesh of one template, used for selection proxies so the
/// outline silhouette matches the instance exactly.
fn template_mesh(t: &ShapeTemplate) -> Mesh {
    let mut mesh = Mesh::new(PrimitiveTopology::TriangleList, Default::default());
    mesh.insert_attribute(
        Mesh::ATTRIBUTE_POSITION,
        t.positions.iter().map(|p| p.to_array()).collect::<Vec<_>>(),
    );
    mesh.insert_attribute(Mesh::ATTRIBUTE_UV_0, t.uvs.clone());
    mesh.insert_indices(Indices::U32(t.indices.clone()));
    mesh
}

/// Procedural radial falloff sprite, generated once and cached.
fn radial_glow_image(size: u32) -> Image {
    let mut img = image::RgbaImage::new(size, size);
    let half = size as f32 * 0.5;
    for (x, y, px) in img.enumerate_pixels_mut() {
        let dx = (x as f32 + 0.5 - half) / half;
        let dy = (y as f32 + 0.5 - half) / half;
        let d = (dx * dx + dy * dy).sqrt();
        let a = (1.0 - d).clamp(0.0, 1.0).powf(2.2);
        let v = (a * 255.0) as u8;
        *px = image::Rgba([255, 255, 255, v]);
    }
    Image::new(
        Extent3d {
            width: size,
            height: size,
            depth_or_array_layers: 1,
        },
        TextureDimension::D2,
        img.into_raw(),
        TextureFormat::Rgba8UnormSrgb,
        Default::default(),
    )
}

// ---------- Instance records ----------

/// One slot of an instance batch. Exactly one of these exists per batched
/// EntityId, inside exactly one batch.
#[derive(Clone, Debug)]
pub struct InstanceRecord {
    pub id: EntityId,
    /// Mutable, independent of the external record; used for proxy labels.
    pub name: String,
    /// Authoritative pose; the billboard orientation is recomputed per frame.
    pub transform: Transform,
    pub color: [f32; 3],
    pub base_intensity: f32,
    pub peak_intensity: f32,
    pub luminosity: f32,
    /// Group-level dimming, independent of distance fade.
    pub brightness: f32,
    pub manually_hidden: bool,
    /// Smoothed render-time brightness; starts at zero so instances fade in.
    pub current_intensity: f32,
    /// Hysteresis latch: already-visible instances survive out to a larger
    /// distance than the one required to become visible.
    pub visible: bool,
}

impl InstanceRecord {
    pub fn from_record(rec: &ObjectRecord) -> Self {
        Self {
            id: rec.id,
            name: rec.name.clone(),
            transform: rec.transform(),
            color: sanitize_color(rec.color),
            base_intensity: rec.base_intensity.clamp(0.0, 16.0),
            peak_intensity: rec.peak_intensity.clamp(0.0, 16.0),
            luminosity: sanitize_luminosity(rec.luminosity),
            brightness: 1.0,
            manually_hidden: false,
            current_intensity: 0.0,
            visible: false,
        }
    }

    /// Bounding sphere radius for frustum tests, derived from scale.
    pub fn bounding_radius(&self) -> f32 {
        self.transform.scale.max_element() * 0.5
    }
}

// ---------- Batch component + index ----------

/// One GPU draw unit per (material key, shape) pair.
#[derive(Component)]
pub struct InstanceBatch {
    pub key: MaterialKey,
    pub shape: BillboardShape,
    /// Dense; index is the authoritative slot.
    pub records: Vec<InstanceRecord>,
    pub mesh: Handle<Mesh>,
    /// Scheduler resume point for the rotating window.
    pub cursor: usize,
    /// Slots whose pose/color were edited outside the scheduler (proxy commit,
    /// group ops). The scheduler is the only mesh writer; it drains these at
    /// the start of its pass, before the rotating window.
    pub pending_slots: Vec<usize>,
}

impl InstanceBatch {
    /// Queue a forced rewrite for one slot on the next scheduler pass.
    pub fn invalidate_slot(&mut self, slot: usize) {
        if !self.pending_slots.contains(&slot) {
            self.pending_slots.push(slot);
        }
    }
}

#[derive(Resource, Default)]
pub struct InstanceBatches {
    /// Quad and disc slots have different vertex counts, so batches of the
    /// same material but different shapes must never alias.
    pub by_key: HashMap<(MaterialKey, BillboardShape), Entity>,
    /// Per-texture batch materials, so re-populating a world reuses them.
    pub materials: HashMap<MaterialKey, Handle<StandardMaterial>>,
}

/// Create (or extend) the batch for `key` and append `records` to it, growing
/// the merged mesh. Returns the batch entity and the base slot of the appended
/// run; the caller registers each record's id as `(batch, base + i)`.
pub fn append_to_batch(
    commands: &mut Commands,
    meshes: &mut Assets<Mesh>,
    materials: &mut Assets<StandardMaterial>,
    asset_server: &AssetServer,
    shapes: &BillboardShapes,
    batches: &mut InstanceBatches,
    q_batch: &mut Query<&mut InstanceBatch>,
    key: MaterialKey,
    shape: BillboardShape,
    records: Vec<InstanceRecord>,
) -> (Entity, usize) {
    if let Some(&entity) = batches.by_key.get(&(key.clone(), shape)) {
        if let Ok(mut batch) = q_batch.get_mut(entity) {
            let base = batch.records.len();
            batch.records.extend(records);
            // Same handle, new contents; everything pointing at the batch mesh
            // (including the Mesh3d) keeps working.
            let rebuilt = build_batch_mesh(shapes.template(batch.shape), &batch.records);
            meshes.insert(&batch.mesh, rebuilt);
            return (entity, base);
        }
    }

    let material = batch_material(&key, materials, asset_server, shapes, batches);
    let mesh = meshes.add(build_batch_mesh(shapes.template(shape), &records));
    let count = records.len();
    let entity = commands
        .spawn((
            InstanceBatch {
                key: key.clone(),
                shape,
                records,
                mesh: mesh.clone(),
                cursor: 0,
                pending_slots: Vec::new(),
            },
            Name::new(format!("Batch {key:?}/{shape:?} ({count} slots)")),
            Transform::default(),
            GlobalTransform::default(),
            Visibility::Visible,
            Mesh3d(mesh),
            MeshMaterial3d(material),
            RenderLayers::layer(GLOW_LAYER),
            // Slot rewrites move vertices without touching the mesh AABB.
            NoFrustumCulling,
        ))
        .id();
    batches.by_key.insert((key, shape), entity);
    (entity, 0)
}

fn batch_material(
    key: &MaterialKey,
    materials: &mut Assets<StandardMaterial>,
    asset_server: &AssetServer,
    shapes: &BillboardShapes,
    batches: &mut InstanceBatches,
) -> Handle<StandardMaterial> {
    match key {
        MaterialKey::DefaultGlow => shapes.glow_material.clone(),
        MaterialKey::Texture(path) => batches
            .materials
            .entry(key.clone())
            .or_insert_with(|| {
                let tex: Handle<Image> = asset_server.load(path.as_str());
                materials.add(StandardMaterial {
                    base_color: Color::WHITE,
                    base_color_texture: Some(tex),
                    unlit: true,
                    alpha_mode: AlphaMode::Add,
                    cull_mode: None,
                    ..default()
                })
            })
            .clone(),
    }
}

/// Build the merged mesh for a batch: every slot gets the template's vertices
/// placed at its pose, with fully transparent vertex color (instances start
/// invisible and fade in under the scheduler).
pub fn build_batch_mesh(template: &ShapeTemplate, records: &[InstanceRecord]) -> Mesh {
    let verts = template.vertex_count();
    let n = records.len();
    let mut positions: Vec<[f32; 3]> = Vec::with_capacity(verts * n);
    let mut uvs: Vec<[f32; 2]> = Vec::with_capacity(verts * n);
    let mut colors: Vec<[f32; 4]> = Vec::with_capacity(verts * n);
    let mut indices: Vec<u32> = Vec::with_capacity(template.indices.len() * n);

    for (slot, rec) in records.iter().enumerate() {
        let t = &rec.transform;
        for p in &template.positions {
            let world = t.translation + *p * t.scale;
            positions.push(world.to_array());
            colors.push([0.0, 0.0, 0.0, 0.0]);
        }
        uvs.extend_from_slice(&template.uvs);
        let base = (slot * verts) as u32;
        indices.extend(template.indices.iter().map(|&i| i + base));
    }

    let mut mesh = Mesh::new(PrimitiveTopology::TriangleList, Default::default());
    mesh.insert_attribute(Mesh::ATTRIBUTE_POSITION, positions);
    mesh.insert_attribute(Mesh::ATTRIBUTE_UV_0, uvs);
    mesh.insert_attribute(Mesh::ATTRIBUTE_COLOR, colors);
    mesh.insert_indices(Indices::U32(indices));
    mesh
}

/// World-space corner positions for one slot: template vertices scaled by the
/// record's scale, oriented by `orientation`, at the record's translation.
/// Record rotation is ignored; billboards face the camera.
pub fn billboard_corners(template: &ShapeTemplate, transform: &Transform, orientation: Quat) -> Vec<Vec3> {
    template
        .positions
        .iter()
        .map(|p| transform.translation + orientation * (*p * transform.scale))
        .collect()
}

/// Rewrite one slot's vertex range. `corners` is skipped (positions untouched)
/// when the slot is writing a zero color.
pub fn write_slot(
    mesh: &mut Mesh,
    shape_verts: usize,
    slot: usize,
    corners: Option<&[Vec3]>,
    color: [f32; 4],
) {
    let start = slot * shape_verts;
    if let Some(corners) = corners {
        if let Some(VertexAttributeValues::Float32x3(pos)) =
            mesh.attribute_mut(Mesh::ATTRIBUTE_POSITION)
        {
            for (i, c) in corners.iter().enumerate().take(shape_verts) {
                if let Some(v) = pos.get_mut(start + i) {
                    *v = c.to_array();
                }
            }
        }
    }
    if let Some(VertexAttributeValues::Float32x4(col)) = mesh.attribute_mut(Mesh::ATTRIBUTE_COLOR)
    {
        let end = (start + shape_verts).min(col.len());
        for v in &mut col[start.min(end)..end] {
            *v = color;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::core::{EntityId, ObjectKind};

    fn record(id: u64, pos: [f32; 3]) -> ObjectRecord {
        ObjectRecord {
            id: EntityId(id),
            name: format!("star-{id}"),
            kind: ObjectKind::Celestial {
                texture: None,
                shape: BillboardShape::Quad,
                dominant: false,
            },
            position: pos,
            rotation: [0.0; 3],
            scale: [2.0, 2.0, 2.0],
            color: [1.0, 0.8, 0.6],
            base_intensity: 0.3,
            peak_intensity: 1.0,
            luminosity: 1.5,
            properties: Default::default(),
        }
    }

    #[test]
    fn quad_and_disc_batches_never_share_a_key() {
        let mut batches = InstanceBatches::default();
        batches
            .by_key
            .insert((MaterialKey::DefaultGlow, BillboardShape::Quad), Entity::from_raw(1));
        batches
            .by_key
            .insert((MaterialKey::DefaultGlow, BillboardShape::Disc), Entity::from_raw(2));
        assert_eq!(batches.by_key.len(), 2);
        assert_ne!(
            batches.by_key[&(MaterialKey::DefaultGlow, BillboardShape::Quad)],
            batches.by_key[&(MaterialKey::DefaultGlow, BillboardShape::Disc)],
        );
    }

    #[test]
    fn templates_have_expected_topology() {
        let quad = ShapeTemplate::quad();
        assert_eq!(quad.vertex_count(), 4);
        assert_eq!(quad.indices.len(), 6);

        let disc = ShapeTemplate::disc();
        assert_eq!(disc.vertex_count(), DISC_SEGMENTS + 1);
        assert_eq!(disc.indices.len(), DISC_SEGMENTS * 3);
        // Fan indices never reference past the rim.
        assert!(disc.indices.iter().all(|&i| (i as usize) < disc.vertex_count()));
    }

    #[test]
    fn instances_start_invisible_and_sanitized() {
        let mut rec = record(7, [1.0, 2.0, 3.0]);
        rec.luminosity = 0.0;
        rec.color = [f32::INFINITY, 0.0, 0.0];
        let inst = InstanceRecord::from_record(&rec);
        assert_eq!(inst.current_intensity, 0.0);
        assert!(!inst.visible);
        assert!(inst.luminosity > 0.0);
        assert_eq!(inst.color, [1.0, 1.0, 1.0]);
        assert!(inst.bounding_radius() > 0.0);
    }

    #[test]
    fn batch_mesh_has_one_vertex_run_per_slot() {
        let template = ShapeTemplate::quad();
        let records: Vec<_> = (0..3)
            .map(|i| InstanceRecord::from_record(&record(i, [i as f32 * 10.0, 0.0, 0.0])))
            .collect();
        let mesh = build_batch_mesh(&template, &records);
        let Some(VertexAttributeValues::Float32x3(pos)) = mesh.attribute(Mesh::ATTRIBUTE_POSITION)
        else {
            panic!("missing positions");
        };
        assert_eq!(pos.len(), 12);
        // Slot 1's first corner sits around x = 10.
        assert!((pos[4][0] - 9.0).abs() < 1e-4);
    }

    #[test]
    fn write_slot_touches_only_its_range() {
        let template = ShapeTemplate::quad();
        let records: Vec<_> = (0..2)
            .map(|i| InstanceRecord::from_record(&record(i, [0.0; 3])))
            .collect();
        let mut mesh = build_batch_mesh(&template, &records);
        write_slot(&mut mesh, 4, 1, None, [0.5, 0.5, 0.5, 1.0]);
        let Some(VertexAttributeValues::Float32x4(col)) = mesh.attribute(Mesh::ATTRIBUTE_COLOR)
        else {
            panic!("missing colors");
        };
        assert_eq!(col[0], [0.0, 0.0, 0.0, 0.0]);
        assert_eq!(col[4], [0.5, 0.5, 0.5, 1.0]);
        assert_eq!(col[7], [0.5, 0.5, 0.5, 1.0]);
    }

    #[test]
    fn billboard_corners_face_the_given_orientation() {
        let template = ShapeTemplate::quad();
        let t = Transform::from_xyz(5.0, 0.0, 0.0).with_scale(Vec3::splat(2.0));
        let corners = billboard_corners(&template, &t, Quat::IDENTITY);
        assert_eq!(corners.len(), 4);
        // Centered on the translation, one unit out on each side at scale 2.
        let center: Vec3 = corners.iter().sum::<Vec3>() / 4.0;
        assert!((center - t.translation).length() < 1e-4);
        assert!((corners[0] - Vec3::new(4.0, -1.0, 0.0)).length() < 1e-4);
    }
}
