// src/world/loader.rs
//! Scene population: manifest -> records -> direct nodes + instance batches,
//! with background tasks for planet tile stitching and load-state tracking so
//! `WorldReady` only fires when every outstanding load has resolved.

use bevy::asset::{LoadState, UntypedHandle};
use bevy::gltf::GltfAssetLabel;
use bevy::prelude::*;
use bevy::render::render_resource::{Extent3d, TextureDimension, TextureFormat};
use bevy::render::view::RenderLayers;
use bevy::tasks::{AsyncComputeTaskPool, Task};
use futures_lite::future;
use std::collections::{HashMap, HashSet};

use crate::api::{PopulateProgress, PopulateScene, SelectionChanged, WorldReady};
use crate::render::GLOW_LAYER;
use crate::world::batches::{
    append_to_batch, BillboardShapes, InstanceBatch, InstanceBatches, InstanceRecord,
};
use crate::world::core::{
    classify, sanitize_color, sanitize_luminosity, BillboardShape, Classified, MaterialKey,
    ObjectKind, ObjectRecord, PrimitiveShape, WorldObject,
};
use crate::world::manifest::WorldManifest;
use crate::world::proxy::{
    reset_interaction_state, ActiveProxies, FaceCamera, HoverTarget, Selection,
};
use crate::world::registry::{clear_world, EntityKindTag, EntityRegistry};
use crate::world::scheduler::{EmissiveFade, ModelFade};

// ---------- Manifest bootstrap ----------

#[derive(Resource, Clone)]
pub struct WorldSettings {
    pub manifest_path: String,
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self { manifest_path: "worlds/default.world.ron".to_string() }
    }
}

#[derive(Resource, Default)]
pub struct WorldManifestHandle(pub Handle<WorldManifest>);

/// Startup: request the manifest, store the handle.
pub fn load_manifest(
    mut handle_res: ResMut<WorldManifestHandle>,
    settings: Res<WorldSettings>,
    assets: Res<AssetServer>,
) {
    if handle_res.0.is_strong() {
        return;
    }
    handle_res.0 = assets.load(settings.manifest_path.as_str());
    info!("World: loading manifest from '{}'", settings.manifest_path);
}

/// Update: hand the loaded manifest's records to the population entry point.
pub fn monitor_manifest_ready(
    handle_res: Res<WorldManifestHandle>,
    manifests: Res<Assets<WorldManifest>>,
    mut populated: Local<bool>,
    mut populate: EventWriter<PopulateScene>,
) {
    if *populated {
        return;
    }
    if let Some(manifest) = manifests.get(&handle_res.0) {
        *populated = true;
        let records = manifest.all_records();
        info!(
            "World: manifest '{}' ready, populating {} records",
            manifest.name,
            records.len()
        );
        populate.write(PopulateScene { records });
    }
}

// ---------- Outstanding loads ----------

pub struct PlanetStitch {
    pub material: Handle<StandardMaterial>,
    pub task: Task<Option<(u32, u32, Vec<u8>)>>,
}

/// One population batch's outstanding loads. Progress is completed / total;
/// `WorldReady` fires once, when every load resolved (success or failure).
#[derive(Resource, Default)]
pub struct PendingPopulate {
    pub active: bool,
    pub asset_handles: Vec<UntypedHandle>,
    pub stitches: Vec<PlanetStitch>,
    pub stitched_done: usize,
    pub total: usize,
    pub last_fraction: f32,
}

// ---------- Population ----------

#[allow(clippy::too_many_arguments)]
pub fn populate_scene(
    mut commands: Commands,
    mut events: EventReader<PopulateScene>,
    mut registry: ResMut<EntityRegistry>,
    mut batches: ResMut<InstanceBatches>,
    shapes: Res<BillboardShapes>,
    mut meshes: ResMut<Assets<Mesh>>,
    mut materials: ResMut<Assets<StandardMaterial>>,
    asset_server: Res<AssetServer>,
    mut q_batch: Query<&mut InstanceBatch>,
    mut pending: ResMut<PendingPopulate>,
    mut selection: ResMut<Selection>,
    mut hover: ResMut<HoverTarget>,
    mut proxies: ResMut<ActiveProxies>,
    mut selection_changed: EventWriter<SelectionChanged>,
) {
    for event in events.read() {
        // Each population batch starts from an empty editable scene.
        clear_world(&mut commands, &mut registry, &mut batches, &mut meshes, &q_batch);
        // Live proxies reference slots that no longer exist; drop them without
        // a commit and tell the outside world the selection is gone.
        let (doomed, had_selection) =
            reset_interaction_state(&mut selection, &mut hover, &mut proxies);
        for entity in doomed {
            commands.entity(entity).try_despawn();
        }
        if had_selection {
            selection_changed.write(SelectionChanged(None));
        }
        pending.active = true;
        pending.asset_handles.clear();
        pending.stitches.clear(); // abandoned tasks are dropped, not awaited
        pending.stitched_done = 0;
        pending.last_fraction = -1.0;

        let mut grouped: HashMap<(MaterialKey, BillboardShape), Vec<InstanceRecord>> =
            HashMap::new();

        for record in &event.records {
            match classify(&record.kind) {
                Classified::Direct => spawn_direct(
                    &mut commands,
                    &mut registry,
                    &shapes,
                    &mut meshes,
                    &mut materials,
                    &asset_server,
                    &mut pending,
                    record,
                ),
                Classified::Batched(key) => {
                    let shape = match &record.kind {
                        ObjectKind::Celestial { shape, .. } => *shape,
                        _ => BillboardShape::Quad,
                    };
                    if let MaterialKey::Texture(path) = &key {
                        let tex: Handle<Image> = asset_server.load(path.as_str());
                        pending.asset_handles.push(tex.untyped());
                    }
                    grouped
                        .entry((key, shape))
                        .or_default()
                        .push(InstanceRecord::from_record(record));
                }
            }
        }

        for ((key, shape), records) in grouped {
            let ids: Vec<_> = records.iter().map(|r| r.id).collect();
            let (batch, base) = append_to_batch(
                &mut commands,
                &mut meshes,
                &mut materials,
                &asset_server,
                &shapes,
                &mut batches,
                &mut q_batch,
                key,
                shape,
                records,
            );
            for (i, id) in ids.into_iter().enumerate() {
                registry.insert_instance(id, batch, base + i);
            }
        }

        // Duplicate texture keys collapse to one tracked handle each.
        let mut seen = HashSet::new();
        pending.asset_handles.retain(|h| seen.insert(h.id()));
        pending.total = pending.asset_handles.len() + pending.stitches.len();
        info!(
            "World: populated {} records ({} registered, {} outstanding loads)",
            event.records.len(),
            registry.len(),
            pending.total
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_direct(
    commands: &mut Commands,
    registry: &mut EntityRegistry,
    shapes: &BillboardShapes,
    meshes: &mut Assets<Mesh>,
    materials: &mut Assets<StandardMaterial>,
    asset_server: &AssetServer,
    pending: &mut PendingPopulate,
    record: &ObjectRecord,
) {
    let transform = record.transform();
    let name = Name::new(record.name.clone());
    let color = sanitize_color(record.color);
    let base_color = Color::srgb(color[0].min(1.0), color[1].min(1.0), color[2].min(1.0));

    let (entity, tag) = match &record.kind {
        ObjectKind::Primitive { shape } => {
            let mesh = match shape {
                PrimitiveShape::Cube => meshes.add(Cuboid::new(1.0, 1.0, 1.0)),
                PrimitiveShape::Sphere => meshes.add(Sphere::new(0.5)),
                PrimitiveShape::Plane => meshes.add(Plane3d::default().mesh().size(1.0, 1.0)),
            };
            let material = materials.add(StandardMaterial {
                base_color,
                perceptual_roughness: 0.9,
                metallic: 0.0,
                ..default()
            });
            let e = commands
                .spawn((
                    WorldObject { id: record.id },
                    name,
                    transform,
                    GlobalTransform::default(),
                    Visibility::Visible,
                    Mesh3d(mesh),
                    MeshMaterial3d(material),
                ))
                .id();
            (e, EntityKindTag::Primitive)
        }
        ObjectKind::Light { intensity } => {
            let e = commands
                .spawn((
                    WorldObject { id: record.id },
                    name,
                    transform,
                    GlobalTransform::default(),
                    Visibility::Visible,
                    PointLight {
                        color: base_color,
                        intensity: *intensity,
                        shadows_enabled: false,
                        ..default()
                    },
                ))
                .id();
            (e, EntityKindTag::Light)
        }
        ObjectKind::Camera => {
            // Addressable placeholder node; it never renders anything itself.
            let e = commands
                .spawn((
                    WorldObject { id: record.id },
                    name,
                    transform,
                    GlobalTransform::default(),
                    Visibility::Visible,
                ))
                .id();
            (e, EntityKindTag::Camera)
        }
        ObjectKind::Model { path } => {
            let scene: Handle<Scene> =
                asset_server.load(GltfAssetLabel::Scene(0).from_asset(path.clone()));
            pending.asset_handles.push(scene.clone().untyped());
            let e = commands
                .spawn((
                    WorldObject { id: record.id },
                    name,
                    transform,
                    GlobalTransform::default(),
                    Visibility::Visible,
                    SceneRoot(scene),
                    ModelFade {
                        luminosity: sanitize_luminosity(record.luminosity),
                        manually_hidden: false,
                        visible: true,
                    },
                ))
                .id();
            (e, EntityKindTag::Model)
        }
        ObjectKind::Planet { tile_folder, tiles } => {
            // Texture arrives later from the stitch task; until then the body
            // renders with a neutral surface.
            let material = materials.add(StandardMaterial {
                base_color: Color::linear_rgb(0.72, 0.75, 0.72),
                perceptual_roughness: 0.95,
                metallic: 0.0,
                ..default()
            });
            let folder = tile_folder.clone();
            let (tx, ty) = *tiles;
            let task = AsyncComputeTaskPool::get()
                .spawn(async move { stitch_planet_tiles(&folder, tx, ty) });
            pending.stitches.push(PlanetStitch { material: material.clone(), task });

            let e = commands
                .spawn((
                    WorldObject { id: record.id },
                    name,
                    transform,
                    GlobalTransform::default(),
                    Visibility::Visible,
                    Mesh3d(meshes.add(Sphere::new(0.5))),
                    MeshMaterial3d(material),
                ))
                .id();
            (e, EntityKindTag::Planet)
        }
        ObjectKind::Celestial { shape, .. } => {
            // Dominant body: its fade runs on its own material emissive,
            // every frame, outside the batch window.
            let material = materials.add(StandardMaterial {
                base_color: Color::BLACK,
                base_color_texture: Some(shapes.glow_texture.clone()),
                alpha_mode: AlphaMode::Add,
                ..default()
            });
            let e = commands
                .spawn((
                    WorldObject { id: record.id },
                    name,
                    transform,
                    GlobalTransform::default(),
                    Visibility::Visible,
                    Mesh3d(shapes.mesh(*shape)),
                    MeshMaterial3d(material),
                    FaceCamera,
                    RenderLayers::layer(GLOW_LAYER),
                    EmissiveFade {
                        color,
                        base_intensity: record.base_intensity,
                        peak_intensity: record.peak_intensity,
                        luminosity: sanitize_luminosity(record.luminosity),
                        brightness: 1.0,
                        current: 0.0,
                    },
                ))
                .id();
            (e, EntityKindTag::Celestial)
        }
    };
    registry.insert_direct(record.id, entity, tag);
}

// ---------- Progress / completion ----------

pub fn track_population_progress(
    mut pending: ResMut<PendingPopulate>,
    asset_server: Res<AssetServer>,
    mut images: ResMut<Assets<Image>>,
    mut materials: ResMut<Assets<StandardMaterial>>,
    mut progress: EventWriter<PopulateProgress>,
    mut ready: EventWriter<WorldReady>,
) {
    if !pending.active {
        return;
    }

    // Poll stitch tasks; a failed stitch counts as resolved (absent texture).
    let mut stitches = std::mem::take(&mut pending.stitches);
    let mut finished = 0usize;
    stitches.retain_mut(|stitch| {
        if !stitch.task.is_finished() {
            return true;
        }
        if let Some(result) = future::block_on(future::poll_once(&mut stitch.task)) {
            match result {
                Some((width, height, data)) => {
                    let image = images.add(Image::new(
                        Extent3d { width, height, depth_or_array_layers: 1 },
                        TextureDimension::D2,
                        data,
                        TextureFormat::Rgba8UnormSrgb,
                        Default::default(),
                    ));
                    if let Some(mat) = materials.get_mut(&stitch.material) {
                        mat.base_color_texture = Some(image);
                        mat.base_color = Color::WHITE;
                    }
                }
                None => warn!("World: planet tile stitch failed; leaving body untextured"),
            }
        }
        finished += 1;
        false
    });
    pending.stitches = stitches;
    pending.stitched_done += finished;

    let resolved_assets = pending
        .asset_handles
        .iter()
        .filter(|h| {
            matches!(
                asset_server.get_load_state(h.id()),
                Some(LoadState::Loaded | LoadState::Failed(_))
            )
        })
        .count();
    let completed = resolved_assets + pending.stitched_done;

    let fraction = if pending.total == 0 {
        1.0
    } else {
        completed as f32 / pending.total as f32
    };
    if (fraction - pending.last_fraction).abs() > f32::EPSILON {
        pending.last_fraction = fraction;
        progress.write(PopulateProgress { fraction });
    }
    if completed >= pending.total {
        pending.active = false;
        ready.write(WorldReady);
        info!("World: population complete ({} loads)", pending.total);
    }
}

// ---------- Tile stitching (runs on the async pool) ----------

/// Assemble a planet's tiled surface texture into one large image. Missing or
/// unreadable tiles are filled with a neutral color rather than failing the
/// whole body.
fn stitch_planet_tiles(folder: &str, tiles_x: u32, tiles_y: u32) -> Option<(u32, u32, Vec<u8>)> {
    if tiles_x == 0 || tiles_y == 0 {
        return None;
    }
    let tile_path = |x: u32, y: u32| format!("assets/{folder}/tile_{x}_{y}.png");

    // Tile size comes from the first readable tile.
    let mut tile_size: Option<(u32, u32)> = None;
    'probe: for y in 0..tiles_y {
        for x in 0..tiles_x {
            if let Ok(img) = image::open(tile_path(x, y)) {
                let rgba = img.to_rgba8();
                tile_size = Some(rgba.dimensions());
                break 'probe;
            }
        }
    }
    let (tw, th) = tile_size?;

    let mut canvas = image::RgbaImage::from_pixel(
        tw * tiles_x,
        th * tiles_y,
        image::Rgba([110, 110, 115, 255]),
    );
    for y in 0..tiles_y {
        for x in 0..tiles_x {
            let path = tile_path(x, y);
            match image::open(&path) {
                Ok(img) => {
                    let rgba = img.to_rgba8();
                    if rgba.dimensions() != (tw, th) {
                        warn!("World: tile '{path}' has mismatched size; skipping");
                        continue;
                    }
                    image::imageops::replace(&mut canvas, &rgba, (x * tw) as i64, (y * th) as i64);
                }
                Err(e) => {
                    warn!("World: failed to read tile '{path}': {e}");
                }
            }
        }
    }
    let (w, h) = canvas.dimensions();
    Some((w, h, canvas.into_raw()))
}
