// src/world/manifest.rs
//! World manifest asset + loader.
//!
//! The manifest plays the role of the external `loadWorld` call: a RON file
//! with a flat list of object records, plus an optional deterministic
//! starfield block so tens of thousands of celestials can be described in a
//! few lines.

use bevy::asset::{io::Reader, AssetLoader, LoadContext};
use bevy::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::world::core::{BillboardShape, EntityId, ObjectKind, ObjectRecord};

// ---------- Public plugin to register asset+loader ----------

pub struct WorldManifestAssetPlugin;

impl Plugin for WorldManifestAssetPlugin {
    fn build(&self, app: &mut App) {
        app.init_asset::<WorldManifest>()
            .register_asset_loader(WorldManifestLoader);
    }
}

// ---------- Starfield (data form) ----------

/// Deterministic shell of look-alike celestials, generated at load time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StarfieldDef {
    pub count: usize,
    /// Outer shell radius; stars scatter between 35% and 100% of it.
    pub radius: f32,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Ids are allocated as `id_base`, `id_base + 1`, ... and must not collide
    /// with explicit record ids.
    #[serde(default = "default_id_base")]
    pub id_base: u64,
    #[serde(default)]
    pub texture: Option<String>,
}

fn default_seed() -> u64 {
    1337
}
fn default_id_base() -> u64 {
    1_000_000
}

// ---------- Runtime manifest asset ----------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorldManifestDef {
    pub name: String,
    #[serde(default)]
    pub records: Vec<ObjectRecord>,
    #[serde(default)]
    pub starfield: Option<StarfieldDef>,
}

#[derive(Asset, TypePath, Clone)]
pub struct WorldManifest {
    pub name: String,
    pub records: Vec<ObjectRecord>,
    pub starfield: Option<StarfieldDef>,
}

impl WorldManifest {
    /// Explicit records followed by the generated starfield.
    pub fn all_records(&self) -> Vec<ObjectRecord> {
        let mut out = self.records.clone();
        if let Some(def) = &self.starfield {
            out.extend(generate_starfield(def));
        }
        out
    }
}

/// Same jittered-but-deterministic approach as procedural placement: one
/// seeded stream, so a manifest always produces the same sky.
pub fn generate_starfield(def: &StarfieldDef) -> Vec<ObjectRecord> {
    let mut rng = ChaCha8Rng::seed_from_u64(def.seed);
    let mut out = Vec::with_capacity(def.count);
    for i in 0..def.count {
        // Uniform direction on the unit sphere.
        let z: f32 = rng.random_range(-1.0..1.0f32);
        let theta: f32 = rng.random_range(0.0..std::f32::consts::TAU);
        let r_xy = (1.0 - z * z).max(0.0).sqrt();
        let dir = Vec3::new(r_xy * theta.cos(), z, r_xy * theta.sin());
        let dist = def.radius * rng.random_range(0.35..1.0f32);

        let warm: f32 = rng.random_range(0.0..1.0f32);
        let color = [1.0, 0.82 + 0.15 * warm, 0.65 + 0.35 * (1.0 - warm)];
        let scale = rng.random_range(0.6..2.4f32);

        out.push(ObjectRecord {
            id: EntityId(def.id_base + i as u64),
            name: format!("star-{i}"),
            kind: ObjectKind::Celestial {
                texture: def.texture.clone(),
                shape: BillboardShape::Quad,
                dominant: false,
            },
            position: (dir * dist).to_array(),
            rotation: [0.0; 3],
            scale: [scale, scale, scale],
            color,
            base_intensity: rng.random_range(0.2..0.5f32),
            peak_intensity: rng.random_range(0.8..1.6f32),
            luminosity: rng.random_range(0.3..2.5f32),
            properties: Default::default(),
        });
    }
    out
}

// ---------- Asset loader for `.world.ron` ----------

#[derive(Default)]
pub struct WorldManifestLoader;

impl AssetLoader for WorldManifestLoader {
    type Asset = WorldManifest;
    type Settings = ();
    type Error = WorldManifestLoadError;

    fn extensions(&self) -> &[&str] {
        &["world.ron"]
    }

    async fn load(
        &self,
        reader: &mut dyn Reader,
        _settings: &Self::Settings,
        _load_context: &mut LoadContext<'_>,
    ) -> Result<Self::Asset, Self::Error> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await?;
        let def: WorldManifestDef =
            ron::de::from_bytes(&bytes).map_err(|e| WorldManifestLoadError::Ron(e.to_string()))?;
        validate_ids(&def)?;
        Ok(WorldManifest {
            name: def.name,
            records: def.records,
            starfield: def.starfield,
        })
    }
}

/// Ids must be unique across explicit records and the starfield's id range.
fn validate_ids(def: &WorldManifestDef) -> Result<(), WorldManifestLoadError> {
    let mut seen = HashSet::new();
    for rec in &def.records {
        if !seen.insert(rec.id) {
            return Err(WorldManifestLoadError::DuplicateId { id: rec.id.0 });
        }
    }
    if let Some(sf) = &def.starfield {
        let range = sf.id_base..sf.id_base + sf.count as u64;
        if let Some(hit) = seen.iter().find(|id| range.contains(&id.0)) {
            return Err(WorldManifestLoadError::DuplicateId { id: hit.0 });
        }
    }
    Ok(())
}

// ---------- Loader errors ----------

#[derive(thiserror::Error, Debug)]
pub enum WorldManifestLoadError {
    #[error("I/O while reading world manifest: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON parse error: {0}")]
    Ron(String),
    #[error("Duplicate object id {id} in world manifest")]
    DuplicateId { id: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starfield_generation_is_deterministic() {
        let def = StarfieldDef {
            count: 64,
            radius: 500.0,
            seed: 7,
            id_base: 1_000_000,
            texture: None,
        };
        let a = generate_starfield(&def);
        let b = generate_starfield(&def);
        assert_eq!(a.len(), 64);
        assert_eq!(a[0].position, b[0].position);
        assert_eq!(a[63].luminosity, b[63].luminosity);
        // Ids are dense from the base, all unique.
        assert_eq!(a[0].id, EntityId(1_000_000));
        assert_eq!(a[63].id, EntityId(1_000_063));
        // Everything stays inside the shell.
        for rec in &a {
            assert!(Vec3::from_array(rec.position).length() <= 500.0 + 1e-3);
        }
    }

    #[test]
    fn manifest_ron_parses_with_defaults() {
        let src = r#"(
            name: "demo",
            records: [(
                id: (1),
                name: "sun",
                kind: Celestial(dominant: true),
            )],
            starfield: Some((count: 10, radius: 800.0)),
        )"#;
        let def: WorldManifestDef = ron::de::from_str(src).expect("manifest should parse");
        assert_eq!(def.records.len(), 1);
        assert_eq!(def.records[0].scale, [1.0, 1.0, 1.0]);
        assert!(def.starfield.is_some());
        assert!(validate_ids(&def).is_ok());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let def = WorldManifestDef {
            name: "dup".into(),
            records: vec![
                ObjectRecord {
                    id: EntityId(5),
                    name: "a".into(),
                    kind: ObjectKind::Camera,
                    position: [0.0; 3],
                    rotation: [0.0; 3],
                    scale: [1.0; 3],
                    color: [1.0; 3],
                    base_intensity: 0.3,
                    peak_intensity: 1.0,
                    luminosity: 1.0,
                    properties: Default::default(),
                },
                ObjectRecord {
                    id: EntityId(5),
                    name: "b".into(),
                    kind: ObjectKind::Camera,
                    position: [0.0; 3],
                    rotation: [0.0; 3],
                    scale: [1.0; 3],
                    color: [1.0; 3],
                    base_intensity: 0.3,
                    peak_intensity: 1.0,
                    luminosity: 1.0,
                    properties: Default::default(),
                },
            ],
            starfield: None,
        };
        assert!(matches!(
            validate_ids(&def),
            Err(WorldManifestLoadError::DuplicateId { id: 5 })
        ));
    }
}
