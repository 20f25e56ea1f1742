// src/world/core.rs
//! Core identity + record types for the editable world.
//! Keep this file dependency-light; it should compile before any batch/scheduler impls.

use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------- Ids ----------

/// Persistent object id handed to us by the world manifest / backend.
/// Direct nodes and batched instances share one id space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

/// Marker + back-reference on every spawned direct node. Batch entities and
/// system objects (editor cameras, ambient light) never carry this.
#[derive(Component, Clone, Copy, Debug)]
pub struct WorldObject {
    pub id: EntityId,
}

// ---------- Record kinds (data form) ----------

/// Billboard shape used by celestial batches (and their selection proxies).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BillboardShape {
    #[default]
    Quad,
    Disc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrimitiveShape {
    Cube,
    Sphere,
    Plane,
}

/// What a record describes. The variant drives direct-vs-batched classification.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ObjectKind {
    Primitive {
        shape: PrimitiveShape,
    },
    Light {
        #[serde(default = "default_light_intensity")]
        intensity: f32,
    },
    Camera,
    Model {
        path: String,
    },
    /// Tiled-texture planetary body; tiles are stitched off-thread on load.
    Planet {
        tile_folder: String,
        tiles: (u32, u32),
    },
    /// One of the tens of thousands of look-alike billboards.
    Celestial {
        #[serde(default)]
        texture: Option<String>,
        #[serde(default)]
        shape: BillboardShape,
        /// Dominant bodies fade on their own material, outside the batch window.
        #[serde(default)]
        dominant: bool,
    },
}

fn default_light_intensity() -> f32 {
    1_000_000.0
}

// ---------- Records ----------

/// One flat object record, as delivered by the manifest/backend.
/// Plain arrays (not math types) on purpose: this is the wire form.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub id: EntityId,
    pub name: String,
    pub kind: ObjectKind,
    #[serde(default)]
    pub position: [f32; 3],
    /// Euler XYZ, radians.
    #[serde(default)]
    pub rotation: [f32; 3],
    #[serde(default = "default_scale")]
    pub scale: [f32; 3],
    #[serde(default = "default_color")]
    pub color: [f32; 3],
    #[serde(default = "default_base_intensity")]
    pub base_intensity: f32,
    #[serde(default = "default_peak_intensity")]
    pub peak_intensity: f32,
    #[serde(default = "default_luminosity")]
    pub luminosity: f32,
    /// Free-form numeric bag for fields the core does not interpret.
    #[serde(default)]
    pub properties: HashMap<String, f32>,
}

fn default_scale() -> [f32; 3] {
    [1.0, 1.0, 1.0]
}
fn default_color() -> [f32; 3] {
    [1.0, 1.0, 1.0]
}
fn default_base_intensity() -> f32 {
    0.35
}
fn default_peak_intensity() -> f32 {
    1.0
}
fn default_luminosity() -> f32 {
    1.0
}

impl ObjectRecord {
    pub fn transform(&self) -> Transform {
        Transform {
            translation: Vec3::from_array(self.position),
            rotation: Quat::from_euler(
                EulerRot::XYZ,
                self.rotation[0],
                self.rotation[1],
                self.rotation[2],
            ),
            scale: sanitize_scale(Vec3::from_array(self.scale)),
        }
    }
}

// ---------- Classification ----------

/// Grouping key for instance batches. Discrete textures each get their own
/// batch; everything else shares the procedural radial-glow material.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MaterialKey {
    DefaultGlow,
    Texture(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Classified {
    Direct,
    Batched(MaterialKey),
}

/// Fixed rules: assets, primitives, lights, and cameras are always direct;
/// non-dominant celestials batch by material key.
pub fn classify(kind: &ObjectKind) -> Classified {
    match kind {
        ObjectKind::Celestial { dominant: true, .. } => Classified::Direct,
        ObjectKind::Celestial { texture, .. } => Classified::Batched(match texture {
            Some(path) => MaterialKey::Texture(path.clone()),
            None => MaterialKey::DefaultGlow,
        }),
        _ => Classified::Direct,
    }
}

// ---------- Sanitization ----------

/// Floor for luminosity so visibility distance never collapses to zero.
pub const MIN_LUMINOSITY: f32 = 0.05;
/// Floor for per-axis scale so bounding spheres and falloff stay well-defined.
pub const MIN_SCALE: f32 = 1e-3;
/// HDR headroom allowed on record colors before we call them invalid.
pub const MAX_COLOR_CHANNEL: f32 = 16.0;

/// Invalid color input from records is replaced with white, not propagated.
pub fn sanitize_color(c: [f32; 3]) -> [f32; 3] {
    let ok = c
        .iter()
        .all(|v| v.is_finite() && *v >= 0.0 && *v <= MAX_COLOR_CHANNEL);
    if ok {
        c
    } else {
        [1.0, 1.0, 1.0]
    }
}

pub fn sanitize_luminosity(l: f32) -> f32 {
    if l.is_finite() {
        l.max(MIN_LUMINOSITY)
    } else {
        1.0
    }
}

pub fn sanitize_scale(s: Vec3) -> Vec3 {
    let fix = |v: f32| if v.is_finite() { v.max(MIN_SCALE) } else { 1.0 };
    Vec3::new(fix(s.x), fix(s.y), fix(s.z))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn celestials_batch_by_texture_key() {
        let plain = ObjectKind::Celestial {
            texture: None,
            shape: BillboardShape::Quad,
            dominant: false,
        };
        let textured = ObjectKind::Celestial {
            texture: Some("textures/nova.png".into()),
            shape: BillboardShape::Quad,
            dominant: false,
        };
        assert_eq!(classify(&plain), Classified::Batched(MaterialKey::DefaultGlow));
        assert_eq!(
            classify(&textured),
            Classified::Batched(MaterialKey::Texture("textures/nova.png".into()))
        );
    }

    #[test]
    fn dominant_celestials_and_everything_else_are_direct() {
        let dominant = ObjectKind::Celestial {
            texture: None,
            shape: BillboardShape::Disc,
            dominant: true,
        };
        assert_eq!(classify(&dominant), Classified::Direct);
        assert_eq!(
            classify(&ObjectKind::Primitive { shape: PrimitiveShape::Cube }),
            Classified::Direct
        );
        assert_eq!(classify(&ObjectKind::Camera), Classified::Direct);
        assert_eq!(
            classify(&ObjectKind::Model { path: "models/station.glb".into() }),
            Classified::Direct
        );
    }

    #[test]
    fn bad_color_input_falls_back_to_white() {
        assert_eq!(sanitize_color([f32::NAN, 0.5, 0.5]), [1.0, 1.0, 1.0]);
        assert_eq!(sanitize_color([-1.0, 0.0, 0.0]), [1.0, 1.0, 1.0]);
        assert_eq!(sanitize_color([0.2, 0.4, 0.9]), [0.2, 0.4, 0.9]);
    }

    #[test]
    fn degenerate_scale_and_luminosity_are_clamped() {
        let s = sanitize_scale(Vec3::ZERO);
        assert!(s.min_element() >= MIN_SCALE);
        assert!(sanitize_luminosity(0.0) >= MIN_LUMINOSITY);
        assert!(sanitize_luminosity(f32::NAN).is_finite());
    }
}
