// src/api.rs
//! Boundary surface between the core runtime and the (external) UI/CRUD layer.
//! Everything the excluded surfaces may ask of the core arrives as one of
//! these events; everything they observe leaves as one.

use bevy::prelude::*;

use crate::world::core::{EntityId, ObjectRecord};

// ---------- Tool + axis vocabulary ----------

#[derive(Resource, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ToolMode {
    #[default]
    Select,
    Move,
    Rotate,
    Scale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn direction(self) -> Vec3 {
        match self {
            Axis::X => Vec3::X,
            Axis::Y => Vec3::Y,
            Axis::Z => Vec3::Z,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransformPath {
    Position,
    Rotation,
    Scale,
}

// ---------- Inbound (UI -> core) ----------

/// Load a flat list of object records into the (cleared) scene.
#[derive(Event, Clone)]
pub struct PopulateScene {
    pub records: Vec<ObjectRecord>,
}

#[derive(Event, Clone, Copy, Debug, PartialEq)]
pub struct SetSelection(pub Option<EntityId>);

#[derive(Event, Clone, Copy, Debug)]
pub struct SetToolMode(pub ToolMode);

/// Debounced property-editor writes: one vector field at a time.
#[derive(Event, Clone, Copy, Debug)]
pub struct UpdateTransformRequest {
    pub id: EntityId,
    pub path: TransformPath,
    pub value: Vec3,
}

#[derive(Event, Clone, Debug)]
pub struct RenameRequest {
    pub id: EntityId,
    pub name: String,
}

#[derive(Event, Clone, Copy, Debug)]
pub struct ToggleCameraMode;

#[derive(Event, Clone, Copy, Debug)]
pub struct SetAxisView(pub Axis);

#[derive(Event, Clone, Copy, Debug)]
pub struct FocusObject(pub EntityId);

#[derive(Event, Clone, Copy, Debug)]
pub struct FrameScene;

/// Bulk hide/show for the entity-group panel.
#[derive(Event, Clone, Debug)]
pub struct SetGroupVisibility {
    pub ids: Vec<EntityId>,
    pub visible: bool,
}

/// Bulk dimming, independent of distance fade. 0..1.
#[derive(Event, Clone, Debug)]
pub struct SetGroupBrightness {
    pub ids: Vec<EntityId>,
    pub brightness: f32,
}

// ---------- Outbound (core -> UI) ----------

/// Emitted only after the corresponding scene-graph mutation (proxy creation
/// or teardown) has completed.
#[derive(Event, Clone, Copy, Debug, PartialEq)]
pub struct SelectionChanged(pub Option<EntityId>);

/// Fraction of completed vs. total outstanding loads for one population batch.
#[derive(Event, Clone, Copy, Debug)]
pub struct PopulateProgress {
    pub fraction: f32,
}

/// Fires exactly once per population, after every outstanding load resolved.
#[derive(Event, Clone, Copy, Debug)]
pub struct WorldReady;

// ---------- Wiring ----------

pub fn apply_tool_mode(mut events: EventReader<SetToolMode>, mut mode: ResMut<ToolMode>) {
    for SetToolMode(m) in events.read() {
        *mode = *m;
    }
}

pub struct ApiPlugin;

impl Plugin for ApiPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<ToolMode>()
            .add_event::<PopulateScene>()
            .add_event::<SetSelection>()
            .add_event::<SetToolMode>()
            .add_event::<UpdateTransformRequest>()
            .add_event::<RenameRequest>()
            .add_event::<ToggleCameraMode>()
            .add_event::<SetAxisView>()
            .add_event::<FocusObject>()
            .add_event::<FrameScene>()
            .add_event::<SetGroupVisibility>()
            .add_event::<SetGroupBrightness>()
            .add_event::<SelectionChanged>()
            .add_event::<PopulateProgress>()
            .add_event::<WorldReady>()
            .add_systems(Update, apply_tool_mode);
    }
}
