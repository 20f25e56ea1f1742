// src/render/mod.rs
//! Render orchestration: a two-pass composite (glow layer with bloom first,
//! full scene over it) plus the selection/hover outline styling, which is
//! swapped wholesale when the camera mode changes.

use bevy::prelude::*;

use crate::camera::rig::{CameraMode, CameraModeChanged};
use crate::setup::{GlowCamera, MainCamera};
use crate::world::proxy::OutlineShell;
use crate::EditorSet;

/// Render layer holding everything that participates in the bloom pass:
/// instance batches and emissive bodies. The glow camera renders only this
/// layer; the main camera composites the rest of the scene on top.
pub const GLOW_LAYER: usize = 1;

// ---------- Outline parameters ----------

/// Edge styling for outlines. Orthographic views need thicker, brighter edges
/// than perspective views at typical zoom levels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OutlineParams {
    /// Scale applied to outline shells around direct nodes.
    pub shell_scale: f32,
    /// Emissive multiplier on the outline materials.
    pub edge_strength: f32,
    /// Outline fill opacity.
    pub opacity: f32,
}

pub fn outline_params_for(mode: CameraMode) -> OutlineParams {
    match mode {
        CameraMode::Perspective => OutlineParams {
            shell_scale: 1.06,
            edge_strength: 2.0,
            opacity: 0.55,
        },
        CameraMode::Orthographic => OutlineParams {
            shell_scale: 1.12,
            edge_strength: 3.5,
            opacity: 0.8,
        },
    }
}

const SELECTION_COLOR: Color = Color::srgb(1.0, 0.62, 0.1);
const HOVER_COLOR: Color = Color::srgb(0.35, 0.75, 1.0);

#[derive(Resource)]
pub struct OutlineAssets {
    pub selection: Handle<StandardMaterial>,
    pub hover: Handle<StandardMaterial>,
    pub params: OutlineParams,
}

fn outline_material(color: Color, params: &OutlineParams) -> StandardMaterial {
    StandardMaterial {
        base_color: color.with_alpha(params.opacity),
        emissive: color.to_linear() * params.edge_strength,
        unlit: true,
        alpha_mode: AlphaMode::Blend,
        cull_mode: None,
        ..default()
    }
}

pub fn init_outline_assets(
    mut commands: Commands,
    mut materials: ResMut<Assets<StandardMaterial>>,
) {
    let params = outline_params_for(CameraMode::Perspective);
    commands.insert_resource(OutlineAssets {
        selection: materials.add(outline_material(SELECTION_COLOR, &params)),
        hover: materials.add(outline_material(HOVER_COLOR, &params)),
        params,
    });
}

/// Outline parameters are swapped as a set on mode change, restyling the two
/// shared materials and any live shells in place.
pub fn swap_outline_params(
    mut events: EventReader<CameraModeChanged>,
    mut outlines: ResMut<OutlineAssets>,
    mut materials: ResMut<Assets<StandardMaterial>>,
    mut q_shells: Query<&mut Transform, With<OutlineShell>>,
) {
    let Some(CameraModeChanged(mode)) = events.read().last().copied() else { return };
    let params = outline_params_for(mode);
    if params == outlines.params {
        return;
    }
    outlines.params = params;
    if let Some(mat) = materials.get_mut(&outlines.selection) {
        *mat = outline_material(SELECTION_COLOR, &params);
    }
    if let Some(mat) = materials.get_mut(&outlines.hover) {
        *mat = outline_material(HOVER_COLOR, &params);
    }
    for mut tf in q_shells.iter_mut() {
        tf.scale = Vec3::splat(params.shell_scale);
    }
}

/// The glow camera shadows the main camera exactly; only its layer mask and
/// bloom settings differ.
pub fn sync_glow_camera(
    q_main: Query<(&Transform, &Projection), (With<MainCamera>, Without<GlowCamera>)>,
    mut q_glow: Query<(&mut Transform, &mut Projection), (With<GlowCamera>, Without<MainCamera>)>,
) {
    let Ok((main_tf, main_proj)) = q_main.single() else { return };
    let Ok((mut glow_tf, mut glow_proj)) = q_glow.single_mut() else { return };
    *glow_tf = *main_tf;
    *glow_proj = main_proj.clone();
}

pub struct RenderStagePlugin;

impl Plugin for RenderStagePlugin {
    fn build(&self, app: &mut App) {
        app.add_systems(Startup, init_outline_assets).add_systems(
            Update,
            (swap_outline_params, sync_glow_camera).in_set(EditorSet::Publish),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orthographic_outlines_are_thicker_and_brighter() {
        let persp = outline_params_for(CameraMode::Perspective);
        let ortho = outline_params_for(CameraMode::Orthographic);
        assert!(ortho.shell_scale > persp.shell_scale);
        assert!(ortho.edge_strength > persp.edge_strength);
        assert!(ortho.opacity > persp.opacity);
        assert!(persp.shell_scale > 1.0);
    }
}
