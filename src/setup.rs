use bevy::core_pipeline::bloom::Bloom;
use bevy::prelude::*;
use bevy::render::view::RenderLayers;

use crate::input::CameraOrbit;
use crate::render::GLOW_LAYER;

/// The camera the user steers. Renders the lit scene layer on top of the glow
/// pass without clearing.
#[derive(Component)]
pub struct MainCamera;

/// Shadow camera for the bloom pass: same pose as the main camera, but HDR,
/// restricted to the glow layer, and rendered first.
#[derive(Component)]
pub struct GlowCamera;

pub fn setup(mut commands: Commands) {
    // 1) Fill lighting so primitives and models are never pitch black. System
    //    objects carry no WorldObject, so a scene clear leaves them alone.
    commands.spawn((
        PointLight {
            intensity: 2_000_000.0,
            range: 500.0,
            shadows_enabled: false,
            ..default()
        },
        Transform::from_xyz(40.0, 80.0, 40.0),
    ));
    commands.insert_resource(AmbientLight {
        color: Color::WHITE,
        brightness: 120.0,
        ..default()
    });

    let start = Transform::from_xyz(-60.0, 45.0, 90.0).looking_at(Vec3::ZERO, Vec3::Y);

    // 2) Glow pass: renders only the billboard layer, clears to near-black.
    commands.spawn((
        Camera3d::default(),
        Camera {
            order: 0,
            hdr: true,
            clear_color: ClearColorConfig::Custom(Color::srgb(0.004, 0.006, 0.012)),
            ..default()
        },
        Bloom::NATURAL,
        RenderLayers::layer(GLOW_LAYER),
        start,
        GlowCamera,
    ));

    // 3) Main pass: composites the lit scene over the glow.
    commands.spawn((
        Camera3d::default(),
        Camera {
            order: 1,
            clear_color: ClearColorConfig::None,
            ..default()
        },
        start,
        MainCamera,
        CameraOrbit::from_pose(start.translation, Vec3::ZERO),
    ));
}
