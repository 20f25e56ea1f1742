//! Camera state machine: perspective/orthographic toggle with pose
//! save/restore, axis framing, animated focus with auto-orbit.

pub mod plugin;
pub mod rig;
pub mod systems;

pub use plugin::CameraRigPlugin;
pub use rig::{CameraMode, CameraModeChanged, CameraRig};
