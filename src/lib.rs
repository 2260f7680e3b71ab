pub mod camera3d;
pub mod config;
pub mod mesh;
pub mod renderer;

pub use renderer::{SceneLightingState, SceneRenderer};
