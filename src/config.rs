use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::renderer::MAX_SHADOW_CASCADES;

#[derive(Debug, Clone, Deserialize)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self { title: "Merlin Render".to_string(), width: 1280, height: 720, vsync: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShadowConfig {
    #[serde(default = "ShadowConfig::default_cascade_count")]
    pub cascade_count: u32,
    #[serde(default = "ShadowConfig::default_resolution")]
    pub resolution: u32,
    #[serde(default = "ShadowConfig::default_strength")]
    pub strength: f32,
    #[serde(default = "ShadowConfig::default_bias")]
    pub bias: f32,
    #[serde(default = "ShadowConfig::default_depth_bounds")]
    pub depth_bounds: bool,
}

impl ShadowConfig {
    const fn default_cascade_count() -> u32 {
        4
    }

    const fn default_resolution() -> u32 {
        2048
    }

    const fn default_strength() -> f32 {
        1.0
    }

    const fn default_bias() -> f32 {
        0.005
    }

    const fn default_depth_bounds() -> bool {
        true
    }

    /// Rejects configurations that would produce undefined cascade matrices.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            (1..=MAX_SHADOW_CASCADES as u32).contains(&self.cascade_count),
            "shadow cascade count must be in [1, {}], got {}",
            MAX_SHADOW_CASCADES,
            self.cascade_count
        );
        ensure!(
            (256..=8192).contains(&self.resolution),
            "shadow map resolution must be in [256, 8192], got {}",
            self.resolution
        );
        ensure!(self.strength.is_finite() && (0.0..=1.0).contains(&self.strength),
            "shadow strength must be in [0, 1], got {}", self.strength);
        ensure!(self.bias.is_finite() && self.bias >= 0.0, "shadow bias must be non-negative, got {}", self.bias);
        Ok(())
    }
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            cascade_count: Self::default_cascade_count(),
            resolution: Self::default_resolution(),
            strength: Self::default_strength(),
            bias: Self::default_bias(),
            depth_bounds: Self::default_depth_bounds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub shadow: ShadowConfig,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg: Self = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        cfg.shadow.validate().with_context(|| format!("Invalid shadow config in {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                eprintln!("Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }
}
