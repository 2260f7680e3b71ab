use merlin_render::config::{AppConfig, ShadowConfig};
use std::io::Write;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp config file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn partial_shadow_config_fills_in_defaults() {
    let file = write_config(r#"{ "shadow": { "cascade_count": 2, "resolution": 512 } }"#);
    let cfg = AppConfig::load(file.path()).expect("config loads");

    assert_eq!(cfg.shadow.cascade_count, 2);
    assert_eq!(cfg.shadow.resolution, 512);
    let defaults = ShadowConfig::default();
    assert_eq!(cfg.shadow.strength, defaults.strength);
    assert_eq!(cfg.shadow.bias, defaults.bias);
    assert_eq!(cfg.shadow.depth_bounds, defaults.depth_bounds);
}

#[test]
fn load_rejects_out_of_range_shadow_settings() {
    let too_many = write_config(r#"{ "shadow": { "cascade_count": 9 } }"#);
    assert!(AppConfig::load(too_many.path()).is_err());

    let tiny_map = write_config(r#"{ "shadow": { "resolution": 16 } }"#);
    assert!(AppConfig::load(tiny_map.path()).is_err());

    let negative_bias = write_config(r#"{ "shadow": { "bias": -0.5 } }"#);
    assert!(AppConfig::load(negative_bias.path()).is_err());

    let overdriven = write_config(r#"{ "shadow": { "strength": 1.5 } }"#);
    assert!(AppConfig::load(overdriven.path()).is_err());
}

#[test]
fn load_or_default_swallows_missing_files() {
    let cfg = AppConfig::load_or_default("does/not/exist.json");
    assert_eq!(cfg.shadow.cascade_count, ShadowConfig::default().cascade_count);
    assert!(cfg.window.width > 0);
}

#[test]
fn validation_accepts_every_supported_cascade_count() {
    for count in 1..=4 {
        let cfg = ShadowConfig { cascade_count: count, ..ShadowConfig::default() };
        cfg.validate().expect("count within range validates");
    }
}
