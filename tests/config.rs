use std::io::Write;

use fxcam::effects::{AcceleratorKind, EffectSelector};
use fxcam::frame::ChannelLayout;
use fxcam::pipeline::FilterStage;
use fxcam::{Config, SourceKind};

fn write_toml(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn defaults_are_valid() {
    let config = Config::default();
    config.validate().unwrap();
    assert_eq!(config.pipeline.process_every, 5);
    assert_eq!(config.pipeline.fps_window_ms, 1000);
    assert_eq!(config.pipeline.pool_depth, 4);
    assert_eq!(config.pipeline.filter_stage, FilterStage::Cpu);
}

#[test]
fn toml_overrides_defaults() {
    let file = write_toml(
        r#"
[capture]
source = "synthetic"
width = 320
height = 240
rotation_degrees = 270

[pipeline]
process_every = 1
accelerator = "software"
layout = "luma"
filter_stage = "gpu"

[pipeline.effect]
kind = "blur"
radius = 3
"#,
    );

    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.capture.source, SourceKind::Synthetic);
    assert_eq!((config.capture.width, config.capture.height), (320, 240));
    assert_eq!(config.capture.rotation_degrees, 270);
    assert_eq!(config.pipeline.process_every, 1);
    assert_eq!(config.pipeline.accelerator, AcceleratorKind::Software);
    assert_eq!(config.pipeline.layout, ChannelLayout::Luma);
    assert_eq!(config.pipeline.filter_stage, FilterStage::Gpu);
    assert_eq!(config.pipeline.effect, EffectSelector::Blur { radius: 3 });

    // Untouched sections keep their defaults.
    assert_eq!(config.display, Config::default().display);
}

#[test]
fn invalid_rotation_is_rejected() {
    let file = write_toml("[capture]\nrotation_degrees = 45\n");
    let err = Config::load(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("rotation_degrees"), "{err}");
}

#[test]
fn missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Config::load(Some(&dir.path().join("absent.toml"))).is_err());
}
