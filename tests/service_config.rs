use std::path::PathBuf;
use std::sync::Mutex;

use tempfile::NamedTempFile;

use planti_vision::config::{BackendKind, ServiceConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PLANTI_CONFIG",
        "PLANTI_LISTEN_ADDR",
        "PLANTI_CONFIDENCE_THRESHOLD",
        "PLANTI_STAGING_DIR",
        "PLANTI_MAX_UPLOAD_BYTES",
        "PLANTI_BACKEND",
        "PLANTI_MODEL_PATH",
        "PLANTI_LABELS",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, contents.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"
        listen_addr = "0.0.0.0:9000"
        confidence_threshold = 0.55
        staging_dir = "staging"
        max_upload_bytes = 1048576

        [detector]
        backend = "tract"
        model_path = "weights/leaf.onnx"
        input_size = 416
        confidence = 0.3
        iou_threshold = 0.5
        labels = ["bug", "level 1"]
        "#,
    );

    std::env::set_var("PLANTI_CONFIG", file.path());
    std::env::set_var("PLANTI_CONFIDENCE_THRESHOLD", "0.8");
    std::env::set_var("PLANTI_LABELS", "bug, level 1, level 2");

    let cfg = ServiceConfig::load().expect("load config");

    assert_eq!(cfg.listen_addr, "0.0.0.0:9000");
    assert_eq!(cfg.confidence_threshold, 0.8);
    assert_eq!(cfg.staging_dir, Some(PathBuf::from("staging")));
    assert_eq!(cfg.max_upload_bytes, 1_048_576);
    assert_eq!(cfg.detector.backend, BackendKind::Tract);
    assert_eq!(
        cfg.detector.model_path,
        Some(PathBuf::from("weights/leaf.onnx"))
    );
    assert_eq!(cfg.detector.input_size, 416);
    assert_eq!(cfg.detector.min_confidence, 0.3);
    assert_eq!(cfg.detector.iou_threshold, 0.5);
    assert_eq!(cfg.detector.labels, vec!["bug", "level 1", "level 2"]);

    clear_env();
}

#[test]
fn defaults_apply_without_a_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = ServiceConfig::load().expect("load config");
    assert_eq!(cfg.listen_addr, "127.0.0.1:5000");
    assert_eq!(cfg.confidence_threshold, 0.7);
    assert_eq!(cfg.staging_dir, None);
    assert_eq!(cfg.detector.backend, BackendKind::Tract);
    assert_eq!(cfg.detector.input_size, 640);
    assert_eq!(cfg.detector.labels.len(), 7);
    assert_eq!(cfg.detector.labels[0], "bug");

    clear_env();
}

#[test]
fn env_selects_stub_backend() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PLANTI_BACKEND", "stub");
    std::env::set_var("PLANTI_LISTEN_ADDR", "127.0.0.1:0");
    std::env::set_var("PLANTI_MAX_UPLOAD_BYTES", "2048");

    let cfg = ServiceConfig::load().expect("load config");
    assert_eq!(cfg.detector.backend, BackendKind::Stub);
    assert_eq!(cfg.listen_addr, "127.0.0.1:0");
    assert_eq!(cfg.max_upload_bytes, 2048);

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();

    for (key, value) in [
        ("PLANTI_CONFIDENCE_THRESHOLD", "1.5"),
        ("PLANTI_CONFIDENCE_THRESHOLD", "high"),
        ("PLANTI_MAX_UPLOAD_BYTES", "0"),
        ("PLANTI_LISTEN_ADDR", "localhost"),
        ("PLANTI_BACKEND", "cuda"),
    ] {
        clear_env();
        std::env::set_var(key, value);
        assert!(
            ServiceConfig::load().is_err(),
            "{key}={value} should be rejected"
        );
    }

    clear_env();
    let file = write_config("[detector]\ninput_size = 100\n");
    std::env::set_var("PLANTI_CONFIG", file.path());
    assert!(ServiceConfig::load().is_err());

    clear_env();
    let file = write_config("confidence_threshold = \"high\"\n");
    std::env::set_var("PLANTI_CONFIG", file.path());
    assert!(ServiceConfig::load().is_err());

    clear_env();
    std::env::set_var("PLANTI_CONFIG", "/nonexistent/planti.toml");
    assert!(ServiceConfig::load().is_err());

    clear_env();
}

#[test]
fn overrides_apply_before_validation() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PLANTI_CONFIDENCE_THRESHOLD", "1.5");
    std::env::set_var("PLANTI_BACKEND", "stub");
    assert!(ServiceConfig::load().is_err());

    let mut cfg = ServiceConfig::load_unchecked().expect("load unchecked");
    assert_eq!(cfg.confidence_threshold, 1.5);
    cfg.confidence_threshold = 0.6;
    cfg.validate().expect("overridden config is valid");

    std::env::set_var("PLANTI_CONFIDENCE_THRESHOLD", "abc");
    assert!(ServiceConfig::load_unchecked().is_err());

    clear_env();
}

#[test]
fn tract_backend_may_omit_labels() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config("[detector]\nbackend = \"tract\"\nlabels = []\n");
    std::env::set_var("PLANTI_CONFIG", file.path());
    let cfg = ServiceConfig::load().expect("load config");
    assert!(cfg.detector.labels.is_empty());

    std::env::set_var("PLANTI_BACKEND", "stub");
    assert!(ServiceConfig::load().is_err());

    clear_env();
}
