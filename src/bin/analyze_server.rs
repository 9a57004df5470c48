//! analyze_server - HTTP object-detection service.
//!
//! This daemon:
//! 1. Loads configuration (TOML file, environment, flags)
//! 2. Loads and warms up the detector; any failure aborts before binding
//! 3. Serves the analysis API until Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use planti_vision::api::{ApiConfig, ApiServer};
use planti_vision::{build_backend, AnalysisService, BackendKind, ServiceConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve plant image analysis over HTTP")]
struct Args {
    /// Socket address to listen on.
    #[arg(long, env = "PLANTI_LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Default confidence threshold for reported detections.
    #[arg(long, env = "PLANTI_CONFIDENCE_THRESHOLD")]
    threshold: Option<f64>,

    /// Detector backend ("tract" or "stub").
    #[arg(long, env = "PLANTI_BACKEND")]
    backend: Option<BackendKind>,

    /// ONNX model exported from the trained weights.
    #[arg(long, env = "PLANTI_MODEL_PATH")]
    model_path: Option<PathBuf>,

    /// Directory for staged uploads (system temp dir when unset).
    #[arg(long, env = "PLANTI_STAGING_DIR")]
    staging_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = ServiceConfig::load_unchecked()?;
    if let Some(addr) = args.listen_addr {
        config.listen_addr = addr;
    }
    if let Some(threshold) = args.threshold {
        config.confidence_threshold = threshold;
    }
    if let Some(backend) = args.backend {
        config.detector.backend = backend;
    }
    if let Some(path) = args.model_path {
        config.detector.model_path = Some(path);
    }
    if let Some(dir) = args.staging_dir {
        config.staging_dir = Some(dir);
    }
    config.validate()?;

    if let Some(dir) = &config.staging_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create staging dir {}", dir.display()))?;
    }

    let backend = build_backend(&config.detector).context("failed to load detector")?;
    let service = AnalysisService::new(backend)
        .with_threshold(config.confidence_threshold)
        .with_staging_dir(config.staging_dir.clone())
        .with_max_upload_bytes(config.max_upload_bytes);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    let api_config = ApiConfig {
        addr: config.listen_addr.clone(),
    };
    let api_handle = runtime.block_on(ApiServer::new(api_config, Arc::new(service)).spawn())?;
    log::info!(
        "analysis api listening on {} (backend {}, threshold {})",
        api_handle.addr,
        config.detector.backend.as_str(),
        config.confidence_threshold
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("analyze_server waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    runtime.block_on(api_handle.stop())?;

    Ok(())
}
