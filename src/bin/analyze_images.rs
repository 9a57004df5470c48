//! analyze_images - Run the detector over one image or a directory of images.
//!
//! Prints per-image results and, for a directory, the detection totals for
//! every class in the catalog. With `--output-dir`, also writes a
//! `pred_<file>` copy of each image with the kept boxes drawn in.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;

use planti_vision::{
    analyze_directory, analyze_directory_with_predictions, build_backend, AnalysisService,
    Annotator, BackendKind, PredictionOutput, ServiceConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Analyze plant images from the command line")]
struct Args {
    /// Image file or directory of images.
    #[arg(long)]
    input: PathBuf,

    /// Confidence threshold (defaults to the configured one).
    #[arg(long)]
    threshold: Option<f64>,

    /// Detector backend ("tract" or "stub").
    #[arg(long, env = "PLANTI_BACKEND")]
    backend: Option<BackendKind>,

    /// ONNX model exported from the trained weights.
    #[arg(long, env = "PLANTI_MODEL_PATH")]
    model_path: Option<PathBuf>,

    /// Print JSON instead of a text report.
    #[arg(long)]
    json: bool,

    /// Directory for annotated prediction images.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// TrueType font for box labels (a system font is tried otherwise).
    #[arg(long, env = "PLANTI_LABEL_FONT")]
    font: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = ServiceConfig::load_unchecked()?;
    if let Some(backend) = args.backend {
        config.detector.backend = backend;
    }
    if let Some(path) = args.model_path {
        config.detector.model_path = Some(path);
    }
    config.validate()?;

    let backend = build_backend(&config.detector).context("failed to load detector")?;
    let service = AnalysisService::new(backend).with_threshold(config.confidence_threshold);
    let threshold = service
        .resolve_threshold(args.threshold)
        .map_err(|e| anyhow!("{e}"))?;

    let annotator = match (&args.output_dir, &args.font) {
        (None, _) => None,
        (Some(_), Some(font)) => Some(Annotator::from_font_file(font)?),
        (Some(_), None) => Some(Annotator::with_system_font()),
    };

    if args.input.is_dir() {
        let report = match (&annotator, &args.output_dir) {
            (Some(annotator), Some(output_dir)) => {
                let output = PredictionOutput {
                    annotator,
                    output_dir,
                };
                analyze_directory_with_predictions(&service, &args.input, threshold, &output)?
            }
            _ => analyze_directory(&service, &args.input, threshold)?,
        };
        if args.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }
        for image in &report.images {
            println!("{}:", image.file);
            for det in &image.summary.detections {
                println!("  {} {:.2}", det.class_name, det.confidence);
            }
        }
        for failure in &report.failures {
            println!("{}: FAILED ({})", failure.file, failure.error);
        }
        println!();
        println!("total detected: {}", report.total_detected);
        for (class_name, count) in &report.class_totals {
            println!("  {class_name}: {count}");
        }
    } else {
        let (summary, kept) = service
            .detect_path(&args.input, threshold)
            .map_err(|e| match e.details() {
                Some(details) => anyhow!("{e}: {details}"),
                None => anyhow!("{e}"),
            })?;
        if let (Some(annotator), Some(output_dir)) = (&annotator, &args.output_dir) {
            std::fs::create_dir_all(output_dir)
                .with_context(|| format!("failed to create {}", output_dir.display()))?;
            let dest = annotator.write_prediction(&args.input, &kept, output_dir)?;
            log::info!("prediction written to {}", dest.display());
        }
        if args.json {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            return Ok(());
        }
        println!("{}:", args.input.display());
        for det in &summary.detections {
            println!("  {} {:.2}", det.class_name, det.confidence);
        }
        println!(
            "total detected: {}, best: {}, average confidence: {}",
            summary.total_detected, summary.best_class_name, summary.average_confidence
        );
    }
    Ok(())
}
