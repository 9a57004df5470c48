use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use image::{imageops::FilterType, ImageReader};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::catalog::ClassCatalog;
use crate::detect::result::RawDetection;
use crate::detect::yolo::{self, HeadLayout, Letterbox};

/// Letterbox fill value (YOLO gray 114).
const PAD_VALUE: f32 = 114.0 / 255.0;

/// Tract-based backend for YOLO ONNX exports.
///
/// Loads a local model file once and runs inference on images read from
/// disk. The head layout and class catalog are fixed at load time.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    model_path: PathBuf,
    input_size: u32,
    layout: HeadLayout,
    catalog: ClassCatalog,
    min_confidence: f32,
    iou_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    ///
    /// `labels` names the classes in model order. When empty, the class count
    /// is read from the model head and generic names are used.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32, labels: &[String]) -> Result<Self> {
        let model_path = model_path.as_ref();
        let size = input_size as usize;
        let typed = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?;

        let output_shape = typed
            .output_fact(0)
            .context("model declares no outputs")?
            .shape
            .as_concrete()
            .map(|dims| dims.to_vec())
            .ok_or_else(|| anyhow!("model output shape is not static"))?;
        let layout = HeadLayout::resolve(&output_shape, labels.len())?;
        let catalog = ClassCatalog::new(labels.iter().cloned()).extended_to(layout.classes);

        let model = typed
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        log::info!(
            "loaded {} ({} classes, {} anchors, input {}x{})",
            model_path.display(),
            layout.classes,
            layout.anchors,
            input_size,
            input_size
        );

        Ok(Self {
            model,
            model_path: model_path.to_path_buf(),
            input_size,
            layout,
            catalog,
            min_confidence: 0.25,
            iou_threshold: 0.7,
        })
    }

    /// Override the detector-level confidence pre-filter.
    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    /// Override the NMS IoU threshold.
    pub fn with_iou_threshold(mut self, iou_threshold: f32) -> Self {
        self.iou_threshold = iou_threshold;
        self
    }

    fn build_input(&self, image_path: &Path) -> Result<(Tensor, Letterbox)> {
        let image = ImageReader::open(image_path)
            .with_context(|| format!("failed to open image {}", image_path.display()))?
            .with_guessed_format()
            .with_context(|| format!("failed to guess format of {}", image_path.display()))?
            .decode()
            .with_context(|| format!("failed to decode image {}", image_path.display()))?;

        let letterbox = Letterbox::fit(image.width(), image.height(), self.input_size)?;
        let resized = image
            .resize_exact(letterbox.resized_w, letterbox.resized_h, FilterType::Triangle)
            .to_rgb8();

        let size = self.input_size as usize;
        let offset_x = letterbox.pad_x.floor() as usize;
        let offset_y = letterbox.pad_y.floor() as usize;
        let (resized_w, resized_h) = (resized.width() as usize, resized.height() as usize);
        let raw = resized.as_raw();

        let input = tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, channel, y, x)| {
            if y < offset_y || x < offset_x {
                return PAD_VALUE;
            }
            let (ry, rx) = (y - offset_y, x - offset_x);
            if ry >= resized_h || rx >= resized_w {
                return PAD_VALUE;
            }
            raw[(ry * resized_w + rx) * 3 + channel] as f32 / 255.0
        });

        Ok((input.into_tensor(), letterbox))
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn catalog(&self) -> &ClassCatalog {
        &self.catalog
    }

    fn infer(&mut self, image_path: &Path) -> Result<Vec<RawDetection>> {
        let (input, letterbox) = self.build_input(image_path)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let head = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output was not a rank-3 detection head")?;

        let layout = self.layout;
        let detections = yolo::decode(
            &layout,
            |anchor, feature| {
                if layout.features_first {
                    head[[0, feature, anchor]]
                } else {
                    head[[0, anchor, feature]]
                }
            },
            &letterbox,
            self.min_confidence,
            self.iou_threshold,
            &self.catalog,
        );
        log::debug!(
            "{} detections from {}",
            detections.len(),
            self.model_path.display()
        );
        Ok(detections)
    }

    fn warm_up(&mut self) -> Result<()> {
        let size = self.input_size as usize;
        let input = tract_ndarray::Array4::<f32>::from_elem((1, 3, size, size), PAD_VALUE);
        self.model
            .run(tvec!(input.into_tensor().into()))
            .context("ONNX warm-up inference failed")?;
        Ok(())
    }
}
