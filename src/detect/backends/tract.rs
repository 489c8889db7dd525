#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{non_max_suppression, BoundingBox, DetectionEvent};

/// Default square input size of YOLOv8 exports.
pub const DEFAULT_INPUT_SIZE: u32 = 640;

/// Candidate cut-off used until a presence policy supplies its own.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;

/// Tract-based backend for YOLOv8-style ONNX detectors.
///
/// Expects a single output tensor shaped `[1, 4 + classes, anchors]` where the
/// first four rows are `cx, cy, w, h` in input pixels and the remaining rows
/// are per-class scores. Frames are resized to the model input and boxes are
/// scaled back to frame coordinates.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    input_size: u32,
    confidence_threshold: f32,
    iou_threshold: f32,
    max_detections: usize,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        Self::with_input_size(model_path, DEFAULT_INPUT_SIZE)
    }

    pub fn with_input_size<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        log::info!(
            "TractBackend: loaded {} ({}x{} input)",
            model_path.display(),
            input_size,
            input_size
        );

        Ok(Self {
            model,
            input_size,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            iou_threshold: 0.45,
            max_detections: 100,
        })
    }

    /// Drop candidates scoring at or below `threshold` before NMS.
    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    fn build_input(&self, pixels: &[u8], width: u32, height: u32) -> Result<Tensor> {
        let frame = RgbImage::from_raw(width, height, pixels.to_vec()).ok_or_else(|| {
            anyhow!(
                "expected {}x{} RGB frame, received {} bytes",
                width,
                height,
                pixels.len()
            )
        })?;
        let side = self.input_size;
        let resized = if width == side && height == side {
            frame
        } else {
            image::imageops::resize(&frame, side, side, FilterType::Triangle)
        };

        let side = side as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>, width: u32, height: u32) -> Result<Vec<DetectionEvent>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output must be [1, 4 + classes, anchors]")?;
        let candidates = decode_candidates(
            view,
            self.input_size,
            (width, height),
            self.confidence_threshold,
        )?;
        Ok(non_max_suppression(
            candidates,
            self.iou_threshold,
            self.max_detections,
        ))
    }
}

/// Best class per anchor, scaled back to the frame. Anchors whose best score
/// is at or below `threshold` are skipped.
fn decode_candidates(
    view: tract_ndarray::ArrayView3<f32>,
    input_size: u32,
    (width, height): (u32, u32),
    threshold: f32,
) -> Result<Vec<DetectionEvent>> {
    let (_, rows, anchors) = view.dim();
    if rows <= 4 {
        return Err(anyhow!("model output has no class rows"));
    }

    let sx = width as f32 / input_size as f32;
    let sy = height as f32 / input_size as f32;
    let mut candidates = Vec::new();
    for a in 0..anchors {
        let (mut best_class, mut best_score) = (0usize, f32::NEG_INFINITY);
        for c in 4..rows {
            let score = view[[0, c, a]];
            if score > best_score {
                best_class = c - 4;
                best_score = score;
            }
        }
        if best_score <= threshold {
            continue;
        }
        let bbox = BoundingBox::from_center(
            view[[0, 0, a]],
            view[[0, 1, a]],
            view[[0, 2, a]],
            view[[0, 3, a]],
        )
        .scale(sx, sy)
        .clamp_to(width, height);
        candidates.push(DetectionEvent {
            class_id: best_class as u32,
            bounding_box: bbox,
            confidence: best_score,
        });
    }
    Ok(candidates)
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<DetectionEvent>> {
        let input = self.build_input(pixels, width, height)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, width, height)
    }

    fn warm_up(&mut self) -> Result<()> {
        let side = self.input_size;
        let blank = vec![0u8; (side * side * 3) as usize];
        self.detect(&blank, side, side).map(|_| ())
    }
}
