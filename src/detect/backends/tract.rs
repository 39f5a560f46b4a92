#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::{non_max_suppression, ObjectDetector, RawDetection};

const INPUT_SIZE: u32 = 640;
const SCORE_FLOOR: f32 = 0.01;
const NMS_IOU: f32 = 0.45;

/// Tract-based backend for YOLOv8 ONNX exports.
///
/// Expects a single input `[1, 3, 640, 640]` and a single output
/// `[1, 4 + classes, anchors]` with `cx, cy, w, h` rows followed by class scores.
pub struct TractYoloDetector {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    labels: Vec<String>,
}

impl TractYoloDetector {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, labels: Vec<String>) -> Result<Self> {
        let model_path = model_path.as_ref();
        let size = INPUT_SIZE as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self { model, labels })
    }

    fn build_input(&self, image: &RgbImage) -> Tensor {
        let resized = image::imageops::resize(image, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);
        let size = INPUT_SIZE as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, channel, y, x)| {
            resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0
        });
        input.into_tensor()
    }

    fn label(&self, class_id: usize) -> String {
        self.labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id))
    }

    fn decode_output(&self, outputs: TVec<TValue>, width: u32, height: u32) -> Result<Vec<RawDetection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output is not rank 3")?;

        let rows = view.shape()[1];
        let anchors = view.shape()[2];
        if rows <= 4 {
            return Err(anyhow!("model output has {} rows, expected 4 + classes", rows));
        }

        let scale_x = width as f32 / INPUT_SIZE as f32;
        let scale_y = height as f32 / INPUT_SIZE as f32;
        let mut candidates = Vec::new();
        for anchor in 0..anchors {
            let mut best = (0usize, f32::NEG_INFINITY);
            for row in 4..rows {
                let score = view[[0, row, anchor]];
                if score > best.1 {
                    best = (row - 4, score);
                }
            }
            if best.1 < SCORE_FLOOR {
                continue;
            }
            let cx = view[[0, 0, anchor]];
            let cy = view[[0, 1, anchor]];
            let w = view[[0, 2, anchor]];
            let h = view[[0, 3, anchor]];
            candidates.push(RawDetection::new(
                self.label(best.0),
                best.1,
                [
                    (cx - w / 2.0) * scale_x,
                    (cy - h / 2.0) * scale_y,
                    (cx + w / 2.0) * scale_x,
                    (cy + h / 2.0) * scale_y,
                ],
            ));
        }
        Ok(non_max_suppression(candidates, NMS_IOU))
    }
}

impl ObjectDetector for TractYoloDetector {
    fn name(&self) -> &'static str {
        "tract-yolov8"
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<RawDetection>> {
        let input = self.build_input(image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode_output(outputs, image.width(), image.height())
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = RgbImage::new(INPUT_SIZE, INPUT_SIZE);
        self.detect(&blank).map(|_| ())
    }
}
