use image::RgbImage;

use crate::config::CameraConfig;
use crate::error::ScanError;

use super::backend::{RawDetection, SharedDetector};
use super::result::{BoundingBox, Detection};
use super::store::FrameStore;

/// Detections for one frame together with the frame size the aggregator splits on.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameDetections {
    pub detections: Vec<Detection>,
    pub width: u32,
    pub height: u32,
}

/// Stable contract around the external detection model.
///
/// Decodes camera bytes, runs the shared model, saves the annotated frame and maps
/// model output into [`Detection`] records.
#[derive(Clone, Debug, Default)]
pub struct DetectorAdapter {
    store: Option<FrameStore>,
}

impl DetectorAdapter {
    pub fn new(store: FrameStore) -> Self {
        Self { store: Some(store) }
    }

    /// Adapter without the save side effect.
    pub fn without_store() -> Self {
        Self { store: None }
    }

    pub fn store(&self) -> Option<&FrameStore> {
        self.store.as_ref()
    }

    pub fn detect(
        &self,
        detector: &SharedDetector,
        image_bytes: &[u8],
        camera: &CameraConfig,
        namespace: &str,
    ) -> Result<FrameDetections, ScanError> {
        let image = decode_frame(image_bytes)?;
        let (width, height) = image.dimensions();

        let inferred = {
            let mut model = detector
                .lock()
                .map_err(|_| ScanError::Inference("detector lock poisoned".to_string()))?;
            model.detect(&image)
        };

        match inferred {
            Ok(raw) => {
                let detections: Vec<Detection> = raw
                    .iter()
                    .map(|detection| to_detection(detection, width, height))
                    .collect();
                self.save(&image, &detections, camera, namespace);
                Ok(FrameDetections {
                    detections,
                    width,
                    height,
                })
            }
            Err(err) => {
                self.save(&image, &[], camera, namespace);
                Err(ScanError::Inference(format!("{:#}", err)))
            }
        }
    }

    fn save(&self, image: &RgbImage, detections: &[Detection], camera: &CameraConfig, namespace: &str) {
        let Some(store) = &self.store else {
            return;
        };
        match store.save_annotated(image, detections, namespace, &camera.name) {
            Ok(path) => log::debug!("camera {}: frame saved to {}", camera.name, path.display()),
            Err(err) => log::warn!("camera {}: failed to save frame: {:#}", camera.name, err),
        }
    }
}

fn decode_frame(bytes: &[u8]) -> Result<RgbImage, ScanError> {
    let image = image::load_from_memory(bytes).map_err(|e| ScanError::Decode(e.to_string()))?;
    Ok(image.into_rgb8())
}

/// Truncate model coordinates to integer pixels inside the frame.
fn to_detection(raw: &RawDetection, width: u32, height: u32) -> Detection {
    let clamp = |value: f32, max: u32| -> u32 {
        if value.is_nan() || value <= 0.0 {
            0
        } else {
            (value as u32).min(max)
        }
    };
    Detection::new(
        raw.class_label.clone(),
        raw.confidence,
        BoundingBox::new(
            clamp(raw.x1, width),
            clamp(raw.y1, height),
            clamp(raw.x2, width),
            clamp(raw.y2, height),
        ),
    )
}
