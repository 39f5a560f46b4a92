use anyhow::Result;
use image::RgbImage;

use crate::detect::backend::{ObjectDetector, RawDetection};

/// Stub backend for dry runs and tests. Returns the same detections for every frame.
#[derive(Clone, Debug, Default)]
pub struct StubDetector {
    detections: Vec<RawDetection>,
    calls: u64,
}

impl StubDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_detections(detections: Vec<RawDetection>) -> Self {
        Self {
            detections,
            calls: 0,
        }
    }

    /// Number of frames this detector has seen.
    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl ObjectDetector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _image: &RgbImage) -> Result<Vec<RawDetection>> {
        self.calls += 1;
        Ok(self.detections.clone())
    }
}
