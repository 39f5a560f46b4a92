use std::cmp::Ordering;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use image::RgbImage;

/// Model output before it is mapped into a [`Detection`](super::Detection).
///
/// Coordinates are floating-point pixels in the source frame.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub class_label: String,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl RawDetection {
    pub fn new(class_label: impl Into<String>, confidence: f32, xyxy: [f32; 4]) -> Self {
        Self {
            class_label: class_label.into(),
            confidence,
            x1: xyxy[0],
            y1: xyxy[1],
            x2: xyxy[2],
            y2: xyxy[3],
        }
    }

    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn iou(&self, other: &RawDetection) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// Object detection model.
///
/// `detect` takes `&mut self`; callers share a model through [`SharedDetector`],
/// which serializes inference.
pub trait ObjectDetector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a decoded RGB frame.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook, run once after loading.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Process-wide model handle. The mutex makes concurrent inference calls take turns.
pub type SharedDetector = Arc<Mutex<dyn ObjectDetector>>;

/// Greedy per-class non-maximum suppression, highest confidence first.
pub fn non_max_suppression(mut detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });

    let mut keep: Vec<RawDetection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = keep.iter().any(|kept| {
            kept.class_label == candidate.class_label && kept.iou(&candidate) > iou_threshold
        });
        if !suppressed {
            keep.push(candidate);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nms_drops_overlapping_boxes_of_same_class() {
        let kept = non_max_suppression(
            vec![
                RawDetection::new("person", 0.6, [0.0, 0.0, 10.0, 10.0]),
                RawDetection::new("person", 0.9, [1.0, 1.0, 11.0, 11.0]),
                RawDetection::new("car", 0.5, [1.0, 1.0, 11.0, 11.0]),
                RawDetection::new("person", 0.4, [50.0, 50.0, 60.0, 60.0]),
            ],
            0.45,
        );

        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].confidence, 0.9);
        assert!(kept.iter().any(|d| d.class_label == "car"));
        assert!(kept.iter().any(|d| d.x1 == 50.0));
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = RawDetection::new("a", 1.0, [0.0, 0.0, 1.0, 1.0]);
        let b = RawDetection::new("a", 1.0, [2.0, 2.0, 3.0, 3.0]);
        assert_eq!(a.iou(&b), 0.0);
    }
}
