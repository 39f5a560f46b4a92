//! Quadrant aggregation.
//!
//! Turns one frame's detections into a flat count map:
//!
//! - `total/<class>`: accepted detections of that class
//! - `<quadrant>/<class>`: accepted detections whose box center lies in that quadrant
//! - `online`: 1 for a frame that was fetched and decoded, 0 otherwise
//!
//! A detection is accepted when its class passes the filter (empty filter passes
//! everything) and its confidence is strictly above the threshold. Points on a
//! midline belong to the right/bottom half.

use serde::Serialize;
use std::collections::btree_map::{self, BTreeMap};
use std::collections::BTreeSet;

use crate::detect::Detection;

pub const ONLINE_KEY: &str = "online";
pub const TOTAL_PREFIX: &str = "total";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Quadrant {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl Quadrant {
    pub const ALL: [Quadrant; 4] = [
        Quadrant::TopLeft,
        Quadrant::TopRight,
        Quadrant::BottomLeft,
        Quadrant::BottomRight,
    ];

    pub fn key_prefix(self) -> &'static str {
        match self {
            Quadrant::TopLeft => "top-left-quadrant",
            Quadrant::TopRight => "top-right-quadrant",
            Quadrant::BottomLeft => "bottom-left-quadrant",
            Quadrant::BottomRight => "bottom-right-quadrant",
        }
    }

    /// Quadrant of point `(x, y)` in a `width` x `height` frame.
    pub fn classify(x: f64, y: f64, width: u32, height: u32) -> Self {
        let mid_x = f64::from(width) / 2.0;
        let mid_y = f64::from(height) / 2.0;
        match (x < mid_x, y < mid_y) {
            (true, true) => Quadrant::TopLeft,
            (false, true) => Quadrant::TopRight,
            (true, false) => Quadrant::BottomLeft,
            (false, false) => Quadrant::BottomRight,
        }
    }
}

/// Per-camera count summary. Serializes as a flat JSON object of string to integer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct QuadrantSummary {
    counts: BTreeMap<String, u64>,
}

impl QuadrantSummary {
    /// Summary for a camera that could not be fetched or decoded: exactly `{online: 0}`.
    pub fn offline() -> Self {
        let mut summary = Self::default();
        summary.counts.insert(ONLINE_KEY.to_string(), 0);
        summary
    }

    /// Reachable camera with nothing counted.
    pub fn online_empty() -> Self {
        let mut summary = Self::default();
        summary.counts.insert(ONLINE_KEY.to_string(), 1);
        summary
    }

    pub fn is_online(&self) -> bool {
        self.counts.get(ONLINE_KEY).copied() == Some(1)
    }

    /// Raw lookup; absent keys are `None`.
    pub fn get(&self, key: &str) -> Option<u64> {
        self.counts.get(key).copied()
    }

    pub fn total(&self, class_label: &str) -> u64 {
        self.get(&total_key(class_label)).unwrap_or(0)
    }

    pub fn in_quadrant(&self, quadrant: Quadrant, class_label: &str) -> u64 {
        self.get(&quadrant_key(quadrant, class_label)).unwrap_or(0)
    }

    /// Classes with a `total/<class>` entry.
    pub fn classes(&self) -> impl Iterator<Item = &str> + '_ {
        let prefix = format!("{}/", TOTAL_PREFIX);
        self.counts
            .keys()
            .filter_map(move |key| key.strip_prefix(prefix.as_str()))
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, u64> {
        self.counts.iter()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    fn increment(&mut self, key: String) {
        *self.counts.entry(key).or_insert(0) += 1;
    }
}

impl<'a> IntoIterator for &'a QuadrantSummary {
    type Item = (&'a String, &'a u64);
    type IntoIter = btree_map::Iter<'a, String, u64>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub fn total_key(class_label: &str) -> String {
    format!("{}/{}", TOTAL_PREFIX, class_label)
}

pub fn quadrant_key(quadrant: Quadrant, class_label: &str) -> String {
    format!("{}/{}", quadrant.key_prefix(), class_label)
}

/// Whether a detection counts under the given filter and threshold.
/// Confidence is widened to `f64` before the strict comparison.
pub fn accepts(detection: &Detection, filter_classes: &BTreeSet<String>, confidence_threshold: f64) -> bool {
    (filter_classes.is_empty() || filter_classes.contains(&detection.class_label))
        && f64::from(detection.confidence) > confidence_threshold
}

/// Count accepted detections overall and per quadrant. Pure; sets `online = 1`.
pub fn aggregate(
    detections: &[Detection],
    image_width: u32,
    image_height: u32,
    filter_classes: &BTreeSet<String>,
    confidence_threshold: f64,
) -> QuadrantSummary {
    let mut summary = QuadrantSummary::default();
    for detection in detections
        .iter()
        .filter(|detection| accepts(detection, filter_classes, confidence_threshold))
    {
        summary.increment(total_key(&detection.class_label));
        let (cx, cy) = detection.bbox.center();
        let quadrant = Quadrant::classify(cx, cy, image_width, image_height);
        summary.increment(quadrant_key(quadrant, &detection.class_label));
    }
    summary.counts.insert(ONLINE_KEY.to_string(), 1);
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    fn det(class: &str, confidence: f32, bbox: (u32, u32, u32, u32)) -> Detection {
        Detection::new(class, confidence, BoundingBox::new(bbox.0, bbox.1, bbox.2, bbox.3))
    }

    fn no_filter() -> BTreeSet<String> {
        BTreeSet::new()
    }

    #[test]
    fn single_person_top_left() {
        let filter: BTreeSet<String> = ["person".to_string()].into_iter().collect();
        let summary = aggregate(&[det("person", 0.9, (0, 0, 10, 10))], 100, 100, &filter, 0.5);

        let expected: Vec<(&str, u64)> = vec![
            ("online", 1),
            ("top-left-quadrant/person", 1),
            ("total/person", 1),
        ];
        let actual: Vec<(&str, u64)> = summary.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn totals_equal_sum_of_quadrants() {
        let detections = vec![
            det("person", 0.8, (0, 0, 10, 10)),
            det("person", 0.8, (90, 0, 100, 10)),
            det("person", 0.8, (0, 90, 10, 100)),
            det("person", 0.8, (90, 90, 100, 100)),
            det("person", 0.8, (60, 60, 70, 70)),
            det("car", 0.7, (10, 60, 20, 80)),
            det("car", 0.7, (70, 10, 80, 20)),
        ];
        let summary = aggregate(&detections, 100, 100, &no_filter(), 0.0);

        for class in summary.classes().map(str::to_string).collect::<Vec<_>>() {
            let sum: u64 = Quadrant::ALL
                .iter()
                .map(|q| summary.in_quadrant(*q, &class))
                .sum();
            assert_eq!(summary.total(&class), sum, "class {}", class);
        }
        assert_eq!(summary.total("person"), 5);
        assert_eq!(summary.in_quadrant(Quadrant::BottomRight, "person"), 2);
        assert_eq!(summary.in_quadrant(Quadrant::BottomLeft, "car"), 1);
        assert_eq!(summary.in_quadrant(Quadrant::TopRight, "car"), 1);
    }

    #[test]
    fn center_on_both_midlines_is_bottom_right() {
        let summary = aggregate(&[det("dog", 0.9, (40, 40, 60, 60))], 100, 100, &no_filter(), 0.0);
        assert_eq!(summary.in_quadrant(Quadrant::BottomRight, "dog"), 1);
        assert_eq!(summary.len(), 3);
    }

    #[test]
    fn center_on_vertical_midline_goes_right() {
        assert_eq!(Quadrant::classify(50.0, 10.0, 100, 100), Quadrant::TopRight);
        assert_eq!(Quadrant::classify(49.5, 50.0, 100, 100), Quadrant::BottomLeft);
        assert_eq!(Quadrant::classify(2.5, 2.5, 5, 5), Quadrant::BottomRight);
    }

    #[test]
    fn confidence_at_threshold_is_rejected() {
        let summary = aggregate(
            &[det("person", 0.5, (0, 0, 10, 10)), det("person", 0.5001, (0, 0, 10, 10))],
            100,
            100,
            &no_filter(),
            0.5,
        );
        assert_eq!(summary.total("person"), 1);
    }

    #[test]
    fn threshold_just_below_confidence_is_not_rounded_up() {
        let detection = det("person", 0.5, (0, 0, 10, 10));
        assert_eq!(0.49999999999_f64 as f32, 0.5);

        assert!(accepts(&detection, &no_filter(), 0.49999999999));
        assert!(!accepts(&detection, &no_filter(), 0.5));
        let summary = aggregate(&[detection], 100, 100, &no_filter(), 0.49999999999);
        assert_eq!(summary.total("person"), 1);
    }

    #[test]
    fn filtered_classes_contribute_nothing() {
        let filter: BTreeSet<String> = ["person".to_string()].into_iter().collect();
        let summary = aggregate(
            &[det("car", 0.99, (0, 0, 10, 10)), det("person", 0.2, (0, 0, 10, 10))],
            100,
            100,
            &filter,
            0.1,
        );
        assert!(summary.iter().all(|(key, _)| !key.ends_with("/car")));
        assert_eq!(summary.total("person"), 1);
    }

    #[test]
    fn no_detections_is_online_only() {
        let summary = aggregate(&[], 640, 480, &no_filter(), 0.0);
        assert_eq!(summary, QuadrantSummary::online_empty());
        assert!(summary.is_online());
    }

    #[test]
    fn offline_summary_has_only_online_key() {
        let summary = QuadrantSummary::offline();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary.get(ONLINE_KEY), Some(0));
        assert!(!summary.is_online());
        assert_eq!(serde_json::to_string(&summary).unwrap(), r#"{"online":0}"#);
    }

    #[test]
    fn aggregate_is_deterministic() {
        let detections = vec![det("person", 0.9, (5, 5, 15, 15)), det("cat", 0.6, (60, 5, 80, 30))];
        let a = aggregate(&detections, 100, 100, &no_filter(), 0.3);
        let b = aggregate(&detections, 100, 100, &no_filter(), 0.3);
        assert_eq!(a, b);
    }
}
