/// Axis-aligned box in integer pixel coordinates, `x1 <= x2` and `y1 <= y2`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    /// Build a box from two corners in any order.
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (f64::from(self.x1) + f64::from(self.x2)) / 2.0,
            (f64::from(self.y1) + f64::from(self.y2)) / 2.0,
        )
    }
}

/// One classified object in a frame. Lives for a single scan cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub class_label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(class_label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class_label: class_label.into(),
            confidence,
            bbox,
        }
    }
}
