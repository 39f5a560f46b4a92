//! Saved-frame side effect.
//!
//! One JPEG per camera at `<root>/<client>_<site>/<camera>/current_image.jpg`,
//! overwritten each cycle. Writes go through a temporary sibling and a rename so
//! readers never observe a half-written file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::{ImageFormat, Rgb, RgbImage};

use super::result::Detection;

pub const FRAME_FILE_NAME: &str = "current_image.jpg";

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: u32 = 2;

#[derive(Clone, Debug)]
pub struct FrameStore {
    root: PathBuf,
}

impl FrameStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stable on-disk location for a camera's latest frame.
    pub fn path_for(&self, namespace: &str, camera_name: &str) -> PathBuf {
        self.root
            .join(sanitize_component(namespace))
            .join(sanitize_component(camera_name))
            .join(FRAME_FILE_NAME)
    }

    /// URL path under which the HTTP projection serves the frame.
    pub fn url_path_for(namespace: &str, camera_name: &str) -> String {
        format!(
            "/frames/{}/{}/{}",
            sanitize_component(namespace),
            sanitize_component(camera_name),
            FRAME_FILE_NAME
        )
    }

    /// Draw detection boxes onto a copy of `image` and save it for the camera.
    pub fn save_annotated(
        &self,
        image: &RgbImage,
        detections: &[Detection],
        namespace: &str,
        camera_name: &str,
    ) -> Result<PathBuf> {
        let mut annotated = image.clone();
        for detection in detections {
            draw_box(&mut annotated, detection);
        }
        self.save(&annotated, namespace, camera_name)
    }

    pub fn save(&self, image: &RgbImage, namespace: &str, camera_name: &str) -> Result<PathBuf> {
        let path = self.path_for(namespace, camera_name);
        let dir = path
            .parent()
            .context("frame path has no parent directory")?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create frame directory {}", dir.display()))?;

        let tmp = path.with_extension("jpg.tmp");
        image
            .save_with_format(&tmp, ImageFormat::Jpeg)
            .with_context(|| format!("encode frame to {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("move frame into place at {}", path.display()))?;
        Ok(path)
    }
}

/// Make a name safe to use as a single path segment.
pub fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

fn draw_box(image: &mut RgbImage, detection: &Detection) {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return;
    }
    let bbox = detection.bbox;
    let x1 = bbox.x1.min(width - 1);
    let x2 = bbox.x2.min(width - 1);
    let y1 = bbox.y1.min(height - 1);
    let y2 = bbox.y2.min(height - 1);

    for t in 0..BOX_THICKNESS {
        for x in x1..=x2 {
            image.put_pixel(x, (y1 + t).min(y2), BOX_COLOR);
            image.put_pixel(x, y2.saturating_sub(t).max(y1), BOX_COLOR);
        }
        for y in y1..=y2 {
            image.put_pixel((x1 + t).min(x2), y, BOX_COLOR);
            image.put_pixel(x2.saturating_sub(t).max(x1), y, BOX_COLOR);
        }
    }
}
