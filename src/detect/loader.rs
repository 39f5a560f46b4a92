use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::backend::SharedDetector;
use super::backends::StubDetector;

/// Model paths with this prefix load the [`StubDetector`].
pub const STUB_MODEL_PREFIX: &str = "stub:";

/// Builds the model handle for a configured `ai_model_path`.
///
/// The controller calls this only when the model path changes.
pub trait ModelLoader: Send + Sync {
    fn load(&self, model_path: &str) -> Result<SharedDetector>;
}

impl<F> ModelLoader for F
where
    F: Fn(&str) -> Result<SharedDetector> + Send + Sync,
{
    fn load(&self, model_path: &str) -> Result<SharedDetector> {
        self(model_path)
    }
}

/// Loader used by the daemon: stub, or YOLOv8 ONNX via tract.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultModelLoader;

impl ModelLoader for DefaultModelLoader {
    fn load(&self, model_path: &str) -> Result<SharedDetector> {
        load_detector(model_path)
    }
}

/// Resolve where the model weights actually live.
///
/// `.pt` checkpoints cannot be executed here; their `.onnx` export next to them is used.
pub fn resolve_model_path(model_path: &str) -> PathBuf {
    let path = Path::new(model_path);
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("pt") => path.with_extension("onnx"),
        _ => path.to_path_buf(),
    }
}

/// Load and warm up a detector for `model_path`.
pub fn load_detector(model_path: &str) -> Result<SharedDetector> {
    if model_path.starts_with(STUB_MODEL_PREFIX) {
        log::info!("using stub detector for '{}'", model_path);
        return Ok(Arc::new(Mutex::new(StubDetector::new())));
    }

    let resolved = resolve_model_path(model_path);
    match resolved.extension().and_then(|ext| ext.to_str()) {
        Some("onnx") => load_onnx(&resolved),
        _ => Err(anyhow!(
            "unsupported model format '{}'; expected .onnx, .pt (with .onnx export) or '{}'",
            model_path,
            STUB_MODEL_PREFIX
        )),
    }
}

#[cfg(feature = "backend-tract")]
fn load_onnx(path: &Path) -> Result<SharedDetector> {
    use super::backend::ObjectDetector;
    use super::backends::TractYoloDetector;

    let labels = super::labels::labels_for_model(path)?;
    let mut detector = TractYoloDetector::new(path, labels)?;
    detector.warm_up()?;
    log::info!("loaded {} model from {}", detector.name(), path.display());
    Ok(Arc::new(Mutex::new(detector)))
}

#[cfg(not(feature = "backend-tract"))]
fn load_onnx(path: &Path) -> Result<SharedDetector> {
    Err(anyhow!(
        "cannot load {}: ONNX models require the 'backend-tract' feature.\n\
         Recompile with: cargo build --features backend-tract",
        path.display()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ObjectDetector;

    #[test]
    fn pt_checkpoint_resolves_to_onnx_export() {
        assert_eq!(resolve_model_path("yolov8n.pt"), PathBuf::from("yolov8n.onnx"));
        assert_eq!(
            resolve_model_path("/models/custom.onnx"),
            PathBuf::from("/models/custom.onnx")
        );
    }

    #[test]
    fn stub_prefix_loads_stub_detector() {
        let detector = load_detector("stub:dry-run").expect("stub");
        let guard = detector.lock().unwrap();
        assert_eq!(guard.name(), "stub");
    }

    #[test]
    fn unknown_format_is_rejected() {
        let err = load_detector("model.tflite").err().expect("error");
        assert!(err.to_string().contains("unsupported model format"));
    }

    #[cfg(not(feature = "backend-tract"))]
    #[test]
    fn onnx_without_feature_is_rejected() {
        let err = load_detector("yolov8n.pt").err().expect("error");
        assert!(err.to_string().contains("backend-tract"));
    }
}
