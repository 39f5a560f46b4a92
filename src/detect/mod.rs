mod adapter;
mod backend;
pub mod backends;
pub mod labels;
mod loader;
mod result;
pub mod store;

pub use adapter::{DetectorAdapter, FrameDetections};
pub use backend::{non_max_suppression, ObjectDetector, RawDetection, SharedDetector};
pub use backends::StubDetector;
pub use loader::{load_detector, resolve_model_path, DefaultModelLoader, ModelLoader, STUB_MODEL_PREFIX};
pub use result::{BoundingBox, Detection};
pub use store::FrameStore;
