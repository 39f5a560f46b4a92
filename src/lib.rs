//! Camera occupancy scanner.
//!
//! Periodically polls a fleet of HTTP cameras, runs object detection on each
//! frame, reduces the detections to per-class counts split by image quadrant,
//! and publishes one summary per camera per cycle.
//!
//! # Module Structure
//!
//! - `config`: inbound JSON configuration and immutable `PipelineConfig` snapshots
//! - `camera`: frame fetch over HTTP with digest authentication
//! - `detect`: detector backends, model loading, frame store
//! - `aggregate`: quadrant counting
//! - `publish`: topic/payload construction, MQTT and in-memory publishers
//! - `scan`: one scan cycle across all cameras
//! - `scheduler`: periodic timer and hot reconfiguration
//! - `config_watch`: config file polling
//! - `api`: read-only HTTP projection of saved frames

pub mod aggregate;
pub mod api;
pub mod camera;
pub mod config;
pub mod config_watch;
pub mod detect;
pub mod error;
pub mod publish;
pub mod scan;
pub mod scheduler;

pub use aggregate::{aggregate, Quadrant, QuadrantSummary};
pub use camera::{CameraClient, FrameSource};
pub use config::{CameraConfig, PipelineConfig};
pub use config_watch::ConfigWatcher;
pub use detect::{
    BoundingBox, DefaultModelLoader, Detection, DetectorAdapter, FrameStore, ModelLoader,
    ObjectDetector, SharedDetector,
};
pub use error::{ConfigError, FetchError, ScanError};
pub use publish::{MemoryPublisher, PublishMessage, Publisher};
pub use scan::{ScanCycleResult, ScanOrchestrator};
pub use scheduler::{ControllerState, PipelineController};
