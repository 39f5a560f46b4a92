//! Scan Orchestrator: one pass over the configured cameras.
//!
//! Fetches run concurrently, one scoped thread per camera. Results are then
//! consumed in camera-list order: detect (serialized on the shared model),
//! aggregate, publish. A camera is published as soon as its own fetch is done
//! and every camera before it has been published.

use std::sync::Arc;
use std::thread::ScopedJoinHandle;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::aggregate::{aggregate, QuadrantSummary};
use crate::camera::FrameSource;
use crate::config::{CameraConfig, PipelineConfig};
use crate::detect::{DetectorAdapter, SharedDetector};
use crate::error::{FetchError, ScanError};
use crate::publish::{PublishMessage, Publisher};

/// Outcome for one camera in one cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanCycleResult {
    pub camera_name: String,
    pub summary: QuadrantSummary,
    pub timestamp: DateTime<Utc>,
    /// `false` when the publish for this result failed.
    pub published: bool,
}

pub struct ScanOrchestrator {
    source: Arc<dyn FrameSource>,
    adapter: DetectorAdapter,
    publisher: Arc<dyn Publisher>,
}

impl ScanOrchestrator {
    pub fn new(
        source: Arc<dyn FrameSource>,
        adapter: DetectorAdapter,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            source,
            adapter,
            publisher,
        }
    }

    pub fn adapter(&self) -> &DetectorAdapter {
        &self.adapter
    }

    /// Run one cycle against `config`. Returns one result per camera, in order.
    pub fn run_cycle(&self, config: &PipelineConfig, detector: &SharedDetector) -> Vec<ScanCycleResult> {
        let started = Instant::now();
        let namespace = config.output_namespace();

        let results = std::thread::scope(|scope| {
            let pending: Vec<Option<ScopedJoinHandle<'_, Result<Vec<u8>, FetchError>>>> = config
                .cameras
                .iter()
                .map(|camera| {
                    let source = &self.source;
                    std::thread::Builder::new()
                        .name(format!("fetch-{}", camera.name))
                        .spawn_scoped(scope, move || source.fetch_frame(camera))
                        .map_err(|e| {
                            log::warn!("camera {}: fetch thread not spawned ({}); fetching inline", camera.name, e)
                        })
                        .ok()
                })
                .collect();

            config
                .cameras
                .iter()
                .zip(pending)
                .map(|(camera, handle)| {
                    let fetched = match handle {
                        Some(handle) => handle.join().unwrap_or_else(|_| {
                            Err(FetchError::Transport("fetch thread panicked".to_string()))
                        }),
                        None => self.source.fetch_frame(camera),
                    };
                    let summary = self.summarize(config, detector, camera, &namespace, fetched);
                    self.publish(config, camera, summary)
                })
                .collect::<Vec<_>>()
        });

        let online = results.iter().filter(|r| r.summary.is_online()).count();
        log::info!(
            "scan cycle finished: {}/{} cameras online in {:?}",
            online,
            results.len(),
            started.elapsed()
        );
        results
    }

    fn summarize(
        &self,
        config: &PipelineConfig,
        detector: &SharedDetector,
        camera: &CameraConfig,
        namespace: &str,
        fetched: Result<Vec<u8>, FetchError>,
    ) -> QuadrantSummary {
        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("camera {}: offline: {}", camera.name, err);
                return QuadrantSummary::offline();
            }
        };

        match self.adapter.detect(detector, &bytes, camera, namespace) {
            Ok(frame) => aggregate(
                &frame.detections,
                frame.width,
                frame.height,
                &config.filter_classes,
                config.confidence_threshold,
            ),
            Err(err @ ScanError::Inference(_)) => {
                log::warn!("camera {}: {}; reporting online with no detections", camera.name, err);
                QuadrantSummary::online_empty()
            }
            Err(err) => {
                log::warn!("camera {}: offline: {}", camera.name, err);
                QuadrantSummary::offline()
            }
        }
    }

    fn publish(&self, config: &PipelineConfig, camera: &CameraConfig, summary: QuadrantSummary) -> ScanCycleResult {
        let timestamp = Utc::now();
        let published = PublishMessage::for_summary(&config.client, &config.site, &camera.name, &summary, timestamp)
            .and_then(|message| self.publisher.publish(&message));
        if let Err(err) = &published {
            log::error!("camera {}: {}", camera.name, err);
        }
        ScanCycleResult {
            camera_name: camera.name.clone(),
            summary,
            timestamp,
            published: published.is_ok(),
        }
    }
}
