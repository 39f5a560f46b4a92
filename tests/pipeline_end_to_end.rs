use camera_occupancy::detect::{RawDetection, StubDetector};
use camera_occupancy::{
    CameraClient, ControllerState, DetectorAdapter, FrameStore, MemoryPublisher,
    PipelineController, ScanOrchestrator, SharedDetector,
};
use image::{DynamicImage, RgbImage};
use serde_json::Value;
use std::io::{Cursor, Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn jpeg(width: u32, height: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(RgbImage::new(width, height))
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Jpeg)
        .unwrap();
    bytes
}

/// Camera that serves the same frame to anyone.
fn open_camera(frame: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let mut buf = [0u8; 2048];
            let _ = stream.read(&mut buf);
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                frame.len()
            );
            let _ = stream.write_all(head.as_bytes());
            let _ = stream.write_all(&frame);
        }
    });
    addr
}

fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[test]
fn cycle_publishes_every_camera_and_saves_frames() {
    let dir = tempdir().unwrap();
    let store = FrameStore::new(dir.path());
    let publisher = Arc::new(MemoryPublisher::new());
    let orchestrator = ScanOrchestrator::new(
        Arc::new(CameraClient::new(Duration::from_secs(2))),
        DetectorAdapter::new(store.clone()),
        publisher.clone(),
    );
    let loader = Arc::new(|_: &str| -> anyhow::Result<SharedDetector> {
        Ok(Arc::new(Mutex::new(StubDetector::with_detections(vec![
            RawDetection::new("person", 0.9, [0.0, 0.0, 10.0, 10.0]),
            RawDetection::new("person", 0.4, [60.0, 60.0, 80.0, 80.0]),
            RawDetection::new("car", 0.95, [60.0, 0.0, 90.0, 20.0]),
        ]))))
    });
    let controller = PipelineController::new(orchestrator, loader).unwrap();

    let up = open_camera(jpeg(100, 100));
    let down = closed_port();
    let raw = serde_json::json!({
        "camera_list": [
            {"name": "C1", "url": format!("http://{}/snap.jpg", up), "username": "u", "password": "p"},
            {"name": "C2", "url": format!("http://{}/snap.jpg", down), "username": "u", "password": "p"},
            {"name": "C3", "url": format!("http://{}/snap.jpg", up), "username": "u", "password": "p"},
        ],
        "scan_interval": 1,
        "site": "hq",
        "client": "acme",
        "filter_items": ["person"],
        "conf_threshold": 0.5,
        "ai_model_path": "stub:e2e",
    })
    .to_string();
    controller.reconfigure(&raw).unwrap();
    assert_eq!(controller.state(), ControllerState::Running);

    let deadline = Instant::now() + Duration::from_secs(10);
    while publisher.len() < 3 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(25));
    }
    controller.shutdown();

    let messages = publisher.messages();
    assert!(messages.len() >= 3);
    let first_cycle = &messages[..3];
    let topics: Vec<&str> = first_cycle.iter().map(|m| m.topic.as_str()).collect();
    assert_eq!(
        topics,
        [
            "devices/acme/hq/cameras/C1/all",
            "devices/acme/hq/cameras/C2/all",
            "devices/acme/hq/cameras/C3/all",
        ]
    );

    let payload = |i: usize| -> Value { serde_json::from_slice(&first_cycle[i].payload).unwrap() };
    let online = serde_json::json!([{"online": 1, "total/person": 1, "top-left-quadrant/person": 1}]);
    assert_eq!(payload(0), online);
    assert_eq!(payload(1), serde_json::json!([{"online": 0}]));
    assert_eq!(payload(2), online);

    for message in first_cycle {
        let date = message.header("Date").unwrap();
        assert_eq!(Some(date), message.header("TimeStamp"));
        assert!(date.ends_with("+00:00"));
    }

    assert!(store.path_for("acme_hq", "C1").exists());
    assert!(!store.path_for("acme_hq", "C2").exists());
    assert!(store.path_for("acme_hq", "C3").exists());
    assert_eq!(controller.state(), ControllerState::Stopped);
    assert_eq!(controller.active_timers(), 0);
}
