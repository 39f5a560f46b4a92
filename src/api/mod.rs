//! Read-only HTTP projection of pipeline output.
//!
//! - `GET /cameras`: `{"data":[{"name":..,"src":..}]}` for the current configuration
//! - `GET /frames/<client>_<site>/<camera>/current_image.jpg`: latest saved frame
//! - `GET /health`: liveness plus controller state

use crate::detect::store::{sanitize_component, FRAME_FILE_NAME};
use crate::detect::FrameStore;
use crate::scheduler::{ControllerState, PipelineController};
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;
pub const DEFAULT_API_ADDR: &str = "127.0.0.1:8780";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_API_ADDR.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct CameraEntry {
    name: String,
    src: String,
}

#[derive(Serialize)]
struct CameraList {
    data: Vec<CameraEntry>,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    state: ControllerState,
}

pub struct ApiServer {
    cfg: ApiConfig,
    controller: Arc<PipelineController>,
    store: FrameStore,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, controller: Arc<PipelineController>, store: FrameStore) -> Self {
        Self {
            cfg,
            controller,
            store,
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("occupancy-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, &self, shutdown_thread) {
                    log::error!("projection api stopped: {}", err);
                }
            })?;
        log::info!("projection api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, server: &ApiServer, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, server) {
                    log::warn!("projection api request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, server: &ApiServer) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }

    match request.path.as_str() {
        "/health" => {
            let body = serde_json::to_vec(&Health {
                status: "ok",
                state: server.controller.state(),
            })?;
            write_response(&mut stream, 200, "application/json", &body)
        }
        "/cameras" => {
            let body = serde_json::to_vec(&camera_list(&server.controller))?;
            write_response(&mut stream, 200, "application/json", &body)
        }
        path if path.starts_with("/frames/") => serve_frame(&mut stream, server, path),
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn camera_list(controller: &PipelineController) -> CameraList {
    let data = controller
        .current_config()
        .map(|config| {
            let namespace = config.output_namespace();
            config
                .cameras
                .iter()
                .map(|camera| CameraEntry {
                    name: camera.name.clone(),
                    src: FrameStore::url_path_for(&namespace, &camera.name),
                })
                .collect()
        })
        .unwrap_or_default();
    CameraList { data }
}

/// Only frames of currently configured cameras are served.
fn serve_frame(stream: &mut TcpStream, server: &ApiServer, path: &str) -> Result<()> {
    let segments: Vec<String> = path
        .trim_start_matches("/frames/")
        .split('/')
        .map(percent_decode)
        .collect();
    let [namespace, camera_name, file] = segments.as_slice() else {
        return write_json_response(stream, 404, r#"{"error":"not_found"}"#);
    };
    if file != FRAME_FILE_NAME {
        return write_json_response(stream, 404, r#"{"error":"not_found"}"#);
    }

    let known = server.controller.current_config().and_then(|config| {
        if sanitize_component(&config.output_namespace()) != *namespace {
            return None;
        }
        config
            .cameras
            .iter()
            .find(|camera| sanitize_component(&camera.name) == *camera_name)
            .map(|camera| server.store.path_for(&config.output_namespace(), &camera.name))
    });
    let Some(frame_path) = known else {
        return write_json_response(stream, 404, r#"{"error":"not_found"}"#);
    };

    match std::fs::read(&frame_path) {
        Ok(bytes) => write_response(stream, 200, "image/jpeg", &bytes),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            write_json_response(stream, 404, r#"{"error":"no_frame"}"#)
        }
        Err(err) => {
            write_json_response(stream, 500, r#"{"error":"read_failed"}"#)?;
            Err(anyhow!("read {}: {}", frame_path.display(), err))
        }
    }
}

fn percent_decode(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let decoded = bytes
                .get(i + 1..i + 3)
                .and_then(|hex| std::str::from_utf8(hex).ok())
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(value) = decoded {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}
