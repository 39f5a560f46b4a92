//! Camera Client: one still frame per call over HTTP with digest authentication.

pub mod digest;

use std::io::Read;
use std::time::Duration;

use url::Url;

use crate::config::CameraConfig;
use crate::error::FetchError;

pub use digest::DigestChallenge;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on a single frame body.
pub const MAX_FRAME_BYTES: u64 = 16 * 1024 * 1024;

/// Anything that can deliver one frame for a camera. Shared across the
/// per-camera fetch threads of a cycle.
pub trait FrameSource: Send + Sync {
    fn fetch_frame(&self, camera: &CameraConfig) -> Result<Vec<u8>, FetchError>;
}

impl<F> FrameSource for F
where
    F: Fn(&CameraConfig) -> Result<Vec<u8>, FetchError> + Send + Sync,
{
    fn fetch_frame(&self, camera: &CameraConfig) -> Result<Vec<u8>, FetchError> {
        self(camera)
    }
}

/// Blocking HTTP camera client. Every request is bounded by the agent timeout.
#[derive(Clone, Debug)]
pub struct CameraClient {
    agent: ureq::Agent,
    timeout: Duration,
}

impl Default for CameraClient {
    fn default() -> Self {
        Self::new(DEFAULT_FETCH_TIMEOUT)
    }
}

impl CameraClient {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .redirects(0)
            .build();
        Self { agent, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn get(&self, url: &str, authorization: Option<&str>) -> Result<ureq::Response, ureq::Error> {
        let request = self.agent.get(url);
        match authorization {
            Some(value) => request.set("Authorization", value).call(),
            None => request.call(),
        }
    }
}

impl FrameSource for CameraClient {
    fn fetch_frame(&self, camera: &CameraConfig) -> Result<Vec<u8>, FetchError> {
        let uri = request_uri(&camera.url)?;

        let challenge = match self.get(&camera.url, None) {
            Ok(response) => return read_body(response),
            Err(ureq::Error::Status(401, response)) => {
                DigestChallenge::select(response.all("WWW-Authenticate"))
                    .ok_or(FetchError::Status { status: 401 })?
            }
            Err(err) => return Err(classify(err)),
        };

        log::debug!(
            "camera {}: answering {:?} digest challenge",
            camera.name,
            challenge.algorithm
        );
        let authorization =
            challenge.authorization(&camera.username, &camera.password, "GET", &uri);
        match self.get(&camera.url, Some(&authorization)) {
            Ok(response) => read_body(response),
            Err(err) => Err(classify(err)),
        }
    }
}

/// Path and query of `url`, as sent on the request line.
pub fn request_uri(url: &str) -> Result<String, FetchError> {
    let parsed = Url::parse(url).map_err(|e| FetchError::Transport(format!("invalid camera url: {}", e)))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(FetchError::Transport(format!(
                "unsupported camera url scheme: {}",
                other
            )))
        }
    }
    let mut uri = parsed.path().to_string();
    if let Some(query) = parsed.query() {
        uri.push('?');
        uri.push_str(query);
    }
    Ok(uri)
}

fn classify(err: ureq::Error) -> FetchError {
    match err {
        ureq::Error::Status(status, _) => FetchError::Status { status },
        ureq::Error::Transport(transport) => FetchError::Transport(transport.to_string()),
    }
}

fn read_body(response: ureq::Response) -> Result<Vec<u8>, FetchError> {
    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(FetchError::Status { status });
    }
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_FRAME_BYTES + 1)
        .read_to_end(&mut bytes)
        .map_err(|e| FetchError::Transport(format!("read body: {}", e)))?;
    if bytes.is_empty() {
        return Err(FetchError::Body("empty body".to_string()));
    }
    if bytes.len() as u64 > MAX_FRAME_BYTES {
        return Err(FetchError::Body(format!(
            "frame exceeds {} bytes",
            MAX_FRAME_BYTES
        )));
    }
    Ok(bytes)
}
