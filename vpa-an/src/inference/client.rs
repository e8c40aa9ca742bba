//! Inference client adapter
//!
//! Connection-oriented WebSocket client for the pose backends. One
//! logical call per view: connect, authenticate, submit one frame batch,
//! read back one structured result.
//!
//! Image objects are fetched from the object store and submitted inline
//! (base64); video objects are submitted as sampled frame references that
//! the backend resolves itself.

use async_trait::async_trait;
use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::{InferenceError, InferenceRequest, ModelRegistry};
use crate::models::{MediaKind, ViewResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Adapter seam: the dispatch coordinator only sees this trait
///
/// Implementations must be cancellation-aware: once `cancel` fires, the
/// call abandons in-flight work promptly and returns
/// `InferenceError::Cancelled` rather than a success or generic error.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn infer(
        &self,
        request: &InferenceRequest,
        cancel: &CancellationToken,
    ) -> Result<ViewResult, InferenceError>;
}

/// Adapter tuning knobs
#[derive(Debug, Clone)]
pub struct InferenceOptions {
    /// Token presented on connect (`?token=` query parameter)
    pub service_token: String,
    /// Object store HTTP endpoint for fetching image bytes
    pub storage_endpoint: String,
    /// Sample every Nth frame of a video object
    pub frame_stride: u32,
    /// Upper bound on sampled frames per view
    pub max_frames: u32,
    /// Per-call deadline
    pub deadline: Duration,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            service_token: String::new(),
            storage_endpoint: "http://127.0.0.1:9000".to_string(),
            frame_stride: 10,
            max_frames: 15,
            deadline: Duration::from_secs(30),
        }
    }
}

/// Production adapter over tokio-tungstenite
pub struct WsInferenceClient {
    registry: ModelRegistry,
    http: reqwest::Client,
    opts: InferenceOptions,
}

impl WsInferenceClient {
    pub fn new(registry: ModelRegistry, opts: InferenceOptions) -> Self {
        Self {
            registry,
            http: reqwest::Client::new(),
            opts,
        }
    }

    async fn run_call(&self, request: &InferenceRequest) -> Result<ViewResult, InferenceError> {
        let addr = self
            .registry
            .lookup(&request.model_name)
            .ok_or_else(|| InferenceError::Config(request.model_name.clone()))?;

        let url = format!(
            "ws://{}:{}/?token={}",
            addr.host, addr.port, self.opts.service_token
        );

        let (mut ws, _) = connect_async(&url)
            .await
            .map_err(|e| InferenceError::Connect(e.to_string()))?;

        // The backend acknowledges the token before accepting frames
        let auth = read_json_frame(&mut ws).await?;
        check_authenticated(&auth)?;

        let (payload, frames_submitted) = self.build_payload(request).await?;
        ws.send(Message::Text(payload.to_string()))
            .await
            .map_err(|e| InferenceError::Connect(e.to_string()))?;

        let response = read_json_frame(&mut ws).await?;
        let _ = ws.close(None).await;

        parse_batch_response(&response, frames_submitted)
    }

    /// Build the single request frame for a view
    async fn build_payload(
        &self,
        request: &InferenceRequest,
    ) -> Result<(serde_json::Value, u32), InferenceError> {
        match request.media_kind {
            MediaKind::Image => {
                let bytes = self.fetch_object(&request.bucket, &request.object_key).await?;
                let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
                let payload = serde_json::json!({
                    "view": request.view.as_str(),
                    "image": encoded,
                });
                Ok((payload, 1))
            }
            MediaKind::Video => {
                let refs = sampled_frame_refs(
                    &request.bucket,
                    &request.object_key,
                    self.opts.frame_stride,
                    self.opts.max_frames,
                );
                let count = refs.len() as u32;
                let payload = serde_json::json!({
                    "view": request.view.as_str(),
                    "frame_refs": refs,
                });
                Ok((payload, count))
            }
        }
    }

    /// Fetch object bytes from the storage collaborator
    async fn fetch_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, InferenceError> {
        let url = format!(
            "{}/{}/{}",
            self.opts.storage_endpoint.trim_end_matches('/'),
            bucket,
            key
        );

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| InferenceError::Connect(format!("object fetch: {}", e)))?;

        if !response.status().is_success() {
            return Err(InferenceError::Connect(format!(
                "object fetch returned {} for {}",
                response.status(),
                url
            )));
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| InferenceError::Connect(format!("object fetch: {}", e)))
    }
}

#[async_trait]
impl InferenceBackend for WsInferenceClient {
    async fn infer(
        &self,
        request: &InferenceRequest,
        cancel: &CancellationToken,
    ) -> Result<ViewResult, InferenceError> {
        let deadline_ms = self.opts.deadline.as_millis() as u64;

        // Cancellation wins over everything; dropping the call future
        // tears the connection down, which is how we abandon promptly.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(InferenceError::Cancelled),
            outcome = tokio::time::timeout(self.opts.deadline, self.run_call(request)) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => Err(InferenceError::Timeout(deadline_ms)),
                }
            }
        }
    }
}

/// Frame references submitted for a video object: `bucket/key#index`
fn sampled_frame_refs(bucket: &str, key: &str, stride: u32, max_frames: u32) -> Vec<String> {
    let stride = stride.max(1);
    (0..max_frames)
        .map(|i| format!("{}/{}#{}", bucket, key, i * stride))
        .collect()
}

/// Read the next text frame and parse it as JSON
async fn read_json_frame(ws: &mut WsStream) -> Result<serde_json::Value, InferenceError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(&text)
                    .map_err(|e| InferenceError::Protocol(format!("bad JSON frame: {}", e)));
            }
            // Keepalive frames are handled by the transport; skip them
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                return Err(InferenceError::Connect(
                    "backend closed connection mid-call".to_string(),
                ));
            }
            Some(Ok(other)) => {
                return Err(InferenceError::Protocol(format!(
                    "unexpected frame type: {:?}",
                    other
                )));
            }
            Some(Err(e)) => return Err(InferenceError::Connect(e.to_string())),
        }
    }
}

fn check_authenticated(auth: &serde_json::Value) -> Result<(), InferenceError> {
    match auth.get("status").and_then(|s| s.as_str()) {
        Some("authenticated") => Ok(()),
        _ => Err(InferenceError::Protocol(format!(
            "authentication rejected: {}",
            auth
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    keypoints: serde_json::Value,
    overall_score: f64,
    #[serde(default)]
    metrics: BTreeMap<String, f64>,
    frame_count: Option<u32>,
}

fn parse_batch_response(
    response: &serde_json::Value,
    frames_submitted: u32,
) -> Result<ViewResult, InferenceError> {
    if let Some(err) = response.get("error") {
        return Err(InferenceError::Protocol(format!("error frame: {}", err)));
    }

    let batch: BatchResponse = serde_json::from_value(response.clone())
        .map_err(|e| InferenceError::Protocol(format!("malformed result frame: {}", e)))?;

    Ok(ViewResult {
        overall_score: batch.overall_score,
        metrics: batch.metrics,
        keypoints: batch.keypoints,
        frame_count: batch.frame_count.unwrap_or(frames_submitted),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_refs_respect_stride_and_cap() {
        let refs = sampled_frame_refs("videos", "u1/s1/cx_front.mp4", 10, 4);
        assert_eq!(
            refs,
            vec![
                "videos/u1/s1/cx_front.mp4#0",
                "videos/u1/s1/cx_front.mp4#10",
                "videos/u1/s1/cx_front.mp4#20",
                "videos/u1/s1/cx_front.mp4#30",
            ]
        );
    }

    #[test]
    fn zero_stride_degrades_to_every_frame() {
        let refs = sampled_frame_refs("videos", "k.mp4", 0, 3);
        assert_eq!(refs, vec!["videos/k.mp4#0", "videos/k.mp4#1", "videos/k.mp4#2"]);
    }

    #[test]
    fn auth_frame_must_say_authenticated() {
        assert!(check_authenticated(&serde_json::json!({"status": "authenticated"})).is_ok());

        let rejected = check_authenticated(&serde_json::json!({"error": "bad token"}));
        assert!(matches!(rejected, Err(InferenceError::Protocol(_))));
    }

    #[test]
    fn parses_batch_response_into_view_result() {
        let response = serde_json::json!({
            "keypoints": [[0.1, 0.2, 0.9]],
            "overall_score": 0.87,
            "metrics": {"knee_angle": 0.9, "head_tilt": 0.84},
            "frame_count": 12,
        });

        let result = parse_batch_response(&response, 15).unwrap();
        assert_eq!(result.overall_score, 0.87);
        assert_eq!(result.frame_count, 12);
        assert_eq!(result.metrics.get("knee_angle"), Some(&0.9));
    }

    #[test]
    fn frame_count_defaults_to_submitted_frames() {
        let response = serde_json::json!({"overall_score": 0.5});
        let result = parse_batch_response(&response, 15).unwrap();
        assert_eq!(result.frame_count, 15);
        assert!(result.metrics.is_empty());
    }

    #[test]
    fn error_frame_is_protocol_error() {
        let response = serde_json::json!({"error": "no person detected"});
        let err = parse_batch_response(&response, 1).unwrap_err();
        assert!(matches!(err, InferenceError::Protocol(_)));
    }

    #[test]
    fn missing_score_is_protocol_error() {
        let response = serde_json::json!({"keypoints": []});
        let err = parse_batch_response(&response, 1).unwrap_err();
        assert!(matches!(err, InferenceError::Protocol(_)));
    }
}
