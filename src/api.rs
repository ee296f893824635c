//! Remote classification service client.
//!
//! Two endpoints: `/spoter_segmented` for realtime 1-second segments and
//! `/spoter` for whole recordings. Both take a multipart form with the video
//! file and the tunables the server-side segmenter needs.

use serde::Deserialize;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::config::RemoteConfig;
use crate::segment::Segment;

/// 1件の予測（gloss + スコア）
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Prediction {
    pub gloss: String,
    pub score: f64,
}

/// `/spoter_segmented` のレスポンス
#[derive(Debug, Deserialize)]
pub struct SegmentResponse {
    #[serde(default)]
    pub predictions: Vec<Prediction>,
}

/// `/spoter` のレスポンス: ブロックごとの予測列
#[derive(Debug, Deserialize)]
pub struct FullVideoResponse {
    #[serde(default)]
    pub results_merged: Vec<PredictionBlock>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictionBlock {
    #[serde(default)]
    pub predictions: Vec<Prediction>,
}

/// Dispatch error taxonomy. Transport and server errors are retryable,
/// parse errors are not (a retry would reproduce the same malformed body).
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server returned status {0}")]
    Server(reqwest::StatusCode),
    #[error("malformed response: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("video file missing: {0}")]
    MissingFile(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Transport(_) | ApiError::Server(_))
    }
}

/// Backend seam for the dispatcher. Implement for the HTTP client or a
/// test double.
pub trait ClassifyBackend: Send + Sync {
    /// Classify one realtime segment, returning top-k predictions.
    fn classify_segment(&self, segment: &Segment) -> Result<Vec<Prediction>, ApiError>;

    /// Classify a whole recording; one prediction block per detected sign.
    fn classify_full_video(&self, video: &Path) -> Result<Vec<PredictionBlock>, ApiError>;

    /// Cheap reachability probe used to pick the remote vs offline path.
    fn is_online(&self) -> bool;
}

/// HTTP client for the translation service.
pub struct ApiClient {
    client: reqwest::blocking::Client,
    host: String,
    client_id: String,
    angle_threshold: u32,
    top_k: u32,
}

impl ApiClient {
    pub fn new(config: &RemoteConfig, client_id: String) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            host: config.host.trim_end_matches('/').to_string(),
            client_id,
            angle_threshold: config.angle_threshold,
            top_k: config.top_k,
        })
    }

    fn video_part(path: &Path) -> Result<reqwest::blocking::multipart::Part, ApiError> {
        let bytes =
            std::fs::read(path).map_err(|_| ApiError::MissingFile(path.display().to_string()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video.mp4".to_string());
        let part = reqwest::blocking::multipart::Part::bytes(bytes)
            .file_name(name)
            .mime_str("video/mp4")?;
        Ok(part)
    }

    /// 2xx以外はServer、ボディのJSONが不正ならParse
    fn post_multipart(
        &self,
        url: &str,
        form: reqwest::blocking::multipart::Form,
    ) -> Result<String, ApiError> {
        let res = self.client.post(url).multipart(form).send()?;
        if !res.status().is_success() {
            return Err(ApiError::Server(res.status()));
        }
        Ok(res.text()?)
    }
}

impl ClassifyBackend for ApiClient {
    fn classify_segment(&self, segment: &Segment) -> Result<Vec<Prediction>, ApiError> {
        let url = format!("{}/spoter_segmented", self.host);
        let form = reqwest::blocking::multipart::Form::new()
            .part("video_file", Self::video_part(segment.path())?)
            .text("clientId", self.client_id.clone())
            .text("angle_threshold", self.angle_threshold.to_string())
            .text("top_k", self.top_k.to_string());

        let body = self.post_multipart(&url, form)?;
        let parsed: SegmentResponse = serde_json::from_str(&body)?;
        Ok(parsed.predictions)
    }

    fn classify_full_video(&self, video: &Path) -> Result<Vec<PredictionBlock>, ApiError> {
        let url = format!("{}/spoter", self.host);
        let form = reqwest::blocking::multipart::Form::new()
            .part("video_file", Self::video_part(video)?)
            .text("angle_threshold", self.angle_threshold.to_string())
            .text("top_k", self.top_k.to_string());

        let body = self.post_multipart(&url, form)?;
        let parsed: FullVideoResponse = serde_json::from_str(&body)?;
        Ok(parsed.results_merged)
    }

    fn is_online(&self) -> bool {
        let Ok(url) = reqwest::Url::parse(&self.host) else {
            return false;
        };
        let Some(host) = url.host_str() else {
            return false;
        };
        let port = url.port_or_known_default().unwrap_or(80);
        let Ok(addrs) = (host, port).to_socket_addrs() else {
            return false;
        };
        for addr in addrs {
            if TcpStream::connect_timeout(&addr, Duration::from_secs(2)).is_ok() {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_segment_response() {
        let json = r#"{"predictions":[{"gloss":"xin chào","score":0.997},{"gloss":"cảm ơn","score":0.62}]}"#;
        let r: SegmentResponse = serde_json::from_str(json).unwrap();
        assert_eq!(r.predictions.len(), 2);
        assert_eq!(r.predictions[0].gloss, "xin chào");
        assert!((r.predictions[0].score - 0.997).abs() < 1e-9);
    }

    #[test]
    fn test_parse_segment_response_empty() {
        let r: SegmentResponse = serde_json::from_str("{}").unwrap();
        assert!(r.predictions.is_empty());
    }

    #[test]
    fn test_parse_full_video_response() {
        let json = r#"{
            "results_merged": [
                {"predictions": [{"gloss": "A", "score": 0.9}]},
                {"predictions": [{"gloss": "B", "score": 0.8}, {"gloss": "C", "score": 0.1}]}
            ]
        }"#;
        let r: FullVideoResponse = serde_json::from_str(json).unwrap();
        assert_eq!(r.results_merged.len(), 2);
        assert_eq!(r.results_merged[1].predictions[0].gloss, "B");
    }

    #[test]
    fn test_parse_error_is_not_retryable() {
        let err: serde_json::Error = serde_json::from_str::<SegmentResponse>("not json").unwrap_err();
        assert!(!ApiError::Parse(err).is_retryable());
    }

    #[test]
    fn test_missing_file_is_not_retryable() {
        assert!(!ApiError::MissingFile("x.mp4".into()).is_retryable());
    }
}
