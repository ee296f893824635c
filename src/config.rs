use anyhow::Result;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub offline: OfflineConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub announce: AnnounceConfig,
}

/// リモート推論サービスへの接続設定
#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    /// サービスのベースURL (e.g. "http://14.224.194.242:7000")
    #[serde(default = "default_host")]
    pub host: String,
    /// リクエスト各フェーズのタイムアウト（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 送信失敗時の再試行までの待機（ミリ秒）
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// サーバーに渡す腕角度の閾値（度）
    #[serde(default = "default_angle_threshold")]
    pub angle_threshold: u32,
    /// サーバーに要求する候補数
    #[serde(default = "default_top_k")]
    pub top_k: u32,
}

fn default_host() -> String { "http://14.224.194.242:7000".to_string() }
fn default_request_timeout_secs() -> u64 { 100 }
fn default_retry_backoff_ms() -> u64 { 1000 }
fn default_angle_threshold() -> u32 { 140 }
fn default_top_k() -> u32 { 3 }

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            request_timeout_secs: default_request_timeout_secs(),
            retry_backoff_ms: default_retry_backoff_ms(),
            angle_threshold: default_angle_threshold(),
            top_k: default_top_k(),
        }
    }
}

/// 録画・境界検出の設定
#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    /// 連続モードの1クリップの長さ（ミリ秒）
    #[serde(default = "default_segment_duration_ms")]
    pub segment_duration_ms: u64,
    /// 肘角度がこの値未満で「腕を上げた」と判定（度）
    #[serde(default = "default_raise_angle")]
    pub raise_angle: f32,
    /// 手首のvisibilityの下限
    #[serde(default = "default_visibility_floor")]
    pub visibility_floor: f32,
    /// ジェスチャ境界モードの再エンコードFPS
    #[serde(default = "default_encode_fps")]
    pub encode_fps: u32,
}

fn default_segment_duration_ms() -> u64 { 1000 }
fn default_raise_angle() -> f32 { 140.0 }
fn default_visibility_floor() -> f32 { 0.6 }
fn default_encode_fps() -> u32 { 30 }

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            segment_duration_ms: default_segment_duration_ms(),
            raise_angle: default_raise_angle(),
            visibility_floor: default_visibility_floor(),
            encode_fps: default_encode_fps(),
        }
    }
}

/// オフライン推論の設定
#[derive(Debug, Deserialize, Clone)]
pub struct OfflineConfig {
    /// モデルファイルのパス
    #[serde(default = "default_model_path")]
    pub model_path: String,
    /// ラベル表（index,label 形式）のパス
    #[serde(default = "default_label_path")]
    pub label_path: String,
    /// 1クリップから抽出するフレーム数
    #[serde(default = "default_frames_per_clip")]
    pub frames_per_clip: usize,
}

fn default_model_path() -> String { "models/signer.onnx".to_string() }
fn default_label_path() -> String { "models/label400.txt".to_string() }
fn default_frames_per_clip() -> usize { 20 }

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            label_path: default_label_path(),
            frames_per_clip: default_frames_per_clip(),
        }
    }
}

/// 品質警告の設定
#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    /// キュー深度がこの値を超えたら過負荷
    #[serde(default = "default_queue_threshold")]
    pub queue_threshold: usize,
    /// 応答がこの時間を超えたら「遅い」（ミリ秒）
    #[serde(default = "default_slow_response_ms")]
    pub slow_response_ms: u64,
    /// 連続した遅い応答がこの回数で警告
    #[serde(default = "default_slow_response_limit")]
    pub slow_response_limit: u32,
    /// スコアがこの値未満で低信頼
    #[serde(default = "default_low_score_floor")]
    pub low_score_floor: f64,
    /// 連続した低信頼がこの回数で警告
    #[serde(default = "default_low_score_limit")]
    pub low_score_limit: u32,
    /// 同種の警告の最小間隔（ミリ秒）
    #[serde(default = "default_warning_cooldown_ms")]
    pub warning_cooldown_ms: u64,
}

fn default_queue_threshold() -> usize { 30 }
fn default_slow_response_ms() -> u64 { 1500 }
fn default_slow_response_limit() -> u32 { 4 }
fn default_low_score_floor() -> f64 { 0.99 }
fn default_low_score_limit() -> u32 { 3 }
fn default_warning_cooldown_ms() -> u64 { 7000 }

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            queue_threshold: default_queue_threshold(),
            slow_response_ms: default_slow_response_ms(),
            slow_response_limit: default_slow_response_limit(),
            low_score_floor: default_low_score_floor(),
            low_score_limit: default_low_score_limit(),
            warning_cooldown_ms: default_warning_cooldown_ms(),
        }
    }
}

/// 結果読み上げの設定
#[derive(Debug, Deserialize, Clone)]
pub struct AnnounceConfig {
    /// 連続表示する語の間隔（ミリ秒）
    #[serde(default = "default_gloss_interval_ms")]
    pub gloss_interval_ms: u64,
}

fn default_gloss_interval_ms() -> u64 { 2000 }

impl Default for AnnounceConfig {
    fn default() -> Self {
        Self { gloss_interval_ms: default_gloss_interval_ms() }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// ファイルが無い・読めない場合はデフォルトを返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("config load failed ({e}), using defaults");
                Config::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let c = Config::default();
        assert_eq!(c.capture.segment_duration_ms, 1000);
        assert_eq!(c.monitor.queue_threshold, 30);
        assert_eq!(c.monitor.slow_response_limit, 4);
        assert_eq!(c.monitor.warning_cooldown_ms, 7000);
        assert_eq!(c.offline.frames_per_clip, 20);
        assert_eq!(c.remote.top_k, 3);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let c: Config = toml::from_str(
            r#"
            [remote]
            host = "http://192.168.1.10:7000"

            [monitor]
            queue_threshold = 10
            "#,
        )
        .unwrap();
        assert_eq!(c.remote.host, "http://192.168.1.10:7000");
        assert_eq!(c.remote.angle_threshold, 140);
        assert_eq!(c.monitor.queue_threshold, 10);
        assert_eq!(c.monitor.low_score_limit, 3);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let c = Config::load_or_default("does_not_exist.toml");
        assert_eq!(c.announce.gloss_interval_ms, 2000);
    }
}
