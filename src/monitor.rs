//! Aggregates queue / network / confidence health signals into rate-limited
//! user warnings. Signals never drive correctness, only notification.

use std::time::{Duration, Instant};

use crate::config::MonitorConfig;

/// ユーザーに提示する警告の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Warning {
    /// キュー深度がソフト閾値を超えた
    QueueOverloaded,
    /// 遅い応答が連続した
    NetworkDegraded,
    /// 低信頼の予測が連続した
    LowConfidence,
}

impl Warning {
    pub fn message(&self) -> &'static str {
        match self {
            Warning::QueueOverloaded => "Upload queue is backing up, check your connection",
            Warning::NetworkDegraded => "Network is too slow for realtime translation",
            Warning::LowConfidence => "Recognition confidence is low, try a higher resolution",
        }
    }
}

/// 品質モニタ
///
/// 3つの独立したシグナルを監視する。各シグナルはアクティブな間、
/// クールダウン窓あたり最大1回しか警告しない。良いイベントが来たら
/// クールダウンを待たずに即座にシグナルを解除する。
pub struct QualityMonitor {
    config: MonitorConfig,
    slow_streak: u32,
    low_score_streak: u32,
    last_overload_warning: Option<Instant>,
    last_slow_warning: Option<Instant>,
    last_low_score_warning: Option<Instant>,
}

impl QualityMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            slow_streak: 0,
            low_score_streak: 0,
            last_overload_warning: None,
            last_slow_warning: None,
            last_low_score_warning: None,
        }
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.config.warning_cooldown_ms)
    }

    fn rate_limited(last: &mut Option<Instant>, cooldown: Duration, warning: Warning) -> Option<Warning> {
        let now = Instant::now();
        match *last {
            Some(t) if now.duration_since(t) <= cooldown => None,
            _ => {
                *last = Some(now);
                Some(warning)
            }
        }
    }

    /// enqueue後のキュー深度を観測する
    pub fn observe_depth(&mut self, depth: usize) -> Option<Warning> {
        if depth > self.config.queue_threshold {
            let cd = self.cooldown();
            Self::rate_limited(&mut self.last_overload_warning, cd, Warning::QueueOverloaded)
        } else {
            None
        }
    }

    /// 送信1回分の往復時間を観測する
    pub fn observe_latency(&mut self, latency: Duration) -> Option<Warning> {
        if latency > Duration::from_millis(self.config.slow_response_ms) {
            self.slow_streak += 1;
            if self.slow_streak >= self.config.slow_response_limit {
                let cd = self.cooldown();
                return Self::rate_limited(&mut self.last_slow_warning, cd, Warning::NetworkDegraded);
            }
        } else {
            // 速い応答でストリークは即リセット
            self.slow_streak = 0;
        }
        None
    }

    /// 予測トップのスコアを観測する
    pub fn observe_confidence(&mut self, score: f64) -> Option<Warning> {
        if score < self.config.low_score_floor {
            self.low_score_streak += 1;
            if self.low_score_streak >= self.config.low_score_limit {
                let cd = self.cooldown();
                return Self::rate_limited(&mut self.last_low_score_warning, cd, Warning::LowConfidence);
            }
        } else {
            self.low_score_streak = 0;
        }
        None
    }

    /// 読み上げ文言をぼかすべき低スコアか
    pub fn is_low_score(&self, score: f64) -> bool {
        score < self.config.low_score_floor
    }

    pub fn slow_streak(&self) -> u32 {
        self.slow_streak
    }

    pub fn low_score_streak(&self) -> u32 {
        self.low_score_streak
    }
}
