//! セグメント送出ワーカと接続状態による経路選択。
//!
//! ワーカはキューから1件ずつ取り出してバックエンドに分類させる。
//! 一時的な失敗は待機後にキュー末尾へ戻し、恒久的な失敗は破棄する。

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::announcer::Announcer;
use crate::api::{ClassifyBackend, Prediction};
use crate::monitor::QualityMonitor;
use crate::offline::OfflineEngine;
use crate::segment::{Segment, SegmentQueue};

/// キュー待ちのポーリング周期
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 予測シーケンスの締めの通知文
pub const CLOSING_NOTICE: &str = "End of prediction";

/// リモート分類ワーカ
///
/// 生成と同時にバックグラウンドスレッドが走り出す。dropで停止・合流する。
pub struct Dispatcher {
    running: Arc<AtomicBool>,
    pulling: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn spawn(
        queue: Arc<SegmentQueue>,
        backend: Arc<dyn ClassifyBackend>,
        announcer: Arc<Announcer>,
        monitor: Arc<Mutex<QualityMonitor>>,
        retry_backoff: Duration,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let pulling = Arc::new(AtomicBool::new(true));

        let worker = Worker {
            queue,
            backend,
            announcer,
            monitor,
            retry_backoff,
            running: Arc::clone(&running),
            pulling: Arc::clone(&pulling),
        };
        let handle = thread::spawn(move || worker.run());

        Self {
            running,
            pulling,
            handle: Some(handle),
        }
    }

    /// キューからの取り出しを止める。処理中の1件は完了まで走る。
    pub fn pause(&self) {
        self.pulling.store(false, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.pulling.store(true, Ordering::SeqCst);
    }

    pub fn is_pulling(&self) -> bool {
        self.pulling.load(Ordering::SeqCst)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Worker {
    queue: Arc<SegmentQueue>,
    backend: Arc<dyn ClassifyBackend>,
    announcer: Arc<Announcer>,
    monitor: Arc<Mutex<QualityMonitor>>,
    retry_backoff: Duration,
    running: Arc<AtomicBool>,
    pulling: Arc<AtomicBool>,
}

impl Worker {
    fn run(&self) {
        log::info!("dispatcher started");
        while self.running.load(Ordering::SeqCst) {
            if !self.pulling.load(Ordering::SeqCst) {
                thread::sleep(POLL_INTERVAL);
                continue;
            }
            let Some(segment) = self.queue.dequeue_timeout(POLL_INTERVAL) else {
                continue;
            };
            self.handle_segment(segment);
        }
        log::info!("dispatcher stopped");
    }

    /// 1セグメントの送出。失敗してもワーカ自体は止めない。
    fn handle_segment(&self, segment: Segment) {
        let started = Instant::now();
        let result = self.backend.classify_segment(&segment);
        let latency = started.elapsed();

        let mut monitor = self.monitor.lock().unwrap();
        if let Some(warning) = monitor.observe_latency(latency) {
            self.announcer.notify(warning.message(), false);
        }

        match result {
            Ok(predictions) => {
                log::debug!(
                    "segment {} classified in {} ms",
                    segment.file_name(),
                    latency.as_millis()
                );
                segment.remove_file();
                announce_predictions(&self.announcer, &mut monitor, &predictions);
            }
            Err(err) if err.is_retryable() => {
                log::warn!(
                    "segment {} failed ({}), returning to queue",
                    segment.file_name(),
                    err
                );
                drop(monitor);
                thread::sleep(self.retry_backoff);
                self.queue.enqueue(segment);
            }
            Err(err) => {
                log::error!("segment {} dropped: {}", segment.file_name(), err);
                self.announcer.notify("Server response could not be read", false);
                segment.remove_file();
            }
        }
    }
}

/// トップ予測を読み上げ文言に変換して出す。低スコア時は断定を避ける。
pub fn announce_predictions(
    announcer: &Announcer,
    monitor: &mut QualityMonitor,
    predictions: &[Prediction],
) {
    let Some(top) = predictions.first() else {
        log::debug!("no predictions for segment");
        return;
    };
    if let Some(warning) = monitor.observe_confidence(top.score) {
        announcer.notify(warning.message(), false);
    }
    let text = if monitor.is_low_score(top.score) {
        format!("Did you mean \"{}\"?", top.gloss)
    } else {
        format!("{} ({:.1}%)", top.gloss, top.score * 100.0)
    };
    announcer.announce_sequence(vec![text], None);
}

/// 接続状態に応じてリモートキューとオフラインエンジンを振り分ける
pub struct Router {
    queue: Arc<SegmentQueue>,
    backend: Arc<dyn ClassifyBackend>,
    offline: Option<Arc<Mutex<OfflineEngine>>>,
    announcer: Arc<Announcer>,
    monitor: Arc<Mutex<QualityMonitor>>,
}

impl Router {
    pub fn new(
        queue: Arc<SegmentQueue>,
        backend: Arc<dyn ClassifyBackend>,
        offline: Option<Arc<Mutex<OfflineEngine>>>,
        announcer: Arc<Announcer>,
        monitor: Arc<Mutex<QualityMonitor>>,
    ) -> Self {
        Self {
            queue,
            backend,
            offline,
            announcer,
            monitor,
        }
    }

    /// 収録済みセグメントの投入口。投入時点の接続状態で経路が決まり、
    /// 以後そのセグメントが経路を移ることはない。
    pub fn submit_segment(&self, segment: Segment) {
        if segment.duration().is_zero() {
            log::warn!("rejecting zero-duration segment {}", segment.file_name());
            segment.remove_file();
            return;
        }
        if self.backend.is_online() {
            self.queue.enqueue(segment);
            let depth = self.queue.depth();
            if let Some(warning) = self.monitor.lock().unwrap().observe_depth(depth) {
                self.announcer.notify(warning.message(), false);
            }
        } else {
            self.classify_offline(segment);
        }
    }

    fn classify_offline(&self, segment: Segment) {
        let Some(engine) = &self.offline else {
            log::warn!("offline engine unavailable, dropping {}", segment.file_name());
            self.announcer
                .notify("Translation is unavailable while offline", false);
            segment.remove_file();
            return;
        };

        #[cfg(feature = "camera")]
        {
            let engine = Arc::clone(engine);
            let announcer = Arc::clone(&self.announcer);
            let monitor = Arc::clone(&self.monitor);
            thread::spawn(move || {
                let result = engine.lock().unwrap().classify_video(segment.path());
                match result {
                    Ok(prediction) => {
                        let mut monitor = monitor.lock().unwrap();
                        announce_predictions(&announcer, &mut monitor, &[prediction]);
                    }
                    Err(err) => {
                        log::error!("offline classification failed: {:#}", err);
                        announcer.notify("Translation failed", false);
                    }
                }
                segment.remove_file();
            });
        }
        #[cfg(not(feature = "camera"))]
        {
            let _ = engine;
            log::warn!(
                "built without camera support, cannot decode {}",
                segment.file_name()
            );
            self.announcer
                .notify("Translation is unavailable while offline", false);
            segment.remove_file();
        }
    }

    /// 動画ファイル全体の一括翻訳。ブロックごとのトップ予測を順に読み上げ、
    /// 末尾に締めの通知を付ける。
    pub fn translate_video(&self, path: PathBuf) -> JoinHandle<()> {
        let backend = Arc::clone(&self.backend);
        let offline = self.offline.clone();
        let announcer = Arc::clone(&self.announcer);
        let monitor = Arc::clone(&self.monitor);

        thread::spawn(move || {
            if backend.is_online() {
                match backend.classify_full_video(&path) {
                    Ok(blocks) => {
                        let items: Vec<String> = blocks
                            .iter()
                            .filter_map(|block| block.predictions.first())
                            .map(|p| p.gloss.clone())
                            .collect();
                        if items.is_empty() {
                            announcer.notify("No gesture detected", false);
                        } else {
                            announcer.announce_sequence(items, Some(CLOSING_NOTICE.to_string()));
                        }
                    }
                    Err(err) => {
                        log::error!("full video translation failed: {}", err);
                        announcer.notify("Translation failed", false);
                    }
                }
                return;
            }

            #[cfg(feature = "camera")]
            if let Some(engine) = &offline {
                let result = engine.lock().unwrap().classify_video(&path);
                match result {
                    Ok(prediction) => {
                        let mut monitor = monitor.lock().unwrap();
                        announce_predictions(&announcer, &mut monitor, &[prediction]);
                    }
                    Err(err) => {
                        log::error!("offline classification failed: {:#}", err);
                        announcer.notify("Translation failed", false);
                    }
                }
                return;
            }

            let _ = (&offline, &monitor);
            log::warn!("no translation path available for {}", path.display());
            announcer.notify("Translation is unavailable while offline", false);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::announcer::Notice;
    use crate::api::{ApiError, PredictionBlock};
    use crate::config::MonitorConfig;
    use std::collections::VecDeque;
    use std::fs::File;
    use std::path::{Path, PathBuf};
    use std::sync::mpsc::{channel, Receiver};

    struct RecordingSpeaker {
        spoken: Mutex<Vec<String>>,
    }

    impl RecordingSpeaker {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                spoken: Mutex::new(Vec::new()),
            })
        }
    }

    impl crate::announcer::Speaker for RecordingSpeaker {
        fn speak(&self, text: &str) {
            self.spoken.lock().unwrap().push(text.to_string());
        }
    }

    struct ScriptedBackend {
        plan: Mutex<VecDeque<Result<Vec<Prediction>, ApiError>>>,
        calls: Mutex<Vec<String>>,
        blocks: Vec<PredictionBlock>,
        delay: Duration,
        online: bool,
    }

    impl ScriptedBackend {
        fn new(plan: Vec<Result<Vec<Prediction>, ApiError>>) -> Arc<Self> {
            Arc::new(Self {
                plan: Mutex::new(plan.into()),
                calls: Mutex::new(Vec::new()),
                blocks: Vec::new(),
                delay: Duration::ZERO,
                online: true,
            })
        }

        fn call_names(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ClassifyBackend for ScriptedBackend {
        fn classify_segment(&self, segment: &Segment) -> Result<Vec<Prediction>, ApiError> {
            self.calls.lock().unwrap().push(segment.file_name());
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            self.plan
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(vec![pred("hello", 0.999)]))
        }

        fn classify_full_video(&self, _path: &Path) -> Result<Vec<PredictionBlock>, ApiError> {
            Ok(self.blocks.clone())
        }

        fn is_online(&self) -> bool {
            self.online
        }
    }

    fn pred(gloss: &str, score: f64) -> Prediction {
        Prediction {
            gloss: gloss.to_string(),
            score,
        }
    }

    fn parse_error() -> ApiError {
        serde_json::from_str::<serde_json::Value>("{").unwrap_err().into()
    }

    fn quiet_monitor() -> Arc<Mutex<QualityMonitor>> {
        Arc::new(Mutex::new(QualityMonitor::new(MonitorConfig::default())))
    }

    fn test_announcer() -> (Arc<Announcer>, Receiver<Notice>, Arc<RecordingSpeaker>) {
        let speaker = RecordingSpeaker::new();
        let (tx, rx) = channel();
        let announcer = Arc::new(Announcer::new(
            speaker.clone(),
            tx,
            Duration::from_millis(1),
        ));
        (announcer, rx, speaker)
    }

    fn temp_segment(tag: &str) -> Segment {
        let path = std::env::temp_dir().join(format!("{}-{}.mp4", tag, uuid::Uuid::new_v4()));
        File::create(&path).unwrap();
        Segment::new(path, Duration::from_secs(1))
    }

    fn wait_until(mut pred: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pred() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_segments_dispatched_in_order() {
        let queue = Arc::new(SegmentQueue::new(30));
        let backend = ScriptedBackend::new(Vec::new());
        let (announcer, _rx, _speaker) = test_announcer();

        let segments: Vec<Segment> = (0..3).map(|i| temp_segment(&format!("ord{}", i))).collect();
        let names: Vec<String> = segments.iter().map(|s| s.file_name()).collect();
        let paths: Vec<PathBuf> = segments.iter().map(|s| s.path().to_path_buf()).collect();
        for segment in segments {
            queue.enqueue(segment);
        }

        let dispatcher = Dispatcher::spawn(
            Arc::clone(&queue),
            backend.clone(),
            announcer,
            quiet_monitor(),
            Duration::from_millis(1),
        );
        wait_until(|| backend.call_names().len() == 3);
        drop(dispatcher);

        assert_eq!(backend.call_names(), names);
        for path in paths {
            assert!(!path.exists(), "segment file should be deleted");
        }
    }

    #[test]
    fn test_retryable_error_requeues_at_tail() {
        let queue = Arc::new(SegmentQueue::new(30));
        let backend = ScriptedBackend::new(vec![
            Err(ApiError::Server(reqwest::StatusCode::INTERNAL_SERVER_ERROR)),
            Ok(vec![pred("a", 0.999)]),
            Ok(vec![pred("b", 0.999)]),
        ]);
        let (announcer, _rx, _speaker) = test_announcer();

        let first = temp_segment("retry-first");
        let second = temp_segment("retry-second");
        let first_name = first.file_name();
        let second_name = second.file_name();
        queue.enqueue(first);
        queue.enqueue(second);

        let dispatcher = Dispatcher::spawn(
            Arc::clone(&queue),
            backend.clone(),
            announcer,
            quiet_monitor(),
            Duration::from_millis(1),
        );
        wait_until(|| backend.call_names().len() == 3);
        drop(dispatcher);

        // 失敗した1件目は末尾に回り、2件目の後でもう一度試行される
        assert_eq!(
            backend.call_names(),
            vec![first_name.clone(), second_name, first_name]
        );
    }

    #[test]
    fn test_parse_error_drops_segment() {
        let queue = Arc::new(SegmentQueue::new(30));
        let backend = ScriptedBackend::new(vec![Err(parse_error())]);
        let (announcer, rx, _speaker) = test_announcer();

        let segment = temp_segment("parse");
        let path = segment.path().to_path_buf();
        queue.enqueue(segment);

        let dispatcher = Dispatcher::spawn(
            Arc::clone(&queue),
            backend.clone(),
            announcer,
            quiet_monitor(),
            Duration::from_millis(1),
        );
        wait_until(|| backend.call_names().len() == 1);
        wait_until(|| !path.exists());
        drop(dispatcher);

        // 再試行されず、利用者には一度だけ通知される
        assert_eq!(backend.call_names().len(), 1);
        assert_eq!(queue.depth(), 0);
        let notice = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(notice.text.contains("Server response"));
    }

    #[test]
    fn test_pause_stops_pulling() {
        let queue = Arc::new(SegmentQueue::new(30));
        let backend = ScriptedBackend::new(Vec::new());
        let (announcer, _rx, _speaker) = test_announcer();

        let dispatcher = Dispatcher::spawn(
            Arc::clone(&queue),
            backend.clone(),
            announcer,
            quiet_monitor(),
            Duration::from_millis(1),
        );
        dispatcher.pause();
        thread::sleep(Duration::from_millis(150));
        queue.enqueue(temp_segment("paused"));
        thread::sleep(Duration::from_millis(250));
        assert!(backend.call_names().is_empty());
        assert_eq!(queue.depth(), 1);

        dispatcher.resume();
        wait_until(|| backend.call_names().len() == 1);
        drop(dispatcher);
    }

    #[test]
    fn test_slow_responses_raise_warning() {
        let queue = Arc::new(SegmentQueue::new(30));
        let backend = Arc::new(ScriptedBackend {
            plan: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            blocks: Vec::new(),
            delay: Duration::from_millis(20),
            online: true,
        });
        let (announcer, rx, _speaker) = test_announcer();
        let monitor = Arc::new(Mutex::new(QualityMonitor::new(MonitorConfig {
            slow_response_ms: 1,
            slow_response_limit: 2,
            ..MonitorConfig::default()
        })));

        queue.enqueue(temp_segment("slow-a"));
        queue.enqueue(temp_segment("slow-b"));

        let dispatcher = Dispatcher::spawn(
            Arc::clone(&queue),
            backend.clone(),
            announcer,
            monitor,
            Duration::from_millis(1),
        );
        wait_until(|| backend.call_names().len() == 2);
        drop(dispatcher);

        let expected = crate::monitor::Warning::NetworkDegraded.message();
        let mut seen = Vec::new();
        while let Ok(notice) = rx.recv_timeout(Duration::from_secs(1)) {
            if notice.text == expected {
                return;
            }
            seen.push(notice.text);
        }
        panic!("expected a network warning, got {:?}", seen);
    }

    #[test]
    fn test_failing_backend_backs_up_queue_with_single_warning() {
        let queue = Arc::new(SegmentQueue::new(2));
        let plan = (0..32)
            .map(|_| Err(ApiError::Server(reqwest::StatusCode::INTERNAL_SERVER_ERROR)))
            .collect();
        let backend = ScriptedBackend::new(plan);
        let (announcer, rx, _speaker) = test_announcer();
        let monitor = Arc::new(Mutex::new(QualityMonitor::new(MonitorConfig {
            queue_threshold: 2,
            warning_cooldown_ms: 60_000,
            ..MonitorConfig::default()
        })));
        let router = Router::new(
            Arc::clone(&queue),
            backend.clone(),
            None,
            Arc::clone(&announcer),
            Arc::clone(&monitor),
        );

        let dispatcher = Dispatcher::spawn(
            Arc::clone(&queue),
            backend.clone(),
            announcer,
            monitor,
            Duration::from_millis(200),
        );
        for i in 0..6 {
            router.submit_segment(temp_segment(&format!("backlog{}", i)));
        }
        wait_until(|| !backend.call_names().is_empty());

        // 全滅するリモートではキューは減らない（ワーカが保持するのは常に1件まで）
        assert!(queue.depth() >= 5, "depth was {}", queue.depth());

        // 閾値超過はクールダウン窓あたり1回しか警告されない
        let expected = crate::monitor::Warning::QueueOverloaded.message();
        let mut overload_warnings = 0;
        while let Ok(notice) = rx.recv_timeout(Duration::from_millis(300)) {
            if notice.text == expected {
                overload_warnings += 1;
            }
        }
        assert_eq!(overload_warnings, 1);

        drop(dispatcher);
        queue.clear();
    }

    #[test]
    fn test_router_enqueues_when_online() {
        let queue = Arc::new(SegmentQueue::new(30));
        let backend = ScriptedBackend::new(Vec::new());
        let (announcer, _rx, _speaker) = test_announcer();
        let router = Router::new(
            Arc::clone(&queue),
            backend,
            None,
            announcer,
            quiet_monitor(),
        );

        router.submit_segment(temp_segment("online"));
        assert_eq!(queue.depth(), 1);
        queue.clear();
    }

    #[test]
    fn test_router_rejects_zero_duration_segment() {
        let queue = Arc::new(SegmentQueue::new(30));
        let backend = ScriptedBackend::new(Vec::new());
        let (announcer, _rx, _speaker) = test_announcer();
        let router = Router::new(
            Arc::clone(&queue),
            backend.clone(),
            None,
            announcer,
            quiet_monitor(),
        );

        let path = std::env::temp_dir().join(format!("zero-{}.mp4", uuid::Uuid::new_v4()));
        File::create(&path).unwrap();
        router.submit_segment(Segment::new(path.clone(), Duration::ZERO));

        assert_eq!(queue.depth(), 0);
        assert!(!path.exists());
        assert!(backend.call_names().is_empty());
    }

    #[test]
    fn test_router_offline_without_engine_drops_segment() {
        let queue = Arc::new(SegmentQueue::new(30));
        let backend = Arc::new(ScriptedBackend {
            plan: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            blocks: Vec::new(),
            delay: Duration::ZERO,
            online: false,
        });
        let (announcer, rx, _speaker) = test_announcer();
        let router = Router::new(
            Arc::clone(&queue),
            backend,
            None,
            announcer,
            quiet_monitor(),
        );

        let segment = temp_segment("offline");
        let path = segment.path().to_path_buf();
        router.submit_segment(segment);

        assert_eq!(queue.depth(), 0);
        assert!(!path.exists());
        let notice = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(notice.text.contains("offline"));
    }

    #[test]
    fn test_full_video_announces_block_sequence() {
        let queue = Arc::new(SegmentQueue::new(30));
        let backend = Arc::new(ScriptedBackend {
            plan: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            blocks: vec![
                PredictionBlock {
                    predictions: vec![pred("xin chào", 0.999), pred("tạm biệt", 0.4)],
                },
                PredictionBlock {
                    predictions: vec![pred("cảm ơn", 0.998)],
                },
            ],
            delay: Duration::ZERO,
            online: true,
        });
        let (announcer, _rx, speaker) = test_announcer();
        let router = Router::new(
            Arc::clone(&queue),
            backend,
            None,
            Arc::clone(&announcer),
            quiet_monitor(),
        );

        router
            .translate_video(PathBuf::from("whole.mp4"))
            .join()
            .unwrap();
        wait_until(|| speaker.spoken.lock().unwrap().len() >= 3);

        let spoken = speaker.spoken.lock().unwrap().clone();
        assert_eq!(spoken, vec!["xin chào", "cảm ơn", CLOSING_NOTICE]);
    }

    #[test]
    fn test_full_video_empty_result_notifies() {
        let queue = Arc::new(SegmentQueue::new(30));
        let backend = ScriptedBackend::new(Vec::new());
        let (announcer, rx, _speaker) = test_announcer();
        let router = Router::new(queue, backend, None, announcer, quiet_monitor());

        router
            .translate_video(PathBuf::from("empty.mp4"))
            .join()
            .unwrap();

        let notice = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(notice.text.contains("No gesture"));
    }
}
