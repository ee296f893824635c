//! Recorded clip handles and the producer→dispatcher hand-off queue.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, SystemTime};

/// 録画済みクリップ1本のハンドル
///
/// ファイルの所有権は常に1ステージ（プロデューサ→キュー→ディスパッチャ/
/// オフライン推論）だけが持つ。送信成功または一括クリアで削除される。
#[derive(Debug)]
pub struct Segment {
    path: PathBuf,
    created_at: SystemTime,
    duration: Duration,
}

impl Segment {
    pub fn new(path: PathBuf, duration: Duration) -> Self {
        Self {
            path,
            created_at: SystemTime::now(),
            duration,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "segment.mp4".to_string())
    }

    /// クリップファイルを削除してハンドルを消費する
    pub fn remove_file(self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!("failed to remove segment {}: {e}", self.path.display());
        }
    }
}

struct QueueInner {
    items: VecDeque<Segment>,
    overloaded: bool,
}

/// プロデューサとディスパッチャをつなぐFIFOキュー
///
/// enqueueは常に成功（容量は無制限）、dequeueは到着までブロックする。
/// ソフト閾値を超えると過負荷フラグが立ち、下回ると下りる。
/// 順序はFIFO: 送信失敗分は末尾に再投入され、新しいセグメントを飢えさせない。
pub struct SegmentQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
    soft_threshold: usize,
}

impl SegmentQueue {
    pub fn new(soft_threshold: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                overloaded: false,
            }),
            available: Condvar::new(),
            soft_threshold,
        }
    }

    /// 末尾に追加。深度が閾値を超えたら過負荷フラグを立てる。
    pub fn enqueue(&self, segment: Segment) {
        let mut inner = self.inner.lock().unwrap();
        inner.items.push_back(segment);
        inner.overloaded = inner.items.len() > self.soft_threshold;
        drop(inner);
        self.available.notify_one();
    }

    /// 先頭を取り出す。空なら到着までブロック。
    pub fn dequeue(&self) -> Segment {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(segment) = inner.items.pop_front() {
                inner.overloaded = inner.items.len() > self.soft_threshold;
                return segment;
            }
            inner = self.available.wait(inner).unwrap();
        }
    }

    /// タイムアウト付きdequeue。停止チェックを挟みたいコンシューマ用。
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<Segment> {
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(segment) = inner.items.pop_front() {
                inner.overloaded = inner.items.len() > self.soft_threshold;
                return Some(segment);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, result) = self
                .available
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
            if result.timed_out() && inner.items.is_empty() {
                return None;
            }
        }
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_overloaded(&self) -> bool {
        self.inner.lock().unwrap().overloaded
    }

    /// 全セグメントを取り出してファイルごと削除する（リアルタイム停止時）
    pub fn clear(&self) {
        let drained: Vec<Segment> = {
            let mut inner = self.inner.lock().unwrap();
            inner.overloaded = false;
            inner.items.drain(..).collect()
        };
        for segment in drained {
            segment.remove_file();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn seg(name: &str) -> Segment {
        Segment::new(
            std::env::temp_dir().join(format!("vsl_test_{name}.mp4")),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_fifo_order() {
        let q = SegmentQueue::new(30);
        q.enqueue(seg("a"));
        q.enqueue(seg("b"));
        q.enqueue(seg("c"));
        assert_eq!(q.dequeue().file_name(), "vsl_test_a.mp4");
        assert_eq!(q.dequeue().file_name(), "vsl_test_b.mp4");
        assert_eq!(q.dequeue().file_name(), "vsl_test_c.mp4");
    }

    #[test]
    fn test_requeue_goes_to_tail() {
        let q = SegmentQueue::new(30);
        q.enqueue(seg("a"));
        q.enqueue(seg("b"));
        let failed = q.dequeue();
        // 送信失敗分は末尾へ
        q.enqueue(failed);
        assert_eq!(q.dequeue().file_name(), "vsl_test_b.mp4");
        assert_eq!(q.dequeue().file_name(), "vsl_test_a.mp4");
    }

    #[test]
    fn test_overload_flag_hysteresis() {
        let q = SegmentQueue::new(2);
        q.enqueue(seg("a"));
        q.enqueue(seg("b"));
        assert!(!q.is_overloaded());
        q.enqueue(seg("c"));
        assert!(q.is_overloaded());
        q.dequeue();
        assert!(!q.is_overloaded());
    }

    #[test]
    fn test_blocking_dequeue() {
        let q = Arc::new(SegmentQueue::new(30));
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.dequeue().file_name());
        thread::sleep(Duration::from_millis(50));
        q.enqueue(seg("late"));
        assert_eq!(handle.join().unwrap(), "vsl_test_late.mp4");
    }

    #[test]
    fn test_dequeue_timeout_empty() {
        let q = SegmentQueue::new(30);
        let start = std::time::Instant::now();
        assert!(q.dequeue_timeout(Duration::from_millis(30)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_clear_resets_depth_and_flag() {
        let q = SegmentQueue::new(1);
        q.enqueue(seg("a"));
        q.enqueue(seg("b"));
        assert!(q.is_overloaded());
        q.clear();
        assert_eq!(q.depth(), 0);
        assert!(!q.is_overloaded());
    }
}
