//! Sequential result announcer: shows and speaks predicted glosses one at a
//! time with a fixed pause, without letting warnings truncate a running
//! sequence or letting a new sequence preempt the current one.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// 読み上げバックエンド。コンソール実装の他、任意のTTSを差し込める。
pub trait Speaker: Send + Sync {
    fn speak(&self, text: &str);
}

/// 標準エラーに出すだけのSpeaker（TTSなし環境用）
#[derive(Debug, Default)]
pub struct ConsoleSpeaker;

impl Speaker for ConsoleSpeaker {
    fn speak(&self, text: &str) {
        eprintln!("[speak] {text}");
    }
}

/// 画面側に渡す表示メッセージ（トースト相当）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub text: String,
    /// trueなら明示的に消されるまで表示し続ける
    pub sticky: bool,
}

enum Command {
    Sequence {
        items: Vec<String>,
        closing: Option<String>,
    },
    Notice(Notice),
    Cancel,
    Shutdown,
}

/// 結果・通知をひとつずつ配信するワーカー
///
/// シーケンスは項目iを表示・発話してから間隔を置いて項目i+1へ進む。
/// 進行中に届いた新しいシーケンスは現在のものが終わるまで待機する。
/// 通知（警告など）は間隔の待ち時間に割り込んで配信されるが、
/// シーケンス自体は中断しない。
pub struct Announcer {
    tx: Sender<Command>,
    handle: Option<JoinHandle<()>>,
}

impl Announcer {
    pub fn new(speaker: Arc<dyn Speaker>, display: Sender<Notice>, interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || worker(rx, speaker, display, interval));
        Self {
            tx,
            handle: Some(handle),
        }
    }

    /// 語の列を順番に配信する。closingは最後の語の後に出す締めの通知。
    pub fn announce_sequence(&self, items: Vec<String>, closing: Option<String>) {
        if items.is_empty() {
            return;
        }
        let _ = self.tx.send(Command::Sequence { items, closing });
    }

    /// 単発の通知。進行中のシーケンスがあれば待ち時間に割り込む。
    pub fn notify(&self, text: impl Into<String>, sticky: bool) {
        let _ = self.tx.send(Command::Notice(Notice {
            text: text.into(),
            sticky,
        }));
    }

    /// 進行中・待機中のシーケンスをすべて破棄する
    pub fn cancel(&self) {
        let _ = self.tx.send(Command::Cancel);
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn deliver(speaker: &dyn Speaker, display: &Sender<Notice>, notice: Notice) {
    speaker.speak(&notice.text);
    let _ = display.send(notice);
}

fn worker(
    rx: Receiver<Command>,
    speaker: Arc<dyn Speaker>,
    display: Sender<Notice>,
    interval: Duration,
) {
    let mut pending: VecDeque<(Vec<String>, Option<String>)> = VecDeque::new();

    loop {
        let command = if let Some((items, closing)) = pending.pop_front() {
            // 待機していたシーケンスを先に流す
            if run_sequence(&rx, &speaker, &display, interval, items, closing, &mut pending) {
                return;
            }
            continue;
        } else {
            match rx.recv() {
                Ok(c) => c,
                Err(_) => return,
            }
        };

        match command {
            Command::Shutdown => return,
            Command::Cancel => {
                pending.clear();
            }
            Command::Notice(n) => deliver(speaker.as_ref(), &display, n),
            Command::Sequence { items, closing } => {
                if run_sequence(&rx, &speaker, &display, interval, items, closing, &mut pending) {
                    return;
                }
            }
        }
    }
}

/// 1シーケンスを配信する。Shutdownを受けたらtrueを返す。
fn run_sequence(
    rx: &Receiver<Command>,
    speaker: &Arc<dyn Speaker>,
    display: &Sender<Notice>,
    interval: Duration,
    items: Vec<String>,
    closing: Option<String>,
    pending: &mut VecDeque<(Vec<String>, Option<String>)>,
) -> bool {
    let mut cancelled = false;
    let count = items.len();

    'seq: for (i, gloss) in items.into_iter().enumerate() {
        deliver(
            speaker.as_ref(),
            display,
            Notice {
                text: gloss,
                sticky: true,
            },
        );

        if i + 1 == count {
            break;
        }

        // 次の項目までの待ち時間。通知は割り込ませ、新シーケンスは待機させる。
        let deadline = Instant::now() + interval;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match rx.recv_timeout(deadline - now) {
                Ok(Command::Shutdown) => return true,
                Ok(Command::Cancel) => {
                    pending.clear();
                    cancelled = true;
                    break 'seq;
                }
                Ok(Command::Notice(n)) => deliver(speaker.as_ref(), display, n),
                Ok(Command::Sequence { items, closing }) => {
                    pending.push_back((items, closing));
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return true,
            }
        }
    }

    if let (false, Some(text)) = (cancelled, closing) {
        deliver(
            speaker.as_ref(),
            display,
            Notice {
                text,
                sticky: false,
            },
        );
    }
    false
}
