use anyhow::Result;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use vsl_pipeline::announcer::{Announcer, ConsoleSpeaker};
use vsl_pipeline::api::{ApiClient, ClassifyBackend};
use vsl_pipeline::config::Config;
use vsl_pipeline::dispatcher::{Dispatcher, Router};
use vsl_pipeline::monitor::QualityMonitor;
use vsl_pipeline::offline::OfflineEngine;
use vsl_pipeline::segment::SegmentQueue;

#[cfg(feature = "camera")]
use vsl_pipeline::producer::{CameraClipSource, SegmentProducer, SingleShotRecorder};

const CONFIG_PATH: &str = "config.toml";
#[cfg(feature = "camera")]
const SEGMENT_DIR: &str = "segments";

fn main() -> Result<()> {
    env_logger::init();

    let config = Config::load_or_default(CONFIG_PATH);
    let client_id = uuid::Uuid::new_v4().to_string();

    println!("=== VSL Pipeline ({}) ===", env!("GIT_VERSION"));
    println!("サーバ: {}", config.remote.host);
    println!("クライアントID: {}", client_id);
    println!();
    println!("コマンド:");
    println!("  v             - リアルタイム翻訳を開始");
    println!("  s             - リアルタイム翻訳を停止");
    println!("  r             - 単発録画の開始/終了 (終了時に一括翻訳)");
    println!("  f <path>      - 動画ファイルを一括翻訳");
    println!("  o             - 状態を表示");
    println!("  q             - 終了");
    println!();

    let backend: Arc<dyn ClassifyBackend> =
        Arc::new(ApiClient::new(&config.remote, client_id)?);
    let queue = Arc::new(SegmentQueue::new(config.monitor.queue_threshold));
    let monitor = Arc::new(Mutex::new(QualityMonitor::new(config.monitor.clone())));

    // 通知の表示スレッド
    let (display_tx, display_rx) = mpsc::channel();
    thread::spawn(move || {
        for notice in display_rx {
            println!("{}", notice_line(&notice));
        }
    });

    let announcer = Arc::new(Announcer::new(
        Arc::new(ConsoleSpeaker),
        display_tx,
        Duration::from_millis(config.announce.gloss_interval_ms),
    ));

    let offline = match OfflineEngine::new(
        PathBuf::from(&config.offline.model_path),
        PathBuf::from(&config.offline.label_path),
        config.offline.frames_per_clip,
    ) {
        Ok(engine) => Some(Arc::new(Mutex::new(engine))),
        Err(err) => {
            log::warn!("offline engine disabled: {:#}", err);
            None
        }
    };

    let router = Arc::new(Router::new(
        Arc::clone(&queue),
        Arc::clone(&backend),
        offline,
        Arc::clone(&announcer),
        Arc::clone(&monitor),
    ));

    let _dispatcher = Dispatcher::spawn(
        Arc::clone(&queue),
        Arc::clone(&backend),
        Arc::clone(&announcer),
        Arc::clone(&monitor),
        Duration::from_millis(config.remote.retry_backoff_ms),
    );

    #[cfg(feature = "camera")]
    let mut producer: Option<SegmentProducer> = None;
    #[cfg(feature = "camera")]
    let mut recorder: Option<SingleShotRecorder> = None;

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        let parts: Vec<&str> = input.trim().split_whitespace().collect();

        if parts.is_empty() {
            continue;
        }

        match parts[0] {
            "v" => {
                #[cfg(feature = "camera")]
                {
                    if producer.as_ref().is_some_and(|p| p.is_active()) {
                        println!("すでに収録中です");
                        continue;
                    }
                    let source = CameraClipSource::new(
                        0,
                        config.capture.encode_fps,
                        PathBuf::from(SEGMENT_DIR),
                    )?;
                    producer = Some(SegmentProducer::start(
                        source,
                        Arc::clone(&router),
                        Duration::from_millis(config.capture.segment_duration_ms),
                    ));
                    announcer.notify("リアルタイム翻訳を開始しました", false);
                }
                #[cfg(not(feature = "camera"))]
                println!("camera機能を有効にしてビルドしてください");
            }
            "s" => {
                #[cfg(feature = "camera")]
                if let Some(mut p) = producer.take() {
                    p.stop();
                }
                announcer.cancel();
                queue.clear();
                announcer.notify("翻訳を停止しました", false);
            }
            "r" => {
                #[cfg(feature = "camera")]
                {
                    match recorder.take() {
                        None => {
                            let source = CameraClipSource::new(
                                0,
                                config.capture.encode_fps,
                                PathBuf::from(SEGMENT_DIR),
                            )?;
                            recorder = Some(SingleShotRecorder::start(source));
                            announcer.notify("録画を開始しました。もう一度 r で終了します", false);
                        }
                        Some(active) => match active.stop() {
                            Ok(segment) => {
                                announcer.notify("録画終了、一括翻訳します", false);
                                let _ = router.translate_video(segment.path().to_path_buf());
                            }
                            Err(err) => eprintln!("録画に失敗しました: {err:#}"),
                        },
                    }
                }
                #[cfg(not(feature = "camera"))]
                println!("camera機能を有効にしてビルドしてください");
            }
            "f" if parts.len() == 2 => {
                announcer.notify(format!("一括翻訳を開始: {}", parts[1]), false);
                let _ = router.translate_video(PathBuf::from(parts[1]));
            }
            "o" => {
                println!("接続: {}", if backend.is_online() { "オンライン" } else { "オフライン" });
                println!("キュー: {}件{}", queue.depth(), if queue.is_overloaded() { " (過負荷)" } else { "" });
            }
            "q" => {
                #[cfg(feature = "camera")]
                if let Some(mut p) = producer.take() {
                    p.stop();
                }
                queue.clear();
                println!("終了します");
                break;
            }
            _ => {
                println!("不明なコマンド: {}", parts[0]);
            }
        }
    }

    Ok(())
}

fn notice_line(notice: &vsl_pipeline::announcer::Notice) -> String {
    if notice.sticky {
        format!("[結果] {}", notice.text)
    } else {
        format!("[通知] {}", notice.text)
    }
}
