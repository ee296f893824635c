//! セグメント供給側: 連続収録ループとジェスチャ境界収録。
//!
//! カメラ入力は `ClipSource` / `FrameEncoder` の後ろに隠し、
//! 本体のロジックはカメラ無しでもテストできるようにしている。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;

use crate::dispatcher::Router;
use crate::pose::{BoundaryDetector, BoundaryEvent, LandmarkFrame};
use crate::segment::Segment;
use crate::video::RgbFrame;

/// 固定長クリップの録画装置
pub trait ClipSource: Send {
    /// 1クリップ録画してファイルに書き出す
    fn record_clip(&mut self, duration: Duration) -> Result<Segment>;
}

/// フレーム列を再生可能な動画ファイルにするエンコーダ
pub trait FrameEncoder: Send {
    fn encode(&mut self, frames: &[RgbFrame], fps: u32, out: &Path) -> Result<()>;
}

/// 映像フレームからポーズランドマークを推定する
pub trait PoseEstimator: Send {
    /// 検出できなければNone
    fn estimate(&mut self, frame: &RgbFrame) -> Option<LandmarkFrame>;
}

/// 推定器が未接続の環境用。常に未検出を返す。
#[derive(Debug, Default)]
pub struct PlaceholderPoseEstimator;

impl PoseEstimator for PlaceholderPoseEstimator {
    fn estimate(&mut self, _frame: &RgbFrame) -> Option<LandmarkFrame> {
        None
    }
}

/// 連続モードの収録ループ
///
/// 固定長クリップを録り続け、出来上がった端からルータに渡す。
/// `stop` は同期的で、返った後に新しいセグメントが投入されることはない。
pub struct SegmentProducer {
    active: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SegmentProducer {
    pub fn start<S: ClipSource + 'static>(
        mut source: S,
        router: Arc<Router>,
        clip_duration: Duration,
    ) -> Self {
        let active = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&active);
        let handle = thread::spawn(move || {
            log::info!("segment producer started");
            while flag.load(Ordering::SeqCst) {
                match source.record_clip(clip_duration) {
                    Ok(segment) => {
                        if !flag.load(Ordering::SeqCst) {
                            // 停止要求後に録り終えた分は捨てる
                            segment.remove_file();
                            break;
                        }
                        router.submit_segment(segment);
                    }
                    Err(err) => {
                        log::error!("clip capture failed: {:#}", err);
                        break;
                    }
                }
            }
            log::info!("segment producer stopped");
        });

        Self {
            active,
            handle: Some(handle),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && self.handle.is_some()
    }

    /// 収録を止め、ループスレッドの終了を待つ
    pub fn stop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SegmentProducer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// ジェスチャ境界収録
///
/// 両腕上げの合図で収集を開始・終了し、集まったフレームを
/// 動画ファイルに再エンコードしてセグメントにする。
pub struct GestureCapture<P: PoseEstimator, E: FrameEncoder> {
    estimator: P,
    encoder: E,
    detector: BoundaryDetector,
    fps: u32,
    out_dir: PathBuf,
}

impl<P: PoseEstimator, E: FrameEncoder> GestureCapture<P, E> {
    pub fn new(
        estimator: P,
        encoder: E,
        detector: BoundaryDetector,
        fps: u32,
        out_dir: PathBuf,
    ) -> Self {
        Self {
            estimator,
            encoder,
            detector,
            fps,
            out_dir,
        }
    }

    /// 1カメラフレームを処理する。ジェスチャ終了でセグメントが生まれたら返す。
    pub fn push_frame(&mut self, image: RgbFrame) -> Result<Option<Segment>> {
        let pose = self.estimator.estimate(&image);
        match self.detector.process(pose.as_ref(), Some(image)) {
            BoundaryEvent::Started => {
                log::info!("gesture capture started");
                Ok(None)
            }
            BoundaryEvent::None => Ok(None),
            BoundaryEvent::Finished(frames) => {
                log::info!("gesture capture finished with {} frames", frames.len());
                self.assemble(frames)
            }
        }
    }

    /// 収集済みフレームをセグメント化する。空ウィンドウは破棄。
    fn assemble(&mut self, frames: Vec<RgbFrame>) -> Result<Option<Segment>> {
        if frames.is_empty() {
            log::warn!("gesture window contained no frames, discarding");
            return Ok(None);
        }
        let duration = Duration::from_secs_f64(frames.len() as f64 / self.fps as f64);
        let path = self.out_dir.join(segment_file_name("gesture"));
        self.encoder.encode(&frames, self.fps, &path)?;
        Ok(Some(Segment::new(path, duration)))
    }

    pub fn reset(&mut self) {
        self.detector.reset();
    }
}

/// タイムスタンプ入りのセグメントファイル名
fn segment_file_name(prefix: &str) -> String {
    format!(
        "{}-{}.mp4",
        prefix,
        chrono::Local::now().format("%Y%m%d-%H%M%S%3f")
    )
}

#[cfg(feature = "camera")]
mod camera {
    use super::*;
    use anyhow::{bail, Context};
    use opencv::core::Mat;
    use opencv::prelude::*;
    use opencv::videoio::{self, VideoCapture, VideoWriter, CAP_ANY};

    /// OpenCVカメラから固定長クリップを録る
    pub struct CameraClipSource {
        capture: VideoCapture,
        fps: u32,
        out_dir: PathBuf,
    }

    impl CameraClipSource {
        pub fn new(device: i32, fps: u32, out_dir: PathBuf) -> Result<Self> {
            let capture = VideoCapture::new(device, CAP_ANY).context("Failed to open camera")?;
            if !capture.is_opened()? {
                bail!("camera device {} is not available", device);
            }
            std::fs::create_dir_all(&out_dir)?;
            Ok(Self {
                capture,
                fps,
                out_dir,
            })
        }
    }

    impl ClipSource for CameraClipSource {
        fn record_clip(&mut self, duration: Duration) -> Result<Segment> {
            let frame_count =
                ((self.fps as f64) * duration.as_secs_f64()).round().max(1.0) as usize;
            let path = self.out_dir.join(segment_file_name("clip"));

            let mut frame = Mat::default();
            if !self.capture.read(&mut frame)? || frame.empty() {
                bail!("camera produced no frame");
            }

            let size = frame.size()?;
            let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;
            let mut writer = VideoWriter::new(
                path.to_string_lossy().as_ref(),
                fourcc,
                self.fps as f64,
                size,
                true,
            )
            .context("Failed to open clip writer")?;

            writer.write(&frame)?;
            for _ in 1..frame_count {
                if !self.capture.read(&mut frame)? || frame.empty() {
                    log::warn!("camera stream ended mid-clip");
                    break;
                }
                writer.write(&frame)?;
            }
            writer.release()?;

            Ok(Segment::new(path, duration))
        }
    }

    impl CameraClipSource {
        /// 停止フラグが降りるまで録画してファイルを確定する
        fn record_until(&mut self, active: Arc<AtomicBool>) -> Result<Segment> {
            let path = self.out_dir.join(segment_file_name("recording"));

            let mut frame = Mat::default();
            if !self.capture.read(&mut frame)? || frame.empty() {
                bail!("camera produced no frame");
            }
            let started = std::time::Instant::now();

            let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;
            let mut writer = VideoWriter::new(
                path.to_string_lossy().as_ref(),
                fourcc,
                self.fps as f64,
                frame.size()?,
                true,
            )
            .context("Failed to open recording writer")?;

            writer.write(&frame)?;
            while active.load(Ordering::SeqCst) {
                if !self.capture.read(&mut frame)? || frame.empty() {
                    log::warn!("camera stream ended mid-recording");
                    break;
                }
                writer.write(&frame)?;
            }
            writer.release()?;

            Ok(Segment::new(path, started.elapsed()))
        }
    }

    /// 単発モード: 明示的に止められるまで1本の動画として録り続ける
    pub struct SingleShotRecorder {
        active: Arc<AtomicBool>,
        handle: JoinHandle<Result<Segment>>,
    }

    impl SingleShotRecorder {
        pub fn start(mut source: CameraClipSource) -> Self {
            let active = Arc::new(AtomicBool::new(true));
            let flag = Arc::clone(&active);
            let handle = thread::spawn(move || source.record_until(flag));
            Self { active, handle }
        }

        /// 録画を確定して出来上がったセグメントを返す
        pub fn stop(self) -> Result<Segment> {
            self.active.store(false, Ordering::SeqCst);
            match self.handle.join() {
                Ok(result) => result,
                Err(_) => bail!("recorder thread panicked"),
            }
        }
    }

    /// フレームバッファを動画に書き出すエンコーダ
    #[derive(Debug, Default)]
    pub struct OpencvEncoder;

    impl FrameEncoder for OpencvEncoder {
        fn encode(&mut self, frames: &[RgbFrame], fps: u32, out: &Path) -> Result<()> {
            crate::video::encode_frames(frames, fps, out)
        }
    }

    impl CameraClipSource {
        /// ジェスチャ境界収録用に1フレーム読む
        pub fn read_frame(&mut self) -> Result<RgbFrame> {
            let mut frame = Mat::default();
            if !self.capture.read(&mut frame)? || frame.empty() {
                bail!("camera produced no frame");
            }
            let mut rgb = Mat::default();
            opencv::imgproc::cvt_color_def(&frame, &mut rgb, opencv::imgproc::COLOR_BGR2RGB)?;
            RgbFrame::new(
                rgb.cols() as usize,
                rgb.rows() as usize,
                rgb.data_bytes()?.to_vec(),
            )
        }
    }
}

#[cfg(feature = "camera")]
pub use camera::{CameraClipSource, OpencvEncoder, SingleShotRecorder};
