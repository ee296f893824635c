//! Raw RGB frame handling: the in-memory representation the gesture buffer
//! and the offline engine share, plus the sampling / padding / resizing
//! primitives offline classification needs. OpenCV-backed decode and encode
//! live behind the `camera` feature.

use std::time::Duration;

use anyhow::{ensure, Result};

/// 1枚のRGB8フレーム (データ長 = width * height * 3)
#[derive(Debug, Clone, PartialEq)]
pub struct RgbFrame {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl RgbFrame {
    pub fn new(width: usize, height: usize, data: Vec<u8>) -> Result<Self> {
        ensure!(
            data.len() == width * height * 3,
            "frame buffer size {} does not match {}x{}x3",
            data.len(),
            width,
            height
        );
        Ok(Self { width, height, data })
    }

    /// 全黒フレーム（パディング用）
    pub fn black(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0u8; width * height * 3],
        }
    }

    #[inline]
    fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
        let i = (y * self.width + x) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }
}

/// 最近傍補間でリサイズ
pub fn resize_nearest(frame: &RgbFrame, width: usize, height: usize) -> RgbFrame {
    if frame.width == width && frame.height == height {
        return frame.clone();
    }
    let mut data = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        let sy = (y * frame.height) / height;
        for x in 0..width {
            let sx = (x * frame.width) / width;
            data.extend_from_slice(&frame.pixel(sx, sy));
        }
    }
    RgbFrame { width, height, data }
}

/// 中央基準でクロップまたは黒パディングして目標サイズに合わせる
pub fn center_crop_or_pad(frame: &RgbFrame, width: usize, height: usize) -> RgbFrame {
    if frame.width == width && frame.height == height {
        return frame.clone();
    }
    let mut out = RgbFrame::black(width, height);
    // 出力座標系での転写範囲
    let dx = (width as isize - frame.width as isize) / 2;
    let dy = (height as isize - frame.height as isize) / 2;
    for y in 0..height {
        let sy = y as isize - dy;
        if sy < 0 || sy >= frame.height as isize {
            continue;
        }
        for x in 0..width {
            let sx = x as isize - dx;
            if sx < 0 || sx >= frame.width as isize {
                continue;
            }
            let src = frame.pixel(sx as usize, sy as usize);
            let i = (y * width + x) * 3;
            out.data[i..i + 3].copy_from_slice(&src);
        }
    }
    out
}

/// クリップ長に対して等間隔なサンプリング時刻を返す
pub fn sample_timestamps(duration: Duration, count: usize) -> Vec<Duration> {
    if count == 0 {
        return Vec::new();
    }
    let interval = duration / count as u32;
    (0..count).map(|i| interval * i as u32).collect()
}

/// 足りない分を黒フレームで埋める。追加した枚数を返す。
pub fn pad_to_count(frames: &mut Vec<RgbFrame>, count: usize, width: usize, height: usize) -> usize {
    let missing = count.saturating_sub(frames.len());
    for _ in 0..missing {
        frames.push(RgbFrame::black(width, height));
    }
    missing
}

#[cfg(feature = "camera")]
mod opencv_io {
    use super::*;
    use anyhow::{bail, Context};
    use opencv::core::{Mat, Size};
    use opencv::prelude::*;
    use opencv::videoio::{self, VideoCapture, VideoWriter, CAP_ANY};
    use opencv::imgproc;
    use std::path::Path;

    fn mat_to_rgb(frame: &Mat) -> Result<RgbFrame> {
        let mut rgb = Mat::default();
        imgproc::cvt_color_def(frame, &mut rgb, imgproc::COLOR_BGR2RGB)?;
        let width = rgb.cols() as usize;
        let height = rgb.rows() as usize;
        let data = rgb.data_bytes()?.to_vec();
        RgbFrame::new(width, height, data)
    }

    /// 動画から等間隔でフレームを抽出する。デコードできた分だけ返す
    /// （必要枚数への黒パディングは呼び出し側で行う）。
    pub fn extract_frames<P: AsRef<Path>>(path: P, count: usize) -> Result<Vec<RgbFrame>> {
        let mut capture = VideoCapture::from_file(
            path.as_ref().to_string_lossy().as_ref(),
            CAP_ANY,
        )
        .context("Failed to open video file")?;
        if !capture.is_opened()? {
            bail!("video {} is not available", path.as_ref().display());
        }

        let fps = capture.get(videoio::CAP_PROP_FPS)?;
        let total = capture.get(videoio::CAP_PROP_FRAME_COUNT)? as i64;
        if fps <= 0.0 || total <= 0 {
            bail!("video {} has no readable frames", path.as_ref().display());
        }

        let duration = Duration::from_secs_f64(total as f64 / fps);
        let mut frames = Vec::with_capacity(count);
        for ts in sample_timestamps(duration, count) {
            capture.set(videoio::CAP_PROP_POS_MSEC, ts.as_secs_f64() * 1000.0)?;
            let mut mat = Mat::default();
            if capture.read(&mut mat)? && !mat.empty() {
                frames.push(mat_to_rgb(&mat)?);
            } else {
                log::warn!("frame at {:?} could not be decoded", ts);
            }
        }
        Ok(frames)
    }

    /// バッファ済みフレームを再生可能なコンテナに書き出す
    pub fn encode_frames<P: AsRef<Path>>(frames: &[RgbFrame], fps: u32, out: P) -> Result<()> {
        let Some(first) = frames.first() else {
            bail!("frame buffer is empty");
        };
        let size = Size::new(first.width as i32, first.height as i32);
        let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;
        let mut writer = VideoWriter::new(
            out.as_ref().to_string_lossy().as_ref(),
            fourcc,
            fps as f64,
            size,
            true,
        )
        .context("Failed to open video writer")?;

        for frame in frames {
            let rgb = Mat::from_slice(&frame.data)?
                .reshape(3, frame.height as i32)?
                .try_clone()?;
            let mut bgr = Mat::default();
            imgproc::cvt_color_def(&rgb, &mut bgr, imgproc::COLOR_RGB2BGR)?;
            writer.write(&bgr)?;
        }
        writer.release()?;
        Ok(())
    }
}

#[cfg(feature = "camera")]
pub use opencv_io::{encode_frames, extract_frames};
