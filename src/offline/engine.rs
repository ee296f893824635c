use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use ndarray::{ArrayD, IxDyn};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Session, SessionInputValue, SessionInputs};
use ort::value::Tensor;

use super::labels::LabelTable;
use crate::api::Prediction;
use crate::video::{self, RgbFrame};

/// 映像テンソルの入力名
const IMAGE_INPUT: &str = "image";
/// クラスロジットの出力名。これ以外の出力はすべて回帰状態として扱う
const LOGITS_OUTPUT: &str = "logits";

/// フレーム間で持ち回す回帰状態（テンソル名→値）
pub type InferenceState = HashMap<String, ArrayD<f32>>;

/// オンデバイス手話分類エンジン
///
/// 回帰型モデルをフレーム単位で回す。状態テンソルはモデルの入出力名から
/// 自動検出し、クリップごとにゼロ初期化する。
pub struct OfflineEngine {
    session: Session,
    labels: LabelTable,
    /// 状態テンソル名と形状（ロジット以外の出力に対応する入力）
    state_shapes: Vec<(String, Vec<usize>)>,
    input_height: usize,
    input_width: usize,
    frames_per_clip: usize,
}

impl OfflineEngine {
    /// モデルとラベル表を読み込んで初期化
    pub fn new<P: AsRef<Path>>(model_path: P, label_path: P, frames_per_clip: usize) -> Result<Self> {
        let labels = LabelTable::load(label_path.as_ref())?;
        if labels.is_empty() {
            bail!("label file {} has no entries", label_path.as_ref().display());
        }

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(model_path.as_ref())
            .context("Failed to load ONNX model")?;

        let mut image_shape: Option<Vec<usize>> = None;
        let mut state_shapes = Vec::new();
        for input in &session.inputs {
            let dims = input
                .input_type
                .tensor_shape()
                .with_context(|| format!("model input {} is not a tensor", input.name))?;
            // 動的次元はバッチ1として扱う
            let shape: Vec<usize> = dims.iter().map(|&d| if d > 0 { d as usize } else { 1 }).collect();
            if input.name == IMAGE_INPUT {
                image_shape = Some(shape);
            } else {
                state_shapes.push((input.name.clone(), shape));
            }
        }

        let image_shape = image_shape.context("model has no image input")?;
        ensure!(
            image_shape.len() == 5 && image_shape[4] == 3,
            "unexpected image input shape {:?}, want [1, 1, H, W, 3]",
            image_shape
        );
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        ensure!(
            output_names.iter().any(|n| n == LOGITS_OUTPUT),
            "model has no {} output",
            LOGITS_OUTPUT
        );
        // 各状態入力は同名の出力から次状態を受け取る。欠けたままだと
        // 推論ループの途中で初めて失敗するので、ここで弾く。
        let missing = missing_state_outputs(&state_shapes, &output_names);
        ensure!(
            missing.is_empty(),
            "state inputs {:?} have no matching model output",
            missing
        );

        log::info!(
            "offline model loaded: input {}x{}, {} state tensors, {} labels",
            image_shape[3],
            image_shape[2],
            state_shapes.len(),
            labels.len()
        );

        Ok(Self {
            session,
            labels,
            state_shapes,
            input_height: image_shape[2],
            input_width: image_shape[3],
            frames_per_clip,
        })
    }

    pub fn frames_per_clip(&self) -> usize {
        self.frames_per_clip
    }

    /// クリップ冒頭用のゼロ初期化状態
    fn init_state(&self) -> InferenceState {
        self.state_shapes
            .iter()
            .map(|(name, shape)| (name.clone(), ArrayD::zeros(IxDyn(shape))))
            .collect()
    }

    /// リサイズ・センタークロップ・正規化して [1, 1, H, W, 3] にする
    fn preprocess(&self, frame: &RgbFrame) -> Result<ArrayD<f32>> {
        let resized = video::resize_nearest(frame, self.input_width, self.input_height);
        let fitted = video::center_crop_or_pad(&resized, self.input_width, self.input_height);
        let data: Vec<f32> = fitted.data.iter().map(|&b| b as f32 / 255.0).collect();
        let shape = [1, 1, self.input_height, self.input_width, 3];
        ArrayD::from_shape_vec(IxDyn(&shape), data).context("Failed to build image tensor")
    }

    /// 固定枚数に整えたフレーム列を1クリップとして分類する
    ///
    /// 状態はクリップごとにゼロから始まり、途中で失敗しても次の呼び出しに
    /// 持ち越されない。
    pub fn classify_frames(&mut self, frames: &[RgbFrame]) -> Result<Prediction> {
        ensure!(
            frames.len() == self.frames_per_clip,
            "expected {} frames, got {}",
            self.frames_per_clip,
            frames.len()
        );

        let mut state = self.init_state();
        let mut logits: Option<Vec<f32>> = None;

        for (i, frame) in frames.iter().enumerate() {
            let image = self.preprocess(frame)?;

            let mut feed: Vec<(Cow<'static, str>, SessionInputValue<'_>)> =
                Vec::with_capacity(1 + state.len());
            feed.push((Cow::Borrowed(IMAGE_INPUT), Tensor::from_array(image)?.into()));
            for (name, value) in &state {
                feed.push((Cow::Owned(name.clone()), Tensor::from_array(value.clone())?.into()));
            }

            let outputs = self
                .session
                .run(SessionInputs::from(feed))
                .context("Inference failed")?;

            let mut next_state = InferenceState::with_capacity(self.state_shapes.len());
            for (name, _) in &self.state_shapes {
                let view: ndarray::ArrayViewD<f32> = outputs[name.as_str()]
                    .try_extract_array()
                    .with_context(|| format!("Failed to extract state tensor {}", name))?;
                next_state.insert(name.clone(), view.to_owned());
            }

            if i == frames.len() - 1 {
                let view: ndarray::ArrayViewD<f32> = outputs[LOGITS_OUTPUT]
                    .try_extract_array()
                    .context("Failed to extract logits")?;
                logits = Some(view.iter().copied().collect());
            }

            drop(outputs);
            state = next_state;
        }

        let logits = logits.context("model produced no logits")?;
        let scores = softmax(&logits);
        let (index, score) = scores
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .context("model produced empty logits")?;
        let gloss = self
            .labels
            .get(index)
            .with_context(|| format!("no label for class index {}", index))?;

        Ok(Prediction {
            gloss: gloss.to_string(),
            score: score as f64,
        })
    }

    /// 可変長のフレームバッファを分類する。長すぎれば等間隔に間引き、
    /// 足りなければ黒フレームで埋める。
    pub fn classify_clip(&mut self, frames: &[RgbFrame]) -> Result<Prediction> {
        ensure!(!frames.is_empty(), "frame buffer is empty");

        let mut sampled: Vec<RgbFrame> = sample_indices(frames.len(), self.frames_per_clip)
            .into_iter()
            .map(|i| frames[i].clone())
            .collect();
        let (width, height) = (sampled[0].width, sampled[0].height);
        let padded = video::pad_to_count(&mut sampled, self.frames_per_clip, width, height);
        if padded > 0 {
            log::debug!("padded clip with {} blank frames", padded);
        }
        self.classify_frames(&sampled)
    }

    /// 動画ファイルを1クリップとして分類する
    #[cfg(feature = "camera")]
    pub fn classify_video<P: AsRef<Path>>(&mut self, path: P) -> Result<Prediction> {
        let frames = video::extract_frames(path.as_ref(), self.frames_per_clip)?;
        ensure!(
            !frames.is_empty(),
            "no frames decoded from {}",
            path.as_ref().display()
        );
        self.classify_clip(&frames)
    }
}

/// 同名の出力が無い状態入力を列挙する
fn missing_state_outputs(states: &[(String, Vec<usize>)], outputs: &[String]) -> Vec<String> {
    states
        .iter()
        .map(|(name, _)| name)
        .filter(|&name| !outputs.contains(name))
        .cloned()
        .collect()
}

/// count枚に収まる等間隔サンプリングのインデックス列
/// （len < count のときは全インデックス）
fn sample_indices(len: usize, count: usize) -> Vec<usize> {
    if len <= count {
        return (0..len).collect();
    }
    (0..count).map(|i| i * len / count).collect()
}

/// ロジットを確率分布に正規化
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|v| v / sum).collect()
}
