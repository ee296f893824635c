//! Gesture boundary detection: turns per-frame pose landmarks into
//! start/stop events for a manually-bounded capture window.

use super::landmark::{Landmark, LandmarkFrame, LandmarkIndex};
use crate::video::RgbFrame;

/// 2点間ベクトルのなす角を b を頂点として計算（度、0〜180に正規化）
pub fn joint_angle(a: &Landmark, b: &Landmark, c: &Landmark) -> f32 {
    let radians =
        f32::atan2(c.y - b.y, c.x - b.x) - f32::atan2(a.y - b.y, a.x - b.x);
    let mut angle = radians.to_degrees().abs();
    if angle > 180.0 {
        angle = 360.0 - angle;
    }
    angle
}

/// 1フレーム分の境界シグナル
///
/// left/right は肘角度による「腕を上げた」判定。finger系は補助シグナル
/// （人差し指が手首より上にあるか）で、将来の複合ジェスチャ用。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BoundarySignals {
    pub left_raised: bool,
    pub right_raised: bool,
    pub left_index_up: bool,
    pub right_index_up: bool,
}

impl BoundarySignals {
    /// 開始・終了の複合条件（両腕上げ）
    pub fn combo(&self) -> bool {
        self.left_raised && self.right_raised
    }
}

/// 境界FSMの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryState {
    Idle,
    Collecting,
}

/// 検出器が報告するイベント
#[derive(Debug)]
pub enum BoundaryEvent {
    /// 遷移なし
    None,
    /// IDLE→COLLECTING。バッファはクリア済み
    Started,
    /// COLLECTING→IDLE。収集済み映像フレームを引き渡す
    Finished(Vec<RgbFrame>),
}

/// ポーズ角度ベースのジェスチャ境界検出器
///
/// 両腕を上げる複合ジェスチャで収集の開始・終了をマークする。
/// 複合条件は一度解除されてから再度観測されるまで再発火しない。
/// ランドマークは判定にのみ使い、バッファには映像フレームを積む。
pub struct BoundaryDetector {
    raise_angle: f32,
    visibility_floor: f32,
    state: BoundaryState,
    combo_held: bool,
    buffer: Vec<RgbFrame>,
}

impl BoundaryDetector {
    pub fn new(raise_angle: f32, visibility_floor: f32) -> Self {
        Self {
            raise_angle,
            visibility_floor,
            state: BoundaryState::Idle,
            combo_held: false,
            buffer: Vec::new(),
        }
    }

    pub fn state(&self) -> BoundaryState {
        self.state
    }

    /// 現在収集中のフレーム数
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// フレームからシグナルを計算。ポーズ未検出時は全false。
    pub fn signals(&self, frame: Option<&LandmarkFrame>) -> BoundarySignals {
        let Some(frame) = frame else {
            return BoundarySignals::default();
        };

        let left = self.arm_raised(
            frame.get(LandmarkIndex::LeftShoulder),
            frame.get(LandmarkIndex::LeftElbow),
            frame.get(LandmarkIndex::LeftWrist),
        );
        let right = self.arm_raised(
            frame.get(LandmarkIndex::RightShoulder),
            frame.get(LandmarkIndex::RightElbow),
            frame.get(LandmarkIndex::RightWrist),
        );

        // 画像座標系はYが下向き: 指先が手首より上 = yが小さい
        let left_index = frame.get(LandmarkIndex::LeftIndex);
        let left_wrist = frame.get(LandmarkIndex::LeftWrist);
        let right_index = frame.get(LandmarkIndex::RightIndex);
        let right_wrist = frame.get(LandmarkIndex::RightWrist);

        BoundarySignals {
            left_raised: left,
            right_raised: right,
            left_index_up: left_index.is_visible(self.visibility_floor)
                && left_index.y < left_wrist.y,
            right_index_up: right_index.is_visible(self.visibility_floor)
                && right_index.y < right_wrist.y,
        }
    }

    fn arm_raised(&self, shoulder: &Landmark, elbow: &Landmark, wrist: &Landmark) -> bool {
        let angle = joint_angle(shoulder, elbow, wrist);
        angle < self.raise_angle && wrist.is_visible(self.visibility_floor)
    }

    /// 1フレーム処理。収集中は映像フレームをバッファに積み、
    /// 複合条件の立ち上がりでのみ遷移する。
    pub fn process(&mut self, pose: Option<&LandmarkFrame>, image: Option<RgbFrame>) -> BoundaryEvent {
        let signals = self.signals(pose);
        let combo = signals.combo();
        let rising = combo && !self.combo_held;
        self.combo_held = combo;

        match self.state {
            BoundaryState::Idle => {
                if rising {
                    self.state = BoundaryState::Collecting;
                    self.buffer.clear();
                    return BoundaryEvent::Started;
                }
                BoundaryEvent::None
            }
            BoundaryState::Collecting => {
                if rising {
                    self.state = BoundaryState::Idle;
                    return BoundaryEvent::Finished(std::mem::take(&mut self.buffer));
                }
                if let Some(image) = image {
                    self.buffer.push(image);
                }
                BoundaryEvent::None
            }
        }
    }

    /// 状態とバッファを破棄してIDLEに戻す
    pub fn reset(&mut self) {
        self.state = BoundaryState::Idle;
        self.combo_held = false;
        self.buffer.clear();
    }
}
