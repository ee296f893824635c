//! ネットワーク無しで動くオンデバイス分類。
//! 回帰型ONNXモデルとラベル表からなる。

mod engine;
mod labels;

pub use engine::{softmax, InferenceState, OfflineEngine};
pub use labels::LabelTable;
