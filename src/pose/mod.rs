pub mod boundary;
pub mod landmark;

pub use boundary::{joint_angle, BoundaryDetector, BoundaryEvent, BoundarySignals, BoundaryState};
pub use landmark::{Landmark, LandmarkFrame, LandmarkIndex};
