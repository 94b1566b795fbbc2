mod labels;
mod result;

pub use labels::{HazardLabels, DEFAULT_HAZARD_LABELS};
pub use result::{BBox, RawDetection};
