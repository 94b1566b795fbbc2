use serde::{Deserialize, Serialize};

/// Labels the road-damage model was trained on, indexed by class id.
pub const DEFAULT_HAZARD_LABELS: [&str; 4] = ["crack", "knocked", "pothole", "surface_damage"];

/// Class id to hazard type lookup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HazardLabels(Vec<String>);

impl HazardLabels {
    pub fn new(labels: Vec<String>) -> Self {
        Self(labels)
    }

    /// Hazard type for a class id. Unknown ids map to `class_<id>`.
    pub fn hazard_type(&self, class_id: u32) -> String {
        self.0
            .get(class_id as usize)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for HazardLabels {
    fn default() -> Self {
        Self(DEFAULT_HAZARD_LABELS.iter().map(|l| l.to_string()).collect())
    }
}
