use hashbrown::HashSet;

use crate::{backend::targets::TargetFeature, middle::policy::Policy};

/// Knobs shared by all three passes
#[derive(Debug, Clone)]
pub struct PassOptions {
    /// Upper bound on the rejected templates listed in a single efficiency
    /// note
    pub max_rejected_templates: usize,
    /// A template choice is only worth a note when a rejected template would
    /// have been cheaper by more than this
    pub note_cost_threshold: u32,
    /// Identical notes beyond this count are dropped for the rest of the
    /// component
    pub max_repeated_notes: usize,
    pub suppress_warnings: bool,
    pub target_features: HashSet<TargetFeature>,
    /// Policy given to nodes built without an explicit one
    pub default_policy: Policy,
}

impl Default for PassOptions {
    fn default() -> Self {
        Self {
            max_rejected_templates: 3,
            note_cost_threshold: 5,
            max_repeated_notes: 8,
            suppress_warnings: false,
            target_features: HashSet::new(),
            default_policy: Policy::default(),
        }
    }
}

impl PassOptions {
    pub fn with_features(mut self, features: impl IntoIterator<Item = TargetFeature>) -> Self {
        self.target_features.extend(features);
        self
    }
}
