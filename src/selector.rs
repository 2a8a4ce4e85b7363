//! Subject selection over segmentation results

use crate::config::DEFAULT_SUBJECT_LABELS;
use crate::types::{Segment, SegmentRecord};

/// Anything carrying a model-assigned label
pub trait Labeled {
    fn label(&self) -> &str;
}

impl Labeled for Segment {
    fn label(&self) -> &str {
        &self.label
    }
}

impl Labeled for SegmentRecord {
    fn label(&self) -> &str {
        &self.label
    }
}

/// Case-insensitive set of labels that count as the photographed subject
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectLabels {
    labels: Vec<String>,
}

impl Default for SubjectLabels {
    fn default() -> Self {
        Self::new(DEFAULT_SUBJECT_LABELS.iter().copied())
    }
}

impl SubjectLabels {
    /// Build a label set; configured labels are trimmed, lowercased and deduplicated
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = Vec::new();
        for label in labels {
            let label = label.as_ref().trim().to_lowercase();
            if !label.is_empty() && !normalized.contains(&label) {
                normalized.push(label);
            }
        }
        Self { labels: normalized }
    }

    /// Case-insensitive membership; model labels are not trimmed
    #[must_use]
    pub fn contains(&self, label: &str) -> bool {
        let folded = label.to_lowercase();
        self.labels.iter().any(|l| *l == folded)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.labels
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// First segment, in result order, whose label is in `labels`
#[must_use]
pub fn select_subject<'a, T: Labeled>(segments: &'a [T], labels: &SubjectLabels) -> Option<&'a T> {
    segments.iter().find(|segment| labels.contains(segment.label()))
}
