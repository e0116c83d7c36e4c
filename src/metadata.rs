// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! AI-derived task attributes with per-field provenance.
//!
//! Every field carries its own `classified_at` timestamp. Timestamps only move
//! forward: the store drops a write whose timestamp is not strictly newer than
//! the stored one and reports [`MetadataWrite::Stale`]. This keeps a slow
//! classification job from overwriting a newer result that already landed.
//!
//! ```
//! use task_sync::metadata::FieldName;
//!
//! assert_eq!(FieldName::Category.as_str(), "category");
//! assert_eq!("time_estimate_minutes".parse::<FieldName>(), Ok(FieldName::TimeEstimateMinutes));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Named metadata fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldName {
    /// Recommended category (e.g. "errand", "deep_work")
    Category,
    /// Suggested label set
    Labels,
    /// Human phrasing of the estimate ("about an hour")
    TimeEstimate,
    TimeEstimateMinutes,
    /// Coarse estimate bucket (xs..xl)
    Size,
    /// Estimator self-reported confidence, kept apart from [`FieldName::Confidence`]
    EstimateConfidence,
    PriorityScore,
    EnergyLevel,
    NeedsSupplies,
    CanDelegate,
    /// Classifier self-reported confidence (0.0 - 1.0)
    Confidence,
    Reasoning,
}

impl FieldName {
    pub const ALL: [FieldName; 12] = [
        FieldName::Category,
        FieldName::Labels,
        FieldName::TimeEstimate,
        FieldName::TimeEstimateMinutes,
        FieldName::Size,
        FieldName::EstimateConfidence,
        FieldName::PriorityScore,
        FieldName::EnergyLevel,
        FieldName::NeedsSupplies,
        FieldName::CanDelegate,
        FieldName::Confidence,
        FieldName::Reasoning,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Category => "category",
            Self::Labels => "labels",
            Self::TimeEstimate => "time_estimate",
            Self::TimeEstimateMinutes => "time_estimate_minutes",
            Self::Size => "size",
            Self::EstimateConfidence => "estimate_confidence",
            Self::PriorityScore => "priority_score",
            Self::EnergyLevel => "energy_level",
            Self::NeedsSupplies => "needs_supplies",
            Self::CanDelegate => "can_delegate",
            Self::Confidence => "confidence",
            Self::Reasoning => "reasoning",
        }
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| format!("unknown metadata field '{}'", s))
    }
}

/// A stored value and the instant it was computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEntry {
    pub value: Value,
    /// Epoch millis of the classification that produced `value`
    pub classified_at: i64,
}

/// All metadata for one task.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldMetadata {
    pub task_id: String,
    pub fields: BTreeMap<FieldName, FieldEntry>,
}

impl FieldMetadata {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn get(&self, field: FieldName) -> Option<&FieldEntry> {
        self.fields.get(&field)
    }

    pub fn value(&self, field: FieldName) -> Option<&Value> {
        self.fields.get(&field).map(|e| &e.value)
    }

    pub fn classified_at(&self, field: FieldName) -> Option<i64> {
        self.fields.get(&field).map(|e| e.classified_at)
    }

    /// Apply the forward-only rule in memory. Used by the in-memory store.
    pub fn apply(&mut self, field: FieldName, value: Value, classified_at: i64) -> MetadataWrite {
        match self.fields.get(&field) {
            Some(existing) if classified_at <= existing.classified_at => MetadataWrite::Stale {
                stored_at: existing.classified_at,
            },
            _ => {
                self.fields.insert(field, FieldEntry { value, classified_at });
                MetadataWrite::Applied
            }
        }
    }
}

/// Outcome of a metadata write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum MetadataWrite {
    Applied,
    /// Dropped: the stored entry was computed at `stored_at`, which is not older
    Stale { stored_at: i64 },
}

impl MetadataWrite {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Output of the classifier collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

impl Classification {
    pub(crate) fn into_fields(self) -> Vec<(FieldName, Value)> {
        vec![
            (FieldName::Category, Value::from(self.category)),
            (FieldName::Labels, Value::from(self.labels)),
            (FieldName::Confidence, Value::from(self.confidence)),
            (FieldName::Reasoning, Value::from(self.reasoning)),
        ]
    }
}

/// Output of the time-estimation collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeEstimate {
    /// Human phrasing ("about an hour")
    pub estimate: String,
    pub minutes: u32,
    pub size: String,
    pub confidence: f64,
}

impl TimeEstimate {
    pub(crate) fn into_fields(self) -> Vec<(FieldName, Value)> {
        vec![
            (FieldName::TimeEstimate, Value::from(self.estimate)),
            (FieldName::TimeEstimateMinutes, Value::from(self.minutes)),
            (FieldName::Size, Value::from(self.size)),
            (FieldName::EstimateConfidence, Value::from(self.confidence)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_name_round_trips_through_str() {
        for field in FieldName::ALL {
            assert_eq!(field.as_str().parse::<FieldName>(), Ok(field));
        }
        assert!("nope".parse::<FieldName>().is_err());
    }

    #[test]
    fn test_apply_is_forward_only() {
        let mut meta = FieldMetadata::new("t1");
        assert!(meta.apply(FieldName::Category, json!("errand"), 10).is_applied());
        assert!(meta.apply(FieldName::Category, json!("deep_work"), 20).is_applied());
        assert_eq!(
            meta.apply(FieldName::Category, json!("errand"), 10),
            MetadataWrite::Stale { stored_at: 20 }
        );
        assert_eq!(meta.value(FieldName::Category), Some(&json!("deep_work")));
        assert_eq!(meta.classified_at(FieldName::Category), Some(20));
    }

    #[test]
    fn test_equal_timestamp_is_stale() {
        let mut meta = FieldMetadata::new("t1");
        assert!(meta.apply(FieldName::Size, json!("s"), 5).is_applied());
        assert!(!meta.apply(FieldName::Size, json!("l"), 5).is_applied());
        assert_eq!(meta.value(FieldName::Size), Some(&json!("s")));
    }

    #[test]
    fn test_fields_are_independent() {
        let mut meta = FieldMetadata::new("t1");
        assert!(meta.apply(FieldName::Category, json!("a"), 100).is_applied());
        assert!(meta.apply(FieldName::Size, json!("m"), 1).is_applied());
        assert_eq!(meta.classified_at(FieldName::Size), Some(1));
    }

    #[test]
    fn test_classification_fields() {
        let c = Classification {
            category: "errand".into(),
            labels: vec!["home".into()],
            confidence: 0.8,
            reasoning: "shopping".into(),
        };
        let fields = c.into_fields();
        assert_eq!(fields[0], (FieldName::Category, json!("errand")));
        assert_eq!(fields[1], (FieldName::Labels, json!(["home"])));
    }

    #[test]
    fn test_time_estimate_keeps_every_output() {
        let estimate = TimeEstimate {
            estimate: "about an hour".into(),
            minutes: 60,
            size: "m".into(),
            confidence: 0.7,
        };
        let fields: BTreeMap<FieldName, Value> = estimate.into_fields().into_iter().collect();
        assert_eq!(fields[&FieldName::TimeEstimate], json!("about an hour"));
        assert_eq!(fields[&FieldName::TimeEstimateMinutes], json!(60));
        assert_eq!(fields[&FieldName::Size], json!("m"));
        assert_eq!(fields[&FieldName::EstimateConfidence], json!(0.7));
        assert!(!fields.contains_key(&FieldName::Confidence));
    }
}
