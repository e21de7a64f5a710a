//! Vessel-type screening for vessel webhook events.
//!
//! A static CSV maps raw `vessel_type` strings to level-3 categories. It is
//! loaded once at startup and shared read-only. A vessel event that names
//! allowed level-3 categories (`incl_vessel_type_lvl3`) is only forwarded if
//! its `vessel_type` maps to at least one of them.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

/// Payload field carrying the raw vessel type.
pub const VESSEL_TYPE_FIELD: &str = "vessel_type";
/// Payload field listing the allowed level-3 categories.
pub const ALLOWED_LVL3_FIELD: &str = "incl_vessel_type_lvl3";

/// Errors loading the mapping table.
#[derive(Debug, Error)]
pub enum ClassificationError {
    /// File could not be opened.
    #[error("failed to open vessel type mapping: {0}")]
    Io(#[from] std::io::Error),
    /// File is not valid CSV or lacks the expected columns.
    #[error("failed to parse vessel type mapping: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Deserialize)]
struct MappingRow {
    vessel_type: String,
    vessel_type_level3: String,
}

/// Result of screening one event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Screening {
    /// No screening fields present; forward as-is.
    NotApplicable,
    /// The vessel type maps to an allowed category.
    Admitted,
    /// The vessel type maps to none of the allowed categories.
    Filtered {
        /// Raw vessel type from the payload, if any.
        vessel_type: Option<String>,
    },
}

/// `vessel_type` → level-3 categories, all trimmed and lowercased.
#[derive(Debug, Default)]
pub struct VesselTypeIndex {
    by_type: HashMap<String, HashSet<String>>,
    known_lvl3: HashSet<String>,
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

impl VesselTypeIndex {
    /// Load from a CSV file with `vessel_type` and `vessel_type_level3` headers.
    pub fn load(path: &Path) -> Result<Self, ClassificationError> {
        let file = std::fs::File::open(path)?;
        let index = Self::from_reader(file)?;
        info!(
            path = %path.display(),
            vessel_types = index.by_type.len(),
            categories = index.known_lvl3.len(),
            "vessel type mapping loaded"
        );
        Ok(index)
    }

    /// Parse from any CSV reader.
    pub fn from_reader(reader: impl Read) -> Result<Self, ClassificationError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut index = Self::default();
        for row in reader.deserialize::<MappingRow>() {
            let row = row?;
            index.insert(&row.vessel_type, &row.vessel_type_level3);
        }
        Ok(index)
    }

    fn insert(&mut self, vessel_type: &str, lvl3: &str) {
        let vessel_type = normalize(vessel_type);
        let lvl3 = normalize(lvl3);
        if vessel_type.is_empty() || lvl3.is_empty() {
            return;
        }
        let _ = self
            .by_type
            .entry(vessel_type)
            .or_default()
            .insert(lvl3.clone());
        let _ = self.known_lvl3.insert(lvl3);
    }

    /// Number of distinct vessel types.
    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    /// Keep only known categories; unknown ones are logged and dropped.
    pub fn known_categories<'a>(&self, requested: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
        let requested: HashSet<String> = requested.into_iter().map(normalize).collect();
        let (known, unknown): (HashSet<String>, HashSet<String>) = requested
            .into_iter()
            .partition(|c| self.known_lvl3.contains(c));
        if !unknown.is_empty() {
            let mut unknown: Vec<_> = unknown.into_iter().collect();
            unknown.sort();
            warn!(?unknown, "unknown vessel_type_level3 values in {ALLOWED_LVL3_FIELD}");
        }
        known
    }

    /// Whether `vessel_type` maps to any of `allowed`.
    pub fn matches(&self, vessel_type: &str, allowed: &HashSet<String>) -> bool {
        self.by_type
            .get(&normalize(vessel_type))
            .is_some_and(|cats| !cats.is_disjoint(allowed))
    }

    /// Screen a webhook payload.
    ///
    /// Applies only when the payload carries an `incl_vessel_type_lvl3`
    /// array; a missing or non-string `vessel_type` is then filtered.
    pub fn screen(&self, payload: &Value) -> Screening {
        let Some(requested) = payload.get(ALLOWED_LVL3_FIELD).and_then(Value::as_array) else {
            return Screening::NotApplicable;
        };
        let allowed = self.known_categories(requested.iter().filter_map(Value::as_str));
        let vessel_type = payload.get(VESSEL_TYPE_FIELD).and_then(Value::as_str);
        match vessel_type {
            Some(vt) if self.matches(vt, &allowed) => Screening::Admitted,
            _ => Screening::Filtered {
                vessel_type: vessel_type.map(str::to_owned),
            },
        }
    }
}
