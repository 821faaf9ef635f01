//! Messages crossing the boundary between the estimator and its collaborators.
//!
//! * [`TagReport`] is the per-cycle ranging payload published by the anchor device.
//! * [`Mailbox`] is the single-slot, latest-value-wins hand-off used between the transport
//!   thread and the cycle driver, and between the cycle driver and a visualization consumer.
//! * [`PopulationSnapshot`] is the read-only view of the population handed to visualization.
//!
//! ## Tag report format
//!
//! ```json
//! {
//!   "all_anc_id": ["C584", "DA36"],
//!   "C584": {"x": 0.16, "y": 0.0, "z": 1.51, "dist_to": 2.31, "quality": 100},
//!   "DA36": {"x": 0.40, "y": 3.25, "z": 0.79, "dist_to": 1.07, "quality": 96},
//!   "est_pos": {"x": 1.2, "y": 1.5, "z": 0.9, "quality": 55}
//! }
//! ```
//!
//! Anchor entries are the members listed in `all_anc_id`. When that list is absent every
//! object member carrying a `dist_to` field is taken as an anchor entry.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Position;
use crate::error::ReportError;
use crate::estimate::Estimate;
use crate::measurements::{AnchorRange, Observation};
use crate::particle::Particle;
use crate::world::AnchorId;

const ANCHOR_LIST_KEY: &str = "all_anc_id";
const ESTIMATED_POSITION_KEY: &str = "est_pos";

/// One anchor entry of a tag report, in device units.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnchorReport {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub dist_to: f64,
    #[serde(default)]
    pub quality: Option<f64>,
}

/// Position solution computed by the device itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReportedPosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub quality: Option<f64>,
}

/// Decoded tag report.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TagReport {
    pub anchors: BTreeMap<AnchorId, AnchorReport>,
    pub est_pos: Option<ReportedPosition>,
}

impl TagReport {
    /// Decode a JSON tag report.
    ///
    /// # Errors
    /// * [`ReportError::Json`] on malformed JSON or a malformed entry.
    /// * [`ReportError::NotAnObject`] when the payload is not a JSON object.
    /// * [`ReportError::MissingAnchorEntry`] when `all_anc_id` names an absent entry.
    pub fn from_json(payload: &str) -> Result<TagReport, ReportError> {
        let value: Value = serde_json::from_str(payload)?;
        let object = value.as_object().ok_or(ReportError::NotAnObject)?;

        let ids: Vec<AnchorId> = match object.get(ANCHOR_LIST_KEY).and_then(Value::as_array) {
            Some(list) => list.iter().map(id_from_value).collect(),
            None => object
                .iter()
                .filter(|(_, v)| v.get("dist_to").is_some())
                .map(|(k, _)| k.clone())
                .collect(),
        };

        let mut anchors = BTreeMap::new();
        for id in ids {
            let entry = object
                .get(&id)
                .ok_or_else(|| ReportError::MissingAnchorEntry(id.clone()))?;
            let anchor: AnchorReport = serde_json::from_value(entry.clone())?;
            anchors.insert(id, anchor);
        }

        let est_pos = match object.get(ESTIMATED_POSITION_KEY) {
            Some(Value::Null) | None => None,
            Some(v) => Some(serde_json::from_value(v.clone())?),
        };

        Ok(TagReport { anchors, est_pos })
    }

    /// Encode the report back to its wire layout.
    pub fn to_json(&self) -> Result<String, ReportError> {
        let mut object = serde_json::Map::new();
        object.insert(
            ANCHOR_LIST_KEY.to_string(),
            Value::Array(self.anchors.keys().cloned().map(Value::String).collect()),
        );
        for (id, anchor) in &self.anchors {
            object.insert(id.clone(), serde_json::to_value(anchor)?);
        }
        if let Some(est_pos) = &self.est_pos {
            object.insert(ESTIMATED_POSITION_KEY.to_string(), serde_json::to_value(est_pos)?);
        }
        Ok(serde_json::to_string(&Value::Object(object))?)
    }

    /// Convert to an [`Observation`], multiplying every length by `distance_scale`
    /// (100 converts device metres into world centimetres).
    pub fn to_observation(&self, distance_scale: f64) -> Observation {
        let mut observation = Observation::new();
        for (id, anchor) in &self.anchors {
            observation.insert(
                id.clone(),
                AnchorRange {
                    distance: anchor.dist_to * distance_scale,
                    quality: anchor.quality,
                    anchor_position: Some(Position::new(anchor.x, anchor.y, anchor.z) * distance_scale),
                },
            );
        }
        observation.reference_position = self
            .est_pos
            .as_ref()
            .map(|p| Position::new(p.x, p.y, p.z) * distance_scale);
        observation
    }
}

fn id_from_value(value: &Value) -> AnchorId {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Single-slot hand-off with latest-value-wins semantics.
///
/// Clones share the same slot. A producer [`post`](Mailbox::post)s without ever blocking on
/// the consumer; the consumer [`take_latest`](Mailbox::take_latest)s once per cycle and gets
/// `None` when nothing new arrived.
#[derive(Debug)]
pub struct Mailbox<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Mailbox {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Mailbox {
            slot: Arc::new(Mutex::new(None)),
        }
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Mailbox<T> {
        Mailbox::default()
    }

    /// Store `value`, replacing any unread one.
    ///
    /// # Returns
    /// `true` when an unread value was overwritten.
    pub fn post(&self, value: T) -> bool {
        self.lock().replace(value).is_some()
    }

    /// Remove and return the latest value, if any.
    pub fn take_latest(&self) -> Option<T> {
        self.lock().take()
    }

    pub fn has_pending(&self) -> bool {
        self.lock().is_some()
    }

    // A panicking producer cannot leave a half-written Option behind, so poison is ignored.
    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read-only copy of the population after a cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PopulationSnapshot {
    pub cycle: u64,
    pub particles: Vec<Particle>,
    pub estimate: Option<Estimate>,
}
