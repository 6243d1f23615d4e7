//! Batch event ingestion.
//!
//! A submission carries a client-side send time `t`, the external user id
//! `u`, optional properties `s` shared by every event, and the events `e`.
//! Client event times are re-based onto the server clock with a single
//! offset anchored at `t`, which keeps the spacing and order inside a batch.
//! An event whose re-based time does not fit the server clock is dropped.
//!
//! A submission without `t`, `u` or events is rejected before any storage
//! call. So is a submission whose events are all malformed, which is checked
//! before the user is resolved: nothing is written for a batch that would
//! store no rows.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::clock::Clock;
use crate::encoding::{encode_tuple, row_of};
use crate::identity::IdentityResolver;
use crate::schema::{SchemaRegistry, Scope};
use crate::storage::{Row, Storage, Table};
use crate::value::ValueTuple;

/// Raw submission as received on the wire. Every field is optional so that a
/// malformed payload still deserializes and can be rejected as an outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Submission {
    #[serde(default)]
    pub t: Option<Value>,
    #[serde(default)]
    pub u: Option<Value>,
    #[serde(default)]
    pub s: Option<Value>,
    #[serde(default)]
    pub e: Option<Vec<Value>>,
}

impl Submission {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Parsing submission JSON")
    }
}

#[derive(Debug, Clone)]
struct ValidEvent {
    time: f64,
    name: String,
    props: Map<String, Value>,
}

impl ValidEvent {
    fn parse(raw: &Value) -> Option<Self> {
        let time = raw.get("t").and_then(Value::as_f64)?;
        let name = raw.get("n").and_then(Value::as_str)?;
        let props = raw
            .get("p")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Some(Self {
            time,
            name: name.to_string(),
            props,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum IngestOutcome {
    Rejected { reason: String },
    Accepted { events: usize, dropped: usize },
}

impl IngestOutcome {
    fn rejected(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        warn!("Rejected submission: {reason}");
        IngestOutcome::Rejected { reason }
    }
}

impl fmt::Display for IngestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestOutcome::Rejected { reason } => write!(f, "rejected: {reason}"),
            IngestOutcome::Accepted { events, dropped } => {
                write!(f, "accepted {events} event(s), dropped {dropped}")
            }
        }
    }
}

/// Maps a client event time onto the server clock, or `None` when the result
/// does not fit in epoch milliseconds.
fn rebase(now: i64, sent_at: f64, event_time: f64) -> Option<i64> {
    let offset = (event_time - sent_at).round();
    if !offset.is_finite() || offset < i64::MIN as f64 || offset >= i64::MAX as f64 {
        return None;
    }
    now.checked_add(offset as i64)
}

pub struct EventIngestionCoordinator {
    identities: Arc<IdentityResolver>,
    schema: Arc<SchemaRegistry>,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

impl EventIngestionCoordinator {
    pub fn new(
        identities: Arc<IdentityResolver>,
        schema: Arc<SchemaRegistry>,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            identities,
            schema,
            storage,
            clock,
        }
    }

    pub async fn ingest(&self, submission: &Submission) -> Result<IngestOutcome> {
        let Some(sent_at) = submission.t.as_ref().and_then(Value::as_f64) else {
            return Ok(IngestOutcome::rejected("missing submission time"));
        };
        let Some(user) = submission
            .u
            .as_ref()
            .and_then(Value::as_str)
            .filter(|user| !user.trim().is_empty())
        else {
            return Ok(IngestOutcome::rejected("missing user id"));
        };
        let raw_events = match submission.e.as_deref() {
            Some(events) if !events.is_empty() => events,
            _ => return Ok(IngestOutcome::rejected("no events")),
        };

        let events: Vec<ValidEvent> = raw_events.iter().filter_map(ValidEvent::parse).collect();
        let dropped = raw_events.len() - events.len();
        if events.is_empty() {
            return Ok(IngestOutcome::rejected("no valid events"));
        }
        if dropped > 0 {
            warn!("Dropping {dropped} malformed event(s) from submission for '{user}'");
        }
        let shared = submission
            .s
            .as_ref()
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let identity = self.identities.get_or_create(user).await?;

        let mut seen = BTreeSet::new();
        let mut entries: Vec<(String, Value)> = Vec::new();
        for (name, value) in shared.iter().chain(events.iter().flat_map(|e| e.props.iter())) {
            if seen.insert((name.clone(), value.to_string())) {
                entries.push((name.clone(), value.clone()));
            }
        }
        let column_map = self.schema.create_columns(Scope::Event, &entries).await?;

        let now = self.clock.now_millis();
        let key = identity.storage_key();
        let mut dropped = dropped;
        let rows: Vec<Row> = events
            .iter()
            .filter_map(|event| {
                let Some(server_time) = rebase(now, sent_at, event.time) else {
                    warn!("Dropping event '{}' with unrepresentable time {}", event.name, event.time);
                    dropped += 1;
                    return None;
                };
                let mut row = row_of(json!({
                    "time": server_time,
                    "event": event.name,
                    "user_alias_id": key,
                }));
                let mut props = shared.clone();
                props.extend(event.props.clone());
                for (name, value) in &props {
                    let Some(column) = column_map.get(name) else {
                        debug!("Dropping unmapped event property '{name}'");
                        continue;
                    };
                    let tuple = ValueTuple::from_json(value);
                    if !tuple.is_none() {
                        row.insert(column.clone(), encode_tuple(&tuple));
                    }
                }
                Some(row)
            })
            .collect();

        let accepted = rows.len();
        if rows.is_empty() {
            info!("No storable events for '{user}' ({dropped} dropped)");
            return Ok(IngestOutcome::Accepted { events: 0, dropped });
        }
        self.storage
            .insert(Table::Event, rows)
            .await
            .with_context(|| format!("Storing {accepted} event(s) for '{user}'"))?;
        info!("Accepted {accepted} event(s) for '{user}' ({dropped} dropped)");
        Ok(IngestOutcome::Accepted {
            events: accepted,
            dropped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_need_numeric_time_and_string_name() {
        assert!(ValidEvent::parse(&json!({"t": 1, "n": "viewed"})).is_some());
        assert!(ValidEvent::parse(&json!({"t": "1", "n": "viewed"})).is_none());
        assert!(ValidEvent::parse(&json!({"t": 1, "n": 7})).is_none());
        assert!(ValidEvent::parse(&json!({"n": "viewed"})).is_none());
    }

    #[test]
    fn rebase_rejects_times_outside_the_clock_range() {
        assert_eq!(rebase(5_000, 1_000.0, 998.0), Some(4_998));
        assert_eq!(rebase(5_000, 1_000.0, 999.5), Some(5_000));
        assert_eq!(rebase(5_000, 0.0, 1e19), None);
        assert_eq!(rebase(5_000, 0.0, -1e19), None);
        assert_eq!(rebase(i64::MAX - 1, 0.0, 10.0), None);
        assert_eq!(rebase(0, 0.0, f64::INFINITY), None);
    }

    #[test]
    fn malformed_fields_still_deserialize() {
        let submission = Submission::from_json(r#"{"t":"soon","u":42,"e":[]}"#).unwrap();
        assert_eq!(submission.t, Some(json!("soon")));
        assert_eq!(submission.u, Some(json!(42)));
        assert!(Submission::from_json("not json").is_err());
    }

    #[test]
    fn outcome_renders_as_tagged_json() {
        let outcome = IngestOutcome::Accepted {
            events: 2,
            dropped: 1,
        };
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({"outcome": "accepted", "events": 2, "dropped": 1})
        );
        assert_eq!(outcome.to_string(), "accepted 2 event(s), dropped 1");
    }
}
