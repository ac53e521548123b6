// ── Wire-to-model conversions ──
//
// Bridges GMPP `Value`s into the fabric's `Variant` model. Only scalars
// have a Variant counterpart; lists and maps are skipped when building
// attribute maps. `Void` and `Null` map onto each other.

use chrono::{DateTime, Utc};
use openscada_net::{Value, ValueMap};
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::{Attributes, Event, Variant};

// ── Variant <-> Value ────────────────────────────────────────────────

impl From<&Variant> for Value {
    fn from(variant: &Variant) -> Self {
        match variant {
            Variant::Null => Value::Void,
            Variant::Bool(b) => Value::Boolean(*b),
            Variant::Int32(i) => Value::Integer(*i),
            Variant::Int64(i) => Value::Long(*i),
            Variant::Float64(f) => Value::Double(*f),
            Variant::String(s) => Value::String(s.clone()),
        }
    }
}

impl From<Variant> for Value {
    fn from(variant: Variant) -> Self {
        Value::from(&variant)
    }
}

/// Scalar wire value to Variant; `None` for lists and maps.
pub fn value_to_variant(value: &Value) -> Option<Variant> {
    Some(match value {
        Value::Void => Variant::Null,
        Value::Boolean(b) => Variant::Bool(*b),
        Value::Integer(i) => Variant::Int32(*i),
        Value::Long(i) => Variant::Int64(*i),
        Value::Double(f) => Variant::Float64(*f),
        Value::String(s) => Variant::String(s.clone()),
        Value::List(_) | Value::Map(_) => return None,
    })
}

// ── Attributes <-> ValueMap ──────────────────────────────────────────

pub fn attributes_to_map(attributes: &Attributes) -> ValueMap {
    attributes
        .iter()
        .map(|(name, v)| (name.clone(), Value::from(v)))
        .collect()
}

pub fn map_to_attributes(map: &ValueMap) -> Attributes {
    map.iter()
        .filter_map(|(name, v)| value_to_variant(v).map(|v| (name.clone(), v)))
        .collect()
}

// ── Event <-> ValueMap ───────────────────────────────────────────────

const EVENT_ID: &str = "id";
const EVENT_SOURCE_TS: &str = "source-timestamp";
const EVENT_ENTRY_TS: &str = "entry-timestamp";
const EVENT_NODE_ID: &str = "node-id";
const EVENT_ATTRIBUTES: &str = "attributes";

/// Binary form of an event: a GMPP map with millisecond timestamps.
pub fn event_to_map(event: &Event) -> ValueMap {
    let mut map = ValueMap::new();
    map.insert(EVENT_ID.into(), Value::String(event.id.to_string()));
    map.insert(
        EVENT_SOURCE_TS.into(),
        Value::Long(event.source_timestamp.timestamp_millis()),
    );
    map.insert(
        EVENT_ENTRY_TS.into(),
        Value::Long(event.entry_timestamp.timestamp_millis()),
    );
    map.insert(EVENT_NODE_ID.into(), Value::String(event.node_id.clone()));
    map.insert(
        EVENT_ATTRIBUTES.into(),
        Value::Map(attributes_to_map(&event.attributes)),
    );
    map
}

pub fn map_to_event(map: &ValueMap) -> Result<Event, CoreError> {
    let id = map
        .get(EVENT_ID)
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::validation("event without id"))?;
    let id = Uuid::parse_str(id).map_err(|e| CoreError::validation(format!("event id: {e}")))?;

    Ok(Event {
        id,
        source_timestamp: timestamp_field(map, EVENT_SOURCE_TS)?,
        entry_timestamp: timestamp_field(map, EVENT_ENTRY_TS)?,
        node_id: map
            .get(EVENT_NODE_ID)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        attributes: map
            .get(EVENT_ATTRIBUTES)
            .and_then(Value::as_map)
            .map(map_to_attributes)
            .unwrap_or_default(),
    })
}

fn timestamp_field(map: &ValueMap, name: &str) -> Result<DateTime<Utc>, CoreError> {
    let ms = map
        .get(name)
        .and_then(Value::as_i64)
        .ok_or_else(|| CoreError::validation(format!("event without {name}")))?;
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| CoreError::validation(format!("{name} out of range: {ms}")))
}
