//! project → subdivide → coerce: raw payload rows to one record per target entity kind.

use coinwatch_core::{EntityKind, FieldValue, NormalizedRecord, NATURAL_KEY_FIELD};
use serde_json::{Map, Value as JsonValue};
use tracing::warn;

pub type RawRow = Map<String, JsonValue>;

const SOURCE_ID_FIELD: &str = "id";

/// Keeps allow-listed fields, renames `id` to the natural-key field and filters the named
/// nested objects one level down.
pub fn project(raw: &RawRow, allow: &[&str], nested: &[(&str, &[&str])]) -> RawRow {
    let mut out = RawRow::new();
    for (name, value) in raw {
        if !allow.contains(&name.as_str()) {
            continue;
        }
        let value = match (nested.iter().find(|(n, _)| *n == name.as_str()), value) {
            (Some((_, inner_allow)), JsonValue::Object(inner)) => JsonValue::Object(
                inner
                    .iter()
                    .filter(|(k, _)| inner_allow.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            _ => value.clone(),
        };
        let name = if name == SOURCE_ID_FIELD {
            NATURAL_KEY_FIELD.to_string()
        } else {
            name.clone()
        };
        out.insert(name, value);
    }
    out
}

/// Target shapes by field membership, plus an optional kind catching unclaimed fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeMap {
    shapes: Vec<(EntityKind, Vec<String>)>,
    remainder: Option<EntityKind>,
}

impl ShapeMap {
    pub fn new() -> Self {
        Self {
            shapes: Vec::new(),
            remainder: None,
        }
    }

    pub fn shape(mut self, kind: EntityKind, fields: &[&str]) -> Self {
        self.shapes
            .push((kind, fields.iter().map(|f| f.to_string()).collect()));
        self
    }

    pub fn remainder(mut self, kind: EntityKind) -> Self {
        self.remainder = Some(kind);
        self
    }

    /// Every row becomes a single record of `kind`.
    pub fn whole(kind: EntityKind) -> Self {
        Self::new().remainder(kind)
    }
}

impl Default for ShapeMap {
    fn default() -> Self {
        Self::new()
    }
}

pub fn subdivide(row: &RawRow, shapes: &ShapeMap) -> Vec<(EntityKind, RawRow)> {
    let key = row.get(NATURAL_KEY_FIELD);
    let with_key = || {
        let mut part = RawRow::new();
        if let Some(key) = key {
            part.insert(NATURAL_KEY_FIELD.to_string(), key.clone());
        }
        part
    };

    let mut parts: Vec<(EntityKind, RawRow)> = shapes
        .shapes
        .iter()
        .map(|(kind, fields)| {
            let mut part = with_key();
            for field in fields {
                if let Some(value) = row.get(field) {
                    part.insert(field.clone(), value.clone());
                }
            }
            (*kind, part)
        })
        .collect();

    if let Some(kind) = shapes.remainder {
        let mut part = with_key();
        for (name, value) in row {
            let claimed = shapes
                .shapes
                .iter()
                .any(|(_, fields)| fields.iter().any(|f| f == name));
            if !claimed {
                part.insert(name.clone(), value.clone());
            }
        }
        parts.push((kind, part));
    }
    parts
}

/// Flattens a JSON value to a storable scalar.
pub fn coerce(value: &JsonValue) -> FieldValue {
    match value {
        JsonValue::Null => FieldValue::Null,
        JsonValue::Bool(b) => FieldValue::Bool(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => FieldValue::Int(i),
            None => n.as_f64().map(FieldValue::Float).unwrap_or(FieldValue::Null),
        },
        JsonValue::String(s) => FieldValue::Text(s.clone()),
        JsonValue::Array(items) => FieldValue::Text(
            items
                .iter()
                .map(|item| match item {
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(";"),
        ),
        JsonValue::Object(_) => FieldValue::Text(value.to_string()),
    }
}

/// Fixed per-source normalization recipe.
#[derive(Debug, Clone)]
pub struct Normalization<'a> {
    pub allow: &'a [&'a str],
    pub nested: &'a [(&'a str, &'a [&'a str])],
    pub shapes: ShapeMap,
}

impl Normalization<'_> {
    /// Normalizes one row. Rows without an identifier yield nothing.
    pub fn row(&self, raw: &RawRow) -> Vec<NormalizedRecord> {
        let projected = project(raw, self.allow, self.nested);
        let Some(natural) = projected
            .get(NATURAL_KEY_FIELD)
            .and_then(JsonValue::as_str)
            .map(str::to_string)
        else {
            warn!("row without identifier dropped");
            return Vec::new();
        };

        subdivide(&projected, &self.shapes)
            .into_iter()
            .map(|(kind, part)| {
                let mut record = NormalizedRecord::natural(kind, natural.clone());
                for (name, value) in &part {
                    if name != NATURAL_KEY_FIELD {
                        record.set(name.clone(), coerce(value));
                    }
                }
                record
            })
            .collect()
    }

    /// Normalizes an array payload (or a single object).
    pub fn payload(&self, payload: &JsonValue) -> Vec<NormalizedRecord> {
        match payload {
            JsonValue::Array(rows) => rows
                .iter()
                .filter_map(JsonValue::as_object)
                .flat_map(|row| self.row(row))
                .collect(),
            JsonValue::Object(row) => self.row(row),
            _ => Vec::new(),
        }
    }
}

/// Records of `kind` taken out of a mixed normalization result.
pub fn take_kind(records: &mut Vec<NormalizedRecord>, kind: EntityKind) -> Vec<NormalizedRecord> {
    let (taken, rest): (Vec<_>, Vec<_>) = records.drain(..).partition(|r| r.kind == kind);
    *records = rest;
    taken
}
