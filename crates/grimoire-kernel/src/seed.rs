//! YAML seed documents.
//!
//! ```yaml
//! reference_tables:
//!   skill:
//!     - { id: acrobatics, name: Acrobatics, ability: dex }
//!   feat:
//!     - { id: 1, name: Power Attack }
//! rpg_entities:
//!   - id: 3
//!     name: Amiri
//!     entity_type: character
//!     effects:
//!       skill_bonuses:
//!         - { skill_name: intimidate, bonus: 2 }
//! characters:
//!   - { id: 42, name: Amiri, level: 5, entity_id: 3 }
//! ```
//!
//! Every row needs an `id`. Rows without one, and tables whose name is not a
//! resource kind, are reported as skipped rather than failing the import.
//!
//! An entity's nested `effects` become `effect` records owned by it: each
//! row gains `entity_id` and `category` (the group it was listed under), and
//! an id of `<entity>-<category>-<index>` unless it carries its own.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::vfs::{KernelError, KernelResult, Record, ResourceId, ResourceKind};

/// Key under which an entity row nests its effects.
const EFFECTS_KEY: &str = "effects";

/// Parsed seed file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedDocument {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub reference_tables: BTreeMap<String, Vec<Value>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rpg_entities: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub characters: Vec<Value>,
}

/// What a seed produced, per kind.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedBatch {
    pub kind: ResourceKind,
    pub records: Vec<Record>,
}

/// Outcome of an import.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeedReport {
    pub dry_run: bool,
    /// Records written (or that would be written) per kind.
    pub imported: BTreeMap<ResourceKind, usize>,
    /// Human-readable reasons for rows that were left out.
    pub skipped: Vec<String>,
}

impl SeedReport {
    pub fn total(&self) -> usize {
        self.imported.values().sum()
    }
}

impl SeedDocument {
    pub fn from_yaml_str(s: &str) -> KernelResult<Self> {
        serde_yaml::from_str(s).map_err(|e| KernelError::integrity("<seed>", e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> KernelResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| KernelError::not_found(format!("{}: {e}", path.display())))?;
        Self::from_yaml_str(&text)
    }

    pub fn to_yaml_string(&self) -> KernelResult<String> {
        serde_yaml::to_string(self).map_err(|e| KernelError::integrity("<seed>", e.to_string()))
    }

    /// Build a document from records. Entities and characters get their
    /// own sections; everything else, effects included,
    /// goes under `reference_tables` with the owner's `entity_id` kept flat.
    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        let mut doc = Self::default();
        for record in records {
            let row = record.to_json();
            match record.kind {
                ResourceKind::Entity => doc.rpg_entities.push(row),
                ResourceKind::Character => doc.characters.push(row),
                kind => doc.reference_tables.entry(kind.to_string()).or_default().push(row),
            }
        }
        doc
    }

    /// Group rows into records by kind, in load order: reference tables,
    /// then entities, their nested effects, then characters. Returns the skipped-row reasons too.
    pub fn batches(&self) -> (Vec<SeedBatch>, Vec<String>) {
        let mut skipped = Vec::new();
        let mut batches = Vec::new();

        for (table, rows) in &self.reference_tables {
            match table.parse::<ResourceKind>() {
                Ok(kind) => batches.push(convert(kind, rows, &mut skipped)),
                Err(_) => skipped.push(format!("unknown table {table:?} ({} rows)", rows.len())),
            }
        }
        let (entities, effects) = convert_entities(&self.rpg_entities, &mut skipped);
        batches.push(entities);
        batches.push(effects);
        batches.push(convert(ResourceKind::Character, &self.characters, &mut skipped));
        batches.retain(|b| !b.records.is_empty());
        (batches, skipped)
    }
}

fn convert(kind: ResourceKind, rows: &[Value], skipped: &mut Vec<String>) -> SeedBatch {
    let mut records = Vec::with_capacity(rows.len());
    for (index, row) in rows.iter().enumerate() {
        match Record::from_json(kind, row.clone()) {
            Ok(record) => records.push(record),
            Err(e) => skipped.push(format!("{kind}[{index}]: {e}")),
        }
    }
    SeedBatch { kind, records }
}

/// Entities, with their nested effects split out into a second batch.
fn convert_entities(rows: &[Value], skipped: &mut Vec<String>) -> (SeedBatch, SeedBatch) {
    let mut entities = Vec::with_capacity(rows.len());
    let mut effects = Vec::new();

    for (index, row) in rows.iter().enumerate() {
        let mut row = row.clone();
        let nested = row.as_object_mut().and_then(|o| o.remove(EFFECTS_KEY));
        let entity = match Record::from_json(ResourceKind::Entity, row) {
            Ok(entity) => entity,
            Err(e) => {
                skipped.push(format!("{}[{index}]: {e}", ResourceKind::Entity));
                continue;
            }
        };
        if let Some(nested) = nested {
            flatten_effects(&entity, nested, &mut effects, skipped);
        }
        entities.push(entity);
    }

    (
        SeedBatch {
            kind: ResourceKind::Entity,
            records: entities,
        },
        SeedBatch {
            kind: ResourceKind::Effect,
            records: effects,
        },
    )
}

fn flatten_effects(entity: &Record, nested: Value, out: &mut Vec<Record>, skipped: &mut Vec<String>) {
    let owner = &entity.id;
    let Value::Object(groups) = nested else {
        if !nested.is_null() {
            skipped.push(format!("entity {owner}: effects is not a mapping"));
        }
        return;
    };

    for (category, rows) in groups {
        let Value::Array(rows) = rows else {
            skipped.push(format!("entity {owner}: effects.{category} is not a list"));
            continue;
        };
        for (index, row) in rows.into_iter().enumerate() {
            let Value::Object(mut fields) = row else {
                skipped.push(format!("entity {owner}: effects.{category}[{index}] is not a mapping"));
                continue;
            };
            fields
                .entry("id")
                .or_insert_with(|| Value::String(format!("{owner}-{category}-{index}")));
            fields.insert("entity_id".to_string(), owner_value(owner));
            fields.insert("category".to_string(), Value::String(category.clone()));
            match Record::from_json(ResourceKind::Effect, Value::Object(fields)) {
                Ok(effect) => out.push(effect),
                Err(e) => skipped.push(format!("entity {owner}: effects.{category}[{index}]: {e}")),
            }
        }
    }
}

/// Numeric ids stay numeric so `entity_id` compares like other foreign keys.
fn owner_value(id: &ResourceId) -> Value {
    id.as_str()
        .parse::<u64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::String(id.to_string()))
}
