//! Versioned entities and their row representation.
//!
//! Entities never carry their own version: it lives on the row and is managed
//! exclusively by the store's conditional update.

use crate::error::Error;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Business fields of a row.
pub type Fields = Map<String, Value>;

/// Column holding the version counter.
pub const VERSION_FIELD: &str = "version";
/// Column holding the primary key.
pub const ID_FIELD: &str = "id";

/// Version assumed for rows written before versioning existed.
pub const LEGACY_VERSION: u64 = 1;

/// A stored row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Primary key
    pub id: String,
    /// Business fields
    pub fields: Fields,
    /// Version counter; `None` for legacy rows
    pub version: Option<u64>,
}

impl Record {
    /// New row at version 1.
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
            version: Some(LEGACY_VERSION),
        }
    }

    /// Stored version, treating an unset version as 1.
    pub fn effective_version(&self) -> u64 {
        self.version.unwrap_or(LEGACY_VERSION)
    }

    /// Merge `patch` into the fields and bump the version by exactly one.
    pub fn apply(&mut self, patch: &Fields) {
        for (name, value) in patch {
            self.fields.insert(name.clone(), value.clone());
        }
        self.version = Some(self.effective_version() + 1);
    }
}

/// An entity mutated only through optimistic version checks.
pub trait VersionedEntity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Table (and entity kind) name
    const TABLE: &'static str;

    /// Partial-update patch; fields serialized as absent are left unchanged
    type Changes: Serialize + Send + Sync;

    /// Primary key
    fn id(&self) -> String;
}

/// An entity together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    /// The entity
    pub entity: T,
    /// Stored version when read
    pub version: u64,
}

/// Split an entity into its id and business fields.
pub fn encode_entity<E: VersionedEntity>(entity: &E) -> Result<Record, Error> {
    let mut fields = into_object(serde_json::to_value(entity)?)?;
    fields.remove(ID_FIELD);
    if fields.remove(VERSION_FIELD).is_some() {
        return Err(Error::VersionNotWritable);
    }
    Ok(Record::new(entity.id(), fields))
}

/// Rebuild an entity from a row.
pub fn decode_entity<E: VersionedEntity>(record: &Record) -> Result<Versioned<E>, Error> {
    let mut fields = record.fields.clone();
    fields.insert(ID_FIELD.to_string(), Value::String(record.id.clone()));
    let entity = serde_json::from_value(Value::Object(fields))?;
    Ok(Versioned {
        entity,
        version: record.effective_version(),
    })
}

/// Turn caller-supplied changes into a field patch.
///
/// Rejects any attempt to set the version or the primary key.
pub fn changes_to_patch<C: Serialize>(changes: &C) -> Result<Fields, Error> {
    let patch = into_object(serde_json::to_value(changes)?)?;
    if patch.contains_key(VERSION_FIELD) {
        return Err(Error::VersionNotWritable);
    }
    if patch.contains_key(ID_FIELD) {
        return Err(Error::InvalidChanges("the primary key cannot be changed".into()));
    }
    Ok(patch)
}

fn into_object(value: Value) -> Result<Fields, Error> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::InvalidChanges(format!(
            "expected an object, got {other}"
        ))),
    }
}
