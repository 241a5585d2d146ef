use crate::{EntityRecord, ModelError, ModelResult, TableSpec};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tillsync_types::{LocalId, TenantId};
use tracing::debug;

/// Local field holding the record id.
pub const ID_FIELD: &str = "id";
/// Local field holding the owning tenant.
pub const TENANT_FIELD: &str = "tenantId";
/// Local field holding the soft-delete marker.
pub const DELETED_AT_FIELD: &str = "deletedAt";

/// One row of an entity table in local form.
///
/// The id, tenant and soft-delete marker are lifted out of the JSON payload
/// so every pipeline stage can reason about them without string lookups.
/// Fields the table spec declares as dates are held as parsed timestamps in
/// `dates`; everything else stays as JSON in `fields` (camelCase keys).
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: LocalId,
    pub tenant_id: Option<TenantId>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub fields: Map<String, Value>,
    pub dates: BTreeMap<String, DateTime<Utc>>,
}

impl Record {
    /// Creates an empty, untagged record.
    pub fn new(id: LocalId) -> Self {
        Self {
            id,
            tenant_id: None,
            deleted_at: None,
            fields: Map::new(),
            dates: BTreeMap::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set(field, value.into());
        self
    }

    /// Builder-style tenant setter.
    pub fn with_tenant(mut self, tenant: &TenantId) -> Self {
        self.tenant_id = Some(tenant.clone());
        self
    }

    /// Reads a record from its local JSON form.
    ///
    /// Date fields that fail to parse are kept verbatim in `fields`; a blank
    /// tenant counts as untagged.
    pub fn from_json(spec: &TableSpec, value: Value) -> ModelResult<Self> {
        let Value::Object(mut obj) = value else {
            return Err(ModelError::NotAnObject);
        };

        let id = obj
            .remove(ID_FIELD)
            .and_then(|v| v.as_i64())
            .ok_or(ModelError::MissingId)?;

        let tenant_id = match obj.remove(TENANT_FIELD) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(TenantId::new(s)?),
            Some(Value::Number(n)) => Some(TenantId::new(n.to_string())?),
            _ => None,
        };

        let deleted_at = match obj.remove(DELETED_AT_FIELD) {
            Some(Value::String(s)) => match parse_timestamp(&s) {
                Some(ts) => Some(ts),
                None => {
                    debug!(table = spec.name, id, "unparsable deletedAt kept as field");
                    obj.insert(DELETED_AT_FIELD.to_string(), Value::String(s));
                    None
                }
            },
            _ => None,
        };

        let mut dates = BTreeMap::new();
        for field in spec.date_fields {
            if let Some(Value::String(s)) = obj.get(*field) {
                if let Some(ts) = parse_timestamp(s) {
                    obj.remove(*field);
                    dates.insert((*field).to_string(), ts);
                }
            }
        }

        Ok(Self {
            id,
            tenant_id,
            deleted_at,
            fields: obj,
            dates,
        })
    }

    /// Local JSON form of the record.
    pub fn to_json(&self) -> Value {
        Value::Object(self.to_map())
    }

    /// Local form of the record as a field map.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut obj = self.fields.clone();
        obj.insert(ID_FIELD.to_string(), Value::from(self.id));
        if let Some(tenant) = &self.tenant_id {
            obj.insert(TENANT_FIELD.to_string(), Value::String(tenant.to_string()));
        }
        obj.insert(
            DELETED_AT_FIELD.to_string(),
            self.deleted_at
                .map(|ts| Value::String(format_timestamp(&ts)))
                .unwrap_or(Value::Null),
        );
        for (field, ts) in &self.dates {
            obj.insert(field.clone(), Value::String(format_timestamp(ts)));
        }
        obj
    }

    /// Converts a typed entity into a record. The entity must carry an id.
    pub fn from_entity<T: EntityRecord>(spec: &TableSpec, entity: &T) -> ModelResult<Self> {
        Self::from_json(spec, serde_json::to_value(entity)?)
    }

    /// Decodes the record into a typed entity.
    pub fn to_entity<T: EntityRecord>(&self) -> ModelResult<T> {
        Ok(serde_json::from_value(self.to_json())?)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn get_date(&self, field: &str) -> Option<&DateTime<Utc>> {
        self.dates.get(field)
    }

    /// Sets a plain field, replacing a parsed date of the same name.
    pub fn set(&mut self, field: &str, value: Value) {
        self.dates.remove(field);
        self.fields.insert(field.to_string(), value);
    }

    pub fn set_date(&mut self, field: &str, ts: DateTime<Utc>) {
        self.fields.remove(field);
        self.dates.insert(field.to_string(), ts);
    }

    /// Id stored in a reference field. Numeric strings are accepted because
    /// older clients wrote ids as text.
    pub fn reference(&self, field: &str) -> Option<LocalId> {
        match self.fields.get(field)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn set_reference(&mut self, field: &str, parent: Option<LocalId>) {
        let value = parent.map(Value::from).unwrap_or(Value::Null);
        self.fields.insert(field.to_string(), value);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn soft_delete(&mut self, at: DateTime<Utc>) {
        self.deleted_at = Some(at);
    }

    pub fn belongs_to(&self, tenant: &TenantId) -> bool {
        self.tenant_id.as_ref() == Some(tenant)
    }
}

/// Parses the timestamp shapes the remote store and older clients produce:
/// RFC 3339, naive `YYYY-MM-DD[T ]HH:MM:SS[.f]` (taken as UTC) and plain dates.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Wire form of a timestamp.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
