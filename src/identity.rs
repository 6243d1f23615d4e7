//! Identity resolution: aliases, identities, and merges.
//!
//! An identity is the canonical record for one tracked end-user. The outside
//! world only ever refers to it through aliases (system user ids, emails,
//! anonymous device ids, ...) or through its own id. When an alias that
//! already belongs to one identity is claimed by another, the two identities
//! are merged: the earlier-created one survives and absorbs the other.
//!
//! ## Concurrency
//!
//! Nothing here is transactional. [`IdentityResolver::get_or_create`],
//! [`IdentityResolver::alias`] and [`IdentityResolver::merge`] are
//! read-decide-write sequences; two concurrent calls for the same unseen
//! alias can each create an identity. That race is known and left as is.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use futures::future::{BoxFuture, try_join_all};
use log::{debug, info, warn};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::clock::Clock;
use crate::encoding::{
    decode_scalar, decode_tuple, encode_scalar, encode_tuple, get_i64, get_str, row_of,
};
use crate::merge::{Candidate, Provenance, SetMode, Side, resolve};
use crate::schema::{SchemaRegistry, Scope};
use crate::storage::{Query, Row, Storage, Table};
use crate::value::{ValueTuple, cast_value};

const IDENTITY_META_COLUMNS: &[&str] = &["id", "alias_id", "created_at", "updated_at", "is_deleted"];

#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub id: Uuid,
    /// Alias record this identity was resolved through, if any.
    pub alias_id: Option<Uuid>,
    pub created_at: i64,
    pub updated_at: i64,
    /// Built-in attributes keyed by their fixed column.
    pub attributes: BTreeMap<String, ValueTuple>,
    /// Dynamic properties keyed by allocated column.
    pub properties: BTreeMap<String, ValueTuple>,
}

impl Identity {
    fn new(id: Uuid, now: i64) -> Self {
        Self {
            id,
            alias_id: None,
            created_at: now,
            updated_at: now,
            attributes: BTreeMap::new(),
            properties: BTreeMap::new(),
        }
    }

    /// Key event rows reference this identity by. Alias ids are preferred
    /// because they keep pointing at the right identity across merges.
    pub fn storage_key(&self) -> String {
        self.alias_id.unwrap_or(self.id).to_string()
    }

    pub fn value(&self, column: &str) -> Option<&ValueTuple> {
        self.attributes
            .get(column)
            .or_else(|| self.properties.get(column))
            .filter(|value| !value.is_none())
    }

    fn set_value(&mut self, column: &str, value: ValueTuple) {
        if Scope::User.built_in_type(column).is_some() {
            self.attributes.insert(column.to_string(), value);
        } else {
            self.properties.insert(column.to_string(), value);
        }
    }

    fn columns(&self) -> impl Iterator<Item = &String> {
        self.attributes.keys().chain(self.properties.keys())
    }

    fn from_row(row: &Row) -> Result<Self> {
        let id = get_str(row, "id")
            .ok_or_else(|| anyhow!("Identity row without id"))
            .and_then(|id| Uuid::parse_str(id).with_context(|| format!("Identity id '{id}'")))?;
        let alias_id = get_str(row, "alias_id").and_then(|id| Uuid::parse_str(id).ok());
        let mut identity = Identity {
            alias_id,
            created_at: get_i64(row, "created_at").unwrap_or(0),
            updated_at: get_i64(row, "updated_at").unwrap_or(0),
            ..Identity::new(id, 0)
        };
        for (column, value) in row {
            if IDENTITY_META_COLUMNS.contains(&column.as_str()) || value.is_null() {
                continue;
            }
            let decoded = match Scope::User.built_in_type(column) {
                Some(ty) => decode_scalar(value, ty),
                None => decode_tuple(value),
            };
            if !decoded.is_none() {
                identity.set_value(column, decoded);
            }
        }
        Ok(identity)
    }

    fn to_row(&self) -> Row {
        let mut row = row_of(json!({
            "id": self.id.to_string(),
            "created_at": self.created_at,
            "updated_at": self.updated_at,
            "is_deleted": 0,
        }));
        for (column, value) in &self.attributes {
            row.insert(column.clone(), encode_scalar(value));
        }
        for (column, value) in &self.properties {
            row.insert(column.clone(), encode_tuple(value));
        }
        row
    }

    /// Human-facing JSON view with decoded values.
    pub fn to_json(&self) -> Value {
        let render = |values: &BTreeMap<String, ValueTuple>| {
            values
                .iter()
                .map(|(column, value)| (column.clone(), encode_scalar(value)))
                .collect::<Map<String, Value>>()
        };
        json!({
            "id": self.id.to_string(),
            "alias_id": self.alias_id.map(|id| id.to_string()),
            "created_at": self.created_at,
            "updated_at": self.updated_at,
            "attributes": render(&self.attributes),
            "properties": render(&self.properties),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasRecord {
    pub id: Uuid,
    pub alias: String,
    pub identity_id: Uuid,
}

impl AliasRecord {
    fn from_row(row: &Row) -> Result<Self> {
        let parse = |key: &str| -> Result<Uuid> {
            let raw = get_str(row, key).ok_or_else(|| anyhow!("Alias row without {key}"))?;
            Uuid::parse_str(raw).with_context(|| format!("Alias {key} '{raw}'"))
        };
        Ok(Self {
            id: parse("id")?,
            alias: get_str(row, "alias")
                .ok_or_else(|| anyhow!("Alias row without alias"))?
                .to_string(),
            identity_id: parse("user_id")?,
        })
    }

    fn to_row(&self, now: i64) -> Row {
        row_of(json!({
            "id": self.id.to_string(),
            "alias": self.alias,
            "user_id": self.identity_id.to_string(),
            "updated_at": now,
            "is_deleted": 0,
        }))
    }
}

type ProvenanceMap = HashMap<(String, String), Provenance>;

fn candidate<'a>(identity: &'a Identity, provenance: &ProvenanceMap, column: &str) -> Option<Candidate<'a>> {
    let value = identity.value(column)?;
    Some(Candidate {
        value,
        provenance: provenance
            .get(&(identity.id.to_string(), column.to_string()))
            .copied(),
    })
}

fn provenance_row(identity: Uuid, column: &str, provenance: Provenance) -> Row {
    row_of(json!({
        "user_id": identity.to_string(),
        "property": column,
        "timestamp": provenance.timestamp,
        "mode": provenance.mode.as_str(),
    }))
}

pub struct IdentityResolver {
    storage: Arc<dyn Storage>,
    schema: Arc<SchemaRegistry>,
    clock: Arc<dyn Clock>,
}

impl IdentityResolver {
    pub fn new(storage: Arc<dyn Storage>, schema: Arc<SchemaRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            schema,
            clock,
        }
    }

    /// Looks up an identity by its id or any live alias.
    pub async fn resolve(&self, reference: &str) -> Result<Option<Identity>> {
        let rows = self
            .storage
            .query(&Query::IdentitiesByReference(vec![reference.to_string()]))
            .await
            .with_context(|| format!("Resolving identity '{reference}'"))?;
        rows.first().map(Identity::from_row).transpose()
    }

    pub async fn find_alias(&self, alias: &str) -> Result<Option<AliasRecord>> {
        let rows = self
            .storage
            .query(&Query::AliasByName(alias.to_string()))
            .await
            .with_context(|| format!("Looking up alias '{alias}'"))?;
        rows.first().map(AliasRecord::from_row).transpose()
    }

    pub async fn get_or_create(&self, external_id: &str) -> Result<Identity> {
        if let Some(existing) = self.resolve(external_id).await? {
            return Ok(existing);
        }

        let mut identity = Identity::new(Uuid::new_v4(), self.clock.now_millis());
        self.storage
            .insert(Table::User, vec![identity.to_row()])
            .await
            .context("Creating identity")?;
        let alias = self.create_alias(identity.id, external_id).await?;
        identity.alias_id = Some(alias.id);
        info!("Created identity {} for '{external_id}'", identity.id);
        Ok(identity)
    }

    /// Points `external_id` at `identity`, repointing it if it belonged to
    /// someone else. The alias record keeps its id across repoints.
    pub async fn create_alias(&self, identity: Uuid, external_id: &str) -> Result<AliasRecord> {
        let id = match self.find_alias(external_id).await? {
            Some(existing) => existing.id,
            None => Uuid::new_v4(),
        };
        let record = AliasRecord {
            id,
            alias: external_id.to_string(),
            identity_id: identity,
        };
        self.storage
            .insert(Table::UserAlias, vec![record.to_row(self.clock.now_millis())])
            .await
            .with_context(|| format!("Aliasing '{external_id}' to {identity}"))?;
        Ok(record)
    }

    /// Attaches `new_alias` to the identity behind `owner_ref`, merging when
    /// the alias already belonged to a different identity.
    pub async fn alias(&self, owner_ref: &str, new_alias: &str) -> Result<Identity> {
        let owner = self.get_or_create(owner_ref).await?;
        let previous = self.find_alias(new_alias).await?;
        self.create_alias(owner.id, new_alias).await?;

        match previous {
            Some(previous) if previous.identity_id != owner.id => {
                debug!(
                    "Alias '{new_alias}' moved from {} to {}",
                    previous.identity_id, owner.id
                );
                self.merge(&owner.id.to_string(), &previous.identity_id.to_string())
                    .await
            }
            _ => Ok(owner),
        }
    }

    /// Collapses two identities into one and returns the survivor.
    pub async fn merge(&self, ref_a: &str, ref_b: &str) -> Result<Identity> {
        let a = self
            .resolve(ref_a)
            .await?
            .ok_or_else(|| anyhow!("Cannot merge: no identity for '{ref_a}'"))?;
        let b = self
            .resolve(ref_b)
            .await?
            .ok_or_else(|| anyhow!("Cannot merge: no identity for '{ref_b}'"))?;
        if a.id == b.id {
            return Ok(a);
        }

        let (survivor, absorbed) = if (a.created_at, a.id) <= (b.created_at, b.id) {
            (a, b)
        } else {
            (b, a)
        };

        let times = self
            .storage
            .query(&Query::PropertyTimes(vec![
                survivor.id.to_string(),
                absorbed.id.to_string(),
            ]))
            .await
            .context("Loading property times for merge")?;
        let mut provenance = ProvenanceMap::new();
        for row in &times {
            let (Some(user), Some(column)) = (get_str(row, "user_id"), get_str(row, "property")) else {
                continue;
            };
            let mode = get_str(row, "mode")
                .and_then(|mode| mode.parse().ok())
                .unwrap_or_default();
            let timestamp = get_i64(row, "timestamp").unwrap_or(0);
            provenance.insert((user.to_string(), column.to_string()), Provenance { timestamp, mode });
        }

        let mut columns: BTreeSet<String> = survivor.columns().chain(absorbed.columns()).cloned().collect();
        let survivor_key = survivor.id.to_string();
        let absorbed_key = absorbed.id.to_string();
        for (user, column) in provenance.keys() {
            if *user == survivor_key || *user == absorbed_key {
                columns.insert(column.clone());
            }
        }

        let mut merged = survivor.clone();
        let mut merged_times: Vec<Row> = Vec::new();
        for column in &columns {
            let Some(resolution) = resolve(
                candidate(&survivor, &provenance, column),
                candidate(&absorbed, &provenance, column),
            ) else {
                continue;
            };
            if resolution.side == Side::Absorbed {
                if let Some(value) = absorbed.value(column) {
                    merged.set_value(column, value.clone());
                }
            }
            if let Some(winner) = resolution.provenance {
                merged_times.push(provenance_row(survivor.id, column, winner));
            }
        }

        let aliases = self
            .storage
            .query(&Query::AliasesOfIdentity(absorbed_key.clone()))
            .await
            .context("Loading aliases of absorbed identity")?
            .iter()
            .map(AliasRecord::from_row)
            .collect::<Result<Vec<_>>>()?;

        let now = self.clock.now_millis();
        merged.updated_at = now;
        let repointed: Vec<Row> = aliases
            .into_iter()
            .map(|alias| {
                AliasRecord {
                    identity_id: survivor.id,
                    ..alias
                }
                .to_row(now)
            })
            .collect();
        let tombstone = row_of(json!({
            "id": absorbed_key,
            "updated_at": now,
            "is_deleted": 1,
        }));

        let alias_count = repointed.len();
        let mut work: Vec<BoxFuture<'_, Result<()>>> = vec![
            self.storage.insert(Table::User, vec![merged.to_row()]),
            self.storage.insert(Table::User, vec![tombstone]),
        ];
        if !repointed.is_empty() {
            work.push(self.storage.insert(Table::UserAlias, repointed));
        }
        if !merged_times.is_empty() {
            work.push(self.storage.insert(Table::UserPropertyTime, merged_times));
        }
        try_join_all(work)
            .await
            .with_context(|| format!("Merging identity {} into {}", absorbed.id, survivor.id))?;

        info!(
            "Merged identity {} into {} ({alias_count} alias(es) repointed)",
            absorbed.id, survivor.id
        );
        Ok(merged)
    }

    /// Writes user properties. In [`SetMode::Once`] columns that already hold
    /// a value are left alone.
    pub async fn set_properties(
        &self,
        user_ref: &str,
        props: &Map<String, Value>,
        mode: SetMode,
    ) -> Result<Identity> {
        let mut identity = self.get_or_create(user_ref).await?;
        let entries: Vec<(String, Value)> = props.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let column_map = self.schema.create_columns(Scope::User, &entries).await?;

        let mut written: BTreeSet<String> = BTreeSet::new();
        for (name, value) in &entries {
            let Some(column) = column_map.get(name) else {
                continue;
            };
            if mode == SetMode::Once && identity.value(column).is_some() {
                debug!("Keeping existing value of '{column}' for set-once write");
                continue;
            }
            let encoded = match Scope::User.built_in_type(column) {
                Some(ty) => cast_value(value, ty),
                None => Some(ValueTuple::from_json(value)).filter(|tuple| !tuple.is_none()),
            };
            let Some(encoded) = encoded else {
                warn!("Dropping user property '{name}': value cannot be stored as its column type");
                continue;
            };
            identity.set_value(column, encoded);
            written.insert(column.clone());
        }

        if written.is_empty() {
            return Ok(identity);
        }
        self.write_properties(&mut identity, &written, mode).await?;
        Ok(identity)
    }

    /// Adds one to a numeric user property, treating a missing or
    /// non-numeric value as zero. Built-in attributes cannot be incremented;
    /// for those nothing is written and `None` is returned.
    pub async fn increment_property(&self, user_ref: &str, property: &str) -> Result<Option<f64>> {
        let mut identity = self.get_or_create(user_ref).await?;
        if Scope::User.built_in_type(property).is_some() {
            warn!("Ignoring increment of built-in attribute '{property}'");
            return Ok(None);
        }

        let column_map = self
            .schema
            .create_columns(Scope::User, &[(property.to_string(), json!(1))])
            .await?;
        let Some(column) = column_map.get(property) else {
            return Ok(None);
        };

        let next = identity
            .properties
            .get(column)
            .and_then(ValueTuple::as_num)
            .unwrap_or(0.0)
            + 1.0;
        identity.set_value(column, ValueTuple::Num(next));
        let written = BTreeSet::from([column.clone()]);
        self.write_properties(&mut identity, &written, SetMode::Normal)
            .await?;
        Ok(Some(next))
    }

    async fn write_properties(
        &self,
        identity: &mut Identity,
        columns: &BTreeSet<String>,
        mode: SetMode,
    ) -> Result<()> {
        let now = self.clock.now_millis();
        identity.updated_at = now;
        let times: Vec<Row> = columns
            .iter()
            .map(|column| provenance_row(identity.id, column, Provenance { timestamp: now, mode }))
            .collect();
        futures::try_join!(
            self.storage.insert(Table::User, vec![identity.to_row()]),
            self.storage.insert(Table::UserPropertyTime, times),
        )
        .with_context(|| format!("Writing properties of identity {}", identity.id))?;
        Ok(())
    }
}
