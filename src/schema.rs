//! Property definitions and the schema registry.
//!
//! The registry turns `(name, value)` pairs into storage columns. It owns the
//! lifecycle of property definitions (which names exist, which column each
//! maps to, which value types have been observed) and of the physical tuple
//! columns on the event and user tables.
//!
//! ## Invariants
//!
//! - Once allocated, a `(scope, name)` pair keeps its column forever; names
//!   compare case-insensitively.
//! - The observed type set of a definition only grows.
//! - Built-in attributes always use their fixed column; a value of the wrong
//!   type for a built-in is dropped.
//!
//! Lookups go through a [`SchemaCache`] with a fixed TTL and no write-through,
//! so a column created by one caller may stay invisible to others until the
//! cached entry expires.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use futures::future::{BoxFuture, FutureExt, try_join_all};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::cache::{Cache, TtlCache, cached_or_compute};
use crate::clock::Clock;
use crate::columns::allocate_column_name;
use crate::encoding::{get_i64, get_str};
use crate::storage::{ColumnSpec, Query, Row, Storage, Table};
use crate::value::{PropertyType, infer_type};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Event,
    User,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Event => "event",
            Scope::User => "user",
        }
    }

    pub fn table(&self) -> Table {
        match self {
            Scope::Event => Table::Event,
            Scope::User => Table::User,
        }
    }

    /// Reserved attribute names with a fixed column and a fixed type.
    pub fn built_ins(&self) -> &'static [(&'static str, PropertyType)] {
        match self {
            Scope::Event => &[],
            Scope::User => &[
                ("name", PropertyType::Str),
                ("email", PropertyType::Str),
                ("avatar", PropertyType::Str),
            ],
        }
    }

    /// Declared type of a built-in attribute, matched case-insensitively.
    pub fn built_in_type(&self, name: &str) -> Option<PropertyType> {
        let lowered = name.to_lowercase();
        self.built_ins()
            .iter()
            .find(|(builtin, _)| *builtin == lowered)
            .map(|(_, ty)| *ty)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "event" | "events" => Ok(Scope::Event),
            "user" | "users" => Ok(Scope::User),
            other => Err(anyhow!("Unknown property scope '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDefinition {
    pub scope: Scope,
    pub name: String,
    pub column: String,
    pub data_types: BTreeSet<PropertyType>,
    pub first_seen: i64,
}

impl PropertyDefinition {
    fn from_row(row: &Row) -> Result<Self> {
        let name = get_str(row, "name").ok_or_else(|| anyhow!("Definition row without name"))?;
        let column =
            get_str(row, "column").ok_or_else(|| anyhow!("Definition '{name}' without column"))?;
        let scope = get_str(row, "scope")
            .ok_or_else(|| anyhow!("Definition '{name}' without scope"))?
            .parse()?;
        let data_types = row
            .get("data_types")
            .and_then(Value::as_array)
            .map(|types| {
                types
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(|t| t.parse().ok())
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            scope,
            name: name.to_string(),
            column: column.to_string(),
            data_types,
            first_seen: get_i64(row, "timestamp").unwrap_or(0),
        })
    }
}

/// The two per-scope lookups the registry caches.
pub struct SchemaCache {
    pub columns: Arc<dyn Cache<Scope, Vec<String>>>,
    pub definitions: Arc<dyn Cache<Scope, Vec<PropertyDefinition>>>,
}

impl SchemaCache {
    pub fn with_ttl(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            columns: Arc::new(TtlCache::new(ttl, clock.clone())),
            definitions: Arc::new(TtlCache::new(ttl, clock)),
        }
    }

    pub fn clear(&self) {
        self.columns.clear();
        self.definitions.clear();
    }
}

pub type ColumnMap = HashMap<String, String>;

pub struct SchemaRegistry {
    storage: Arc<dyn Storage>,
    cache: SchemaCache,
    clock: Arc<dyn Clock>,
}

impl SchemaRegistry {
    pub fn new(storage: Arc<dyn Storage>, cache: SchemaCache, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            cache,
            clock,
        }
    }

    pub fn cache(&self) -> &SchemaCache {
        &self.cache
    }

    pub async fn table_columns(&self, scope: Scope) -> Result<Vec<String>> {
        cached_or_compute(self.cache.columns.as_ref(), scope, || async move {
            let rows = self
                .storage
                .query(&Query::DescribeTable(scope.table()))
                .await
                .with_context(|| format!("Describing table '{}'", scope.table()))?;
            Ok(rows
                .iter()
                .filter_map(|row| get_str(row, "name").map(str::to_string))
                .collect())
        })
        .await
    }

    pub async fn definitions(&self, scope: Scope) -> Result<Vec<PropertyDefinition>> {
        cached_or_compute(self.cache.definitions.as_ref(), scope, || async move {
            let rows = self
                .storage
                .query(&Query::PropertyDefinitions(scope))
                .await
                .with_context(|| format!("Loading {scope} property definitions"))?;
            rows.iter().map(PropertyDefinition::from_row).collect()
        })
        .await
    }

    /// Maps every `(name, value)` entry to a storage column, provisioning
    /// missing columns and definitions along the way.
    ///
    /// Entries whose value has no type, or whose type conflicts with a
    /// built-in attribute, are left out of the returned map.
    pub async fn create_columns(&self, scope: Scope, entries: &[(String, Value)]) -> Result<ColumnMap> {
        let definitions = self.definitions(scope).await?;
        let physical = self.table_columns(scope).await?;

        let by_name: HashMap<String, &PropertyDefinition> = definitions
            .iter()
            .map(|def| (def.name.to_lowercase(), def))
            .collect();
        let mut known: Vec<String> = physical.clone();
        for def in &definitions {
            if !known.contains(&def.column) {
                known.push(def.column.clone());
            }
        }

        let mut column_map = ColumnMap::new();
        let mut allocated: HashMap<String, String> = HashMap::new();
        let mut new_columns: Vec<String> = Vec::new();
        let mut new_definitions: Vec<Row> = Vec::new();
        let mut queued_types: HashSet<(String, PropertyType)> = HashSet::new();
        let now = self.clock.now_millis();

        for (name, value) in entries {
            let lowered = name.to_lowercase();
            let inferred = infer_type(value);
            let built_in = scope.built_in_type(name);

            if let Some(declared) = built_in {
                if inferred != Some(declared) {
                    debug!("Dropping built-in '{name}': expected {declared}, got {inferred:?}");
                    continue;
                }
            }
            let Some(data_type) = inferred else {
                debug!("Dropping {scope} property '{name}' without a value");
                continue;
            };

            let column = if built_in.is_some() {
                lowered.clone()
            } else if let Some(def) = by_name.get(&lowered) {
                def.column.clone()
            } else if let Some(column) = allocated.get(&lowered) {
                column.clone()
            } else {
                let column = allocate_column_name(name, &known);
                debug!("Allocated column '{column}' for {scope} property '{name}'");
                known.push(column.clone());
                allocated.insert(lowered.clone(), column.clone());
                column
            };

            if !physical.contains(&column) && !new_columns.contains(&column) {
                new_columns.push(column.clone());
            }

            let registered = by_name
                .get(&lowered)
                .is_some_and(|def| def.data_types.contains(&data_type));
            if !registered && queued_types.insert((lowered.clone(), data_type)) {
                let def_name = by_name
                    .get(&lowered)
                    .map_or(name.as_str(), |def| def.name.as_str());
                new_definitions.push(definition_row(scope, def_name, &column, data_type, now));
            }

            column_map.insert(name.clone(), column);
        }

        let mut work: Vec<BoxFuture<'_, Result<()>>> = Vec::new();
        if !new_definitions.is_empty() {
            let count = new_definitions.len();
            work.push(
                async move {
                    self.storage
                        .insert(Table::Property, new_definitions)
                        .await
                        .with_context(|| format!("Registering {count} {scope} property type(s)"))
                }
                .boxed(),
            );
        }
        let table = scope.table();
        for column in &new_columns {
            work.push(
                async move {
                    self.storage
                        .add_column_if_missing(table, column, ColumnSpec::Tuple)
                        .await
                        .with_context(|| format!("Adding column '{column}' to '{table}'"))
                }
                .boxed(),
            );
        }
        try_join_all(work).await?;

        if !new_columns.is_empty() {
            info!("Created {} {scope} column(s): {}", new_columns.len(), new_columns.join(", "));
        }
        Ok(column_map)
    }
}

fn definition_row(scope: Scope, name: &str, column: &str, data_type: PropertyType, now: i64) -> Row {
    let mut row = Row::new();
    row.insert("name".to_string(), json!(name));
    row.insert("scope".to_string(), json!(scope.as_str()));
    row.insert("column".to_string(), json!(column));
    row.insert("data_type".to_string(), json!(data_type.as_str()));
    row.insert("timestamp".to_string(), json!(now));
    row
}
