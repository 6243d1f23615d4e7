//! In-process reference implementation of the storage contract.
//!
//! Tables are append-only row logs. Reads resolve the latest version of each
//! key the same way the analytical store does, so callers see identical
//! semantics whether they run against this store or a real one. The whole
//! store can be persisted as a JSON snapshot, which is what the command line
//! uses to keep state between invocations.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::encoding::{get_i64, get_str, is_deleted, row_of};
use crate::schema::Scope;
use crate::storage::{ColumnSpec, Query, Row, Storage, Table};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Unknown column '{column}' in table '{table}'")]
    UnknownColumn { table: Table, column: String },
    #[error("Invalid column identifier '{0}'")]
    InvalidColumn(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TableData {
    columns: Vec<String>,
    rows: Vec<Row>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Snapshot {
    tables: BTreeMap<Table, TableData>,
}

impl Default for Snapshot {
    fn default() -> Self {
        let tables = Table::ALL
            .iter()
            .map(|table| {
                let data = TableData {
                    columns: table.base_columns().iter().map(|c| c.to_string()).collect(),
                    rows: Vec::new(),
                };
                (*table, data)
            })
            .collect();
        Snapshot { tables }
    }
}

impl Snapshot {
    fn table(&self, table: Table) -> &TableData {
        static EMPTY: TableData = TableData {
            columns: Vec::new(),
            rows: Vec::new(),
        };
        self.tables.get(&table).unwrap_or(&EMPTY)
    }

    fn table_mut(&mut self, table: Table) -> &mut TableData {
        self.tables.entry(table).or_insert_with(|| TableData {
            columns: table.base_columns().iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<Snapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a snapshot, or starts empty when the file does not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No state file at {path:?}; starting with an empty store");
            return Ok(Self::new());
        }
        let file = File::open(path).with_context(|| format!("Opening state file {path:?}"))?;
        let mut snapshot: Snapshot = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Parsing state file {path:?}"))?;
        for table in Table::ALL {
            snapshot.table_mut(table);
        }
        Ok(Self {
            state: Mutex::new(snapshot),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("Creating state file {path:?}"))?;
        let state = self.state.lock();
        serde_json::to_writer_pretty(BufWriter::new(file), &*state).context("Writing state JSON")
    }

    pub fn columns(&self, table: Table) -> Vec<String> {
        self.state.lock().table(table).columns.clone()
    }

    /// Every stored version, oldest first.
    pub fn rows(&self, table: Table) -> Vec<Row> {
        self.state.lock().table(table).rows.clone()
    }

    fn run_query(&self, query: &Query) -> Vec<Row> {
        let state = self.state.lock();
        match query {
            Query::DescribeTable(table) => state
                .table(*table)
                .columns
                .iter()
                .map(|name| row_of(json!({ "name": name })))
                .collect(),
            Query::PropertyDefinitions(scope) => property_definitions(&state, *scope),
            Query::IdentitiesByReference(refs) => identities_by_reference(&state, refs),
            Query::AliasByName(alias) => live_aliases(&state)
                .into_iter()
                .filter(|row| get_str(row, "alias") == Some(alias.as_str()))
                .take(1)
                .cloned()
                .collect(),
            Query::AliasesOfIdentity(id) => live_aliases(&state)
                .into_iter()
                .filter(|row| get_str(row, "user_id") == Some(id.as_str()))
                .cloned()
                .collect(),
            Query::PropertyTimes(ids) => {
                let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
                latest_by(&state.table(Table::UserPropertyTime).rows, |row| {
                    Some(format!(
                        "{}\u{1f}{}",
                        get_str(row, "user_id")?,
                        get_str(row, "property")?
                    ))
                })
                .into_iter()
                .filter(|row| get_str(row, "user_id").is_some_and(|id| wanted.contains(id)))
                .cloned()
                .collect()
            }
        }
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn query(&self, query: &Query) -> Result<Vec<Row>> {
        Ok(self.run_query(query))
    }

    async fn insert(&self, table: Table, rows: Vec<Row>) -> Result<()> {
        let mut state = self.state.lock();
        let data = state.table_mut(table);
        for row in &rows {
            if let Some(column) = row.keys().find(|key| !data.columns.contains(key)) {
                return Err(StoreError::UnknownColumn {
                    table,
                    column: column.clone(),
                }
                .into());
            }
        }
        debug!("Inserted {} row(s) into {table}", rows.len());
        data.rows.extend(rows);
        Ok(())
    }

    async fn add_column_if_missing(
        &self,
        table: Table,
        column: &str,
        spec: ColumnSpec,
    ) -> Result<()> {
        let valid = !column.is_empty()
            && column
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(StoreError::InvalidColumn(column.to_string()).into());
        }
        let mut state = self.state.lock();
        let data = state.table_mut(table);
        if !data.columns.iter().any(|existing| existing == column) {
            debug!("ALTER TABLE {table} ADD COLUMN {column} {}", spec.type_spec());
            data.columns.push(column.to_string());
        }
        Ok(())
    }
}

/// Latest version per key, ordered by where each latest version sits.
fn latest_by<F>(rows: &[Row], key: F) -> Vec<&Row>
where
    F: Fn(&Row) -> Option<String>,
{
    let mut latest: HashMap<String, usize> = HashMap::new();
    for (idx, row) in rows.iter().enumerate() {
        if let Some(k) = key(row) {
            latest.insert(k, idx);
        }
    }
    let mut positions: Vec<usize> = latest.into_values().collect();
    positions.sort_unstable();
    positions.into_iter().map(|idx| &rows[idx]).collect()
}

fn live_users(state: &Snapshot) -> Vec<&Row> {
    latest_by(&state.table(Table::User).rows, |row| {
        get_str(row, "id").map(str::to_string)
    })
    .into_iter()
    .filter(|row| !is_deleted(row))
    .collect()
}

fn live_aliases(state: &Snapshot) -> Vec<&Row> {
    latest_by(&state.table(Table::UserAlias).rows, |row| {
        get_str(row, "alias").map(str::to_string)
    })
    .into_iter()
    .filter(|row| !is_deleted(row))
    .collect()
}

fn identities_by_reference(state: &Snapshot, refs: &[String]) -> Vec<Row> {
    let users = live_users(state);
    let aliases = live_aliases(state);
    let mut seen = HashSet::new();
    let mut found = Vec::new();
    for reference in refs {
        let direct = users
            .iter()
            .find(|row| get_str(row, "id") == Some(reference.as_str()));
        let (user, alias_id) = match direct {
            Some(user) => {
                let alias_id = aliases
                    .iter()
                    .find(|row| get_str(row, "user_id") == Some(reference.as_str()))
                    .and_then(|alias| get_str(alias, "id"));
                (Some(*user), alias_id)
            }
            None => {
                let alias = aliases
                    .iter()
                    .find(|row| get_str(row, "alias") == Some(reference.as_str()));
                let user = alias.and_then(|alias| {
                    let owner = get_str(alias, "user_id")?;
                    users
                        .iter()
                        .find(|row| get_str(row, "id") == Some(owner))
                        .copied()
                });
                (user, alias.and_then(|alias| get_str(alias, "id")))
            }
        };
        let Some(user) = user else { continue };
        let Some(id) = get_str(user, "id") else { continue };
        if !seen.insert(id.to_string()) {
            continue;
        }
        let mut row = user.clone();
        if let Some(alias_id) = alias_id {
            row.insert("alias_id".to_string(), Value::String(alias_id.to_string()));
        }
        found.push(row);
    }
    found
}

fn property_definitions(state: &Snapshot, scope: Scope) -> Vec<Row> {
    let mut order: Vec<(String, String)> = Vec::new();
    let mut grouped: HashMap<(String, String), (Vec<String>, i64)> = HashMap::new();
    for row in &state.table(Table::Property).rows {
        if get_str(row, "scope") != Some(scope.as_str()) {
            continue;
        }
        let (Some(name), Some(column)) = (get_str(row, "name"), get_str(row, "column")) else {
            continue;
        };
        let key = (name.to_string(), column.to_string());
        let timestamp = get_i64(row, "timestamp").unwrap_or(0);
        let entry = grouped.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            (Vec::new(), timestamp)
        });
        entry.1 = entry.1.min(timestamp);
        if let Some(data_type) = get_str(row, "data_type") {
            if !entry.0.iter().any(|t| t == data_type) {
                entry.0.push(data_type.to_string());
            }
        }
    }
    order
        .into_iter()
        .filter_map(|key| {
            let (types, timestamp) = grouped.remove(&key)?;
            Some(row_of(json!({
                "name": key.0,
                "scope": scope.as_str(),
                "column": key.1,
                "data_types": types,
                "timestamp": timestamp,
            })))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn alias_row(id: &str, alias: &str, user: &str) -> Row {
        row_of(json!({ "id": id, "alias": alias, "user_id": user, "updated_at": 1, "is_deleted": 0 }))
    }

    #[tokio::test]
    async fn insert_rejects_unknown_columns() {
        let store = MemoryStore::new();
        let err = store
            .insert(Table::Event, vec![row_of(json!({ "time": 1, "p_color": {} }))])
            .await
            .expect_err("p_color does not exist yet");
        assert_eq!(
            err.downcast_ref::<StoreError>(),
            Some(&StoreError::UnknownColumn {
                table: Table::Event,
                column: "p_color".to_string()
            })
        );
        store
            .add_column_if_missing(Table::Event, "p_color", ColumnSpec::Tuple)
            .await
            .unwrap();
        store
            .add_column_if_missing(Table::Event, "p_color", ColumnSpec::Tuple)
            .await
            .unwrap();
        assert_eq!(
            store.columns(Table::Event).iter().filter(|c| *c == "p_color").count(),
            1
        );
    }

    #[tokio::test]
    async fn latest_alias_version_wins() {
        let store = MemoryStore::new();
        store
            .insert(Table::UserAlias, vec![alias_row("a1", "ada", "u1")])
            .await
            .unwrap();
        store
            .insert(Table::UserAlias, vec![alias_row("a1", "ada", "u2")])
            .await
            .unwrap();
        let rows = store.query(&Query::AliasByName("ada".into())).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(get_str(&rows[0], "user_id"), Some("u2"));
        let owned = store
            .query(&Query::AliasesOfIdentity("u1".into()))
            .await
            .unwrap();
        assert!(owned.is_empty());
    }

    #[tokio::test]
    async fn identities_resolve_by_id_or_alias_and_skip_tombstones() {
        let store = MemoryStore::new();
        store
            .insert(
                Table::User,
                vec![
                    row_of(json!({ "id": "u1", "created_at": 1, "updated_at": 1, "is_deleted": 0 })),
                    row_of(json!({ "id": "u2", "created_at": 2, "updated_at": 2, "is_deleted": 0 })),
                ],
            )
            .await
            .unwrap();
        store
            .insert(Table::UserAlias, vec![alias_row("a1", "ada", "u1")])
            .await
            .unwrap();
        let rows = store
            .query(&Query::IdentitiesByReference(vec!["ada".into(), "u1".into(), "u2".into()]))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(get_str(&rows[0], "alias_id"), Some("a1"));
        assert_eq!(get_str(&rows[1], "alias_id"), None);

        let by_id = store
            .query(&Query::IdentitiesByReference(vec!["u1".into()]))
            .await
            .unwrap();
        assert_eq!(get_str(&by_id[0], "alias_id"), Some("a1"));

        store
            .insert(Table::User, vec![row_of(json!({ "id": "u2", "is_deleted": 1 }))])
            .await
            .unwrap();
        let rows = store
            .query(&Query::IdentitiesByReference(vec!["u2".into()]))
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn definitions_group_types_per_name() {
        let store = MemoryStore::new();
        store
            .insert(
                Table::Property,
                vec![
                    row_of(json!({ "name": "plan", "scope": "user", "column": "p_plan", "data_type": "str", "timestamp": 5 })),
                    row_of(json!({ "name": "plan", "scope": "user", "column": "p_plan", "data_type": "num", "timestamp": 3 })),
                    row_of(json!({ "name": "color", "scope": "event", "column": "p_color", "data_type": "str", "timestamp": 1 })),
                ],
            )
            .await
            .unwrap();
        let rows = store
            .query(&Query::PropertyDefinitions(Scope::User))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["data_types"], json!(["str", "num"]));
        assert_eq!(rows[0]["timestamp"], json!(3));
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_disk() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("state.json");
        let store = MemoryStore::load(&path).unwrap();
        store
            .add_column_if_missing(Table::User, "p_plan", ColumnSpec::Tuple)
            .await
            .unwrap();
        store.save(&path).unwrap();

        let reloaded = MemoryStore::load(&path).unwrap();
        assert!(reloaded.columns(Table::User).contains(&"p_plan".to_string()));
    }
}
