//! Storage collaborator contract.
//!
//! The analytical store is append-only: writing a row for a key that already
//! exists adds a newer version, and reads only ever see the latest version.
//! Every operation here must be safe to repeat.

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::schema::Scope;

/// One JSON object per row, keyed by column name.
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Event,
    User,
    UserAlias,
    Property,
    UserPropertyTime,
}

impl Table {
    pub const ALL: [Table; 5] = [
        Table::Event,
        Table::User,
        Table::UserAlias,
        Table::Property,
        Table::UserPropertyTime,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Event => "event",
            Table::User => "user",
            Table::UserAlias => "user_alias",
            Table::Property => "property",
            Table::UserPropertyTime => "user_property_time",
        }
    }

    /// Columns every table is created with, before any property column is added.
    pub fn base_columns(&self) -> &'static [&'static str] {
        match self {
            Table::Event => &["time", "event", "user_alias_id"],
            Table::User => &[
                "id",
                "created_at",
                "updated_at",
                "is_deleted",
                "name",
                "email",
                "avatar",
            ],
            Table::UserAlias => &["id", "alias", "user_id", "updated_at", "is_deleted"],
            Table::Property => &["name", "scope", "column", "data_type", "timestamp"],
            Table::UserPropertyTime => &["user_id", "property", "timestamp", "mode"],
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnSpec {
    /// Multi-type property column: four nullable slots, one per property type.
    Tuple,
}

impl ColumnSpec {
    pub fn type_spec(&self) -> &'static str {
        match self {
            ColumnSpec::Tuple => {
                "Tuple(str Nullable(String), num Nullable(Float64), bool Nullable(Boolean), date Nullable(DateTime64(3))) DEFAULT (NULL, NULL, NULL, NULL)"
            }
        }
    }
}

/// Typed read requests understood by a storage backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// One row `{name}` per physical column of the table.
    DescribeTable(Table),
    /// One row `{name, scope, column, data_types, timestamp}` per definition
    /// of the scope; `data_types` is an array, `timestamp` the first sighting.
    PropertyDefinitions(Scope),
    /// Live identities whose id or any live alias matches one of the
    /// references. Rows carry `alias_id`: the matched alias, or for a match
    /// by id any live alias of the identity.
    IdentitiesByReference(Vec<String>),
    /// The live alias record for an alias string.
    AliasByName(String),
    /// Live alias records currently pointing at an identity id.
    AliasesOfIdentity(String),
    /// Latest provenance row per (user_id, property) for the given ids.
    PropertyTimes(Vec<String>),
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn query(&self, query: &Query) -> Result<Vec<Row>>;

    async fn insert(&self, table: Table, rows: Vec<Row>) -> Result<()>;

    async fn add_column_if_missing(&self, table: Table, column: &str, spec: ColumnSpec)
    -> Result<()>;
}
