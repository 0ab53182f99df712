use std::{collections::HashSet, fmt};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        TableName {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Per-destination settings for one source table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Column holding the row identity, used for key-value keys and bus
    /// message keys.
    #[serde(default, alias = "key")]
    pub primary_key: Option<String>,

    /// Column that marks a row as current or superseded in append-only
    /// stores.
    #[serde(default)]
    pub status_flag: Option<String>,

    /// Overrides the destination name (topic, key prefix) for this table.
    #[serde(default)]
    pub target: Option<String>,
}

/// Include/exclude lists applied to incoming events.
///
/// Entries match either a bare table name or `schema.table`. Empty include
/// lists admit everything.
#[derive(Debug, Clone, Default)]
pub struct TableFilter {
    included_databases: HashSet<String>,
    included_tables: HashSet<String>,
    excluded_tables: HashSet<String>,
}

impl TableFilter {
    pub fn new(
        included_databases: impl IntoIterator<Item = String>,
        included_tables: impl IntoIterator<Item = String>,
        excluded_tables: impl IntoIterator<Item = String>,
    ) -> Self {
        TableFilter {
            included_databases: included_databases.into_iter().collect(),
            included_tables: included_tables.into_iter().collect(),
            excluded_tables: excluded_tables.into_iter().collect(),
        }
    }

    pub fn excluding(excluded_tables: impl IntoIterator<Item = String>) -> Self {
        TableFilter::new([], [], excluded_tables)
    }

    fn matches(set: &HashSet<String>, table: &TableName) -> bool {
        set.contains(&table.name) || set.contains(&table.to_string())
    }

    pub fn admits(&self, table: &TableName) -> bool {
        if Self::matches(&self.excluded_tables, table) {
            return false;
        }
        if !self.included_databases.is_empty() && !self.included_databases.contains(&table.schema)
        {
            return false;
        }
        self.included_tables.is_empty() || Self::matches(&self.included_tables, table)
    }
}
