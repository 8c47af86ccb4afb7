//! Schema catalog
//!
//! Maps a table id to its fixed record size and, optionally, the id of a
//! secondary table maintained by the workload. The catalog is built once
//! before any transaction runs and is read-only afterwards, so it is shared
//! as a plain `Arc<Schema>` without interior locking.

use crate::types::TableId;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Per-table metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableInfo {
    /// Fixed size in bytes of every record in the table.
    pub record_size: usize,
    /// Secondary table fed by the workload, if any.
    pub secondary: Option<TableId>,
}

/// Immutable table catalog.
#[derive(Debug, Default)]
pub struct Schema {
    tables: FxHashMap<TableId, TableInfo>,
}

impl Schema {
    /// Start building a catalog.
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Record size of `table`.
    ///
    /// # Panics
    /// Panics if the table was never registered; operating on an unknown
    /// table is a contract violation.
    pub fn record_size(&self, table: TableId) -> usize {
        self.info(table).record_size
    }

    /// Secondary table of `table`, if one was registered.
    pub fn secondary_table(&self, table: TableId) -> Option<TableId> {
        self.info(table).secondary
    }

    /// Whether `table` has a secondary table.
    pub fn has_secondary_table(&self, table: TableId) -> bool {
        self.info(table).secondary.is_some()
    }

    /// All registered table ids, in unspecified order.
    pub fn tables(&self) -> impl Iterator<Item = TableId> + '_ {
        self.tables.keys().copied()
    }

    fn info(&self, table: TableId) -> &TableInfo {
        self.tables
            .get(&table)
            .expect("table not registered in schema")
    }
}

/// Builder for [`Schema`]. Registration happens before workload execution;
/// `freeze` hands out the shared read-only catalog.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    tables: FxHashMap<TableId, TableInfo>,
}

impl SchemaBuilder {
    /// Register `table` with a fixed record size.
    pub fn table(mut self, table: TableId, record_size: usize) -> Self {
        self.tables.insert(
            table,
            TableInfo {
                record_size,
                secondary: None,
            },
        );
        self
    }

    /// Attach a secondary table id to an already-registered table.
    ///
    /// # Panics
    /// Panics if `primary` was not registered first.
    pub fn secondary(mut self, primary: TableId, secondary: TableId) -> Self {
        self.tables
            .get_mut(&primary)
            .expect("secondary registered before its primary table")
            .secondary = Some(secondary);
        self
    }

    /// Finish building and share the catalog.
    pub fn freeze(self) -> Arc<Schema> {
        Arc::new(Schema {
            tables: self.tables,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let schema = Schema::builder()
            .table(1, 128)
            .table(2, 64)
            .secondary(1, 10)
            .freeze();
        assert_eq!(schema.record_size(1), 128);
        assert_eq!(schema.record_size(2), 64);
        assert_eq!(schema.secondary_table(1), Some(10));
        assert!(!schema.has_secondary_table(2));
        let mut tables: Vec<_> = schema.tables().collect();
        tables.sort_unstable();
        assert_eq!(tables, vec![1, 2]);
    }

    #[test]
    #[should_panic(expected = "not registered")]
    fn test_unknown_table_panics() {
        let schema = Schema::builder().freeze();
        schema.record_size(42);
    }
}
