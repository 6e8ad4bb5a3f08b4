//! In-memory result table and GROUP BY partitioning (C10).
//!
//! Grounded on `original_source/skvoz/aggregation/server/table.py`'s
//! `Table`/`group_by`. The join helpers in the same file
//! (`JoinTable`/`cross_join`/`inner_join`/`equi_join`/`natural_join`/
//! `left_outer_join`/`right_outer_join`) are not ported — nothing in the
//! grammar produces a join, see DESIGN.md.

use std::collections::BTreeMap;

use crate::tdql::Value;

/// A row is a name→value map; every row in a `Table` carries the same
/// column set. Mirrors `Table.__iter__`'s `dict(zip(columns, row))`.
pub type Row = BTreeMap<String, Value>;

/// An ordered result set. Column order isn't semantically meaningful here
/// (rows are maps, not positional tuples, unlike the original's
/// list-backed rows) but is tracked anyway for `group_by`'s "drop the
/// grouping columns" step.
#[derive(Debug, Default, Clone)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Table { columns, rows: Vec::new() }
    }

    pub fn insert(&mut self, row: Row) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A GROUP BY key: the ordered `(column, value)` pairs that identify one
/// partition, rendered to a stable string since `Value` isn't `Ord`.
pub type GroupKey = Vec<(String, String)>;

/// Partitions `table` by the tuple of `keys`' values, stable-sorted by the
/// key tuple, mirroring `group_by`'s `sorted(groups.iteritems())`. The
/// grouping columns are removed from each partition's rows, matching
/// `row.pop(k)`.
pub fn group_by(table: &Table, keys: &[String]) -> Vec<(GroupKey, Table)> {
    let remaining_columns: Vec<String> =
        table.columns.iter().filter(|c| !keys.contains(c)).cloned().collect();

    let mut groups: BTreeMap<GroupKey, Vec<Row>> = BTreeMap::new();
    for row in &table.rows {
        let gkey: GroupKey = keys
            .iter()
            .map(|k| (k.clone(), row.get(k).map(|v| v.to_string()).unwrap_or_default()))
            .collect();
        let mut remaining = row.clone();
        for k in keys {
            remaining.remove(k);
        }
        groups.entry(gkey).or_default().push(remaining);
    }

    groups
        .into_iter()
        .map(|(key, rows)| {
            let mut t = Table::new(remaining_columns.clone());
            t.rows = rows;
            (key, t)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn group_by_partitions_and_drops_grouping_columns() {
        let mut table = Table::new(vec!["region".to_string(), "value".to_string()]);
        table.insert(row(&[("region", Value::Str("us".to_string())), ("value", Value::Number(1.0))]));
        table.insert(row(&[("region", Value::Str("eu".to_string())), ("value", Value::Number(2.0))]));
        table.insert(row(&[("region", Value::Str("us".to_string())), ("value", Value::Number(3.0))]));

        let groups = group_by(&table, &["region".to_string()]);
        assert_eq!(groups.len(), 2);
        // sorted by key tuple: "eu" < "us"
        assert_eq!(groups[0].0, vec![("region".to_string(), "eu".to_string())]);
        assert_eq!(groups[0].1.len(), 1);
        assert!(!groups[0].1.columns.contains(&"region".to_string()));
        assert_eq!(groups[1].1.len(), 2);
    }

    #[test]
    fn ungrouped_table_keeps_all_rows() {
        let mut table = Table::new(vec!["value".to_string()]);
        table.insert(row(&[("value", Value::Number(1.0))]));
        table.insert(row(&[("value", Value::Number(2.0))]));
        assert_eq!(table.len(), 2);
    }
}
