//! Aggregator execution engine (C10).
//!
//! Grounded on `original_source/skvoz/aggregation/server/engine.py`'s
//! `AggregationContext`/`AggregatorEngine` and `util/data.py`'s
//! `DataSplitter`/`string_to_type`.

use std::collections::{HashMap, HashSet};

use regex::Regex;

use crate::aggregate::source::{Source, SourceFile};
use crate::aggregate::table::{GroupKey, Row, Table};
use crate::error::{CoreError, CoreResult};
use crate::tdql::functions::{make_function, Executor};
use crate::tdql::parser::Statement;
use crate::tdql::{evaluate_predicate, MapContext, RpnToken, Value};
use crate::timestamp::{self, BucketKey, BucketUnit};

/// Splits one raw sample value into named fields, coercing each to the
/// narrowest matching type. Mirrors `DataSplitter`.
pub struct DataSplitter {
    varnames: Vec<String>,
    regex: Option<Regex>,
}

impl DataSplitter {
    pub fn new(varnames: Vec<String>, delimiters: Option<Vec<String>>) -> CoreResult<Self> {
        let regex = match &delimiters {
            None => None,
            Some(delims) if delims.len() == 1 => {
                Some(Regex::new(&delims[0]).map_err(|e| CoreError::SyntaxError(e.to_string()))?)
            }
            Some(delims) => {
                let pattern = delims.iter().map(|d| regex::escape(d)).collect::<Vec<_>>().join("|");
                Some(Regex::new(&pattern).map_err(|e| CoreError::SyntaxError(e.to_string()))?)
            }
        };
        Ok(DataSplitter { varnames, regex })
    }

    pub fn varnames(&self) -> &[String] {
        &self.varnames
    }

    /// Returns `None` on a split-count mismatch; the caller drops the
    /// sample rather than failing the whole query (a deliberate departure
    /// from `DataSplitter.__call__`'s raised `Exception`, see DESIGN.md).
    fn split(&self, data: &str) -> Option<HashMap<String, Value>> {
        let limit = self.varnames.len();
        let parts: Vec<&str> = match &self.regex {
            None => data.splitn(limit, ' ').collect(),
            Some(rx) => rx.splitn(data, limit).collect(),
        };
        if parts.len() != limit {
            return None;
        }
        Some(
            self.varnames
                .iter()
                .cloned()
                .zip(parts.into_iter().map(string_to_type))
                .collect(),
        )
    }
}

/// Coerces a split field to int/float, then bool, else leaves it a
/// string. `Value` has no separate int type, so int/float collapse into
/// `Value::Number`, matching `tokenizer.rs`'s own collapse.
fn string_to_type(raw: &str) -> Value {
    if let Ok(n) = raw.parse::<f64>() {
        return Value::Number(n);
    }
    match raw.to_lowercase().as_str() {
        "true" => Value::Boolean(true),
        "false" => Value::Boolean(false),
        _ => Value::Str(raw.to_string()),
    }
}

fn bucket_key_to_value(key: BucketKey) -> Value {
    match key {
        BucketKey::Named(s) => Value::Str(s),
        BucketKey::Year(y) => Value::Number(y as f64),
    }
}

/// Per-query execution state: the compiled SPLIT/WHERE/STORE clauses and
/// the GROUP BY plan. Mirrors `AggregationContext`.
pub struct AggregationContext {
    pub data_split: Option<DataSplitter>,
    pub time_period: Option<(i64, Option<i64>)>,
    pub group_period: Option<BucketUnit>,
    pub group_keys: Vec<String>,
    pub where_program: Option<Vec<RpnToken>>,
    pub functions: HashMap<String, Executor>,
}

impl AggregationContext {
    pub fn new() -> Self {
        AggregationContext {
            data_split: None,
            time_period: None,
            group_period: None,
            group_keys: Vec::new(),
            where_program: None,
            functions: HashMap::new(),
        }
    }

    /// `true` means the row is rejected. Mirrors `filter_row`.
    fn filter_row(&self, fields: &HashMap<String, Value>) -> CoreResult<bool> {
        match &self.where_program {
            None => Ok(false),
            Some(program) => {
                let mut ctx = MapContext::new(fields.clone());
                evaluate_predicate(program, &mut ctx)
            }
        }
    }

    fn functions_reset(&mut self) {
        for func in self.functions.values_mut() {
            func.reset();
        }
    }

    /// Folds `rows` through the registered STORE functions into a single
    /// result row, or returns `rows` unchanged when STORE is absent.
    /// Mirrors `aggregate_results`.
    pub fn aggregate_results(&mut self, rows: Vec<Row>, group: Option<&GroupKey>) -> CoreResult<Vec<Row>> {
        if self.functions.is_empty() {
            return Ok(rows);
        }
        self.functions_reset();
        for mut row in rows {
            if let Some(group) = group {
                for (k, v) in group {
                    row.insert(k.clone(), Value::Str(v.clone()));
                }
            }
            let flat: HashMap<String, Value> = row.into_iter().collect();
            for func in self.functions.values_mut() {
                func.apply(&flat)?;
            }
        }
        let mut result_row = Row::new();
        for (key, func) in &self.functions {
            result_row.insert(key.clone(), func.result());
        }
        Ok(vec![result_row])
    }
}

impl Default for AggregationContext {
    fn default() -> Self {
        Self::new()
    }
}

/// One row tagged with its real sample timestamp, used only to restore
/// timestamp order across merged alias streams; the displayed `__ts__`
/// value (a calendar bucket label when GROUP BY names a time unit) lives
/// in the row itself. The original sorts by the bucket label directly,
/// which can misorder adjacent buckets under lexicographic string
/// comparison (e.g. single- vs double-digit week numbers); keeping the
/// real timestamp alongside avoids that, see DESIGN.md.
struct SortedRow {
    sort_ts: i64,
    row: Row,
}

fn fetch_files(
    context: &AggregationContext,
    source: &dyn Source,
    alias: &str,
    files: Vec<SourceFile>,
) -> CoreResult<Vec<SortedRow>> {
    let files = match context.time_period {
        Some((start, end)) => source.filter_files_by_time(files, start, end.unwrap_or(i64::MAX)),
        None => files,
    };

    let reader = source
        .read_files(&files)
        .map_err(|e| CoreError::EvalError(e.to_string()))?;
    let mut pairs = Vec::new();
    for item in reader {
        pairs.push(item.map_err(|e| CoreError::EvalError(e.to_string()))?);
    }

    let pairs: Vec<(i64, String)> = match context.time_period {
        Some((start, end)) => timestamp::filter_by_interval(pairs.into_iter(), start, end).collect(),
        None => pairs,
    };

    let mut display: Vec<(i64, Value, String)> = Vec::new();
    match context.group_period {
        Some(unit) => {
            for (bucket_key, items) in timestamp::GroupByTime::new(unit, pairs.into_iter()) {
                let value = bucket_key_to_value(bucket_key);
                for (ts, data) in items {
                    display.push((ts, value.clone(), data));
                }
            }
        }
        None => {
            for (ts, data) in pairs {
                display.push((ts, Value::Number(ts as f64), data));
            }
        }
    }

    let mut out = Vec::new();
    for (sort_ts, display_ts, raw) in display {
        let mut row = Row::new();
        row.insert("__ts__".to_string(), display_ts);
        row.insert("__key__".to_string(), Value::Str(alias.to_string()));

        if let Some(splitter) = &context.data_split {
            let fields = match splitter.split(&raw) {
                Some(f) => f,
                None => continue,
            };
            if context.filter_row(&fields)? {
                continue;
            }
            for (k, v) in fields {
                row.insert(k, v);
            }
        } else {
            row.insert("data".to_string(), Value::Str(raw));
        }

        out.push(SortedRow { sort_ts, row });
    }
    Ok(out)
}

fn merge_raw_or_split(context: &AggregationContext, streams: Vec<Vec<SortedRow>>) -> (Table, Vec<Row>) {
    let columns = match &context.data_split {
        Some(splitter) => {
            let mut cols = vec!["__ts__".to_string(), "__key__".to_string()];
            cols.extend(splitter.varnames().iter().cloned());
            cols
        }
        None => vec!["__ts__".to_string(), "__key__".to_string(), "data".to_string()],
    };

    let mut all: Vec<SortedRow> = streams.into_iter().flatten().collect();
    all.sort_by_key(|r| r.sort_ts);

    let mut table = Table::new(columns);
    for r in &all {
        table.insert(r.row.clone());
    }
    let rows = all.into_iter().map(|r| r.row).collect();
    (table, rows)
}

/// Result of one query: `(groupKey, rows)` pairs, `groupKey` absent for
/// an ungrouped query. Mirrors `AggregatorEngine.fetch`'s return value.
pub type QueryResult = Vec<(Option<GroupKey>, Vec<Row>)>;

/// Builds an `AggregationContext` plus the FROM source name and key map
/// from a parsed statement. Mirrors `parse_query`'s wiring of
/// `query.stmt_*` clauses into one `AggregationContext`.
pub fn build_context(stmt: &Statement) -> CoreResult<(AggregationContext, String, HashMap<String, HashSet<String>>)> {
    let from = stmt
        .from_clause
        .as_ref()
        .ok_or_else(|| CoreError::SyntaxError("missing FROM statement".to_string()))?;
    let source_name = from
        .source
        .clone()
        .ok_or_else(|| CoreError::SyntaxError("missing FROM source".to_string()))?;

    let mut context = AggregationContext::new();

    if let Some(split) = &stmt.split_clause {
        context.data_split = Some(DataSplitter::new(split.results.clone(), split.delimiters.clone())?);
    }

    if let Some(where_clause) = &stmt.where_clause {
        context.where_program = Some(where_clause.program.clone());
    }

    if let Some(store) = &stmt.store_clause {
        for result in &store.results {
            let mut registry: HashMap<String, Box<dyn crate::tdql::functions::AggregateFunction>> = HashMap::new();
            if let Some(fname) = &result.function_name {
                let func = make_function(fname)
                    .ok_or_else(|| CoreError::SyntaxError(format!("unknown function '{fname}'")))?;
                registry.insert(fname.clone(), func);
            }
            context
                .functions
                .insert(result.name.clone(), Executor::new(registry, result.program.clone()));
        }
    }

    if let Some(time) = &stmt.time_clause {
        if let Some(start) = time.start() {
            let end = time.end().map(|d| d.timestamp());
            context.time_period = Some((start.timestamp(), end));
        }
    }

    if let Some(group) = &stmt.group_clause {
        context.group_period = group.time_period;
        context.group_keys = group.names.clone();
    }

    Ok((context, source_name, from.keys.clone()))
}

/// Registry of named data sources plus the `fetch` pipeline that
/// resolves a query's FROM aliases through one of them. Mirrors
/// `AggregatorEngine`.
#[derive(Default)]
pub struct AggregatorEngine {
    sources: HashMap<String, Box<dyn Source>>,
}

impl AggregatorEngine {
    pub fn new() -> Self {
        AggregatorEngine { sources: HashMap::new() }
    }

    pub fn add_source(&mut self, name: impl Into<String>, source: Box<dyn Source>) {
        self.sources.insert(name.into(), source);
    }

    /// Runs the full C10 pipeline for one query against `source_name`.
    /// `keys` is `FromClause::keys` (alias → key/path patterns).
    pub fn fetch(
        &self,
        context: &mut AggregationContext,
        source_name: &str,
        keys: &HashMap<String, HashSet<String>>,
    ) -> CoreResult<QueryResult> {
        let source = self
            .sources
            .get(source_name)
            .ok_or_else(|| CoreError::InvalidSource(source_name.to_string()))?;

        let resolved = source
            .files_from_keys(keys)
            .map_err(|e| CoreError::EvalError(e.to_string()))?;

        let mut streams = Vec::new();
        for (alias, files) in resolved {
            streams.push(fetch_files(context, source.as_ref(), &alias, files)?);
        }

        let (table, rows) = merge_raw_or_split(context, streams);

        if !context.group_keys.is_empty() || context.group_period.is_some() {
            let mut translated_keys: Vec<String> = context
                .group_keys
                .iter()
                .map(|k| if k == "key" { "__key__".to_string() } else { k.clone() })
                .collect();
            // A time-unit GROUP BY buckets samples via `__ts__` (set to the
            // bucket label in `fetch_files`); without it every row collapses
            // into one partition regardless of bucket.
            if context.group_period.is_some() && !translated_keys.contains(&"__ts__".to_string()) {
                translated_keys.insert(0, "__ts__".to_string());
            }
            let groups = crate::aggregate::table::group_by(&table, &translated_keys);
            let mut out = Vec::with_capacity(groups.len());
            for (group_key, group_table) in groups {
                let aggregated = context.aggregate_results(group_table.rows, Some(&group_key))?;
                out.push((Some(group_key), aggregated));
            }
            Ok(out)
        } else {
            let aggregated = context.aggregate_results(rows, None)?;
            Ok(vec![(None, aggregated)])
        }
    }
}

/// Parses `query` and runs it against `engine` end to end. Mirrors
/// `execute_query`.
pub fn run_query(engine: &AggregatorEngine, query: &str) -> CoreResult<QueryResult> {
    let stmt = crate::tdql::parse_statement(query)?;
    let (mut context, source_name, keys) = build_context(&stmt)?;
    engine.fetch(&mut context, &source_name, &keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::source::FileSource;
    use crate::tdql::functions::make_function;
    use crate::tdql::{compile_expression, tokenize};
    use std::fs;
    use tempfile::TempDir;

    fn engine_with_file_source() -> AggregatorEngine {
        let mut engine = AggregatorEngine::new();
        engine.add_source("files", Box::new(FileSource));
        engine
    }

    #[test]
    fn string_to_type_coerces_numbers_and_booleans() {
        assert_eq!(string_to_type("42"), Value::Number(42.0));
        assert_eq!(string_to_type("3.5"), Value::Number(3.5));
        assert_eq!(string_to_type("true"), Value::Boolean(true));
        assert_eq!(string_to_type("hello"), Value::Str("hello".to_string()));
    }

    #[test]
    fn data_splitter_splits_on_single_delimiter() {
        let splitter = DataSplitter::new(vec!["a".to_string(), "b".to_string()], Some(vec![":".to_string()])).unwrap();
        let fields = splitter.split("10:20").unwrap();
        assert_eq!(fields.get("a"), Some(&Value::Number(10.0)));
        assert_eq!(fields.get("b"), Some(&Value::Number(20.0)));
    }

    #[test]
    fn data_splitter_drops_on_count_mismatch() {
        let splitter = DataSplitter::new(vec!["a".to_string(), "b".to_string()], Some(vec![":".to_string()])).unwrap();
        assert!(splitter.split("only-one").is_none());
    }

    #[test]
    fn fetch_without_split_merges_alias_streams_by_timestamp() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.tsv");
        let b = dir.path().join("b.tsv");
        fs::write(&a, "1 x1\n3 x3\n").unwrap();
        fs::write(&b, "2 y2\n4 y4\n").unwrap();

        let engine = engine_with_file_source();
        let mut context = AggregationContext::new();
        let mut keys = HashMap::new();
        keys.insert("a".to_string(), HashSet::from([a.to_string_lossy().to_string()]));
        keys.insert("b".to_string(), HashSet::from([b.to_string_lossy().to_string()]));

        let result = engine.fetch(&mut context, "files", &keys).unwrap();
        assert_eq!(result.len(), 1);
        let (group, rows) = &result[0];
        assert!(group.is_none());
        assert_eq!(rows.len(), 4);
        let tss: Vec<i64> = rows
            .iter()
            .map(|r| match r.get("__ts__").unwrap() {
                Value::Number(n) => *n as i64,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(tss, vec![1, 2, 3, 4]);
    }

    #[test]
    fn fetch_with_split_and_where_filters_rows() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.tsv");
        fs::write(&a, "1 5:1\n2 25:2\n").unwrap();

        let engine = engine_with_file_source();
        let mut context = AggregationContext::new();
        context.data_split =
            Some(DataSplitter::new(vec!["x".to_string(), "y".to_string()], Some(vec![":".to_string()])).unwrap());
        let where_tokens = tokenize("x > 10").unwrap();
        context.where_program = Some(compile_expression(&where_tokens, &HashSet::new()).unwrap());

        let mut keys = HashMap::new();
        keys.insert("a".to_string(), HashSet::from([a.to_string_lossy().to_string()]));

        let result = engine.fetch(&mut context, "files", &keys).unwrap();
        let (_, rows) = &result[0];
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("x"), Some(&Value::Number(5.0)));
    }

    #[test]
    fn fetch_with_store_function_reduces_to_single_row() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.tsv");
        fs::write(&a, "1 4\n2 6\n").unwrap();

        let engine = engine_with_file_source();
        let mut context = AggregationContext::new();
        context.data_split = Some(DataSplitter::new(vec!["v".to_string()], None).unwrap());

        let functions: HashSet<String> = ["SUM".to_string()].into_iter().collect();
        let tokens = tokenize("sum(v)").unwrap();
        let program = compile_expression(&tokens, &functions).unwrap();
        let mut registry: HashMap<String, Box<dyn crate::tdql::functions::AggregateFunction>> = HashMap::new();
        registry.insert("sum".to_string(), make_function("sum").unwrap());
        context.functions.insert("total".to_string(), Executor::new(registry, program));

        let mut keys = HashMap::new();
        keys.insert("a".to_string(), HashSet::from([a.to_string_lossy().to_string()]));

        let result = engine.fetch(&mut context, "files", &keys).unwrap();
        assert_eq!(result.len(), 1);
        let (_, rows) = &result[0];
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("total"), Some(&Value::Number(10.0)));
    }

    #[test]
    fn fetch_with_group_keys_partitions_results() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.tsv");
        fs::write(&a, "1 us:1\n2 eu:2\n3 us:3\n").unwrap();

        let engine = engine_with_file_source();
        let mut context = AggregationContext::new();
        context.data_split =
            Some(DataSplitter::new(vec!["region".to_string(), "v".to_string()], Some(vec![":".to_string()])).unwrap());
        context.group_keys = vec!["region".to_string()];

        let mut keys = HashMap::new();
        keys.insert("a".to_string(), HashSet::from([a.to_string_lossy().to_string()]));

        let result = engine.fetch(&mut context, "files", &keys).unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn fetch_with_time_unit_group_partitions_by_bucket() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.tsv");
        // 1678806566/67 fall in one UTC minute, 1678806627/28 the next.
        fs::write(
            &a,
            "1678806566 1\n1678806567 2\n1678806627 3\n1678806628 4\n",
        )
        .unwrap();

        let engine = engine_with_file_source();
        let mut context = AggregationContext::new();
        context.data_split = Some(DataSplitter::new(vec!["v".to_string()], None).unwrap());
        context.group_period = Some(crate::timestamp::BucketUnit::Minute);

        let functions: HashSet<String> = ["SUM".to_string()].into_iter().collect();
        let tokens = tokenize("sum(v)").unwrap();
        let program = compile_expression(&tokens, &functions).unwrap();
        let mut registry: HashMap<String, Box<dyn crate::tdql::functions::AggregateFunction>> = HashMap::new();
        registry.insert("sum".to_string(), make_function("sum").unwrap());
        context.functions.insert("total".to_string(), Executor::new(registry, program));

        let mut keys = HashMap::new();
        keys.insert("a".to_string(), HashSet::from([a.to_string_lossy().to_string()]));

        let result = engine.fetch(&mut context, "files", &keys).unwrap();
        assert_eq!(result.len(), 2);
        let totals: Vec<f64> = result
            .iter()
            .map(|(_, rows)| match rows[0].get("total").unwrap() {
                Value::Number(n) => *n,
                other => panic!("expected a number, got {other:?}"),
            })
            .collect();
        assert_eq!(totals, vec![3.0, 7.0]);
    }
}
