//! TDQL statement parser (C9).
//!
//! Grounded on `original_source/skvoz/aggregation/tdql/parser.py`'s `Stmt`
//! subclasses (`StmtFrom`/`StmtTime`/`StmtSplit`/`StmtGroupBy`/`StmtWhere`/
//! `StmtFunction`/`StmtStore`) and `Query.parse`'s dispatch loop: every
//! `KEYWORD` token naming a clause closes the previous clause and opens the
//! next; every other token is forwarded to whichever clause is active.
//!
//! `GROUP BY` is generalized past the original's `key`-or-time-unit-only
//! vocabulary to accept any SPLIT result name, matching the grammar's
//! post-validation rule (`GROUP BY` names are a subset of `{__ts__,
//! __key__} ∪ SPLIT.results`) rather than the original's narrower and
//! inconsistent `StmtGroupBy`/`engine.py` pairing (`engine.py` validates
//! against a `stmt_group.keys` attribute `StmtGroupBy` never defines).

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};

use crate::error::{CoreError, CoreResult};
use crate::tdql::functions::FUNCTION_NAMES;
use crate::tdql::rpn::{compile_expression, rpn_to_infix_string, RpnToken};
use crate::tdql::tokenizer::{tokenize, RawToken};
use crate::timestamp::BucketUnit;

fn strip_plural(symbol: &str) -> String {
    symbol.strip_suffix('s').unwrap_or(symbol).to_string()
}

fn token_symbol(token: &RawToken) -> CoreResult<String> {
    match token {
        RawToken::Keyword(s) | RawToken::Str(s) => Ok(s.clone()),
        RawToken::Number(n) => Ok(n.to_string()),
        RawToken::Boolean(b) => Ok(b.to_string()),
        other => Err(CoreError::SyntaxError(format!("unexpected token '{other:?}'"))),
    }
}

trait Clause {
    fn add(&mut self, token: RawToken) -> CoreResult<()>;
    fn close(&mut self) -> CoreResult<()> {
        Ok(())
    }
}

// --- FROM ------------------------------------------------------------------

/// `FROM <source> key1 [AS alias1], key2 [AS alias2], ...`. `keys` maps
/// alias → the set of underlying keys/paths it covers (a bare key with no
/// `AS` aliases to itself), mirroring `StmtFrom.keys`'s
/// `defaultdict(set)`.
#[derive(Debug, Default)]
pub struct FromClause {
    pub source: Option<String>,
    pub keys: HashMap<String, HashSet<String>>,
    key_name_pending: bool,
    current_key: Option<String>,
}

impl Clause for FromClause {
    fn add(&mut self, token: RawToken) -> CoreResult<()> {
        if matches!(token, RawToken::Comma | RawToken::LParen | RawToken::RParen) {
            return Ok(());
        }
        if let RawToken::Keyword(sym) = &token {
            if sym.eq_ignore_ascii_case("as") {
                if self.source.is_none() {
                    return Err(CoreError::SyntaxError("you need to specify a source".to_string()));
                }
                if self.current_key.is_none() {
                    return Err(CoreError::SyntaxError("you need to specify a key or path".to_string()));
                }
                self.key_name_pending = true;
                return Ok(());
            }
        }
        let symbol = token_symbol(&token)?;
        if self.source.is_none() {
            self.source = Some(strip_plural(&symbol.to_lowercase()));
        } else if self.key_name_pending {
            self.keys.entry(symbol).or_default().insert(self.current_key.take().unwrap());
            self.key_name_pending = false;
        } else {
            if let Some(prev) = self.current_key.take() {
                self.keys.entry(prev.clone()).or_default().insert(prev);
            }
            self.current_key = Some(symbol);
        }
        Ok(())
    }

    fn close(&mut self) -> CoreResult<()> {
        if self.key_name_pending {
            return Err(CoreError::SyntaxError("missing key name".to_string()));
        }
        if let Some(key) = self.current_key.take() {
            self.keys.entry(key.clone()).or_default().insert(key);
        }
        Ok(())
    }
}

// --- TIME ------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum TimeBound {
    Number(f64),
    Instant(DateTime<Utc>),
}

const TIME_FORMATS: &[&str] = &[
    "%Y",
    "%Y-%m",
    "%Y-%m-%d",
    "%Y-%m-%d-%H",
    "%Y-%m-%d-%H:%M",
    "%Y-%m-%d-%H:%M:%S",
];

fn parse_time_string(s: &str) -> CoreResult<DateTime<Utc>> {
    for fmt in TIME_FORMATS {
        if let Ok(naive) = chrono::NaiveDate::parse_from_str(s, fmt) {
            return Ok(naive.and_hms_opt(0, 0, 0).unwrap().and_utc());
        }
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }
    Err(CoreError::SyntaxError(format!("could not determine date from '{s}'")))
}

/// Resolves a "N <unit>[s]" relative marker to an absolute instant, the
/// way `_last_years`/`_last_months`/etc. shift from `datetime.today()`.
/// Weeks and years are flattened to a clean "N weeks/years ago" rather
/// than the original's dead week-alignment loop and its int-vs-datetime
/// mismatch for years (see DESIGN.md).
fn relative_unit(name: &str) -> Option<fn(f64) -> DateTime<Utc>> {
    match strip_plural(&name.to_lowercase()).as_str() {
        "year" => Some(|n| {
            let years = n as i32;
            Utc::now()
                .with_year(Utc::now().year() - years)
                .unwrap_or_else(Utc::now)
                .with_month(1)
                .and_then(|d| d.with_day(1))
                .unwrap_or_else(Utc::now)
        }),
        "month" => Some(|n| {
            let today = Utc::now();
            let first_of_month = today - Duration::days((today.day() - 1) as i64);
            let shifted = first_of_month - Duration::days(30 * n as i64);
            shifted
                .with_day(1)
                .unwrap_or(shifted)
        }),
        "week" => Some(|n| Utc::now() - Duration::weeks(n as i64)),
        "day" => Some(|n| Utc::now() - Duration::days(n as i64)),
        "hour" => Some(|n| Utc::now() - Duration::hours(n as i64)),
        "minute" => Some(|n| Utc::now() - Duration::minutes(n as i64)),
        "second" => Some(|n| Utc::now() - Duration::seconds(n as i64)),
        _ => None,
    }
}

use chrono::Datelike;

#[derive(Debug, Default)]
pub struct TimeClause {
    start: Option<TimeBound>,
    end: Option<TimeBound>,
}

impl TimeClause {
    pub fn start(&self) -> Option<DateTime<Utc>> {
        match self.start {
            Some(TimeBound::Instant(t)) => Some(t),
            _ => None,
        }
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        match self.end {
            Some(TimeBound::Instant(t)) => Some(t),
            _ => None,
        }
    }
}

impl Clause for TimeClause {
    fn add(&mut self, token: RawToken) -> CoreResult<()> {
        if matches!(token, RawToken::Comma | RawToken::LParen | RawToken::RParen) {
            return Ok(());
        }
        if let RawToken::Keyword(sym) = &token {
            if let Some(resolver) = relative_unit(sym) {
                let slot = if self.end.is_some() { &mut self.end } else { &mut self.start };
                let n = match slot.take() {
                    Some(TimeBound::Number(n)) => n,
                    Some(TimeBound::Instant(_)) => {
                        return Err(CoreError::SyntaxError("time interval is just start-end".to_string()))
                    }
                    None => return Err(CoreError::SyntaxError(format!("missing amount before '{sym}'"))),
                };
                *slot = Some(TimeBound::Instant(resolver(n)));
                return Ok(());
            }
        }
        let bound = match &token {
            RawToken::Number(n) => TimeBound::Number(*n),
            RawToken::Str(s) | RawToken::Keyword(s) => TimeBound::Instant(parse_time_string(s)?),
            _ => return Err(CoreError::SyntaxError("unexpected token in TIME clause".to_string())),
        };
        if self.start.is_none() {
            self.start = Some(bound);
        } else if self.end.is_none() {
            self.end = Some(bound);
        } else {
            return Err(CoreError::SyntaxError("time interval is just start-end".to_string()));
        }
        Ok(())
    }
}

// --- SPLIT -------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct SplitClause {
    pub results: Vec<String>,
    pub delimiters: Option<Vec<String>>,
}

impl Clause for SplitClause {
    fn add(&mut self, token: RawToken) -> CoreResult<()> {
        if matches!(token, RawToken::Comma) {
            return Ok(());
        }
        if let RawToken::Keyword(sym) = &token {
            if sym.eq_ignore_ascii_case("on") {
                self.delimiters = Some(Vec::new());
                return Ok(());
            }
        }
        let symbol = token_symbol(&token)?;
        match &mut self.delimiters {
            Some(delims) => delims.push(symbol),
            None => self.results.push(symbol),
        }
        Ok(())
    }
}

// --- GROUP BY ----------------------------------------------------------------

#[derive(Debug, Default)]
pub struct GroupByClause {
    pub names: Vec<String>,
    pub time_period: Option<BucketUnit>,
}

impl Clause for GroupByClause {
    fn add(&mut self, token: RawToken) -> CoreResult<()> {
        if matches!(token, RawToken::Comma) {
            return Ok(());
        }
        if let RawToken::Keyword(sym) = &token {
            if sym.eq_ignore_ascii_case("by") {
                return Ok(());
            }
        }
        let symbol = strip_plural(&token_symbol(&token)?.to_lowercase());
        if let Some(unit) = BucketUnit::parse(&symbol) {
            if let Some(existing) = self.time_period {
                if existing != unit {
                    return Err(CoreError::SyntaxError(format!(
                        "another time period already specified '{existing:?}'"
                    )));
                }
            }
            self.time_period = Some(unit);
        } else {
            self.names.push(symbol);
        }
        Ok(())
    }
}

// --- WHERE -------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct WhereClause {
    tokens: Vec<RawToken>,
    pub program: Vec<RpnToken>,
}

impl Clause for WhereClause {
    fn add(&mut self, token: RawToken) -> CoreResult<()> {
        self.tokens.push(token);
        Ok(())
    }

    fn close(&mut self) -> CoreResult<()> {
        self.program = compile_expression(&self.tokens, &HashSet::new())?;
        Ok(())
    }
}

// --- STORE -------------------------------------------------------------------

/// One `expr [AS name]` result of a STORE clause.
#[derive(Debug)]
pub struct StoreResult {
    pub name: String,
    pub function_name: Option<String>,
    pub program: Vec<RpnToken>,
}

#[derive(Debug, Default)]
pub struct StoreClause {
    pub results: Vec<StoreResult>,
    current_tokens: Vec<RawToken>,
    expecting_name: bool,
    pending_name: Option<String>,
    paren_depth: i32,
}

impl StoreClause {
    fn finish_current(&mut self) -> CoreResult<()> {
        if self.current_tokens.is_empty() {
            return Ok(());
        }
        let mut used_functions = HashSet::new();
        for tok in &self.current_tokens {
            if let RawToken::Keyword(k) = tok {
                if FUNCTION_NAMES.iter().any(|f| f.eq_ignore_ascii_case(k)) {
                    used_functions.insert(k.to_uppercase());
                }
            }
        }
        if used_functions.len() > 1 {
            return Err(CoreError::SyntaxError(
                "only one aggregate function is supported per STORE expression".to_string(),
            ));
        }
        let program = compile_expression(&self.current_tokens, &used_functions)?;
        let function_name = used_functions.into_iter().next().map(|s| s.to_lowercase());
        let name = match self.pending_name.take() {
            Some(n) => n,
            None => rpn_to_infix_string(&program)?,
        };
        self.results.push(StoreResult { name, function_name, program });
        self.current_tokens.clear();
        Ok(())
    }
}

impl Clause for StoreClause {
    fn add(&mut self, token: RawToken) -> CoreResult<()> {
        if let RawToken::Keyword(sym) = &token {
            if sym.eq_ignore_ascii_case("as") && self.paren_depth == 0 {
                self.expecting_name = true;
                return Ok(());
            }
        }
        if self.expecting_name {
            self.pending_name = Some(token_symbol(&token)?);
            self.expecting_name = false;
            return self.finish_current();
        }
        match &token {
            RawToken::Comma if self.paren_depth == 0 => return self.finish_current(),
            RawToken::LParen => self.paren_depth += 1,
            RawToken::RParen => self.paren_depth -= 1,
            _ => {}
        }
        self.current_tokens.push(token);
        Ok(())
    }

    fn close(&mut self) -> CoreResult<()> {
        self.finish_current()
    }
}

// --- Top-level statement -----------------------------------------------------

#[derive(Debug, Default)]
pub struct Statement {
    pub from_clause: Option<FromClause>,
    pub time_clause: Option<TimeClause>,
    pub group_clause: Option<GroupByClause>,
    pub split_clause: Option<SplitClause>,
    pub where_clause: Option<WhereClause>,
    pub store_clause: Option<StoreClause>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClauseKind {
    From,
    Time,
    Group,
    Split,
    Where,
    Store,
}

impl ClauseKind {
    fn from_keyword(sym: &str) -> Option<Self> {
        match sym.to_lowercase().as_str() {
            "from" => Some(ClauseKind::From),
            "time" => Some(ClauseKind::Time),
            "group" => Some(ClauseKind::Group),
            "split" => Some(ClauseKind::Split),
            "where" => Some(ClauseKind::Where),
            "store" => Some(ClauseKind::Store),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ClauseKind::From => "from",
            ClauseKind::Time => "time",
            ClauseKind::Group => "group",
            ClauseKind::Split => "split",
            ClauseKind::Where => "where",
            ClauseKind::Store => "store",
        }
    }
}

enum Active {
    From(FromClause),
    Time(TimeClause),
    Group(GroupByClause),
    Split(SplitClause),
    Where(WhereClause),
    Store(StoreClause),
}

impl Active {
    fn new(kind: ClauseKind) -> Self {
        match kind {
            ClauseKind::From => Active::From(FromClause::default()),
            ClauseKind::Time => Active::Time(TimeClause::default()),
            ClauseKind::Group => Active::Group(GroupByClause::default()),
            ClauseKind::Split => Active::Split(SplitClause::default()),
            ClauseKind::Where => Active::Where(WhereClause::default()),
            ClauseKind::Store => Active::Store(StoreClause::default()),
        }
    }

    fn add(&mut self, token: RawToken) -> CoreResult<()> {
        match self {
            Active::From(c) => c.add(token),
            Active::Time(c) => c.add(token),
            Active::Group(c) => c.add(token),
            Active::Split(c) => c.add(token),
            Active::Where(c) => c.add(token),
            Active::Store(c) => c.add(token),
        }
    }

    fn close_into(mut self, stmt: &mut Statement) -> CoreResult<()> {
        match &mut self {
            Active::From(c) => c.close()?,
            Active::Time(c) => c.close()?,
            Active::Group(c) => c.close()?,
            Active::Split(c) => c.close()?,
            Active::Where(c) => c.close()?,
            Active::Store(c) => c.close()?,
        }
        match self {
            Active::From(c) => stmt.from_clause = Some(c),
            Active::Time(c) => stmt.time_clause = Some(c),
            Active::Group(c) => stmt.group_clause = Some(c),
            Active::Split(c) => stmt.split_clause = Some(c),
            Active::Where(c) => stmt.where_clause = Some(c),
            Active::Store(c) => stmt.store_clause = Some(c),
        }
        Ok(())
    }

    fn kind(&self) -> ClauseKind {
        match self {
            Active::From(_) => ClauseKind::From,
            Active::Time(_) => ClauseKind::Time,
            Active::Group(_) => ClauseKind::Group,
            Active::Split(_) => ClauseKind::Split,
            Active::Where(_) => ClauseKind::Where,
            Active::Store(_) => ClauseKind::Store,
        }
    }
}

fn already_has(stmt: &Statement, kind: ClauseKind) -> bool {
    match kind {
        ClauseKind::From => stmt.from_clause.is_some(),
        ClauseKind::Time => stmt.time_clause.is_some(),
        ClauseKind::Group => stmt.group_clause.is_some(),
        ClauseKind::Split => stmt.split_clause.is_some(),
        ClauseKind::Where => stmt.where_clause.is_some(),
        ClauseKind::Store => stmt.store_clause.is_some(),
    }
}

/// Parses a full TDQL query string into a `Statement`.
pub fn parse_statement(query: &str) -> CoreResult<Statement> {
    let tokens = tokenize(query)?;
    let mut stmt = Statement::default();
    let mut current: Option<Active> = None;

    for token in tokens {
        if let RawToken::Keyword(sym) = &token {
            if let Some(kind) = ClauseKind::from_keyword(sym) {
                if let Some(active) = current.take() {
                    active.close_into(&mut stmt)?;
                }
                if already_has(&stmt, kind) {
                    return Err(CoreError::SyntaxError(format!(
                        "'{}' statement already specified",
                        kind.name()
                    )));
                }
                current = Some(Active::new(kind));
                continue;
            }
        }
        match current.as_mut() {
            Some(active) => active.add(token)?,
            None => return Err(CoreError::SyntaxError("query must start with a clause keyword".to_string())),
        }
    }
    if let Some(active) = current.take() {
        let _ = active.kind();
        active.close_into(&mut stmt)?;
    }

    if stmt.from_clause.is_none() {
        return Err(CoreError::SyntaxError("missing FROM statement".to_string()));
    }
    if stmt.split_clause.is_none() {
        if stmt.where_clause.is_some() {
            return Err(CoreError::SyntaxError(
                "you need to specify SPLIT to apply a WHERE clause".to_string(),
            ));
        }
        if stmt.store_clause.is_some() {
            return Err(CoreError::SyntaxError("you need to specify SPLIT to STORE something".to_string()));
        }
    }
    if let Some(group) = &stmt.group_clause {
        let split_names: HashSet<&str> = stmt
            .split_clause
            .as_ref()
            .map(|s| s.results.iter().map(String::as_str).collect())
            .unwrap_or_default();
        for name in &group.names {
            if name != "key" && !split_names.contains(name.as_str()) {
                return Err(CoreError::SyntaxError(format!("unknown GROUP BY name '{name}'")));
            }
        }
    }

    Ok(stmt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_from_keys_and_aliases() {
        let stmt = parse_statement("FROM FILES a, b AS bee, c").unwrap();
        let from = stmt.from_clause.unwrap();
        assert_eq!(from.source.as_deref(), Some("file"));
        assert!(from.keys.get("a").unwrap().contains("a"));
        assert!(from.keys.get("bee").unwrap().contains("b"));
        assert!(from.keys.get("c").unwrap().contains("c"));
    }

    #[test]
    fn missing_from_is_a_syntax_error() {
        let err = parse_statement("SPLIT a, b ON ':'").unwrap_err();
        assert!(matches!(err, CoreError::SyntaxError(_)));
    }

    #[test]
    fn where_without_split_is_rejected() {
        let err = parse_statement("FROM KEYS k WHERE a > 1").unwrap_err();
        assert!(matches!(err, CoreError::SyntaxError(_)));
    }

    #[test]
    fn full_query_parses_every_clause() {
        let stmt = parse_statement(
            "FROM KEYS k, l SPLIT a, b ON ':' WHERE a > 20 GROUP BY key, months STORE sum(b) as total",
        )
        .unwrap();
        assert!(stmt.from_clause.is_some());
        let split = stmt.split_clause.unwrap();
        assert_eq!(split.results, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(split.delimiters, Some(vec![":".to_string()]));
        let group = stmt.group_clause.unwrap();
        assert!(group.names.contains(&"key".to_string()));
        assert_eq!(group.time_period, Some(BucketUnit::Month));
        let store = stmt.store_clause.unwrap();
        assert_eq!(store.results.len(), 1);
        assert_eq!(store.results[0].name, "total");
        assert_eq!(store.results[0].function_name.as_deref(), Some("sum"));
    }

    #[test]
    fn store_clause_splits_multiple_results_on_commas() {
        let stmt = parse_statement("FROM KEYS k SPLIT a, b STORE avg(a) as average, sum(b) as total").unwrap();
        let store = stmt.store_clause.unwrap();
        assert_eq!(store.results.len(), 2);
        assert_eq!(store.results[0].name, "average");
        assert_eq!(store.results[1].name, "total");
    }

    #[test]
    fn store_function_call_commas_do_not_split_results() {
        let stmt = parse_statement("FROM KEYS k SPLIT a, b STORE sum(a, b) as total").unwrap();
        let store = stmt.store_clause.unwrap();
        assert_eq!(store.results.len(), 1);
    }

    #[test]
    fn group_by_rejects_names_outside_split_results() {
        let err = parse_statement("FROM KEYS k SPLIT a GROUP BY region").unwrap_err();
        assert!(matches!(err, CoreError::SyntaxError(_)));
    }

    #[test]
    fn group_by_accepts_split_result_names() {
        let stmt = parse_statement("FROM KEYS k SPLIT region, a GROUP BY region").unwrap();
        let group = stmt.group_clause.unwrap();
        assert_eq!(group.names, vec!["region".to_string()]);
    }
}
