//! Built-in STORE aggregate functions (C8's function registry).
//!
//! Grounded on `original_source/skvoz/aggregation/tdql/functions.py`'s
//! `_Function` subclasses (`reset`/`apply`/`result` contract) and
//! `Executor`, which wires a set of these into an `EvalContext` so a
//! compiled STORE expression like `avg(a) + 1` can call them mid-program.

use std::collections::{BTreeSet, HashMap};

use crate::error::{CoreError, CoreResult};
use crate::tdql::rpn::{rpn_evaluate, EvalContext, RpnToken, Value};

/// Names of every registered aggregate function, lower-case. A KEYWORD
/// token matching one of these (case-insensitively) is promoted to a
/// function call marker at compile time.
pub const FUNCTION_NAMES: &[&str] = &["min", "max", "avg", "sum", "sub", "count", "list", "set"];

/// A stateful running aggregate. Mirrors `_Function`: `apply` folds one
/// more value in, `result` reads the current state without consuming it,
/// `reset` clears it for a new group.
pub trait AggregateFunction: Send {
    fn reset(&mut self);
    fn apply(&mut self, value: &Value) -> CoreResult<()>;
    fn result(&self) -> Value;
}

fn parse_number(value: &Value) -> CoreResult<f64> {
    match value {
        Value::Number(n) => Ok(*n),
        Value::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Str(s) => s
            .trim()
            .parse()
            .map_err(|_| CoreError::EvalError(format!("'{s}' is not numeric"))),
    }
}

#[derive(Default)]
struct MinFunction {
    value: Option<f64>,
}
impl AggregateFunction for MinFunction {
    fn reset(&mut self) {
        self.value = None;
    }
    fn apply(&mut self, value: &Value) -> CoreResult<()> {
        let n = parse_number(value)?;
        self.value = Some(self.value.map_or(n, |v| v.min(n)));
        Ok(())
    }
    fn result(&self) -> Value {
        Value::Number(self.value.unwrap_or(0.0))
    }
}

#[derive(Default)]
struct MaxFunction {
    value: Option<f64>,
}
impl AggregateFunction for MaxFunction {
    fn reset(&mut self) {
        self.value = None;
    }
    fn apply(&mut self, value: &Value) -> CoreResult<()> {
        let n = parse_number(value)?;
        self.value = Some(self.value.map_or(n, |v| v.max(n)));
        Ok(())
    }
    fn result(&self) -> Value {
        Value::Number(self.value.unwrap_or(0.0))
    }
}

#[derive(Default)]
struct SumFunction {
    total: f64,
}
impl AggregateFunction for SumFunction {
    fn reset(&mut self) {
        self.total = 0.0;
    }
    fn apply(&mut self, value: &Value) -> CoreResult<()> {
        self.total += parse_number(value)?;
        Ok(())
    }
    fn result(&self) -> Value {
        Value::Number(self.total)
    }
}

#[derive(Default)]
struct SubFunction {
    total: f64,
}
impl AggregateFunction for SubFunction {
    fn reset(&mut self) {
        self.total = 0.0;
    }
    fn apply(&mut self, value: &Value) -> CoreResult<()> {
        self.total -= parse_number(value)?;
        Ok(())
    }
    fn result(&self) -> Value {
        Value::Number(self.total)
    }
}

#[derive(Default)]
struct AvgFunction {
    total: f64,
    count: u64,
}
impl AggregateFunction for AvgFunction {
    fn reset(&mut self) {
        self.total = 0.0;
        self.count = 0;
    }
    fn apply(&mut self, value: &Value) -> CoreResult<()> {
        self.total += parse_number(value)?;
        self.count += 1;
        Ok(())
    }
    fn result(&self) -> Value {
        if self.count == 0 {
            Value::Number(0.0)
        } else {
            Value::Number(self.total / self.count as f64)
        }
    }
}

#[derive(Default)]
struct CountFunction {
    count: u64,
}
impl AggregateFunction for CountFunction {
    fn reset(&mut self) {
        self.count = 0;
    }
    fn apply(&mut self, _value: &Value) -> CoreResult<()> {
        self.count += 1;
        Ok(())
    }
    fn result(&self) -> Value {
        Value::Number(self.count as f64)
    }
}

#[derive(Default)]
struct ListFunction {
    data: Vec<String>,
}
impl AggregateFunction for ListFunction {
    fn reset(&mut self) {
        self.data.clear();
    }
    fn apply(&mut self, value: &Value) -> CoreResult<()> {
        self.data.push(value.to_string());
        Ok(())
    }
    fn result(&self) -> Value {
        Value::Str(format!("[{}]", self.data.join(", ")))
    }
}

/// Deduplicated collection, mirroring Python's `set`. CPython's set
/// iteration order is hash-dependent and was never a stable contract;
/// this keeps insertion values sorted instead for deterministic output.
#[derive(Default)]
struct SetFunction {
    data: BTreeSet<String>,
}
impl AggregateFunction for SetFunction {
    fn reset(&mut self) {
        self.data.clear();
    }
    fn apply(&mut self, value: &Value) -> CoreResult<()> {
        self.data.insert(value.to_string());
        Ok(())
    }
    fn result(&self) -> Value {
        Value::Str(format!("[{}]", self.data.iter().cloned().collect::<Vec<_>>().join(", ")))
    }
}

/// Instantiates a fresh aggregate function by name (case-insensitive).
pub fn make_function(name: &str) -> Option<Box<dyn AggregateFunction>> {
    match name.to_lowercase().as_str() {
        "min" => Some(Box::new(MinFunction::default())),
        "max" => Some(Box::new(MaxFunction::default())),
        "sum" => Some(Box::new(SumFunction::default())),
        "sub" => Some(Box::new(SubFunction::default())),
        "avg" => Some(Box::new(AvgFunction::default())),
        "count" => Some(Box::new(CountFunction::default())),
        "list" => Some(Box::new(ListFunction::default())),
        "set" => Some(Box::new(SetFunction::default())),
        _ => None,
    }
}

/// Runs one compiled STORE expression per row, feeding every row's field
/// set through the program as an `EvalContext` and folding the referenced
/// aggregate functions' running state as it goes. Mirrors `Executor`:
/// `apply` re-evaluates the whole expression against `dict(functions,
/// **items)` for each row, which is how e.g. `sum(a) + 1` both updates
/// `sum`'s running total and produces this row's running value of the
/// whole expression.
pub struct Executor {
    functions: HashMap<String, Box<dyn AggregateFunction>>,
    program: Vec<RpnToken>,
    last_result: Option<Value>,
}

impl Executor {
    pub fn new(functions: HashMap<String, Box<dyn AggregateFunction>>, program: Vec<RpnToken>) -> Self {
        Executor {
            functions,
            program,
            last_result: None,
        }
    }

    pub fn reset(&mut self) {
        for func in self.functions.values_mut() {
            func.reset();
        }
        self.last_result = None;
    }

    pub fn apply(&mut self, row: &HashMap<String, Value>) -> CoreResult<()> {
        let mut ctx = ExecutorContext { functions: &mut self.functions, row };
        let mut result = rpn_evaluate(&self.program, &mut ctx)?;
        if result.len() != 1 {
            return Err(CoreError::EvalError("STORE expression did not reduce to a single value".to_string()));
        }
        self.last_result = result.pop();
        Ok(())
    }

    pub fn result(&self) -> Value {
        self.last_result.clone().unwrap_or(Value::Number(0.0))
    }
}

struct ExecutorContext<'a> {
    functions: &'a mut HashMap<String, Box<dyn AggregateFunction>>,
    row: &'a HashMap<String, Value>,
}

impl<'a> EvalContext for ExecutorContext<'a> {
    fn lookup(&mut self, name: &str) -> Option<Value> {
        self.row.get(name).cloned()
    }

    fn call(&mut self, name: &str, args: &[Value]) -> CoreResult<Value> {
        let func = self
            .functions
            .get_mut(name)
            .ok_or_else(|| CoreError::EvalError(format!("'{name}' is not a known function")))?;
        for arg in args {
            func.apply(arg)?;
        }
        Ok(func.result())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_function_accumulates_across_apply_calls() {
        let mut f = SumFunction::default();
        f.apply(&Value::Number(1.0)).unwrap();
        f.apply(&Value::Number(2.5)).unwrap();
        assert_eq!(f.result(), Value::Number(3.5));
        f.reset();
        assert_eq!(f.result(), Value::Number(0.0));
    }

    #[test]
    fn avg_function_divides_total_by_count() {
        let mut f = AvgFunction::default();
        f.apply(&Value::Number(10.0)).unwrap();
        f.apply(&Value::Number(20.0)).unwrap();
        assert_eq!(f.result(), Value::Number(15.0));
    }

    #[test]
    fn min_max_track_extremes() {
        let mut min = MinFunction::default();
        let mut max = MaxFunction::default();
        for v in [Value::Number(5.0), Value::Number(1.0), Value::Number(9.0)] {
            min.apply(&v).unwrap();
            max.apply(&v).unwrap();
        }
        assert_eq!(min.result(), Value::Number(1.0));
        assert_eq!(max.result(), Value::Number(9.0));
    }

    #[test]
    fn set_function_deduplicates_and_sorts() {
        let mut f = SetFunction::default();
        f.apply(&Value::Str("b".to_string())).unwrap();
        f.apply(&Value::Str("a".to_string())).unwrap();
        f.apply(&Value::Str("a".to_string())).unwrap();
        assert_eq!(f.result(), Value::Str("[a, b]".to_string()));
    }

    #[test]
    fn executor_folds_running_sum_across_rows() {
        use crate::tdql::rpn::compile_expression;
        use crate::tdql::tokenizer::tokenize;
        use std::collections::HashSet;

        let functions: HashSet<String> = ["SUM".to_string()].into_iter().collect();
        let tokens = tokenize("sum(a)").unwrap();
        let program = compile_expression(&tokens, &functions).unwrap();

        let mut registry: HashMap<String, Box<dyn AggregateFunction>> = HashMap::new();
        registry.insert("sum".to_string(), make_function("sum").unwrap());

        let mut executor = Executor::new(registry, program);
        executor.reset();
        executor.apply(&HashMap::from([("a".to_string(), Value::Number(4.0))])).unwrap();
        assert_eq!(executor.result(), Value::Number(4.0));
        executor.apply(&HashMap::from([("a".to_string(), Value::Number(6.0))])).unwrap();
        assert_eq!(executor.result(), Value::Number(10.0));
    }
}
