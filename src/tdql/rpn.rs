//! Expression compiler (C7) and RPN stack-machine evaluator (C8).
//!
//! Grounded on `original_source/skvoz/aggregation/tdql/rpn.py`'s
//! `InfixToRpn` (shunting-yard compiler with a stack of sub-compilers for
//! function arguments) and `rpn_evaluate`/`_rpn_binary_evaluate`/
//! `_rpn_unary_evaluate`/`_rpn_function_evaluate`/`rpn_to_infix_string`.
//!
//! Two deliberate departures from the original, both recorded in
//! DESIGN.md:
//!
//! - Function-call detection at a closing `(` checks the top of the
//!   *operator stack* for a promoted function marker, not the tail of the
//!   already-emitted RPN token stream. The Python checks the latter
//!   (`self.rpn_tokens[-1]`), which can never match since a promoted
//!   function name is pushed onto `self.stack`, not `self.rpn_tokens`.
//! - `rpn_evaluate` does not carry the original's exception-driven
//!   deferred/partial evaluation (push operands back, re-emit the
//!   operator literally on failure). Every program here is evaluated
//!   against a fully populated context, so an operator failure is a real
//!   error, not an occasion to defer.

use std::collections::{HashMap, HashSet};

use crate::error::{CoreError, CoreResult};
use crate::tdql::tokenizer::RawToken;

/// A compiled program value. Collapses the original's `(tag, value)`
/// tuples into one enum.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Str(String),
    Boolean(bool),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Boolean(b) => write!(f, "{b}"),
        }
    }
}

/// One instruction in a compiled expression program.
#[derive(Debug, Clone, PartialEq)]
pub enum RpnToken {
    Number(f64),
    Str(String),
    Boolean(bool),
    Keyword(String),
    Operator(String),
    Function(String),
    FunctionArgs(Vec<Vec<RpnToken>>),
}

/// Supplies field values and callable functions during evaluation.
/// Implementations own whatever mutable state a function call needs (an
/// aggregate's running total, for instance), so both methods take `&mut
/// self`.
pub trait EvalContext {
    fn lookup(&mut self, name: &str) -> Option<Value>;
    fn call(&mut self, name: &str, args: &[Value]) -> CoreResult<Value>;
}

/// A read-only row context with no callable functions. Used for WHERE
/// predicates and tests.
pub struct MapContext {
    values: HashMap<String, Value>,
}

impl MapContext {
    pub fn new(values: HashMap<String, Value>) -> Self {
        MapContext { values }
    }
}

impl EvalContext for MapContext {
    fn lookup(&mut self, name: &str) -> Option<Value> {
        self.values.get(name).cloned()
    }

    fn call(&mut self, name: &str, _args: &[Value]) -> CoreResult<Value> {
        Err(CoreError::EvalError(format!("'{name}' is not a known function")))
    }
}

// --- Expression compiler (C7) --------------------------------------------

/// Binding power tiers, loosest last. Mirrors `OPERATORS_PRECEDENCE`;
/// unlike the original, a registered function identifier is never routed
/// through this table at all — see the module doc comment.
const PRECEDENCE_TIERS: &[&[&str]] = &[
    &["NOT"],
    &["*", "/", "%"],
    &["+", "-"],
    &["<<", ">>"],
    &["<", ">", "<=", ">="],
    &["!=", "=="],
    &["&"],
    &["^"],
    &["|"],
    &["AND"],
    &["OR"],
];

fn precedence(op: &str) -> usize {
    for (i, tier) in PRECEDENCE_TIERS.iter().enumerate() {
        if tier.contains(&op) {
            return PRECEDENCE_TIERS.len() - i;
        }
    }
    // Never hit by the current operator set (the tokenizer only ever
    // emits the recognized symbols above) but kept to mirror
    // `_cmp_precedence`'s fallback, which assigns an unmatched symbol the
    // same binding power as the tightest tier.
    PRECEDENCE_TIERS.len()
}

#[derive(Debug, Clone, PartialEq)]
enum StackEntry {
    Operator(String),
    Function(String),
    LParen,
}

struct FuncCall {
    compiler: InfixToRpn,
    completed_args: Vec<Vec<RpnToken>>,
}

struct InfixToRpn {
    functions: HashSet<String>,
    stack: Vec<StackEntry>,
    rpn_tokens: Vec<RpnToken>,
    func_context: Vec<FuncCall>,
    paren_count: i32,
}

impl InfixToRpn {
    fn new(functions: HashSet<String>) -> Self {
        InfixToRpn {
            functions,
            stack: Vec::new(),
            rpn_tokens: Vec::new(),
            func_context: Vec::new(),
            paren_count: 0,
        }
    }

    fn is_at_own_top_level(&self) -> bool {
        self.paren_count == 0 && self.func_context.is_empty()
    }

    fn is_empty_program(&self) -> bool {
        self.rpn_tokens.is_empty() && self.stack.is_empty()
    }

    fn add(&mut self, token: RawToken) -> CoreResult<()> {
        if !self.func_context.is_empty() {
            let at_top = self.func_context.last().unwrap().compiler.is_at_own_top_level();
            return match token {
                RawToken::RParen if at_top => self.close_function_call(),
                RawToken::Comma if at_top => self.split_function_arg(),
                other => self.func_context.last_mut().unwrap().compiler.add(other),
            };
        }
        self.add_at_this_level(token)
    }

    fn close_function_call(&mut self) -> CoreResult<()> {
        let FuncCall { compiler, mut completed_args } = self.func_context.pop().expect("checked by add");
        if !compiler.is_empty_program() {
            completed_args.push(compiler.rpn()?);
        }
        self.paren_count -= 1;
        match self.stack.pop() {
            Some(StackEntry::LParen) => {}
            _ => return Err(CoreError::SyntaxError("unbalanced function call".to_string())),
        }
        match self.stack.pop() {
            Some(StackEntry::Function(name)) => {
                self.rpn_tokens.push(RpnToken::FunctionArgs(completed_args));
                self.rpn_tokens.push(RpnToken::Function(name));
                Ok(())
            }
            _ => Err(CoreError::SyntaxError("function call missing its name".to_string())),
        }
    }

    fn split_function_arg(&mut self) -> CoreResult<()> {
        let functions = self.functions.clone();
        let fc = self.func_context.last_mut().expect("checked by add");
        let finished = std::mem::replace(&mut fc.compiler, InfixToRpn::new(functions));
        fc.completed_args.push(finished.rpn()?);
        Ok(())
    }

    fn add_at_this_level(&mut self, token: RawToken) -> CoreResult<()> {
        match token {
            RawToken::Number(n) => self.rpn_tokens.push(RpnToken::Number(n)),
            RawToken::Str(s) => self.rpn_tokens.push(RpnToken::Str(s)),
            RawToken::Boolean(b) => self.rpn_tokens.push(RpnToken::Boolean(b)),
            RawToken::Keyword(k) => {
                if self.functions.contains(&k.to_uppercase()) {
                    self.stack.push(StackEntry::Function(k));
                } else {
                    self.rpn_tokens.push(RpnToken::Keyword(k));
                }
            }
            RawToken::Operator(op) => {
                while let Some(StackEntry::Operator(top)) = self.stack.last() {
                    if precedence(&op) <= precedence(top) {
                        let top = match self.stack.pop() {
                            Some(StackEntry::Operator(s)) => s,
                            _ => unreachable!(),
                        };
                        self.rpn_tokens.push(RpnToken::Operator(top));
                    } else {
                        break;
                    }
                }
                self.stack.push(StackEntry::Operator(op));
            }
            RawToken::LParen => {
                let is_function_call = matches!(self.stack.last(), Some(StackEntry::Function(_)));
                self.stack.push(StackEntry::LParen);
                self.paren_count += 1;
                if is_function_call {
                    self.func_context.push(FuncCall {
                        compiler: InfixToRpn::new(self.functions.clone()),
                        completed_args: Vec::new(),
                    });
                }
            }
            RawToken::RParen => {
                self.paren_count -= 1;
                if self.paren_count < 0 {
                    return Err(CoreError::SyntaxError("unbalanced parentheses".to_string()));
                }
                loop {
                    match self.stack.pop() {
                        Some(StackEntry::LParen) => break,
                        Some(StackEntry::Operator(op)) => self.rpn_tokens.push(RpnToken::Operator(op)),
                        Some(StackEntry::Function(_)) => {
                            return Err(CoreError::SyntaxError("unexpected function marker".to_string()))
                        }
                        None => return Err(CoreError::SyntaxError("unbalanced parentheses".to_string())),
                    }
                }
            }
            RawToken::Comma => return Err(CoreError::SyntaxError("unexpected ','".to_string())),
        }
        Ok(())
    }

    fn rpn(mut self) -> CoreResult<Vec<RpnToken>> {
        while let Some(entry) = self.stack.pop() {
            match entry {
                StackEntry::Operator(op) => self.rpn_tokens.push(RpnToken::Operator(op)),
                StackEntry::LParen | StackEntry::Function(_) => {
                    return Err(CoreError::SyntaxError("unbalanced parentheses".to_string()));
                }
            }
        }
        Ok(self.rpn_tokens)
    }
}

/// Compiles a tokenized infix expression into an RPN program. `functions`
/// is the set of registered function identifiers (upper-cased); any
/// keyword matching it is promoted to a function call marker instead of
/// a plain field reference.
pub fn compile_expression(tokens: &[RawToken], functions: &HashSet<String>) -> CoreResult<Vec<RpnToken>> {
    let mut compiler = InfixToRpn::new(functions.clone());
    for token in tokens {
        compiler.add(token.clone())?;
    }
    if !compiler.func_context.is_empty() || compiler.paren_count != 0 {
        return Err(CoreError::SyntaxError("unbalanced parentheses".to_string()));
    }
    compiler.rpn()
}

// --- RPN evaluator (C8) ---------------------------------------------------

fn as_number(value: &Value) -> CoreResult<f64> {
    match value {
        Value::Number(n) => Ok(*n),
        Value::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Str(s) => s
            .trim()
            .parse()
            .map_err(|_| CoreError::EvalError(format!("'{s}' is not numeric"))),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Number(n) => *n != 0.0,
        Value::Str(s) => !s.is_empty(),
        Value::Boolean(b) => *b,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Boolean(a), Value::Boolean(b)) => a == b,
        _ => false,
    }
}

fn compare(op: &str, left: &Value, right: &Value) -> CoreResult<Value> {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        _ => return Err(CoreError::EvalError(format!("cannot compare {left} and {right}"))),
    }
    .ok_or_else(|| CoreError::EvalError("incomparable values".to_string()))?;
    Ok(Value::Boolean(match op {
        "<" => ordering.is_lt(),
        ">" => ordering.is_gt(),
        "<=" => ordering.is_le(),
        ">=" => ordering.is_ge(),
        _ => unreachable!(),
    }))
}

fn binary_evaluate(op: &str, left: &Value, right: &Value) -> CoreResult<Value> {
    match op {
        "+" => Ok(Value::Number(as_number(left)? + as_number(right)?)),
        "-" => Ok(Value::Number(as_number(left)? - as_number(right)?)),
        "*" => Ok(Value::Number(as_number(left)? * as_number(right)?)),
        "/" => Ok(Value::Number(as_number(left)? / as_number(right)?)),
        "%" => Ok(Value::Number(as_number(left)? % as_number(right)?)),
        "&" => Ok(Value::Number(((as_number(left)? as i64) & (as_number(right)? as i64)) as f64)),
        "|" => Ok(Value::Number(((as_number(left)? as i64) | (as_number(right)? as i64)) as f64)),
        "^" => Ok(Value::Number(((as_number(left)? as i64) ^ (as_number(right)? as i64)) as f64)),
        "<<" => Ok(Value::Number(((as_number(left)? as i64) << (as_number(right)? as i64)) as f64)),
        ">>" => Ok(Value::Number(((as_number(left)? as i64) >> (as_number(right)? as i64)) as f64)),
        "AND" => Ok(Value::Boolean(truthy(left) && truthy(right))),
        "OR" => Ok(Value::Boolean(truthy(left) || truthy(right))),
        "==" => Ok(Value::Boolean(values_equal(left, right))),
        "!=" => Ok(Value::Boolean(!values_equal(left, right))),
        "<" | ">" | "<=" | ">=" => compare(op, left, right),
        _ => Err(CoreError::EvalError(format!("unknown operator '{op}'"))),
    }
}

fn unary_evaluate(op: &str, operand: &Value) -> CoreResult<Value> {
    match op {
        "-" => Ok(Value::Number(-as_number(operand)?)),
        "NOT" => Ok(Value::Boolean(!truthy(operand))),
        _ => Err(CoreError::EvalError(format!("'{op}' has no unary form"))),
    }
}

/// Runs a compiled program against `ctx`, returning whatever is left on
/// the evaluation stack (normally exactly one value). Mirrors
/// `rpn_evaluate`'s single left-to-right pass, minus the deferred-eval
/// fallback described in the module doc comment.
pub fn rpn_evaluate(program: &[RpnToken], ctx: &mut dyn EvalContext) -> CoreResult<Vec<Value>> {
    let mut stack: Vec<Value> = Vec::new();
    let mut pending_args: Option<&Vec<Vec<RpnToken>>> = None;

    for token in program {
        match token {
            RpnToken::Number(n) => stack.push(Value::Number(*n)),
            RpnToken::Str(s) => stack.push(Value::Str(s.clone())),
            RpnToken::Boolean(b) => stack.push(Value::Boolean(*b)),
            RpnToken::Keyword(k) => {
                let value = ctx.lookup(k).unwrap_or_else(|| Value::Str(k.clone()));
                stack.push(value);
            }
            RpnToken::Operator(op) => {
                if op == "NOT" {
                    let operand = stack
                        .pop()
                        .ok_or_else(|| CoreError::EvalError("'NOT' missing operand".to_string()))?;
                    stack.push(unary_evaluate(op, &operand)?);
                } else if stack.len() >= 2 {
                    let right = stack.pop().unwrap();
                    let left = stack.pop().unwrap();
                    stack.push(binary_evaluate(op, &left, &right)?);
                } else {
                    let operand = stack
                        .pop()
                        .ok_or_else(|| CoreError::EvalError(format!("'{op}' missing operand")))?;
                    stack.push(unary_evaluate(op, &operand)?);
                }
            }
            RpnToken::FunctionArgs(args) => pending_args = Some(args),
            RpnToken::Function(name) => {
                let args = pending_args
                    .take()
                    .ok_or_else(|| CoreError::EvalError(format!("'{name}' called without arguments")))?;
                let mut values = Vec::with_capacity(args.len());
                for arg_program in args {
                    let mut result = rpn_evaluate(arg_program, ctx)?;
                    if result.len() != 1 {
                        return Err(CoreError::EvalError(format!(
                            "argument to '{name}' did not reduce to one value"
                        )));
                    }
                    values.push(result.pop().unwrap());
                }
                stack.push(ctx.call(name, &values)?);
            }
        }
    }

    if pending_args.is_some() {
        return Err(CoreError::EvalError("dangling function arguments".to_string()));
    }
    Ok(stack)
}

/// Evaluates a WHERE clause's compiled program. Rejection semantics: a
/// truthy result means the row is dropped.
pub fn evaluate_predicate(program: &[RpnToken], ctx: &mut dyn EvalContext) -> CoreResult<bool> {
    let mut result = rpn_evaluate(program, ctx)?;
    if result.len() != 1 {
        return Err(CoreError::EvalError(
            "WHERE expression did not reduce to a single value".to_string(),
        ));
    }
    Ok(truthy(&result.pop().unwrap()))
}

/// Reconstructs an infix string from a compiled program. Used by the
/// roundtrip property test: tokenizing and recompiling the result should
/// reproduce an equivalent RPN program.
pub fn rpn_to_infix_string(program: &[RpnToken]) -> CoreResult<String> {
    let mut stack: Vec<String> = Vec::new();
    let mut pending_args: Option<&Vec<Vec<RpnToken>>> = None;

    for token in program {
        match token {
            RpnToken::Number(n) => stack.push(n.to_string()),
            RpnToken::Str(s) => stack.push(format!("'{}'", s.replace('\'', "\\'"))),
            RpnToken::Boolean(b) => stack.push(b.to_string()),
            RpnToken::Keyword(k) => stack.push(k.clone()),
            RpnToken::Operator(op) => {
                if op == "NOT" {
                    let a = stack
                        .pop()
                        .ok_or_else(|| CoreError::SyntaxError("dangling operator".to_string()))?;
                    stack.push(format!("(NOT {a})"));
                } else if stack.len() >= 2 {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    stack.push(format!("({a} {op} {b})"));
                } else {
                    let a = stack
                        .pop()
                        .ok_or_else(|| CoreError::SyntaxError("dangling operator".to_string()))?;
                    stack.push(format!("({op}{a})"));
                }
            }
            RpnToken::FunctionArgs(args) => pending_args = Some(args),
            RpnToken::Function(name) => {
                let args = pending_args
                    .take()
                    .ok_or_else(|| CoreError::SyntaxError(format!("'{name}' missing arguments")))?;
                let mut parts = Vec::with_capacity(args.len());
                for arg in args {
                    parts.push(rpn_to_infix_string(arg)?);
                }
                stack.push(format!("{name}({})", parts.join(", ")));
            }
        }
    }

    if stack.len() != 1 {
        return Err(CoreError::SyntaxError(
            "program did not reduce to a single expression".to_string(),
        ));
    }
    Ok(stack.pop().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tdql::tokenizer::tokenize;

    fn no_functions() -> HashSet<String> {
        HashSet::new()
    }

    fn sum_function() -> HashSet<String> {
        ["SUM".to_string()].into_iter().collect()
    }

    #[test]
    fn compiles_simple_arithmetic_to_rpn() {
        let tokens = tokenize("a + 2 * 3").unwrap();
        let rpn = compile_expression(&tokens, &no_functions()).unwrap();
        assert_eq!(
            rpn,
            vec![
                RpnToken::Keyword("a".to_string()),
                RpnToken::Number(2.0),
                RpnToken::Number(3.0),
                RpnToken::Operator("*".to_string()),
                RpnToken::Operator("+".to_string()),
            ]
        );
    }

    #[test]
    fn parentheses_override_precedence() {
        let tokens = tokenize("(a + 2) * 3").unwrap();
        let rpn = compile_expression(&tokens, &no_functions()).unwrap();
        assert_eq!(
            rpn,
            vec![
                RpnToken::Keyword("a".to_string()),
                RpnToken::Number(2.0),
                RpnToken::Operator("+".to_string()),
                RpnToken::Number(3.0),
                RpnToken::Operator("*".to_string()),
            ]
        );
    }

    #[test]
    fn compiles_function_call_with_multiple_args() {
        let tokens = tokenize("sum(a, b + 1)").unwrap();
        let rpn = compile_expression(&tokens, &sum_function()).unwrap();
        assert_eq!(
            rpn,
            vec![
                RpnToken::FunctionArgs(vec![
                    vec![RpnToken::Keyword("a".to_string())],
                    vec![
                        RpnToken::Keyword("b".to_string()),
                        RpnToken::Number(1.0),
                        RpnToken::Operator("+".to_string()),
                    ],
                ]),
                RpnToken::Function("sum".to_string()),
            ]
        );
    }

    #[test]
    fn nested_function_calls_compile() {
        let tokens = tokenize("sum(sum(a))").unwrap();
        let rpn = compile_expression(&tokens, &sum_function()).unwrap();
        assert_eq!(
            rpn,
            vec![
                RpnToken::FunctionArgs(vec![vec![
                    RpnToken::FunctionArgs(vec![vec![RpnToken::Keyword("a".to_string())]]),
                    RpnToken::Function("sum".to_string()),
                ]]),
                RpnToken::Function("sum".to_string()),
            ]
        );
    }

    #[test]
    fn unbalanced_parens_is_a_syntax_error() {
        let tokens = tokenize("(a + 2").unwrap();
        let err = compile_expression(&tokens, &no_functions()).unwrap_err();
        assert!(matches!(err, CoreError::SyntaxError(_)));
    }

    #[test]
    fn evaluates_arithmetic_against_context() {
        let tokens = tokenize("a + 2 * 3").unwrap();
        let rpn = compile_expression(&tokens, &no_functions()).unwrap();
        let mut ctx = MapContext::new(HashMap::from([("a".to_string(), Value::Number(4.0))]));
        let mut result = rpn_evaluate(&rpn, &mut ctx).unwrap();
        assert_eq!(result.pop(), Some(Value::Number(10.0)));
    }

    #[test]
    fn where_predicate_rejects_on_truthy_result() {
        let tokens = tokenize("a > 10").unwrap();
        let rpn = compile_expression(&tokens, &no_functions()).unwrap();
        let mut ctx = MapContext::new(HashMap::from([("a".to_string(), Value::Number(20.0))]));
        assert!(evaluate_predicate(&rpn, &mut ctx).unwrap());

        let mut ctx = MapContext::new(HashMap::from([("a".to_string(), Value::Number(5.0))]));
        assert!(!evaluate_predicate(&rpn, &mut ctx).unwrap());
    }

    #[test]
    fn unresolved_keyword_is_late_bound_as_its_own_name() {
        let tokens = tokenize("missing_field").unwrap();
        let rpn = compile_expression(&tokens, &no_functions()).unwrap();
        let mut ctx = MapContext::new(HashMap::new());
        let mut result = rpn_evaluate(&rpn, &mut ctx).unwrap();
        assert_eq!(result.pop(), Some(Value::Str("missing_field".to_string())));
    }

    #[test]
    fn roundtrip_through_infix_string_preserves_rpn_program() {
        let tokens = tokenize("(a + 2) * (b - 1)").unwrap();
        let rpn = compile_expression(&tokens, &no_functions()).unwrap();
        let infix = rpn_to_infix_string(&rpn).unwrap();
        let reparsed_tokens = tokenize(&infix).unwrap();
        let reparsed_rpn = compile_expression(&reparsed_tokens, &no_functions()).unwrap();
        assert_eq!(rpn, reparsed_rpn);
    }

    #[test]
    fn roundtrip_preserves_function_calls() {
        let tokens = tokenize("sum(a, b) + 1").unwrap();
        let rpn = compile_expression(&tokens, &sum_function()).unwrap();
        let infix = rpn_to_infix_string(&rpn).unwrap();
        let reparsed_tokens = tokenize(&infix).unwrap();
        let reparsed_rpn = compile_expression(&reparsed_tokens, &sum_function()).unwrap();
        assert_eq!(rpn, reparsed_rpn);
    }
}
