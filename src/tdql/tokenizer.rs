//! Lexical scanner for TDQL (C6).
//!
//! Grounded on `original_source/skvoz/aggregation/tdql/tokenizer.py`'s
//! `tokenize`/`_sdata_to_token` state machine. Parenthesis/comma tokens
//! are preserved in the raw token stream (unlike the RPN program, which
//! only ever contains value/operator/function tokens) since both the
//! expression compiler (C7) and the statement parser (C9) consume them.

use crate::error::{CoreError, CoreResult};

/// One lexical token. `Number` collapses the original's int-vs-float
/// distinction into `f64`; nothing downstream depends on integer-vs-float
/// identity, only on the numeric value.
#[derive(Debug, Clone, PartialEq)]
pub enum RawToken {
    Number(f64),
    Str(String),
    Boolean(bool),
    Keyword(String),
    Operator(String),
    LParen,
    RParen,
    Comma,
}

fn sdata_to_token(sdata: &str) -> Option<RawToken> {
    if sdata.is_empty() {
        return None;
    }
    if let Ok(n) = sdata.parse::<i64>() {
        return Some(RawToken::Number(n as f64));
    }
    if let Ok(n) = sdata.parse::<f64>() {
        return Some(RawToken::Number(n));
    }

    match sdata.to_uppercase().as_str() {
        "TRUE" => Some(RawToken::Boolean(true)),
        "FALSE" => Some(RawToken::Boolean(false)),
        upper @ ("AND" | "OR" | "NOT") => Some(RawToken::Operator(upper.to_string())),
        _ => Some(RawToken::Keyword(sdata.to_string())),
    }
}

/// Scans a TDQL query string into a flat token stream.
pub fn tokenize(query: &str) -> CoreResult<Vec<RawToken>> {
    let chars: Vec<char> = query.chars().collect();
    let mut i = 0usize;
    let mut tokens = Vec::new();
    let mut sdata = String::new();
    let mut quoted: Option<char> = None;

    macro_rules! flush {
        () => {
            if let Some(tok) = sdata_to_token(&sdata) {
                tokens.push(tok);
            }
            sdata.clear();
        };
    }

    while i < chars.len() {
        let c = chars[i];
        i += 1;

        if let Some(q) = quoted {
            if c == q {
                tokens.push(RawToken::Str(std::mem::take(&mut sdata)));
                quoted = None;
            } else if c == '\\' {
                if i >= chars.len() {
                    break;
                }
                sdata.push(chars[i]);
                i += 1;
            } else {
                sdata.push(c);
            }
            continue;
        }

        if c == '"' || c == '\'' {
            quoted = Some(c);
            continue;
        }

        match c {
            ' ' | '\t' | '\r' | '\n' => {
                flush!();
            }
            '(' => {
                flush!();
                tokens.push(RawToken::LParen);
            }
            ')' => {
                flush!();
                tokens.push(RawToken::RParen);
            }
            ',' => {
                flush!();
                tokens.push(RawToken::Comma);
            }
            '+' | '-' | '*' | '/' | '%' => {
                flush!();
                tokens.push(RawToken::Operator(c.to_string()));
            }
            '>' | '<' | '=' | '!' => {
                flush!();
                let nc = chars.get(i).copied();
                match nc {
                    Some('=') => {
                        tokens.push(RawToken::Operator(format!("{c}=")));
                        i += 1;
                    }
                    Some(n) if (c == '<' && n == '<') || (c == '>' && n == '>') => {
                        tokens.push(RawToken::Operator(format!("{c}{n}")));
                        i += 1;
                    }
                    _ => {
                        let op = if c == '=' || c == '!' {
                            format!("{c}=")
                        } else {
                            c.to_string()
                        };
                        tokens.push(RawToken::Operator(op));
                        if let Some(n) = nc {
                            if !n.is_whitespace() {
                                sdata.push(n);
                                i += 1;
                            }
                        }
                    }
                }
            }
            other => sdata.push(other),
        }
    }

    if quoted.is_some() {
        return Err(CoreError::LexError("missing end quote".to_string()));
    }

    flush!();
    Ok(tokens)
}
