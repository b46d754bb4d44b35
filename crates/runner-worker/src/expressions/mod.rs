// Workflow expression evaluation.
//
// `ExpressionEvaluator` is the seam the engine calls for step conditions,
// continue-on-error values and `${{ }}` substitution. `BasicExpressionEvaluator`
// is a small recursive-descent implementation over `serde_json::Value`
// contexts: literals, context paths, `!`, `&&`, `||`, comparisons, grouping,
// and the functions success, failure, always, cancelled, contains,
// startsWith, endsWith, format, join, toJSON and fromJSON.

use anyhow::Result;
use serde_json::Value;
use std::cmp::Ordering;

use runner_common::TaskResult;

const STATUS_FUNCTIONS: [&str; 4] = ["success", "failure", "always", "cancelled"];

/// Job state the status functions read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionStatus {
    /// Current job result; `None` until a step reports something.
    pub result: Option<TaskResult>,
    pub cancelled: bool,
}

impl ExecutionStatus {
    pub fn new(result: Option<TaskResult>, cancelled: bool) -> Self {
        Self { result, cancelled }
    }

    fn success(&self) -> bool {
        !self.cancelled
            && matches!(
                self.result,
                None | Some(TaskResult::Succeeded) | Some(TaskResult::SucceededWithIssues)
            )
    }

    fn failure(&self) -> bool {
        !self.cancelled && self.result == Some(TaskResult::Failed)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("Unexpected symbol: '{symbol}'. Located at position {position} within expression: {expression}")]
    UnexpectedSymbol {
        symbol: String,
        position: usize,
        expression: String,
    },

    #[error("Unexpected end of expression: {0}")]
    UnexpectedEnd(String),

    #[error("Unrecognized function: '{0}'")]
    UnknownFunction(String),

    #[error("Function '{name}' expects {expected} argument(s) but received {actual}")]
    ArgumentCount {
        name: String,
        expected: String,
        actual: usize,
    },

    #[error("The template is not valid. {0}")]
    InvalidJson(String),

    #[error("The format string is invalid: {0}")]
    InvalidFormat(String),
}

pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate a bare expression (no `${{ }}` wrapper) to a value.
    fn evaluate(&self, expression: &str, values: &Value, status: &ExecutionStatus) -> Result<Value>;

    /// Evaluate an `if:` condition. Empty means `success()`, and a condition
    /// that calls no status function is implicitly `success() && (...)`.
    fn evaluate_condition(
        &self,
        condition: Option<&str>,
        values: &Value,
        status: &ExecutionStatus,
    ) -> Result<bool> {
        let expression = strip_wrapper(condition.unwrap_or_default());
        let expression = if expression.is_empty() {
            "success()".to_string()
        } else if references_status_function(expression) {
            expression.to_string()
        } else {
            format!("success() && ({expression})")
        };
        Ok(is_truthy(&self.evaluate(&expression, values, status)?))
    }

    /// Replace every `${{ expr }}` in `text` with its string value.
    fn evaluate_template(&self, text: &str, values: &Value, status: &ExecutionStatus) -> Result<String> {
        let mut result = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find("${{") {
            let Some(len) = rest[start + 3..].find("}}") else {
                break;
            };
            result.push_str(&rest[..start]);
            let value = self.evaluate(rest[start + 3..start + 3 + len].trim(), values, status)?;
            result.push_str(&to_display_string(&value));
            rest = &rest[start + 3 + len + 2..];
        }
        result.push_str(rest);
        Ok(result)
    }

    /// A boolean setting such as `continue-on-error`, either a literal or an
    /// expression.
    fn evaluate_bool(&self, text: &str, values: &Value, status: &ExecutionStatus) -> Result<bool> {
        let trimmed = text.trim();
        if trimmed.starts_with("${{") {
            return Ok(is_truthy(&self.evaluate(strip_wrapper(trimmed), values, status)?));
        }
        Ok(is_truthy(&self.evaluate(trimmed, values, status)?))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BasicExpressionEvaluator;

impl ExpressionEvaluator for BasicExpressionEvaluator {
    fn evaluate(&self, expression: &str, values: &Value, status: &ExecutionStatus) -> Result<Value> {
        let tokens = tokenize(expression)?;
        let mut parser = Parser {
            expression,
            tokens,
            position: 0,
            values,
            status,
        };
        let value = parser.parse_or()?;
        if let Some((token, position)) = parser.tokens.get(parser.position) {
            return Err(parser.unexpected(token, *position).into());
        }
        Ok(value)
    }
}

/// Strip an outer `${{ }}` wrapper.
pub fn strip_wrapper(text: &str) -> &str {
    let trimmed = text.trim();
    match trimmed.strip_prefix("${{").and_then(|t| t.strip_suffix("}}")) {
        Some(inner) => inner.trim(),
        None => trimmed,
    }
}

fn references_status_function(expression: &str) -> bool {
    let Ok(tokens) = tokenize(expression) else {
        return false;
    };
    tokens.windows(2).any(|pair| match (&pair[0].0, &pair[1].0) {
        (Token::Ident(name), Token::LParen) => STATUS_FUNCTIONS
            .iter()
            .any(|f| f.eq_ignore_ascii_case(name)),
        _ => false,
    })
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_default(),
    }
}

fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) if s.trim().is_empty() => 0.0,
        Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

fn loose_compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.to_lowercase().cmp(&b.to_lowercase())),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Array(_), _) | (Value::Object(_), _) | (_, Value::Array(_)) | (_, Value::Object(_)) => {
            (left == right).then_some(Ordering::Equal)
        }
        _ => to_number(left).partial_cmp(&to_number(right)),
    }
}

fn loose_equals(left: &Value, right: &Value) -> bool {
    loose_compare(left, right) == Some(Ordering::Equal)
}

fn get_case_insensitive<'v>(value: &'v Value, key: &str) -> Option<&'v Value> {
    let map = value.as_object()?;
    map.get(key).or_else(|| {
        map.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    })
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Num(f64),
    Ident(String),
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Str(s) => write!(f, "'{s}'"),
            Token::Num(n) => write!(f, "{n}"),
            Token::Ident(s) => f.write_str(s),
            Token::Dot => f.write_str("."),
            Token::Comma => f.write_str(","),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::LBracket => f.write_str("["),
            Token::RBracket => f.write_str("]"),
            Token::Not => f.write_str("!"),
            Token::And => f.write_str("&&"),
            Token::Or => f.write_str("||"),
            Token::Eq => f.write_str("=="),
            Token::Ne => f.write_str("!="),
            Token::Lt => f.write_str("<"),
            Token::Le => f.write_str("<="),
            Token::Gt => f.write_str(">"),
            Token::Ge => f.write_str(">="),
        }
    }
}

fn tokenize(expression: &str) -> Result<Vec<(Token, usize)>, ExpressionError> {
    let chars: Vec<char> = expression.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        let follows = chars.get(i + 1).copied();

        let token = match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '\'' => {
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ExpressionError::UnexpectedEnd(expression.to_string())),
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            text.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            text.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push((Token::Str(text), start));
                continue;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = parse_number(&text).ok_or_else(|| ExpressionError::UnexpectedSymbol {
                    symbol: text.clone(),
                    position: start + 1,
                    expression: expression.to_string(),
                })?;
                tokens.push((Token::Num(number), start));
                continue;
            }
            c if c.is_alphabetic() || c == '_' => {
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '-') {
                    i += 1;
                }
                tokens.push((Token::Ident(chars[start..i].iter().collect()), start));
                continue;
            }
            '.' => Token::Dot,
            ',' => Token::Comma,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '!' if follows == Some('=') => Token::Ne,
            '!' => Token::Not,
            '=' if follows == Some('=') => Token::Eq,
            '&' if follows == Some('&') => Token::And,
            '|' if follows == Some('|') => Token::Or,
            '<' if follows == Some('=') => Token::Le,
            '<' => Token::Lt,
            '>' if follows == Some('=') => Token::Ge,
            '>' => Token::Gt,
            other => {
                return Err(ExpressionError::UnexpectedSymbol {
                    symbol: other.to_string(),
                    position: start + 1,
                    expression: expression.to_string(),
                })
            }
        };
        i += match token {
            Token::Ne | Token::Eq | Token::And | Token::Or | Token::Le | Token::Ge => 2,
            _ => 1,
        };
        tokens.push((token, start));
    }

    Ok(tokens)
}

fn parse_number(text: &str) -> Option<f64> {
    if let Some(hex) = text.strip_prefix("0x") {
        return i64::from_str_radix(hex, 16).ok().map(|n| n as f64);
    }
    text.parse().ok()
}

// ---------------------------------------------------------------------------
// Parser / evaluator
// ---------------------------------------------------------------------------

struct Parser<'a> {
    expression: &'a str,
    tokens: Vec<(Token, usize)>,
    position: usize,
    values: &'a Value,
    status: &'a ExecutionStatus,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position).map(|(t, _)| t)
    }

    fn next(&mut self) -> Result<(Token, usize), ExpressionError> {
        let token = self
            .tokens
            .get(self.position)
            .cloned()
            .ok_or_else(|| ExpressionError::UnexpectedEnd(self.expression.to_string()))?;
        self.position += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExpressionError> {
        let (token, position) = self.next()?;
        if token == expected {
            Ok(())
        } else {
            Err(self.unexpected(&token, position))
        }
    }

    fn unexpected(&self, token: &Token, position: usize) -> ExpressionError {
        ExpressionError::UnexpectedSymbol {
            symbol: token.to_string(),
            position: position + 1,
            expression: self.expression.to_string(),
        }
    }

    fn parse_or(&mut self) -> Result<Value, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.position += 1;
            let right = self.parse_and()?;
            if !is_truthy(&left) {
                left = right;
            }
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Value, ExpressionError> {
        let mut left = self.parse_comparison()?;
        while self.peek() == Some(&Token::And) {
            self.position += 1;
            let right = self.parse_comparison()?;
            if is_truthy(&left) {
                left = right;
            }
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Value, ExpressionError> {
        let left = self.parse_unary()?;
        let op = match self.peek() {
            Some(op @ (Token::Eq | Token::Ne | Token::Lt | Token::Le | Token::Gt | Token::Ge)) => op.clone(),
            _ => return Ok(left),
        };
        self.position += 1;
        let right = self.parse_unary()?;
        let ordering = loose_compare(&left, &right);
        let result = match op {
            Token::Eq => loose_equals(&left, &right),
            Token::Ne => !loose_equals(&left, &right),
            Token::Lt => ordering == Some(Ordering::Less),
            Token::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
            Token::Gt => ordering == Some(Ordering::Greater),
            _ => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        };
        Ok(Value::Bool(result))
    }

    fn parse_unary(&mut self) -> Result<Value, ExpressionError> {
        if self.peek() == Some(&Token::Not) {
            self.position += 1;
            let value = self.parse_unary()?;
            return Ok(Value::Bool(!is_truthy(&value)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Value, ExpressionError> {
        let (token, position) = self.next()?;
        let value = match token {
            Token::Str(s) => Value::String(s),
            Token::Num(n) => serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null),
            Token::LParen => {
                let value = self.parse_or()?;
                self.expect(Token::RParen)?;
                value
            }
            Token::Ident(name) if self.peek() == Some(&Token::LParen) => {
                self.position += 1;
                let args = self.parse_arguments()?;
                self.call(&name, args)?
            }
            Token::Ident(name) => match name.as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                "null" => Value::Null,
                _ => get_case_insensitive(self.values, &name).cloned().unwrap_or(Value::Null),
            },
            other => return Err(self.unexpected(&other, position)),
        };
        self.parse_accessors(value)
    }

    fn parse_accessors(&mut self, mut value: Value) -> Result<Value, ExpressionError> {
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.position += 1;
                    let (token, position) = self.next()?;
                    let Token::Ident(key) = token else {
                        return Err(self.unexpected(&token, position));
                    };
                    value = get_case_insensitive(&value, &key).cloned().unwrap_or(Value::Null);
                }
                Some(Token::LBracket) => {
                    self.position += 1;
                    let index = self.parse_or()?;
                    self.expect(Token::RBracket)?;
                    value = match (&value, &index) {
                        (Value::Array(items), _) => {
                            let i = to_number(&index);
                            if i >= 0.0 && i.fract() == 0.0 {
                                items.get(i as usize).cloned().unwrap_or(Value::Null)
                            } else {
                                Value::Null
                            }
                        }
                        (Value::Object(_), _) => get_case_insensitive(&value, &to_display_string(&index))
                            .cloned()
                            .unwrap_or(Value::Null),
                        _ => Value::Null,
                    };
                }
                _ => return Ok(value),
            }
        }
    }

    fn parse_arguments(&mut self) -> Result<Vec<Value>, ExpressionError> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.position += 1;
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            let (token, position) = self.next()?;
            match token {
                Token::Comma => continue,
                Token::RParen => return Ok(args),
                other => return Err(self.unexpected(&other, position)),
            }
        }
    }

    fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, ExpressionError> {
        let lower = name.to_lowercase();
        let arity = |min: usize, max: usize| {
            if args.len() < min || args.len() > max {
                Err(ExpressionError::ArgumentCount {
                    name: name.to_string(),
                    expected: if min == max { min.to_string() } else { format!("{min}-{max}") },
                    actual: args.len(),
                })
            } else {
                Ok(())
            }
        };

        let value = match lower.as_str() {
            "success" => {
                arity(0, 0)?;
                Value::Bool(self.status.success())
            }
            "failure" => {
                arity(0, 0)?;
                Value::Bool(self.status.failure())
            }
            "always" => {
                arity(0, 0)?;
                Value::Bool(true)
            }
            "cancelled" => {
                arity(0, 0)?;
                Value::Bool(self.status.cancelled)
            }
            "contains" => {
                arity(2, 2)?;
                let found = match &args[0] {
                    Value::Array(items) => items.iter().any(|item| loose_equals(item, &args[1])),
                    haystack => to_display_string(haystack)
                        .to_lowercase()
                        .contains(&to_display_string(&args[1]).to_lowercase()),
                };
                Value::Bool(found)
            }
            "startswith" => {
                arity(2, 2)?;
                Value::Bool(
                    to_display_string(&args[0])
                        .to_lowercase()
                        .starts_with(&to_display_string(&args[1]).to_lowercase()),
                )
            }
            "endswith" => {
                arity(2, 2)?;
                Value::Bool(
                    to_display_string(&args[0])
                        .to_lowercase()
                        .ends_with(&to_display_string(&args[1]).to_lowercase()),
                )
            }
            "format" => {
                arity(1, usize::MAX)?;
                Value::String(format_string(&to_display_string(&args[0]), &args[1..])?)
            }
            "join" => {
                arity(1, 2)?;
                let separator = args.get(1).map(to_display_string).unwrap_or_else(|| ",".to_string());
                match &args[0] {
                    Value::Array(items) => Value::String(
                        items.iter().map(to_display_string).collect::<Vec<_>>().join(&separator),
                    ),
                    other => Value::String(to_display_string(other)),
                }
            }
            "tojson" => {
                arity(1, 1)?;
                Value::String(serde_json::to_string_pretty(&args[0]).unwrap_or_default())
            }
            "fromjson" => {
                arity(1, 1)?;
                let text = to_display_string(&args[0]);
                serde_json::from_str(&text).map_err(|e| ExpressionError::InvalidJson(e.to_string()))?
            }
            _ => return Err(ExpressionError::UnknownFunction(name.to_string())),
        };
        Ok(value)
    }
}

/// `format('{0} and {1}', a, b)`; `{{` and `}}` escape braces.
fn format_string(format: &str, args: &[Value]) -> Result<String, ExpressionError> {
    let mut out = String::with_capacity(format.len());
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut index = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(d) if d.is_ascii_digit() => index.push(d),
                        _ => return Err(ExpressionError::InvalidFormat(format.to_string())),
                    }
                }
                let arg = index
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| args.get(i))
                    .ok_or_else(|| ExpressionError::InvalidFormat(format.to_string()))?;
                out.push_str(&to_display_string(arg));
            }
            '}' => return Err(ExpressionError::InvalidFormat(format.to_string())),
            other => out.push(other),
        }
    }
    Ok(out)
}
