//! Guard expression evaluation.
//!
//! Guards are boolean expressions over the record bound to the interpreter,
//! which is reachable through the `o` symbol:
//!
//! - `o.field` - attribute truthiness
//! - `o.field.nested` - nested access into a JSON attribute
//! - `o.field == value` / `o.field != value` - strings, numbers, booleans, null
//! - `o.field > value`, `>=`, `<`, `<=` - numeric comparison
//! - `!expr`, `expr && expr`, `expr || expr` - `&&` binds tighter than `||`
//! - `(expr)` - grouping
//!
//! Examples:
//! - `o.amount_total > 1000 && !o.approved`
//! - `o.state == "draft" || o.partner.blocked`

use crate::error::DefinitionError;
use crate::record::{FieldSource, CONTEXT_SYMBOL};
use serde_json::Value;

/// A parsed guard expression.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardExpr {
    /// Field is truthy.
    Truthy(String),
    /// Equality comparison.
    Eq(String, Value),
    /// Inequality comparison.
    Ne(String, Value),
    /// Greater than.
    Gt(String, f64),
    /// Greater or equal.
    Ge(String, f64),
    /// Less than.
    Lt(String, f64),
    /// Less or equal.
    Le(String, f64),
    /// Logical AND.
    And(Box<GuardExpr>, Box<GuardExpr>),
    /// Logical OR.
    Or(Box<GuardExpr>, Box<GuardExpr>),
    /// Logical NOT.
    Not(Box<GuardExpr>),
}

impl GuardExpr {
    /// Parses a guard expression from a string.
    pub fn parse(s: &str) -> Result<Self, DefinitionError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(invalid("empty guard expression"));
        }

        let mut parser = Parser::new(s);
        let expr = parser.parse_expr()?;
        parser.skip_whitespace();
        if parser.pos < s.len() {
            return Err(invalid(format!(
                "unexpected input at offset {}: '{}'",
                parser.pos,
                &s[parser.pos..]
            )));
        }
        Ok(expr)
    }

    /// Evaluates the guard against a field source.
    pub fn evaluate<F: FieldSource + ?Sized>(&self, ctx: &F) -> bool {
        match self {
            GuardExpr::Truthy(field) => is_truthy(&ctx.field(field)),
            GuardExpr::Eq(field, expected) => values_equal(&ctx.field(field), expected),
            GuardExpr::Ne(field, expected) => !values_equal(&ctx.field(field), expected),
            GuardExpr::Gt(field, expected) => compare(ctx, field, |v| v > *expected),
            GuardExpr::Ge(field, expected) => compare(ctx, field, |v| v >= *expected),
            GuardExpr::Lt(field, expected) => compare(ctx, field, |v| v < *expected),
            GuardExpr::Le(field, expected) => compare(ctx, field, |v| v <= *expected),
            GuardExpr::And(left, right) => left.evaluate(ctx) && right.evaluate(ctx),
            GuardExpr::Or(left, right) => left.evaluate(ctx) || right.evaluate(ctx),
            GuardExpr::Not(inner) => !inner.evaluate(ctx),
        }
    }
}

fn invalid(reason: impl Into<String>) -> DefinitionError {
    DefinitionError::InvalidGuard {
        reason: reason.into(),
    }
}

fn compare<F: FieldSource + ?Sized>(ctx: &F, field: &str, op: impl Fn(f64) -> bool) -> bool {
    match ctx.field(field) {
        Value::Number(n) => n.as_f64().map(op).unwrap_or(false),
        _ => false,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(a, b)| (a - b).abs() < f64::EPSILON)
            .unwrap_or(false),
        (Value::String(a), Value::String(b)) => a == b,
        _ => false,
    }
}

/// Recursive descent parser for guard expressions.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_expr(&mut self) -> Result<GuardExpr, DefinitionError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<GuardExpr, DefinitionError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            self.skip_whitespace();
            let right = self.parse_and()?;
            left = GuardExpr::Or(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<GuardExpr, DefinitionError> {
        let mut left = self.parse_unary()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            self.skip_whitespace();
            let right = self.parse_unary()?;
            left = GuardExpr::And(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<GuardExpr, DefinitionError> {
        self.skip_whitespace();

        if self.peek_char() == Some('!') && !self.peek_str("!=") {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(GuardExpr::Not(Box::new(inner)));
        }

        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<GuardExpr, DefinitionError> {
        self.skip_whitespace();

        if self.peek_char() == Some('(') {
            self.pos += 1;
            let expr = self.parse_expr()?;
            self.skip_whitespace();
            if self.peek_char() != Some(')') {
                return Err(invalid("expected ')'"));
            }
            self.pos += 1;
            return Ok(expr);
        }

        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<GuardExpr, DefinitionError> {
        let field = self.parse_field()?;
        self.skip_whitespace();

        if self.eat("==") {
            return Ok(GuardExpr::Eq(field, self.parse_value()?));
        }
        if self.eat("!=") {
            return Ok(GuardExpr::Ne(field, self.parse_value()?));
        }
        if self.eat(">=") {
            return Ok(GuardExpr::Ge(field, self.parse_number()?));
        }
        if self.eat("<=") {
            return Ok(GuardExpr::Le(field, self.parse_number()?));
        }
        if self.eat(">") {
            return Ok(GuardExpr::Gt(field, self.parse_number()?));
        }
        if self.eat("<") {
            return Ok(GuardExpr::Lt(field, self.parse_number()?));
        }

        Ok(GuardExpr::Truthy(field))
    }

    fn parse_field(&mut self) -> Result<String, DefinitionError> {
        let prefix = format!("{}.", CONTEXT_SYMBOL);
        if !self.peek_str(&prefix) {
            return Err(invalid(format!("field must start with '{}'", prefix)));
        }
        self.pos += prefix.len();

        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }

        let field = &self.input[start..self.pos];
        if field.is_empty() || field.split('.').any(str::is_empty) {
            return Err(invalid(format!("invalid field name '{}'", field)));
        }

        Ok(field.to_string())
    }

    fn parse_value(&mut self) -> Result<Value, DefinitionError> {
        self.skip_whitespace();

        if self.eat("true") {
            return Ok(Value::Bool(true));
        }
        if self.eat("false") {
            return Ok(Value::Bool(false));
        }
        if self.eat("null") {
            return Ok(Value::Null);
        }
        if self.peek_char() == Some('"') {
            return self.parse_string_value();
        }

        let num = self.parse_number()?;
        serde_json::Number::from_f64(num)
            .map(Value::Number)
            .ok_or_else(|| invalid(format!("number out of range: {}", num)))
    }

    fn parse_string_value(&mut self) -> Result<Value, DefinitionError> {
        // Opening quote already peeked.
        self.pos += 1;

        let mut out = String::new();
        let mut chars = self.input[self.pos..].char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '"' => {
                    self.pos += i + 1;
                    return Ok(Value::String(out));
                }
                '\\' => match chars.next() {
                    Some((_, escaped)) => out.push(escaped),
                    None => break,
                },
                _ => out.push(c),
            }
        }

        Err(invalid("unterminated string"))
    }

    fn parse_number(&mut self) -> Result<f64, DefinitionError> {
        self.skip_whitespace();
        let start = self.pos;

        if self.peek_char() == Some('-') {
            self.pos += 1;
        }
        self.skip_digits();
        if self.peek_char() == Some('.') {
            self.pos += 1;
            self.skip_digits();
        }

        let num_str = &self.input[start..self.pos];
        num_str
            .parse::<f64>()
            .map_err(|_| invalid(format!("invalid number: '{}'", num_str)))
    }

    fn skip_digits(&mut self) {
        while matches!(self.peek_char(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn eat(&mut self, s: &str) -> bool {
        if self.peek_str(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthy_check() {
        let guard = GuardExpr::parse("o.approved").unwrap();
        assert!(guard.evaluate(&json!({"approved": true})));
        assert!(!guard.evaluate(&json!({"approved": false})));
        assert!(!guard.evaluate(&json!({"approved": null})));
        assert!(!guard.evaluate(&json!({})));
    }

    #[test]
    fn test_equality() {
        let guard = GuardExpr::parse("o.state == \"draft\"").unwrap();
        assert!(guard.evaluate(&json!({"state": "draft"})));
        assert!(!guard.evaluate(&json!({"state": "done"})));
    }

    #[test]
    fn test_numeric_comparison() {
        let guard = GuardExpr::parse("o.amount_total > 1000").unwrap();
        assert!(guard.evaluate(&json!({"amount_total": 1500})));
        assert!(!guard.evaluate(&json!({"amount_total": 1000})));

        let guard = GuardExpr::parse("o.amount_total >= 1000").unwrap();
        assert!(guard.evaluate(&json!({"amount_total": 1000})));

        let guard = GuardExpr::parse("o.temp > -10.5").unwrap();
        assert!(guard.evaluate(&json!({"temp": -3})));
        assert!(!guard.evaluate(&json!({"temp": -11})));
    }

    #[test]
    fn test_logical_precedence() {
        let guard = GuardExpr::parse("o.a && o.b || o.c").unwrap();
        assert!(guard.evaluate(&json!({"a": true, "b": true, "c": false})));
        assert!(guard.evaluate(&json!({"a": false, "b": false, "c": true})));
        assert!(!guard.evaluate(&json!({"a": true, "b": false, "c": false})));

        let guard = GuardExpr::parse("(o.a || o.b) && o.c").unwrap();
        assert!(!guard.evaluate(&json!({"a": true, "b": true, "c": false})));
        assert!(guard.evaluate(&json!({"a": false, "b": true, "c": true})));
    }

    #[test]
    fn test_negation() {
        let guard = GuardExpr::parse("!o.blocked").unwrap();
        assert!(guard.evaluate(&json!({"blocked": false})));
        assert!(!guard.evaluate(&json!({"blocked": true})));

        let guard = GuardExpr::parse("!!o.blocked").unwrap();
        assert!(guard.evaluate(&json!({"blocked": true})));

        let guard = GuardExpr::parse("!(o.amount > 100)").unwrap();
        assert!(guard.evaluate(&json!({"amount": 50})));
    }

    #[test]
    fn test_inequality_and_escapes() {
        let guard = GuardExpr::parse("o.note != \"say \\\"hi\\\"\"").unwrap();
        assert!(!guard.evaluate(&json!({"note": "say \"hi\""})));
        assert!(guard.evaluate(&json!({"note": "other"})));
    }

    #[test]
    fn test_nested_field() {
        let guard = GuardExpr::parse("o.partner.country.code == \"BE\"").unwrap();
        assert!(guard.evaluate(&json!({"partner": {"country": {"code": "BE"}}})));
        assert!(!guard.evaluate(&json!({"partner": {}})));
    }

    #[test]
    fn test_non_numeric_comparison_is_false() {
        let guard = GuardExpr::parse("o.value > 10").unwrap();
        assert!(!guard.evaluate(&json!({"value": "not a number"})));
        assert!(!guard.evaluate(&json!({"value": null})));
    }

    #[test]
    fn test_parse_errors() {
        assert!(GuardExpr::parse("").is_err());
        assert!(GuardExpr::parse("   ").is_err());
        assert!(GuardExpr::parse("ctx.amount").is_err());
        assert!(GuardExpr::parse("o.").is_err());
        assert!(GuardExpr::parse("o.a..b").is_err());
        assert!(GuardExpr::parse("(o.a && o.b").is_err());
        assert!(GuardExpr::parse("o.name == \"unclosed").is_err());
        assert!(GuardExpr::parse("o.value > abc").is_err());
        assert!(GuardExpr::parse("o.a o.b").is_err());
    }
}
