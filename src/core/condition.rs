//! KS-003: Sandboxed condition evaluator for `when` guards.
//!
//! Expressions are parsed into a small AST and evaluated against a JSON
//! variable context. Nothing is ever executed: the grammar only supports
//! literals, property access, negation, comparison, and boolean logic.
//!
//! ```text
//! expr       := or
//! or         := and ( "||" and )*
//! and        := equality ( "&&" equality )*
//! equality   := comparison ( ("==" | "!=") comparison )*
//! comparison := unary ( ("<" | "<=" | ">" | ">=") unary )*
//! unary      := ("!" | "-") unary | primary
//! primary    := number | string | true | false | null | path | "(" expr ")"
//! path       := ident ( "." ident | "[" expr "]" )*
//! ```
//!
//! Unknown identifiers evaluate to `null`.

use serde_json::Value;
use std::cmp::Ordering;

/// Deepest allowed nesting of parentheses, brackets and unary operators.
pub const MAX_NESTING: usize = 64;

/// Longest accepted expression, in tokens. Binary chains nest the AST too.
pub const MAX_TOKENS: usize = 512;

/// Evaluate an expression to a boolean using JS-like truthiness.
pub fn evaluate(expr: &str, ctx: &Value) -> Result<bool, String> {
    Ok(truthy(&evaluate_value(expr, ctx)?))
}

/// Evaluate an expression to its JSON value.
pub fn evaluate_value(expr: &str, ctx: &Value) -> Result<Value, String> {
    Ok(parse(expr)?.eval(ctx))
}

/// Parse an expression into an AST.
pub fn parse(expr: &str) -> Result<Expr, String> {
    let tokens = tokenize(expr)?;
    if tokens.is_empty() {
        return Err("empty condition".to_string());
    }
    if tokens.len() > MAX_TOKENS {
        return Err(format!("condition longer than {} tokens", MAX_TOKENS));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let ast = parser.or()?;
    if parser.pos < parser.tokens.len() {
        return Err(format!(
            "unexpected token {:?} in condition '{}'",
            parser.tokens[parser.pos], expr
        ));
    }
    Ok(ast)
}

/// JS-like truthiness over JSON values.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// ============================================================================
// Tokens
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
}

const OPERATORS: [&str; 12] = [
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "<", ">", "!", "-",
];

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            '[' => tokens.push(Token::LBracket),
            ']' => tokens.push(Token::RBracket),
            '.' => tokens.push(Token::Dot),
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(format!("unterminated string in '{}'", src)),
                        Some(&'\\') => {
                            if let Some(&next) = chars.get(i + 1) {
                                s.push(next);
                            }
                            i += 2;
                        }
                        Some(&ch) if ch == quote => break,
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{}'", text))?;
                tokens.push(Token::Num(n));
                continue;
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
                continue;
            }
            _ => {
                let rest: String = chars[i..].iter().take(3).collect();
                let op = OPERATORS
                    .iter()
                    .find(|op| rest.starts_with(*op))
                    .ok_or_else(|| format!("unexpected character '{}' in '{}'", c, src))?;
                tokens.push(Token::Op(*op));
                i += op.len();
                continue;
            }
        }
        i += 1;
    }

    Ok(tokens)
}

// ============================================================================
// AST
// ============================================================================

/// Parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Vec<Segment>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

/// One property-access segment.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Field(String),
    Index(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Expr {
    /// Evaluate against a context object.
    pub fn eval(&self, ctx: &Value) -> Value {
        match self {
            Self::Literal(v) => v.clone(),
            Self::Path(segments) => lookup(ctx, segments),
            Self::Not(inner) => Value::Bool(!truthy(&inner.eval(ctx))),
            Self::Neg(inner) => match inner.eval(ctx).as_f64() {
                Some(f) => number(-f),
                None => Value::Null,
            },
            Self::Binary(op, lhs, rhs) => match op {
                BinOp::And => {
                    let l = lhs.eval(ctx);
                    if truthy(&l) {
                        rhs.eval(ctx)
                    } else {
                        l
                    }
                }
                BinOp::Or => {
                    let l = lhs.eval(ctx);
                    if truthy(&l) {
                        l
                    } else {
                        rhs.eval(ctx)
                    }
                }
                BinOp::Eq => Value::Bool(loose_eq(&lhs.eval(ctx), &rhs.eval(ctx))),
                BinOp::Ne => Value::Bool(!loose_eq(&lhs.eval(ctx), &rhs.eval(ctx))),
                BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                    let ord = compare(&lhs.eval(ctx), &rhs.eval(ctx));
                    Value::Bool(match (*op, ord) {
                        (_, None) => false,
                        (BinOp::Lt, Some(o)) => o == Ordering::Less,
                        (BinOp::Le, Some(o)) => o != Ordering::Greater,
                        (BinOp::Gt, Some(o)) => o == Ordering::Greater,
                        (_, Some(o)) => o != Ordering::Less,
                    })
                }
            },
        }
    }
}

fn number(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        return Value::from(f as i64);
    }
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn lookup(ctx: &Value, segments: &[Segment]) -> Value {
    let mut current = ctx.clone();
    for segment in segments {
        current = match segment {
            Segment::Field(name) => match current {
                Value::Object(ref map) => map.get(name).cloned().unwrap_or(Value::Null),
                Value::Array(ref a) if name == "length" => Value::from(a.len()),
                Value::String(ref s) if name == "length" => Value::from(s.chars().count()),
                _ => Value::Null,
            },
            Segment::Index(expr) => match (&current, expr.eval(ctx)) {
                (Value::Array(a), Value::Number(n)) => n
                    .as_u64()
                    .and_then(|i| a.get(i as usize).cloned())
                    .unwrap_or(Value::Null),
                (Value::Object(map), Value::String(key)) => {
                    map.get(&key).cloned().unwrap_or(Value::Null)
                }
                _ => Value::Null,
            },
        };
        if current.is_null() {
            break;
        }
    }
    current
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn nested(&mut self, rule: fn(&mut Self) -> Result<Expr, String>) -> Result<Expr, String> {
        if self.depth >= MAX_NESTING {
            return Err(format!("condition nested deeper than {} levels", MAX_NESTING));
        }
        self.depth += 1;
        let result = rule(self);
        self.depth -= 1;
        result
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat_op(&mut self, ops: &[&str]) -> Option<&'static str> {
        if let Some(Token::Op(op)) = self.peek() {
            if ops.contains(op) {
                let op = *op;
                self.pos += 1;
                return Some(op);
            }
        }
        None
    }

    fn or(&mut self) -> Result<Expr, String> {
        let mut lhs = self.and()?;
        while self.eat_op(&["||"]).is_some() {
            let rhs = self.and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.equality()?;
        while self.eat_op(&["&&"]).is_some() {
            let rhs = self.equality()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, String> {
        let mut lhs = self.comparison()?;
        while let Some(op) = self.eat_op(&["==", "!=", "===", "!=="]) {
            let rhs = self.comparison()?;
            let op = if op.starts_with('!') { BinOp::Ne } else { BinOp::Eq };
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        let mut lhs = self.unary()?;
        while let Some(op) = self.eat_op(&["<", "<=", ">", ">="]) {
            let rhs = self.unary()?;
            let op = match op {
                "<" => BinOp::Lt,
                "<=" => BinOp::Le,
                ">" => BinOp::Gt,
                _ => BinOp::Ge,
            };
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.eat_op(&["!"]).is_some() {
            return Ok(Expr::Not(Box::new(self.nested(Self::unary)?)));
        }
        if self.eat_op(&["-"]).is_some() {
            return Ok(Expr::Neg(Box::new(self.nested(Self::unary)?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, String> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| "unexpected end of condition".to_string())?;
        self.pos += 1;
        match token {
            Token::Num(n) => Ok(Expr::Literal(number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::LParen => {
                let inner = self.nested(Self::or)?;
                match self.peek() {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err("expected ')'".to_string()),
                }
            }
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "undefined" => Ok(Expr::Literal(Value::Null)),
                _ => self.path(name),
            },
            other => Err(format!("unexpected token {:?}", other)),
        }
    }

    fn path(&mut self, head: String) -> Result<Expr, String> {
        let mut segments = vec![Segment::Field(head)];
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.tokens.get(self.pos).cloned() {
                        Some(Token::Ident(field)) => {
                            self.pos += 1;
                            segments.push(Segment::Field(field));
                        }
                        _ => return Err("expected property name after '.'".to_string()),
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.nested(Self::or)?;
                    match self.peek() {
                        Some(Token::RBracket) => self.pos += 1,
                        _ => return Err("expected ']'".to_string()),
                    }
                    segments.push(Segment::Index(Box::new(index)));
                }
                _ => break,
            }
        }
        Ok(Expr::Path(segments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "name": "users",
            "count": 3,
            "withTests": true,
            "framework": { "name": "express", "version": 4 },
            "features": ["auth", "crud"],
            "empty": "",
            "steps": { "build": { "status": "completed" } }
        })
    }

    #[test]
    fn test_ks003_simple_truthiness() {
        assert!(evaluate("withTests", &ctx()).unwrap());
        assert!(!evaluate("empty", &ctx()).unwrap());
        assert!(!evaluate("missing", &ctx()).unwrap());
        assert!(evaluate("!missing", &ctx()).unwrap());
    }

    #[test]
    fn test_ks003_comparisons() {
        assert!(evaluate("count > 2", &ctx()).unwrap());
        assert!(evaluate("count >= 3 && count <= 3", &ctx()).unwrap());
        assert!(!evaluate("count < 3", &ctx()).unwrap());
        assert!(evaluate("name == 'users'", &ctx()).unwrap());
        assert!(evaluate("name === \"users\"", &ctx()).unwrap());
        assert!(evaluate("name != 'orders'", &ctx()).unwrap());
    }

    #[test]
    fn test_ks003_property_access() {
        assert!(evaluate("framework.name == 'express'", &ctx()).unwrap());
        assert!(evaluate("framework.version == 4", &ctx()).unwrap());
        assert!(evaluate("features[1] == 'crud'", &ctx()).unwrap());
        assert!(evaluate("features.length == 2", &ctx()).unwrap());
        assert!(evaluate("framework['name'] == 'express'", &ctx()).unwrap());
        assert!(evaluate("steps.build.status == 'completed'", &ctx()).unwrap());
        assert!(!evaluate("missing.deeply.nested", &ctx()).unwrap());
    }

    #[test]
    fn test_ks003_precedence_and_grouping() {
        assert!(evaluate("false || true && true", &ctx()).unwrap());
        assert!(!evaluate("(false || true) && false", &ctx()).unwrap());
        assert!(evaluate("!(count < 1)", &ctx()).unwrap());
        assert!(evaluate("-count < 0", &ctx()).unwrap());
    }

    #[test]
    fn test_ks003_or_returns_value() {
        let v = evaluate_value("missing || name", &ctx()).unwrap();
        assert_eq!(v, json!("users"));
    }

    #[test]
    fn test_ks003_syntax_errors() {
        assert!(evaluate("count >", &ctx()).is_err());
        assert!(evaluate("(count", &ctx()).is_err());
        assert!(evaluate("'unterminated", &ctx()).is_err());
        assert!(evaluate("", &ctx()).is_err());
        assert!(evaluate("count ; rm", &ctx()).is_err());
        assert!(evaluate("a b", &ctx()).is_err());
    }

    #[test]
    fn test_ks003_no_code_execution_surface() {
        // Function-call syntax is not part of the grammar.
        assert!(evaluate("process.exit(1)", &ctx()).is_err());
    }

    #[test]
    fn test_ks003_mixed_type_comparison_is_false() {
        assert!(!evaluate("name > 3", &ctx()).unwrap());
        assert!(!evaluate("features < 1", &ctx()).unwrap());
    }

    #[test]
    fn test_ks003_deep_nesting_is_an_error() {
        let parens = format!("{}true{}", "(".repeat(10_000), ")".repeat(10_000));
        assert!(evaluate(&parens, &ctx()).unwrap_err().contains("longer than"));

        let bangs = format!("{}true", "!".repeat(MAX_NESTING + 1));
        assert!(evaluate(&bangs, &ctx()).unwrap_err().contains("nested deeper"));

        let ok = format!("{}true{}", "(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        assert!(evaluate(&ok, &ctx()).unwrap());
    }
}
