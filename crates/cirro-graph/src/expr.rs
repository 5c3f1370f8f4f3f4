//! The `${…}` expression language used in resource inputs and hook `when`
//! guards.
//!
//! Kept deliberately small: string interpolation, dotted references,
//! `==`/`!=`, `&&`/`||`, `!`, parentheses, string/number/bool/null literals,
//! list and object literals, and the conditional `cond ? a : b`.
//!
//! References resolve through a caller-provided [`RefResolver`]. A resolver
//! may answer [`Resolved::Deferred`] for a reference that is valid but whose
//! value is not yet known (an upstream output before the upstream node has
//! applied); rendering then keeps the original `${…}` text as a hole for the
//! executor to fill later.

use serde_json::Value;

use crate::error::ExprError;

// ── AST ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    /// Dotted reference path, e.g. `resources.database.main.outputs.url`.
    Ref(Vec<String>),
    List(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Cond {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

/// Outcome of resolving one reference.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Value(Value),
    /// Valid reference whose value is not yet observable.
    Deferred,
}

pub trait RefResolver {
    fn resolve(&self, path: &[String]) -> Result<Resolved, ExprError>;
}

// ── Tokenizer ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Bang,
    Question,
    Colon,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '{' => {
                tokens.push(Token::LBrace);
                i += 1;
            }
            '}' => {
                tokens.push(Token::RBrace);
                i += 1;
            }
            '?' => {
                tokens.push(Token::Question);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(ExprError::UnexpectedChar('=', i));
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err(ExprError::UnexpectedChar('&', i));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err(ExprError::UnexpectedChar('|', i));
                }
            }
            '"' | '\'' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ExprError::UnterminatedString),
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            if let Some(&escaped) = chars.get(i + 1) {
                                value.push(escaped);
                                i += 2;
                            } else {
                                return Err(ExprError::UnterminatedString);
                            }
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| ExprError::UnexpectedToken(text.clone()))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '-')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(ExprError::UnexpectedChar(other, i)),
        }
    }

    Ok(tokens)
}

// ── Parser ────────────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, ExprError> {
        let token = self.tokens.get(self.pos).cloned().ok_or(ExprError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn eat(&mut self, expected: &Token) -> Result<(), ExprError> {
        let token = self.next()?;
        if &token == expected {
            Ok(())
        } else {
            Err(ExprError::UnexpectedToken(format!("{:?}", token)))
        }
    }

    fn expr(&mut self) -> Result<Expr, ExprError> {
        let cond = self.or()?;
        if self.peek() == Some(&Token::Question) {
            self.pos += 1;
            let then = self.expr()?;
            self.eat(&Token::Colon)?;
            let otherwise = self.expr()?;
            return Ok(Expr::Cond {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(cond)
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.pos += 1;
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.equality()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.pos += 1;
            let right = self.equality()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.unary()?;
        loop {
            match self.peek() {
                Some(Token::EqEq) => {
                    self.pos += 1;
                    let right = self.unary()?;
                    left = Expr::Eq(Box::new(left), Box::new(right));
                }
                Some(Token::NotEq) => {
                    self.pos += 1;
                    let right = self.unary()?;
                    left = Expr::Ne(Box::new(left), Box::new(right));
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == Some(&Token::Bang) {
            self.pos += 1;
            let inner = self.unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.next()? {
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::Num(n) => Ok(Expr::Num(n)),
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "null" => Ok(Expr::Null),
                _ => {
                    let mut path = vec![name];
                    while self.peek() == Some(&Token::Dot) {
                        self.pos += 1;
                        match self.next()? {
                            Token::Ident(segment) => path.push(segment),
                            other => {
                                return Err(ExprError::UnexpectedToken(format!("{:?}", other)))
                            }
                        }
                    }
                    Ok(Expr::Ref(path))
                }
            },
            Token::LParen => {
                let inner = self.expr()?;
                self.eat(&Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if self.peek() == Some(&Token::RBracket) {
                    self.pos += 1;
                    return Ok(Expr::List(items));
                }
                loop {
                    items.push(self.expr()?);
                    match self.next()? {
                        Token::Comma => continue,
                        Token::RBracket => break,
                        other => return Err(ExprError::UnexpectedToken(format!("{:?}", other))),
                    }
                }
                Ok(Expr::List(items))
            }
            Token::LBrace => {
                let mut entries = Vec::new();
                if self.peek() == Some(&Token::RBrace) {
                    self.pos += 1;
                    return Ok(Expr::Object(entries));
                }
                loop {
                    let key = match self.next()? {
                        Token::Ident(k) | Token::Str(k) => k,
                        other => return Err(ExprError::UnexpectedToken(format!("{:?}", other))),
                    };
                    self.eat(&Token::Colon)?;
                    entries.push((key, self.expr()?));
                    match self.next()? {
                        Token::Comma => continue,
                        Token::RBrace => break,
                        other => return Err(ExprError::UnexpectedToken(format!("{:?}", other))),
                    }
                }
                Ok(Expr::Object(entries))
            }
            other => Err(ExprError::UnexpectedToken(format!("{:?}", other))),
        }
    }
}

/// Parse a bare expression, e.g. a hook `when` guard.
pub fn parse_expr(input: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError::UnexpectedToken(format!(
            "{:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(expr)
}

// ── Evaluation ────────────────────────────────────────────────────────────────

impl Expr {
    pub fn eval(&self, resolver: &dyn RefResolver) -> Result<Resolved, ExprError> {
        match self {
            Expr::Str(s) => Ok(Resolved::Value(Value::String(s.clone()))),
            Expr::Num(n) => Ok(Resolved::Value(
                serde_json::Number::from_f64(*n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Expr::Bool(b) => Ok(Resolved::Value(Value::Bool(*b))),
            Expr::Null => Ok(Resolved::Value(Value::Null)),
            Expr::Ref(path) => resolver.resolve(path),
            Expr::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item.eval(resolver)? {
                        Resolved::Value(v) => out.push(v),
                        Resolved::Deferred => return Ok(Resolved::Deferred),
                    }
                }
                Ok(Resolved::Value(Value::Array(out)))
            }
            Expr::Object(entries) => {
                let mut map = serde_json::Map::with_capacity(entries.len());
                for (key, value) in entries {
                    match value.eval(resolver)? {
                        Resolved::Value(v) => {
                            map.insert(key.clone(), v);
                        }
                        Resolved::Deferred => return Ok(Resolved::Deferred),
                    }
                }
                Ok(Resolved::Value(Value::Object(map)))
            }
            Expr::Eq(a, b) => match (a.eval(resolver)?, b.eval(resolver)?) {
                (Resolved::Value(a), Resolved::Value(b)) => {
                    Ok(Resolved::Value(Value::Bool(a == b)))
                }
                _ => Ok(Resolved::Deferred),
            },
            Expr::Ne(a, b) => match (a.eval(resolver)?, b.eval(resolver)?) {
                (Resolved::Value(a), Resolved::Value(b)) => {
                    Ok(Resolved::Value(Value::Bool(a != b)))
                }
                _ => Ok(Resolved::Deferred),
            },
            Expr::And(a, b) => eval_logical(a, b, resolver, |x, y| x && y),
            Expr::Or(a, b) => eval_logical(a, b, resolver, |x, y| x || y),
            Expr::Not(inner) => match inner.eval(resolver)? {
                Resolved::Value(v) => Ok(Resolved::Value(Value::Bool(!expect_bool(&v)?))),
                Resolved::Deferred => Ok(Resolved::Deferred),
            },
            Expr::Cond {
                cond,
                then,
                otherwise,
            } => match cond.eval(resolver)? {
                Resolved::Deferred => Ok(Resolved::Deferred),
                Resolved::Value(v) => {
                    if expect_bool(&v)? {
                        then.eval(resolver)
                    } else {
                        otherwise.eval(resolver)
                    }
                }
            },
        }
    }

    /// Collect every reference path in the expression tree.
    pub fn refs(&self, out: &mut Vec<Vec<String>>) {
        match self {
            Expr::Ref(path) => out.push(path.clone()),
            Expr::List(items) => items.iter().for_each(|e| e.refs(out)),
            Expr::Object(entries) => entries.iter().for_each(|(_, e)| e.refs(out)),
            Expr::Eq(a, b) | Expr::Ne(a, b) | Expr::And(a, b) | Expr::Or(a, b) => {
                a.refs(out);
                b.refs(out);
            }
            Expr::Not(inner) => inner.refs(out),
            Expr::Cond {
                cond,
                then,
                otherwise,
            } => {
                cond.refs(out);
                then.refs(out);
                otherwise.refs(out);
            }
            _ => {}
        }
    }
}

fn eval_logical(
    a: &Expr,
    b: &Expr,
    resolver: &dyn RefResolver,
    op: fn(bool, bool) -> bool,
) -> Result<Resolved, ExprError> {
    match (a.eval(resolver)?, b.eval(resolver)?) {
        (Resolved::Value(a), Resolved::Value(b)) => Ok(Resolved::Value(Value::Bool(op(
            expect_bool(&a)?,
            expect_bool(&b)?,
        )))),
        _ => Ok(Resolved::Deferred),
    }
}

fn expect_bool(v: &Value) -> Result<bool, ExprError> {
    v.as_bool()
        .ok_or_else(|| ExprError::NonBooleanCondition(v.to_string()))
}

// ── Templates ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Lit(String),
    /// Parsed expression plus its original `${…}` text, kept for holes.
    Expr { raw: String, expr: Expr },
}

/// A string with zero or more `${…}` interpolations.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    parts: Vec<Part>,
}

impl Template {
    pub fn parse(input: &str) -> Result<Template, ExprError> {
        let mut parts = Vec::new();
        let mut rest = input;

        while let Some(start) = rest.find("${") {
            if !rest[..start].is_empty() {
                parts.push(Part::Lit(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = find_interpolation_end(after)?;
            let inner = &after[..end];
            parts.push(Part::Expr {
                raw: format!("${{{}}}", inner),
                expr: parse_expr(inner)?,
            });
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            parts.push(Part::Lit(rest.to_string()));
        }

        Ok(Template { parts })
    }

    pub fn has_interpolations(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, Part::Expr { .. }))
    }

    pub fn refs(&self, out: &mut Vec<Vec<String>>) {
        for part in &self.parts {
            if let Part::Expr { expr, .. } = part {
                expr.refs(out);
            }
        }
    }

    /// Render against `resolver`. Returns the rendered value and whether any
    /// deferred reference left a `${…}` hole in it.
    ///
    /// A template that is exactly one interpolation passes the resolved value
    /// through typed; mixed templates concatenate to a string.
    pub fn render(&self, resolver: &dyn RefResolver) -> Result<(Value, bool), ExprError> {
        if let [Part::Expr { raw, expr }] = self.parts.as_slice() {
            return match expr.eval(resolver)? {
                Resolved::Value(v) => Ok((v, false)),
                Resolved::Deferred => Ok((Value::String(raw.clone()), true)),
            };
        }

        let mut rendered = String::new();
        let mut has_holes = false;
        for part in &self.parts {
            match part {
                Part::Lit(text) => rendered.push_str(text),
                Part::Expr { raw, expr } => match expr.eval(resolver)? {
                    Resolved::Value(v) => rendered.push_str(&stringify(&v)),
                    Resolved::Deferred => {
                        rendered.push_str(raw);
                        has_holes = true;
                    }
                },
            }
        }
        Ok((Value::String(rendered), has_holes))
    }
}

/// Find the offset of the `}` closing an interpolation, skipping nested
/// braces and string literals.
fn find_interpolation_end(input: &str) -> Result<usize, ExprError> {
    let mut depth = 0usize;
    let mut in_string: Option<char> = None;
    let mut escaped = false;

    for (offset, c) in input.char_indices() {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                in_string = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => in_string = Some(c),
            '{' => depth += 1,
            '}' => {
                if depth == 0 {
                    return Ok(offset);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    Err(ExprError::UnterminatedInterpolation)
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ── JSON tree rendering ───────────────────────────────────────────────────────

/// Render every string in a JSON tree as a template. Returns the rendered
/// tree and whether any hole remains.
pub fn render_value(value: &Value, resolver: &dyn RefResolver) -> Result<(Value, bool), ExprError> {
    match value {
        Value::String(s) => {
            let template = Template::parse(s)?;
            if !template.has_interpolations() {
                return Ok((value.clone(), false));
            }
            template.render(resolver)
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            let mut has_holes = false;
            for item in items {
                let (rendered, holes) = render_value(item, resolver)?;
                has_holes |= holes;
                out.push(rendered);
            }
            Ok((Value::Array(out), has_holes))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            let mut has_holes = false;
            for (key, item) in map {
                let (rendered, holes) = render_value(item, resolver)?;
                has_holes |= holes;
                out.insert(key.clone(), rendered);
            }
            Ok((Value::Object(out), has_holes))
        }
        other => Ok((other.clone(), false)),
    }
}

/// Collect every reference path appearing anywhere in a JSON tree's string
/// templates.
pub fn extract_refs(value: &Value) -> Result<Vec<Vec<String>>, ExprError> {
    let mut refs = Vec::new();
    collect_refs(value, &mut refs)?;
    Ok(refs)
}

fn collect_refs(value: &Value, out: &mut Vec<Vec<String>>) -> Result<(), ExprError> {
    match value {
        Value::String(s) => {
            if s.contains("${") {
                Template::parse(s)?.refs(out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_refs(item, out)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_refs(item, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    /// Resolver over a flat map of dotted paths; paths in `deferred` answer
    /// Deferred, everything else unknown.
    struct MapResolver {
        values: HashMap<String, Value>,
        deferred: Vec<String>,
    }

    impl MapResolver {
        fn new(values: &[(&str, Value)]) -> Self {
            Self {
                values: values
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
                deferred: vec![],
            }
        }

        fn deferring(mut self, path: &str) -> Self {
            self.deferred.push(path.to_string());
            self
        }
    }

    impl RefResolver for MapResolver {
        fn resolve(&self, path: &[String]) -> Result<Resolved, ExprError> {
            let joined = path.join(".");
            if self.deferred.contains(&joined) {
                return Ok(Resolved::Deferred);
            }
            self.values
                .get(&joined)
                .cloned()
                .map(Resolved::Value)
                .ok_or(ExprError::UnknownReference(joined))
        }
    }

    #[test]
    fn parses_and_evals_equality_guard() {
        let resolver = MapResolver::new(&[("resource.inputs.engine", json!("postgres"))]);
        let expr = parse_expr("resource.inputs.engine == \"postgres\"").unwrap();
        assert_eq!(
            expr.eval(&resolver).unwrap(),
            Resolved::Value(json!(true))
        );
    }

    #[test]
    fn boolean_operators_and_parens() {
        let resolver = MapResolver::new(&[
            ("a", json!("x")),
            ("b", json!("y")),
        ]);
        let expr = parse_expr("(a == 'x' && b == 'z') || b == 'y'").unwrap();
        assert_eq!(expr.eval(&resolver).unwrap(), Resolved::Value(json!(true)));

        let expr = parse_expr("!(a == 'x')").unwrap();
        assert_eq!(expr.eval(&resolver).unwrap(), Resolved::Value(json!(false)));
    }

    #[test]
    fn conditional_selects_branch() {
        let resolver = MapResolver::new(&[("env", json!("prod"))]);
        let expr = parse_expr("env == 'prod' ? 3 : 1").unwrap();
        assert_eq!(expr.eval(&resolver).unwrap(), Resolved::Value(json!(3.0)));
    }

    #[test]
    fn list_and_object_literals() {
        let resolver = MapResolver::new(&[("x", json!("v"))]);
        let expr = parse_expr("{key: x, \"other\": [1, true, null]}").unwrap();
        assert_eq!(
            expr.eval(&resolver).unwrap(),
            Resolved::Value(json!({"key": "v", "other": [1.0, true, null]}))
        );
    }

    #[test]
    fn non_boolean_condition_rejected() {
        let resolver = MapResolver::new(&[("x", json!("v"))]);
        let expr = parse_expr("x && true").unwrap();
        assert!(matches!(
            expr.eval(&resolver),
            Err(ExprError::NonBooleanCondition(_))
        ));
    }

    #[test]
    fn unknown_reference_errors() {
        let resolver = MapResolver::new(&[]);
        let expr = parse_expr("resources.database.nope.outputs.url").unwrap();
        assert!(matches!(
            expr.eval(&resolver),
            Err(ExprError::UnknownReference(_))
        ));
    }

    #[test]
    fn single_interpolation_preserves_type() {
        let resolver = MapResolver::new(&[("resources.port.web.outputs.number", json!(8080))]);
        let template = Template::parse("${resources.port.web.outputs.number}").unwrap();
        let (value, holes) = template.render(&resolver).unwrap();
        assert_eq!(value, json!(8080));
        assert!(!holes);
    }

    #[test]
    fn mixed_template_concatenates() {
        let resolver = MapResolver::new(&[
            ("resources.database.main.outputs.host", json!("db.internal")),
            ("resources.database.main.outputs.port", json!(5432)),
        ]);
        let template = Template::parse(
            "postgres://${resources.database.main.outputs.host}:${resources.database.main.outputs.port}/app",
        )
        .unwrap();
        let (value, holes) = template.render(&resolver).unwrap();
        assert_eq!(value, json!("postgres://db.internal:5432/app"));
        assert!(!holes);
    }

    #[test]
    fn deferred_reference_leaves_hole() {
        let resolver =
            MapResolver::new(&[]).deferring("resources.database.main.outputs.url");
        let template = Template::parse("${resources.database.main.outputs.url}").unwrap();
        let (value, holes) = template.render(&resolver).unwrap();
        assert!(holes);
        assert_eq!(value, json!("${resources.database.main.outputs.url}"));
    }

    #[test]
    fn hole_text_survives_re_rendering() {
        // The executor re-renders the planner's output once outputs exist;
        // the kept `${…}` text must parse back to the same reference.
        let deferred =
            MapResolver::new(&[]).deferring("resources.database.main.outputs.url");
        let template = Template::parse("url=${resources.database.main.outputs.url}").unwrap();
        let (first_pass, holes) = template.render(&deferred).unwrap();
        assert!(holes);

        let filled = MapResolver::new(&[(
            "resources.database.main.outputs.url",
            json!("postgres://db:5432/app"),
        )]);
        let (second_pass, holes) =
            render_value(&first_pass, &filled).unwrap();
        assert!(!holes);
        assert_eq!(second_pass, json!("url=postgres://db:5432/app"));
    }

    #[test]
    fn render_value_walks_nested_structures() {
        let resolver = MapResolver::new(&[("variables.region", json!("us-east-1"))]);
        let input = json!({
            "env": {"REGION": "${variables.region}"},
            "list": ["${variables.region}", "literal"],
            "count": 2,
        });
        let (rendered, holes) = render_value(&input, &resolver).unwrap();
        assert!(!holes);
        assert_eq!(
            rendered,
            json!({
                "env": {"REGION": "us-east-1"},
                "list": ["us-east-1", "literal"],
                "count": 2,
            })
        );
    }

    #[test]
    fn extract_refs_finds_all_paths() {
        let input = json!({
            "a": "${resources.database.main.outputs.url}",
            "b": "${deps.auth.outputs.endpoint == 'x' ? 'y' : variables.fallback}",
        });
        let mut refs = extract_refs(&input).unwrap();
        refs.sort();
        assert_eq!(
            refs,
            vec![
                vec!["deps", "auth", "outputs", "endpoint"],
                vec!["resources", "database", "main", "outputs", "url"],
                vec!["variables", "fallback"],
            ]
        );
    }

    #[test]
    fn nested_braces_inside_interpolation() {
        let resolver = MapResolver::new(&[]);
        let template = Template::parse("${ {a: 1} }").unwrap();
        let (value, _) = template.render(&resolver).unwrap();
        assert_eq!(value, json!({"a": 1.0}));
    }

    #[test]
    fn unterminated_interpolation_rejected() {
        assert_eq!(
            Template::parse("${resources.a").unwrap_err(),
            ExprError::UnterminatedInterpolation
        );
    }
}
