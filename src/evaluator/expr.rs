//! A closed expression language for task assertions.
//!
//! Keys and predicates are written as Python-style lambdas in task files.
//! They are parsed once at load into an [`Expr`] tree and evaluated over
//! `serde_json::Value`s. Only the operators and builtins below exist; there
//! is no way to reach the host.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::Value;

use crate::errors::{HarnessError, HarnessResult};
use crate::grammar::{tokenize, Cursor, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Len,
    Abs,
    Float,
    Int,
    Str,
    Round,
    Min,
    Max,
    Lower,
    Sorted,
}

impl Builtin {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "len" => Self::Len,
            "abs" => Self::Abs,
            "float" => Self::Float,
            "int" => Self::Int,
            "str" => Self::Str,
            "round" => Self::Round,
            "min" => Self::Min,
            "max" => Self::Max,
            "lower" => Self::Lower,
            "sorted" => Self::Sorted,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(String),
    List(Vec<Expr>),
    Subscript(Box<Expr>, Box<Expr>),
    Call(Builtin, Vec<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

/// `lambda a, b: body`
#[derive(Debug, Clone, PartialEq)]
pub struct Lambda {
    pub params: Vec<String>,
    pub body: Expr,
}

impl Lambda {
    pub fn parse(src: &str) -> HarnessResult<Self> {
        let tokens = tokenize(src).map_err(|e| HarnessError::Expression(e.to_string()))?;
        let mut p = Parser { cur: Cursor::new(tokens) };
        let lambda = p.lambda().map_err(HarnessError::Expression)?;
        if !p.cur.is_done() {
            return Err(HarnessError::Expression(format!("trailing input in '{src}'")));
        }
        Ok(lambda)
    }

    pub fn call(&self, args: &[&Value]) -> HarnessResult<Value> {
        if args.len() != self.params.len() {
            return Err(HarnessError::Expression(format!(
                "lambda takes {} arguments, got {}",
                self.params.len(),
                args.len()
            )));
        }
        let scope: HashMap<&str, &Value> = self
            .params
            .iter()
            .map(String::as_str)
            .zip(args.iter().copied())
            .collect();
        eval(&self.body, &scope)
    }
}

/// True when `src` reads as a lambda rather than a plain key.
pub fn is_lambda(src: &str) -> bool {
    src.trim_start()
        .strip_prefix("lambda")
        .is_some_and(|rest| rest.starts_with(|c: char| c.is_whitespace() || c == ':'))
}

struct Parser {
    cur: Cursor,
}

fn is_keyword(tok: Option<&Token>, word: &str) -> bool {
    matches!(tok, Some(Token::Ident(w)) if w == word)
}

impl Parser {
    fn lambda(&mut self) -> Result<Lambda, String> {
        if !is_keyword(self.cur.peek(), "lambda") {
            return Err("expected 'lambda'".into());
        }
        self.cur.next();
        let mut params = Vec::new();
        while let Some(Token::Ident(name)) = self.cur.peek() {
            params.push(name.clone());
            self.cur.next();
            if !self.cur.eat(&Token::Comma) {
                break;
            }
        }
        self.cur.expect(&Token::Colon)?;
        let body = self.or()?;
        Ok(Lambda { params, body })
    }

    fn or(&mut self) -> Result<Expr, String> {
        let mut left = self.and()?;
        while is_keyword(self.cur.peek(), "or") {
            self.cur.next();
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, String> {
        let mut left = self.not()?;
        while is_keyword(self.cur.peek(), "and") {
            self.cur.next();
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(self.not()?));
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Expr, String> {
        if is_keyword(self.cur.peek(), "not") {
            self.cur.next();
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        let left = self.additive()?;
        let (op, width) = match self.cur.peek() {
            Some(Token::EqEq) => (BinOp::Eq, 1),
            Some(Token::NotEq) => (BinOp::Ne, 1),
            Some(Token::Lt) => (BinOp::Lt, 1),
            Some(Token::Le) => (BinOp::Le, 1),
            Some(Token::Gt) => (BinOp::Gt, 1),
            Some(Token::Ge) => (BinOp::Ge, 1),
            Some(Token::Ident(w)) if w == "in" => (BinOp::In, 1),
            Some(Token::Ident(w)) if w == "not" && is_keyword(self.cur.peek_at(1), "in") => {
                (BinOp::NotIn, 2)
            }
            _ => return Ok(left),
        };
        for _ in 0..width {
            self.cur.next();
        }
        let right = self.additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn additive(&mut self) -> Result<Expr, String> {
        let mut left = self.term()?;
        loop {
            let op = match self.cur.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(left),
            };
            self.cur.next();
            left = Expr::Binary(op, Box::new(left), Box::new(self.term()?));
        }
    }

    fn term(&mut self) -> Result<Expr, String> {
        let mut left = self.unary()?;
        loop {
            let op = match self.cur.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => return Ok(left),
            };
            self.cur.next();
            left = Expr::Binary(op, Box::new(left), Box::new(self.unary()?));
        }
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.cur.eat(&Token::Minus) {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, String> {
        let mut expr = self.atom()?;
        loop {
            if self.cur.eat(&Token::LBracket) {
                let index = self.or()?;
                self.cur.expect(&Token::RBracket)?;
                expr = Expr::Subscript(Box::new(expr), Box::new(index));
            } else if self.cur.eat(&Token::Dot) {
                // x.lower() is lower(x)
                let name = match self.cur.next() {
                    Some(Token::Ident(n)) => n,
                    _ => return Err("expected a method name after '.'".into()),
                };
                let builtin = Builtin::from_name(&name).ok_or_else(|| format!("unknown method '{name}'"))?;
                self.cur.expect(&Token::LParen)?;
                let mut args = vec![expr];
                args.extend(self.args(Token::RParen)?);
                expr = Expr::Call(builtin, args);
            } else {
                return Ok(expr);
            }
        }
    }

    fn args(&mut self, close: Token) -> Result<Vec<Expr>, String> {
        let mut items = Vec::new();
        loop {
            if self.cur.eat(&close) {
                return Ok(items);
            }
            items.push(self.or()?);
            if !self.cur.eat(&Token::Comma) {
                self.cur.expect(&close)?;
                return Ok(items);
            }
        }
    }

    fn atom(&mut self) -> Result<Expr, String> {
        match self.cur.next() {
            Some(Token::Int(n)) => Ok(Expr::Literal(Value::from(n))),
            Some(Token::Float(n)) => Ok(Expr::Literal(Value::from(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::LParen) => {
                let inner = self.or()?;
                self.cur.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => Ok(Expr::List(self.args(Token::RBracket)?)),
            Some(Token::Ident(name)) => match name.as_str() {
                "True" => Ok(Expr::Literal(Value::Bool(true))),
                "False" => Ok(Expr::Literal(Value::Bool(false))),
                "None" => Ok(Expr::Literal(Value::Null)),
                _ if self.cur.peek() == Some(&Token::LParen) => {
                    let builtin = Builtin::from_name(&name)
                        .ok_or_else(|| format!("unknown function '{name}'"))?;
                    self.cur.next();
                    Ok(Expr::Call(builtin, self.args(Token::RParen)?))
                }
                _ => Ok(Expr::Var(name)),
            },
            Some(t) => Err(format!("unexpected '{t}'")),
            None => Err("unexpected end of expression".into()),
        }
    }
}

type Scope<'a> = HashMap<&'a str, &'a Value>;

fn fail<T>(msg: impl Into<String>) -> HarnessResult<T> {
    Err(HarnessError::Expression(msg.into()))
}

pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Equality with int/float coercion, applied element-wise to arrays.
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| loose_eq(l, r))
        }
        _ => a == b,
    }
}

fn as_number(v: &Value) -> HarnessResult<f64> {
    match v {
        Value::Number(n) => n.as_f64().map_or_else(|| fail("number out of range"), Ok),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        other => fail(format!("expected a number, got {other}")),
    }
}

fn number(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Value::from(f as i64)
    } else {
        Value::from(f)
    }
}

fn compare(a: &Value, b: &Value) -> HarnessResult<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        _ => {
            let (x, y) = (as_number(a)?, as_number(b)?);
            x.partial_cmp(&y).map_or_else(|| fail("incomparable numbers"), Ok)
        }
    }
}

fn contains(container: &Value, item: &Value) -> HarnessResult<bool> {
    match container {
        Value::String(s) => match item {
            Value::String(needle) => Ok(s.contains(needle.as_str())),
            other => fail(format!("'in <string>' needs a string, got {other}")),
        },
        Value::Array(items) => Ok(items.iter().any(|x| loose_eq(x, item))),
        Value::Object(map) => match item {
            Value::String(k) => Ok(map.contains_key(k)),
            _ => Ok(false),
        },
        other => fail(format!("{other} is not a container")),
    }
}

fn arithmetic(op: BinOp, a: &Value, b: &Value) -> HarnessResult<Value> {
    match (op, a, b) {
        (BinOp::Add, Value::String(x), Value::String(y)) => Ok(Value::String(format!("{x}{y}"))),
        (BinOp::Add, Value::Array(x), Value::Array(y)) => {
            Ok(Value::Array(x.iter().chain(y).cloned().collect()))
        }
        (BinOp::Add | BinOp::Sub | BinOp::Mul, Value::Number(x), Value::Number(y))
            if x.is_i64() && y.is_i64() =>
        {
            let (x, y) = (x.as_i64().unwrap_or_default(), y.as_i64().unwrap_or_default());
            let r = match op {
                BinOp::Add => x.checked_add(y),
                BinOp::Sub => x.checked_sub(y),
                _ => x.checked_mul(y),
            };
            r.map(Value::from).map_or_else(|| fail("integer overflow"), Ok)
        }
        _ => {
            let (x, y) = (as_number(a)?, as_number(b)?);
            Ok(Value::from(match op {
                BinOp::Add => x + y,
                BinOp::Sub => x - y,
                BinOp::Mul => x * y,
                _ => {
                    if y == 0.0 {
                        return fail("division by zero");
                    }
                    x / y
                }
            }))
        }
    }
}

fn subscript(base: &Value, index: &Value) -> HarnessResult<Value> {
    match (base, index) {
        (Value::Object(map), Value::String(k)) => map
            .get(k)
            .cloned()
            .map_or_else(|| fail(format!("missing key '{k}'")), Ok),
        (Value::Array(items), Value::Number(n)) => {
            let i = n.as_i64().map_or_else(|| fail("index must be an integer"), Ok)?;
            let len = items.len() as i64;
            let i = if i < 0 { i + len } else { i };
            if (0..len).contains(&i) {
                Ok(items[i as usize].clone())
            } else {
                fail(format!("index {i} out of range"))
            }
        }
        (Value::String(s), Value::Number(n)) => {
            let i = n.as_i64().map_or_else(|| fail("index must be an integer"), Ok)?;
            let chars: Vec<char> = s.chars().collect();
            let len = chars.len() as i64;
            let i = if i < 0 { i + len } else { i };
            if (0..len).contains(&i) {
                Ok(Value::String(chars[i as usize].to_string()))
            } else {
                fail(format!("index {i} out of range"))
            }
        }
        (b, i) => fail(format!("cannot index {b} with {i}")),
    }
}

fn extremum(args: &[Value], want: Ordering) -> HarnessResult<Value> {
    let items = match args {
        [Value::Array(items)] => items.as_slice(),
        items => items,
    };
    let mut best: Option<&Value> = None;
    for item in items {
        best = match best {
            Some(b) if compare(item, b)? != want => Some(b),
            _ => Some(item),
        };
    }
    best.cloned().map_or_else(|| fail("empty sequence"), Ok)
}

fn call_builtin(builtin: Builtin, args: &[Value]) -> HarnessResult<Value> {
    let one = || match args {
        [v] => Ok(v),
        _ => fail(format!("{builtin:?} takes one argument")),
    };
    match builtin {
        Builtin::Len => match one()? {
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(a) => Ok(Value::from(a.len())),
            Value::Object(o) => Ok(Value::from(o.len())),
            other => fail(format!("{other} has no len()")),
        },
        Builtin::Abs => match one()? {
            Value::Number(n) if n.is_i64() => {
                let i = n.as_i64().unwrap_or_default();
                // i64::MIN has no i64 absolute value
                Ok(i.checked_abs().map_or_else(|| Value::from((i as f64).abs()), Value::from))
            }
            v => Ok(Value::from(as_number(v)?.abs())),
        },
        Builtin::Float => match one()? {
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::from)
                .map_or_else(|_| fail(format!("could not convert '{s}' to float")), Ok),
            v => Ok(Value::from(as_number(v)?)),
        },
        Builtin::Int => match one()? {
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_or_else(|_| fail(format!("invalid literal for int(): '{s}'")), Ok),
            v => Ok(Value::from(as_number(v)?.trunc() as i64)),
        },
        Builtin::Str => match one()? {
            Value::String(s) => Ok(Value::String(s.clone())),
            other => Ok(Value::String(other.to_string())),
        },
        Builtin::Round => {
            let (x, digits) = match args {
                [x] => (as_number(x)?, None),
                [x, n] => (as_number(x)?, Some(as_number(n)? as i32)),
                _ => return fail("round takes one or two arguments"),
            };
            match digits {
                None => Ok(number(x.round_ties_even())),
                Some(n) => {
                    let scale = 10f64.powi(n);
                    Ok(Value::from((x * scale).round_ties_even() / scale))
                }
            }
        }
        Builtin::Min => extremum(args, Ordering::Less),
        Builtin::Max => extremum(args, Ordering::Greater),
        Builtin::Lower => match one()? {
            Value::String(s) => Ok(Value::String(s.to_lowercase())),
            other => fail(format!("{other} has no lower()")),
        },
        Builtin::Sorted => match one()? {
            Value::Array(items) => {
                let mut items = items.clone();
                let mut err = None;
                items.sort_by(|a, b| {
                    compare(a, b).unwrap_or_else(|e| {
                        err.get_or_insert(e);
                        Ordering::Equal
                    })
                });
                match err {
                    Some(e) => Err(e),
                    None => Ok(Value::Array(items)),
                }
            }
            other => fail(format!("{other} is not sortable")),
        },
    }
}

fn eval(expr: &Expr, scope: &Scope<'_>) -> HarnessResult<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(name) => scope
            .get(name.as_str())
            .map(|v| (*v).clone())
            .map_or_else(|| fail(format!("name '{name}' is not defined")), Ok),
        Expr::List(items) => Ok(Value::Array(
            items.iter().map(|e| eval(e, scope)).collect::<HarnessResult<_>>()?,
        )),
        Expr::Subscript(base, index) => subscript(&eval(base, scope)?, &eval(index, scope)?),
        Expr::Call(builtin, args) => {
            let args = args.iter().map(|e| eval(e, scope)).collect::<HarnessResult<Vec<_>>>()?;
            call_builtin(*builtin, &args)
        }
        Expr::Neg(inner) => match eval(inner, scope)? {
            Value::Number(n) if n.is_i64() => {
                let i = n.as_i64().unwrap_or_default();
                Ok(i.checked_neg().map_or_else(|| Value::from(-(i as f64)), Value::from))
            }
            v => Ok(Value::from(-as_number(&v)?)),
        },
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, scope)?))),
        Expr::Binary(BinOp::And, l, r) => {
            let left = eval(l, scope)?;
            if truthy(&left) { eval(r, scope) } else { Ok(left) }
        }
        Expr::Binary(BinOp::Or, l, r) => {
            let left = eval(l, scope)?;
            if truthy(&left) { Ok(left) } else { eval(r, scope) }
        }
        Expr::Binary(op, l, r) => {
            let (a, b) = (eval(l, scope)?, eval(r, scope)?);
            let verdict = match op {
                BinOp::Eq => loose_eq(&a, &b),
                BinOp::Ne => !loose_eq(&a, &b),
                BinOp::Lt => compare(&a, &b)? == Ordering::Less,
                BinOp::Le => compare(&a, &b)? != Ordering::Greater,
                BinOp::Gt => compare(&a, &b)? == Ordering::Greater,
                BinOp::Ge => compare(&a, &b)? != Ordering::Less,
                BinOp::In => contains(&b, &a)?,
                BinOp::NotIn => !contains(&b, &a)?,
                _ => return arithmetic(*op, &a, &b),
            };
            Ok(Value::Bool(verdict))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(src: &str, args: &[&Value]) -> Value {
        Lambda::parse(src).unwrap().call(args).unwrap()
    }

    #[test]
    fn subscripts_and_arithmetic() {
        let info = json!({"pos": [1, 2, 3], "name": "Mars"});
        assert_eq!(run("lambda info: info['pos'][-1] * 2 + 1", &[&info]), json!(7));
        assert_eq!(run("lambda info: info[\"name\"].lower()", &[&info]), json!("mars"));
        assert_eq!(run("lambda info: len(info['pos'])", &[&info]), json!(3));
    }

    #[test]
    fn predicates_combine() {
        let (l, r) = (json!(4.0), json!(4));
        assert_eq!(run("lambda l, r: l == r and not l < 3", &[&l, &r]), json!(true));
        assert_eq!(run("lambda l, r: abs(l - r) <= 1e-6", &[&json!(1.0000001), &json!(1)]), json!(true));
        assert_eq!(run("lambda l, r: r in l", &[&json!("Earth Moon"), &json!("Moon")]), json!(true));
        assert_eq!(run("lambda l, r: r not in l", &[&json!([1, 2]), &json!(2)]), json!(false));
    }

    #[test]
    fn builtins_follow_python() {
        let v = json!(null);
        assert_eq!(run("lambda x: round(2.5)", &[&v]), json!(2));
        assert_eq!(run("lambda x: round(3.5)", &[&v]), json!(4));
        assert_eq!(run("lambda x: max([3, 9, 1])", &[&v]), json!(9));
        assert_eq!(run("lambda x: min(4, 2)", &[&v]), json!(2));
        assert_eq!(run("lambda x: sorted(['b', 'a'])", &[&v]), json!(["a", "b"]));
        assert_eq!(run("lambda x: int('42') + float('0.5')", &[&v]), json!(42.5));
    }

    #[test]
    fn host_escape_is_not_expressible() {
        assert!(Lambda::parse("lambda x: __import__('os')").is_err());
        assert!(Lambda::parse("lambda x: x.system('ls')").is_err());
        assert!(Lambda::parse("lambda x: x ; 1").is_err());
    }

    #[test]
    fn runtime_errors_are_values_not_panics() {
        let lam = Lambda::parse("lambda info: info['missing']").unwrap();
        assert!(lam.call(&[&json!({})]).is_err());
        let lam = Lambda::parse("lambda a: a / 0").unwrap();
        assert!(lam.call(&[&json!(1)]).is_err());
        assert!(lam.call(&[]).is_err());
    }

    #[test]
    fn integer_extremes_widen_to_float() {
        let v = json!({"n": i64::MIN});
        assert_eq!(run("lambda x: abs(x['n'])", &[&v]), json!(9.223372036854776e18));
        assert_eq!(run("lambda x: -x['n']", &[&v]), json!(9.223372036854776e18));
        assert_eq!(run("lambda x: -(-3)", &[&v]), json!(3));
    }

    #[test]
    fn lambda_detection() {
        assert!(is_lambda("lambda info: info['x']"));
        assert!(is_lambda("  lambda: 1"));
        assert!(!is_lambda("lambda_count"));
        assert!(!is_lambda("zoom_level"));
    }
}
