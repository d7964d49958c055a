//! The calculation language of virtual metering points.
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := ('+' | '-') unary | primary
//! primary := NUMBER | '(' expr ')' | ('mp' | 'vmp') '(' INTEGER ')'
//! ```
//!
//! `mp(id)` and `vmp(id)` evaluate to per-bucket vectors supplied by the
//! caller; nothing else can be named, so a formula cannot reach anything but
//! arithmetic and those two lookups. `INTEGER` is a plain digit sequence.
//!
//! Formulas are limited to [`MAX_TOKENS`] tokens and [`MAX_NESTING`] levels of
//! parentheses and signs, which bounds the depth of every parsed tree.

use thiserror::Error;

pub const MAX_NESTING: usize = 256;
pub const MAX_TOKENS: usize = 2048;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalculationError {
    #[error("syntax error at position {position}: {message}")]
    Syntax { position: usize, message: String },
    #[error("metering point {0} does not exist")]
    UnknownPoint(i64),
    #[error("virtual metering point {0} does not exist")]
    UnknownVirtualPoint(i64),
    #[error("division by zero")]
    DivisionByZero,
    #[error("circular reference through vmp({0})")]
    CircularReference(i64),
    #[error("virtual metering points nested deeper than {0} levels")]
    NestingTooDeep(usize),
}

impl CalculationError {
    fn syntax(position: usize, message: impl Into<String>) -> Self {
        CalculationError::Syntax {
            position,
            message: message.into(),
        }
    }
}

/// A point lookup inside a formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reference {
    Point(i64),
    VirtualPoint(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Reference(Reference),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Integer(i64),
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    position: usize,
}

fn tokenize(src: &str) -> Result<Vec<Token>, CalculationError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let kind = match c {
            b' ' | b'\t' | b'\r' | b'\n' => {
                i += 1;
                continue;
            }
            b'+' => TokenKind::Plus,
            b'-' => TokenKind::Minus,
            b'*' => TokenKind::Star,
            b'/' => TokenKind::Slash,
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'0'..=b'9' | b'.' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                    let mut j = i + 1;
                    if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                        j += 1;
                    }
                    if j < bytes.len() && bytes[j].is_ascii_digit() {
                        while j < bytes.len() && bytes[j].is_ascii_digit() {
                            j += 1;
                        }
                        i = j;
                    }
                }
                let text = &src[start..i];
                if text.bytes().all(|b| b.is_ascii_digit()) {
                    if let Ok(value) = text.parse::<i64>() {
                        tokens.push(Token {
                            kind: TokenKind::Integer(value),
                            position: start,
                        });
                        continue;
                    }
                }
                let value = text
                    .parse::<f64>()
                    .map_err(|_| CalculationError::syntax(start, format!("invalid number '{text}'")))?;
                tokens.push(Token {
                    kind: TokenKind::Number(value),
                    position: start,
                });
                continue;
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Ident(src[start..i].to_string()),
                    position: start,
                });
                continue;
            }
            _ => {
                let ch = src[i..].chars().next().unwrap_or('?');
                return Err(CalculationError::syntax(i, format!("unexpected character '{ch}'")));
            }
        };
        tokens.push(Token { kind, position: i });
        i += 1;
    }

    if tokens.len() > MAX_TOKENS {
        return Err(CalculationError::syntax(
            tokens[MAX_TOKENS].position,
            format!("formula longer than {MAX_TOKENS} tokens"),
        ));
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |t| t.position)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), CalculationError> {
        let position = self.position();
        match self.next() {
            Some(tok) if tok.kind == kind => Ok(()),
            Some(_) => Err(CalculationError::syntax(position, format!("expected {what}"))),
            None => Err(CalculationError::syntax(position, format!("expected {what}, found end of formula"))),
        }
    }

    fn expr(&mut self) -> Result<Expr, CalculationError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Plus) => BinaryOp::Add,
                Some(TokenKind::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn term(&mut self) -> Result<Expr, CalculationError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Star) => BinaryOp::Mul,
                Some(TokenKind::Slash) => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    // every recursive path passes through here
    fn unary(&mut self) -> Result<Expr, CalculationError> {
        if self.depth >= MAX_NESTING {
            return Err(CalculationError::syntax(
                self.position(),
                format!("nested deeper than {MAX_NESTING} levels"),
            ));
        }
        self.depth += 1;
        let result = self.unary_inner();
        self.depth -= 1;
        result
    }

    fn unary_inner(&mut self) -> Result<Expr, CalculationError> {
        match self.peek() {
            Some(TokenKind::Minus) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(TokenKind::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, CalculationError> {
        let position = self.position();
        let Some(tok) = self.next() else {
            return Err(CalculationError::syntax(position, "unexpected end of formula"));
        };
        match tok.kind {
            TokenKind::Integer(v) => Ok(Expr::Number(v as f64)),
            TokenKind::Number(v) => Ok(Expr::Number(v)),
            TokenKind::LParen => {
                let inner = self.expr()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::Ident(name) => {
                let make: fn(i64) -> Reference = match name.as_str() {
                    "mp" => Reference::Point,
                    "vmp" => Reference::VirtualPoint,
                    other => {
                        return Err(CalculationError::syntax(
                            position,
                            format!("unknown name '{other}', only mp(id) and vmp(id) are allowed"),
                        ))
                    }
                };
                self.expect(TokenKind::LParen, &format!("'(' after {name}"))?;
                let id_position = self.position();
                let id = match self.next().map(|t| t.kind) {
                    Some(TokenKind::Integer(id)) => id,
                    _ => {
                        return Err(CalculationError::syntax(
                            id_position,
                            format!("{name}() expects a point id"),
                        ))
                    }
                };
                self.expect(TokenKind::RParen, "')'")?;
                Ok(Expr::Reference(make(id)))
            }
            _ => Err(CalculationError::syntax(position, "expected a number, '(' or a point reference")),
        }
    }
}

/// Intermediate result: formulas without references stay scalar until the end.
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl Value {
    fn map(self, f: impl Fn(f64) -> f64) -> Value {
        match self {
            Value::Scalar(a) => Value::Scalar(f(a)),
            Value::Vector(v) => Value::Vector(v.into_iter().map(f).collect()),
        }
    }

    fn combine(self, rhs: Value, op: BinaryOp) -> Result<Value, CalculationError> {
        if op == BinaryOp::Div {
            let zero = match &rhs {
                Value::Scalar(b) => *b == 0.0,
                Value::Vector(v) => v.iter().any(|b| *b == 0.0),
            };
            if zero {
                return Err(CalculationError::DivisionByZero);
            }
        }
        let apply = |a: f64, b: f64| match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
        };
        Ok(match (self, rhs) {
            (Value::Scalar(a), Value::Scalar(b)) => Value::Scalar(apply(a, b)),
            (Value::Scalar(a), Value::Vector(v)) => Value::Vector(v.into_iter().map(|b| apply(a, b)).collect()),
            (Value::Vector(v), Value::Scalar(b)) => Value::Vector(v.into_iter().map(|a| apply(a, b)).collect()),
            (Value::Vector(l), Value::Vector(r)) => {
                Value::Vector(l.into_iter().zip(r).map(|(a, b)| apply(a, b)).collect())
            }
        })
    }
}

impl Expr {
    pub fn parse(formula: &str) -> Result<Expr, CalculationError> {
        let tokens = tokenize(formula)?;
        if tokens.is_empty() {
            return Err(CalculationError::syntax(0, "empty formula"));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: formula.len(),
            depth: 0,
        };
        let expr = parser.expr()?;
        if parser.pos < parser.tokens.len() {
            return Err(CalculationError::syntax(parser.position(), "unexpected trailing input"));
        }
        Ok(expr)
    }

    /// Every reference in the expression, left to right, duplicates included.
    pub fn references(&self) -> Vec<Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references(&self, out: &mut Vec<Reference>) {
        match self {
            Expr::Number(_) => {}
            Expr::Reference(r) => out.push(*r),
            Expr::Neg(inner) => inner.collect_references(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_references(out);
                rhs.collect_references(out);
            }
        }
    }

    /// Evaluate to one value per bucket. `resolve` supplies the vector of a
    /// reference and must return `bucket_count` values; a scalar result is
    /// broadcast to `bucket_count`.
    pub fn evaluate<F>(&self, bucket_count: usize, resolve: &mut F) -> Result<Vec<f64>, CalculationError>
    where
        F: FnMut(Reference) -> Result<Vec<f64>, CalculationError>,
    {
        Ok(match self.value(resolve)? {
            Value::Scalar(s) => vec![s; bucket_count],
            Value::Vector(v) => v,
        })
    }

    fn value<F>(&self, resolve: &mut F) -> Result<Value, CalculationError>
    where
        F: FnMut(Reference) -> Result<Vec<f64>, CalculationError>,
    {
        match self {
            Expr::Number(v) => Ok(Value::Scalar(*v)),
            Expr::Reference(r) => Ok(Value::Vector(resolve(*r)?)),
            Expr::Neg(inner) => Ok(inner.value(resolve)?.map(|v| -v)),
            Expr::Binary { op, lhs, rhs } => {
                let l = lhs.value(resolve)?;
                let r = rhs.value(resolve)?;
                l.combine(r, *op)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn eval(formula: &str, n: usize) -> Result<Vec<f64>, CalculationError> {
        Expr::parse(formula)?.evaluate(n, &mut |r| match r {
            Reference::Point(7) => Ok(vec![1.0, 2.0, 3.0]),
            Reference::Point(8) => Ok(vec![10.0, 20.0, 30.0]),
            Reference::Point(0) => Ok(vec![0.0, 1.0, 2.0]),
            Reference::VirtualPoint(2) => Ok(vec![2.0, 2.0, 2.0]),
            Reference::Point(id) => Err(CalculationError::UnknownPoint(id)),
            Reference::VirtualPoint(id) => Err(CalculationError::UnknownVirtualPoint(id)),
        })
    }

    #[test]
    fn test_constant_is_broadcast() {
        assert_eq!(eval("2", 4).unwrap(), vec![2.0; 4]);
        assert_eq!(eval("1.5e1 / (2 + 1)", 2).unwrap(), vec![5.0, 5.0]);
    }

    #[test]
    fn test_references_are_element_wise() {
        assert_eq!(eval("mp(7) + mp(8)", 3).unwrap(), vec![11.0, 22.0, 33.0]);
        assert_eq!(eval("mp(8) - 2 * mp(7)", 3).unwrap(), vec![8.0, 16.0, 24.0]);
        assert_eq!(eval("(mp(8) - mp(7)) / vmp(2)", 3).unwrap(), vec![4.5, 9.0, 13.5]);
        assert_eq!(eval("-mp(7)", 3).unwrap(), vec![-1.0, -2.0, -3.0]);
    }

    #[test]
    fn test_precedence_and_whitespace() {
        assert_eq!(eval(" 1 + 2*3 ", 1).unwrap(), vec![7.0]);
        assert_eq!(eval("(1 + 2) * 3", 1).unwrap(), vec![9.0]);
        assert_eq!(eval("8 / 4 / 2", 1).unwrap(), vec![1.0]);
        assert_eq!(eval("2 - -1", 1).unwrap(), vec![3.0]);
        assert_eq!(eval("mp ( 7 ) * .5", 3).unwrap(), vec![0.5, 1.0, 1.5]);
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(eval("1 / 0", 1), Err(CalculationError::DivisionByZero));
        assert_eq!(eval("mp(7) / mp(0)", 3), Err(CalculationError::DivisionByZero));
    }

    #[test]
    fn test_unknown_reference_propagates() {
        assert_eq!(eval("mp(999999)", 3), Err(CalculationError::UnknownPoint(999999)));
        assert_eq!(eval("1 + vmp(5)", 3), Err(CalculationError::UnknownVirtualPoint(5)));
    }

    #[test]
    fn test_syntax_errors() {
        for bad in ["", "   ", "mp(1) +", "(1 + 2", "1 2", "mp(x)", "mp(1.5)", "foo(1)", "__import__('os')", "2 ** 3", "1;", "mp(7.0)", "vmp(7e0)", "mp(-1)"] {
            assert!(
                matches!(Expr::parse(bad), Err(CalculationError::Syntax { .. })),
                "expected syntax error for {bad:?}"
            );
        }
    }

    #[test]
    fn test_point_ids_are_plain_integers() {
        assert_eq!(Expr::parse("mp(007)").unwrap(), Expr::Reference(Reference::Point(7)));
        assert_eq!(eval("mp(7) * 2", 3).unwrap(), vec![2.0, 4.0, 6.0]);
        assert_eq!(eval("10 / 4", 1).unwrap(), vec![2.5]);
    }

    #[test]
    fn test_nesting_limit() {
        let nested = |depth: usize| format!("{}1{}", "(".repeat(depth), ")".repeat(depth));
        assert_eq!(eval(&nested(100), 3).unwrap(), vec![1.0; 3]);
        assert!(matches!(Expr::parse(&nested(MAX_NESTING + 1)), Err(CalculationError::Syntax { .. })));
        assert!(matches!(Expr::parse(&nested(5000)), Err(CalculationError::Syntax { .. })));
        assert!(matches!(Expr::parse(&"-".repeat(1000)), Err(CalculationError::Syntax { .. })));
    }

    #[test]
    fn test_token_limit() {
        let long = vec!["1"; MAX_TOKENS / 2 + 1].join("+");
        assert!(matches!(Expr::parse(&long), Err(CalculationError::Syntax { .. })));
        let fits = vec!["1"; 500].join("+");
        assert_eq!(eval(&fits, 1).unwrap(), vec![500.0]);
    }

    #[test]
    fn test_syntax_error_position() {
        match Expr::parse("mp(1) + $") {
            Err(CalculationError::Syntax { position, .. }) => assert_eq!(position, 8),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_references_in_order() {
        let expr = Expr::parse("vmp(3) + mp(1) * (mp(2) - vmp(3))").unwrap();
        assert_eq!(
            expr.references(),
            vec![
                Reference::VirtualPoint(3),
                Reference::Point(1),
                Reference::Point(2),
                Reference::VirtualPoint(3),
            ]
        );
    }
}
