//! Expression Generator Engine
//!
//! A small pure expression language over the other fields of a message:
//! arithmetic, comparisons, the conditional operator and a fixed
//! whitelist of math and random helpers. Formulas are parsed once at
//! load into an AST whose variable references are resolved to integer
//! slots, so evaluation never touches string keys.
//!
//! Identifiers name a field of the same message (`airspeed`), a
//! qualified field (`NAV.altitude`), or the builtins `time` and
//! `message_count`. Message names containing spaces are accepted when
//! the leading words resolve to a known message (`Engine Data.rpm`).
//!
//! Division by zero and math domain errors are not fatal: they evaluate
//! to 0 and raise a warning.

use super::EvalContext;
use rand::Rng;
use thiserror::Error;

/// Errors raised while parsing or resolving a formula.
#[derive(Debug, Clone, Error)]
pub enum ExprError {
    #[error("parse error at column {column}: {message}")]
    Parse { column: usize, message: String },

    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("{name}() takes {expected} argument(s), got {got}")]
    Arity {
        name: &'static str,
        expected: &'static str,
        got: usize,
    },
}

/// Resolves identifiers against the ICD during compilation.
pub trait Resolver {
    /// Name of the message the formula belongs to.
    fn message_name(&self) -> &str;
    /// Field index within the owning message.
    fn resolve_local(&self, field: &str) -> Option<usize>;
    /// `(message index, field index)` of a field in another message.
    fn resolve_cross(&self, message: &str, field: &str) -> Option<(usize, usize)>;
}

/// A compiled formula plus its source text for diagnostics.
#[derive(Debug, Clone)]
pub struct ExprProgram {
    expr: Expr,
    source: String,
}

impl ExprProgram {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn eval(&self, ctx: &mut EvalContext<'_>) -> f64 {
        self.expr.eval(ctx)
    }
}

/// Compile a formula. Returns the program and the local field indices it
/// reads, for dependency ordering.
pub fn compile(
    source: &str,
    resolver: &dyn Resolver,
) -> Result<(ExprProgram, Vec<usize>), ExprError> {
    let tokens = lex(source)?;
    let raw = Parser::new(tokens).parse()?;
    let mut deps = Vec::new();
    let expr = resolve(raw, resolver, &mut deps)?;
    deps.sort_unstable();
    deps.dedup();
    Ok((
        ExprProgram {
            expr,
            source: source.to_string(),
        },
        deps,
    ))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum UnaryOp {
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Func {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Exp,
    Log,
    Log10,
    Sqrt,
    Pow,
    Abs,
    Sign,
    Floor,
    Ceil,
    Round,
    Min,
    Max,
    Clamp,
    Int,
    Float,
    Bool,
    Random,
    RandomNormal,
    RandomInt,
}

impl Func {
    fn lookup(name: &str) -> Option<Func> {
        Some(match name {
            "sin" => Func::Sin,
            "cos" => Func::Cos,
            "tan" => Func::Tan,
            "asin" => Func::Asin,
            "acos" => Func::Acos,
            "atan" => Func::Atan,
            "sinh" => Func::Sinh,
            "cosh" => Func::Cosh,
            "tanh" => Func::Tanh,
            "exp" => Func::Exp,
            "log" => Func::Log,
            "log10" => Func::Log10,
            "sqrt" => Func::Sqrt,
            "pow" => Func::Pow,
            "abs" => Func::Abs,
            "sign" => Func::Sign,
            "floor" => Func::Floor,
            "ceil" => Func::Ceil,
            "round" => Func::Round,
            "min" => Func::Min,
            "max" => Func::Max,
            "clamp" => Func::Clamp,
            "int" => Func::Int,
            "float" => Func::Float,
            "bool" => Func::Bool,
            "random" => Func::Random,
            "random_normal" => Func::RandomNormal,
            "random_int" => Func::RandomInt,
            _ => return None,
        })
    }

    fn check_arity(self, name: &'static str, got: usize) -> Result<(), ExprError> {
        let expected: &'static str = match self {
            Func::Random => "0 or 2",
            Func::Pow | Func::Min | Func::Max | Func::RandomNormal | Func::RandomInt => "2",
            Func::Clamp => "3",
            _ => "1",
        };
        let ok = match self {
            Func::Random => got == 0 || got == 2,
            Func::Pow | Func::Min | Func::Max | Func::RandomNormal | Func::RandomInt => got == 2,
            Func::Clamp => got == 3,
            _ => got == 1,
        };
        if ok {
            Ok(())
        } else {
            Err(ExprError::Arity {
                name,
                expected,
                got,
            })
        }
    }
}

/// Parsed but unresolved AST.
#[derive(Debug, Clone, PartialEq)]
enum RawExpr {
    Number(f64),
    Ident(String),
    Dotted(String, String),
    Unary(UnaryOp, Box<RawExpr>),
    Binary(BinOp, Box<RawExpr>, Box<RawExpr>),
    Ternary(Box<RawExpr>, Box<RawExpr>, Box<RawExpr>),
    Call(String, Vec<RawExpr>),
}

/// Resolved AST: variable references are slot indices.
#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Time,
    MessageCount,
    Local(usize),
    Cross(usize, usize),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
    Dot,
    Question,
    Colon,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    Ne,
}

fn lex(source: &str) -> Result<Vec<(Token, usize)>, ExprError> {
    let mut tokens = Vec::new();
    let bytes: Vec<char> = source.chars().collect();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        let column = i;
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                i += 1;
            }
            '+' => {
                tokens.push((Token::Plus, column));
                i += 1;
            }
            '-' => {
                tokens.push((Token::Minus, column));
                i += 1;
            }
            '*' => {
                tokens.push((Token::Star, column));
                i += 1;
            }
            '/' => {
                tokens.push((Token::Slash, column));
                i += 1;
            }
            '(' => {
                tokens.push((Token::LParen, column));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, column));
                i += 1;
            }
            ',' => {
                tokens.push((Token::Comma, column));
                i += 1;
            }
            '.' if i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() => {
                // leading-dot number like .5
                let (value, next) = lex_number(&bytes, i, column)?;
                tokens.push((Token::Number(value), column));
                i = next;
            }
            '.' => {
                tokens.push((Token::Dot, column));
                i += 1;
            }
            '?' => {
                tokens.push((Token::Question, column));
                i += 1;
            }
            ':' => {
                tokens.push((Token::Colon, column));
                i += 1;
            }
            '<' => {
                if bytes.get(i + 1) == Some(&'=') {
                    tokens.push((Token::Le, column));
                    i += 2;
                } else {
                    tokens.push((Token::Lt, column));
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&'=') {
                    tokens.push((Token::Ge, column));
                    i += 2;
                } else {
                    tokens.push((Token::Gt, column));
                    i += 1;
                }
            }
            '=' => {
                if bytes.get(i + 1) == Some(&'=') {
                    tokens.push((Token::EqEq, column));
                    i += 2;
                } else {
                    return Err(ExprError::Parse {
                        column,
                        message: "single '=' is not an operator, use '=='".into(),
                    });
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&'=') {
                    tokens.push((Token::Ne, column));
                    i += 2;
                } else {
                    return Err(ExprError::Parse {
                        column,
                        message: "unexpected '!'".into(),
                    });
                }
            }
            c if c.is_ascii_digit() => {
                let (value, next) = lex_number(&bytes, i, column)?;
                tokens.push((Token::Number(value), column));
                i = next;
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = i;
                while end < bytes.len() && (bytes[end].is_alphanumeric() || bytes[end] == '_') {
                    end += 1;
                }
                tokens.push((Token::Ident(bytes[i..end].iter().collect()), column));
                i = end;
            }
            other => {
                return Err(ExprError::Parse {
                    column,
                    message: format!("unexpected character '{}'", other),
                })
            }
        }
    }
    Ok(tokens)
}

fn lex_number(chars: &[char], start: usize, column: usize) -> Result<(f64, usize), ExprError> {
    let mut end = start;
    while end < chars.len()
        && (chars[end].is_ascii_digit()
            || chars[end] == '.'
            || chars[end] == 'e'
            || chars[end] == 'E'
            || ((chars[end] == '+' || chars[end] == '-')
                && matches!(chars.get(end.wrapping_sub(1)), Some(&'e') | Some(&'E'))))
    {
        end += 1;
    }
    let text: String = chars[start..end].iter().collect();
    text.parse().map(|v| (v, end)).map_err(|_| ExprError::Parse {
        column,
        message: format!("malformed number '{}'", text),
    })
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    index: usize,
}

impl Parser {
    fn new(tokens: Vec<(Token, usize)>) -> Self {
        Self { tokens, index: 0 }
    }

    fn parse(mut self) -> Result<RawExpr, ExprError> {
        let expr = self.parse_ternary()?;
        if let Some((_, column)) = self.tokens.get(self.index) {
            return Err(ExprError::Parse {
                column: *column,
                message: "unexpected trailing tokens".into(),
            });
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.index).map(|(t, _)| t)
    }

    fn column(&self) -> usize {
        self.tokens
            .get(self.index)
            .or_else(|| self.tokens.last())
            .map(|(_, c)| *c)
            .unwrap_or(0)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.index).map(|(t, _)| t.clone());
        if token.is_some() {
            self.index += 1;
        }
        token
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), ExprError> {
        if self.peek() == Some(&token) {
            self.index += 1;
            Ok(())
        } else {
            Err(ExprError::Parse {
                column: self.column(),
                message: format!("expected {}", what),
            })
        }
    }

    fn parse_ternary(&mut self) -> Result<RawExpr, ExprError> {
        let cond = self.parse_comparison()?;
        if self.peek() == Some(&Token::Question) {
            self.index += 1;
            let then_expr = self.parse_ternary()?;
            self.expect(Token::Colon, "':' in conditional expression")?;
            let else_expr = self.parse_ternary()?;
            return Ok(RawExpr::Ternary(
                Box::new(cond),
                Box::new(then_expr),
                Box::new(else_expr),
            ));
        }
        Ok(cond)
    }

    fn parse_comparison(&mut self) -> Result<RawExpr, ExprError> {
        let mut node = self.parse_sum()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::Ne) => BinOp::Ne,
                _ => break,
            };
            self.index += 1;
            let right = self.parse_sum()?;
            node = RawExpr::Binary(op, Box::new(node), Box::new(right));
        }
        Ok(node)
    }

    fn parse_sum(&mut self) -> Result<RawExpr, ExprError> {
        let mut node = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.index += 1;
            let right = self.parse_term()?;
            node = RawExpr::Binary(op, Box::new(node), Box::new(right));
        }
        Ok(node)
    }

    fn parse_term(&mut self) -> Result<RawExpr, ExprError> {
        let mut node = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => break,
            };
            self.index += 1;
            let right = self.parse_unary()?;
            node = RawExpr::Binary(op, Box::new(node), Box::new(right));
        }
        Ok(node)
    }

    fn parse_unary(&mut self) -> Result<RawExpr, ExprError> {
        if self.peek() == Some(&Token::Minus) {
            self.index += 1;
            let inner = self.parse_unary()?;
            return Ok(RawExpr::Unary(UnaryOp::Neg, Box::new(inner)));
        }
        if self.peek() == Some(&Token::Plus) {
            self.index += 1;
            return self.parse_unary();
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<RawExpr, ExprError> {
        let column = self.column();
        match self.advance() {
            Some(Token::Number(value)) => Ok(RawExpr::Number(value)),
            Some(Token::LParen) => {
                let inner = self.parse_ternary()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::Ident(first)) => self.parse_name(first),
            Some(other) => Err(ExprError::Parse {
                column,
                message: format!("unexpected token {:?}", other),
            }),
            None => Err(ExprError::Parse {
                column,
                message: "unexpected end of expression".into(),
            }),
        }
    }

    /// An identifier sequence: a call `name(...)`, a qualified reference
    /// `Message Name.field` (consecutive identifiers joined by spaces),
    /// or a plain field name.
    fn parse_name(&mut self, first: String) -> Result<RawExpr, ExprError> {
        if self.peek() == Some(&Token::LParen) {
            self.index += 1;
            let mut args = Vec::new();
            if self.peek() != Some(&Token::RParen) {
                args.push(self.parse_ternary()?);
                while self.peek() == Some(&Token::Comma) {
                    self.index += 1;
                    args.push(self.parse_ternary()?);
                }
            }
            self.expect(Token::RParen, "')' after arguments")?;
            return Ok(RawExpr::Call(first, args));
        }

        let mut name = first;
        while let Some(Token::Ident(_)) = self.peek() {
            let Some(Token::Ident(part)) = self.advance() else {
                unreachable!()
            };
            name.push(' ');
            name.push_str(&part);
        }

        if self.peek() == Some(&Token::Dot) {
            self.index += 1;
            let column = self.column();
            match self.advance() {
                Some(Token::Ident(field)) => Ok(RawExpr::Dotted(name, field)),
                _ => Err(ExprError::Parse {
                    column,
                    message: "expected field name after '.'".into(),
                }),
            }
        } else if name.contains(' ') {
            Err(ExprError::Parse {
                column: self.column(),
                message: format!("'{}' must qualify a field as 'message.field'", name),
            })
        } else {
            Ok(RawExpr::Ident(name))
        }
    }
}

fn resolve(
    raw: RawExpr,
    resolver: &dyn Resolver,
    deps: &mut Vec<usize>,
) -> Result<Expr, ExprError> {
    Ok(match raw {
        RawExpr::Number(v) => Expr::Number(v),
        RawExpr::Ident(name) => match name.as_str() {
            "time" => Expr::Time,
            "message_count" => Expr::MessageCount,
            _ => {
                let idx = resolver
                    .resolve_local(&name)
                    .ok_or(ExprError::UnknownIdentifier(name))?;
                deps.push(idx);
                Expr::Local(idx)
            }
        },
        RawExpr::Dotted(message, field) => {
            if message == resolver.message_name() {
                let idx = resolver
                    .resolve_local(&field)
                    .ok_or_else(|| ExprError::UnknownIdentifier(format!("{}.{}", message, field)))?;
                deps.push(idx);
                Expr::Local(idx)
            } else {
                let (m, f) = resolver
                    .resolve_cross(&message, &field)
                    .ok_or_else(|| ExprError::UnknownIdentifier(format!("{}.{}", message, field)))?;
                Expr::Cross(m, f)
            }
        }
        RawExpr::Unary(op, inner) => Expr::Unary(op, Box::new(resolve(*inner, resolver, deps)?)),
        RawExpr::Binary(op, left, right) => Expr::Binary(
            op,
            Box::new(resolve(*left, resolver, deps)?),
            Box::new(resolve(*right, resolver, deps)?),
        ),
        RawExpr::Ternary(cond, then_expr, else_expr) => Expr::Ternary(
            Box::new(resolve(*cond, resolver, deps)?),
            Box::new(resolve(*then_expr, resolver, deps)?),
            Box::new(resolve(*else_expr, resolver, deps)?),
        ),
        RawExpr::Call(name, args) => {
            let func =
                Func::lookup(&name).ok_or_else(|| ExprError::UnknownFunction(name.clone()))?;
            let static_name = func_name(func);
            func.check_arity(static_name, args.len())?;
            let mut resolved = Vec::with_capacity(args.len());
            for arg in args {
                resolved.push(resolve(arg, resolver, deps)?);
            }
            Expr::Call(func, resolved)
        }
    })
}

fn func_name(func: Func) -> &'static str {
    match func {
        Func::Sin => "sin",
        Func::Cos => "cos",
        Func::Tan => "tan",
        Func::Asin => "asin",
        Func::Acos => "acos",
        Func::Atan => "atan",
        Func::Sinh => "sinh",
        Func::Cosh => "cosh",
        Func::Tanh => "tanh",
        Func::Exp => "exp",
        Func::Log => "log",
        Func::Log10 => "log10",
        Func::Sqrt => "sqrt",
        Func::Pow => "pow",
        Func::Abs => "abs",
        Func::Sign => "sign",
        Func::Floor => "floor",
        Func::Ceil => "ceil",
        Func::Round => "round",
        Func::Min => "min",
        Func::Max => "max",
        Func::Clamp => "clamp",
        Func::Int => "int",
        Func::Float => "float",
        Func::Bool => "bool",
        Func::Random => "random",
        Func::RandomNormal => "random_normal",
        Func::RandomInt => "random_int",
    }
}

impl Expr {
    fn eval(&self, ctx: &mut EvalContext<'_>) -> f64 {
        match self {
            Expr::Number(v) => *v,
            Expr::Time => ctx.time_s,
            Expr::MessageCount => ctx.message_count as f64,
            Expr::Local(idx) => ctx.locals[*idx],
            Expr::Cross(m, f) => ctx.cross.get(*m, *f),
            Expr::Unary(UnaryOp::Neg, inner) => -inner.eval(ctx),
            Expr::Binary(op, left, right) => {
                let a = left.eval(ctx);
                let b = right.eval(ctx);
                match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => {
                        if b == 0.0 {
                            ctx.warnings
                                .record("DIV_BY_ZERO", || format!("{} / 0 evaluates to 0", a));
                            0.0
                        } else {
                            a / b
                        }
                    }
                    BinOp::Lt => truth(a < b),
                    BinOp::Le => truth(a <= b),
                    BinOp::Gt => truth(a > b),
                    BinOp::Ge => truth(a >= b),
                    BinOp::Eq => truth(a == b),
                    BinOp::Ne => truth(a != b),
                }
            }
            Expr::Ternary(cond, then_expr, else_expr) => {
                if cond.eval(ctx) != 0.0 {
                    then_expr.eval(ctx)
                } else {
                    else_expr.eval(ctx)
                }
            }
            Expr::Call(func, args) => eval_call(*func, args, ctx),
        }
    }
}

fn eval_call(func: Func, args: &[Expr], ctx: &mut EvalContext<'_>) -> f64 {
    match func {
        Func::Sin => args[0].eval(ctx).sin(),
        Func::Cos => args[0].eval(ctx).cos(),
        Func::Tan => args[0].eval(ctx).tan(),
        Func::Asin => {
            let x = args[0].eval(ctx);
            domain_checked(x, f64::asin, ctx, "asin")
        }
        Func::Acos => {
            let x = args[0].eval(ctx);
            domain_checked(x, f64::acos, ctx, "acos")
        }
        Func::Atan => args[0].eval(ctx).atan(),
        Func::Sinh => args[0].eval(ctx).sinh(),
        Func::Cosh => args[0].eval(ctx).cosh(),
        Func::Tanh => args[0].eval(ctx).tanh(),
        Func::Exp => args[0].eval(ctx).exp(),
        Func::Log => {
            let x = args[0].eval(ctx);
            if x <= 0.0 {
                ctx.warnings
                    .record("MATH_DOMAIN", || format!("log({}) evaluates to 0", x));
                0.0
            } else {
                x.ln()
            }
        }
        Func::Log10 => {
            let x = args[0].eval(ctx);
            if x <= 0.0 {
                ctx.warnings
                    .record("MATH_DOMAIN", || format!("log10({}) evaluates to 0", x));
                0.0
            } else {
                x.log10()
            }
        }
        Func::Sqrt => {
            let x = args[0].eval(ctx);
            if x < 0.0 {
                ctx.warnings
                    .record("MATH_DOMAIN", || format!("sqrt({}) evaluates to 0", x));
                0.0
            } else {
                x.sqrt()
            }
        }
        Func::Pow => {
            let base = args[0].eval(ctx);
            let exponent = args[1].eval(ctx);
            let result = base.powf(exponent);
            if result.is_nan() {
                ctx.warnings
                    .record("MATH_DOMAIN", || "pow() domain error evaluates to 0".into());
                0.0
            } else {
                result
            }
        }
        Func::Abs => args[0].eval(ctx).abs(),
        Func::Sign => {
            let x = args[0].eval(ctx);
            if x == 0.0 {
                0.0
            } else {
                x.signum()
            }
        }
        Func::Floor => args[0].eval(ctx).floor(),
        Func::Ceil => args[0].eval(ctx).ceil(),
        Func::Round => args[0].eval(ctx).round(),
        Func::Min => {
            let a = args[0].eval(ctx);
            let b = args[1].eval(ctx);
            a.min(b)
        }
        Func::Max => {
            let a = args[0].eval(ctx);
            let b = args[1].eval(ctx);
            a.max(b)
        }
        Func::Clamp => {
            let x = args[0].eval(ctx);
            let lo = args[1].eval(ctx);
            let hi = args[2].eval(ctx);
            if lo <= hi {
                x.clamp(lo, hi)
            } else {
                ctx.warnings
                    .record("MATH_DOMAIN", || format!("clamp bounds [{}, {}] inverted", lo, hi));
                x
            }
        }
        Func::Int => args[0].eval(ctx).trunc(),
        Func::Float => args[0].eval(ctx),
        Func::Bool => truth(args[0].eval(ctx) != 0.0),
        Func::Random => {
            if args.is_empty() {
                ctx.rng.gen::<f64>()
            } else {
                let lo = args[0].eval(ctx);
                let hi = args[1].eval(ctx);
                if hi > lo {
                    ctx.rng.gen_range(lo..=hi)
                } else {
                    lo
                }
            }
        }
        Func::RandomNormal => {
            let mean = args[0].eval(ctx);
            let std_dev = args[1].eval(ctx);
            if std_dev <= 0.0 {
                ctx.warnings.record("MATH_DOMAIN", || {
                    format!("random_normal std dev {} evaluates to mean", std_dev)
                });
                mean
            } else {
                // Box-Muller from two uniforms of the field's stream
                let u1: f64 = ctx.rng.gen::<f64>().max(1e-300);
                let u2: f64 = ctx.rng.gen();
                mean + std_dev * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
            }
        }
        Func::RandomInt => {
            let lo = args[0].eval(ctx).round() as i64;
            let hi = args[1].eval(ctx).round() as i64;
            if hi > lo {
                ctx.rng.gen_range(lo..=hi) as f64
            } else {
                lo as f64
            }
        }
    }
}

fn truth(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

fn domain_checked(
    x: f64,
    f: fn(f64) -> f64,
    ctx: &mut EvalContext<'_>,
    name: &'static str,
) -> f64 {
    if !(-1.0..=1.0).contains(&x) {
        ctx.warnings
            .record("MATH_DOMAIN", || format!("{}({}) evaluates to 0", name, x));
        0.0
    } else {
        f(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{CrossValues, WarningSink};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Scope;

    impl Resolver for Scope {
        fn message_name(&self) -> &str {
            "NAV"
        }
        fn resolve_local(&self, field: &str) -> Option<usize> {
            match field {
                "a" => Some(0),
                "b" => Some(1),
                "airspeed" => Some(2),
                _ => None,
            }
        }
        fn resolve_cross(&self, message: &str, field: &str) -> Option<(usize, usize)> {
            match (message, field) {
                ("ENGINE", "rpm") => Some((1, 0)),
                ("Engine Data", "egt") => Some((2, 3)),
                _ => None,
            }
        }
    }

    fn eval(source: &str, locals: &[f64]) -> f64 {
        eval_with(source, locals, &mut WarningSink::default())
    }

    fn eval_with(source: &str, locals: &[f64], warnings: &mut WarningSink) -> f64 {
        let (program, _) = compile(source, &Scope).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let mut cross = CrossValues::new(&[0, 1, 4]);
        cross.set(1, 0, 2200.0);
        cross.set(2, 3, 650.0);
        let mut ctx = EvalContext {
            time_s: 2.0,
            message_count: 7,
            rng: &mut rng,
            locals,
            cross: &cross,
            warnings,
        };
        program.eval(&mut ctx)
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(eval("1 + 2 * 3", &[]), 7.0);
        assert_eq!(eval("(1 + 2) * 3", &[]), 9.0);
        assert_eq!(eval("-2 * 3", &[]), -6.0);
        assert_eq!(eval("10 / 4", &[]), 2.5);
    }

    #[test]
    fn test_local_references_and_deps() {
        let (_, deps) = compile("a * 2 + b", &Scope).unwrap();
        assert_eq!(deps, vec![0, 1]);
        assert_eq!(eval("a * 2 + b", &[3.0, 4.0]), 10.0);
    }

    #[test]
    fn test_self_qualified_is_local() {
        let (_, deps) = compile("NAV.a + 1", &Scope).unwrap();
        assert_eq!(deps, vec![0]);
    }

    #[test]
    fn test_cross_message_reference() {
        let (_, deps) = compile("ENGINE.rpm / 100", &Scope).unwrap();
        assert!(deps.is_empty(), "cross references are not local deps");
        assert_eq!(eval("ENGINE.rpm / 100", &[]), 22.0);
    }

    #[test]
    fn test_message_name_with_spaces() {
        assert_eq!(eval("Engine Data.egt - 50", &[]), 600.0);
    }

    #[test]
    fn test_builtins() {
        assert_eq!(eval("time * 10", &[]), 20.0);
        assert_eq!(eval("message_count + 1", &[]), 8.0);
    }

    #[test]
    fn test_ternary_and_comparison() {
        assert_eq!(eval("a > 5 ? 1 : 2", &[10.0, 0.0]), 1.0);
        assert_eq!(eval("a > 5 ? 1 : 2", &[1.0, 0.0]), 2.0);
        assert_eq!(eval("a == 3", &[3.0, 0.0]), 1.0);
        assert_eq!(eval("a != 3", &[3.0, 0.0]), 0.0);
    }

    #[test]
    fn test_function_calls() {
        assert!((eval("sin(0)", &[])).abs() < 1e-12);
        assert_eq!(eval("max(3, 9)", &[]), 9.0);
        assert_eq!(eval("clamp(15, 0, 10)", &[]), 10.0);
        assert_eq!(eval("pow(2, 10)", &[]), 1024.0);
        assert_eq!(eval("int(3.9)", &[]), 3.0);
        assert_eq!(eval("sign(-4)", &[]), -1.0);
        assert_eq!(eval("bool(0.5)", &[]), 1.0);
    }

    #[test]
    fn test_division_by_zero_warns() {
        let mut warnings = WarningSink::default();
        assert_eq!(eval_with("1 / 0", &[], &mut warnings), 0.0);
        assert_eq!(warnings.counts().get("DIV_BY_ZERO"), Some(&1));
    }

    #[test]
    fn test_math_domain_warns() {
        let mut warnings = WarningSink::default();
        assert_eq!(eval_with("sqrt(-1)", &[], &mut warnings), 0.0);
        assert_eq!(eval_with("log(0)", &[], &mut warnings), 0.0);
        assert_eq!(eval_with("asin(2)", &[], &mut warnings), 0.0);
        assert_eq!(warnings.counts().get("MATH_DOMAIN"), Some(&3));
    }

    #[test]
    fn test_random_in_bounds() {
        for _ in 0..10 {
            let v = eval("random(5, 6)", &[]);
            assert!((5.0..=6.0).contains(&v));
            let v = eval("random_int(1, 3)", &[]);
            assert!((1.0..=3.0).contains(&v) && v.fract() == 0.0);
        }
    }

    #[test]
    fn test_unknown_identifier() {
        assert!(matches!(
            compile("altitude + 1", &Scope),
            Err(ExprError::UnknownIdentifier(_))
        ));
        assert!(matches!(
            compile("GHOST.x", &Scope),
            Err(ExprError::UnknownIdentifier(_))
        ));
    }

    #[test]
    fn test_unknown_function() {
        assert!(matches!(
            compile("eval(1)", &Scope),
            Err(ExprError::UnknownFunction(_))
        ));
    }

    #[test]
    fn test_arity_errors() {
        assert!(matches!(compile("sin()", &Scope), Err(ExprError::Arity { .. })));
        assert!(matches!(
            compile("pow(2)", &Scope),
            Err(ExprError::Arity { .. })
        ));
        assert!(matches!(
            compile("random(1)", &Scope),
            Err(ExprError::Arity { .. })
        ));
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["1 +", "(1", "a ? 1", "2 $ 3", "= 1", "Engine Data"] {
            assert!(
                matches!(compile(bad, &Scope), Err(ExprError::Parse { .. })),
                "accepted: {}",
                bad
            );
        }
    }

    #[test]
    fn test_scientific_notation() {
        assert_eq!(eval("1.5e3", &[]), 1500.0);
        assert_eq!(eval("2E-2", &[]), 0.02);
        assert_eq!(eval(".5 * 4", &[]), 2.0);
    }
}
