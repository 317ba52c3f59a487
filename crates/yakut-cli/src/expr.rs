//! Arithmetic expressions embedded in YAML documents with the `!$` tag.
//!
//! The syntax is infix, from loosest to tightest: `or`, `and`, `not`,
//! comparisons, `+ -`, `* / // %`, unary signs, and the right-associative
//! `**`; `//` and `%` round toward negative infinity. Names are
//! resolved through an [`Environment`] first and then against the math
//! constants; calls likewise go to the environment before the built-in math,
//! random and time functions. Prefixes such as `math.` are accepted and ignored.

use std::cmp::Ordering::{Equal, Greater, Less};
use std::f64::consts;
use std::fmt;
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while},
    character::complete::{alpha1, alphanumeric1, char, digit0, digit1, hex_digit1, multispace0, one_of, satisfy},
    combinator::{eof, map, not, opt, recognize, value, verify},
    multi::{many0, separated_list0, separated_list1},
    sequence::{delimited, pair, preceded, terminated},
};
use rand::Rng;
use serde_json::Value;
use thiserror::Error;

type Input<'a> = &'a str;
type PError<'a> = nom::error::Error<Input<'a>>;

/// Failure to parse or evaluate an expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    /// The text is not a valid expression.
    #[error("invalid expression {text:?}: {message}")]
    Syntax {
        /// The expression.
        text: String,
        /// Parser diagnostics.
        message: String,
    },
    /// A name is not defined.
    #[error("name {0:?} is not defined")]
    UnknownName(String),
    /// A function is not defined.
    #[error("function {0:?} is not defined")]
    UnknownFunction(String),
    /// Operands or arguments of the wrong type or count.
    #[error("{0}")]
    Type(String),
    /// Division or modulo by zero.
    #[error("division by zero")]
    ZeroDivision,
}

/// A value produced by evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Val {
    /// Any number; integers are represented exactly up to 2^53.
    Num(f64),
    /// A boolean.
    Bool(bool),
    /// A string.
    Str(String),
    /// A list.
    List(Vec<Val>),
}

const EXACT_INT_LIMIT: f64 = 9_007_199_254_740_992.0;

impl Val {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Num(_) => "number",
            Self::Bool(_) => "bool",
            Self::Str(_) => "str",
            Self::List(_) => "list",
        }
    }

    /// The numeric value; booleans count as 0 and 1.
    ///
    /// # Errors
    ///
    /// Strings and lists are not numbers.
    pub fn as_num(&self) -> Result<f64, EvalError> {
        match self {
            Self::Num(x) => Ok(*x),
            Self::Bool(b) => Ok(f64::from(u8::from(*b))),
            other => Err(EvalError::Type(format!("expected a number, got {}", other.type_name()))),
        }
    }

    /// Truthiness in the usual sense: zero and empty are false.
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Self::Num(x) => *x != 0.0,
            Self::Bool(b) => *b,
            Self::Str(s) => !s.is_empty(),
            Self::List(v) => !v.is_empty(),
        }
    }

    /// The builtin form; integral numbers become JSON integers.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Num(x) if x.fract() == 0.0 && x.abs() < EXACT_INT_LIMIT => Value::from(*x as i64),
            Self::Num(x) => Value::from(*x),
            Self::Bool(b) => Value::Bool(*b),
            Self::Str(s) => Value::String(s.clone()),
            Self::List(v) => Value::Array(v.iter().map(Self::to_json).collect()),
        }
    }
}

impl From<f64> for Val {
    fn from(x: f64) -> Self {
        Self::Num(x)
    }
}

impl From<bool> for Val {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Variables and functions supplied by the caller.
pub trait Environment {
    /// Value of a variable, if defined.
    fn variable(&self, _name: &str) -> Option<Val> {
        None
    }

    /// Result of a call, if the function is defined.
    fn call(&self, _name: &str, _args: &[Val]) -> Option<Result<Val, EvalError>> {
        None
    }
}

/// No variables, no extra functions.
impl Environment for () {}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// `or`
    Or,
    /// `and`
    And,
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `//`
    FloorDiv,
    /// `%`
    Mod,
    /// `**`
    Pow,
}

/// Comparison operators; chains like `a < b < c` are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Numeric literal.
    Num(f64),
    /// String literal.
    Str(String),
    /// `True` or `False`.
    Bool(bool),
    /// Variable or constant.
    Name(String),
    /// `[a, b, ...]`
    List(Vec<Expr>),
    /// `f(a, b, ...)`
    Call(String, Vec<Expr>),
    /// `-a`
    Neg(Box<Expr>),
    /// `not a`
    Not(Box<Expr>),
    /// `a op b`
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// `a < b <= c ...`
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
    /// `a if cond else b`
    IfElse {
        /// Condition.
        cond: Box<Expr>,
        /// Value when true.
        then: Box<Expr>,
        /// Value when false.
        otherwise: Box<Expr>,
    },
}

const RESERVED: [&str; 7] = ["and", "or", "not", "if", "else", "True", "False"];
const IGNORED_PREFIXES: [&str; 3] = ["math.", "random.", "time."];

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn symbol<'a>(s: &'static str) -> impl Parser<Input<'a>, Output = Input<'a>, Error = PError<'a>> {
    preceded(multispace0, tag(s))
}

fn keyword<'a>(kw: &'static str) -> impl Parser<Input<'a>, Output = Input<'a>, Error = PError<'a>> {
    preceded(multispace0, terminated(tag(kw), not(satisfy(is_ident_char))))
}

fn identifier(input: Input<'_>) -> IResult<Input<'_>, Input<'_>> {
    recognize(pair(alt((alpha1, tag("_"))), many0(alt((alphanumeric1, tag("_")))))).parse(input)
}

fn dotted_name(input: Input<'_>) -> IResult<Input<'_>, Input<'_>> {
    verify(recognize(separated_list1(char('.'), identifier)), |s: &str| {
        !RESERVED.contains(&s)
    })
    .parse(input)
}

fn canonical(name: &str) -> String {
    IGNORED_PREFIXES
        .iter()
        .find_map(|p| name.strip_prefix(p))
        .unwrap_or(name)
        .to_owned()
}

#[allow(clippy::cast_precision_loss)]
fn number(input: Input<'_>) -> IResult<Input<'_>, Expr> {
    let mut hex = preceded(tag_no_case("0x"), hex_digit1::<_, PError<'_>>);
    if let Ok((rest, digits)) = hex.parse(input) {
        return u64::from_str_radix(digits, 16).map_or_else(
            |_| Err(nom::Err::Error(PError::new(input, nom::error::ErrorKind::HexDigit))),
            |n| Ok((rest, Expr::Num(n as f64))),
        );
    }
    let mantissa = alt((
        recognize((digit1, opt((char('.'), digit0)))),
        recognize((char('.'), digit1)),
    ));
    let exponent = opt((one_of("eE"), opt(one_of("+-")), digit1));
    let (rest, text) = recognize((mantissa, exponent)).parse(input)?;
    text.parse::<f64>().map_or_else(
        |_| Err(nom::Err::Error(PError::new(input, nom::error::ErrorKind::Float))),
        |x| Ok((rest, Expr::Num(x))),
    )
}

fn string_literal(input: Input<'_>) -> IResult<Input<'_>, String> {
    let double = delimited(char('"'), take_while(|c| c != '"'), char('"'));
    let single = delimited(char('\''), take_while(|c| c != '\''), char('\''));
    map(alt((double, single)), str::to_owned).parse(input)
}

fn arguments(input: Input<'_>) -> IResult<Input<'_>, Vec<Expr>> {
    terminated(separated_list0(symbol(","), expression), opt(symbol(","))).parse(input)
}

fn call_or_name(input: Input<'_>) -> IResult<Input<'_>, Expr> {
    let (input, name) = dotted_name(input)?;
    let (input, args) = opt(delimited(symbol("("), arguments, symbol(")"))).parse(input)?;
    let name = canonical(name);
    Ok((input, args.map_or_else(|| Expr::Name(name.clone()), |a| Expr::Call(name.clone(), a))))
}

fn atom(input: Input<'_>) -> IResult<Input<'_>, Expr> {
    preceded(
        multispace0,
        alt((
            number,
            map(string_literal, Expr::Str),
            value(Expr::Bool(true), keyword("True")),
            value(Expr::Bool(false), keyword("False")),
            call_or_name,
            delimited(char('('), expression, symbol(")")),
            map(delimited(char('['), arguments, symbol("]")), Expr::List),
        )),
    )
    .parse(input)
}

fn power(input: Input<'_>) -> IResult<Input<'_>, Expr> {
    let (input, base) = atom(input)?;
    let (input, exp) = opt(preceded(symbol("**"), unary)).parse(input)?;
    Ok((
        input,
        match exp {
            Some(e) => Expr::Binary(BinOp::Pow, Box::new(base), Box::new(e)),
            None => base,
        },
    ))
}

fn unary(input: Input<'_>) -> IResult<Input<'_>, Expr> {
    alt((
        map(preceded(symbol("-"), unary), |e| Expr::Neg(Box::new(e))),
        preceded(symbol("+"), unary),
        power,
    ))
    .parse(input)
}

fn fold(first: Expr, rest: Vec<(BinOp, Expr)>) -> Expr {
    rest.into_iter()
        .fold(first, |acc, (op, rhs)| Expr::Binary(op, Box::new(acc), Box::new(rhs)))
}

fn term(input: Input<'_>) -> IResult<Input<'_>, Expr> {
    let op = alt((
        value(BinOp::FloorDiv, symbol("//")),
        value(BinOp::Mul, symbol("*")),
        value(BinOp::Div, symbol("/")),
        value(BinOp::Mod, symbol("%")),
    ));
    let (input, first) = unary(input)?;
    let (input, rest) = many0((op, unary)).parse(input)?;
    Ok((input, fold(first, rest)))
}

fn arith(input: Input<'_>) -> IResult<Input<'_>, Expr> {
    let op = alt((value(BinOp::Add, symbol("+")), value(BinOp::Sub, symbol("-"))));
    let (input, first) = term(input)?;
    let (input, rest) = many0((op, term)).parse(input)?;
    Ok((input, fold(first, rest)))
}

fn comparison(input: Input<'_>) -> IResult<Input<'_>, Expr> {
    let op = alt((
        value(CmpOp::Eq, symbol("==")),
        value(CmpOp::Ne, symbol("!=")),
        value(CmpOp::Le, symbol("<=")),
        value(CmpOp::Ge, symbol(">=")),
        value(CmpOp::Lt, symbol("<")),
        value(CmpOp::Gt, symbol(">")),
    ));
    let (input, first) = arith(input)?;
    let (input, rest) = many0((op, arith)).parse(input)?;
    Ok((
        input,
        if rest.is_empty() {
            first
        } else {
            Expr::Compare(Box::new(first), rest)
        },
    ))
}

fn negation(input: Input<'_>) -> IResult<Input<'_>, Expr> {
    alt((
        map(preceded(keyword("not"), negation), |e| Expr::Not(Box::new(e))),
        comparison,
    ))
    .parse(input)
}

fn conjunction(input: Input<'_>) -> IResult<Input<'_>, Expr> {
    let (input, first) = negation(input)?;
    let (input, rest) = many0(map(preceded(keyword("and"), negation), |e| (BinOp::And, e))).parse(input)?;
    Ok((input, fold(first, rest)))
}

fn disjunction(input: Input<'_>) -> IResult<Input<'_>, Expr> {
    let (input, first) = conjunction(input)?;
    let (input, rest) = many0(map(preceded(keyword("or"), conjunction), |e| (BinOp::Or, e))).parse(input)?;
    Ok((input, fold(first, rest)))
}

fn expression(input: Input<'_>) -> IResult<Input<'_>, Expr> {
    let (input, then) = disjunction(input)?;
    let (input, branch) = opt((
        preceded(keyword("if"), disjunction),
        preceded(keyword("else"), expression),
    ))
    .parse(input)?;
    Ok((
        input,
        match branch {
            Some((cond, otherwise)) => Expr::IfElse {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            },
            None => then,
        },
    ))
}

impl Expr {
    /// Parses `text`.
    ///
    /// # Errors
    ///
    /// Returns [`EvalError::Syntax`] unless the whole text is one expression.
    pub fn parse(text: &str) -> Result<Self, EvalError> {
        terminated(expression, (multispace0, eof))
            .parse(text)
            .map(|(_, e)| e)
            .map_err(|e| EvalError::Syntax {
                text: text.to_owned(),
                message: e.to_string(),
            })
    }

    /// Evaluates the expression against `env`.
    ///
    /// # Errors
    ///
    /// Undefined names, type mismatches and division by zero.
    pub fn evaluate(&self, env: &dyn Environment) -> Result<Val, EvalError> {
        match self {
            Self::Num(x) => Ok(Val::Num(*x)),
            Self::Str(s) => Ok(Val::Str(s.clone())),
            Self::Bool(b) => Ok(Val::Bool(*b)),
            Self::Name(name) => env
                .variable(name)
                .or_else(|| constant(name))
                .ok_or_else(|| EvalError::UnknownName(name.clone())),
            Self::List(items) => items.iter().map(|e| e.evaluate(env)).collect::<Result<_, _>>().map(Val::List),
            Self::Call(name, args) => {
                let args = args.iter().map(|e| e.evaluate(env)).collect::<Result<Vec<_>, _>>()?;
                env.call(name, &args)
                    .or_else(|| builtin(name, &args))
                    .unwrap_or_else(|| Err(EvalError::UnknownFunction(name.clone())))
            }
            Self::Neg(e) => Ok(Val::Num(-e.evaluate(env)?.as_num()?)),
            Self::Not(e) => Ok(Val::Bool(!e.evaluate(env)?.truthy())),
            Self::Binary(BinOp::And, a, b) => {
                let a = a.evaluate(env)?;
                if a.truthy() { b.evaluate(env) } else { Ok(a) }
            }
            Self::Binary(BinOp::Or, a, b) => {
                let a = a.evaluate(env)?;
                if a.truthy() { Ok(a) } else { b.evaluate(env) }
            }
            Self::Binary(op, a, b) => binary(*op, a.evaluate(env)?, b.evaluate(env)?),
            Self::Compare(first, rest) => {
                let mut left = first.evaluate(env)?;
                for (op, e) in rest {
                    let right = e.evaluate(env)?;
                    if !compare(*op, &left, &right)? {
                        return Ok(Val::Bool(false));
                    }
                    left = right;
                }
                Ok(Val::Bool(true))
            }
            Self::IfElse { cond, then, otherwise } => {
                if cond.evaluate(env)?.truthy() {
                    then.evaluate(env)
                } else {
                    otherwise.evaluate(env)
                }
            }
        }
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Or => "or",
            Self::And => "and",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
        })
    }
}

fn binary(op: BinOp, a: Val, b: Val) -> Result<Val, EvalError> {
    match (op, a, b) {
        (BinOp::Add, Val::Str(x), Val::Str(y)) => Ok(Val::Str(x + &y)),
        (BinOp::Add, Val::List(mut x), Val::List(y)) => {
            x.extend(y);
            Ok(Val::List(x))
        }
        (op, a, b) => {
            let (x, y) = match (a.as_num(), b.as_num()) {
                (Ok(x), Ok(y)) => (x, y),
                _ => {
                    return Err(EvalError::Type(format!(
                        "unsupported operand types for {op}: {} and {}",
                        a.type_name(),
                        b.type_name()
                    )));
                }
            };
            let nonzero = |y: f64| if y == 0.0 { Err(EvalError::ZeroDivision) } else { Ok(y) };
            Ok(Val::Num(match op {
                BinOp::Add => x + y,
                BinOp::Sub => x - y,
                BinOp::Mul => x * y,
                BinOp::Div => x / nonzero(y)?,
                BinOp::FloorDiv => (x / nonzero(y)?).floor(),
                BinOp::Mod => x - y * (x / nonzero(y)?).floor(),
                BinOp::Pow => x.powf(y),
                BinOp::And | BinOp::Or => unreachable_logic(op)?,
            }))
        }
    }
}

fn unreachable_logic(op: BinOp) -> Result<f64, EvalError> {
    Err(EvalError::Type(format!("operator {op} is not arithmetic")))
}

fn compare(op: CmpOp, a: &Val, b: &Val) -> Result<bool, EvalError> {
    let ordering = match (a, b) {
        (Val::Str(x), Val::Str(y)) => x.partial_cmp(y),
        (Val::List(x), Val::List(y)) if matches!(op, CmpOp::Eq | CmpOp::Ne) => {
            return Ok((x == y) == (op == CmpOp::Eq));
        }
        _ => match (a.as_num(), b.as_num()) {
            (Ok(x), Ok(y)) => x.partial_cmp(&y),
            _ if matches!(op, CmpOp::Eq | CmpOp::Ne) => return Ok(op == CmpOp::Ne),
            _ => {
                return Err(EvalError::Type(format!(
                    "cannot order {} and {}",
                    a.type_name(),
                    b.type_name()
                )));
            }
        },
    };
    Ok(match (op, ordering) {
        (CmpOp::Eq, Some(Equal)) | (CmpOp::Lt, Some(Less)) | (CmpOp::Gt, Some(Greater)) => true,
        (CmpOp::Le, Some(Less | Equal)) | (CmpOp::Ge, Some(Greater | Equal)) => true,
        (CmpOp::Ne, o) => o != Some(Equal),
        _ => false,
    })
}

fn constant(name: &str) -> Option<Val> {
    let x = match name {
        "pi" => consts::PI,
        "e" => consts::E,
        "tau" => consts::TAU,
        "inf" => f64::INFINITY,
        "nan" => f64::NAN,
        _ => return None,
    };
    Some(Val::Num(x))
}

fn arity(name: &str, args: &[Val], range: std::ops::RangeInclusive<usize>) -> Result<(), EvalError> {
    if range.contains(&args.len()) {
        Ok(())
    } else {
        Err(EvalError::Type(format!(
            "{name}() takes {}..={} arguments, {} given",
            range.start(),
            range.end(),
            args.len()
        )))
    }
}

fn numbers(args: &[Val]) -> Result<Vec<f64>, EvalError> {
    match args {
        [Val::List(items)] => items.iter().map(Val::as_num).collect(),
        _ => args.iter().map(Val::as_num).collect(),
    }
}

fn unary_math(name: &str) -> Option<fn(f64) -> f64> {
    Some(match name {
        "sin" => f64::sin,
        "cos" => f64::cos,
        "tan" => f64::tan,
        "asin" => f64::asin,
        "acos" => f64::acos,
        "atan" => f64::atan,
        "sinh" => f64::sinh,
        "cosh" => f64::cosh,
        "tanh" => f64::tanh,
        "exp" => f64::exp,
        "log10" => f64::log10,
        "log2" => f64::log2,
        "sqrt" => f64::sqrt,
        "fabs" | "abs" => f64::abs,
        "floor" => f64::floor,
        "ceil" => f64::ceil,
        "trunc" | "int" => f64::trunc,
        "float" => |x| x,
        "degrees" => f64::to_degrees,
        "radians" => f64::to_radians,
        _ => return None,
    })
}

fn monotonic_origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

fn gauss(mu: f64, sigma: f64) -> f64 {
    let mut rng = rand::thread_rng();
    let u1: f64 = 1.0 - rng.r#gen::<f64>();
    let u2: f64 = rng.r#gen::<f64>();
    mu + sigma * (-2.0 * u1.ln()).sqrt() * (consts::TAU * u2).cos()
}

fn builtin(name: &str, args: &[Val]) -> Option<Result<Val, EvalError>> {
    if let Some(f) = unary_math(name) {
        return Some(arity(name, args, 1..=1).and_then(|()| Ok(Val::Num(f(args[0].as_num()?)))));
    }
    match library(name, args) {
        Err(EvalError::UnknownFunction(_)) => None,
        other => Some(other),
    }
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn library(name: &str, args: &[Val]) -> Result<Val, EvalError> {
    match name {
        "atan2" | "pow" | "hypot" | "copysign" | "fmod" => {
            arity(name, args, 2..=2)?;
            let (x, y) = (args[0].as_num()?, args[1].as_num()?);
            Ok(Val::Num(match name {
                "atan2" => x.atan2(y),
                "pow" => x.powf(y),
                "hypot" => x.hypot(y),
                "copysign" => x.copysign(y),
                _ if y == 0.0 => return Err(EvalError::ZeroDivision),
                _ => x % y,
            }))
        }
        "log" => {
            arity(name, args, 1..=2)?;
            let x = args[0].as_num()?;
            Ok(Val::Num(match args.get(1) {
                Some(base) => x.ln() / base.as_num()?.ln(),
                None => x.ln(),
            }))
        }
        "round" => {
            arity(name, args, 1..=2)?;
            let x = args[0].as_num()?;
            let digits = args.get(1).map(Val::as_num).transpose()?.unwrap_or(0.0);
            let scale = 10_f64.powf(digits);
            Ok(Val::Num((x * scale).round_ties_even() / scale))
        }
        "isnan" | "isinf" | "isfinite" => {
            arity(name, args, 1..=1)?;
            let x = args[0].as_num()?;
            Ok(Val::Bool(match name {
                "isnan" => x.is_nan(),
                "isinf" => x.is_infinite(),
                _ => x.is_finite(),
            }))
        }
        "bool" => {
            arity(name, args, 1..=1)?;
            Ok(Val::Bool(args[0].truthy()))
        }
        "min" | "max" => {
            let xs = numbers(args)?;
            let pick = if name == "min" { f64::min } else { f64::max };
            xs.into_iter()
                .reduce(pick)
                .map(Val::Num)
                .ok_or_else(|| EvalError::Type(format!("{name}() of an empty sequence")))
        }
        "sum" => Ok(Val::Num(numbers(args)?.into_iter().sum())),
        "len" => {
            arity(name, args, 1..=1)?;
            match &args[0] {
                Val::List(v) => Ok(Val::Num(v.len() as f64)),
                Val::Str(s) => Ok(Val::Num(s.chars().count() as f64)),
                other => Err(EvalError::Type(format!("{} has no length", other.type_name()))),
            }
        }
        "random" => {
            arity(name, args, 0..=0)?;
            Ok(Val::Num(rand::random::<f64>()))
        }
        "uniform" => {
            arity(name, args, 2..=2)?;
            let (a, b) = (args[0].as_num()?, args[1].as_num()?);
            Ok(Val::Num(a + (b - a) * rand::random::<f64>()))
        }
        "randint" => {
            arity(name, args, 2..=2)?;
            let (a, b) = (args[0].as_num()? as i64, args[1].as_num()? as i64);
            if a > b {
                return Err(EvalError::Type(format!("empty range for randint({a}, {b})")));
            }
            Ok(Val::Num(rand::thread_rng().gen_range(a..=b) as f64))
        }
        "gauss" | "normalvariate" => {
            arity(name, args, 2..=2)?;
            Ok(Val::Num(gauss(args[0].as_num()?, args[1].as_num()?)))
        }
        "time" => {
            arity(name, args, 0..=0)?;
            let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
            Ok(Val::Num(now.as_secs_f64()))
        }
        "monotonic" => {
            arity(name, args, 0..=0)?;
            Ok(Val::Num(monotonic_origin().elapsed().as_secs_f64()))
        }
        _ => Err(EvalError::UnknownFunction(name.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(text: &str) -> Val {
        Expr::parse(text).expect("parse").evaluate(&()).expect("eval")
    }

    fn num(text: &str) -> f64 {
        eval(text).as_num().expect("number")
    }

    struct Counter;

    impl Environment for Counter {
        fn variable(&self, name: &str) -> Option<Val> {
            (name == "n").then_some(Val::Num(3.0))
        }

        fn call(&self, name: &str, args: &[Val]) -> Option<Result<Val, EvalError>> {
            (name == "A").then(|| Ok(Val::Num(args.iter().map(|a| a.as_num().unwrap_or(0.0)).sum())))
        }
    }

    #[test]
    fn operator_precedence_and_floor_division() {
        assert!((num("1 + 2 * 3 ** 2") - 19.0).abs() < 1e-12);
        assert!((num("-2 ** 2") + 4.0).abs() < 1e-12);
        assert!((num("2 ** 3 ** 2") - 512.0).abs() < 1e-12);
        assert!((num("(1 + 2) * 3") - 9.0).abs() < 1e-12);
        assert!((num("7 // 2 + 7 % 3") - 4.0).abs() < 1e-12);
        assert!((num("-7 % 3") - 2.0).abs() < 1e-12);
    }

    #[test]
    fn logic_and_comparisons() {
        assert_eq!(eval("1 < 2 < 3"), Val::Bool(true));
        assert_eq!(eval("1 < 3 < 2"), Val::Bool(false));
        assert_eq!(eval("not 0 and 2 == 2.0"), Val::Bool(true));
        assert_eq!(eval("0 or 'x'"), Val::Str("x".into()));
        assert!((num("10 if 1 > 2 else 20") - 20.0).abs() < 1e-12);
    }

    #[test]
    fn math_names_and_prefixes() {
        assert!((num("math.sin(math.pi / 2)") - 1.0).abs() < 1e-12);
        assert!((num("sqrt(16) + log(e) + 0x10") - 21.0).abs() < 1e-12);
        assert!((num("max([1, 5, 3]) + min(4, 2)") - 7.0).abs() < 1e-12);
        assert!((num("round(2.5) + round(1.25, 1)") - 3.2).abs() < 1e-12);
        let r = num("random.uniform(2, 3)");
        assert!((2.0..=3.0).contains(&r));
        assert!(num("time.monotonic()") >= 0.0);
    }

    #[test]
    fn environment_takes_precedence() {
        let e = Expr::parse("A(1, n) * 2").expect("parse");
        assert_eq!(e.evaluate(&Counter).expect("eval"), Val::Num(8.0));
    }

    #[test]
    fn lists_and_strings() {
        assert_eq!(
            eval("[1, 2.5, 'a', True,]").to_json(),
            serde_json::json!([1, 2.5, "a", true])
        );
        assert_eq!(eval("'ab' + \"cd\""), Val::Str("abcd".into()));
        assert!((num("len([1, 2]) + sum([1, 2, 3])") - 8.0).abs() < 1e-12);
    }

    #[test]
    fn errors_are_reported() {
        assert!(matches!(Expr::parse("1 +"), Err(EvalError::Syntax { .. })));
        assert!(matches!(Expr::parse("and"), Err(EvalError::Syntax { .. })));
        let undefined = Expr::parse("x + 1").expect("parse").evaluate(&());
        assert_eq!(undefined, Err(EvalError::UnknownName("x".into())));
        let zero = Expr::parse("1 / 0").expect("parse").evaluate(&());
        assert_eq!(zero, Err(EvalError::ZeroDivision));
        let unknown = Expr::parse("frobnicate(1)").expect("parse").evaluate(&());
        assert_eq!(unknown, Err(EvalError::UnknownFunction("frobnicate".into())));
        assert!(Expr::parse("'a' * 'b'").expect("parse").evaluate(&()).is_err());
    }
}
