//! Parsing of transport expressions using `nom`.
//!
//! An expression is a constructor call such as `Loopback(42)` or
//! `UDP("127.0.0.1", local_node_id=7)`, or a bracketed list of calls for a
//! redundant transport.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace0, one_of},
    combinator::{eof, map, opt, recognize, value},
    multi::{many0, separated_list0, separated_list1},
    sequence::{delimited, pair, preceded, terminated},
};

use crate::error::{Result, TransportError};

/// A literal argument value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Literal {
    /// `None`.
    None,
    /// `True` or `False`.
    Bool(bool),
    /// A decimal integer.
    Int(i64),
    /// A quoted string.
    Str(String),
}

/// One argument, optionally given by keyword.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    /// Keyword, if given as `key=value`.
    pub key: Option<String>,
    /// The value.
    pub value: Literal,
}

/// A constructor call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constructor {
    /// Transport kind as written.
    pub name: String,
    /// Arguments in order.
    pub args: Vec<Argument>,
}

impl Constructor {
    /// Transport kind with an optional `Transport` suffix removed.
    #[must_use]
    pub fn kind(&self) -> &str {
        self.name.strip_suffix("Transport").unwrap_or(&self.name)
    }

    /// Finds an argument by keyword, falling back to its position among the
    /// positional arguments.
    #[must_use]
    pub fn arg(&self, key: &str, position: usize) -> Option<&Literal> {
        self.args
            .iter()
            .find(|a| a.key.as_deref() == Some(key))
            .or_else(|| self.args.iter().filter(|a| a.key.is_none()).nth(position))
            .map(|a| &a.value)
    }
}

/// A parsed transport expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportExpr {
    /// A single transport.
    Single(Constructor),
    /// Several transports used redundantly.
    Redundant(Vec<Constructor>),
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))
    .parse(input)
}

fn string_literal(input: &str) -> IResult<&str, Literal> {
    let double = delimited(char('"'), take_while(|c| c != '"'), char('"'));
    let single = delimited(char('\''), take_while(|c| c != '\''), char('\''));
    map(alt((double, single)), |s: &str| Literal::Str(s.to_owned())).parse(input)
}

fn integer_literal(input: &str) -> IResult<&str, Literal> {
    let (rest, digits) = recognize(pair(opt(one_of("+-")), digit1)).parse(input)?;
    let n = digits
        .parse::<i64>()
        .map_err(|_| nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Digit)))?;
    Ok((rest, Literal::Int(n)))
}

fn literal(input: &str) -> IResult<&str, Literal> {
    alt((
        value(Literal::None, tag("None")),
        value(Literal::Bool(true), tag("True")),
        value(Literal::Bool(false), tag("False")),
        string_literal,
        integer_literal,
    ))
    .parse(input)
}

fn argument(input: &str) -> IResult<&str, Argument> {
    let keyword = terminated(identifier, (multispace0, char('='), multispace0));
    let (input, key) = opt(keyword).parse(input)?;
    let (input, value) = literal(input)?;
    Ok((
        input,
        Argument {
            key: key.map(str::to_owned),
            value,
        },
    ))
}

fn constructor(input: &str) -> IResult<&str, Constructor> {
    let separator = (multispace0, char(','), multispace0);
    let (input, name) = identifier(input)?;
    let (input, args) = delimited(
        (multispace0, char('('), multispace0),
        separated_list0(separator, argument),
        (multispace0, opt(char(',')), multispace0, char(')')),
    )
    .parse(input)?;
    Ok((
        input,
        Constructor {
            name: name.to_owned(),
            args,
        },
    ))
}

fn expression(input: &str) -> IResult<&str, TransportExpr> {
    let list = delimited(
        (char('['), multispace0),
        separated_list1((multispace0, char(','), multispace0), constructor),
        (multispace0, opt(char(',')), multispace0, char(']')),
    );
    let (input, expr) = preceded(
        multispace0,
        alt((
            map(list, TransportExpr::Redundant),
            map(constructor, TransportExpr::Single),
        )),
    )
    .parse(input)?;
    let (input, _) = (multispace0, eof).parse(input)?;
    Ok((input, expr))
}

/// Parses a transport expression.
///
/// # Errors
///
/// Returns [`TransportError::InvalidExpression`] on syntax errors.
pub fn parse_expression(text: &str) -> Result<TransportExpr> {
    expression(text)
        .map(|(_, expr)| expr)
        .map_err(|e| TransportError::InvalidExpression {
            expression: text.to_owned(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_positional_and_keyword_arguments() {
        let expr = parse_expression(r#"UDP("127.0.0.1", local_node_id=7)"#).expect("parse");
        let TransportExpr::Single(c) = expr else {
            panic!("expected a single constructor");
        };
        assert_eq!(c.kind(), "UDP");
        assert_eq!(c.arg("local_node_id", 1), Some(&Literal::Int(7)));
        assert_eq!(c.arg("iface", 0), Some(&Literal::Str("127.0.0.1".into())));
    }

    #[test]
    fn parses_loopback_with_none_and_bus_name() {
        let expr = parse_expression(" Loopback( None , 'bench' ) ").expect("parse");
        assert_eq!(
            expr,
            TransportExpr::Single(Constructor {
                name: "Loopback".into(),
                args: vec![
                    Argument { key: None, value: Literal::None },
                    Argument { key: None, value: Literal::Str("bench".into()) },
                ],
            })
        );
    }

    #[test]
    fn transport_suffix_is_optional() {
        let TransportExpr::Single(c) = parse_expression("LoopbackTransport(5)").expect("parse") else {
            panic!("expected a single constructor");
        };
        assert_eq!(c.kind(), "Loopback");
    }

    #[test]
    fn parses_redundant_list() {
        let expr = parse_expression("[Loopback(1), Loopback(1)]").expect("parse");
        assert!(matches!(expr, TransportExpr::Redundant(ref v) if v.len() == 2));
    }

    #[test]
    fn rejects_trailing_garbage_and_unclosed_calls() {
        assert!(parse_expression("Loopback(1) x").is_err());
        assert!(parse_expression("Loopback(1").is_err());
        assert!(parse_expression("").is_err());
    }
}
