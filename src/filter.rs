//! Subscription filter language.
//!
//! Filters are LDAP-style prefix expressions over service properties,
//! for example `(&(name=server-*)(area>42))`. A filter is parsed into an
//! AST which is evaluated directly against a property map; substring
//! patterns are matched with a linear chunk scan, no regular expressions
//! involved.

use std::fmt;

use thiserror::Error;

use crate::props::{PropMap, PropValue};

const BEGIN_EXPR: char = '(';
const END_EXPR: char = ')';
const ANY: char = '*';
const ESCAPE: char = '\\';
const NOT: char = '!';
const AND: char = '&';
const OR: char = '|';
const EQUAL: char = '=';
const GREATER_THAN: char = '>';
const LESS_THAN: char = '<';

/// The characters which must be escaped inside keys and values.
const SPECIALS: [char; 10] = [
    BEGIN_EXPR,
    END_EXPR,
    ANY,
    ESCAPE,
    NOT,
    AND,
    OR,
    EQUAL,
    GREATER_THAN,
    LESS_THAN,
];

fn is_special(c: char) -> bool {
    SPECIALS.contains(&c)
}

/// Quote a literal string for embedding in a filter expression.
pub fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if is_special(c) {
            out.push(ESCAPE);
        }
        out.push(c);
    }
    out
}

#[derive(Debug, Error)]
#[error("'{expr}' (offset {offset}): {reason}")]
pub struct ParseError {
    pub expr: String,
    pub offset: usize,
    pub reason: String,
}

/// A value literal in a comparison: integers iff the text is a canonical
/// integer, strings otherwise.
fn literal(value: String) -> PropValue {
    match canonical_int(&value) {
        Some(n) => PropValue::Int(n),
        None => PropValue::Str(value),
    }
}

fn canonical_int(s: &str) -> Option<i64> {
    let digits = s.strip_prefix('-').unwrap_or(s);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    s.parse().ok()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Filter {
    Equal(String, PropValue),
    GreaterThan(String, i64),
    LessThan(String, i64),
    Present(String),
    Substring {
        key: String,
        initial: Option<String>,
        chunks: Vec<String>,
        last: Option<String>,
    },
    Not(Box<Filter>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    /// Evaluate this filter against a service's properties.
    pub fn matches(&self, props: &PropMap) -> bool {
        match self {
            Filter::Equal(key, wanted) => any_value(props, key, |v| v == wanted),
            Filter::GreaterThan(key, limit) => {
                any_value(props, key, |v| matches!(v, PropValue::Int(n) if n > limit))
            }
            Filter::LessThan(key, limit) => {
                any_value(props, key, |v| matches!(v, PropValue::Int(n) if n < limit))
            }
            Filter::Present(key) => props.contains_name(key),
            Filter::Substring {
                key,
                initial,
                chunks,
                last,
            } => any_value(props, key, |v| match v {
                PropValue::Str(s) => substring_match(s, initial.as_deref(), chunks, last.as_deref()),
                PropValue::Int(_) => false,
            }),
            Filter::Not(operand) => !operand.matches(props),
            Filter::And(operands) => operands.iter().all(|f| f.matches(props)),
            Filter::Or(operands) => operands.iter().any(|f| f.matches(props)),
        }
    }
}

fn any_value(props: &PropMap, key: &str, pred: impl Fn(&PropValue) -> bool) -> bool {
    match props.get(key) {
        Some(values) => values.iter().any(pred),
        None => false,
    }
}

fn substring_match(
    value: &str,
    initial: Option<&str>,
    chunks: &[String],
    last: Option<&str>,
) -> bool {
    let mut rest = value;
    if let Some(prefix) = initial {
        match rest.strip_prefix(prefix) {
            Some(stripped) => rest = stripped,
            None => return false,
        }
    }
    if let Some(suffix) = last {
        match rest.strip_suffix(suffix) {
            Some(stripped) => rest = stripped,
            None => return false,
        }
    }
    for chunk in chunks {
        match rest.find(chunk.as_str()) {
            Some(at) => rest = &rest[at + chunk.len()..],
            None => return false,
        }
    }
    true
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Equal(key, value) => {
                write!(f, "({}={})", escape(key), escape(&value.to_string()))
            }
            Filter::GreaterThan(key, value) => write!(f, "({}>{})", escape(key), value),
            Filter::LessThan(key, value) => write!(f, "({}<{})", escape(key), value),
            Filter::Present(key) => write!(f, "({}=*)", escape(key)),
            Filter::Substring {
                key,
                initial,
                chunks,
                last,
            } => {
                write!(f, "({}=", escape(key))?;
                if let Some(initial) = initial {
                    write!(f, "{}", escape(initial))?;
                }
                write!(f, "*")?;
                for chunk in chunks {
                    write!(f, "{}*", escape(chunk))?;
                }
                if let Some(last) = last {
                    write!(f, "{}", escape(last))?;
                }
                write!(f, ")")
            }
            Filter::Not(operand) => write!(f, "(!{operand})"),
            Filter::And(operands) => {
                write!(f, "(&")?;
                for operand in operands {
                    write!(f, "{operand}")?;
                }
                write!(f, ")")
            }
            Filter::Or(operands) => {
                write!(f, "(|")?;
                for operand in operands {
                    write!(f, "{operand}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Parse a filter expression.
pub fn parse(expr: &str) -> Result<Filter, ParseError> {
    let mut state = ParseState::new(expr);
    state.expect(BEGIN_EXPR)?;
    let filter = parse_node(&mut state)?;
    state.expect(END_EXPR)?;
    if state.remaining() > 0 {
        return Err(state.error("data after end of expression"));
    }
    Ok(filter)
}

struct ParseState<'a> {
    expr: &'a str,
    chars: Vec<char>,
    offset: usize,
}

impl<'a> ParseState<'a> {
    fn new(expr: &'a str) -> Self {
        Self {
            expr,
            chars: expr.chars().collect(),
            offset: 0,
        }
    }

    fn error(&self, reason: impl Into<String>) -> ParseError {
        ParseError {
            expr: self.expr.to_string(),
            offset: self.offset,
            reason: reason.into(),
        }
    }

    fn current(&self) -> Result<char, ParseError> {
        self.chars
            .get(self.offset)
            .copied()
            .ok_or_else(|| self.error("unexpected end of expression"))
    }

    fn skip(&mut self) -> Result<(), ParseError> {
        self.current()?;
        self.offset += 1;
        Ok(())
    }

    fn expect(&mut self, expected: char) -> Result<(), ParseError> {
        let actual = self.current()?;
        if actual != expected {
            return Err(self.error(format!(
                "expected to find '{expected}', but found '{actual}'"
            )));
        }
        self.offset += 1;
        Ok(())
    }

    fn is_current(&self, expected: char) -> Result<bool, ParseError> {
        Ok(self.current()? == expected)
    }

    fn remaining(&self) -> usize {
        self.chars.len() - self.offset
    }
}

/// Read a run of literal characters, resolving escapes. Stops (without
/// consuming) at the first unescaped special character.
fn parse_str(state: &mut ParseState) -> Result<String, ParseError> {
    let mut out = String::new();
    let mut escaped = false;
    loop {
        let c = state.current()?;
        let special = is_special(c);
        if escaped {
            if !special {
                return Err(state.error(format!(
                    "escaped character '{c}' is not a special character"
                )));
            }
            out.push(c);
            state.skip()?;
            escaped = false;
        } else {
            if c == ESCAPE {
                escaped = true;
            } else if special {
                return Ok(out);
            } else {
                out.push(c);
            }
            state.skip()?;
        }
    }
}

fn check_value(state: &ParseState, value: &str) -> Result<(), ParseError> {
    if value.is_empty() {
        return Err(state.error("zero-length (sub)string values not permitted"));
    }
    Ok(())
}

fn parse_equal(state: &mut ParseState, key: String) -> Result<Filter, ParseError> {
    state.expect(EQUAL)?;
    let value = parse_str(state)?;

    if !state.is_current(ANY)? {
        check_value(state, &value)?;
        return Ok(Filter::Equal(key, literal(value)));
    }

    state.skip()?;

    let initial = if value.is_empty() { None } else { Some(value) };
    let mut chunks = Vec::new();

    let last = loop {
        let value = parse_str(state)?;
        if state.is_current(ANY)? {
            check_value(state, &value)?;
            chunks.push(value);
            state.skip()?;
        } else if value.is_empty() {
            break None;
        } else {
            break Some(value);
        }
    };

    if initial.is_none() && chunks.is_empty() && last.is_none() {
        Ok(Filter::Present(key))
    } else {
        Ok(Filter::Substring {
            key,
            initial,
            chunks,
            last,
        })
    }
}

fn parse_ordered(state: &mut ParseState, key: String, op: char) -> Result<Filter, ParseError> {
    state.expect(op)?;
    let value = parse_str(state)?;
    let limit = canonical_int(&value)
        .ok_or_else(|| state.error(format!("'{value}' is not an integer")))?;
    Ok(if op == GREATER_THAN {
        Filter::GreaterThan(key, limit)
    } else {
        Filter::LessThan(key, limit)
    })
}

fn parse_simple(state: &mut ParseState) -> Result<Filter, ParseError> {
    let key = parse_str(state)?;
    if key.is_empty() {
        return Err(state.error("zero-length keys not permitted"));
    }

    if state.is_current(EQUAL)? {
        parse_equal(state, key)
    } else if state.is_current(GREATER_THAN)? {
        parse_ordered(state, key, GREATER_THAN)
    } else if state.is_current(LESS_THAN)? {
        parse_ordered(state, key, LESS_THAN)
    } else {
        Err(state.error(format!(
            "expected to find '{EQUAL}', '{GREATER_THAN}' or '{LESS_THAN}'"
        )))
    }
}

fn parse_not(state: &mut ParseState) -> Result<Filter, ParseError> {
    state.expect(NOT)?;
    state.expect(BEGIN_EXPR)?;
    let operand = parse_node(state)?;
    state.expect(END_EXPR)?;
    Ok(Filter::Not(Box::new(operand)))
}

fn parse_composite(state: &mut ParseState, op: char) -> Result<Filter, ParseError> {
    state.expect(op)?;
    let mut operands = Vec::new();
    loop {
        if state.is_current(BEGIN_EXPR)? {
            state.skip()?;
            operands.push(parse_node(state)?);
            state.expect(END_EXPR)?;
        } else if state.is_current(END_EXPR)? {
            if operands.is_empty() {
                return Err(state.error(format!(
                    "operator '{op}' requires at least one operand expression"
                )));
            }
            return Ok(if op == AND {
                Filter::And(operands)
            } else {
                Filter::Or(operands)
            });
        } else {
            return Err(state.error(format!(
                "expected to find '{BEGIN_EXPR}' or '{END_EXPR}'"
            )));
        }
    }
}

fn parse_node(state: &mut ParseState) -> Result<Filter, ParseError> {
    if state.is_current(AND)? {
        parse_composite(state, AND)
    } else if state.is_current(OR)? {
        parse_composite(state, OR)
    } else if state.is_current(NOT)? {
        parse_not(state)
    } else {
        parse_simple(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props<const N: usize>(pairs: [(&str, PropValue); N]) -> PropMap {
        pairs.into_iter().collect()
    }

    fn s(v: &str) -> PropValue {
        PropValue::from(v)
    }

    fn i(v: i64) -> PropValue {
        PropValue::from(v)
    }

    /// Parse, check the canonical rendering round-trips, and hand back
    /// the filter.
    fn parse_verify(expr: &str) -> Filter {
        let filter = parse(expr).expect(expr);
        assert_eq!(filter.to_string(), expr);
        filter
    }

    #[test]
    fn presence() {
        assert!(parse_verify("(key=*)").matches(&props([("key", s("value"))])));
        assert!(!parse_verify("(key=*)").matches(&props([("key1", s("value1"))])));
    }

    #[test]
    fn equal() {
        assert!(parse_verify("(key=value)").matches(&props([("key", s("value"))])));
        assert!(!parse_verify("(key=value)").matches(&props([("key", s("not-value"))])));
        assert!(parse_verify("(k\\)ey=va\\=lue)").matches(&props([("k)ey", s("va=lue"))])));
        assert!(parse_verify("(key=\\\\)").matches(&props([("key", s("\\"))])));
    }

    #[test]
    fn equal_is_kind_sensitive() {
        assert!(parse_verify("(key=99)").matches(&props([("key", i(99))])));
        assert!(!parse_verify("(key=99)").matches(&props([("key", s("99"))])));
        // "042" is not a canonical integer, so it is a string literal.
        assert!(parse_verify("(key=042)").matches(&props([("key", s("042"))])));
        assert!(!parse_verify("(key=042)").matches(&props([("key", i(42))])));
    }

    #[test]
    fn equal_multivalue() {
        let svc = props([("key", s("value")), ("key", i(99))]);
        assert!(parse_verify("(key=value)").matches(&svc));
        assert!(parse_verify("(key=99)").matches(&svc));
    }

    #[test]
    fn greater_than() {
        assert!(!parse_verify("(key>42)").matches(&props([("foo", i(4711))])));
        assert!(!parse_verify("(key>42)").matches(&props([("key", s("value"))])));
        assert!(!parse_verify("(key>42)").matches(&props([("key", i(17))])));
        assert!(!parse_verify("(key>42)").matches(&props([("key", i(42))])));
        assert!(parse_verify("(key>42)").matches(&props([("key", i(99))])));
        assert!(parse_verify("(|(key>42)(key=42))").matches(&props([("key", i(42))])));
        assert!(parse_verify("(key>-42)").matches(&props([("key", i(-17))])));
    }

    #[test]
    fn less_than() {
        assert!(parse_verify("(key<42)").matches(&props([("key", i(17))])));
        assert!(!parse_verify("(key<42)").matches(&props([("key", i(42))])));
        assert!(!parse_verify("(key<42)").matches(&props([("key", i(99))])));
        assert!(parse_verify("(key<42)").matches(&props([("key", i(99)), ("key", i(1))])));
        assert!(parse_verify("(key<-42)").matches(&props([("key", i(-99))])));
    }

    #[test]
    fn substring() {
        assert!(parse_verify("(key=v*e)").matches(&props([("key", s("value"))])));
        assert!(!parse_verify("(key=v*e)").matches(&props([("key1", s("value"))])));
        assert!(parse_verify("(key=v*e*)").matches(&props([("key", s("value"))])));
        assert!(parse_verify("(key=*v*e*)").matches(&props([("key", s("value"))])));
        assert!(!parse_verify("(key=*v*e*)").matches(&props([("key", s("calue"))])));
        assert!(!parse_verify("(key=a*)").matches(&props([("key", s("value"))])));
        assert!(parse_verify("(key=foo.*)").matches(&props([("key", s("foo.txt"))])));
        assert!(parse_verify("(key=f[oo.*)").matches(&props([("key", s("f[oo.txt"))])));
        // Integers never match substring patterns.
        assert!(!parse_verify("(key=4*)").matches(&props([("key", i(42))])));
    }

    #[test]
    fn substring_chunks_are_ordered() {
        assert!(parse_verify("(key=*ab*cd*)").matches(&props([("key", s("xabycdz"))])));
        assert!(!parse_verify("(key=*cd*ab*)").matches(&props([("key", s("xabycdz"))])));
    }

    #[test]
    fn whitespace_is_literal() {
        let f = parse("(game= a space adventure )").expect("filter");
        assert!(f.matches(&props([("game", s(" a space adventure "))])));
        assert!(!f.matches(&props([("game", s("a space adventure"))])));
    }

    #[test]
    fn not() {
        assert!(!parse_verify("(!(key=value))").matches(&props([("key", s("value"))])));
        assert!(parse_verify("(!(!(key=value)))").matches(&props([("key", s("value"))])));
        assert!(!parse_verify("(!(!(key=value)))").matches(&props([("key", s("not-value"))])));
    }

    #[test]
    fn and() {
        let f = parse_verify("(&(key0=value0)(key1=*))");
        assert!(f.matches(&props([("key0", s("value0")), ("key1", s("value1"))])));
        assert!(!f.matches(&props([("key1", s("value1")), ("key2", s("value2"))])));
        let range = parse_verify("(&(key>5)(key<10))");
        assert!(range.matches(&props([("key", i(7))])));
        assert!(!range.matches(&props([("key", i(10))])));
    }

    #[test]
    fn or() {
        let f = parse_verify("(|(key0=value0)(key1=value1))");
        assert!(f.matches(&props([("key0", s("value0"))])));
        assert!(f.matches(&props([("key1", s("value1"))])));
        assert!(!f.matches(&props([("key0", s("not-value0"))])));
        assert!(!f.matches(&PropMap::new()));
    }

    #[test]
    fn complex() {
        let f = parse_verify("(&(key0=value0)(!(|(key1=value1)(key2=value2))))");
        assert!(f.matches(&props([("key0", s("value0"))])));
        assert!(f.matches(&props([("key0", s("value0")), ("key1", s("not-value1"))])));
        assert!(!f.matches(&props([("key0", s("value0")), ("key1", s("value1"))])));
        assert!(!f.matches(&PropMap::new()));
    }

    #[test]
    fn single_operand_composites_are_identities() {
        let inner = props([("key", s("value"))]);
        assert!(parse("(&(key=value))").expect("and").matches(&inner));
        assert!(parse("(|(key=value))").expect("or").matches(&inner));
        assert!(!parse("(&(key=other))").expect("and").matches(&inner));
    }

    #[test]
    fn substring_without_chunks_is_presence() {
        assert_eq!(parse("(key=*)").expect("presence"), Filter::Present("key".into()));
    }

    #[test]
    fn malformed() {
        let malformed = [
            "(key=)",
            "(=value)",
            "(key)",
            "(%(key0=value0))",
            "(&)",
            "(|(key0=value0)(key1=value1)",
            "((|(key0=value0)(key1=value1))",
            "(&(key0=value0)(key1=value1))(key2=value2)",
            "(name=invalid\\aquote)",
            "(num>foo)",
            "(num< 99)",
            "(num>)",
            "(>9)",
            "(num<99.99)",
            "(num>007)",
            "(key=a**b)",
        ];
        for expr in malformed {
            assert!(parse(expr).is_err(), "accepted: {expr}");
        }
    }

    #[test]
    fn parse_errors_carry_offsets() {
        let err = parse("(key=)").expect_err("parse error");
        assert_eq!(err.offset, 5);
    }

    #[test]
    fn escape_round_trips() {
        assert_eq!(escape("foo"), "foo");
        assert_eq!(escape("foo\\bar"), "foo\\\\bar");
        assert_eq!(escape("foo*"), "foo\\*");
        assert_eq!(escape("fo(o)"), "fo\\(o\\)");
        assert_eq!(escape(""), "");
        assert_eq!(escape("=foo"), "\\=foo");
        assert_eq!(escape("f!oo"), "f\\!oo");

        let key = "weird*key";
        let expr = format!("({}=*)", escape(key));
        assert!(parse(&expr).expect("filter").matches(&props([(key, s("x"))])));
    }
}
