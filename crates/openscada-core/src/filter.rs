// ── LDAP-style filters ──
//
// Shared by catalogue lookups and AE event queries. Supported forms:
// `(a=b)`, `(a=*)`, `(a=x*y)`, `(a>=n)`, `(a<=n)`, `(a~=b)`, `(&...)`,
// `(|...)` and `(!...)`. A backslash escapes the next character.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;
use crate::model::{Attributes, Event};

/// Anything a filter can be evaluated against.
pub trait FilterTarget {
    fn field(&self, name: &str) -> Option<String>;
}

impl FilterTarget for BTreeMap<String, String> {
    fn field(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

impl FilterTarget for Attributes {
    fn field(&self, name: &str) -> Option<String> {
        self.get(name)
            .filter(|v| !v.is_null())
            .map(ToString::to_string)
    }
}

impl FilterTarget for Event {
    fn field(&self, name: &str) -> Option<String> {
        Event::field(self, name)
    }
}

/// Parsed filter expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Present(String),
    Equal(String, String),
    /// Value split at its wildcards; `["ab", "", "c"]` is `ab**c`.
    Substring(String, Vec<String>),
    GreaterOrEqual(String, String),
    LessOrEqual(String, String),
    Approx(String, String),
}

impl Filter {
    pub fn parse(text: &str) -> Result<Self, CoreError> {
        let mut parser = Parser {
            chars: text.trim().chars().collect(),
            pos: 0,
        };
        let filter = parser.filter()?;
        if parser.pos != parser.chars.len() {
            return Err(parser.error("trailing characters"));
        }
        Ok(filter)
    }

    pub fn matches(&self, target: &dyn FilterTarget) -> bool {
        match self {
            Self::And(all) => all.iter().all(|f| f.matches(target)),
            Self::Or(any) => any.iter().any(|f| f.matches(target)),
            Self::Not(inner) => !inner.matches(target),
            Self::Present(attr) => target.field(attr).is_some(),
            Self::Equal(attr, value) => target.field(attr).is_some_and(|v| v == *value),
            Self::Substring(attr, parts) => target
                .field(attr)
                .is_some_and(|v| substring_matches(&v, parts)),
            Self::GreaterOrEqual(attr, value) => target
                .field(attr)
                .is_some_and(|v| compare(&v, value).is_ge()),
            Self::LessOrEqual(attr, value) => target
                .field(attr)
                .is_some_and(|v| compare(&v, value).is_le()),
            Self::Approx(attr, value) => target
                .field(attr)
                .is_some_and(|v| normalize(&v) == normalize(value)),
        }
    }
}

impl FromStr for Filter {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And(all) => {
                write!(f, "(&")?;
                for inner in all {
                    write!(f, "{inner}")?;
                }
                write!(f, ")")
            }
            Self::Or(any) => {
                write!(f, "(|")?;
                for inner in any {
                    write!(f, "{inner}")?;
                }
                write!(f, ")")
            }
            Self::Not(inner) => write!(f, "(!{inner})"),
            Self::Present(attr) => write!(f, "({attr}=*)"),
            Self::Equal(attr, value) => write!(f, "({attr}={})", escape(value)),
            Self::Substring(attr, parts) => {
                let parts: Vec<String> = parts.iter().map(|p| escape(p)).collect();
                write!(f, "({attr}={})", parts.join("*"))
            }
            Self::GreaterOrEqual(attr, value) => write!(f, "({attr}>={})", escape(value)),
            Self::LessOrEqual(attr, value) => write!(f, "({attr}<={})", escape(value)),
            Self::Approx(attr, value) => write!(f, "({attr}~={})", escape(value)),
        }
    }
}

// ── Matching helpers ─────────────────────────────────────────────────

fn substring_matches(value: &str, parts: &[String]) -> bool {
    let Some((first, rest)) = parts.split_first() else {
        return true;
    };
    let Some(mut remaining) = value.strip_prefix(first.as_str()) else {
        return false;
    };
    let Some((last, middle)) = rest.split_last() else {
        return remaining.is_empty();
    };
    for part in middle {
        match remaining.find(part.as_str()) {
            Some(idx) => remaining = &remaining[idx + part.len()..],
            None => return false,
        }
    }
    remaining.ends_with(last.as_str())
}

/// Numeric comparison when both sides parse, otherwise lexical.
fn compare(left: &str, right: &str) -> std::cmp::Ordering {
    match (left.trim().parse::<f64>(), right.trim().parse::<f64>()) {
        (Ok(l), Ok(r)) => l.total_cmp(&r),
        _ => left.cmp(right),
    }
}

fn normalize(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '(' | ')' | '*' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// ── Parser ───────────────────────────────────────────────────────────

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn error(&self, what: &str) -> CoreError {
        CoreError::validation(format!("invalid filter at offset {}: {what}", self.pos))
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn expect(&mut self, c: char) -> Result<(), CoreError> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{c}'")))
        }
    }

    fn filter(&mut self) -> Result<Filter, CoreError> {
        self.expect('(')?;
        let filter = match self.peek() {
            Some('&') => {
                self.pos += 1;
                Filter::And(self.list()?)
            }
            Some('|') => {
                self.pos += 1;
                Filter::Or(self.list()?)
            }
            Some('!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.filter()?))
            }
            Some(_) => self.item()?,
            None => return Err(self.error("unexpected end")),
        };
        self.expect(')')?;
        Ok(filter)
    }

    fn list(&mut self) -> Result<Vec<Filter>, CoreError> {
        let mut filters = Vec::new();
        while self.peek() == Some('(') {
            filters.push(self.filter()?);
        }
        if filters.is_empty() {
            return Err(self.error("empty filter list"));
        }
        Ok(filters)
    }

    fn item(&mut self) -> Result<Filter, CoreError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, '=' | '>' | '<' | '~' | '(' | ')') {
                break;
            }
            self.pos += 1;
        }
        let attr: String = self.chars[start..self.pos].iter().collect::<String>().trim().to_owned();
        if attr.is_empty() {
            return Err(self.error("missing attribute name"));
        }

        let op = match self.peek() {
            Some('=') => {
                self.pos += 1;
                '='
            }
            Some(c @ ('>' | '<' | '~')) => {
                self.pos += 1;
                self.expect('=')?;
                c
            }
            _ => return Err(self.error("expected an operator")),
        };

        let (parts, wildcard) = self.value()?;
        Ok(match op {
            '=' if wildcard && parts.len() == 2 && parts.iter().all(String::is_empty) => {
                Filter::Present(attr)
            }
            '=' if wildcard => Filter::Substring(attr, parts),
            '>' => Filter::GreaterOrEqual(attr, single(parts)),
            '<' => Filter::LessOrEqual(attr, single(parts)),
            '~' => Filter::Approx(attr, single(parts)),
            _ => Filter::Equal(attr, single(parts)),
        })
    }

    /// Value up to the closing parenthesis, split at unescaped `*`.
    fn value(&mut self) -> Result<(Vec<String>, bool), CoreError> {
        let mut parts = vec![String::new()];
        let mut wildcard = false;
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated value")),
                Some(')') => break,
                Some('(') => return Err(self.error("unescaped '(' in value")),
                Some('\\') => {
                    self.pos += 1;
                    let c = self.peek().ok_or_else(|| self.error("dangling escape"))?;
                    push_char(&mut parts, c);
                    self.pos += 1;
                }
                Some('*') => {
                    wildcard = true;
                    parts.push(String::new());
                    self.pos += 1;
                }
                Some(c) => {
                    push_char(&mut parts, c);
                    self.pos += 1;
                }
            }
        }
        Ok((parts, wildcard))
    }
}

fn push_char(parts: &mut [String], c: char) {
    if let Some(last) = parts.last_mut() {
        last.push(c);
    }
}

fn single(parts: Vec<String>) -> String {
    parts.join("*")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn parses_and_evaluates_compound_filters() {
        let filter = Filter::parse("(&(kind=proxy)(|(ranking>=5)(!(region=*))))").unwrap();
        assert!(filter.matches(&props(&[("kind", "proxy"), ("ranking", "10")])));
        assert!(filter.matches(&props(&[("kind", "proxy")])));
        assert!(!filter.matches(&props(&[("kind", "proxy"), ("region", "eu")])));
        assert!(!filter.matches(&props(&[("kind", "memory")])));
    }

    #[test]
    fn substring_and_presence() {
        let target = props(&[("id", "plant.pump.01.state")]);
        assert!(Filter::parse("(id=plant.*.state)").unwrap().matches(&target));
        assert!(Filter::parse("(id=*pump*)").unwrap().matches(&target));
        assert!(!Filter::parse("(id=*valve*)").unwrap().matches(&target));
        assert_eq!(Filter::parse("(id=*)").unwrap(), Filter::Present("id".into()));
    }

    #[test]
    fn numeric_comparison_beats_lexical() {
        let target = props(&[("priority", "10")]);
        assert!(Filter::parse("(priority>=9)").unwrap().matches(&target));
        assert!(!Filter::parse("(priority<=9)").unwrap().matches(&target));
    }

    #[test]
    fn approx_ignores_case_and_spaces() {
        let target = props(&[("message", "Pump  Tripped")]);
        assert!(Filter::parse("(message~=pump tripped)").unwrap().matches(&target));
    }

    #[test]
    fn escapes_round_trip_through_display() {
        let filter = Filter::parse(r"(name=a\*b\(c\))").unwrap();
        assert_eq!(filter, Filter::Equal("name".into(), "a*b(c)".into()));
        assert_eq!(Filter::parse(&filter.to_string()).unwrap(), filter);
    }

    #[test]
    fn events_expose_their_fields() {
        let event = Event::new("node-a").with_attribute("priority", 3_i32);
        assert!(Filter::parse("(&(node_id=node-a)(priority>=2))").unwrap().matches(&event));
    }

    #[test]
    fn malformed_filters_are_validation_errors() {
        for text in ["", "(", "(a)", "(&)", "(a=b", "(a=b))", "(=b)", "(a>b)"] {
            assert!(
                matches!(Filter::parse(text), Err(CoreError::Validation { .. })),
                "{text:?}"
            );
        }
    }
}
