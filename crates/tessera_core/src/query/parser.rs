//! Query string parsing and field extraction.
//!
//! Grammar, one clause per whitespace-separated token:
//!
//! ```text
//! clause   := [+|-] [field ':'] value
//! value    := term | '"' phrase '"' | ('['|'{') lo ' TO ' hi (']'|'}') | prefix '*'
//! query    := clause (('AND' | 'OR' | 'NOT' | '&&' | '||' | '!') clause)*
//! ```
//!
//! Clauses are optional unless marked `+` or joined by `AND`. Grouping
//! with parentheses is not supported.

use crate::error::{CoreError, CoreResult};
use crate::query::ast::{BoolQuery, PhraseQuery, PrefixQuery, Query, RangeQuery, TermQuery};
use crate::query::{cached_regex, ranges, IndexQuery};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

static QUERY_TERMS: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
static DYNAMIC_QUERY_TERMS: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

fn extract(query: &IndexQuery, regex: Option<&Regex>) -> BTreeSet<String> {
    let mut fields = BTreeSet::new();
    if let Some(default) = query.default_field.as_deref().filter(|f| !f.is_empty()) {
        fields.insert(default.to_string());
    }
    if let Some(regex) = regex {
        for captures in regex.captures_iter(&query.query) {
            if let Some(field) = captures.get(1) {
                fields.insert(field.as_str().to_string());
            }
        }
    }
    fields
}

/// Fields named by `field:` clauses, plus the default field.
#[must_use]
pub fn get_fields(query: &IndexQuery) -> BTreeSet<String> {
    let regex = cached_regex(&QUERY_TERMS, r"([^\s\(\+\-][\w._,]+)\:").ok();
    extract(query, regex)
}

/// Fields of a query over document paths, as `(translated, original)`.
/// `*` is skipped.
#[must_use]
pub fn get_fields_for_dynamic_query(query: &IndexQuery) -> BTreeSet<(String, String)> {
    let regex = cached_regex(&DYNAMIC_QUERY_TERMS, r"[-+]?([^\(\)\s]*[^\\\s])\:").ok();
    extract(query, regex)
        .into_iter()
        .filter(|f| f != "*")
        .map(|f| (translate_field(&f), f))
        .collect()
}

/// Rewrites a dotted path so that parts which are not identifiers become
/// `["part"]` accessors.
#[must_use]
pub fn translate_field(field: &str) -> String {
    let mut result = String::new();
    for part in field.split('.').filter(|p| !p.is_empty()) {
        let first = part.chars().next().unwrap_or('_');
        let plain = (first.is_alphabetic() || first == '_')
            && part
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == ',');
        if plain {
            if !result.is_empty() {
                result.push('.');
            }
            result.push_str(part);
        } else {
            result.push_str("[\"");
            result.push_str(part);
            result.push_str("\"]");
        }
    }
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Modifier {
    None,
    Required,
    Prohibited,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    And,
    Or,
    Not,
    Clause(Modifier, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Occur {
    Must,
    Should,
    MustNot,
}

fn grouping_error() -> CoreError {
    CoreError::invalid_query("grouping with parentheses is not supported")
}

fn lex(input: &str) -> CoreResult<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '(' || c == ')' {
            return Err(grouping_error());
        }

        let modifier = match c {
            '+' => Modifier::Required,
            '-' => Modifier::Prohibited,
            '!' => {
                tokens.push(Token::Not);
                i += 1;
                continue;
            }
            _ => Modifier::None,
        };
        if modifier != Modifier::None {
            i += 1;
        }

        let mut text = String::new();
        let mut in_quotes = false;
        let mut in_range = false;
        while i < chars.len() {
            let c = chars[i];
            if c == '\\' && i + 1 < chars.len() {
                text.push(c);
                text.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if in_quotes {
                in_quotes = c != '"';
            } else if in_range {
                in_range = c != ']' && c != '}';
            } else if c.is_whitespace() {
                break;
            } else if c == '(' || c == ')' {
                return Err(grouping_error());
            } else if c == '"' {
                in_quotes = true;
            } else if (c == '[' || c == '{') && (text.is_empty() || text.ends_with(':')) {
                in_range = true;
            }
            text.push(c);
            i += 1;
        }

        if in_quotes {
            return Err(CoreError::invalid_query(format!("unterminated phrase in {text}")));
        }
        if in_range {
            return Err(CoreError::invalid_query(format!("unterminated range in {text}")));
        }
        if text.is_empty() {
            return Err(CoreError::invalid_query("modifier without a clause"));
        }

        tokens.push(match (modifier, text.as_str()) {
            (Modifier::None, "AND" | "&&") => Token::And,
            (Modifier::None, "OR" | "||") => Token::Or,
            (Modifier::None, "NOT") => Token::Not,
            _ => Token::Clause(modifier, text),
        });
    }
    Ok(tokens)
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Position of the `:` separating the field, ignoring escaped colons and
/// anything after an opening quote.
fn field_separator(text: &str) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' | '[' | '{' => return None,
            ':' => return Some(i),
            _ => {}
        }
    }
    None
}

/// Parses query strings against an optional default field.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryParser<'a> {
    default_field: Option<&'a str>,
}

impl<'a> QueryParser<'a> {
    /// Creates a parser. Bare terms search `default_field`.
    #[must_use]
    pub fn new(default_field: Option<&'a str>) -> Self {
        Self {
            default_field: default_field.filter(|f| !f.is_empty()),
        }
    }

    /// Parses a query string. An empty query matches everything.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidQuery`] for parentheses, dangling
    /// operators, bare terms without a default field and malformed ranges.
    pub fn parse(&self, input: &str) -> CoreResult<Query> {
        let tokens = lex(input)?;
        if tokens.is_empty() {
            return Ok(Query::MatchAll);
        }

        let mut clauses: Vec<(Occur, Query)> = Vec::new();
        let mut conjunction: Option<Token> = None;
        let mut negate = false;

        for token in tokens {
            match token {
                Token::And | Token::Or => {
                    if clauses.is_empty() || conjunction.is_some() || negate {
                        return Err(CoreError::invalid_query("operator without a left clause"));
                    }
                    conjunction = Some(token);
                }
                Token::Not => negate = true,
                Token::Clause(modifier, text) => {
                    let and = conjunction == Some(Token::And);
                    if and {
                        if let Some(last) = clauses.last_mut() {
                            if last.0 == Occur::Should {
                                last.0 = Occur::Must;
                            }
                        }
                    }
                    let occur = match modifier {
                        Modifier::Required => Occur::Must,
                        Modifier::Prohibited => Occur::MustNot,
                        Modifier::None if negate => Occur::MustNot,
                        Modifier::None if and => Occur::Must,
                        Modifier::None => Occur::Should,
                    };
                    clauses.push((occur, self.parse_clause(&text)?));
                    conjunction = None;
                    negate = false;
                }
            }
        }
        if conjunction.is_some() || negate {
            return Err(CoreError::invalid_query("operator without a right clause"));
        }

        if let [(Occur::Must | Occur::Should, _)] = clauses.as_slice() {
            if let Some((_, query)) = clauses.pop() {
                return Ok(query);
            }
        }
        let mut query = BoolQuery::default();
        for (occur, clause) in clauses {
            match occur {
                Occur::Must => query.must.push(clause),
                Occur::Should => query.should.push(clause),
                Occur::MustNot => query.must_not.push(clause),
            }
        }
        Ok(Query::Bool(query))
    }

    fn parse_clause(&self, text: &str) -> CoreResult<Query> {
        let (field, value) = match field_separator(text) {
            Some(pos) => (unescape(&text[..pos]), &text[pos + 1..]),
            None => {
                let field = self.default_field.ok_or_else(|| {
                    CoreError::invalid_query(format!("term {text} has no field and no default field"))
                })?;
                (field.to_string(), text)
            }
        };
        if field.is_empty() {
            return Err(CoreError::invalid_query(format!("empty field in {text}")));
        }
        if value.is_empty() {
            return Err(CoreError::invalid_query(format!("field {field} has no value")));
        }

        if field == "*" && value == "*" {
            return Ok(Query::MatchAll);
        }

        if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            return Ok(Query::Phrase(PhraseQuery {
                field,
                phrase: unescape(&value[1..value.len() - 1]),
            }));
        }

        if value.starts_with('[') || value.starts_with('{') {
            return Self::parse_range(field, value);
        }

        if value == "*" {
            return Ok(Query::Prefix(PrefixQuery {
                field,
                prefix: String::new(),
            }));
        }
        if let Some(prefix) = value.strip_suffix('*').filter(|p| !p.ends_with('\\')) {
            return Ok(Query::Prefix(PrefixQuery {
                field,
                prefix: unescape(prefix),
            }));
        }

        Ok(Query::Term(TermQuery {
            field,
            value: unescape(value),
        }))
    }

    fn parse_range(field: String, value: &str) -> CoreResult<Query> {
        let invalid = || CoreError::invalid_query(format!("malformed range {field}:{value}"));
        let lower_inclusive = value.starts_with('[');
        let upper_inclusive = value.ends_with(']');
        if !(value.ends_with(']') || value.ends_with('}')) || value.len() < 2 {
            return Err(invalid());
        }

        let inner: Vec<&str> = value[1..value.len() - 1].split_whitespace().collect();
        let [lower, "TO", upper] = inner.as_slice() else {
            return Err(invalid());
        };
        let range = ranges::resolve(
            &field,
            &unescape(lower),
            &unescape(upper),
            lower_inclusive,
            upper_inclusive,
        )?;
        Ok(Query::Range(RangeQuery {
            field: range.field,
            lower: range.lower,
            upper: range.upper,
        }))
    }
}
