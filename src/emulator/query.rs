//! The query shapes the emulator understands, and its per-range page tokens.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

use crate::error::{ErrorCode, QueryError, QueryResult};
use crate::models::{OrderByItem, SortOrder};
use crate::query::order::SortKey;

fn query_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?ix)
            ^\s*SELECT\s+\*\s+FROM\s+(?P<alias>[A-Za-z_]\w*)
            (?:\s+WHERE\s+(?P<filter>[A-Za-z_]\w*(?:\.[A-Za-z_]\w*)+)\s*=\s*(?P<value>'[^']*'|"[^"]*"|-?\d+(?:\.\d+)?|true|false|null))?
            (?:\s+ORDER\s+BY\s+(?P<order>[A-Za-z_]\w*(?:\.[A-Za-z_]\w*)+)(?:\s+(?P<dir>ASC|DESC))?)?
            \s*$"#,
        )
        .expect("query pattern is valid")
    })
}

/// A parsed query: an optional equality filter and an optional ORDER BY.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedQuery {
    /// Document path and value of a `WHERE c.x = value` filter.
    pub filter: Option<(String, Value)>,
    pub order_by: Vec<OrderByItem>,
}

impl ParsedQuery {
    /// Parses `SELECT * FROM c [WHERE c.path = value] [ORDER BY c.path [ASC|DESC]]`.
    pub fn parse(text: &str) -> QueryResult<Self> {
        let captures = query_regex().captures(text).ok_or_else(|| {
            QueryError::with_message(
                ErrorCode::BadRequest,
                format!("unsupported query: {}", text),
            )
        })?;
        let alias = &captures["alias"];

        let filter = match (captures.name("filter"), captures.name("value")) {
            (Some(path), Some(value)) => Some((
                to_path(alias, path.as_str())?,
                parse_literal(value.as_str())?,
            )),
            _ => None,
        };

        let order_by = match captures.name("order") {
            Some(path) => vec![OrderByItem {
                path: to_path(alias, path.as_str())?,
                order: captures
                    .name("dir")
                    .and_then(|d| SortOrder::from_str(d.as_str()))
                    .unwrap_or_default(),
            }],
            None => Vec::new(),
        };

        Ok(Self { filter, order_by })
    }
}

/// Turns `c.a.b` into `/a/b`, checking the alias.
fn to_path(alias: &str, expr: &str) -> QueryResult<String> {
    let mut segments = expr.split('.');
    if segments.next() != Some(alias) {
        return Err(QueryError::with_message(
            ErrorCode::BadRequest,
            format!("identifier '{}' does not use the alias '{}'", expr, alias),
        ));
    }
    Ok(segments.fold(String::new(), |mut path, segment| {
        path.push('/');
        path.push_str(segment);
        path
    }))
}

fn parse_literal(literal: &str) -> QueryResult<Value> {
    if let Some(inner) = literal
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
    {
        return Ok(Value::String(inner.to_string()));
    }
    serde_json::from_str(literal).map_err(|e| {
        QueryError::with_message(ErrorCode::BadRequest, format!("invalid literal {}: {}", literal, e))
    })
}

/// One sort key component inside a page token. Keeps undefined apart from null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
enum KeyPart {
    Undefined,
    Defined(Value),
}

/// Position of the last document a query page returned.
///
/// Positions are expressed in sort order rather than as offsets, so a token
/// issued by a range stays valid on the ranges it splits into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPosition {
    lsn: u64,
    key: Vec<KeyPart>,
}

impl QueryPosition {
    pub fn new(key: &SortKey, lsn: u64) -> Self {
        Self {
            lsn,
            key: key
                .iter()
                .map(|part| match part {
                    Some(value) => KeyPart::Defined(value.clone()),
                    None => KeyPart::Undefined,
                })
                .collect(),
        }
    }

    pub fn lsn(&self) -> u64 {
        self.lsn
    }

    pub fn key(&self) -> SortKey {
        self.key
            .iter()
            .map(|part| match part {
                KeyPart::Defined(value) => Some(value.clone()),
                KeyPart::Undefined => None,
            })
            .collect()
    }

    pub fn encode(&self) -> QueryResult<String> {
        serde_json::to_string(self).map_err(|e| {
            QueryError::with_message(ErrorCode::InternalError, format!("encode position: {}", e))
        })
    }

    pub fn decode(token: &str) -> QueryResult<Self> {
        serde_json::from_str(token).map_err(|_| {
            QueryError::with_message(
                ErrorCode::BadRequest,
                format!("malformed continuation: {}", token),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_plain_select() {
        let parsed = ParsedQuery::parse("SELECT * from c").unwrap();
        assert!(parsed.filter.is_none());
        assert!(parsed.order_by.is_empty());
    }

    #[test]
    fn test_parse_filter_and_order_by() {
        let parsed =
            ParsedQuery::parse("SELECT * FROM r WHERE r.pk = 'a' ORDER BY r.meta.n DESC").unwrap();
        assert_eq!(parsed.filter, Some(("/pk".to_string(), json!("a"))));
        assert_eq!(parsed.order_by[0].path, "/meta/n");
        assert_eq!(parsed.order_by[0].order, SortOrder::Descending);
    }

    #[test]
    fn test_parse_rejects_other_shapes() {
        let err = ParsedQuery::parse("SELECT c.id FROM c").unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRequest);
        let err = ParsedQuery::parse("SELECT * FROM c ORDER BY d._ts").unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRequest);
    }

    #[test]
    fn test_position_keeps_undefined_apart_from_null() {
        let key: SortKey = vec![None, Some(Value::Null)];
        let token = QueryPosition::new(&key, 7).encode().unwrap();
        let decoded = QueryPosition::decode(&token).unwrap();
        assert_eq!(decoded.key(), key);
        assert_eq!(decoded.lsn(), 7);
    }
}
