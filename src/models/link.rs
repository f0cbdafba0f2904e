//! Collection resource links.

use percent_encoding::percent_decode_str;
use std::fmt;

use crate::error::{ErrorCode, QueryError, QueryResult};

/// A normalized `dbs/{db}/colls/{collection}` link.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionLink {
    database: String,
    collection: String,
}

impl CollectionLink {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Parses a link, trimming leading and trailing slashes and percent-decoding segments.
    pub fn parse(link: &str) -> QueryResult<Self> {
        let trimmed = link.trim().trim_matches('/');
        let segments: Vec<&str> = trimmed.split('/').collect();
        match segments.as_slice() {
            ["dbs", db, "colls", coll] if !db.is_empty() && !coll.is_empty() => {
                Ok(Self::new(decode_segment(db)?, decode_segment(coll)?))
            }
            _ => Err(QueryError::with_message(
                ErrorCode::InvalidCollectionLink,
                format!("'{}' is not a collection link of the form dbs/{{db}}/colls/{{coll}}", link),
            )),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }
}

impl fmt::Display for CollectionLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dbs/{}/colls/{}", self.database, self.collection)
    }
}

fn decode_segment(segment: &str) -> QueryResult<String> {
    percent_decode_str(segment)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| {
            QueryError::with_message(
                ErrorCode::InvalidCollectionLink,
                format!("link segment '{}' is not valid UTF-8", segment),
            )
        })
}
