//! Atlas-style search request and response types
//!
//! Queries arrive as loosely typed JSON trees. They are lifted into the
//! [`QuerySpec`] tagged union at the boundary; unknown tags are ignored and
//! missing required sub-keys are rejected here, so nothing downstream ever
//! sees an untyped map.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::search::error::{SearchError, SearchResult};

/// A search request against one logical index
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchRequest {
    /// Logical index name (set from the URL path by the API layer)
    #[serde(default)]
    pub index: String,

    /// Atlas-style query tree
    #[serde(default)]
    pub query: Value,

    /// Facet aggregations keyed by response name
    #[serde(default)]
    pub facets: Option<HashMap<String, FacetRequest>>,

    /// Fields to highlight
    #[serde(default)]
    pub highlight: Option<HighlightRequest>,

    #[serde(default)]
    pub size: usize,

    #[serde(default)]
    pub from: usize,
}

/// A facet aggregation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacetRequest {
    /// terms, numeric or date; all produce per-term buckets
    #[serde(rename = "type", default)]
    pub facet_type: String,

    pub field: String,

    #[serde(default)]
    pub size: usize,
}

impl FacetRequest {
    /// Maximum buckets to return, defaulting to 10
    pub fn bucket_limit(&self) -> usize {
        if self.size == 0 {
            10
        } else {
            self.size
        }
    }
}

/// Highlighting request: which fields to produce fragments for
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HighlightRequest {
    #[serde(default)]
    pub fields: Vec<String>,
}

/// A single search hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(rename = "_id")]
    pub id: String,

    pub score: f32,

    /// The stored source document
    pub source: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlight: Option<HashMap<String, Vec<String>>>,
}

/// Per-facet buckets in a response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FacetResult {
    pub buckets: Vec<FacetBucket>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacetBucket {
    pub key: String,
    pub count: u64,
}

/// Search response with Atlas Search compatible shape
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,

    pub total: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facets: Option<HashMap<String, FacetResult>>,

    #[serde(rename = "maxScore")]
    pub max_score: f32,

    /// Set when one or more shards failed and were dropped from the merge
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_shards: Vec<String>,
}

/// Typed query variants lifted from the incoming JSON tree
#[derive(Debug, Clone, PartialEq)]
pub enum QuerySpec {
    Compound {
        must: Vec<QuerySpec>,
        should: Vec<QuerySpec>,
        must_not: Vec<QuerySpec>,
    },
    Text {
        query: String,
        path: Option<String>,
    },
    Term {
        value: String,
        path: String,
    },
    Wildcard {
        value: String,
        path: String,
    },
    MatchAll,
}

impl QuerySpec {
    /// Lift a JSON query tree into the tagged union.
    ///
    /// Empty or non-object input is the lenient match-all; unknown keys are
    /// ignored; missing required sub-keys fail with an invalid-query error.
    pub fn parse(value: &Value) -> SearchResult<QuerySpec> {
        let Some(object) = value.as_object() else {
            return Ok(QuerySpec::MatchAll);
        };

        if let Some(compound) = object.get("compound") {
            return Self::parse_compound(compound);
        }

        if let Some(text) = object.get("text") {
            return Self::parse_text(text);
        }

        if let Some(term) = object.get("term") {
            return Self::parse_term(term);
        }

        if let Some(wildcard) = object.get("wildcard") {
            return Self::parse_wildcard(wildcard);
        }

        if object.contains_key("match_all") {
            return Ok(QuerySpec::MatchAll);
        }

        Ok(QuerySpec::MatchAll)
    }

    fn parse_compound(value: &Value) -> SearchResult<QuerySpec> {
        let object = value
            .as_object()
            .ok_or_else(|| SearchError::InvalidQuery("compound must be an object".to_string()))?;

        Ok(QuerySpec::Compound {
            must: Self::parse_clauses(object.get("must"))?,
            should: Self::parse_clauses(object.get("should"))?,
            must_not: Self::parse_clauses(object.get("mustNot"))?,
        })
    }

    fn parse_clauses(value: Option<&Value>) -> SearchResult<Vec<QuerySpec>> {
        let Some(value) = value else {
            return Ok(Vec::new());
        };

        let items = value
            .as_array()
            .ok_or_else(|| SearchError::InvalidQuery("compound clauses must be arrays".to_string()))?;

        items.iter().map(Self::parse).collect()
    }

    fn parse_text(value: &Value) -> SearchResult<QuerySpec> {
        let object = value
            .as_object()
            .ok_or_else(|| SearchError::InvalidQuery("text must be an object".to_string()))?;

        let query = required_string(object, "text", "query")?;
        let path = match object.get("path") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => {
                return Err(SearchError::InvalidQuery(
                    "text.path must be a string".to_string(),
                ))
            }
        };

        Ok(QuerySpec::Text { query, path })
    }

    fn parse_term(value: &Value) -> SearchResult<QuerySpec> {
        let object = value
            .as_object()
            .ok_or_else(|| SearchError::InvalidQuery("term must be an object".to_string()))?;

        Ok(QuerySpec::Term {
            value: required_string(object, "term", "value")?,
            path: required_string(object, "term", "path")?,
        })
    }

    fn parse_wildcard(value: &Value) -> SearchResult<QuerySpec> {
        let object = value
            .as_object()
            .ok_or_else(|| SearchError::InvalidQuery("wildcard must be an object".to_string()))?;

        Ok(QuerySpec::Wildcard {
            value: required_string(object, "wildcard", "value")?,
            path: required_string(object, "wildcard", "path")?,
        })
    }
}

fn required_string(object: &Map<String, Value>, variant: &str, key: &str) -> SearchResult<String> {
    match object.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(SearchError::InvalidQuery(format!(
            "{}.{} must be a string",
            variant, key
        ))),
        None => Err(SearchError::InvalidQuery(format!(
            "{}.{} is required",
            variant, key
        ))),
    }
}

/// Compile a `*`/`?` wildcard pattern into an anchored regex.
pub fn wildcard_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() * 2);
    for ch in pattern.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            c if regex_syntax_char(c) => {
                regex.push('\\');
                regex.push(c);
            }
            c => regex.push(c),
        }
    }
    regex
}

fn regex_syntax_char(c: char) -> bool {
    matches!(
        c,
        '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\'
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_text_with_path() {
        let spec = QuerySpec::parse(&json!({"text": {"query": "red", "path": "title"}})).unwrap();
        assert_eq!(
            spec,
            QuerySpec::Text {
                query: "red".to_string(),
                path: Some("title".to_string())
            }
        );
    }

    #[test]
    fn test_parse_text_without_path() {
        let spec = QuerySpec::parse(&json!({"text": {"query": "red fox"}})).unwrap();
        assert_eq!(
            spec,
            QuerySpec::Text {
                query: "red fox".to_string(),
                path: None
            }
        );
    }

    #[test]
    fn test_parse_term_requires_value_and_path() {
        assert!(QuerySpec::parse(&json!({"term": {"path": "sku"}})).is_err());
        assert!(QuerySpec::parse(&json!({"term": {"value": "a"}})).is_err());
        assert!(QuerySpec::parse(&json!({"term": {"value": "a", "path": "sku"}})).is_ok());
    }

    #[test]
    fn test_parse_wildcard_requires_value_and_path() {
        assert!(QuerySpec::parse(&json!({"wildcard": {"value": "re*"}})).is_err());
        let spec =
            QuerySpec::parse(&json!({"wildcard": {"value": "re*", "path": "title"}})).unwrap();
        assert_eq!(
            spec,
            QuerySpec::Wildcard {
                value: "re*".to_string(),
                path: "title".to_string()
            }
        );
    }

    #[test]
    fn test_parse_compound_recurses() {
        let spec = QuerySpec::parse(&json!({
            "compound": {
                "must": [{"text": {"query": "red", "path": "title"}}],
                "mustNot": [{"term": {"value": "b", "path": "_id"}}]
            }
        }))
        .unwrap();

        match spec {
            QuerySpec::Compound { must, should, must_not } => {
                assert_eq!(must.len(), 1);
                assert!(should.is_empty());
                assert_eq!(must_not.len(), 1);
            }
            other => panic!("expected compound, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_empty_and_unknown_default_to_match_all() {
        assert_eq!(QuerySpec::parse(&json!({})).unwrap(), QuerySpec::MatchAll);
        assert_eq!(QuerySpec::parse(&json!(null)).unwrap(), QuerySpec::MatchAll);
        assert_eq!(
            QuerySpec::parse(&json!({"knn": {"vector": [1.0]}})).unwrap(),
            QuerySpec::MatchAll
        );
        assert_eq!(
            QuerySpec::parse(&json!({"match_all": {}})).unwrap(),
            QuerySpec::MatchAll
        );
    }

    #[test]
    fn test_wildcard_to_regex() {
        assert_eq!(wildcard_to_regex("re*"), "re.*");
        assert_eq!(wildcard_to_regex("r?d"), "r.d");
        assert_eq!(wildcard_to_regex("a.b*"), "a\\.b.*");
    }

    #[test]
    fn test_facet_bucket_limit_default() {
        let facet = FacetRequest {
            facet_type: "terms".to_string(),
            field: "category".to_string(),
            size: 0,
        };
        assert_eq!(facet.bucket_limit(), 10);
    }

    #[test]
    fn test_response_serializes_atlas_shape() {
        let response = SearchResponse {
            hits: vec![SearchHit {
                id: "a".to_string(),
                score: 1.5,
                source: Map::new(),
                highlight: None,
            }],
            total: 1,
            facets: None,
            max_score: 1.5,
            partial: false,
            failed_shards: Vec::new(),
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["hits"][0]["_id"], "a");
        assert_eq!(json["maxScore"], 1.5);
        assert!(json.get("partial").is_none());
        assert!(json.get("failed_shards").is_none());
    }
}
