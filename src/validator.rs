//! Semantic checks that depend on why a query is being run.

use crate::ast::Query;
use crate::error::QueryError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const SELECTOR_COUNT_MISMATCH: &str =
    "group selector must have same number of values as group_by columns count";
pub const SELECTOR_REQUIRED: &str =
    "group selector is required when grouping results. Use: group_by(...) group = (...)";
pub const GROUP_BY_REQUIRED: &str = "group_by is required";

/// The caller's intent for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    SessionList,
    TestcaseList,
    GroupEnumeration,
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueryType::SessionList => "sessions",
            QueryType::TestcaseList => "testcases",
            QueryType::GroupEnumeration => "groups",
        })
    }
}

impl FromStr for QueryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sessions" | "session" => Ok(QueryType::SessionList),
            "testcases" | "testcase" => Ok(QueryType::TestcaseList),
            "groups" | "group" => Ok(QueryType::GroupEnumeration),
            other => Err(format!(
                "unknown query type '{}', expected sessions, testcases or groups",
                other
            )),
        }
    }
}

/// Checks the grouping clauses of `query` against the caller's intent.
///
/// List queries may only be grouped when a selector pins one group;
/// group enumeration needs a `group_by` and accepts an optional selector.
pub fn validate(query: &Query, query_type: QueryType) -> Result<(), QueryError> {
    match query_type {
        QueryType::SessionList | QueryType::TestcaseList => validate_list(query),
        QueryType::GroupEnumeration => validate_group_enumeration(query),
    }
}

fn validate_list(query: &Query) -> Result<(), QueryError> {
    let Some(group) = &query.group else {
        return Ok(());
    };
    match &query.group_selector {
        None => Err(QueryError::Semantic(SELECTOR_REQUIRED.to_string())),
        Some(selector) if selector.len() != group.tokens.len() => {
            Err(QueryError::Semantic(SELECTOR_COUNT_MISMATCH.to_string()))
        }
        Some(_) => Ok(()),
    }
}

fn validate_group_enumeration(query: &Query) -> Result<(), QueryError> {
    let Some(group) = &query.group else {
        return Err(QueryError::Semantic(GROUP_BY_REQUIRED.to_string()));
    };
    match &query.group_selector {
        Some(selector) if selector.len() != group.tokens.len() => {
            Err(QueryError::Semantic(SELECTOR_COUNT_MISMATCH.to_string()))
        }
        _ => Ok(()),
    }
}
