//! Error types shared by the query pipeline.

use crate::token::Span;
use thiserror::Error;

/// Errors produced while turning query text into a compiled plan.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// The lexer or the parser rejected the text.
    #[error("syntax error: {message}")]
    Syntax { message: String, span: Option<Span> },

    /// The query is well formed but not usable for the requested query type.
    #[error("{0}")]
    Semantic(String),

    /// The query could not be lowered to SQL (pagination bounds, selector values).
    #[error("{0}")]
    Build(String),

    /// A guarantee established by an earlier stage did not hold.
    /// Never user-facing: the caller must fail the request outright.
    #[error("internal error: {0}")]
    Internal(String),
}

impl QueryError {
    pub fn syntax(message: impl Into<String>, span: Option<Span>) -> Self {
        QueryError::Syntax {
            message: message.into(),
            span,
        }
    }

    pub fn syntax_at(message: impl Into<String>, span: Span) -> Self {
        Self::syntax(message, Some(span))
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, QueryError::Internal(_))
    }
}

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),

    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors surfaced by the query service.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid query: {0}")]
    Query(#[from] QueryError),

    #[error("query is required for group queries")]
    MissingQuery,

    /// A detail lookup matched no record visible to the caller.
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("query execution failed: {0}")]
    Execution(#[source] anyhow::Error),

    #[error("unexpected row shape: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ServiceError {
    /// True when the failure is a bug on our side rather than bad input.
    pub fn is_internal(&self) -> bool {
        match self {
            ServiceError::Query(e) => e.is_internal(),
            ServiceError::MissingQuery | ServiceError::NotFound(_) => false,
            ServiceError::Execution(_) | ServiceError::Decode(_) => true,
        }
    }
}
