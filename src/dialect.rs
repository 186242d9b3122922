//! Per-database differences the compiler has to respect.

use sea_query::{MysqlQueryBuilder, PostgresQueryBuilder, QueryBuilder, SqliteQueryBuilder, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier quoting, placeholder style and UUID storage for one database.
pub trait Dialect: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// The sea-query backend that renders statements for this database.
    fn query_builder(&self) -> &'static dyn QueryBuilder;

    /// How a UUID is bound as a parameter.
    fn uuid_value(&self, id: Uuid) -> Value;
}

/// UUIDs are native and bound as typed `uuid` parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct Postgres;

/// UUIDs live in `BINARY(16)` columns.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySql;

/// UUIDs live in 16 byte `BLOB` columns.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sqlite;

impl Dialect for Postgres {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn query_builder(&self) -> &'static dyn QueryBuilder {
        &PostgresQueryBuilder
    }

    fn uuid_value(&self, id: Uuid) -> Value {
        Value::Uuid(Some(Box::new(id)))
    }
}

impl Dialect for MySql {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn query_builder(&self) -> &'static dyn QueryBuilder {
        &MysqlQueryBuilder
    }

    fn uuid_value(&self, id: Uuid) -> Value {
        Value::from(id.as_bytes().to_vec())
    }
}

impl Dialect for Sqlite {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn query_builder(&self) -> &'static dyn QueryBuilder {
        &SqliteQueryBuilder
    }

    fn uuid_value(&self, id: Uuid) -> Value {
        Value::from(id.as_bytes().to_vec())
    }
}

/// Configuration-level name of a dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectKind {
    #[default]
    Postgres,
    Mysql,
    Sqlite,
}

impl DialectKind {
    pub fn dialect(self) -> &'static dyn Dialect {
        match self {
            DialectKind::Postgres => &Postgres,
            DialectKind::Mysql => &MySql,
            DialectKind::Sqlite => &Sqlite,
        }
    }
}

impl FromStr for DialectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(DialectKind::Postgres),
            "mysql" => Ok(DialectKind::Mysql),
            "sqlite" => Ok(DialectKind::Sqlite),
            other => Err(format!(
                "unknown dialect '{}', expected postgres, mysql or sqlite",
                other
            )),
        }
    }
}

impl fmt::Display for DialectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dialect().name())
    }
}
