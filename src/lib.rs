//! 测试会话与测试用例的查询语言编译器
//!
//! 处理流程：词法分析 -> 语法分析 -> 语义校验 -> SQL 编译 -> 查询服务。

pub mod ast;
pub mod config;
pub mod dialect;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod query_service;
pub mod sql_compiler;
pub mod token;
pub mod validator;

pub use config::CompilerConfig;
pub use error::{ConfigError, QueryError, ServiceError};
pub use lexer::tokenize;
pub use parser::parse;
pub use query_service::{QueryExecutor, QueryParams, QueryResult, QueryService};
pub use sql_compiler::{QueryPlan, SqlCompiler};
pub use validator::{validate, QueryType};
