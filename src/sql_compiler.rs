//! SQL compiler that lowers the query AST into paginated, parameterized statements using sea-query.
//!
//! Every statement has the same two-level shape:
//!
//! ```text
//! WITH cte AS (
//!     SELECT ...                -- ownership, date range, predicates, grouping
//! )
//! SELECT cte.*, COUNT(*) OVER () AS total_count [, ...]
//! FROM cte ORDER BY ... LIMIT ? [OFFSET ?]
//! ```
//!
//! The inner selection does the filtering; the outer one reports the
//! pre-pagination row count on every row and applies the page window.

use crate::ast::{
    CompoundSelectQuery, EqualityOperator, GroupQuery, GroupToken, LogicalOperator,
    Query as AstQuery, SelectQuery,
};
use crate::config::{CompilerConfig, TableNames};
use crate::dialect::{Dialect, Postgres};
use crate::error::QueryError;
use crate::validator::{QueryType, GROUP_BY_REQUIRED};
use sea_query::{
    Alias, Asterisk, ColumnRef, CommonTableExpression, Cond, Condition, Expr, Func, Iden,
    IntoColumnRef, JoinType, Order, Query, QueryStatementBuilder, SelectStatement, SimpleExpr,
    Value, Values, WindowStatement, WithClause, WithQuery,
};
use tracing::{debug, error};
use uuid::Uuid;

/// Page size used when the query does not set `limit`.
pub const DEFAULT_LIMIT: u64 = 100;
/// Hard ceiling on the page size.
pub const MAX_LIMIT: u64 = 100;

const CTE_NAME: &str = "cte";

/// Table identifier resolved from configuration.
#[derive(Debug, Clone)]
pub struct TableName(pub String);

impl Iden for TableName {
    fn unquoted(&self, s: &mut dyn std::fmt::Write) {
        write!(s, "{}", self.0).unwrap();
    }
}

/// Column identifiers of the sessions, testcases and labels tables,
/// plus the computed columns the compiler projects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Id,
    SessionId,
    UserId,
    Name,
    Classname,
    Testsuite,
    File,
    Status,
    CreatedAt,
    Description,
    Output,
    Baggage,
    Key,
    Value,
    AggregatedStatus,
    TestcaseCount,
    TotalCount,
}

impl Iden for Column {
    fn unquoted(&self, s: &mut dyn std::fmt::Write) {
        let name = match self {
            Column::Id => "id",
            Column::SessionId => "session_id",
            Column::UserId => "user_id",
            Column::Name => "name",
            Column::Classname => "classname",
            Column::Testsuite => "testsuite",
            Column::File => "file",
            Column::Status => "status",
            Column::CreatedAt => "created_at",
            Column::Description => "description",
            Column::Output => "output",
            Column::Baggage => "baggage",
            Column::Key => "key",
            Column::Value => "value",
            Column::AggregatedStatus => "aggregated_status",
            Column::TestcaseCount => "testcase_count",
            Column::TotalCount => "total_count",
        };
        write!(s, "{}", name).unwrap();
    }
}

/// Which record type a plan returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Testcases,
    Sessions,
    Groups,
    TestcaseDetail,
    SessionDetail,
    Labels,
}

/// One projected group column of a group enumeration plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupColumn {
    /// Output column name, `group_<position>`.
    pub alias: String,
    pub token: GroupToken,
}

/// Normalised page window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub offset: u64,
    pub limit: u64,
}

/// Compiled statement of a plan.
#[derive(Debug, Clone)]
pub enum Statement {
    /// `WITH cte AS (...)` list query with the page window applied.
    Paged(WithQuery),
    /// Plain lookup of a single record or its labels.
    Lookup(SelectStatement),
}

/// A compiled query, ready to be rendered for its dialect.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub kind: RecordKind,
    pub statement: Statement,
    /// Empty unless `kind` is `Groups`.
    pub group_columns: Vec<GroupColumn>,
    /// `None` for lookups.
    pub pagination: Option<Pagination>,
    dialect: &'static dyn Dialect,
}

impl QueryPlan {
    /// SQL text with placeholders and the values bound to them.
    pub fn to_sql(&self) -> (String, Values) {
        let builder = self.dialect.query_builder();
        match &self.statement {
            Statement::Paged(query) => query.build_any(builder),
            Statement::Lookup(select) => select.build_any(builder),
        }
    }

    pub fn dialect(&self) -> &'static dyn Dialect {
        self.dialect
    }
}

/// Validates `offset` and applies the default and maximum page size.
pub fn normalize_pagination(offset: i64, limit: i64) -> Result<Pagination, QueryError> {
    if offset < 0 {
        return Err(QueryError::Build("offset must be non-negative".to_string()));
    }
    let limit = match limit {
        0 => DEFAULT_LIMIT,
        l if l < 0 => return Err(QueryError::Build("limit must be positive".to_string())),
        l if l as u64 > MAX_LIMIT => {
            return Err(QueryError::Build(format!(
                "limit cannot exceed {}",
                MAX_LIMIT
            )))
        }
        l => l as u64,
    };
    Ok(Pagination {
        offset: offset as u64,
        limit,
    })
}

fn internal(message: &str) -> QueryError {
    error!(reason = message, "query invariant violated");
    QueryError::Internal(message.to_string())
}

fn parse_selector_uuid(value: &str) -> Result<Uuid, QueryError> {
    Uuid::parse_str(value)
        .map_err(|_| QueryError::Build(format!("invalid selector value: {}", value)))
}

fn equality(op: EqualityOperator, column: ColumnRef, value: impl Into<SimpleExpr>) -> SimpleExpr {
    let col = Expr::col(column);
    match op {
        EqualityOperator::Eq => col.eq(value),
        EqualityOperator::NotEq => col.ne(value),
    }
}

fn cte() -> Alias {
    Alias::new(CTE_NAME)
}

/// SQL Compiler that converts the AST to SQL query plans
#[derive(Debug, Clone)]
pub struct SqlCompiler {
    dialect: &'static dyn Dialect,
    tables: TableNames,
}

impl Default for SqlCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlCompiler {
    /// Postgres with the default table names.
    pub fn new() -> Self {
        Self::with_dialect(&Postgres)
    }

    pub fn with_dialect(dialect: &'static dyn Dialect) -> Self {
        Self {
            dialect,
            tables: TableNames::default(),
        }
    }

    pub fn from_config(config: &CompilerConfig) -> Self {
        Self {
            dialect: config.dialect.dialect(),
            tables: config.tables.clone(),
        }
    }

    pub fn dialect(&self) -> &'static dyn Dialect {
        self.dialect
    }

    fn sessions(&self) -> TableName {
        TableName(self.tables.sessions.clone())
    }

    fn testcases(&self) -> TableName {
        TableName(self.tables.testcases.clone())
    }

    fn labels(&self) -> TableName {
        TableName(self.tables.labels.clone())
    }

    fn testcase_col(&self, column: Column) -> ColumnRef {
        (self.testcases(), column).into_column_ref()
    }

    /// Dispatches to the builder matching `query_type`.
    pub fn compile(
        &self,
        owner: Uuid,
        query: &AstQuery,
        query_type: QueryType,
    ) -> Result<QueryPlan, QueryError> {
        match query_type {
            QueryType::TestcaseList => self.compile_testcase_query(owner, query),
            QueryType::SessionList => self.compile_session_query(owner, query),
            QueryType::GroupEnumeration => self.compile_group_query(owner, query),
        }
    }

    /// Lists testcases newest first. The outer query also reports the worst
    /// status across the whole filtered set as `aggregated_status`.
    pub fn compile_testcase_query(
        &self,
        owner: Uuid,
        query: &AstQuery,
    ) -> Result<QueryPlan, QueryError> {
        let pagination = normalize_pagination(query.offset, query.limit)?;
        let testcases = self.testcases();
        let session_key = self.testcase_col(Column::SessionId);

        let mut condition = self.scope_condition(owner, &testcases, query);
        if let Some(filter) = self.lower_compound(&query.select, &session_key)? {
            condition = condition.add(filter);
        }
        for filter in self.list_selector_filters(query, &session_key)? {
            condition = condition.add(filter);
        }

        let mut inner = Query::select();
        inner
            .column((testcases.clone(), Asterisk))
            .from(testcases.clone())
            .cond_where(condition)
            .order_by((testcases, Column::CreatedAt), Order::Desc);

        let mut outer = self.outer_select(pagination);
        outer
            .expr_window_as(
                Func::min(Expr::col((cte(), Column::Status))),
                WindowStatement::new(),
                Column::AggregatedStatus,
            )
            .order_by((cte(), Column::CreatedAt), Order::Desc);

        Ok(self.finish(RecordKind::Testcases, inner, outer, Vec::new(), pagination))
    }

    /// Lists sessions newest first with `MIN(status)` over their testcases.
    /// Sessions without testcases get a NULL `aggregated_status`.
    pub fn compile_session_query(
        &self,
        owner: Uuid,
        query: &AstQuery,
    ) -> Result<QueryPlan, QueryError> {
        let pagination = normalize_pagination(query.offset, query.limit)?;
        let sessions = self.sessions();
        let testcases = self.testcases();
        let session_key = (sessions.clone(), Column::Id).into_column_ref();

        let mut condition = self.scope_condition(owner, &sessions, query);
        if let Some(filter) = self.lower_compound(&query.select, &session_key)? {
            condition = condition.add(filter);
        }
        for filter in self.list_selector_filters(query, &session_key)? {
            condition = condition.add(filter);
        }

        let mut inner = Query::select();
        inner
            .column((sessions.clone(), Asterisk))
            .expr_as(
                Func::min(Expr::col((testcases.clone(), Column::Status))),
                Column::AggregatedStatus,
            )
            .from(sessions.clone())
            .join(
                JoinType::LeftJoin,
                testcases.clone(),
                Expr::col((sessions.clone(), Column::Id))
                    .equals((testcases, Column::SessionId)),
            )
            .cond_where(condition)
            .group_by_col((sessions.clone(), Column::Id))
            .order_by((sessions, Column::CreatedAt), Order::Desc);

        let mut outer = self.outer_select(pagination);
        outer.order_by((cte(), Column::CreatedAt), Order::Desc);

        Ok(self.finish(RecordKind::Sessions, inner, outer, Vec::new(), pagination))
    }

    /// Enumerates the groups of testcases described by `group_by(...)`.
    ///
    /// Each tag token joins its own aliased copy of the labels table
    /// (`l0`, `l1`, ...) so several tags can be grouped on at once.
    pub fn compile_group_query(
        &self,
        owner: Uuid,
        query: &AstQuery,
    ) -> Result<QueryPlan, QueryError> {
        let pagination = normalize_pagination(query.offset, query.limit)?;
        let group = match &query.group {
            Some(group) if !group.tokens.is_empty() => group,
            _ => return Err(QueryError::Semantic(GROUP_BY_REQUIRED.to_string())),
        };
        let selector = match &query.group_selector {
            Some(values) if values.len() != group.tokens.len() => {
                return Err(internal("grouping/selector mismatch"))
            }
            Some(values) => Some(values.as_slice()),
            None => None,
        };

        let testcases = self.testcases();
        let labels = self.labels();
        let session_key = self.testcase_col(Column::SessionId);

        let mut inner = Query::select();
        inner.from(testcases.clone());
        let mut condition = self.scope_condition(owner, &testcases, query);
        let mut group_columns = Vec::with_capacity(group.tokens.len());
        let mut label_index = 0;

        for (position, token) in group.tokens.iter().enumerate() {
            let source = match token {
                GroupToken::BySession => session_key.clone(),
                GroupToken::ByTag { tag } => {
                    let alias = Alias::new(format!("l{}", label_index));
                    label_index += 1;
                    inner.join_as(
                        JoinType::InnerJoin,
                        labels.clone(),
                        alias.clone(),
                        Cond::all()
                            .add(
                                Expr::col(session_key.clone())
                                    .equals((alias.clone(), Column::SessionId)),
                            )
                            .add(Expr::col((alias.clone(), Column::Key)).eq(tag.as_str())),
                    );
                    (alias, Column::Value).into_column_ref()
                }
            };

            if let Some(values) = selector {
                let value = values[position].as_str();
                let pinned = match token {
                    GroupToken::BySession => {
                        let id = parse_selector_uuid(value)?;
                        Expr::col(source.clone()).eq(self.dialect.uuid_value(id))
                    }
                    GroupToken::ByTag { .. } => Expr::col(source.clone()).eq(value),
                };
                condition = condition.add(pinned);
            }

            let alias = format!("group_{}", position);
            inner
                .expr_as(Expr::col(source.clone()), Alias::new(alias.clone()))
                .group_by_col(source.clone())
                .order_by(source, Order::Asc);
            group_columns.push(GroupColumn {
                alias,
                token: token.clone(),
            });
        }

        inner
            .expr_as(
                Func::min(Expr::col((testcases.clone(), Column::Status))),
                Column::AggregatedStatus,
            )
            .expr_as(
                Func::count_distinct(Expr::col((testcases, Column::Id))),
                Column::TestcaseCount,
            );

        if let Some(filter) = self.lower_compound(&query.select, &session_key)? {
            condition = condition.add(filter);
        }
        inner.cond_where(condition);

        let mut outer = self.outer_select(pagination);
        for column in &group_columns {
            outer.order_by((cte(), Alias::new(column.alias.clone())), Order::Asc);
        }

        Ok(self.finish(RecordKind::Groups, inner, outer, group_columns, pagination))
    }

    /// One testcase with all of its columns, only if `owner` owns it.
    pub fn compile_testcase_detail(&self, owner: Uuid, id: Uuid) -> QueryPlan {
        let testcases = self.testcases();
        let mut select = Query::select();
        select
            .column((testcases.clone(), Asterisk))
            .from(testcases.clone())
            .cond_where(
                Cond::all()
                    .add(Expr::col((testcases.clone(), Column::Id)).eq(self.dialect.uuid_value(id)))
                    .add(Expr::col((testcases, Column::UserId)).eq(self.dialect.uuid_value(owner))),
            )
            .limit(1);
        self.lookup(RecordKind::TestcaseDetail, select)
    }

    /// One session with `MIN(status)` over its testcases as `aggregated_status`.
    pub fn compile_session_detail(&self, owner: Uuid, id: Uuid) -> QueryPlan {
        let sessions = self.sessions();
        let testcases = self.testcases();
        let mut select = Query::select();
        select
            .column((sessions.clone(), Asterisk))
            .expr_as(
                Func::min(Expr::col((testcases.clone(), Column::Status))),
                Column::AggregatedStatus,
            )
            .from(sessions.clone())
            .join(
                JoinType::LeftJoin,
                testcases.clone(),
                Expr::col((sessions.clone(), Column::Id)).equals((testcases, Column::SessionId)),
            )
            .cond_where(
                Cond::all()
                    .add(Expr::col((sessions.clone(), Column::Id)).eq(self.dialect.uuid_value(id)))
                    .add(
                        Expr::col((sessions.clone(), Column::UserId))
                            .eq(self.dialect.uuid_value(owner)),
                    ),
            )
            .group_by_col((sessions, Column::Id));
        self.lookup(RecordKind::SessionDetail, select)
    }

    /// `key`/`value` pairs attached to a session, ordered by key.
    pub fn compile_label_lookup(&self, owner: Uuid, session_id: Uuid) -> QueryPlan {
        let labels = self.labels();
        let mut select = Query::select();
        select
            .column((labels.clone(), Column::Key))
            .column((labels.clone(), Column::Value))
            .from(labels.clone())
            .cond_where(
                Cond::all()
                    .add(
                        Expr::col((labels.clone(), Column::SessionId))
                            .eq(self.dialect.uuid_value(session_id)),
                    )
                    .add(Expr::col((labels.clone(), Column::UserId)).eq(self.dialect.uuid_value(owner))),
            )
            .order_by((labels, Column::Key), Order::Asc);
        self.lookup(RecordKind::Labels, select)
    }

    /// Owner scoping and the optional date range, always applied.
    fn scope_condition(&self, owner: Uuid, table: &TableName, query: &AstQuery) -> Condition {
        let mut condition = Cond::all()
            .add(Expr::col((table.clone(), Column::UserId)).eq(self.dialect.uuid_value(owner)));
        if let Some(start) = query.start_date {
            condition = condition.add(Expr::col((table.clone(), Column::CreatedAt)).gte(start));
        }
        if let Some(end) = query.end_date {
            condition = condition.add(Expr::col((table.clone(), Column::CreatedAt)).lte(end));
        }
        condition
    }

    /// Folds the flat predicate chain strictly left to right:
    /// `p1 op2 p2 op3 p3` becomes `((p1 op2 p2) op3 p3)`.
    fn lower_compound(
        &self,
        compound: &CompoundSelectQuery,
        session_key: &ColumnRef,
    ) -> Result<Option<Condition>, QueryError> {
        match compound.parts.first() {
            None => return Ok(None),
            Some(first) if first.op != LogicalOperator::And => {
                return Err(internal(
                    "invalid operator in the first part of compound select query",
                ))
            }
            Some(_) => {}
        }

        let mut folded: Option<Condition> = None;
        for part in &compound.parts {
            let Some(expr) = self.lower_predicate(&part.query, session_key) else {
                continue;
            };
            folded = Some(match (folded, part.op) {
                (None, _) => Cond::all().add(expr),
                (Some(acc), LogicalOperator::And) => Cond::all().add(acc).add(expr),
                (Some(acc), LogicalOperator::Or) => Cond::any().add(acc).add(expr),
            });
        }
        Ok(folded)
    }

    fn lower_predicate(&self, predicate: &SelectQuery, session_key: &ColumnRef) -> Option<SimpleExpr> {
        let expr = match predicate {
            SelectQuery::Empty => return None,
            SelectQuery::BySessionId { id, op } => {
                equality(*op, session_key.clone(), self.dialect.uuid_value(*id))
            }
            SelectQuery::ById { id, op } => equality(
                *op,
                self.testcase_col(Column::Id),
                self.dialect.uuid_value(*id),
            ),
            SelectQuery::ByName { value, op } => {
                equality(*op, self.testcase_col(Column::Name), value.as_str())
            }
            SelectQuery::ByClassname { value, op } => {
                equality(*op, self.testcase_col(Column::Classname), value.as_str())
            }
            SelectQuery::ByTestsuite { value, op } => {
                equality(*op, self.testcase_col(Column::Testsuite), value.as_str())
            }
            SelectQuery::ByFile { value, op } => {
                equality(*op, self.testcase_col(Column::File), value.as_str())
            }
            SelectQuery::ByStatus { status, op } => {
                equality(*op, self.testcase_col(Column::Status), status.rank())
            }
            SelectQuery::HasTag { tag, op } => self.label_membership(*op, session_key, tag, None),
            SelectQuery::TagEquals { tag, value, op } => {
                self.label_membership(*op, session_key, tag, Some(value))
            }
        };
        Some(expr)
    }

    /// `key [NOT] IN (SELECT session_id FROM labels WHERE key = ? [AND value = ?])`
    fn label_membership(
        &self,
        op: EqualityOperator,
        session_key: &ColumnRef,
        tag: &str,
        value: Option<&str>,
    ) -> SimpleExpr {
        let labels = self.labels();
        let mut subquery = Query::select();
        subquery
            .column((labels.clone(), Column::SessionId))
            .from(labels.clone())
            .and_where(Expr::col((labels.clone(), Column::Key)).eq(tag));
        if let Some(value) = value {
            subquery.and_where(Expr::col((labels, Column::Value)).eq(value));
        }

        let key = Expr::col(session_key.clone());
        match op {
            EqualityOperator::Eq => key.in_subquery(subquery),
            EqualityOperator::NotEq => key.not_in_subquery(subquery),
        }
    }

    /// Pins a grouped list query to the single group named by its selector.
    fn list_selector_filters(
        &self,
        query: &AstQuery,
        session_key: &ColumnRef,
    ) -> Result<Vec<SimpleExpr>, QueryError> {
        let Some(GroupQuery { tokens }) = &query.group else {
            return Ok(Vec::new());
        };
        let values = match &query.group_selector {
            Some(values) if values.len() == tokens.len() => values,
            _ => return Err(internal("grouping/selector mismatch")),
        };

        tokens
            .iter()
            .zip(values)
            .map(|(token, value)| match token {
                GroupToken::BySession => {
                    let id = parse_selector_uuid(value)?;
                    Ok(Expr::col(session_key.clone()).eq(self.dialect.uuid_value(id)))
                }
                GroupToken::ByTag { tag } => Ok(self.label_membership(
                    EqualityOperator::Eq,
                    session_key,
                    tag,
                    Some(value),
                )),
            })
            .collect()
    }

    /// `SELECT cte.*, COUNT(*) OVER () AS total_count FROM cte LIMIT ? OFFSET ?`
    fn outer_select(&self, pagination: Pagination) -> SelectStatement {
        let mut outer = Query::select();
        outer
            .column((cte(), Asterisk))
            .expr_window_as(
                Func::count(Expr::col(Asterisk)),
                WindowStatement::new(),
                Column::TotalCount,
            )
            .from(cte())
            .limit(pagination.limit);
        if pagination.offset > 0 {
            outer.offset(pagination.offset);
        }
        outer
    }

    fn finish(
        &self,
        kind: RecordKind,
        inner: SelectStatement,
        outer: SelectStatement,
        group_columns: Vec<GroupColumn>,
        pagination: Pagination,
    ) -> QueryPlan {
        let table = CommonTableExpression::new()
            .query(inner)
            .table_name(cte())
            .to_owned();
        let with = WithClause::new().cte(table).to_owned();

        debug!(
            ?kind,
            dialect = self.dialect.name(),
            offset = pagination.offset,
            limit = pagination.limit,
            "compiled query plan"
        );

        QueryPlan {
            kind,
            statement: Statement::Paged(outer.with(with)),
            group_columns,
            pagination: Some(pagination),
            dialect: self.dialect,
        }
    }

    fn lookup(&self, kind: RecordKind, select: SelectStatement) -> QueryPlan {
        debug!(?kind, dialect = self.dialect.name(), "compiled lookup plan");
        QueryPlan {
            kind,
            statement: Statement::Lookup(select),
            group_columns: Vec::new(),
            pagination: None,
            dialect: self.dialect,
        }
    }
}

/// Placeholder-free rendering, only for display purposes.
pub fn describe_values(values: &Values) -> Vec<String> {
    values
        .0
        .iter()
        .map(|value| match value {
            Value::String(Some(s)) => format!("'{}'", s),
            Value::Uuid(Some(id)) => format!("'{}'", id),
            Value::Bytes(Some(bytes)) => match Uuid::from_slice(bytes) {
                Ok(id) => format!("uuid_bytes({})", id),
                Err(_) => format!("bytes({})", bytes.len()),
            },
            Value::Int(Some(n)) => n.to_string(),
            Value::BigUnsigned(Some(n)) => n.to_string(),
            Value::BigInt(Some(n)) => n.to_string(),
            Value::ChronoDateTime(Some(ts)) => format!("'{}'", ts),
            other => format!("{:?}", other),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::TestcaseStatus;
    use crate::dialect::{MySql, Sqlite};
    use crate::parser::parse;
    use crate::validator::validate;

    const OWNER: &str = "aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa";
    const SESSION: &str = "11111111-1111-1111-1111-111111111111";

    fn owner() -> Uuid {
        Uuid::parse_str(OWNER).unwrap()
    }

    fn compile(input: &str, query_type: QueryType) -> Result<QueryPlan, QueryError> {
        let query = parse(input).unwrap();
        validate(&query, query_type)?;
        SqlCompiler::new().compile(owner(), &query, query_type)
    }

    fn render(input: &str, query_type: QueryType) -> (String, Vec<Value>) {
        let (sql, values) = compile(input, query_type).unwrap().to_sql();
        (sql, values.0)
    }

    fn uuid(s: &str) -> Value {
        Value::Uuid(Some(Box::new(Uuid::parse_str(s).unwrap())))
    }

    fn text(s: &str) -> Value {
        Value::from(s.to_string())
    }

    #[test]
    fn test_pagination_bounds() {
        assert_eq!(
            normalize_pagination(0, 0),
            Ok(Pagination {
                offset: 0,
                limit: 100
            })
        );
        assert_eq!(normalize_pagination(5, 100).unwrap().limit, 100);
        assert_eq!(normalize_pagination(5, 1).unwrap().limit, 1);
        assert_eq!(
            normalize_pagination(0, 101),
            Err(QueryError::Build("limit cannot exceed 100".to_string()))
        );
        assert_eq!(
            normalize_pagination(-1, 10),
            Err(QueryError::Build("offset must be non-negative".to_string()))
        );
        assert_eq!(
            normalize_pagination(0, -3),
            Err(QueryError::Build("limit must be positive".to_string()))
        );
    }

    #[test]
    fn test_limit_bounds_through_compiler() {
        assert!(compile("limit=101", QueryType::TestcaseList).is_err());
        let plan = compile("limit=100", QueryType::TestcaseList).unwrap();
        assert_eq!(plan.pagination.unwrap().limit, 100);
        let plan = compile("", QueryType::SessionList).unwrap();
        assert_eq!(plan.pagination.unwrap().limit, DEFAULT_LIMIT);

        let mut query = parse("").unwrap();
        query.offset = -1;
        assert!(SqlCompiler::new()
            .compile_testcase_query(owner(), &query)
            .is_err());
    }

    #[test]
    fn test_empty_query_is_owner_scoped_only() {
        let (sql, values) = render("", QueryType::TestcaseList);
        assert!(sql.contains(r#""cte" AS (SELECT "testcases".* FROM "testcases""#));
        assert!(sql.contains(r#"WHERE "testcases"."user_id" = $1"#));
        assert!(sql.contains(r#"ORDER BY "testcases"."created_at" DESC"#));
        assert!(sql.contains("COUNT(*) OVER"));
        assert!(sql.contains(r#"AS "total_count""#));
        assert!(sql.contains(r#"AS "aggregated_status""#));
        assert!(!sql.contains("OFFSET"));
        assert_eq!(values[0], uuid(OWNER));
        assert_eq!(values.len(), 2); // owner + limit
    }

    #[test]
    fn test_offset_is_rendered_when_positive() {
        let (sql, values) = render("offset=20 limit=10", QueryType::TestcaseList);
        assert!(sql.contains("LIMIT"));
        assert!(sql.contains("OFFSET"));
        assert!(values.contains(&Value::from(10u64)));
        assert!(values.contains(&Value::from(20u64)));
    }

    #[test]
    fn test_single_predicate_and_status_rank() {
        let (sql, values) = render(r#"status = "fail""#, QueryType::TestcaseList);
        assert!(sql.contains(r#""testcases"."status" = $2"#));
        assert_eq!(values[1], Value::from(TestcaseStatus::Fail.rank()));

        let (sql, _) = render(r#"name != "x""#, QueryType::TestcaseList);
        assert!(sql.contains(r#""testcases"."name" <> $2"#));
    }

    #[test]
    fn test_or_chain() {
        let (sql, values) = render(r#"status = "pass" or status = "fail""#, QueryType::TestcaseList);
        assert!(sql.contains(r#""testcases"."status" = $2 OR "testcases"."status" = $3"#));
        assert_eq!(values[1], Value::from(2));
        assert_eq!(values[2], Value::from(1));
    }

    #[test]
    fn test_chain_folds_left_to_right() {
        let (sql, _) = render(
            r#"name = "a" and name = "b" or status = "pass""#,
            QueryType::TestcaseList,
        );
        assert!(sql.contains(
            r#"("testcases"."name" = $2 AND "testcases"."name" = $3) OR "testcases"."status" = $4"#
        ));

        let (sql, _) = render(
            r#"name = "a" or name = "b" and status = "pass""#,
            QueryType::TestcaseList,
        );
        assert!(sql.contains(
            r#"("testcases"."name" = $2 OR "testcases"."name" = $3) AND "testcases"."status" = $4"#
        ));
    }

    #[test]
    fn test_tag_predicates_use_subqueries() {
        let (sql, values) = render(r#"#"os" = "linux""#, QueryType::TestcaseList);
        assert!(sql.contains(
            r#""testcases"."session_id" IN (SELECT "labels"."session_id" FROM "labels" WHERE "labels"."key" = $2 AND "labels"."value" = $3)"#
        ));
        assert_eq!(values[1], text("os"));
        assert_eq!(values[2], text("linux"));

        let (sql, values) = render(r#"!#"flaky""#, QueryType::TestcaseList);
        assert!(sql.contains(r#""testcases"."session_id" NOT IN (SELECT "labels"."session_id""#));
        assert!(!sql.contains(r#""labels"."value""#));
        assert_eq!(values[1], text("flaky"));
        assert!(!sql.contains("JOIN"));
    }

    #[test]
    fn test_date_range() {
        let (sql, _) = render(
            r#"start_date = "2025/01/01 00:00:00" end_date = "2025/12/31 23:59:59""#,
            QueryType::TestcaseList,
        );
        assert!(sql.contains(r#""testcases"."created_at" >= $2"#));
        assert!(sql.contains(r#""testcases"."created_at" <= $3"#));
    }

    #[test]
    fn test_testcase_list_pinned_to_group() {
        let input = format!(
            r#"group_by(session_id, #"env") group = ("{}", "prod")"#,
            SESSION
        );
        let (sql, values) = render(&input, QueryType::TestcaseList);
        assert!(sql.contains(r#""testcases"."session_id" = $2"#));
        assert!(sql.contains(r#""testcases"."session_id" IN (SELECT"#));
        assert_eq!(values[1], uuid(SESSION));
        assert!(values.contains(&text("env")));
        assert!(values.contains(&text("prod")));
    }

    #[test]
    fn test_invalid_selector_uuid_is_build_error() {
        let err = compile(
            r#"group_by(session_id) group = ("s1")"#,
            QueryType::TestcaseList,
        )
        .unwrap_err();
        assert_eq!(err, QueryError::Build("invalid selector value: s1".to_string()));
        assert!(!err.is_internal());
    }

    #[test]
    fn test_unvalidated_selector_mismatch_is_internal() {
        let query = parse(r#"group_by(session_id, #"env") group = ("s1")"#).unwrap();
        let compiler = SqlCompiler::new();
        assert!(compiler
            .compile_testcase_query(owner(), &query)
            .unwrap_err()
            .is_internal());
        assert!(compiler
            .compile_session_query(owner(), &query)
            .unwrap_err()
            .is_internal());
        assert!(compiler
            .compile_group_query(owner(), &query)
            .unwrap_err()
            .is_internal());

        let query = parse(r#"group_by(session_id)"#).unwrap();
        assert!(compiler
            .compile_testcase_query(owner(), &query)
            .unwrap_err()
            .is_internal());
    }

    #[test]
    fn test_first_part_must_be_and() {
        let mut query = parse(r#"name = "a""#).unwrap();
        query.select.parts[0].op = LogicalOperator::Or;
        let err = SqlCompiler::new()
            .compile_testcase_query(owner(), &query)
            .unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn test_session_query_shape() {
        let (sql, values) = render(r#"#"env" = "prod""#, QueryType::SessionList);
        assert!(sql.contains(r#"SELECT "sessions".*, MIN("testcases"."status") AS "aggregated_status""#));
        assert!(sql.contains(
            r#"LEFT JOIN "testcases" ON "sessions"."id" = "testcases"."session_id""#
        ));
        assert!(sql.contains(r#""sessions"."user_id" = $1"#));
        assert!(sql.contains(r#""sessions"."id" IN (SELECT "labels"."session_id""#));
        assert!(sql.contains(r#"GROUP BY "sessions"."id""#));
        assert!(sql.contains(r#"ORDER BY "sessions"."created_at" DESC"#));
        assert!(sql.contains(r#"AS "total_count""#));
        assert_eq!(values[0], uuid(OWNER));
    }

    #[test]
    fn test_session_id_predicate_targets_session_key() {
        let input = format!(r#"session_id = "{}""#, SESSION);
        let (sql, _) = render(&input, QueryType::SessionList);
        assert!(sql.contains(r#""sessions"."id" = $2"#));
        let (sql, _) = render(&input, QueryType::TestcaseList);
        assert!(sql.contains(r#""testcases"."session_id" = $2"#));
    }

    #[test]
    fn test_group_query_shape() {
        let plan = compile(
            r#"status != "skip" group_by(session_id, #"env", #"os")"#,
            QueryType::GroupEnumeration,
        )
        .unwrap();
        assert_eq!(plan.kind, RecordKind::Groups);
        let aliases: Vec<_> = plan.group_columns.iter().map(|c| c.alias.as_str()).collect();
        assert_eq!(aliases, vec!["group_0", "group_1", "group_2"]);

        let (sql, values) = plan.to_sql();
        assert!(sql.contains(r#"INNER JOIN "labels" AS "l0""#));
        assert!(sql.contains(r#"INNER JOIN "labels" AS "l1""#));
        assert!(sql.contains(r#""testcases"."session_id" AS "group_0""#));
        assert!(sql.contains(r#""l0"."value" AS "group_1""#));
        assert!(sql.contains(r#""l1"."value" AS "group_2""#));
        assert!(sql.contains(r#"COUNT(DISTINCT "testcases"."id") AS "testcase_count""#));
        assert!(sql.contains(r#"MIN("testcases"."status") AS "aggregated_status""#));
        assert!(sql.contains(r#"GROUP BY "testcases"."session_id", "l0"."value", "l1"."value""#));
        assert!(sql.contains(r#""testcases"."status" <> $"#));
        assert!(values.0.contains(&text("env")));
        assert!(values.0.contains(&text("os")));
    }

    #[test]
    fn test_group_query_with_selector() {
        let input = format!(
            r#"group_by(#"env", session_id) group = ("prod", "{}")"#,
            SESSION
        );
        let (sql, values) = render(&input, QueryType::GroupEnumeration);
        assert!(sql.contains(r#""l0"."value" = $"#));
        assert!(values.contains(&text("prod")));
        assert!(values.contains(&uuid(SESSION)));

        let err = compile(
            r#"group_by(session_id) group = ("nope")"#,
            QueryType::GroupEnumeration,
        )
        .unwrap_err();
        assert_eq!(err, QueryError::Build("invalid selector value: nope".to_string()));
    }

    #[test]
    fn test_group_query_requires_group_by() {
        let query = parse(r#"status = "pass""#).unwrap();
        assert_eq!(
            SqlCompiler::new().compile_group_query(owner(), &query).unwrap_err(),
            QueryError::Semantic(GROUP_BY_REQUIRED.to_string())
        );
    }

    #[test]
    fn test_mysql_and_sqlite_bind_binary_uuids() {
        let query = parse(r#"status = "pass""#).unwrap();
        let id = owner();

        let plan = SqlCompiler::with_dialect(&MySql)
            .compile_testcase_query(id, &query)
            .unwrap();
        let (sql, values) = plan.to_sql();
        assert!(sql.contains("`testcases`.`user_id` = ?"));
        assert_eq!(values.0[0], Value::from(id.as_bytes().to_vec()));

        let plan = SqlCompiler::with_dialect(&Sqlite)
            .compile_testcase_query(id, &query)
            .unwrap();
        let (sql, values) = plan.to_sql();
        assert!(sql.contains(r#""testcases"."user_id" = ?"#));
        assert_eq!(values.0[0], Value::from(id.as_bytes().to_vec()));
        assert_eq!(plan.dialect().name(), "sqlite");
    }

    #[test]
    fn test_configured_table_names() {
        let config = CompilerConfig::from_json_str(
            r#"{"tables": {"sessions": "s", "testcases": "t", "labels": "l"}}"#,
        )
        .unwrap();
        let query = parse(r#"#"env""#).unwrap();
        let (sql, _) = SqlCompiler::from_config(&config)
            .compile_session_query(owner(), &query)
            .unwrap()
            .to_sql();
        assert!(sql.contains(r#"FROM "s" LEFT JOIN "t""#));
        assert!(sql.contains(r#"FROM "l" WHERE "l"."key""#));
    }

    #[test]
    fn test_values_are_never_inlined() {
        let (sql, values) = render(r#"name = "x' OR 1=1 --""#, QueryType::TestcaseList);
        assert!(!sql.contains("OR 1=1"));
        assert_eq!(values[1], text("x' OR 1=1 --"));
    }

    #[test]
    fn test_describe_values() {
        let (_, values) = compile(r#"status = "pass""#, QueryType::TestcaseList)
            .unwrap()
            .to_sql();
        let described = describe_values(&values);
        assert_eq!(described[0], format!("'{}'", OWNER));
        assert_eq!(described[1], "2");
    }

    #[test]
    fn test_detail_lookups_are_owner_scoped() {
        let compiler = SqlCompiler::new();
        let id = Uuid::parse_str(SESSION).unwrap();

        let plan = compiler.compile_testcase_detail(owner(), id);
        assert_eq!(plan.kind, RecordKind::TestcaseDetail);
        assert!(plan.pagination.is_none());
        let (sql, values) = plan.to_sql();
        assert!(!sql.contains("WITH"));
        assert!(sql.contains(
            r#"FROM "testcases" WHERE "testcases"."id" = $1 AND "testcases"."user_id" = $2"#
        ));
        assert_eq!(values.0[0], uuid(SESSION));
        assert_eq!(values.0[1], uuid(OWNER));

        let (sql, values) = compiler.compile_session_detail(owner(), id).to_sql();
        assert!(sql.contains(r#"MIN("testcases"."status") AS "aggregated_status""#));
        assert!(sql.contains(
            r#"LEFT JOIN "testcases" ON "sessions"."id" = "testcases"."session_id""#
        ));
        assert!(sql.contains(r#""sessions"."id" = $1 AND "sessions"."user_id" = $2"#));
        assert!(sql.contains(r#"GROUP BY "sessions"."id""#));
        assert_eq!(values.0.len(), 2);

        let plan = compiler.compile_label_lookup(owner(), id);
        assert_eq!(plan.kind, RecordKind::Labels);
        let (sql, _) = plan.to_sql();
        assert_eq!(
            sql,
            r#"SELECT "labels"."key", "labels"."value" FROM "labels" WHERE "labels"."session_id" = $1 AND "labels"."user_id" = $2 ORDER BY "labels"."key" ASC"#
        );
    }
}
