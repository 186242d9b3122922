//! Query service: text in, typed records out.
//!
//! The service owns the whole pipeline (parse, validate, compile) and hands
//! the compiled plan to a [`QueryExecutor`], which is the only part that
//! talks to a database.

use crate::ast::{GroupToken, Query, TestcaseStatus};
use crate::error::ServiceError;
use crate::parser::parse;
use crate::sql_compiler::{GroupColumn, QueryPlan, SqlCompiler, MAX_LIMIT};
use crate::validator::{validate, QueryType};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};
use uuid::Uuid;

/// One result row keyed by column name. UUID columns are expected as
/// canonical text and timestamps as text.
pub type Row = Map<String, Value>;

/// Runs compiled plans against a database.
pub trait QueryExecutor {
    fn fetch(&self, plan: &QueryPlan) -> anyhow::Result<Vec<Row>>;
}

/// Caller supplied query text and pagination overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryParams {
    pub query: String,
    /// Replaces the query's `offset` when positive.
    pub offset: i64,
    /// Replaces the query's `limit` when in `1..=100`.
    pub limit: i64,
}

impl QueryParams {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult<T> {
    pub results: Vec<T>,
    /// Number of matching records before pagination.
    pub total_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Testcase {
    pub id: Uuid,
    pub session_id: Uuid,
    pub name: String,
    #[serde(deserialize_with = "status_from_rank")]
    pub status: TestcaseStatus,
    #[serde(default)]
    pub classname: Option<String>,
    #[serde(default)]
    pub testsuite: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    #[serde(default)]
    pub description: Option<String>,
    /// Worst testcase status, `None` for a session without testcases.
    #[serde(
        rename(deserialize = "aggregated_status"),
        default,
        deserialize_with = "optional_status_from_rank"
    )]
    pub status: Option<TestcaseStatus>,
    pub created_at: String,
}

/// A single testcase with its full record and its session's labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestcaseDetail {
    pub id: Uuid,
    pub session_id: Uuid,
    pub name: String,
    #[serde(deserialize_with = "status_from_rank")]
    pub status: TestcaseStatus,
    #[serde(default)]
    pub classname: Option<String>,
    #[serde(default)]
    pub testsuite: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default, deserialize_with = "baggage")]
    pub baggage: Option<Value>,
    /// Ordered by key. A label without a value maps to `""`.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDetail {
    pub id: Uuid,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(
        rename(deserialize = "aggregated_status"),
        default,
        deserialize_with = "optional_status_from_rank"
    )]
    pub status: Option<TestcaseStatus>,
    #[serde(default, deserialize_with = "baggage")]
    pub baggage: Option<Value>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
struct LabelRow {
    key: String,
    value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Group {
    /// Group values in `group_by` order. Tag values may be NULL.
    pub values: Vec<Option<String>>,
    pub status: TestcaseStatus,
    pub testcase_count: i64,
}

impl Group {
    /// Values joined for display, NULLs shown as empty.
    pub fn label(&self) -> String {
        self.values
            .iter()
            .map(|value| value.as_deref().unwrap_or(""))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Column header for a group token, written the way it is queried.
pub fn group_header(token: &GroupToken) -> String {
    match token {
        GroupToken::BySession => "session_id".to_string(),
        GroupToken::ByTag { tag } => format!("#\"{}\"", tag),
    }
}

fn rank_to_status<E: de::Error>(rank: i64) -> Result<TestcaseStatus, E> {
    TestcaseStatus::from_rank(rank)
        .ok_or_else(|| E::custom(format!("unknown status rank {}", rank)))
}

fn status_from_rank<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TestcaseStatus, D::Error> {
    rank_to_status(i64::deserialize(deserializer)?)
}

fn optional_status_from_rank<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<TestcaseStatus>, D::Error> {
    Option::<i64>::deserialize(deserializer)?
        .map(rank_to_status)
        .transpose()
}

/// Baggage arrives either as JSON or as its text encoding. Text that is
/// not JSON is dropped.
fn baggage<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(text) => serde_json::from_str(&text).ok(),
        other => Some(other),
    })
}

fn row_i64(row: &Row, column: &str) -> Result<i64, ServiceError> {
    row.get(column).and_then(Value::as_i64).ok_or_else(|| {
        ServiceError::Decode(de::Error::custom(format!(
            "column `{}` is missing or not an integer",
            column
        )))
    })
}

/// Every row repeats the pre-pagination count; an empty page has none.
fn total_count(rows: &[Row]) -> Result<i64, ServiceError> {
    match rows.first() {
        Some(row) => row_i64(row, "total_count"),
        None => Ok(0),
    }
}

fn decode_group(row: &Row, columns: &[GroupColumn]) -> Result<Group, ServiceError> {
    let values = columns
        .iter()
        .map(|column| match row.get(&column.alias) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        })
        .collect();
    let rank = row
        .get("aggregated_status")
        .and_then(Value::as_i64)
        .ok_or_else(|| <serde_json::Error as de::Error>::missing_field("aggregated_status"))?;
    let status = rank_to_status::<serde_json::Error>(rank)?;
    Ok(Group {
        values,
        status,
        testcase_count: row_i64(row, "testcase_count")?,
    })
}

pub struct QueryService<E> {
    compiler: SqlCompiler,
    executor: E,
}

impl<E: QueryExecutor> QueryService<E> {
    pub fn new(compiler: SqlCompiler, executor: E) -> Self {
        Self { compiler, executor }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Testcases visible to `owner`, newest first.
    pub fn query_testcases(
        &self,
        owner: Uuid,
        params: &QueryParams,
    ) -> Result<QueryResult<Testcase>, ServiceError> {
        let (_, rows) = self.run(owner, params, QueryType::TestcaseList)?;
        let total_count = total_count(&rows)?;
        let results = rows
            .into_iter()
            .map(|row| serde_json::from_value(Value::Object(row)))
            .collect::<Result<Vec<Testcase>, _>>()?;
        Ok(QueryResult {
            results,
            total_count,
        })
    }

    /// Sessions visible to `owner`, newest first.
    pub fn query_sessions(
        &self,
        owner: Uuid,
        params: &QueryParams,
    ) -> Result<QueryResult<Session>, ServiceError> {
        let (_, rows) = self.run(owner, params, QueryType::SessionList)?;
        let total_count = total_count(&rows)?;
        let results = rows
            .into_iter()
            .map(|row| serde_json::from_value(Value::Object(row)))
            .collect::<Result<Vec<Session>, _>>()?;
        Ok(QueryResult {
            results,
            total_count,
        })
    }

    /// Groups of `owner`'s testcases. Requires non-empty query text.
    pub fn query_groups(
        &self,
        owner: Uuid,
        params: &QueryParams,
    ) -> Result<QueryResult<Group>, ServiceError> {
        if params.query.is_empty() {
            return Err(ServiceError::MissingQuery);
        }
        let (plan, rows) = self.run(owner, params, QueryType::GroupEnumeration)?;
        let mut total = total_count(&rows)?;
        let results = rows
            .iter()
            .map(|row| decode_group(row, &plan.group_columns))
            .collect::<Result<Vec<_>, _>>()?;
        if total == 0 {
            total = results.len() as i64;
        }
        Ok(QueryResult {
            results,
            total_count: total,
        })
    }

    /// One testcase owned by `owner`, with its session's labels.
    pub fn get_testcase(&self, owner: Uuid, id: Uuid) -> Result<TestcaseDetail, ServiceError> {
        let plan = self.compiler.compile_testcase_detail(owner, id);
        let row = self.fetch_one(&plan, "testcase")?;
        let mut detail: TestcaseDetail = serde_json::from_value(Value::Object(row))?;
        detail.labels = self.labels(owner, detail.session_id)?;
        Ok(detail)
    }

    /// One session owned by `owner`, with its labels and worst testcase status.
    pub fn get_session(&self, owner: Uuid, id: Uuid) -> Result<SessionDetail, ServiceError> {
        let plan = self.compiler.compile_session_detail(owner, id);
        let row = self.fetch_one(&plan, "session")?;
        let mut detail: SessionDetail = serde_json::from_value(Value::Object(row))?;
        detail.labels = self.labels(owner, detail.id)?;
        Ok(detail)
    }

    fn labels(&self, owner: Uuid, session_id: Uuid) -> Result<BTreeMap<String, String>, ServiceError> {
        let plan = self.compiler.compile_label_lookup(owner, session_id);
        self.fetch(&plan)?
            .into_iter()
            .map(|row| -> Result<(String, String), ServiceError> {
                let label: LabelRow = serde_json::from_value(Value::Object(row))?;
                Ok((label.key, label.value.unwrap_or_default()))
            })
            .collect()
    }

    fn fetch_one(&self, plan: &QueryPlan, record: &'static str) -> Result<Row, ServiceError> {
        match self.fetch(plan)?.into_iter().next() {
            Some(row) => Ok(row),
            None => {
                debug!(record, "lookup matched nothing");
                Err(ServiceError::NotFound(record))
            }
        }
    }

    fn fetch(&self, plan: &QueryPlan) -> Result<Vec<Row>, ServiceError> {
        let rows = self
            .executor
            .fetch(plan)
            .map_err(ServiceError::Execution)?;
        debug!(kind = ?plan.kind, rows = rows.len(), "query finished");
        Ok(rows)
    }

    /// Parses and validates `params.query`, then applies the overrides.
    pub fn prepare(&self, params: &QueryParams, query_type: QueryType) -> Result<Query, ServiceError> {
        let mut query = if params.query.is_empty() {
            Query::default()
        } else {
            let query = parse(&params.query)?;
            validate(&query, query_type)?;
            query
        };

        if params.offset > 0 {
            query.offset = params.offset;
        }
        if params.limit > 0 && params.limit as u64 <= MAX_LIMIT {
            query.limit = params.limit;
        }
        Ok(query)
    }

    fn run(
        &self,
        owner: Uuid,
        params: &QueryParams,
        query_type: QueryType,
    ) -> Result<(QueryPlan, Vec<Row>), ServiceError> {
        let plan = self
            .prepare(params, query_type)
            .and_then(|query| Ok(self.compiler.compile(owner, &query, query_type)?))
            .inspect_err(|e| {
                if !e.is_internal() {
                    warn!(%query_type, error = %e, "rejected query");
                }
            })?;

        if tracing::enabled!(tracing::Level::DEBUG) {
            let (sql, values) = plan.to_sql();
            debug!(%query_type, %sql, params = values.0.len(), "executing query");
        }

        let rows = self.fetch(&plan)?;
        Ok((plan, rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueryError;
    use crate::sql_compiler::RecordKind;
    use crate::validator::{GROUP_BY_REQUIRED, SELECTOR_REQUIRED};
    use serde_json::json;
    use std::cell::RefCell;

    const OWNER: &str = "aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa";
    const SESSION: &str = "11111111-1111-1111-1111-111111111111";
    const TESTCASE: &str = "22222222-2222-2222-2222-222222222222";

    /// Returns canned rows and remembers every plan it was given.
    #[derive(Default)]
    struct MockExecutor {
        rows: Vec<Row>,
        /// Returned for label lookups instead of `rows`.
        labels: Vec<Row>,
        fail: bool,
        plans: RefCell<Vec<QueryPlan>>,
    }

    fn objects(rows: Vec<Value>) -> Vec<Row> {
        rows.into_iter()
            .map(|row| match row {
                Value::Object(map) => map,
                _ => panic!("rows must be objects"),
            })
            .collect()
    }

    impl MockExecutor {
        fn with_rows(rows: Vec<Value>) -> Self {
            Self {
                rows: objects(rows),
                ..Default::default()
            }
        }

        fn with_labels(mut self, labels: Vec<Value>) -> Self {
            self.labels = objects(labels);
            self
        }

        fn last_plan(&self) -> QueryPlan {
            self.plans.borrow().last().cloned().unwrap()
        }
    }

    impl QueryExecutor for MockExecutor {
        fn fetch(&self, plan: &QueryPlan) -> anyhow::Result<Vec<Row>> {
            self.plans.borrow_mut().push(plan.clone());
            if self.fail {
                anyhow::bail!("connection reset");
            }
            if plan.kind == RecordKind::Labels {
                return Ok(self.labels.clone());
            }
            Ok(self.rows.clone())
        }
    }

    fn service(executor: MockExecutor) -> QueryService<MockExecutor> {
        QueryService::new(SqlCompiler::new(), executor)
    }

    fn owner() -> Uuid {
        Uuid::parse_str(OWNER).unwrap()
    }

    #[test]
    fn test_query_testcases_decodes_rows() {
        let executor = MockExecutor::with_rows(vec![json!({
            "id": TESTCASE,
            "session_id": SESSION,
            "user_id": OWNER,
            "name": "test_login",
            "status": 1,
            "classname": "auth.LoginTest",
            "testsuite": null,
            "created_at": "2025-03-01 10:00:00",
            "total_count": 42,
            "aggregated_status": 0
        })]);
        let service = service(executor);

        let result = service
            .query_testcases(owner(), &QueryParams::new(r#"status = "fail""#))
            .unwrap();
        assert_eq!(result.total_count, 42);
        assert_eq!(result.results.len(), 1);
        let testcase = &result.results[0];
        assert_eq!(testcase.id.to_string(), TESTCASE);
        assert_eq!(testcase.status, TestcaseStatus::Fail);
        assert_eq!(testcase.classname.as_deref(), Some("auth.LoginTest"));
        assert_eq!(testcase.testsuite, None);
        assert_eq!(service.executor().last_plan().kind, RecordKind::Testcases);
    }

    #[test]
    fn test_empty_result_has_zero_total() {
        let service = service(MockExecutor::default());
        let result = service.query_testcases(owner(), &QueryParams::default()).unwrap();
        assert!(result.results.is_empty());
        assert_eq!(result.total_count, 0);
    }

    #[test]
    fn test_query_sessions_without_testcases() {
        let executor = MockExecutor::with_rows(vec![
            json!({
                "id": SESSION,
                "description": "nightly",
                "aggregated_status": 2,
                "created_at": "2025-03-01 10:00:00",
                "total_count": 2
            }),
            json!({
                "id": TESTCASE,
                "description": null,
                "aggregated_status": null,
                "created_at": "2025-02-28 09:00:00",
                "total_count": 2
            }),
        ]);
        let result = service(executor)
            .query_sessions(owner(), &QueryParams::default())
            .unwrap();
        assert_eq!(result.total_count, 2);
        assert_eq!(result.results[0].status, Some(TestcaseStatus::Pass));
        assert_eq!(result.results[1].status, None);
        assert_eq!(result.results[1].description, None);
    }

    #[test]
    fn test_query_groups() {
        let executor = MockExecutor::with_rows(vec![
            json!({"group_0": SESSION, "group_1": "prod", "aggregated_status": 1, "testcase_count": 7, "total_count": 0}),
            json!({"group_0": SESSION, "group_1": null, "aggregated_status": 2, "testcase_count": 3, "total_count": 0}),
        ]);
        let service = service(executor);
        let result = service
            .query_groups(owner(), &QueryParams::new(r#"group_by(session_id, #"env")"#))
            .unwrap();

        assert_eq!(result.total_count, 2);
        let first = &result.results[0];
        assert_eq!(first.values, vec![Some(SESSION.to_string()), Some("prod".to_string())]);
        assert_eq!(first.status, TestcaseStatus::Fail);
        assert_eq!(first.testcase_count, 7);
        assert_eq!(first.label(), format!("{}, prod", SESSION));
        assert_eq!(result.results[1].values[1], None);

        let plan = service.executor().last_plan();
        let headers: Vec<_> = plan.group_columns.iter().map(|c| group_header(&c.token)).collect();
        assert_eq!(headers, vec!["session_id", "#\"env\""]);
    }

    #[test]
    fn test_group_query_requires_text() {
        let service = service(MockExecutor::default());
        let err = service
            .query_groups(owner(), &QueryParams::default())
            .unwrap_err();
        assert!(matches!(err, ServiceError::MissingQuery));
        assert_eq!(err.to_string(), "query is required for group queries");
        assert!(service.executor().plans.borrow().is_empty());

        let err = service
            .query_groups(owner(), &QueryParams::new(r#"status = "pass""#))
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Query(QueryError::Semantic(ref m)) if m == GROUP_BY_REQUIRED
        ));
    }

    #[test]
    fn test_invalid_queries_never_reach_executor() {
        let service = service(MockExecutor::default());
        let err = service
            .query_testcases(owner(), &QueryParams::new("status = pass"))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Query(QueryError::Syntax { .. })));
        assert!(err.to_string().starts_with("invalid query: "));
        assert!(!err.is_internal());

        let err = service
            .query_sessions(owner(), &QueryParams::new("group_by(session_id)"))
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Query(QueryError::Semantic(ref m)) if m == SELECTOR_REQUIRED
        ));
        assert!(service.executor().plans.borrow().is_empty());
    }

    #[test]
    fn test_pagination_overrides() {
        let service = service(MockExecutor::default());
        let params = QueryParams {
            query: "offset=5 limit=10".to_string(),
            offset: 20,
            limit: 50,
        };
        let query = service.prepare(&params, QueryType::TestcaseList).unwrap();
        assert_eq!((query.offset, query.limit), (20, 50));

        let params = QueryParams {
            query: "offset=5 limit=10".to_string(),
            offset: 0,
            limit: 500,
        };
        let query = service.prepare(&params, QueryType::TestcaseList).unwrap();
        assert_eq!((query.offset, query.limit), (5, 10));

        service.query_testcases(owner(), &params).unwrap();
        let plan = service.executor().last_plan();
        let pagination = plan.pagination.unwrap();
        assert_eq!(pagination.offset, 5);
        assert_eq!(pagination.limit, 10);
    }

    #[test]
    fn test_limit_in_text_is_still_bounded() {
        let service = service(MockExecutor::default());
        let err = service
            .query_testcases(owner(), &QueryParams::new("limit=101"))
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid query: limit cannot exceed 100");
    }

    #[test]
    fn test_executor_failure_is_internal() {
        let executor = MockExecutor {
            fail: true,
            ..Default::default()
        };
        let err = service(executor)
            .query_testcases(owner(), &QueryParams::default())
            .unwrap_err();
        assert!(matches!(err, ServiceError::Execution(_)));
        assert!(err.is_internal());
    }

    #[test]
    fn test_unknown_status_rank_is_decode_error() {
        let executor = MockExecutor::with_rows(vec![json!({
            "id": TESTCASE,
            "session_id": SESSION,
            "name": "t",
            "status": 9,
            "created_at": "2025-03-01 10:00:00",
            "total_count": 1
        })]);
        let err = service(executor)
            .query_testcases(owner(), &QueryParams::default())
            .unwrap_err();
        assert!(matches!(err, ServiceError::Decode(_)));
    }

    #[test]
    fn test_missing_total_count_is_decode_error() {
        let executor = MockExecutor::with_rows(vec![json!({
            "id": TESTCASE,
            "session_id": SESSION,
            "name": "t",
            "status": 2,
            "created_at": "2025-03-01 10:00:00"
        })]);
        let err = service(executor)
            .query_testcases(owner(), &QueryParams::default())
            .unwrap_err();
        assert!(matches!(err, ServiceError::Decode(_)));
        assert!(err.to_string().contains("total_count"));
    }

    #[test]
    fn test_non_integer_testcase_count_is_decode_error() {
        let executor = MockExecutor::with_rows(vec![json!({
            "group_0": "prod",
            "aggregated_status": 2,
            "testcase_count": "many",
            "total_count": 1
        })]);
        let err = service(executor)
            .query_groups(owner(), &QueryParams::new(r#"group_by(#"env")"#))
            .unwrap_err();
        assert!(err.to_string().contains("testcase_count"));
    }

    #[test]
    fn test_get_testcase_with_labels() {
        let executor = MockExecutor::with_rows(vec![json!({
            "id": TESTCASE,
            "session_id": SESSION,
            "user_id": OWNER,
            "name": "test_login",
            "status": 0,
            "file": "tests/auth.py",
            "output": "Traceback ...",
            "baggage": "{\"retries\": 2}",
            "created_at": "2025-03-01 10:00:00"
        })])
        .with_labels(vec![
            json!({"key": "env", "value": "prod"}),
            json!({"key": "nightly", "value": null}),
        ]);
        let service = service(executor);
        let id = Uuid::parse_str(TESTCASE).unwrap();

        let detail = service.get_testcase(owner(), id).unwrap();
        assert_eq!(detail.status, TestcaseStatus::Error);
        assert_eq!(detail.output.as_deref(), Some("Traceback ..."));
        assert_eq!(detail.baggage, Some(json!({"retries": 2})));
        let labels: Vec<_> = detail.labels.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        assert_eq!(labels, vec![("env", "prod"), ("nightly", "")]);

        let plans = service.executor().plans.borrow();
        assert_eq!(plans[0].kind, RecordKind::TestcaseDetail);
        assert_eq!(plans[1].kind, RecordKind::Labels);
    }

    #[test]
    fn test_get_session_without_testcases() {
        let executor = MockExecutor::with_rows(vec![json!({
            "id": SESSION,
            "description": "nightly run",
            "baggage": null,
            "aggregated_status": null,
            "created_at": "2025-03-01 10:00:00"
        })]);
        let detail = service(executor)
            .get_session(owner(), Uuid::parse_str(SESSION).unwrap())
            .unwrap();
        assert_eq!(detail.status, None);
        assert_eq!(detail.baggage, None);
        assert!(detail.labels.is_empty());
        assert_eq!(detail.description.as_deref(), Some("nightly run"));
    }

    #[test]
    fn test_detail_not_found() {
        let service = service(MockExecutor::default());
        let id = Uuid::parse_str(TESTCASE).unwrap();

        let err = service.get_testcase(owner(), id).unwrap_err();
        assert!(matches!(err, ServiceError::NotFound("testcase")));
        assert_eq!(err.to_string(), "testcase not found");
        assert!(!err.is_internal());

        let err = service.get_session(owner(), id).unwrap_err();
        assert_eq!(err.to_string(), "session not found");
        // no label lookup after a miss
        assert_eq!(service.executor().plans.borrow().len(), 2);
    }
}
