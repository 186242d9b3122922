//! AST 的类型定义

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 相等比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EqualityOperator {
    Eq,    // =
    NotEq, // !=
}

/// 逻辑运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LogicalOperator {
    And,
    Or,
}

/// 测试用例状态
///
/// 变体顺序即存储的整数等级：error < fail < pass < skip，
/// 因此对一组状态取 `MIN` 得到最差的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestcaseStatus {
    Error,
    Fail,
    Pass,
    Skip,
}

impl TestcaseStatus {
    pub const ALL: [TestcaseStatus; 4] = [
        TestcaseStatus::Error,
        TestcaseStatus::Fail,
        TestcaseStatus::Pass,
        TestcaseStatus::Skip,
    ];

    /// 数据库中存储的整数值
    pub fn rank(self) -> i32 {
        match self {
            TestcaseStatus::Error => 0,
            TestcaseStatus::Fail => 1,
            TestcaseStatus::Pass => 2,
            TestcaseStatus::Skip => 3,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(TestcaseStatus::Error),
            1 => Some(TestcaseStatus::Fail),
            2 => Some(TestcaseStatus::Pass),
            3 => Some(TestcaseStatus::Skip),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TestcaseStatus::Error => "error",
            TestcaseStatus::Fail => "fail",
            TestcaseStatus::Pass => "pass",
            TestcaseStatus::Skip => "skip",
        }
    }
}

impl fmt::Display for TestcaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestcaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TestcaseStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "invalid status '{}', must be one of: pass, fail, error, skip",
                    s
                )
            })
    }
}

/// 单个过滤谓词
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SelectQuery {
    /// 匹配所有记录
    Empty,
    BySessionId { id: Uuid, op: EqualityOperator },
    ById { id: Uuid, op: EqualityOperator },
    ByName { value: String, op: EqualityOperator },
    ByClassname { value: String, op: EqualityOperator },
    ByTestsuite { value: String, op: EqualityOperator },
    ByFile { value: String, op: EqualityOperator },
    ByStatus { status: TestcaseStatus, op: EqualityOperator },
    /// `#"tag"` 或 `!#"tag"`：标签存在/不存在
    HasTag { tag: String, op: EqualityOperator },
    /// `#"tag" = "value"` 或 `#"tag" != "value"`
    TagEquals {
        tag: String,
        value: String,
        op: EqualityOperator,
    },
}

/// 复合谓词中的一个部分
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompoundPart {
    pub op: LogicalOperator,
    pub query: SelectQuery,
}

/// 从左到右的扁平谓词链，没有优先级也没有括号。
///
/// 第一个部分的运算符总是 `And`，只起占位作用。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompoundSelectQuery {
    pub parts: Vec<CompoundPart>,
}

impl CompoundSelectQuery {
    /// 只包含 `Empty` 的复合谓词，匹配所有记录
    pub fn empty() -> Self {
        Self::single(SelectQuery::Empty)
    }

    pub fn single(query: SelectQuery) -> Self {
        Self {
            parts: vec![CompoundPart {
                op: LogicalOperator::And,
                query,
            }],
        }
    }

    /// 追加一个由 `op` 连接的谓词
    pub fn push(&mut self, op: LogicalOperator, query: SelectQuery) {
        self.parts.push(CompoundPart { op, query });
    }

    pub fn matches_everything(&self) -> bool {
        self.parts.len() == 1 && self.parts[0].query == SelectQuery::Empty
    }
}

impl Default for CompoundSelectQuery {
    fn default() -> Self {
        Self::empty()
    }
}

/// 分组依据
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum GroupToken {
    /// `session_id`
    BySession,
    /// `#"tag"`：按标签的值分组
    ByTag { tag: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupQuery {
    pub tokens: Vec<GroupToken>,
}

/// AST 的根节点, 代表一个完整的查询语句
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Query {
    pub select: CompoundSelectQuery,
    pub group: Option<GroupQuery>,
    /// `group = (...)` 的值，按位置对应 `group` 中的每个分组依据
    pub group_selector: Option<Vec<String>>,
    pub offset: i64,
    /// 0 表示未指定
    pub limit: i64,
    pub start_date: Option<NaiveDateTime>,
    pub end_date: Option<NaiveDateTime>,
}
