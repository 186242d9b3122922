//! 查询语言的语法分析器
//!
//! ## 语法
//!
//! ```text
//! query      := (filter | modifier)*          最多一个 filter
//! filter     := predicate (("and" | "or") predicate)*
//! predicate  := field ("=" | "!=") STRING
//!             | "#" STRING [("=" | "!=") STRING]
//!             | "!" "#" STRING
//! field      := session_id | id | name | classname | testsuite | file | status
//! modifier   := "group_by" "(" group_tok ("," group_tok)* ")"
//!             | "group" "=" "(" STRING ("," STRING)* ")"
//!             | "offset" "=" NUMBER
//!             | "limit" "=" NUMBER
//!             | "start_date" "=" STRING
//!             | "end_date" "=" STRING
//! group_tok  := session_id | "#" STRING
//! ```
//!
//! ## 语义
//!
//! - `and` / `or` 没有优先级也没有括号，按书写顺序从左到右连接，
//!   结果是扁平的 `CompoundSelectQuery`，不是表达式树。
//! - 修饰子句可以以任意顺序出现在过滤表达式前后，每种最多一次。
//! - 日期格式固定为 `YYYY/MM/DD HH:MM:SS`（UTC）。
//! - `session_id` / `id` 的值必须是合法 UUID，`status` 只能是
//!   `pass`、`fail`、`error`、`skip` 之一。
//!
//! ## 解析示例
//!
//! ```text
//! status = "fail" and #"os" = "linux"
//! name = "test" or !#"flaky" limit=20 offset=40
//! group_by(session_id, #"env") group = ("...uuid...", "prod")
//! start_date = "2025/01/01 00:00:00" end_date = "2025/12/31 23:59:59"
//! ```

use crate::ast::{
    CompoundSelectQuery, EqualityOperator, GroupQuery, GroupToken, LogicalOperator, Query,
    SelectQuery, TestcaseStatus,
};
use crate::error::QueryError;
use crate::lexer::tokenize;
use crate::token::{Token, TokenKind};
use chrono::NaiveDateTime;
use tracing::debug;
use uuid::Uuid;

const DATE_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// 解析查询文本，返回完整的 AST 或第一个错误
pub fn parse(input: &str) -> Result<Query, QueryError> {
    let tokens = tokenize(input)?;
    let query = Parser::new(&tokens).parse()?;
    debug!(
        parts = query.select.parts.len(),
        grouped = query.group.is_some(),
        "parsed query"
    );
    Ok(query)
}

pub struct Parser<'a> {
    tokens: &'a [Token<'a>],
    position: usize,
}

/// 修饰子句的解析结果，与出现顺序无关
#[derive(Default)]
struct Modifiers {
    group: Option<GroupQuery>,
    group_selector: Option<Vec<String>>,
    offset: Option<i64>,
    limit: Option<i64>,
    start_date: Option<NaiveDateTime>,
    end_date: Option<NaiveDateTime>,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token<'a>]) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    /// 返回当前 token，不推进位置
    fn peek(&self) -> Option<&'a Token<'a>> {
        self.tokens.get(self.position)
    }

    /// 返回当前 token 并推进位置
    fn advance(&mut self) -> Option<&'a Token<'a>> {
        let token = self.tokens.get(self.position)?;
        self.position += 1;
        Some(token)
    }

    /// 期望特定类型的 token 并推进，否则返回错误
    fn expect(&mut self, expected: TokenKind) -> Result<&'a Token<'a>, QueryError> {
        let expected_name = match expected {
            TokenKind::String(_) => "string".to_string(),
            TokenKind::Number(_) => "number".to_string(),
            ref other => other.describe(),
        };
        match self.peek() {
            Some(token)
                if std::mem::discriminant(&token.kind) == std::mem::discriminant(&expected) =>
            {
                self.position += 1;
                Ok(token)
            }
            Some(token) => Err(QueryError::syntax_at(
                format!(
                    "expected {}, found {}",
                    expected_name,
                    token.kind.describe()
                ),
                token.span,
            )),
            None => Err(end_of_input(&expected_name)),
        }
    }

    fn expect_string(&mut self) -> Result<&'a Token<'a>, QueryError> {
        self.expect(TokenKind::String(""))
    }

    pub fn parse(&mut self) -> Result<Query, QueryError> {
        let mut select: Option<CompoundSelectQuery> = None;
        let mut modifiers = Modifiers::default();

        while let Some(token) = self.peek() {
            match &token.kind {
                TokenKind::GroupBy => {
                    self.advance();
                    let group = self.parse_group_by()?;
                    set_once(&mut modifiers.group, group, "group_by", token)?;
                }
                TokenKind::Group => {
                    self.advance();
                    let selector = self.parse_group_selector()?;
                    set_once(&mut modifiers.group_selector, selector, "group", token)?;
                }
                TokenKind::Offset => {
                    self.advance();
                    let offset = self.parse_number_assignment()?;
                    set_once(&mut modifiers.offset, offset, "offset", token)?;
                }
                TokenKind::Limit => {
                    self.advance();
                    let limit = self.parse_number_assignment()?;
                    set_once(&mut modifiers.limit, limit, "limit", token)?;
                }
                TokenKind::StartDate => {
                    self.advance();
                    let date = self.parse_date_assignment()?;
                    set_once(&mut modifiers.start_date, date, "start_date", token)?;
                }
                TokenKind::EndDate => {
                    self.advance();
                    let date = self.parse_date_assignment()?;
                    set_once(&mut modifiers.end_date, date, "end_date", token)?;
                }
                kind if starts_predicate(kind) => {
                    if select.is_some() {
                        return Err(QueryError::syntax_at(
                            format!(
                                "unexpected {}: only one filter expression is allowed, join predicates with 'and' or 'or'",
                                kind.describe()
                            ),
                            token.span,
                        ));
                    }
                    select = Some(self.parse_compound()?);
                }
                other => {
                    return Err(QueryError::syntax_at(
                        format!("unexpected token {}", other.describe()),
                        token.span,
                    ));
                }
            }
        }

        if modifiers.group_selector.is_some() && modifiers.group.is_none() {
            return Err(QueryError::syntax(
                "group = (...) requires group_by(...)",
                None,
            ));
        }

        Ok(Query {
            select: select.unwrap_or_default(),
            group: modifiers.group,
            group_selector: modifiers.group_selector,
            offset: modifiers.offset.unwrap_or(0),
            limit: modifiers.limit.unwrap_or(0),
            start_date: modifiers.start_date,
            end_date: modifiers.end_date,
        })
    }

    /// 解析扁平的谓词链
    ///
    /// 语法: `predicate (("and" | "or") predicate)*`
    fn parse_compound(&mut self) -> Result<CompoundSelectQuery, QueryError> {
        let first = self.parse_predicate()?;
        let mut compound = CompoundSelectQuery::single(first);

        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::And) => LogicalOperator::And,
                Some(TokenKind::Or) => LogicalOperator::Or,
                _ => break,
            };
            self.advance(); // 消费 and / or
            let next = self.parse_predicate()?;
            compound.push(op, next);
        }

        Ok(compound)
    }

    fn parse_predicate(&mut self) -> Result<SelectQuery, QueryError> {
        let Some(token) = self.advance() else {
            return Err(end_of_input("predicate"));
        };

        match &token.kind {
            TokenKind::SessionId => {
                let op = self.parse_equality()?;
                let id = self.parse_uuid("session_id")?;
                Ok(SelectQuery::BySessionId { id, op })
            }
            TokenKind::Id => {
                let op = self.parse_equality()?;
                let id = self.parse_uuid("id")?;
                Ok(SelectQuery::ById { id, op })
            }
            TokenKind::Name => {
                let (op, value) = self.parse_string_comparison()?;
                Ok(SelectQuery::ByName { value, op })
            }
            TokenKind::Classname => {
                let (op, value) = self.parse_string_comparison()?;
                Ok(SelectQuery::ByClassname { value, op })
            }
            TokenKind::Testsuite => {
                let (op, value) = self.parse_string_comparison()?;
                Ok(SelectQuery::ByTestsuite { value, op })
            }
            TokenKind::File => {
                let (op, value) = self.parse_string_comparison()?;
                Ok(SelectQuery::ByFile { value, op })
            }
            TokenKind::Status => {
                let op = self.parse_equality()?;
                let value = self.expect_string()?;
                let status = string_value(value)
                    .parse::<TestcaseStatus>()
                    .map_err(|msg| QueryError::syntax_at(msg, value.span))?;
                Ok(SelectQuery::ByStatus { status, op })
            }
            TokenKind::Hash => {
                let tag = self.parse_tag()?;
                if matches!(
                    self.peek().map(|t| &t.kind),
                    Some(TokenKind::Eq | TokenKind::NotEq)
                ) {
                    let (op, value) = self.parse_string_comparison()?;
                    Ok(SelectQuery::TagEquals { tag, value, op })
                } else {
                    Ok(SelectQuery::HasTag {
                        tag,
                        op: EqualityOperator::Eq,
                    })
                }
            }
            TokenKind::Bang => {
                self.expect(TokenKind::Hash)?;
                let tag = self.parse_tag()?;
                Ok(SelectQuery::HasTag {
                    tag,
                    op: EqualityOperator::NotEq,
                })
            }
            other => Err(QueryError::syntax_at(
                format!("expected predicate, found {}", other.describe()),
                token.span,
            )),
        }
    }

    fn parse_equality(&mut self) -> Result<EqualityOperator, QueryError> {
        match self.advance() {
            Some(Token {
                kind: TokenKind::Eq,
                ..
            }) => Ok(EqualityOperator::Eq),
            Some(Token {
                kind: TokenKind::NotEq,
                ..
            }) => Ok(EqualityOperator::NotEq),
            Some(token) => Err(QueryError::syntax_at(
                format!("expected '=' or '!=', found {}", token.kind.describe()),
                token.span,
            )),
            None => Err(end_of_input("'=' or '!='")),
        }
    }

    fn parse_string_comparison(&mut self) -> Result<(EqualityOperator, String), QueryError> {
        let op = self.parse_equality()?;
        let value = self.expect_string()?;
        Ok((op, string_value(value).to_string()))
    }

    fn parse_uuid(&mut self, field: &str) -> Result<Uuid, QueryError> {
        let token = self.expect_string()?;
        let text = string_value(token);
        Uuid::parse_str(text).map_err(|_| {
            QueryError::syntax_at(
                format!("invalid UUID format for {}: {}", field, text),
                token.span,
            )
        })
    }

    /// 解析 `#` 之后的标签名，标签名不能为空
    fn parse_tag(&mut self) -> Result<String, QueryError> {
        let token = self.expect_string()?;
        let tag = string_value(token);
        if tag.is_empty() {
            return Err(QueryError::syntax_at("tag must be non-empty", token.span));
        }
        Ok(tag.to_string())
    }

    /// 语法: `"(" group_tok ("," group_tok)* ")"`
    fn parse_group_by(&mut self) -> Result<GroupQuery, QueryError> {
        self.expect(TokenKind::LParen)?;
        let mut tokens = Vec::new();

        loop {
            match self.advance() {
                Some(Token {
                    kind: TokenKind::SessionId,
                    ..
                }) => tokens.push(GroupToken::BySession),
                Some(Token {
                    kind: TokenKind::Hash,
                    ..
                }) => {
                    let tag = self.parse_tag()?;
                    tokens.push(GroupToken::ByTag { tag });
                }
                Some(token) => {
                    return Err(QueryError::syntax_at(
                        format!(
                            "expected 'session_id' or #\"tag\" in group_by, found {}",
                            token.kind.describe()
                        ),
                        token.span,
                    ))
                }
                None => return Err(end_of_input("group_by column")),
            }

            if self.close_or_comma()? {
                break;
            }
        }

        Ok(GroupQuery { tokens })
    }

    /// 语法: `"=" "(" STRING ("," STRING)* ")"`
    fn parse_group_selector(&mut self) -> Result<Vec<String>, QueryError> {
        self.expect(TokenKind::Eq)?;
        self.expect(TokenKind::LParen)?;
        let mut values = Vec::new();

        loop {
            let value = self.expect_string()?;
            values.push(string_value(value).to_string());
            if self.close_or_comma()? {
                break;
            }
        }

        Ok(values)
    }

    /// 消费 `,` 返回 false，消费 `)` 返回 true
    fn close_or_comma(&mut self) -> Result<bool, QueryError> {
        match self.advance() {
            Some(Token {
                kind: TokenKind::RParen,
                ..
            }) => Ok(true),
            Some(Token {
                kind: TokenKind::Comma,
                ..
            }) => Ok(false),
            Some(token) => Err(QueryError::syntax_at(
                format!("expected ',' or ')', found {}", token.kind.describe()),
                token.span,
            )),
            None => Err(end_of_input("',' or ')'")),
        }
    }

    fn parse_number_assignment(&mut self) -> Result<i64, QueryError> {
        self.expect(TokenKind::Eq)?;
        match self.advance() {
            Some(Token {
                kind: TokenKind::Number(n),
                ..
            }) => Ok(*n),
            Some(token) => Err(QueryError::syntax_at(
                format!("expected number, found {}", token.kind.describe()),
                token.span,
            )),
            None => Err(end_of_input("number")),
        }
    }

    fn parse_date_assignment(&mut self) -> Result<NaiveDateTime, QueryError> {
        self.expect(TokenKind::Eq)?;
        let token = self.expect_string()?;
        let text = string_value(token);
        parse_timestamp(text).ok_or_else(|| {
            QueryError::syntax_at(
                format!(
                    "invalid date format: \"{}\", expected YYYY/MM/DD HH:MM:SS",
                    text
                ),
                token.span,
            )
        })
    }
}

fn starts_predicate(kind: &TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::SessionId
            | TokenKind::Id
            | TokenKind::Name
            | TokenKind::Classname
            | TokenKind::Testsuite
            | TokenKind::File
            | TokenKind::Status
            | TokenKind::Hash
            | TokenKind::Bang
    )
}

fn string_value<'a>(token: &Token<'a>) -> &'a str {
    match token.kind {
        TokenKind::String(s) => s,
        _ => "",
    }
}

fn set_once<T>(
    slot: &mut Option<T>,
    value: T,
    clause: &str,
    token: &Token,
) -> Result<(), QueryError> {
    if slot.is_some() {
        return Err(QueryError::syntax_at(
            format!("duplicate {} clause", clause),
            token.span,
        ));
    }
    *slot = Some(value);
    Ok(())
}

fn end_of_input(expected: &str) -> QueryError {
    QueryError::syntax(
        format!("expected {}, but reached end of input", expected),
        None,
    )
}

/// 严格按 `YYYY/MM/DD HH:MM:SS` 解析
fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let bytes = text.as_bytes();
    if bytes.len() != 19 {
        return None;
    }
    let shape_ok = bytes.iter().enumerate().all(|(i, b)| match i {
        4 | 7 => *b == b'/',
        10 => *b == b' ',
        13 | 16 => *b == b':',
        _ => b.is_ascii_digit(),
    });
    if !shape_ok {
        return None;
    }
    NaiveDateTime::parse_from_str(text, DATE_FORMAT).ok()
}
