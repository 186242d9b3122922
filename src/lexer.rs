//! 查询语言的词法分析器

use crate::error::QueryError;
use crate::token::{Span, Token, TokenKind};

pub struct Lexer<'a> {
    input: &'a str,
    /// 输入字符串中的当前位置（字节索引）
    position: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Lexer { input, position: 0 }
    }

    /// 返回当前位置的字符，不推进位置
    fn peek(&self) -> Option<char> {
        self.input[self.position..].chars().next()
    }

    /// 推进位置一个字符并返回该字符
    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if let Some(c) = c {
            self.position += c.len_utf8();
        }
        c
    }

    /// 跳过空白字符（空格、制表符、回车、换行）
    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if matches!(c, ' ' | '\t' | '\r' | '\n') {
                self.bump();
            } else {
                break;
            }
        }
    }

    /// 出错后停止词法分析
    fn abort(&mut self, error: QueryError) -> Option<Result<Token<'a>, QueryError>> {
        self.position = self.input.len();
        Some(Err(error))
    }

    fn token(&self, kind: TokenKind<'a>, start: usize) -> Token<'a> {
        Token {
            kind,
            span: Span::new(start, self.position),
        }
    }

    /// 读取数字字面量
    fn read_number(&mut self, start: usize) -> Result<Token<'a>, QueryError> {
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.bump();
            } else {
                break;
            }
        }
        let literal = &self.input[start..self.position];
        let value = literal.parse::<i64>().map_err(|_| {
            QueryError::syntax_at(
                format!("number out of range: {}", literal),
                Span::new(start, self.position),
            )
        })?;
        Ok(self.token(TokenKind::Number(value), start))
    }

    /// 读取双引号包围的字符串字面量
    /// 注意：开始的引号已经被调用者消费。
    /// 没有结束引号时读取到输入末尾。
    fn read_string(&mut self, start: usize) -> Token<'a> {
        let content_start = self.position;
        while let Some(c) = self.peek() {
            if c == '"' {
                break;
            }
            self.bump();
        }
        let content_end = self.position;
        self.bump(); // 消费结束引号（如果存在）

        let content = &self.input[content_start..content_end];
        self.token(TokenKind::String(content), start)
    }

    /// 读取关键字，标识符可以包含字母、数字和下划线
    fn read_keyword(&mut self, start: usize) -> Result<Token<'a>, QueryError> {
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.bump();
            } else {
                break;
            }
        }
        let literal = &self.input[start..self.position];
        let span = Span::new(start, self.position);
        match match_keyword(literal) {
            Some(kind) => Ok(Token { kind, span }),
            None => Err(QueryError::syntax_at(
                format!("unknown identifier: {}", literal),
                span,
            )),
        }
    }
}

fn match_keyword(s: &str) -> Option<TokenKind<'static>> {
    let kind = match s.to_lowercase().as_str() {
        "and" => TokenKind::And,
        "or" => TokenKind::Or,
        "session_id" => TokenKind::SessionId,
        "id" => TokenKind::Id,
        "name" => TokenKind::Name,
        "classname" => TokenKind::Classname,
        "testsuite" => TokenKind::Testsuite,
        "file" => TokenKind::File,
        "status" => TokenKind::Status,
        "group_by" => TokenKind::GroupBy,
        "group" => TokenKind::Group,
        "offset" => TokenKind::Offset,
        "limit" => TokenKind::Limit,
        "start_date" => TokenKind::StartDate,
        "end_date" => TokenKind::EndDate,
        _ => return None,
    };
    Some(kind)
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Result<Token<'a>, QueryError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.skip_whitespace();
        let start = self.position;

        let c = self.bump()?; // 到达输入末尾

        let token = match c {
            '=' => self.token(TokenKind::Eq, start),
            '(' => self.token(TokenKind::LParen, start),
            ')' => self.token(TokenKind::RParen, start),
            ',' => self.token(TokenKind::Comma, start),
            '#' => self.token(TokenKind::Hash, start),
            '!' => {
                if self.peek() == Some('=') {
                    self.bump();
                    self.token(TokenKind::NotEq, start)
                } else {
                    self.token(TokenKind::Bang, start)
                }
            }
            '"' => self.read_string(start),
            c if c.is_ascii_digit() => match self.read_number(start) {
                Ok(token) => token,
                Err(e) => return self.abort(e),
            },
            c if c.is_alphabetic() => match self.read_keyword(start) {
                Ok(token) => token,
                Err(e) => return self.abort(e),
            },
            other => {
                let span = Span::new(start, self.position);
                return self.abort(QueryError::syntax_at(
                    format!("unexpected character: {}", other),
                    span,
                ));
            }
        };
        Some(Ok(token))
    }
}

/// 将整个输入切分为 token 序列，遇到第一个词法错误即返回
pub fn tokenize(input: &str) -> Result<Vec<Token<'_>>, QueryError> {
    Lexer::new(input).collect()
}
