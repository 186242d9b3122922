//! The token definition for the query language.

/// A token is a single unit of the language, with a specific kind and location.
#[derive(Debug, Clone, PartialEq)]
pub struct Token<'a> {
    pub kind: TokenKind<'a>,
    pub span: Span,
}

/// The kind of a token.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind<'a> {
    // Connectives
    And, // "and"
    Or,  // "or"

    // Field keywords
    SessionId, // "session_id"
    Id,        // "id"
    Name,      // "name"
    Classname, // "classname"
    Testsuite, // "testsuite"
    File,      // "file"
    Status,    // "status"

    // Modifier keywords
    GroupBy,   // "group_by"
    Group,     // "group"
    Offset,    // "offset"
    Limit,     // "limit"
    StartDate, // "start_date"
    EndDate,   // "end_date"

    // Literals
    String(&'a str), // The enclosed text, without quotes
    Number(i64),

    // Punctuation
    LParen, // (
    RParen, // )
    Comma,  // ,
    Hash,   // #
    Bang,   // !

    // Operators
    Eq,    // =
    NotEq, // !=
}

impl TokenKind<'_> {
    /// Human readable rendering used in error messages.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::And => "'and'".to_string(),
            TokenKind::Or => "'or'".to_string(),
            TokenKind::SessionId => "'session_id'".to_string(),
            TokenKind::Id => "'id'".to_string(),
            TokenKind::Name => "'name'".to_string(),
            TokenKind::Classname => "'classname'".to_string(),
            TokenKind::Testsuite => "'testsuite'".to_string(),
            TokenKind::File => "'file'".to_string(),
            TokenKind::Status => "'status'".to_string(),
            TokenKind::GroupBy => "'group_by'".to_string(),
            TokenKind::Group => "'group'".to_string(),
            TokenKind::Offset => "'offset'".to_string(),
            TokenKind::Limit => "'limit'".to_string(),
            TokenKind::StartDate => "'start_date'".to_string(),
            TokenKind::EndDate => "'end_date'".to_string(),
            TokenKind::String(s) => format!("string \"{}\"", s),
            TokenKind::Number(n) => format!("number {}", n),
            TokenKind::LParen => "'('".to_string(),
            TokenKind::RParen => "')'".to_string(),
            TokenKind::Comma => "','".to_string(),
            TokenKind::Hash => "'#'".to_string(),
            TokenKind::Bang => "'!'".to_string(),
            TokenKind::Eq => "'='".to_string(),
            TokenKind::NotEq => "'!='".to_string(),
        }
    }
}

/// Represents a span in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    /// The starting byte offset.
    pub start: usize,
    /// The ending byte offset.
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}
