//! Tokens produced by the lexer.

use std::fmt;

use crate::source::SourceRange;

/// Kind of a lexed token.
///
/// A closed set matched exhaustively by the parser. Multi-character
/// operators are distinct kinds; the lexer guarantees longest-match.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// Numeric literal. Value text is in `Token::text`.
    Number,
    /// Note literal such as `a4` or `c#3`. Text keeps the original spelling.
    Note,
    /// Double-quoted string literal. Text holds the unescaped contents.
    Str,
    /// Identifier.
    Ident,

    // Keywords
    Num,
    Midi,
    Scope,
    Pure,
    Const,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    AmpAmp,
    PipePipe,
    Bang,
    Amp,
    Pipe,
    Arrow,
    Eq,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    PercentEq,
    CaretEq,

    // Structure
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Semicolon,
    /// Statement separator; unlike other whitespace, newlines are tokens.
    Newline,

    /// Input the lexer could not match. Always spans to the end of input;
    /// the parser treats it as a terminal error.
    Unknown,
    /// End of input. Returned forever once reached.
    Eof,
}

impl TokenKind {
    /// Human-readable name used in diagnostics.
    pub fn describe(self) -> &'static str {
        match self {
            TokenKind::Number => "number",
            TokenKind::Note => "note",
            TokenKind::Str => "string",
            TokenKind::Ident => "identifier",
            TokenKind::Num => "`num`",
            TokenKind::Midi => "`midi`",
            TokenKind::Scope => "`scope`",
            TokenKind::Pure => "`pure`",
            TokenKind::Const => "`const`",
            TokenKind::Plus => "`+`",
            TokenKind::Minus => "`-`",
            TokenKind::Star => "`*`",
            TokenKind::Slash => "`/`",
            TokenKind::Percent => "`%`",
            TokenKind::Caret => "`^`",
            TokenKind::EqEq => "`==`",
            TokenKind::NotEq => "`!=`",
            TokenKind::Lt => "`<`",
            TokenKind::LtEq => "`<=`",
            TokenKind::Gt => "`>`",
            TokenKind::GtEq => "`>=`",
            TokenKind::AmpAmp => "`&&`",
            TokenKind::PipePipe => "`||`",
            TokenKind::Bang => "`!`",
            TokenKind::Amp => "`&`",
            TokenKind::Pipe => "`|`",
            TokenKind::Arrow => "`->`",
            TokenKind::Eq => "`=`",
            TokenKind::PlusEq => "`+=`",
            TokenKind::MinusEq => "`-=`",
            TokenKind::StarEq => "`*=`",
            TokenKind::SlashEq => "`/=`",
            TokenKind::PercentEq => "`%=`",
            TokenKind::CaretEq => "`^=`",
            TokenKind::LParen => "`(`",
            TokenKind::RParen => "`)`",
            TokenKind::LBracket => "`[`",
            TokenKind::RBracket => "`]`",
            TokenKind::Comma => "`,`",
            TokenKind::Colon => "`:`",
            TokenKind::Semicolon => "`;`",
            TokenKind::Newline => "newline",
            TokenKind::Unknown => "unrecognized input",
            TokenKind::Eof => "end of input",
        }
    }

    /// True for kinds that terminate a statement.
    #[inline]
    pub fn is_statement_end(self) -> bool {
        matches!(
            self,
            TokenKind::Newline | TokenKind::Semicolon | TokenKind::Eof
        )
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// One lexed token. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// Literal/identifier spelling. Empty for punctuation.
    pub text: String,
    pub range: SourceRange,
}

impl Token {
    /// Create a token with no text payload.
    pub fn bare(kind: TokenKind, range: SourceRange) -> Self {
        Token {
            kind,
            text: String::new(),
            range,
        }
    }

    /// Create a token carrying its spelling.
    pub fn with_text(kind: TokenKind, text: impl Into<String>, range: SourceRange) -> Self {
        Token {
            kind,
            text: text.into(),
            range,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Pos, SourceRange};

    #[test]
    fn test_statement_end_kinds() {
        assert!(TokenKind::Newline.is_statement_end());
        assert!(TokenKind::Semicolon.is_statement_end());
        assert!(TokenKind::Eof.is_statement_end());
        assert!(!TokenKind::Comma.is_statement_end());
    }

    #[test]
    fn test_describe() {
        assert_eq!(TokenKind::Arrow.describe(), "`->`");
        assert_eq!(TokenKind::Eof.describe(), "end of input");
    }

    #[test]
    fn test_token_construction() {
        let range = SourceRange::new(Pos::new(0, 0), Pos::new(0, 3));
        let tok = Token::with_text(TokenKind::Number, "1.5", range);
        assert_eq!(tok.kind, TokenKind::Number);
        assert_eq!(tok.text, "1.5");
        assert_eq!(tok.range, range);

        let bare = Token::bare(TokenKind::Plus, range);
        assert!(bare.text.is_empty());
    }
}
