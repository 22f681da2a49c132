//! Lexer for cadence custom node scripts.
//!
//! Tokenization is eager: the whole source is lexed up front and the
//! stream then hands out tokens with single-token lookahead. `restart`
//! rewinds to the first token without re-lexing, which makes re-parsing
//! the same source cheap.
//!
//! Any input the patterns cannot match - including unterminated strings
//! and block comments - produces a single `Unknown` token that spans from
//! the offending lexeme to the end of input; lexing stops there, so the
//! parser sees exactly one terminal error.

mod raw;

use logos::Logos;

use cad_ir::{Pos, SourceRange, Token, TokenKind};
use raw::RawToken;

/// Byte-offset to line/column conversion table.
struct LineMap {
    /// Byte offset of the start of each line.
    line_starts: Vec<usize>,
}

impl LineMap {
    fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        LineMap { line_starts }
    }

    fn pos(&self, offset: usize) -> Pos {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(line) => line,
            Err(next) => next - 1,
        };
        Pos::new(line as u32, (offset - self.line_starts[line]) as u32)
    }

    fn range(&self, span: std::ops::Range<usize>) -> SourceRange {
        SourceRange::new(self.pos(span.start), self.pos(span.end))
    }
}

/// A stream of tokens over one source buffer.
pub struct TokenStream {
    tokens: Vec<Token>,
    pos: usize,
    eof: Token,
}

impl TokenStream {
    /// Tokenize `source`.
    pub fn new(source: &str) -> Self {
        let map = LineMap::new(source);
        let mut tokens = Vec::new();
        let mut lexer = RawToken::lexer(source);
        let mut end = map.pos(source.len());

        while let Some(result) = lexer.next() {
            let span = lexer.span();
            match result {
                Ok(raw) => tokens.push(convert(raw, map.range(span))),
                Err(()) => {
                    // Unmatched input: one Unknown token covering the rest
                    // of the buffer, then stop.
                    let range = SourceRange::new(map.pos(span.start), map.pos(source.len()));
                    tokens.push(Token::bare(TokenKind::Unknown, range));
                    end = map.pos(span.start);
                    break;
                }
            }
        }

        TokenStream {
            tokens,
            pos: 0,
            eof: Token::bare(TokenKind::Eof, SourceRange::point(end)),
        }
    }

    /// Look at the next token without consuming it.
    ///
    /// Idempotent: repeated calls without an intervening `next` return
    /// the same token.
    pub fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&self.eof)
    }

    /// Consume and return the next token.
    ///
    /// Once the stream is exhausted this returns `Eof` forever.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Token {
        match self.tokens.get(self.pos) {
            Some(token) => {
                self.pos += 1;
                token.clone()
            }
            None => self.eof.clone(),
        }
    }

    /// Rewind to the beginning of the stream.
    pub fn restart(&mut self) {
        self.pos = 0;
    }

    /// Number of tokens in the stream, excluding the synthetic `Eof`.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// True if the source lexed to no tokens at all.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Attach a source range and normalize the payload.
fn convert(raw: RawToken, range: SourceRange) -> Token {
    match raw {
        RawToken::Newline => Token::bare(TokenKind::Newline, range),
        RawToken::Num => Token::bare(TokenKind::Num, range),
        RawToken::Midi => Token::bare(TokenKind::Midi, range),
        RawToken::Scope => Token::bare(TokenKind::Scope, range),
        RawToken::Pure => Token::bare(TokenKind::Pure, range),
        RawToken::Const => Token::bare(TokenKind::Const, range),
        RawToken::EqEq => Token::bare(TokenKind::EqEq, range),
        RawToken::NotEq => Token::bare(TokenKind::NotEq, range),
        RawToken::LtEq => Token::bare(TokenKind::LtEq, range),
        RawToken::GtEq => Token::bare(TokenKind::GtEq, range),
        RawToken::AmpAmp => Token::bare(TokenKind::AmpAmp, range),
        RawToken::PipePipe => Token::bare(TokenKind::PipePipe, range),
        RawToken::Arrow => Token::bare(TokenKind::Arrow, range),
        RawToken::PlusEq => Token::bare(TokenKind::PlusEq, range),
        RawToken::MinusEq => Token::bare(TokenKind::MinusEq, range),
        RawToken::StarEq => Token::bare(TokenKind::StarEq, range),
        RawToken::SlashEq => Token::bare(TokenKind::SlashEq, range),
        RawToken::PercentEq => Token::bare(TokenKind::PercentEq, range),
        RawToken::CaretEq => Token::bare(TokenKind::CaretEq, range),
        RawToken::Plus => Token::bare(TokenKind::Plus, range),
        RawToken::Minus => Token::bare(TokenKind::Minus, range),
        RawToken::Star => Token::bare(TokenKind::Star, range),
        RawToken::Slash => Token::bare(TokenKind::Slash, range),
        RawToken::Percent => Token::bare(TokenKind::Percent, range),
        RawToken::Caret => Token::bare(TokenKind::Caret, range),
        RawToken::Lt => Token::bare(TokenKind::Lt, range),
        RawToken::Gt => Token::bare(TokenKind::Gt, range),
        RawToken::Bang => Token::bare(TokenKind::Bang, range),
        RawToken::Amp => Token::bare(TokenKind::Amp, range),
        RawToken::Pipe => Token::bare(TokenKind::Pipe, range),
        RawToken::Eq => Token::bare(TokenKind::Eq, range),
        RawToken::LParen => Token::bare(TokenKind::LParen, range),
        RawToken::RParen => Token::bare(TokenKind::RParen, range),
        RawToken::LBracket => Token::bare(TokenKind::LBracket, range),
        RawToken::RBracket => Token::bare(TokenKind::RBracket, range),
        RawToken::Comma => Token::bare(TokenKind::Comma, range),
        RawToken::Colon => Token::bare(TokenKind::Colon, range),
        RawToken::Semicolon => Token::bare(TokenKind::Semicolon, range),
        RawToken::Note(midi) => Token::with_text(TokenKind::Note, midi.to_string(), range),
        RawToken::Number(value) => Token::with_text(TokenKind::Number, value.to_string(), range),
        RawToken::Str(text) => Token::with_text(TokenKind::Str, text, range),
        RawToken::Ident(text) => Token::with_text(TokenKind::Ident, text, range),
        // Skipped by logos callbacks; never reaches conversion.
        RawToken::LineComment | RawToken::BlockComment => {
            Token::bare(TokenKind::Unknown, range)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut stream = TokenStream::new(source);
        let mut out = Vec::new();
        loop {
            let token = stream.next();
            if token.kind == TokenKind::Eof {
                return out;
            }
            out.push(token.kind);
        }
    }

    #[test]
    fn test_peek_then_next_agree() {
        let mut stream = TokenStream::new("out = 1 + 2");
        loop {
            let peeked = stream.peek().clone();
            let taken = stream.next();
            assert_eq!(peeked, taken);
            if taken.kind == TokenKind::Eof {
                break;
            }
        }
    }

    #[test]
    fn test_peek_is_idempotent() {
        let stream = TokenStream::new("a + b");
        let first = stream.peek().clone();
        for _ in 0..5 {
            assert_eq!(stream.peek(), &first);
        }
    }

    #[test]
    fn test_restart_rewinds() {
        let mut stream = TokenStream::new("x = 1");
        let first: Vec<Token> = std::iter::from_fn(|| {
            let t = stream.next();
            (t.kind != TokenKind::Eof).then_some(t)
        })
        .collect();
        stream.restart();
        let second: Vec<Token> = std::iter::from_fn(|| {
            let t = stream.next();
            (t.kind != TokenKind::Eof).then_some(t)
        })
        .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_eof_is_sticky() {
        let mut stream = TokenStream::new("");
        assert_eq!(stream.next().kind, TokenKind::Eof);
        assert_eq!(stream.next().kind, TokenKind::Eof);
        assert_eq!(stream.peek().kind, TokenKind::Eof);
    }

    #[test]
    fn test_statement_tokens() {
        assert_eq!(
            kinds("out:num = sin(phase) * 0.5"),
            vec![
                TokenKind::Ident,
                TokenKind::Colon,
                TokenKind::Num,
                TokenKind::Eq,
                TokenKind::Ident,
                TokenKind::LParen,
                TokenKind::Ident,
                TokenKind::RParen,
                TokenKind::Star,
                TokenKind::Number,
            ]
        );
    }

    #[test]
    fn test_unknown_spans_remainder() {
        let mut stream = TokenStream::new("x = 1 @ y + 2");
        let mut last = stream.next();
        while stream.peek().kind != TokenKind::Eof {
            last = stream.next();
        }
        assert_eq!(last.kind, TokenKind::Unknown);
        assert_eq!(last.range.start, Pos::new(0, 6));
        assert_eq!(last.range.end, Pos::new(0, 13));
    }

    #[test]
    fn test_unterminated_comment_unknown_starts_at_opener() {
        let mut stream = TokenStream::new("x = 1\n/* no close");
        let mut unknown = None;
        loop {
            let token = stream.next();
            if token.kind == TokenKind::Unknown {
                unknown = Some(token);
            } else if token.kind == TokenKind::Eof {
                break;
            }
        }
        let unknown = unknown.expect("expected an Unknown token");
        assert_eq!(unknown.range.start, Pos::new(1, 0));
    }

    #[test]
    fn test_line_and_column_positions() {
        let mut stream = TokenStream::new("a\n  b");
        let a = stream.next();
        assert_eq!(a.range.start, Pos::new(0, 0));
        let newline = stream.next();
        assert_eq!(newline.kind, TokenKind::Newline);
        let b = stream.next();
        assert_eq!(b.range.start, Pos::new(1, 2));
        assert_eq!(b.range.end, Pos::new(1, 3));
    }

    #[test]
    fn test_note_token_carries_midi_number() {
        let mut stream = TokenStream::new("a4");
        let note = stream.next();
        assert_eq!(note.kind, TokenKind::Note);
        assert_eq!(note.text, "69");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // peek/next agreement over arbitrary printable input.
            #[test]
            fn peek_always_matches_next(source in "[ -~\n]{0,64}") {
                let mut stream = TokenStream::new(&source);
                for _ in 0..80 {
                    let peeked = stream.peek().clone();
                    let taken = stream.next();
                    prop_assert_eq!(&peeked, &taken);
                    if taken.kind == TokenKind::Eof {
                        break;
                    }
                }
            }

            // Lexing must terminate with Eof and at most one Unknown,
            // which is always the last real token.
            #[test]
            fn at_most_one_trailing_unknown(source in "[ -~\n]{0,64}") {
                let mut stream = TokenStream::new(&source);
                let mut seen_unknown = false;
                loop {
                    let token = stream.next();
                    if seen_unknown {
                        prop_assert_eq!(token.kind, TokenKind::Eof);
                    }
                    match token.kind {
                        TokenKind::Unknown => seen_unknown = true,
                        TokenKind::Eof => break,
                        _ => {}
                    }
                }
            }
        }
    }
}
