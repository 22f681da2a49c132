//! Raw token patterns.
//!
//! Ordered regex matching via logos: multi-character operators and
//! keywords are declared as explicit tokens so they win over the generic
//! identifier/number patterns; logos resolves the rest by longest match.
//! Horizontal whitespace is skipped, newlines are tokens.

use logos::{FilterResult, Lexer, Logos};

/// Consume a (possibly nested) block comment.
///
/// The `/*` opener has already been matched. Errors if the input ends
/// before every opened comment is closed, so an unterminated comment is
/// never silently swallowed.
fn block_comment(lex: &mut Lexer<'_, RawToken>) -> FilterResult<(), ()> {
    let remainder = lex.remainder();
    let bytes = remainder.as_bytes();
    let mut depth = 1usize;
    let mut i = 0usize;

    while i < bytes.len() {
        if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
            depth += 1;
            i += 2;
        } else if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
            depth -= 1;
            i += 2;
            if depth == 0 {
                lex.bump(i);
                return FilterResult::Skip;
            }
        } else {
            i += 1;
        }
    }

    lex.bump(remainder.len());
    FilterResult::Error(())
}

/// Unescape a string literal body.
fn string_literal(lex: &mut Lexer<'_, RawToken>) -> String {
    let slice = lex.slice();
    let body = &slice[1..slice.len() - 1];
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Resolve a note literal to its MIDI note number.
///
/// `a4` is MIDI 69; octaves follow the MIDI convention where `c-1` is 0,
/// so `c4` (middle C) is 60.
fn note_literal(lex: &mut Lexer<'_, RawToken>) -> Option<u8> {
    let slice = lex.slice().as_bytes();
    let semitone: i32 = match slice[0].to_ascii_lowercase() {
        b'c' => 0,
        b'd' => 2,
        b'e' => 4,
        b'f' => 5,
        b'g' => 7,
        b'a' => 9,
        b'b' => 11,
        _ => return None,
    };
    let (accidental, octave_str): (i32, &[u8]) = match slice[1] {
        b'#' => (1, &slice[2..]),
        b'b' => (-1, &slice[2..]),
        _ => (0, &slice[1..]),
    };
    let octave: i32 = std::str::from_utf8(octave_str).ok()?.parse().ok()?;
    let midi = (octave + 1) * 12 + semitone + accidental;
    u8::try_from(midi).ok().filter(|&n| n <= 127)
}

/// Raw token from logos, before source ranges are attached.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r]+")]
pub enum RawToken {
    #[regex(r"//[^\n]*", logos::skip)]
    LineComment,

    #[token("/*", block_comment)]
    BlockComment,

    #[token("\n")]
    Newline,

    // Keywords
    #[token("num")]
    Num,
    #[token("midi")]
    Midi,
    #[token("scope")]
    Scope,
    #[token("pure")]
    Pure,
    #[token("const")]
    Const,

    // Multi-character operators before their single-character prefixes.
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<=")]
    LtEq,
    #[token(">=")]
    GtEq,
    #[token("&&")]
    AmpAmp,
    #[token("||")]
    PipePipe,
    #[token("->")]
    Arrow,
    #[token("+=")]
    PlusEq,
    #[token("-=")]
    MinusEq,
    #[token("*=")]
    StarEq,
    #[token("/=")]
    SlashEq,
    #[token("%=")]
    PercentEq,
    #[token("^=")]
    CaretEq,

    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("^")]
    Caret,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("!")]
    Bang,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("=")]
    Eq,

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token(";")]
    Semicolon,

    // Note literals win over identifiers of the same length by priority;
    // a longer match such as `a42x` still lexes as an identifier.
    #[regex(r"[a-gA-G][#b]?[0-9]", note_literal, priority = 4)]
    Note(u8),

    #[regex(r"([0-9]+(\.[0-9]+)?|\.[0-9]+)([eE][+-]?[0-9]+)?", |lex| {
        lex.slice().parse::<f64>().ok()
    })]
    Number(f64),

    #[regex(r#""([^"\\\n]|\\.)*""#, string_literal)]
    Str(String),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_owned())]
    Ident(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(source: &str) -> Vec<Result<RawToken, ()>> {
        RawToken::lexer(source).collect()
    }

    #[test]
    fn test_longest_match_operators() {
        let tokens = lex_all("->-<= <");
        assert_eq!(
            tokens,
            vec![
                Ok(RawToken::Arrow),
                Ok(RawToken::Minus),
                Ok(RawToken::LtEq),
                Ok(RawToken::Lt),
            ]
        );
    }

    #[test]
    fn test_keywords_before_identifiers() {
        let tokens = lex_all("num number");
        assert_eq!(
            tokens,
            vec![
                Ok(RawToken::Num),
                Ok(RawToken::Ident("number".to_owned())),
            ]
        );
    }

    #[test]
    fn test_note_literals() {
        assert_eq!(lex_all("a4"), vec![Ok(RawToken::Note(69))]);
        assert_eq!(lex_all("c4"), vec![Ok(RawToken::Note(60))]);
        assert_eq!(lex_all("c#3"), vec![Ok(RawToken::Note(49))]);
        assert_eq!(lex_all("eb2"), vec![Ok(RawToken::Note(39))]);
        // Longer than a note: identifier wins.
        assert_eq!(lex_all("a42"), vec![Ok(RawToken::Ident("a42".to_owned()))]);
    }

    #[test]
    fn test_numbers() {
        assert_eq!(lex_all("12"), vec![Ok(RawToken::Number(12.0))]);
        assert_eq!(lex_all("0.5"), vec![Ok(RawToken::Number(0.5))]);
        assert_eq!(lex_all(".5"), vec![Ok(RawToken::Number(0.5))]);
        assert_eq!(lex_all("1e-3"), vec![Ok(RawToken::Number(1e-3))]);
    }

    #[test]
    fn test_nested_block_comment() {
        let tokens = lex_all("1 /* outer /* inner */ still outer */ 2");
        assert_eq!(
            tokens,
            vec![Ok(RawToken::Number(1.0)), Ok(RawToken::Number(2.0))]
        );
    }

    #[test]
    fn test_unterminated_block_comment_is_error() {
        let tokens = lex_all("1 /* never closed");
        assert_eq!(tokens[0], Ok(RawToken::Number(1.0)));
        assert_eq!(tokens[1], Err(()));
        assert_eq!(tokens.len(), 2);
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            lex_all(r#""a\nb\"c""#),
            vec![Ok(RawToken::Str("a\nb\"c".to_owned()))]
        );
    }

    #[test]
    fn test_unterminated_string_is_error() {
        let tokens = lex_all("\"oops");
        assert_eq!(tokens[0], Err(()));
    }

    #[test]
    fn test_newline_is_a_token() {
        let tokens = lex_all("1\n2");
        assert_eq!(
            tokens,
            vec![
                Ok(RawToken::Number(1.0)),
                Ok(RawToken::Newline),
                Ok(RawToken::Number(2.0)),
            ]
        );
    }
}
