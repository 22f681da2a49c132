//! Recursive descent parser for custom node scripts.
//!
//! Precedence climbing with one method per level; prefix parsing
//! dispatches on token kind, postfix parsing handles call argument lists,
//! casts and compound assignment. A malformed construct produces a single
//! located `ParseError` and parsing stops - the caller never receives a
//! partially valid AST.

mod expr;
mod primary;

use cad_ir::{Block, Expression, ParseError, Qualifier, Statement, Token, TokenKind};
use cad_lexer::TokenStream;

/// Parser state over a borrowed token stream.
pub struct Parser<'a> {
    stream: &'a mut TokenStream,
}

/// Parse a whole script.
pub fn parse(stream: &mut TokenStream) -> Result<Block, ParseError> {
    Parser::new(stream).parse_block()
}

/// Parse a single expression, for embedded contexts.
pub fn parse_expression(stream: &mut TokenStream) -> Result<Expression, ParseError> {
    let mut parser = Parser::new(stream);
    parser.skip_newlines();
    parser.parse_expr()
}

impl<'a> Parser<'a> {
    /// Create a new parser.
    pub fn new(stream: &'a mut TokenStream) -> Self {
        Parser { stream }
    }

    #[inline]
    fn peek(&self) -> &Token {
        self.stream.peek()
    }

    #[inline]
    fn peek_kind(&self) -> TokenKind {
        self.stream.peek().kind
    }

    #[inline]
    fn advance(&mut self) -> Token {
        self.stream.next()
    }

    /// Consume the next token if it has the expected kind.
    fn eat(&mut self, kind: TokenKind) -> Option<Token> {
        if self.peek_kind() == kind {
            Some(self.advance())
        } else {
            None
        }
    }

    /// Consume the next token, failing if it is not the expected kind.
    fn expect(&mut self, kind: TokenKind) -> Result<Token, ParseError> {
        let token = self.peek();
        if token.kind == kind {
            Ok(self.advance())
        } else {
            Err(self.unexpected(format!("expected {kind}")))
        }
    }

    /// Error at the current token. Unknown tokens get the lexer's message.
    fn unexpected(&self, expected: impl Into<String>) -> ParseError {
        let token = self.peek();
        let message = match token.kind {
            TokenKind::Unknown => "unrecognized or unterminated input".to_owned(),
            kind => format!("{}, found {kind}", expected.into()),
        };
        ParseError::new(message, token.range)
    }

    fn skip_newlines(&mut self) {
        while self.peek_kind() == TokenKind::Newline {
            self.advance();
        }
    }

    /// Parse the top-level statement sequence.
    pub fn parse_block(&mut self) -> Result<Block, ParseError> {
        let mut statements = Vec::new();

        loop {
            self.skip_newlines();
            while self.eat(TokenKind::Semicolon).is_some() {
                self.skip_newlines();
            }
            if self.peek_kind() == TokenKind::Eof {
                break;
            }
            statements.push(self.parse_statement()?);
        }

        Ok(Block::new(statements))
    }

    /// Parse one statement: optional qualifier, expression, separator.
    fn parse_statement(&mut self) -> Result<Statement, ParseError> {
        let qualifier = match self.peek_kind() {
            TokenKind::Pure => {
                self.advance();
                Qualifier::Pure
            }
            TokenKind::Const => {
                self.advance();
                Qualifier::Const
            }
            _ => Qualifier::None,
        };

        let start = self.peek().range;
        let expr = self.parse_expr()?;
        let range = start.merge(expr.range);

        if !self.peek_kind().is_statement_end() {
            return Err(self.unexpected("expected end of statement"));
        }
        if self.peek_kind() != TokenKind::Eof {
            self.advance();
        }

        Ok(Statement {
            qualifier,
            expr,
            range,
        })
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use cad_ir::{BinaryOp, ControlType, ExprKind, LValue, Pos, UnaryOp};
    use pretty_assertions::assert_eq;

    fn parse_ok(source: &str) -> Block {
        let mut stream = TokenStream::new(source);
        match parse(&mut stream) {
            Ok(block) => block,
            Err(e) => panic!("parse failed for {source:?}: {e} at {}", e.range),
        }
    }

    fn parse_err(source: &str) -> ParseError {
        let mut stream = TokenStream::new(source);
        match parse(&mut stream) {
            Ok(block) => panic!("expected parse error for {source:?}, got {block:?}"),
            Err(e) => e,
        }
    }

    fn only_expr(block: &Block) -> &Expression {
        assert_eq!(block.statements.len(), 1);
        &block.statements[0].expr
    }

    #[test]
    fn test_empty_script() {
        assert!(parse_ok("").is_empty());
        assert!(parse_ok("\n\n  \n").is_empty());
        assert!(parse_ok(";\n;").is_empty());
    }

    #[test]
    fn test_simple_assignment() {
        let block = parse_ok("out = 1 + 2");
        let ExprKind::Assign { target, op, value } = &only_expr(&block).kind else {
            panic!("expected assignment");
        };
        assert_eq!(op, &None);
        assert!(matches!(target, LValue::Variable { name, .. } if name == "out"));
        let ExprKind::Binary { op, .. } = &value.kind else {
            panic!("expected binary rhs");
        };
        assert_eq!(*op, BinaryOp::Add);
    }

    #[test]
    fn test_control_declaration_assignment() {
        let block = parse_ok("out:num = sin(phase)");
        let ExprKind::Assign { target, .. } = &only_expr(&block).kind else {
            panic!("expected assignment");
        };
        let LValue::Control {
            name, control_type, ..
        } = target
        else {
            panic!("expected control target");
        };
        assert_eq!(name, "out");
        assert_eq!(*control_type, ControlType::Audio);
    }

    #[test]
    fn test_extractor_control_types() {
        let block = parse_ok("voices:num[] = 0\nevents:midi[] = input");
        let ExprKind::Assign { target, .. } = &block.statements[0].expr.kind else {
            panic!();
        };
        assert!(
            matches!(target, LValue::Control { control_type, .. } if *control_type == ControlType::AudioExtract)
        );
        let ExprKind::Assign { target, .. } = &block.statements[1].expr.kind else {
            panic!();
        };
        assert!(
            matches!(target, LValue::Control { control_type, .. } if *control_type == ControlType::MidiExtract)
        );
    }

    #[test]
    fn test_precedence_total_order() {
        // 1 + 2 * 3 ^ 2 parses as 1 + (2 * (3 ^ 2))
        let block = parse_ok("1 + 2 * 3 ^ 2");
        let ExprKind::Binary { op, right, .. } = &only_expr(&block).kind else {
            panic!();
        };
        assert_eq!(*op, BinaryOp::Add);
        let ExprKind::Binary { op, right, .. } = &right.kind else {
            panic!();
        };
        assert_eq!(*op, BinaryOp::Mul);
        assert!(matches!(
            &right.kind,
            ExprKind::Binary {
                op: BinaryOp::Power,
                ..
            }
        ));
    }

    #[test]
    fn test_equality_binds_looser_than_bitwise() {
        let block = parse_ok("a & b == c");
        let ExprKind::Binary { op, .. } = &only_expr(&block).kind else {
            panic!();
        };
        assert_eq!(*op, BinaryOp::Eq);
    }

    #[test]
    fn test_logical_binds_loosest_before_assignment() {
        let block = parse_ok("a == b && c == d");
        let ExprKind::Binary { op, .. } = &only_expr(&block).kind else {
            panic!();
        };
        assert_eq!(*op, BinaryOp::LogicalAnd);
    }

    #[test]
    fn test_power_is_right_associative() {
        let block = parse_ok("2 ^ 3 ^ 4");
        let ExprKind::Binary { op, left, right } = &only_expr(&block).kind else {
            panic!();
        };
        assert_eq!(*op, BinaryOp::Power);
        assert!(matches!(left.kind, ExprKind::Number(n) if n == 2.0));
        assert!(matches!(
            &right.kind,
            ExprKind::Binary {
                op: BinaryOp::Power,
                ..
            }
        ));
    }

    #[test]
    fn test_unary_and_cast_bind_tightest() {
        let block = parse_ok("-x -> freq");
        let ExprKind::Cast { target, operand } = &only_expr(&block).kind else {
            panic!("expected cast at top");
        };
        assert_eq!(*target, cad_ir::FormTag::Freq);
        assert!(matches!(
            &operand.kind,
            ExprKind::Unary {
                op: UnaryOp::Neg,
                ..
            }
        ));
    }

    #[test]
    fn test_compound_assignment_desugars() {
        let block = parse_ok("gain *= 0.5");
        let ExprKind::Assign { op, .. } = &only_expr(&block).kind else {
            panic!();
        };
        assert_eq!(*op, Some(BinaryOp::Mul));
    }

    #[test]
    fn test_tuple_literal_and_tuple_target() {
        let block = parse_ok("(l, r) = (0.1, 0.2)");
        let ExprKind::Assign { target, value, .. } = &only_expr(&block).kind else {
            panic!();
        };
        assert!(matches!(target, LValue::Tuple { items, .. } if items.len() == 2));
        assert!(matches!(&value.kind, ExprKind::Tuple(items) if items.len() == 2));
    }

    #[test]
    fn test_parenthesized_is_not_tuple() {
        let block = parse_ok("(1 + 2) * 3");
        let ExprKind::Binary { op, left, .. } = &only_expr(&block).kind else {
            panic!();
        };
        assert_eq!(*op, BinaryOp::Mul);
        assert!(matches!(
            &left.kind,
            ExprKind::Binary {
                op: BinaryOp::Add,
                ..
            }
        ));
    }

    #[test]
    fn test_array_literal() {
        let block = parse_ok("[1, 2, 3]");
        assert!(matches!(&only_expr(&block).kind, ExprKind::Array(items) if items.len() == 3));
    }

    #[test]
    fn test_call_with_arguments() {
        let block = parse_ok("mix(a, b, 0.25)");
        let ExprKind::Call { name, args } = &only_expr(&block).kind else {
            panic!();
        };
        assert_eq!(name, "mix");
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn test_note_literal() {
        let block = parse_ok("a4");
        assert!(matches!(only_expr(&block).kind, ExprKind::Note(69)));
    }

    #[test]
    fn test_pure_and_const_qualifiers() {
        let block = parse_ok("pure base = 440 -> freq\nconst two = 2");
        assert_eq!(block.statements[0].qualifier, Qualifier::Pure);
        assert_eq!(block.statements[1].qualifier, Qualifier::Const);
    }

    #[test]
    fn test_invalid_assignment_target() {
        let err = parse_err("1 + 2 = 3");
        assert!(err.message.contains("cannot assign"));
    }

    #[test]
    fn test_error_is_located() {
        let err = parse_err("x = ");
        assert_eq!(err.range.start.line, 0);
        assert!(err.message.contains("found end of input"));
    }

    #[test]
    fn test_unterminated_string_single_error() {
        let err = parse_err("s = \"oops");
        assert_eq!(err.message, "unrecognized or unterminated input");
        assert_eq!(err.range.start, Pos::new(0, 4));
    }

    #[test]
    fn test_unterminated_comment_single_error() {
        let err = parse_err("x = 1\n/* open");
        assert_eq!(err.range.start, Pos::new(1, 0));
    }

    #[test]
    fn test_unknown_form_name() {
        let err = parse_err("x = 1 -> hz");
        assert!(err.message.contains("unknown form"));
    }

    #[test]
    fn test_reparse_after_restart_is_identical() {
        let source = "pure base = a4 -> freq\nout:num = sin(base * 2) * 0.5";
        let mut stream = TokenStream::new(source);
        let first = parse(&mut stream).expect("first parse");
        stream.restart();
        let second = parse(&mut stream).expect("second parse");
        assert_eq!(first, second);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Parsing arbitrary input either yields a block or exactly one
            // error; it never panics or loops.
            #[test]
            fn parse_total(source in "[ -~\n]{0,48}") {
                let mut stream = TokenStream::new(&source);
                let _ = parse(&mut stream);
            }

            // restart determinism over arbitrary sources.
            #[test]
            fn restart_deterministic(source in "[a-z0-9 +*()=\n]{0,48}") {
                let mut stream = TokenStream::new(&source);
                let first = parse(&mut stream);
                stream.restart();
                let second = parse(&mut stream);
                prop_assert_eq!(first, second);
            }
        }
    }
}
