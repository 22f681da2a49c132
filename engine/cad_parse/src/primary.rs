//! Prefix and postfix parsing.
//!
//! Prefix dispatch on token kind covers literals, identifiers, brackets
//! and parens; identifier parsing distinguishes plain references, control
//! declarations (`name:type`) and calls (`name(...)`) by one token of
//! lookahead. Postfix handles the `->` form cast.

use cad_ir::{ControlType, ExprKind, Expression, FormTag, ParseError, TokenKind};

use crate::Parser;

impl Parser<'_> {
    /// Postfix level: primary expression followed by any number of casts.
    pub(crate) fn parse_postfix(&mut self) -> Result<Expression, ParseError> {
        let mut expr = self.parse_primary()?;

        while self.peek_kind() == TokenKind::Arrow {
            self.advance();
            let token = self.expect(TokenKind::Ident)?;
            let Some(target) = FormTag::from_name(&token.text) else {
                return Err(ParseError::new(
                    format!("unknown form `{}`", token.text),
                    token.range,
                ));
            };
            let range = expr.range.merge(token.range);
            expr = Expression::new(
                ExprKind::Cast {
                    target,
                    operand: Box::new(expr),
                },
                range,
            );
        }

        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expression, ParseError> {
        match self.peek_kind() {
            TokenKind::Number => {
                let token = self.advance();
                let value: f64 = token.text.parse().map_err(|_| {
                    ParseError::new(format!("invalid number `{}`", token.text), token.range)
                })?;
                Ok(Expression::new(ExprKind::Number(value), token.range))
            }
            TokenKind::Note => {
                let token = self.advance();
                let note: u8 = token.text.parse().map_err(|_| {
                    ParseError::new(format!("invalid note `{}`", token.text), token.range)
                })?;
                Ok(Expression::new(ExprKind::Note(note), token.range))
            }
            TokenKind::Str => {
                let token = self.peek();
                Err(ParseError::new(
                    "string literals have no value meaning here",
                    token.range,
                ))
            }
            TokenKind::Ident => self.parse_identifier(),
            TokenKind::LParen => self.parse_paren(),
            TokenKind::LBracket => self.parse_array(),
            _ => Err(self.unexpected("expected an expression")),
        }
    }

    /// Identifier dispatch: `name:` declares a control, `name(` calls a
    /// builtin, anything else is a plain reference.
    fn parse_identifier(&mut self) -> Result<Expression, ParseError> {
        let ident = self.advance();

        match self.peek_kind() {
            TokenKind::Colon => {
                self.advance();
                let (control_type, end) = self.parse_control_type()?;
                let range = ident.range.merge(end);
                Ok(Expression::new(
                    ExprKind::Control {
                        name: ident.text,
                        control_type,
                    },
                    range,
                ))
            }
            TokenKind::LParen => {
                self.advance();
                let mut args = Vec::new();
                if self.peek_kind() != TokenKind::RParen {
                    loop {
                        args.push(self.parse_expr()?);
                        if self.eat(TokenKind::Comma).is_none() {
                            break;
                        }
                    }
                }
                let close = self.expect(TokenKind::RParen)?;
                let range = ident.range.merge(close.range);
                Ok(Expression::new(
                    ExprKind::Call {
                        name: ident.text,
                        args,
                    },
                    range,
                ))
            }
            _ => Ok(Expression::new(
                ExprKind::Variable(ident.text.clone()),
                ident.range,
            )),
        }
    }

    /// The type suffix of a control declaration.
    fn parse_control_type(
        &mut self,
    ) -> Result<(ControlType, cad_ir::SourceRange), ParseError> {
        let token = self.advance();
        let base = match token.kind {
            TokenKind::Num => ControlType::Audio,
            TokenKind::Midi => ControlType::Midi,
            TokenKind::Scope => return Ok((ControlType::Scope, token.range)),
            _ => {
                return Err(ParseError::new(
                    format!("expected a control type, found {}", token.kind),
                    token.range,
                ));
            }
        };

        // `num[]` / `midi[]` are the extractor variants.
        if self.peek_kind() == TokenKind::LBracket {
            self.advance();
            let close = self.expect(TokenKind::RBracket)?;
            let extractor = match base {
                ControlType::Audio => ControlType::AudioExtract,
                _ => ControlType::MidiExtract,
            };
            return Ok((extractor, token.range.merge(close.range)));
        }

        Ok((base, token.range))
    }

    /// Parenthesized group or tuple literal.
    fn parse_paren(&mut self) -> Result<Expression, ParseError> {
        let open = self.advance();
        self.skip_newlines();
        let first = self.parse_expr()?;

        if self.eat(TokenKind::Comma).is_none() {
            let close = self.expect(TokenKind::RParen)?;
            // Grouping only: keep the inner node, widen its range.
            return Ok(Expression::new(
                first.kind,
                open.range.merge(close.range),
            ));
        }

        let mut items = vec![first];
        loop {
            self.skip_newlines();
            items.push(self.parse_expr()?);
            if self.eat(TokenKind::Comma).is_none() {
                break;
            }
        }
        let close = self.expect(TokenKind::RParen)?;
        Ok(Expression::new(
            ExprKind::Tuple(items),
            open.range.merge(close.range),
        ))
    }

    fn parse_array(&mut self) -> Result<Expression, ParseError> {
        let open = self.advance();
        let mut items = Vec::new();
        self.skip_newlines();
        if self.peek_kind() != TokenKind::RBracket {
            loop {
                items.push(self.parse_expr()?);
                if self.eat(TokenKind::Comma).is_none() {
                    break;
                }
                self.skip_newlines();
            }
        }
        let close = self.expect(TokenKind::RBracket)?;
        Ok(Expression::new(
            ExprKind::Array(items),
            open.range.merge(close.range),
        ))
    }
}
