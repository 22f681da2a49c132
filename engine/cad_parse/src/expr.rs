//! Binary operator precedence chain.
//!
//! Loosest to tightest: assignment, logical, equality/comparison,
//! bitwise, additive, multiplicative, power, unary, postfix (calls and
//! casts), primary.

use cad_ir::{BinaryOp, ExprKind, Expression, LValue, ParseError, TokenKind, UnaryOp};

use crate::Parser;

impl Parser<'_> {
    /// Parse an expression. Assignment is the loosest level.
    pub(crate) fn parse_expr(&mut self) -> Result<Expression, ParseError> {
        let left = self.parse_logical()?;

        let op = match self.peek_kind() {
            TokenKind::Eq => None,
            TokenKind::PlusEq => Some(BinaryOp::Add),
            TokenKind::MinusEq => Some(BinaryOp::Sub),
            TokenKind::StarEq => Some(BinaryOp::Mul),
            TokenKind::SlashEq => Some(BinaryOp::Div),
            TokenKind::PercentEq => Some(BinaryOp::Mod),
            TokenKind::CaretEq => Some(BinaryOp::Power),
            _ => return Ok(left),
        };
        self.advance();

        let target = lvalue_of(left)?;
        let value = self.parse_expr()?;
        let range = target.range().merge(value.range);
        Ok(Expression::new(
            ExprKind::Assign {
                target,
                op,
                value: Box::new(value),
            },
            range,
        ))
    }

    fn parse_logical(&mut self) -> Result<Expression, ParseError> {
        let mut left = self.parse_equality()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::AmpAmp => BinaryOp::LogicalAnd,
                TokenKind::PipePipe => BinaryOp::LogicalOr,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_equality()?;
            left = binary(op, left, right);
        }
    }

    fn parse_equality(&mut self) -> Result<Expression, ParseError> {
        let mut left = self.parse_bitwise()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::NotEq => BinaryOp::NotEq,
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::LtEq => BinaryOp::LtEq,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::GtEq => BinaryOp::GtEq,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_bitwise()?;
            left = binary(op, left, right);
        }
    }

    fn parse_bitwise(&mut self) -> Result<Expression, ParseError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Amp => BinaryOp::BitAnd,
                TokenKind::Pipe => BinaryOp::BitOr,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_additive()?;
            left = binary(op, left, right);
        }
    }

    fn parse_additive(&mut self) -> Result<Expression, ParseError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expression, ParseError> {
        let mut left = self.parse_power()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_power()?;
            left = binary(op, left, right);
        }
    }

    /// `^` is right-associative: `2 ^ 3 ^ 4` is `2 ^ (3 ^ 4)`.
    fn parse_power(&mut self) -> Result<Expression, ParseError> {
        let left = self.parse_unary()?;
        if self.peek_kind() != TokenKind::Caret {
            return Ok(left);
        }
        self.advance();
        let right = self.parse_power()?;
        Ok(binary(BinaryOp::Power, left, right))
    }

    pub(crate) fn parse_unary(&mut self) -> Result<Expression, ParseError> {
        let op = match self.peek_kind() {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Bang => UnaryOp::Not,
            _ => return self.parse_postfix(),
        };
        let start = self.advance().range;
        let operand = self.parse_unary()?;
        let range = start.merge(operand.range);
        Ok(Expression::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            range,
        ))
    }
}

fn binary(op: BinaryOp, left: Expression, right: Expression) -> Expression {
    let range = left.range.merge(right.range);
    Expression::new(
        ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        range,
    )
}

/// Narrow an expression to the assignable subset.
pub(crate) fn lvalue_of(expr: Expression) -> Result<LValue, ParseError> {
    match expr.kind {
        ExprKind::Variable(name) => Ok(LValue::Variable {
            name,
            range: expr.range,
        }),
        ExprKind::Control { name, control_type } => Ok(LValue::Control {
            name,
            control_type,
            range: expr.range,
        }),
        ExprKind::Tuple(items) => {
            let items = items
                .into_iter()
                .map(lvalue_of)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(LValue::Tuple {
                items,
                range: expr.range,
            })
        }
        _ => Err(ParseError::new(
            "cannot assign to this expression",
            expr.range,
        )),
    }
}
