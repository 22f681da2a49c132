//! The expression/statement AST for custom node scripts.
//!
//! Built once per compile, owned exclusively by the compile step, and
//! discarded after codegen. Every node carries its `SourceRange` for
//! diagnostics. Expression kinds are a closed enum matched exhaustively
//! by the semantic walk and the code generator.

use std::fmt;

use crate::control::ControlType;
use crate::source::SourceRange;
use crate::types::FormTag;

/// Binary operators, in source spelling.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Power,
    BitAnd,
    BitOr,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    LogicalAnd,
    LogicalOr,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Power => "^",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::LogicalAnd => "&&",
            BinaryOp::LogicalOr => "||",
        };
        f.write_str(s)
    }
}

/// Unary operators.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// An expression node.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub kind: ExprKind,
    pub range: SourceRange,
}

impl Expression {
    pub fn new(kind: ExprKind, range: SourceRange) -> Self {
        Expression { kind, range }
    }
}

/// Expression variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// Numeric literal.
    Number(f64),
    /// Note literal, already resolved to a MIDI note number.
    Note(u8),
    /// Reference to a script-local variable.
    Variable(String),
    /// Control declaration or reference: `name:num`.
    Control {
        name: String,
        control_type: ControlType,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    /// Assignment, possibly compound (`x += e` carries `op: Some(Add)`).
    Assign {
        target: LValue,
        op: Option<BinaryOp>,
        value: Box<Expression>,
    },
    /// Builtin call.
    Call {
        name: String,
        args: Vec<Expression>,
    },
    /// Form cast: `expr -> freq`.
    Cast {
        target: FormTag,
        operand: Box<Expression>,
    },
    Tuple(Vec<Expression>),
    Array(Vec<Expression>),
}

/// The assignable subset of expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum LValue {
    Variable {
        name: String,
        range: SourceRange,
    },
    Control {
        name: String,
        control_type: ControlType,
        range: SourceRange,
    },
    Tuple {
        items: Vec<LValue>,
        range: SourceRange,
    },
}

impl LValue {
    pub fn range(&self) -> SourceRange {
        match self {
            LValue::Variable { range, .. }
            | LValue::Control { range, .. }
            | LValue::Tuple { range, .. } => *range,
        }
    }
}

/// Statement qualifier.
///
/// `pure` statements run once at init; `const` statements must fold at
/// compile time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Qualifier {
    #[default]
    None,
    Pure,
    Const,
}

/// One statement of a script.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub qualifier: Qualifier,
    pub expr: Expression,
    pub range: SourceRange,
}

/// A parsed script: the top-level sequence of statements.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    pub statements: Vec<Statement>,
}

impl Block {
    pub fn new(statements: Vec<Statement>) -> Self {
        Block { statements }
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Pos, SourceRange};

    fn range(a: u32, b: u32) -> SourceRange {
        SourceRange::new(Pos::new(0, a), Pos::new(0, b))
    }

    #[test]
    fn test_lvalue_range() {
        let items = vec![
            LValue::Variable {
                name: "a".into(),
                range: range(1, 2),
            },
            LValue::Variable {
                name: "b".into(),
                range: range(4, 5),
            },
        ];
        let tuple = LValue::Tuple {
            items,
            range: range(0, 6),
        };
        assert_eq!(tuple.range(), range(0, 6));
    }

    #[test]
    fn test_binary_op_display() {
        assert_eq!(BinaryOp::Power.to_string(), "^");
        assert_eq!(BinaryOp::LogicalAnd.to_string(), "&&");
    }
}
