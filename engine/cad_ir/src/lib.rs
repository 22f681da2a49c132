//! Shared IR types for the cadence node compiler.
//!
//! Everything the lexer, parser, code generator, graph builder, and
//! runtime agree on lives here: source positions, tokens, the script AST,
//! the value/type model, control descriptors, and the error taxonomy.

mod ast;
mod control;
mod error;
mod source;
mod token;
mod types;

pub use ast::{BinaryOp, Block, ExprKind, Expression, LValue, Qualifier, Statement, UnaryOp};
pub use control::{ControlRef, ControlType};
pub use error::{CompileError, Error, ParseError, RuntimeError};
pub use source::{Pos, SourceRange};
pub use token::{Token, TokenKind};
pub use types::{
    ConstantValue, Form, FormTag, MidiEvent, MidiEventKind, VarType, MIDI_EVENT_CAPACITY,
};
