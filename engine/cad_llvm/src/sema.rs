//! Semantic analysis of a parsed script.
//!
//! Walks the AST once to collect the control surface, type-check every
//! expression, fold `const` statements, and assign persistent slots to
//! locals defined by `pure` statements. Codegen runs only on scripts
//! that pass this phase, so a codegen failure is a compiler bug.
//!
//! Name resolution: `pure` and `const` statements define script locals;
//! every other name is a control. An explicit declaration (`name:type`)
//! fixes a control's type; a plain identifier that is not a local
//! resolves to an implicit `num` control, which is how node inputs and
//! outputs come into existence in practice.

use rustc_hash::FxHashMap;

use cad_ir::{
    BinaryOp, Block, CompileError, ConstantValue, ControlRef, ControlType, ExprKind, Expression,
    FormTag, LValue, Qualifier, SourceRange, Statement, UnaryOp, VarType,
};

use crate::intrinsics;

/// A local defined by a `pure` statement; persists in the context
/// struct across samples.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotLocal {
    pub name: String,
    pub ty: VarType,
}

/// Result of analyzing a script.
#[derive(Debug, Default)]
pub struct Analysis {
    /// Controls in order of first appearance. This order is the context
    /// struct field order and therefore ABI.
    pub controls: Vec<ControlRef>,
    control_index: FxHashMap<String, usize>,
    /// Persistent locals, in first-assignment order (also ABI).
    pub slots: Vec<SlotLocal>,
    slot_index: FxHashMap<String, usize>,
    /// Compile-time constants from `const` statements.
    pub consts: FxHashMap<String, ConstantValue>,
}

impl Analysis {
    pub fn control_of(&self, name: &str) -> Option<usize> {
        self.control_index.get(name).copied()
    }

    pub fn slot_of(&self, name: &str) -> Option<usize> {
        self.slot_index.get(name).copied()
    }

    /// Intern a control, checking type consistency across mentions.
    fn control(
        &mut self,
        name: &str,
        control_type: ControlType,
        explicit: bool,
        range: SourceRange,
    ) -> Result<usize, CompileError> {
        if let Some(&index) = self.control_index.get(name) {
            let existing = &self.controls[index];
            if explicit && existing.control_type != control_type {
                return Err(CompileError::new(
                    format!(
                        "control `{name}` is declared as both {} and {}",
                        existing.control_type, control_type
                    ),
                    range,
                ));
            }
            return Ok(index);
        }
        let index = self.controls.len();
        self.controls.push(ControlRef::new(name, control_type));
        self.control_index.insert(name.to_owned(), index);
        Ok(index)
    }

    fn define_slot(
        &mut self,
        name: &str,
        ty: VarType,
        range: SourceRange,
    ) -> Result<(), CompileError> {
        if let Some(&slot) = self.slot_index.get(name) {
            let existing = &self.slots[slot].ty;
            if *existing != ty {
                return Err(CompileError::new(
                    format!("`{name}` was {existing}, reassigned as {ty}"),
                    range,
                ));
            }
            return Ok(());
        }
        let slot = self.slots.len();
        self.slots.push(SlotLocal {
            name: name.to_owned(),
            ty,
        });
        self.slot_index.insert(name.to_owned(), slot);
        Ok(())
    }
}

/// Analyze a parsed script.
pub fn analyze(block: &Block) -> Result<Analysis, CompileError> {
    let mut analysis = Analysis::default();

    // Controls with explicit declarations anywhere in the script fix
    // their type before implicit `num` resolution kicks in.
    for statement in &block.statements {
        collect_declared(&statement.expr, &mut analysis)?;
    }

    for statement in &block.statements {
        check_statement(statement, &mut analysis)?;
    }

    Ok(analysis)
}

fn collect_declared(expr: &Expression, analysis: &mut Analysis) -> Result<(), CompileError> {
    match &expr.kind {
        ExprKind::Control { name, control_type } => {
            analysis.control(name, *control_type, true, expr.range)?;
        }
        ExprKind::Unary { operand, .. } | ExprKind::Cast { operand, .. } => {
            collect_declared(operand, analysis)?;
        }
        ExprKind::Binary { left, right, .. } => {
            collect_declared(left, analysis)?;
            collect_declared(right, analysis)?;
        }
        ExprKind::Assign { target, value, .. } => {
            collect_declared_lvalue(target, analysis)?;
            collect_declared(value, analysis)?;
        }
        ExprKind::Call { args, .. } => {
            for arg in args {
                collect_declared(arg, analysis)?;
            }
        }
        ExprKind::Tuple(items) | ExprKind::Array(items) => {
            for item in items {
                collect_declared(item, analysis)?;
            }
        }
        ExprKind::Number(_) | ExprKind::Note(_) | ExprKind::Variable(_) => {}
    }
    Ok(())
}

fn collect_declared_lvalue(lvalue: &LValue, analysis: &mut Analysis) -> Result<(), CompileError> {
    match lvalue {
        LValue::Control {
            name,
            control_type,
            range,
        } => {
            analysis.control(name, *control_type, true, *range)?;
        }
        LValue::Tuple { items, .. } => {
            for item in items {
                collect_declared_lvalue(item, analysis)?;
            }
        }
        LValue::Variable { .. } => {}
    }
    Ok(())
}

fn check_statement(statement: &Statement, analysis: &mut Analysis) -> Result<(), CompileError> {
    match statement.qualifier {
        Qualifier::Const => check_const_statement(statement, analysis),
        Qualifier::Pure => {
            check_expr(&statement.expr, analysis, LocalPolicy::Slot)?;
            Ok(())
        }
        Qualifier::None => {
            check_expr(&statement.expr, analysis, LocalPolicy::ControlOnly)?;
            Ok(())
        }
    }
}

/// What a plain-name assignment target means in the current statement.
#[derive(Copy, Clone, PartialEq)]
enum LocalPolicy {
    /// New names become persistent locals (`pure` statements).
    Slot,
    /// New names become implicit `num` controls (plain statements).
    ControlOnly,
}

fn check_const_statement(
    statement: &Statement,
    analysis: &mut Analysis,
) -> Result<(), CompileError> {
    let ExprKind::Assign {
        target,
        op: None,
        value,
    } = &statement.expr.kind
    else {
        return Err(CompileError::new(
            "a `const` statement must be a plain assignment",
            statement.range,
        ));
    };
    let LValue::Variable { name, .. } = target else {
        return Err(CompileError::new(
            "a `const` statement must assign to a plain name",
            target.range(),
        ));
    };
    let folded = fold_constant(value, analysis)?;
    analysis.consts.insert(name.clone(), folded);
    Ok(())
}

/// Fold a compile-time constant expression.
pub fn fold_constant(
    expr: &Expression,
    analysis: &Analysis,
) -> Result<ConstantValue, CompileError> {
    let not_const =
        |range| CompileError::new("expression is not a compile-time constant", range);

    match &expr.kind {
        ExprKind::Number(value) => Ok(ConstantValue::mono(*value, FormTag::None)),
        ExprKind::Note(note) => Ok(ConstantValue::mono(f64::from(*note), FormTag::Note)),
        ExprKind::Variable(name) => analysis
            .consts
            .get(name)
            .cloned()
            .ok_or_else(|| not_const(expr.range)),
        ExprKind::Unary { op, operand } => {
            let ConstantValue::Num { left, right, form } = fold_constant(operand, analysis)?
            else {
                return Err(not_const(expr.range));
            };
            let apply = |x: f64| match op {
                UnaryOp::Neg => -x,
                UnaryOp::Not => f64::from(x == 0.0),
            };
            Ok(ConstantValue::Num {
                left: apply(left),
                right: apply(right),
                form,
            })
        }
        ExprKind::Binary { op, left, right } => {
            let (ConstantValue::Num {
                left: ll,
                right: lr,
                form,
            }, ConstantValue::Num {
                left: rl,
                right: rr,
                ..
            }) = (
                fold_constant(left, analysis)?,
                fold_constant(right, analysis)?,
            )
            else {
                return Err(not_const(expr.range));
            };
            let apply = |a: f64, b: f64| -> f64 {
                match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Mod => a % b,
                    BinaryOp::Power => a.powf(b),
                    BinaryOp::BitAnd => f64::from((a as i32) & (b as i32)),
                    BinaryOp::BitOr => f64::from((a as i32) | (b as i32)),
                    BinaryOp::Eq => f64::from(a == b),
                    BinaryOp::NotEq => f64::from(a != b),
                    BinaryOp::Lt => f64::from(a < b),
                    BinaryOp::LtEq => f64::from(a <= b),
                    BinaryOp::Gt => f64::from(a > b),
                    BinaryOp::GtEq => f64::from(a >= b),
                    BinaryOp::LogicalAnd => f64::from(a != 0.0 && b != 0.0),
                    BinaryOp::LogicalOr => f64::from(a != 0.0 || b != 0.0),
                }
            };
            Ok(ConstantValue::Num {
                left: apply(ll, rl),
                right: apply(lr, rr),
                form,
            })
        }
        ExprKind::Cast { target, operand } => {
            let ConstantValue::Num { left, right, form } = fold_constant(operand, analysis)?
            else {
                return Err(not_const(expr.range));
            };
            // The only static conversion; the rest need runtime timing.
            let convert = |x: f64| {
                if form == FormTag::Note && *target == FormTag::Freq {
                    440.0 * 2f64.powf((x - 69.0) / 12.0)
                } else {
                    x
                }
            };
            Ok(ConstantValue::Num {
                left: convert(left),
                right: convert(right),
                form: *target,
            })
        }
        ExprKind::Tuple(items) => Ok(ConstantValue::Tuple(
            items
                .iter()
                .map(|item| fold_constant(item, analysis))
                .collect::<Result<Vec<_>, _>>()?,
        )),
        _ => Err(not_const(expr.range)),
    }
}

/// Type-check an expression and update control/local tables.
fn check_expr(
    expr: &Expression,
    analysis: &mut Analysis,
    policy: LocalPolicy,
) -> Result<VarType, CompileError> {
    match &expr.kind {
        ExprKind::Number(_) | ExprKind::Note(_) => Ok(VarType::Num),
        ExprKind::Variable(name) => {
            if let Some(constant) = analysis.consts.get(name) {
                return Ok(constant.var_type());
            }
            if let Some(slot) = analysis.slot_of(name) {
                return Ok(analysis.slots[slot].ty.clone());
            }
            // Implicit control read.
            let index = analysis.control(name, ControlType::Audio, false, expr.range)?;
            analysis.controls[index].read = true;
            Ok(analysis.controls[index].control_type.var_type())
        }
        ExprKind::Control { name, control_type } => {
            let index = analysis.control(name, *control_type, true, expr.range)?;
            analysis.controls[index].read = true;
            Ok(analysis.controls[index].control_type.var_type())
        }
        ExprKind::Unary { operand, .. } => {
            expect_num(check_expr(operand, analysis, policy)?, operand.range)?;
            Ok(VarType::Num)
        }
        ExprKind::Binary { left, right, .. } => {
            expect_num(check_expr(left, analysis, policy)?, left.range)?;
            expect_num(check_expr(right, analysis, policy)?, right.range)?;
            Ok(VarType::Num)
        }
        ExprKind::Cast { operand, .. } => {
            expect_num(check_expr(operand, analysis, policy)?, operand.range)?;
            Ok(VarType::Num)
        }
        ExprKind::Call { name, args } => {
            if name == "bpm" || name == "sampleRate" {
                if !args.is_empty() {
                    return Err(CompileError::new(
                        format!("`{name}` takes no arguments"),
                        expr.range,
                    ));
                }
                return Ok(VarType::Num);
            }
            let Some((_, arity)) = intrinsics::lookup(name) else {
                return Err(CompileError::new(
                    format!("unknown function `{name}`"),
                    expr.range,
                ));
            };
            if args.len() != arity as usize {
                return Err(CompileError::new(
                    format!(
                        "`{name}` expects {arity} argument{}, got {}",
                        if arity == 1 { "" } else { "s" },
                        args.len()
                    ),
                    expr.range,
                ));
            }
            for arg in args {
                expect_num(check_expr(arg, analysis, policy)?, arg.range)?;
            }
            Ok(VarType::Num)
        }
        ExprKind::Tuple(items) => {
            let types = items
                .iter()
                .map(|item| check_expr(item, analysis, policy))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(VarType::Tuple(types))
        }
        ExprKind::Array(items) => {
            if items.is_empty() {
                return Err(CompileError::new(
                    "cannot infer the element type of an empty array",
                    expr.range,
                ));
            }
            let first = check_expr(&items[0], analysis, policy)?;
            for item in &items[1..] {
                let ty = check_expr(item, analysis, policy)?;
                if ty != first {
                    return Err(CompileError::new(
                        format!("array elements disagree: {first} vs {ty}"),
                        item.range,
                    ));
                }
            }
            Ok(VarType::Array(Box::new(first), items.len()))
        }
        ExprKind::Assign { target, op, value } => {
            let value_ty = check_expr(value, analysis, policy)?;
            check_assign(target, op.is_some(), &value_ty, analysis, policy)?;
            Ok(value_ty)
        }
    }
}

fn check_assign(
    target: &LValue,
    compound: bool,
    value_ty: &VarType,
    analysis: &mut Analysis,
    policy: LocalPolicy,
) -> Result<(), CompileError> {
    match target {
        LValue::Variable { name, range } => {
            if analysis.consts.contains_key(name) {
                return Err(CompileError::new(
                    format!("cannot assign to constant `{name}`"),
                    *range,
                ));
            }
            // An existing slot local is always written in place; new
            // names become slots only inside `pure` statements.
            if analysis.slot_of(name).is_some() || policy == LocalPolicy::Slot {
                if compound && analysis.slot_of(name).is_none() {
                    return Err(CompileError::new(
                        format!("`{name}` is not defined before compound assignment"),
                        *range,
                    ));
                }
                return analysis.define_slot(name, value_ty.clone(), *range);
            }
            // Implicit control write.
            let index = analysis.control(name, ControlType::Audio, false, *range)?;
            control_write(analysis, index, compound, value_ty, name, *range)
        }
        LValue::Control {
            name,
            control_type,
            range,
        } => {
            let index = analysis.control(name, *control_type, true, *range)?;
            control_write(analysis, index, compound, value_ty, name, *range)
        }
        LValue::Tuple { items, range } => {
            if compound {
                return Err(CompileError::new(
                    "compound assignment cannot target a tuple",
                    *range,
                ));
            }
            let VarType::Tuple(item_types) = value_ty else {
                return Err(CompileError::new(
                    format!("tuple target needs a tuple value, got {value_ty}"),
                    *range,
                ));
            };
            if item_types.len() != items.len() {
                return Err(CompileError::new(
                    format!(
                        "tuple target has {} elements, value has {}",
                        items.len(),
                        item_types.len()
                    ),
                    *range,
                ));
            }
            for (item, ty) in items.iter().zip(item_types) {
                check_assign(item, false, ty, analysis, policy)?;
            }
            Ok(())
        }
    }
}

fn control_write(
    analysis: &mut Analysis,
    index: usize,
    compound: bool,
    value_ty: &VarType,
    name: &str,
    range: SourceRange,
) -> Result<(), CompileError> {
    let control = &mut analysis.controls[index];
    control.written = true;
    if compound {
        control.read = true;
    }
    let expected = control.control_type.var_type();
    if *value_ty != expected {
        return Err(CompileError::new(
            format!("control `{name}` stores {expected}, got {value_ty}"),
            range,
        ));
    }
    Ok(())
}

fn expect_num(ty: VarType, range: SourceRange) -> Result<(), CompileError> {
    if ty == VarType::Num {
        Ok(())
    } else {
        Err(CompileError::new(
            format!("expected num, got {ty}"),
            range,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cad_lexer::TokenStream;

    fn analyze_source(source: &str) -> Result<Analysis, CompileError> {
        let mut stream = TokenStream::new(source);
        let block = cad_parse::parse(&mut stream).expect("parse");
        analyze(&block)
    }

    #[test]
    fn test_empty_script_has_no_controls() {
        let analysis = analyze_source("").unwrap();
        assert!(analysis.controls.is_empty());
        assert!(analysis.slots.is_empty());
    }

    #[test]
    fn test_implicit_control_from_assignment() {
        let analysis = analyze_source("out = 1 + 2").unwrap();
        assert_eq!(analysis.controls.len(), 1);
        let control = &analysis.controls[0];
        assert_eq!(control.name, "out");
        assert_eq!(control.control_type, ControlType::Audio);
        assert!(control.written);
        assert!(!control.read);
    }

    #[test]
    fn test_read_write_flags_match_usage() {
        let analysis = analyze_source("out:num = gain * input").unwrap();
        let by_name = |n: &str| {
            analysis
                .controls
                .iter()
                .find(|c| c.name == n)
                .unwrap()
                .clone()
        };
        let out = by_name("out");
        assert!(out.written && !out.read);
        let gain = by_name("gain");
        assert!(!gain.written && gain.read);
        let input = by_name("input");
        assert!(!input.written && input.read);
    }

    #[test]
    fn test_compound_assignment_reads_and_writes() {
        let analysis = analyze_source("level += 0.1").unwrap();
        let control = &analysis.controls[0];
        assert!(control.written && control.read);
    }

    #[test]
    fn test_explicit_declaration_fixes_type() {
        let analysis = analyze_source("m:midi = src:midi").unwrap();
        assert_eq!(analysis.controls[0].control_type, ControlType::Midi);
        assert_eq!(analysis.controls[1].control_type, ControlType::Midi);
        assert!(analysis.controls[0].written);
        assert!(analysis.controls[1].read);
    }

    #[test]
    fn test_extractor_control_from_array() {
        let analysis =
            analyze_source("voices:num[] = [0, 0, 0, 0, 0, 0, 0, 0]").unwrap();
        assert_eq!(
            analysis.controls[0].control_type,
            ControlType::AudioExtract
        );
    }

    #[test]
    fn test_extractor_arity_mismatch_rejected() {
        let err = analyze_source("voices:num[] = [0, 0]").unwrap_err();
        assert!(err.message.contains("stores"));
    }

    #[test]
    fn test_conflicting_declarations_rejected() {
        let err = analyze_source("x:num = 0\ny = x:midi").unwrap_err();
        assert!(err.message.contains("declared as both"));
    }

    #[test]
    fn test_pure_locals_get_slots() {
        let analysis = analyze_source("pure base = 440\nout = base * 2").unwrap();
        assert_eq!(analysis.slots.len(), 1);
        assert_eq!(analysis.slots[0].name, "base");
        assert_eq!(analysis.slot_of("base"), Some(0));
        // `base` is a local, not a control.
        assert_eq!(analysis.controls.len(), 1);
        assert_eq!(analysis.controls[0].name, "out");
    }

    #[test]
    fn test_slot_reassignment_keeps_one_slot() {
        let analysis = analyze_source("pure acc = 0\nacc = acc + 1\nout = acc").unwrap();
        assert_eq!(analysis.slots.len(), 1);
        assert_eq!(analysis.controls.len(), 1);
    }

    #[test]
    fn test_const_folding() {
        let analysis = analyze_source("const two = 1 + 1\nconst freq = a4 -> freq").unwrap();
        assert_eq!(
            analysis.consts["two"],
            ConstantValue::mono(2.0, FormTag::None)
        );
        let ConstantValue::Num { left, form, .. } = analysis.consts["freq"] else {
            panic!();
        };
        assert!((left - 440.0).abs() < 1e-9);
        assert_eq!(form, FormTag::Freq);
    }

    #[test]
    fn test_const_must_fold() {
        let err = analyze_source("const x = someInput * 2").unwrap_err();
        assert!(err.message.contains("not a compile-time constant"));
    }

    #[test]
    fn test_midi_cannot_be_added() {
        let err = analyze_source("m:midi = in1:midi\nout = m + 1").unwrap_err();
        assert!(err.message.contains("expected num"));
    }

    #[test]
    fn test_unknown_function() {
        let err = analyze_source("out = sine(1)").unwrap_err();
        assert!(err.message.contains("unknown function"));
    }

    #[test]
    fn test_arity_mismatch() {
        let err = analyze_source("out = pow(2)").unwrap_err();
        assert!(err.message.contains("expects 2 arguments"));
    }

    #[test]
    fn test_tuple_assignment_types() {
        let analysis = analyze_source("(l, r) = (0.5, inp)").unwrap();
        // l, r, inp are all implicit audio controls.
        assert_eq!(analysis.controls.len(), 3);
        assert!(analysis.controls.iter().any(|c| c.name == "l" && c.written));
        assert!(analysis.controls.iter().any(|c| c.name == "inp" && c.read));
    }

    #[test]
    fn test_tuple_arity_mismatch() {
        let err = analyze_source("(l, r) = (1, 2, 3)").unwrap_err();
        assert!(err.message.contains("elements"));
    }

    #[test]
    fn test_const_tuple_type() {
        let analysis = analyze_source("const pan2 = (0.3, 0.7)").unwrap();
        assert_eq!(
            analysis.consts["pan2"].var_type(),
            VarType::Tuple(vec![VarType::Num, VarType::Num])
        );
    }
}
