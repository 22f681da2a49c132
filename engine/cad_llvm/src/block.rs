//! Block compilation: one script becomes one native module.
//!
//! The module exposes a fixed instantiation contract:
//!
//! - `%block.<id>.ctx` - context struct: control storages in declaration
//!   order, then persistent locals in first-assignment order
//! - `block_<id>_init(ptr)` - zero the context, run `pure` statements
//! - `block_<id>_generate(ptr)` - advance one sample
//! - `block_<id>_control_<n>(ptr) -> ptr` - per-control storage accessor
//!
//! All generated functions carry fast-math attributes; every module goes
//! through this single code path, so the relaxation is consistent across
//! the whole compiled graph. A failed compile returns an error without
//! anything ever touching the JIT.
//!
//! Generated code is straight-line (one basic block per function); the
//! language has no control flow, so even form-dependent casts lower to
//! selects.

use inkwell::attributes::AttributeLoc;
use inkwell::context::Context;
use inkwell::module::Module;
use inkwell::types::StructType;
use inkwell::values::{FloatValue, FunctionValue, IntValue, PointerValue};
use inkwell::{AddressSpace, FloatPredicate, IntPredicate};
use cad_ir::{
    BinaryOp, ConstantValue, ControlRef, Error, ExprKind, Expression, FormTag, LValue, Qualifier,
    Statement, UnaryOp, VarType,
};
use cad_lexer::TokenStream;

use crate::intrinsics::{self, TIMING_FIELD_BPM, TIMING_FIELD_SAMPLE_RATE};
use crate::layout;
use crate::sema::{self, Analysis};

/// The compiled artifact for one script.
///
/// Owns its native module until the module is handed to the JIT at
/// deploy time. Move-only; there is exactly one owner of the module.
pub struct Block<'ctx> {
    id: u64,
    name: String,
    module: Option<Module<'ctx>>,
    context_type: StructType<'ctx>,
    controls: Vec<ControlRef>,
}

impl<'ctx> Block<'ctx> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Controls in context-struct field order.
    pub fn controls(&self) -> &[ControlRef] {
        &self.controls
    }

    /// The context struct layout for this block.
    pub fn context_type(&self) -> StructType<'ctx> {
        self.context_type
    }

    /// Take the module for deployment. Returns `None` if already taken.
    pub fn take_module(&mut self) -> Option<Module<'ctx>> {
        self.module.take()
    }

    /// Whether the module is still owned by this block.
    pub fn has_module(&self) -> bool {
        self.module.is_some()
    }
}

/// Symbol name of a block's init function.
pub fn init_symbol(id: u64) -> String {
    format!("block_{id}_init")
}

/// Symbol name of a block's per-sample generate function.
pub fn generate_symbol(id: u64) -> String {
    format!("block_{id}_generate")
}

/// Symbol name of a block's control accessor.
pub fn control_symbol(id: u64, index: usize) -> String {
    format!("block_{id}_control_{index}")
}

/// Name of a block's context struct type.
pub fn context_type_name(id: u64) -> String {
    format!("block.{id}.ctx")
}

/// Fast-math relaxations: no NaN/Inf/signed-zero guarantees. Applied to
/// every generated entry point so the relaxation is uniform across the
/// graph's inlined optimization pipeline.
pub(crate) fn apply_fast_math<'ctx>(context: &'ctx Context, function: FunctionValue<'ctx>) {
    for key in [
        "unsafe-fp-math",
        "no-nans-fp-math",
        "no-infs-fp-math",
        "no-signed-zeros-fp-math",
    ] {
        let attr = context.create_string_attribute(key, "true");
        function.add_attribute(AttributeLoc::Function, attr);
    }
}

/// Compile a script into a native module.
///
/// Type-checks and lowers the script; on failure returns a descriptive
/// error referencing the offending source range. The JIT is never
/// touched here, so a failed compile cannot leave a partially valid
/// module registered.
pub fn compile<'ctx>(
    context: &'ctx Context,
    id: u64,
    name: &str,
    code: &str,
) -> Result<Block<'ctx>, Error> {
    let _span = tracing::debug_span!("compile_block", id, name).entered();

    let mut stream = TokenStream::new(code);
    let ast = cad_parse::parse(&mut stream).map_err(Error::Parse)?;
    let analysis = sema::analyze(&ast).map_err(Error::Compile)?;

    let module = context.create_module(&format!("block.{id}"));
    let codegen = BlockCodegen::new(context, &module, id, &analysis);
    codegen.run(&ast);

    tracing::debug!(
        id,
        controls = analysis.controls.len(),
        "block compiled"
    );

    Ok(Block {
        id,
        name: name.to_owned(),
        context_type: codegen.ctx_type,
        module: Some(module),
        controls: analysis.controls,
    })
}

/// A value during expression lowering.
///
/// `num` values stay in scalar registers; aggregates are handled by
/// address.
#[derive(Clone)]
enum GenValue<'ctx> {
    Num {
        left: FloatValue<'ctx>,
        right: FloatValue<'ctx>,
        form: IntValue<'ctx>,
    },
    Ptr {
        ptr: PointerValue<'ctx>,
        ty: VarType,
    },
    Tuple(Vec<GenValue<'ctx>>),
}

struct BlockCodegen<'a, 'ctx> {
    context: &'ctx Context,
    module: &'a Module<'ctx>,
    builder: inkwell::builder::Builder<'ctx>,
    analysis: &'a Analysis,
    id: u64,
    ctx_type: StructType<'ctx>,
    /// Storage struct type per control, parallel to `analysis.controls`.
    storages: Vec<StructType<'ctx>>,
}

impl<'a, 'ctx> BlockCodegen<'a, 'ctx> {
    fn new(
        context: &'ctx Context,
        module: &'a Module<'ctx>,
        id: u64,
        analysis: &'a Analysis,
    ) -> Self {
        let storages: Vec<StructType<'ctx>> = analysis
            .controls
            .iter()
            .map(|c| layout::control_storage_type(context, c.control_type))
            .collect();

        let mut fields: Vec<inkwell::types::BasicTypeEnum<'ctx>> =
            storages.iter().map(|s| (*s).into()).collect();
        for slot in &analysis.slots {
            fields.push(layout::value_type(context, &slot.ty));
        }

        let ctx_type = context.opaque_struct_type(&context_type_name(id));
        ctx_type.set_body(&fields, false);

        BlockCodegen {
            context,
            module,
            builder: context.create_builder(),
            analysis,
            id,
            ctx_type,
            storages,
        }
    }

    fn run(&self, ast: &cad_ir::Block) {
        self.emit_init(ast);
        self.emit_generate(ast);
        self.emit_accessors();
    }

    // -- function scaffolding --

    fn add_entry(&self, name: &str) -> (FunctionValue<'ctx>, PointerValue<'ctx>) {
        let ptr_ty = self.context.ptr_type(AddressSpace::default());
        let fn_ty = self.context.void_type().fn_type(&[ptr_ty.into()], false);
        let function = self.module.add_function(name, fn_ty, None);
        self.apply_fast_math(function);
        let entry = self.context.append_basic_block(function, "entry");
        self.builder.position_at_end(entry);
        let ctx_ptr = function.get_nth_param(0).unwrap().into_pointer_value();
        (function, ctx_ptr)
    }

    fn apply_fast_math(&self, function: FunctionValue<'ctx>) {
        apply_fast_math(self.context, function);
    }

    fn emit_init(&self, ast: &cad_ir::Block) {
        let (_, ctx_ptr) = self.add_entry(&init_symbol(self.id));

        if let Some(size) = self.ctx_type.size_of() {
            let zero = self.context.i8_type().const_zero();
            self.builder.build_memset(ctx_ptr, 8, zero, size).unwrap();
        }

        for statement in &ast.statements {
            if statement.qualifier == Qualifier::Pure {
                self.emit_statement(statement, ctx_ptr);
            }
        }
        self.builder.build_return(None).unwrap();
    }

    fn emit_generate(&self, ast: &cad_ir::Block) {
        let (_, ctx_ptr) = self.add_entry(&generate_symbol(self.id));

        for statement in &ast.statements {
            if statement.qualifier == Qualifier::None {
                self.emit_statement(statement, ctx_ptr);
            }
        }
        self.builder.build_return(None).unwrap();
    }

    fn emit_accessors(&self) {
        let ptr_ty = self.context.ptr_type(AddressSpace::default());
        for index in 0..self.analysis.controls.len() {
            let fn_ty = ptr_ty.fn_type(&[ptr_ty.into()], false);
            let function =
                self.module
                    .add_function(&control_symbol(self.id, index), fn_ty, None);
            let entry = self.context.append_basic_block(function, "entry");
            self.builder.position_at_end(entry);
            let ctx_ptr = function.get_nth_param(0).unwrap().into_pointer_value();
            let storage = self
                .builder
                .build_struct_gep(self.ctx_type, ctx_ptr, index as u32, "control")
                .unwrap();
            self.builder.build_return(Some(&storage)).unwrap();
        }
    }

    fn emit_statement(&self, statement: &Statement, ctx_ptr: PointerValue<'ctx>) {
        self.emit_expr(&statement.expr, ctx_ptr);
    }

    // -- addressing helpers --

    /// Pointer to control `index`'s value section.
    fn control_value_ptr(&self, ctx_ptr: PointerValue<'ctx>, index: usize) -> PointerValue<'ctx> {
        let storage = self
            .builder
            .build_struct_gep(self.ctx_type, ctx_ptr, index as u32, "storage")
            .unwrap();
        self.builder
            .build_struct_gep(
                self.storages[index],
                storage,
                layout::CONTROL_FIELD_VALUE,
                "value",
            )
            .unwrap()
    }

    /// Pointer to persistent local slot `slot`.
    fn slot_ptr(&self, ctx_ptr: PointerValue<'ctx>, slot: usize) -> PointerValue<'ctx> {
        let field = (self.analysis.controls.len() + slot) as u32;
        self.builder
            .build_struct_gep(self.ctx_type, ctx_ptr, field, "slot")
            .unwrap()
    }

    // -- value plumbing --

    fn f64_t(&self) -> inkwell::types::FloatType<'ctx> {
        self.context.f64_type()
    }

    fn const_num(&self, left: f64, right: f64, form: FormTag) -> GenValue<'ctx> {
        GenValue::Num {
            left: self.f64_t().const_float(left),
            right: self.f64_t().const_float(right),
            form: self.context.i8_type().const_int(u64::from(form as u8), false),
        }
    }

    fn const_value(&self, constant: &ConstantValue) -> GenValue<'ctx> {
        match constant {
            ConstantValue::Num { left, right, form } => self.const_num(*left, *right, *form),
            ConstantValue::Tuple(items) => {
                GenValue::Tuple(items.iter().map(|c| self.const_value(c)).collect())
            }
        }
    }

    /// Load a value of the given type from a pointer to its layout.
    fn load_value(&self, ptr: PointerValue<'ctx>, ty: &VarType) -> GenValue<'ctx> {
        match ty {
            VarType::Num => {
                let num_ty = layout::num_type(self.context);
                let left_ptr = self
                    .builder
                    .build_struct_gep(num_ty, ptr, 0, "left.ptr")
                    .unwrap();
                let right_ptr = self
                    .builder
                    .build_struct_gep(num_ty, ptr, 1, "right.ptr")
                    .unwrap();
                let form_ptr = self
                    .builder
                    .build_struct_gep(num_ty, ptr, 2, "form.ptr")
                    .unwrap();
                GenValue::Num {
                    left: self
                        .builder
                        .build_load(self.f64_t(), left_ptr, "left")
                        .unwrap()
                        .into_float_value(),
                    right: self
                        .builder
                        .build_load(self.f64_t(), right_ptr, "right")
                        .unwrap()
                        .into_float_value(),
                    form: self
                        .builder
                        .build_load(self.context.i8_type(), form_ptr, "form")
                        .unwrap()
                        .into_int_value(),
                }
            }
            _ => GenValue::Ptr {
                ptr,
                ty: ty.clone(),
            },
        }
    }

    /// Store a value into a pointer to the given layout.
    fn store_value(&self, dest: PointerValue<'ctx>, ty: &VarType, value: &GenValue<'ctx>) {
        match (ty, value) {
            (VarType::Num, GenValue::Num { left, right, form }) => {
                let num_ty = layout::num_type(self.context);
                let left_ptr = self
                    .builder
                    .build_struct_gep(num_ty, dest, 0, "left.ptr")
                    .unwrap();
                let right_ptr = self
                    .builder
                    .build_struct_gep(num_ty, dest, 1, "right.ptr")
                    .unwrap();
                let form_ptr = self
                    .builder
                    .build_struct_gep(num_ty, dest, 2, "form.ptr")
                    .unwrap();
                self.builder.build_store(left_ptr, *left).unwrap();
                self.builder.build_store(right_ptr, *right).unwrap();
                self.builder.build_store(form_ptr, *form).unwrap();
            }
            (_, GenValue::Ptr { ptr, ty: src_ty }) => {
                debug_assert_eq!(ty, src_ty, "layout mismatch in aggregate copy");
                let layout_ty = layout::value_type(self.context, ty);
                let loaded = self.builder.build_load(layout_ty, *ptr, "copy").unwrap();
                self.builder.build_store(dest, loaded).unwrap();
            }
            (VarType::Tuple(item_types), GenValue::Tuple(items)) => {
                let tuple_ty = layout::value_type(self.context, ty).into_struct_type();
                for (index, (item_ty, item)) in item_types.iter().zip(items).enumerate() {
                    let field = self
                        .builder
                        .build_struct_gep(tuple_ty, dest, index as u32, "field")
                        .unwrap();
                    self.store_value(field, item_ty, item);
                }
            }
            _ => unreachable!("store of mismatched value shape survived analysis"),
        }
    }

    /// Coerce a value to its scalar `num` parts.
    fn to_num(&self, value: &GenValue<'ctx>) -> (FloatValue<'ctx>, FloatValue<'ctx>, IntValue<'ctx>) {
        match value {
            GenValue::Num { left, right, form } => (*left, *right, *form),
            GenValue::Ptr { ptr, ty } => {
                debug_assert_eq!(*ty, VarType::Num);
                let GenValue::Num { left, right, form } = self.load_value(*ptr, &VarType::Num)
                else {
                    unreachable!()
                };
                (left, right, form)
            }
            GenValue::Tuple(_) => unreachable!("tuple used as num survived analysis"),
        }
    }

    // -- expressions --

    fn emit_expr(&self, expr: &Expression, ctx_ptr: PointerValue<'ctx>) -> GenValue<'ctx> {
        match &expr.kind {
            ExprKind::Number(value) => self.const_num(*value, *value, FormTag::None),
            ExprKind::Note(note) => {
                self.const_num(f64::from(*note), f64::from(*note), FormTag::Note)
            }
            ExprKind::Variable(name) => self.emit_name(name, ctx_ptr),
            ExprKind::Control { name, .. } => self.emit_name(name, ctx_ptr),
            ExprKind::Unary { op, operand } => {
                let operand = self.emit_expr(operand, ctx_ptr);
                self.emit_unary(*op, &operand)
            }
            ExprKind::Binary { op, left, right } => {
                let left = self.emit_expr(left, ctx_ptr);
                let right = self.emit_expr(right, ctx_ptr);
                self.emit_binary(*op, &left, &right)
            }
            ExprKind::Assign { target, op, value } => {
                let value = self.emit_expr(value, ctx_ptr);
                self.emit_assign(target, *op, value, ctx_ptr)
            }
            ExprKind::Call { name, args } => self.emit_call(name, args, ctx_ptr),
            ExprKind::Cast { target, operand } => {
                let operand = self.emit_expr(operand, ctx_ptr);
                self.emit_cast(*target, &operand)
            }
            ExprKind::Tuple(items) => GenValue::Tuple(
                items
                    .iter()
                    .map(|item| self.emit_expr(item, ctx_ptr))
                    .collect(),
            ),
            ExprKind::Array(items) => self.emit_array(items, ctx_ptr),
        }
    }

    fn emit_name(&self, name: &str, ctx_ptr: PointerValue<'ctx>) -> GenValue<'ctx> {
        if let Some(constant) = self.analysis.consts.get(name) {
            return self.const_value(constant);
        }
        if let Some(slot) = self.analysis.slot_of(name) {
            let ty = self.analysis.slots[slot].ty.clone();
            let ptr = self.slot_ptr(ctx_ptr, slot);
            return self.load_value(ptr, &ty);
        }
        let index = self
            .analysis
            .control_of(name)
            .unwrap_or_else(|| unreachable!("unresolved name `{name}` survived analysis"));
        let ty = self.analysis.controls[index].control_type.var_type();
        let ptr = self.control_value_ptr(ctx_ptr, index);
        self.load_value(ptr, &ty)
    }

    fn emit_unary(&self, op: UnaryOp, operand: &GenValue<'ctx>) -> GenValue<'ctx> {
        let (left, right, form) = self.to_num(operand);
        match op {
            UnaryOp::Neg => GenValue::Num {
                left: self.builder.build_float_neg(left, "neg.l").unwrap(),
                right: self.builder.build_float_neg(right, "neg.r").unwrap(),
                form,
            },
            UnaryOp::Not => {
                let not = |x: FloatValue<'ctx>, tag: &str| {
                    let zero = self.f64_t().const_zero();
                    let is_zero = self
                        .builder
                        .build_float_compare(FloatPredicate::OEQ, x, zero, tag)
                        .unwrap();
                    self.builder
                        .build_unsigned_int_to_float(is_zero, self.f64_t(), tag)
                        .unwrap()
                };
                GenValue::Num {
                    left: not(left, "not.l"),
                    right: not(right, "not.r"),
                    form: self.form_const(FormTag::None),
                }
            }
        }
    }

    fn form_const(&self, form: FormTag) -> IntValue<'ctx> {
        self.context.i8_type().const_int(u64::from(form as u8), false)
    }

    fn emit_binary(
        &self,
        op: BinaryOp,
        left: &GenValue<'ctx>,
        right: &GenValue<'ctx>,
    ) -> GenValue<'ctx> {
        let (ll, lr, lform) = self.to_num(left);
        let (rl, rr, _) = self.to_num(right);

        let arith = |l: FloatValue<'ctx>, r: FloatValue<'ctx>, tag: &str| -> FloatValue<'ctx> {
            match op {
                BinaryOp::Add => self.builder.build_float_add(l, r, tag).unwrap(),
                BinaryOp::Sub => self.builder.build_float_sub(l, r, tag).unwrap(),
                BinaryOp::Mul => self.builder.build_float_mul(l, r, tag).unwrap(),
                BinaryOp::Div => self.builder.build_float_div(l, r, tag).unwrap(),
                BinaryOp::Mod => self.builder.build_float_rem(l, r, tag).unwrap(),
                BinaryOp::Power => {
                    let pow = intrinsics::declare(self.module, "cad_pow", 2);
                    self.call_f64(pow, &[l, r], tag)
                }
                BinaryOp::BitAnd | BinaryOp::BitOr => {
                    let i32_ty = self.context.i32_type();
                    let li = self
                        .builder
                        .build_float_to_signed_int(l, i32_ty, "bit.l")
                        .unwrap();
                    let ri = self
                        .builder
                        .build_float_to_signed_int(r, i32_ty, "bit.r")
                        .unwrap();
                    let bits = if op == BinaryOp::BitAnd {
                        self.builder.build_and(li, ri, tag).unwrap()
                    } else {
                        self.builder.build_or(li, ri, tag).unwrap()
                    };
                    self.builder
                        .build_signed_int_to_float(bits, self.f64_t(), tag)
                        .unwrap()
                }
                BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq => {
                    let pred = match op {
                        BinaryOp::Eq => FloatPredicate::OEQ,
                        BinaryOp::NotEq => FloatPredicate::ONE,
                        BinaryOp::Lt => FloatPredicate::OLT,
                        BinaryOp::LtEq => FloatPredicate::OLE,
                        BinaryOp::Gt => FloatPredicate::OGT,
                        _ => FloatPredicate::OGE,
                    };
                    let cmp = self.builder.build_float_compare(pred, l, r, tag).unwrap();
                    self.builder
                        .build_unsigned_int_to_float(cmp, self.f64_t(), tag)
                        .unwrap()
                }
                BinaryOp::LogicalAnd | BinaryOp::LogicalOr => {
                    let zero = self.f64_t().const_zero();
                    let lb = self
                        .builder
                        .build_float_compare(FloatPredicate::ONE, l, zero, "bool.l")
                        .unwrap();
                    let rb = self
                        .builder
                        .build_float_compare(FloatPredicate::ONE, r, zero, "bool.r")
                        .unwrap();
                    let bits = if op == BinaryOp::LogicalAnd {
                        self.builder.build_and(lb, rb, tag).unwrap()
                    } else {
                        self.builder.build_or(lb, rb, tag).unwrap()
                    };
                    self.builder
                        .build_unsigned_int_to_float(bits, self.f64_t(), tag)
                        .unwrap()
                }
            }
        };

        let keeps_form = matches!(
            op,
            BinaryOp::Add
                | BinaryOp::Sub
                | BinaryOp::Mul
                | BinaryOp::Div
                | BinaryOp::Mod
                | BinaryOp::Power
        );
        GenValue::Num {
            left: arith(ll, rl, "bin.l"),
            right: arith(lr, rr, "bin.r"),
            form: if keeps_form {
                lform
            } else {
                self.form_const(FormTag::None)
            },
        }
    }

    fn call_f64(
        &self,
        function: FunctionValue<'ctx>,
        args: &[FloatValue<'ctx>],
        tag: &str,
    ) -> FloatValue<'ctx> {
        let args: Vec<inkwell::values::BasicMetadataValueEnum<'ctx>> =
            args.iter().map(|a| (*a).into()).collect();
        self.builder
            .build_call(function, &args, tag)
            .unwrap()
            .try_as_basic_value()
            .left()
            .unwrap()
            .into_float_value()
    }

    fn emit_call(
        &self,
        name: &str,
        args: &[Expression],
        ctx_ptr: PointerValue<'ctx>,
    ) -> GenValue<'ctx> {
        if name == "bpm" {
            let value = self.load_timing(TIMING_FIELD_BPM, "bpm");
            return GenValue::Num {
                left: value,
                right: value,
                form: self.form_const(FormTag::Beats),
            };
        }
        if name == "sampleRate" {
            let value = self.load_timing(TIMING_FIELD_SAMPLE_RATE, "sampleRate");
            return GenValue::Num {
                left: value,
                right: value,
                form: self.form_const(FormTag::None),
            };
        }

        let (symbol, arity) = intrinsics::lookup(name)
            .unwrap_or_else(|| unreachable!("unknown call `{name}` survived analysis"));
        let function = intrinsics::declare(self.module, symbol, arity);

        let values: Vec<GenValue<'ctx>> = args
            .iter()
            .map(|arg| self.emit_expr(arg, ctx_ptr))
            .collect();
        let parts: Vec<_> = values.iter().map(|v| self.to_num(v)).collect();

        if arity == 0 {
            // Nullary intrinsics (rand) produce one value for both
            // channels.
            let value = self.call_f64(function, &[], "call");
            return GenValue::Num {
                left: value,
                right: value,
                form: self.form_const(FormTag::None),
            };
        }

        let lefts: Vec<FloatValue<'ctx>> = parts.iter().map(|p| p.0).collect();
        let rights: Vec<FloatValue<'ctx>> = parts.iter().map(|p| p.1).collect();
        GenValue::Num {
            left: self.call_f64(function, &lefts, "call.l"),
            right: self.call_f64(function, &rights, "call.r"),
            form: parts[0].2,
        }
    }

    fn load_timing(&self, field: u32, tag: &str) -> FloatValue<'ctx> {
        let global = intrinsics::declare_timing(self.context, self.module);
        let f64_ty = self.f64_t();
        let timing_ty = self
            .context
            .struct_type(&[f64_ty.into(), f64_ty.into()], false);
        let ptr = self
            .builder
            .build_struct_gep(timing_ty, global.as_pointer_value(), field, tag)
            .unwrap();
        self.builder
            .build_load(f64_ty, ptr, tag)
            .unwrap()
            .into_float_value()
    }

    /// Form casts: value conversion where one is defined for the source
    /// form, otherwise a retag. The source form is a runtime byte, so
    /// defined conversions lower to selects on it.
    fn emit_cast(&self, target: FormTag, operand: &GenValue<'ctx>) -> GenValue<'ctx> {
        let (left, right, form) = self.to_num(operand);

        let convert = |x: FloatValue<'ctx>, tag: &str| -> FloatValue<'ctx> {
            match target {
                FormTag::Freq => {
                    // note -> freq: 440 * 2^((n - 69) / 12)
                    let n69 = self
                        .builder
                        .build_float_sub(x, self.f64_t().const_float(69.0), "cast.n69")
                        .unwrap();
                    let exp = self
                        .builder
                        .build_float_div(n69, self.f64_t().const_float(12.0), "cast.exp")
                        .unwrap();
                    let pow = intrinsics::declare(self.module, "cad_pow", 2);
                    let two_exp = self.call_f64(pow, &[self.f64_t().const_float(2.0), exp], tag);
                    let freq = self
                        .builder
                        .build_float_mul(two_exp, self.f64_t().const_float(440.0), tag)
                        .unwrap();
                    self.select_on_form(form, FormTag::Note, freq, x, tag)
                }
                FormTag::Secs => {
                    // beats -> secs via bpm, samples -> secs via rate
                    let bpm = self.load_timing(TIMING_FIELD_BPM, "cast.bpm");
                    let per_beat = self
                        .builder
                        .build_float_div(self.f64_t().const_float(60.0), bpm, "cast.spb")
                        .unwrap();
                    let from_beats = self
                        .builder
                        .build_float_mul(x, per_beat, "cast.beats")
                        .unwrap();
                    let rate = self.load_timing(TIMING_FIELD_SAMPLE_RATE, "cast.rate");
                    let from_samples = self
                        .builder
                        .build_float_div(x, rate, "cast.samples")
                        .unwrap();
                    let value = self.select_on_form(form, FormTag::Beats, from_beats, x, tag);
                    self.select_on_form(form, FormTag::Samples, from_samples, value, tag)
                }
                FormTag::Beats => {
                    let bpm = self.load_timing(TIMING_FIELD_BPM, "cast.bpm");
                    let beats_per_sec = self
                        .builder
                        .build_float_div(bpm, self.f64_t().const_float(60.0), "cast.bps")
                        .unwrap();
                    let from_secs = self
                        .builder
                        .build_float_mul(x, beats_per_sec, "cast.secs")
                        .unwrap();
                    self.select_on_form(form, FormTag::Secs, from_secs, x, tag)
                }
                FormTag::Samples => {
                    let rate = self.load_timing(TIMING_FIELD_SAMPLE_RATE, "cast.rate");
                    let from_secs = self
                        .builder
                        .build_float_mul(x, rate, "cast.secs")
                        .unwrap();
                    self.select_on_form(form, FormTag::Secs, from_secs, x, tag)
                }
                // No defined conversion: retag only.
                _ => x,
            }
        };

        GenValue::Num {
            left: convert(left, "cast.l"),
            right: convert(right, "cast.r"),
            form: self.form_const(target),
        }
    }

    /// `form == tag ? converted : fallback`
    fn select_on_form(
        &self,
        form: IntValue<'ctx>,
        tag: FormTag,
        converted: FloatValue<'ctx>,
        fallback: FloatValue<'ctx>,
        name: &str,
    ) -> FloatValue<'ctx> {
        let matches = self
            .builder
            .build_int_compare(IntPredicate::EQ, form, self.form_const(tag), "form.eq")
            .unwrap();
        self.builder
            .build_select(matches, converted, fallback, name)
            .unwrap()
            .into_float_value()
    }

    fn emit_array(&self, items: &[Expression], ctx_ptr: PointerValue<'ctx>) -> GenValue<'ctx> {
        let values: Vec<GenValue<'ctx>> = items
            .iter()
            .map(|item| self.emit_expr(item, ctx_ptr))
            .collect();
        // Element type was unified during analysis; take it from the
        // first element's shape.
        let elem_ty = self.shape_of(&values[0]);
        let array_ty = VarType::Array(Box::new(elem_ty.clone()), items.len());
        let layout_ty = layout::value_type(self.context, &array_ty);
        let slot = self.builder.build_alloca(layout_ty, "array").unwrap();
        let i32_ty = self.context.i32_type();
        for (index, value) in values.iter().enumerate() {
            let indices = [i32_ty.const_zero(), i32_ty.const_int(index as u64, false)];
            // SAFETY: indices stay inside the freshly allocated array.
            let elem_ptr = unsafe {
                self.builder
                    .build_in_bounds_gep(layout_ty.into_array_type(), slot, &indices, "elem")
            }
            .unwrap();
            self.store_value(elem_ptr, &elem_ty, value);
        }
        GenValue::Ptr {
            ptr: slot,
            ty: array_ty,
        }
    }

    fn shape_of(&self, value: &GenValue<'ctx>) -> VarType {
        match value {
            GenValue::Num { .. } => VarType::Num,
            GenValue::Ptr { ty, .. } => ty.clone(),
            GenValue::Tuple(items) => {
                VarType::Tuple(items.iter().map(|item| self.shape_of(item)).collect())
            }
        }
    }

    fn emit_assign(
        &self,
        target: &LValue,
        op: Option<BinaryOp>,
        value: GenValue<'ctx>,
        ctx_ptr: PointerValue<'ctx>,
    ) -> GenValue<'ctx> {
        let value = match op {
            None => value,
            Some(op) => {
                let current = self.read_lvalue(target, ctx_ptr);
                self.emit_binary(op, &current, &value)
            }
        };
        self.write_lvalue(target, &value, ctx_ptr);
        value
    }

    fn read_lvalue(&self, target: &LValue, ctx_ptr: PointerValue<'ctx>) -> GenValue<'ctx> {
        match target {
            LValue::Variable { name, .. } | LValue::Control { name, .. } => {
                self.emit_name(name, ctx_ptr)
            }
            LValue::Tuple { items, .. } => GenValue::Tuple(
                items
                    .iter()
                    .map(|item| self.read_lvalue(item, ctx_ptr))
                    .collect(),
            ),
        }
    }

    fn write_lvalue(&self, target: &LValue, value: &GenValue<'ctx>, ctx_ptr: PointerValue<'ctx>) {
        match target {
            LValue::Variable { name, .. } | LValue::Control { name, .. } => {
                self.write_name(name, value, ctx_ptr);
            }
            LValue::Tuple { items, .. } => match value {
                GenValue::Tuple(values) => {
                    for (item, item_value) in items.iter().zip(values) {
                        self.write_lvalue(item, item_value, ctx_ptr);
                    }
                }
                GenValue::Ptr { ptr, ty } => {
                    let VarType::Tuple(item_types) = ty else {
                        unreachable!("tuple target with non-tuple value survived analysis")
                    };
                    let tuple_ty = layout::value_type(self.context, ty).into_struct_type();
                    for (index, (item, item_ty)) in
                        items.iter().zip(item_types).enumerate()
                    {
                        let field = self
                            .builder
                            .build_struct_gep(tuple_ty, *ptr, index as u32, "field")
                            .unwrap();
                        let loaded = self.load_value(field, item_ty);
                        self.write_lvalue(item, &loaded, ctx_ptr);
                    }
                }
                GenValue::Num { .. } => {
                    unreachable!("tuple target with num value survived analysis")
                }
            },
        }
    }

    fn write_name(&self, name: &str, value: &GenValue<'ctx>, ctx_ptr: PointerValue<'ctx>) {
        if let Some(slot) = self.analysis.slot_of(name) {
            let ty = self.analysis.slots[slot].ty.clone();
            let ptr = self.slot_ptr(ctx_ptr, slot);
            self.store_value(ptr, &ty, value);
            return;
        }
        let index = self
            .analysis
            .control_of(name)
            .unwrap_or_else(|| unreachable!("unresolved target `{name}` survived analysis"));
        let ty = self.analysis.controls[index].control_type.var_type();
        let ptr = self.control_value_ptr(ctx_ptr, index);
        self.store_value(ptr, &ty, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cad_ir::ControlType;
    use inkwell::context::Context;

    #[test]
    fn test_empty_script_compiles_to_zero_controls() {
        let context = Context::create();
        let block = compile(&context, 1, "empty", "").unwrap();
        assert!(block.controls().is_empty());
        assert!(block.has_module());
    }

    #[test]
    fn test_simple_block_exposes_written_control() {
        let context = Context::create();
        let block = compile(&context, 2, "adder", "out = 1 + 2").unwrap();
        assert_eq!(block.controls().len(), 1);
        let control = &block.controls()[0];
        assert_eq!(control.name, "out");
        assert_eq!(control.control_type, ControlType::Audio);
        assert!(control.written);
        assert!(!control.read);
    }

    #[test]
    fn test_module_exposes_contract_symbols() {
        let context = Context::create();
        let mut block = compile(&context, 3, "osc", "out:num = sin(phase) * gain").unwrap();
        let module = block.take_module().unwrap();
        assert!(module.get_function("block_3_init").is_some());
        assert!(module.get_function("block_3_generate").is_some());
        assert!(module.get_function("block_3_control_0").is_some());
        assert!(module.get_function("block_3_control_1").is_some());
        assert!(module.get_function("block_3_control_2").is_some());
        assert!(module.get_function("block_3_control_3").is_none());
        // Calling sin pulls in the intrinsic declaration.
        assert!(module.get_function("cad_sin").is_some());
    }

    #[test]
    fn test_generated_module_verifies() {
        let context = Context::create();
        let source = "pure base = a4 -> freq\n\
                      phase:num += base / sampleRate()\n\
                      out:num = sin(phase * 6.283185307179586) * 0.5\n\
                      mixdown = mix(out, rand(), wet) -> db";
        let mut block = compile(&context, 4, "voice", source).unwrap();
        let module = block.take_module().unwrap();
        if let Err(message) = module.verify() {
            panic!(
                "module failed verification: {}\n{}",
                message,
                module.print_to_string()
            );
        }
    }

    #[test]
    fn test_compile_error_reports_range() {
        let context = Context::create();
        let err = compile(&context, 5, "broken", "out = nosuch(1)").unwrap_err();
        let Error::Compile(e) = err else {
            panic!("expected compile error");
        };
        assert!(e.message.contains("unknown function"));
        assert_eq!(e.range.start.line, 0);
    }

    #[test]
    fn test_parse_error_is_parse_variant() {
        let context = Context::create();
        let err = compile(&context, 6, "broken", "out = ").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_context_struct_field_count() {
        let context = Context::create();
        let block = compile(
            &context,
            7,
            "fields",
            "pure base = 1\nout:num = base + input",
        )
        .unwrap();
        // Two controls plus one persistent local slot.
        assert_eq!(block.context_type().count_fields(), 3);
    }
}
