//! Surface compilation: one graph surface becomes one native module.
//!
//! A surface's context struct embeds a storage field per value group
//! followed by one embedded child context per node. The child's exact
//! field offset is only known here, once the parent is laid out, so the
//! module also emits one trampoline per child
//! (`surface_<id>_child_<n>(ptr) -> ptr`) that computes the child
//! context's address. After deploy the runtime resolves each trampoline
//! once and caches the raw function pointer; the per-sample path never
//! does a symbol lookup.
//!
//! Child init/generate functions are declared external and resolved by
//! the JIT across modules at deploy time.

use inkwell::context::Context;
use inkwell::module::{Linkage, Module};
use inkwell::types::StructType;
use inkwell::values::{FunctionValue, PointerValue};
use inkwell::AddressSpace;

use cad_ir::{ConstantValue, ControlType, VarType};

use crate::block;
use crate::layout;

/// One value group on a surface.
pub struct GroupSpec {
    pub var_type: VarType,
    /// Initial value stored at init time, if the group has one.
    pub default: Option<ConstantValue>,
}

/// One portal of a child surface: which of its groups it exposes.
#[derive(Clone)]
pub struct PortalSpec {
    pub group_index: usize,
    pub var_type: VarType,
}

/// What a node instantiates.
pub enum NodeTarget<'ctx> {
    /// A custom node running a compiled block.
    Block {
        id: u64,
        context_type: StructType<'ctx>,
        control_types: Vec<ControlType>,
    },
    /// A nested group surface.
    Surface {
        id: u64,
        context_type: StructType<'ctx>,
        portals: Vec<PortalSpec>,
    },
}

/// One socket: a wire between a surface group and a child value.
pub struct SocketSpec {
    pub group: usize,
    /// The child writes this value; copy child -> group after generate.
    pub written: bool,
    /// The child reads this value; copy group -> child before generate.
    pub read: bool,
}

/// One node on a surface.
pub struct NodeSpec<'ctx> {
    pub target: NodeTarget<'ctx>,
    /// Socket `i` wires to the child's control/portal `i`.
    pub sockets: Vec<SocketSpec>,
}

/// A fully described surface, validated upstream.
pub struct SurfaceSpec<'ctx> {
    pub id: u64,
    pub groups: Vec<GroupSpec>,
    pub nodes: Vec<NodeSpec<'ctx>>,
}

/// The compiled artifact for one surface.
pub struct CompiledSurface<'ctx> {
    id: u64,
    module: Option<Module<'ctx>>,
    context_type: StructType<'ctx>,
}

impl<'ctx> CompiledSurface<'ctx> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn context_type(&self) -> StructType<'ctx> {
        self.context_type
    }

    /// Take the module for deployment. Returns `None` if already taken.
    pub fn take_module(&mut self) -> Option<Module<'ctx>> {
        self.module.take()
    }
}

/// Symbol name of a surface's init function.
pub fn init_symbol(id: u64) -> String {
    format!("surface_{id}_init")
}

/// Symbol name of a surface's per-sample generate function.
pub fn generate_symbol(id: u64) -> String {
    format!("surface_{id}_generate")
}

/// Symbol name of the trampoline returning child `n`'s context address.
pub fn child_symbol(id: u64, node: usize) -> String {
    format!("surface_{id}_child_{node}")
}

/// Name of a surface's context struct type.
pub fn context_type_name(id: u64) -> String {
    format!("surface.{id}.ctx")
}

/// Compile a surface description into a native module.
///
/// The description has already been validated structurally;
/// inconsistencies here are compile-unit bookkeeping bugs and panic.
pub fn compile_surface<'ctx>(
    context: &'ctx Context,
    spec: &SurfaceSpec<'ctx>,
) -> CompiledSurface<'ctx> {
    let _span = tracing::debug_span!("compile_surface", id = spec.id).entered();

    let module = context.create_module(&format!("surface.{}", spec.id));
    let codegen = SurfaceCodegen::new(context, &module, spec);
    codegen.run();

    tracing::debug!(
        id = spec.id,
        groups = spec.groups.len(),
        nodes = spec.nodes.len(),
        "surface compiled"
    );

    CompiledSurface {
        id: spec.id,
        context_type: codegen.ctx_type,
        module: Some(module),
    }
}

struct SurfaceCodegen<'a, 'ctx> {
    context: &'ctx Context,
    module: &'a Module<'ctx>,
    builder: inkwell::builder::Builder<'ctx>,
    spec: &'a SurfaceSpec<'ctx>,
    ctx_type: StructType<'ctx>,
}

impl<'a, 'ctx> SurfaceCodegen<'a, 'ctx> {
    fn new(context: &'ctx Context, module: &'a Module<'ctx>, spec: &'a SurfaceSpec<'ctx>) -> Self {
        let mut fields: Vec<inkwell::types::BasicTypeEnum<'ctx>> = spec
            .groups
            .iter()
            .map(|group| layout::value_type(context, &group.var_type))
            .collect();
        for node in &spec.nodes {
            fields.push(node_context_type(node).into());
        }

        let ctx_type = context.opaque_struct_type(&context_type_name(spec.id));
        ctx_type.set_body(&fields, false);

        SurfaceCodegen {
            context,
            module,
            builder: context.create_builder(),
            spec,
            ctx_type,
        }
    }

    fn run(&self) {
        self.emit_init();
        self.emit_generate();
        self.emit_trampolines();
    }

    fn add_entry(&self, name: &str) -> PointerValue<'ctx> {
        let ptr_ty = self.context.ptr_type(AddressSpace::default());
        let fn_ty = self.context.void_type().fn_type(&[ptr_ty.into()], false);
        let function = self.module.add_function(name, fn_ty, None);
        block::apply_fast_math(self.context, function);
        let entry = self.context.append_basic_block(function, "entry");
        self.builder.position_at_end(entry);
        function.get_nth_param(0).unwrap().into_pointer_value()
    }

    /// Declare a child entry point (`void(ptr)`), external linkage.
    fn declare_child_fn(&self, name: &str) -> FunctionValue<'ctx> {
        if let Some(existing) = self.module.get_function(name) {
            return existing;
        }
        let ptr_ty = self.context.ptr_type(AddressSpace::default());
        let fn_ty = self.context.void_type().fn_type(&[ptr_ty.into()], false);
        self.module
            .add_function(name, fn_ty, Some(Linkage::External))
    }

    fn group_ptr(&self, ctx_ptr: PointerValue<'ctx>, group: usize) -> PointerValue<'ctx> {
        self.builder
            .build_struct_gep(self.ctx_type, ctx_ptr, group as u32, "group")
            .unwrap()
    }

    fn child_ptr(&self, ctx_ptr: PointerValue<'ctx>, node: usize) -> PointerValue<'ctx> {
        let field = (self.spec.groups.len() + node) as u32;
        self.builder
            .build_struct_gep(self.ctx_type, ctx_ptr, field, "child")
            .unwrap()
    }

    fn emit_init(&self) {
        let ctx_ptr = self.add_entry(&init_symbol(self.spec.id));

        if let Some(size) = self.ctx_type.size_of() {
            let zero = self.context.i8_type().const_zero();
            self.builder.build_memset(ctx_ptr, 8, zero, size).unwrap();
        }

        for (index, group) in self.spec.groups.iter().enumerate() {
            if let Some(default) = &group.default {
                let dest = self.group_ptr(ctx_ptr, index);
                self.store_constant(dest, default);
            }
        }

        for (index, node) in self.spec.nodes.iter().enumerate() {
            let init = self.declare_child_fn(&node_init_symbol(node));
            let child = self.child_ptr(ctx_ptr, index);
            self.builder
                .build_call(init, &[child.into()], "init")
                .unwrap();
        }

        self.builder.build_return(None).unwrap();
    }

    fn emit_generate(&self) {
        let ctx_ptr = self.add_entry(&generate_symbol(self.spec.id));

        for (index, node) in self.spec.nodes.iter().enumerate() {
            let child = self.child_ptr(ctx_ptr, index);

            for (socket_index, socket) in node.sockets.iter().enumerate() {
                if socket.read {
                    let src = self.group_ptr(ctx_ptr, socket.group);
                    let dest = self.socket_value_ptr(node, child, socket_index);
                    self.copy_value(src, dest, &self.spec.groups[socket.group].var_type);
                }
            }

            let generate = self.declare_child_fn(&node_generate_symbol(node));
            self.builder
                .build_call(generate, &[child.into()], "generate")
                .unwrap();

            for (socket_index, socket) in node.sockets.iter().enumerate() {
                if socket.written {
                    let src = self.socket_value_ptr(node, child, socket_index);
                    let dest = self.group_ptr(ctx_ptr, socket.group);
                    self.copy_value(src, dest, &self.spec.groups[socket.group].var_type);
                }
            }
        }

        self.builder.build_return(None).unwrap();
    }

    /// Address of the child-side value a socket wires to.
    ///
    /// For a block child that is the value section of control `i`'s
    /// storage; for a surface child it is the portal's group storage.
    fn socket_value_ptr(
        &self,
        node: &NodeSpec<'ctx>,
        child: PointerValue<'ctx>,
        socket_index: usize,
    ) -> PointerValue<'ctx> {
        match &node.target {
            NodeTarget::Block {
                context_type,
                control_types,
                ..
            } => {
                let storage_ty =
                    layout::control_storage_type(self.context, control_types[socket_index]);
                let storage = self
                    .builder
                    .build_struct_gep(*context_type, child, socket_index as u32, "storage")
                    .unwrap();
                self.builder
                    .build_struct_gep(
                        storage_ty,
                        storage,
                        layout::CONTROL_FIELD_VALUE,
                        "value",
                    )
                    .unwrap()
            }
            NodeTarget::Surface {
                context_type,
                portals,
                ..
            } => {
                let portal = &portals[socket_index];
                self.builder
                    .build_struct_gep(
                        *context_type,
                        child,
                        portal.group_index as u32,
                        "portal",
                    )
                    .unwrap()
            }
        }
    }

    /// Copy one value layout between two addresses.
    fn copy_value(&self, src: PointerValue<'ctx>, dest: PointerValue<'ctx>, ty: &VarType) {
        let layout_ty = layout::value_type(self.context, ty);
        let loaded = self.builder.build_load(layout_ty, src, "copy").unwrap();
        self.builder.build_store(dest, loaded).unwrap();
    }

    fn store_constant(&self, dest: PointerValue<'ctx>, constant: &ConstantValue) {
        match constant {
            ConstantValue::Num { left, right, form } => {
                let num_ty = layout::num_type(self.context);
                let f64_ty = self.context.f64_type();
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
                self.builder
                    .build_store(left_ptr, f64_ty.const_float(*left))
                    .unwrap();
                self.builder
                    .build_store(right_ptr, f64_ty.const_float(*right))
                    .unwrap();
                self.builder
                    .build_store(
                        form_ptr,
                        self.context
                            .i8_type()
                            .const_int(u64::from(*form as u8), false),
                    )
                    .unwrap();
            }
            ConstantValue::Tuple(items) => {
                let tuple_ty =
                    layout::value_type(self.context, &constant.var_type()).into_struct_type();
                for (index, item) in items.iter().enumerate() {
                    let field = self
                        .builder
                        .build_struct_gep(tuple_ty, dest, index as u32, "field")
                        .unwrap();
                    self.store_constant(field, item);
                }
            }
        }
    }

    fn emit_trampolines(&self) {
        let ptr_ty = self.context.ptr_type(AddressSpace::default());
        for index in 0..self.spec.nodes.len() {
            let fn_ty = ptr_ty.fn_type(&[ptr_ty.into()], false);
            let function =
                self.module
                    .add_function(&child_symbol(self.spec.id, index), fn_ty, None);
            let entry = self.context.append_basic_block(function, "entry");
            self.builder.position_at_end(entry);
            let ctx_ptr = function.get_nth_param(0).unwrap().into_pointer_value();
            let child = self.child_ptr(ctx_ptr, index);
            self.builder.build_return(Some(&child)).unwrap();
        }
    }
}

fn node_context_type<'ctx>(node: &NodeSpec<'ctx>) -> StructType<'ctx> {
    match &node.target {
        NodeTarget::Block { context_type, .. } | NodeTarget::Surface { context_type, .. } => {
            *context_type
        }
    }
}

fn node_init_symbol(node: &NodeSpec<'_>) -> String {
    match &node.target {
        NodeTarget::Block { id, .. } => block::init_symbol(*id),
        NodeTarget::Surface { id, .. } => init_symbol(*id),
    }
}

fn node_generate_symbol(node: &NodeSpec<'_>) -> String {
    match &node.target {
        NodeTarget::Block { id, .. } => block::generate_symbol(*id),
        NodeTarget::Surface { id, .. } => generate_symbol(*id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cad_ir::FormTag;

    fn spec_with_one_block(context: &Context) -> (SurfaceSpec<'_>, StructType<'_>) {
        let compiled = crate::block::compile(context, 100, "node", "out = inp * 2").unwrap();
        let block_ctx = compiled.context_type();
        let control_types: Vec<ControlType> = compiled
            .controls()
            .iter()
            .map(|c| c.control_type)
            .collect();
        let spec = SurfaceSpec {
            id: 1,
            groups: vec![
                GroupSpec {
                    var_type: VarType::Num,
                    default: Some(ConstantValue::mono(0.25, FormTag::None)),
                },
                GroupSpec {
                    var_type: VarType::Num,
                    default: None,
                },
            ],
            nodes: vec![NodeSpec {
                target: NodeTarget::Block {
                    id: 100,
                    context_type: block_ctx,
                    control_types,
                },
                // Socket order follows the child's control order:
                // control 0 is `inp` (read), control 1 is `out` (written).
                sockets: vec![
                    SocketSpec {
                        group: 1,
                        written: false,
                        read: true,
                    },
                    SocketSpec {
                        group: 0,
                        written: true,
                        read: false,
                    },
                ],
            }],
        };
        (spec, block_ctx)
    }

    #[test]
    fn test_surface_module_symbols() {
        let context = Context::create();
        let (spec, _) = spec_with_one_block(&context);
        let mut compiled = compile_surface(&context, &spec);
        let module = compiled.take_module().unwrap();
        assert!(module.get_function("surface_1_init").is_some());
        assert!(module.get_function("surface_1_generate").is_some());
        assert!(module.get_function("surface_1_child_0").is_some());
        // Child entry points are declared but not defined here.
        let child_init = module.get_function("block_100_init").unwrap();
        assert!(child_init.count_basic_blocks() == 0);
    }

    #[test]
    fn test_surface_module_verifies() {
        let context = Context::create();
        let (spec, _) = spec_with_one_block(&context);
        let mut compiled = compile_surface(&context, &spec);
        let module = compiled.take_module().unwrap();
        if let Err(message) = module.verify() {
            panic!(
                "surface failed verification: {}\n{}",
                message,
                module.print_to_string()
            );
        }
    }

    #[test]
    fn test_context_embeds_groups_then_children() {
        let context = Context::create();
        let (spec, block_ctx) = spec_with_one_block(&context);
        let compiled = compile_surface(&context, &spec);
        let ctx_type = compiled.context_type();
        assert_eq!(ctx_type.count_fields(), 3);
        assert_eq!(
            ctx_type.get_field_type_at_index(2).unwrap(),
            block_ctx.into()
        );
    }
}
