//! Engine internals behind the runtime lock.
//!
//! Owns the JIT, the compile-unit tree, compiled blocks and surfaces,
//! and the deployed-graph tables (context buffer, cached entry and
//! trampoline pointers, host-visible offsets). Everything here is
//! reached only through the runtime's mutex.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use rustc_hash::{FxHashMap, FxHashSet};

use cad_graph::{GraphLookup, NodeKind, SurfaceDef, Transaction, UnitId, UnitTree};
use cad_ir::{ControlRef, VarType};
use cad_llvm::inkwell::types::StructType;
use cad_llvm::{surface as surf, Block, JitEngine};

/// `void(ptr)` entry point resolved from the JIT.
pub type EntryFn = unsafe extern "C" fn(*mut u8);
/// `ptr(ptr)` trampoline resolved from the JIT.
pub type TrampolineFn = unsafe extern "C" fn(*mut u8) -> *mut u8;

/// Four host-visible addresses of one control's storage.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ControlPointers {
    pub value: *mut u8,
    pub data: *mut u8,
    pub shared: *mut u8,
    pub ui: *mut u8,
}

/// Byte offsets of one control's storage sections within a block
/// context.
#[derive(Debug, Copy, Clone)]
pub(crate) struct ControlOffsets {
    pub storage: u64,
    pub value: u64,
    pub data: u64,
    pub shared: u64,
    pub ui: u64,
}

pub(crate) struct BlockState<'ctx> {
    pub block: Block<'ctx>,
    pub unit: Option<UnitId>,
    /// Host-visible offsets, refreshed after deploy.
    pub control_offsets: Vec<ControlOffsets>,
}

pub(crate) struct SurfaceState<'ctx> {
    pub def: SurfaceDef,
    pub unit: Option<UnitId>,
    pub compiled: Option<surf::CompiledSurface<'ctx>>,
    /// Byte offset of each group in the surface context.
    pub group_offsets: Vec<u64>,
    /// Cached child trampolines, one per node.
    pub trampolines: Vec<TrampolineFn>,
    /// Bit `n` set if node `n` has an extractor socket.
    pub extract_mask: u64,
}

/// Zero-initialized, 16-byte-aligned context memory.
pub(crate) struct ContextBuffer {
    ptr: NonNull<u8>,
    layout: Option<Layout>,
}

impl ContextBuffer {
    pub fn new(size: usize) -> Self {
        if size == 0 {
            return ContextBuffer {
                ptr: NonNull::dangling(),
                layout: None,
            };
        }
        let layout = Layout::from_size_align(size, 16)
            .unwrap_or_else(|e| panic!("bad context layout: {e}"));
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        ContextBuffer {
            ptr,
            layout: Some(layout),
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for ContextBuffer {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            // SAFETY: allocated with exactly this layout in `new`.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

/// The live deployed graph: entry points and context memory.
pub(crate) struct Deployed {
    pub root_surface: u64,
    pub root_ctx: ContextBuffer,
    pub generate: EntryFn,
}

pub(crate) struct Engine<'ctx> {
    pub context: &'ctx cad_llvm::Context,
    pub jit: JitEngine<'ctx>,
    pub tree: UnitTree,
    pub blocks: FxHashMap<u64, BlockState<'ctx>>,
    pub surfaces: FxHashMap<u64, SurfaceState<'ctx>>,
    /// Surface ids whose definitions changed since the last update.
    pub dirty_defs: FxHashSet<u64>,
    pub root_unit: Option<UnitId>,
    /// Which deployable each unit belongs to.
    pub unit_targets: FxHashMap<UnitId, UnitTarget>,
    pub deployed: Option<Deployed>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum UnitTarget {
    Block(u64),
    Surface(u64),
}

impl<'ctx> Engine<'ctx> {
    pub fn new(context: &'ctx cad_llvm::Context) -> Self {
        Engine {
            context,
            jit: JitEngine::new(context),
            tree: UnitTree::new(),
            blocks: FxHashMap::default(),
            surfaces: FxHashMap::default(),
            dirty_defs: FxHashSet::default(),
            root_unit: None,
            unit_targets: FxHashMap::default(),
            deployed: None,
        }
    }

    /// Stage a validated transaction's surfaces.
    pub fn stage(&mut self, transaction: Transaction) {
        for def in transaction.into_surfaces() {
            let changed = self
                .surfaces
                .get(&def.id)
                .is_none_or(|state| state.def != def);
            if changed {
                self.dirty_defs.insert(def.id);
            }
            match self.surfaces.get_mut(&def.id) {
                Some(state) => state.def = def,
                None => {
                    self.surfaces.insert(
                        def.id,
                        SurfaceState {
                            def,
                            unit: None,
                            compiled: None,
                            group_offsets: Vec::new(),
                            trampolines: Vec::new(),
                            extract_mask: 0,
                        },
                    );
                }
            }
        }
    }

    /// The root surface: the one no group node references.
    pub fn root_surface_id(&self) -> Option<u64> {
        let mut referenced = FxHashSet::default();
        for state in self.surfaces.values() {
            for node in &state.def.nodes {
                if let NodeKind::Group { surface_id } = node.kind {
                    referenced.insert(surface_id);
                }
            }
        }
        self.surfaces
            .keys()
            .filter(|id| !referenced.contains(id))
            .min()
            .copied()
    }

    /// Drain staged work: wire units for changed definitions and mark
    /// them for recompilation.
    pub fn apply_staged(&mut self) {
        if self.dirty_defs.is_empty() {
            return;
        }

        let Some(root_id) = self.root_surface_id() else {
            return;
        };

        // Parent relationships: child surface id -> parent surface id.
        let mut parents: FxHashMap<u64, u64> = FxHashMap::default();
        for state in self.surfaces.values() {
            for node in &state.def.nodes {
                if let NodeKind::Group { surface_id } = node.kind {
                    parents.insert(surface_id, state.def.id);
                }
            }
        }

        self.wire_surface_units(root_id, None, &parents);
        self.collect_orphans(root_id);

        let dirty = std::mem::take(&mut self.dirty_defs);
        for id in dirty {
            if let Some(unit) = self.surfaces.get(&id).and_then(|s| s.unit) {
                self.tree.schedule_compile(unit);
            }
        }
    }

    /// Release units whose block or surface is no longer placed in the
    /// graph. Removal queues the deployed modules' JIT cleanup; the
    /// tree, not the JIT, owns module lifetime.
    fn collect_orphans(&mut self, root_id: u64) {
        let mut placed_blocks = FxHashSet::default();
        let mut placed_surfaces = FxHashSet::default();
        placed_surfaces.insert(root_id);
        for state in self.surfaces.values() {
            for node in &state.def.nodes {
                match node.kind {
                    NodeKind::Custom { block_id } => {
                        placed_blocks.insert(block_id);
                    }
                    NodeKind::Group { surface_id } => {
                        placed_surfaces.insert(surface_id);
                    }
                }
            }
        }

        let orphan_blocks: Vec<(u64, UnitId)> = self
            .blocks
            .iter()
            .filter(|(id, _)| !placed_blocks.contains(id))
            .filter_map(|(id, state)| state.unit.map(|unit| (*id, unit)))
            .collect();
        for (id, unit) in orphan_blocks {
            self.tree.remove(unit, &mut self.jit);
            self.unit_targets.remove(&unit);
            if let Some(state) = self.blocks.get_mut(&id) {
                state.unit = None;
            }
        }

        let orphan_surfaces: Vec<UnitId> = self
            .surfaces
            .iter()
            .filter(|(id, _)| !placed_surfaces.contains(id))
            .filter_map(|(_, state)| state.unit)
            .collect();
        for unit in orphan_surfaces {
            // The whole subtree goes; scrub every map that held one of
            // its unit ids before they become stale.
            let removed = self.tree.subtree(unit);
            self.tree.remove(unit, &mut self.jit);
            for gone in removed {
                self.unit_targets.remove(&gone);
                for state in self.blocks.values_mut() {
                    if state.unit == Some(gone) {
                        state.unit = None;
                    }
                }
                for state in self.surfaces.values_mut() {
                    if state.unit == Some(gone) {
                        state.unit = None;
                        state.compiled = None;
                        // Cached addresses point into removed modules.
                        state.trampolines.clear();
                        state.group_offsets.clear();
                    }
                }
            }
        }
    }

    /// Ensure units exist for a surface, its blocks, and its children.
    fn wire_surface_units(
        &mut self,
        surface_id: u64,
        parent_unit: Option<UnitId>,
        parents: &FxHashMap<u64, u64>,
    ) {
        let existing = self.surfaces.get(&surface_id).and_then(|s| s.unit);
        let unit = match existing {
            Some(unit) => unit,
            None => {
                let unit = match parent_unit {
                    Some(parent) => self.tree.add_child(parent),
                    None => {
                        let root = self.tree.add_root();
                        self.root_unit = Some(root);
                        root
                    }
                };
                self.unit_targets.insert(unit, UnitTarget::Surface(surface_id));
                if let Some(state) = self.surfaces.get_mut(&surface_id) {
                    state.unit = Some(unit);
                }
                unit
            }
        };

        let nodes = self
            .surfaces
            .get(&surface_id)
            .map(|s| s.def.nodes.clone())
            .unwrap_or_default();
        for node in nodes {
            match node.kind {
                NodeKind::Custom { block_id } => {
                    if let Some(block_state) = self.blocks.get(&block_id) {
                        if block_state.unit.is_none() {
                            let block_unit = self.tree.add_child(unit);
                            self.unit_targets
                                .insert(block_unit, UnitTarget::Block(block_id));
                            if let Some(block_state) = self.blocks.get_mut(&block_id) {
                                block_state.unit = Some(block_unit);
                            }
                        }
                    }
                }
                NodeKind::Group { surface_id: child } => {
                    if parents.get(&child).copied() == Some(surface_id) {
                        self.wire_surface_units(child, Some(unit), parents);
                    }
                }
            }
        }
    }

    /// Recompile and redeploy every dirty unit, children first.
    pub fn rebuild_dirty(&mut self) {
        let Some(root_unit) = self.root_unit else {
            return;
        };
        let dirty = self.tree.dirty_postorder(root_unit);
        if dirty.is_empty() {
            return;
        }

        for unit in dirty {
            match self.unit_targets.get(&unit).copied() {
                Some(UnitTarget::Block(block_id)) => self.deploy_block(unit, block_id),
                Some(UnitTarget::Surface(surface_id)) => {
                    self.deploy_surface(unit, surface_id);
                }
                None => panic!("unit {unit:?} has no deploy target"),
            }
        }

        // Every superseded module stayed resolvable until its
        // replacement was registered above. The lock is held and the
        // generation thread is outside `generate`, so this is a safe
        // point; flushing now also leaves symbol resolution below
        // unambiguous.
        self.jit.flush_removals();

        self.refresh_pointers();
    }

    fn deploy_block(&mut self, unit: UnitId, block_id: u64) {
        let state = self
            .blocks
            .get_mut(&block_id)
            .unwrap_or_else(|| panic!("block {block_id} placed but never compiled"));
        if let Some(module) = state.block.take_module() {
            self.tree.deploy(unit, &mut self.jit, module);
        }
        // Otherwise the deployed module still matches; only placement
        // changed.
        self.tree.mark_compiled(unit);
    }

    fn deploy_surface(&mut self, unit: UnitId, surface_id: u64) {
        let spec = self.surface_spec(surface_id);
        let mut compiled = surf::compile_surface(self.context, &spec);
        let module = compiled.take_module().unwrap();
        self.tree.deploy(unit, &mut self.jit, module);
        self.tree.mark_compiled(unit);

        if let Some(state) = self.surfaces.get_mut(&surface_id) {
            state.compiled = Some(compiled);
        }
    }

    /// Build the codegen spec for one surface from its definition.
    fn surface_spec(&self, surface_id: u64) -> surf::SurfaceSpec<'ctx> {
        let state = &self.surfaces[&surface_id];
        let def = &state.def;

        let groups = def
            .groups
            .iter()
            .map(|group| surf::GroupSpec {
                var_type: group.var_type.clone(),
                default: match &group.source {
                    cad_graph::ValueGroupSource::Default(constant) => Some(constant.clone()),
                    _ => None,
                },
            })
            .collect();

        let nodes = def
            .nodes
            .iter()
            .map(|node| {
                let target = match node.kind {
                    NodeKind::Custom { block_id } => {
                        let block = &self
                            .blocks
                            .get(&block_id)
                            .unwrap_or_else(|| panic!("block {block_id} missing at codegen"))
                            .block;
                        // Commit-time validation pinned the socket list
                        // to the block's control surface; a recompile
                        // that changes it needs a matching transaction.
                        assert_eq!(
                            node.sockets.len(),
                            block.controls().len(),
                            "block {block_id} control surface changed without a matching transaction",
                        );
                        surf::NodeTarget::Block {
                            id: block_id,
                            context_type: block.context_type(),
                            control_types: block
                                .controls()
                                .iter()
                                .map(|c| c.control_type)
                                .collect(),
                        }
                    }
                    NodeKind::Group { surface_id: child } => {
                        let child_state = &self.surfaces[&child];
                        let compiled = child_state
                            .compiled
                            .as_ref()
                            .unwrap_or_else(|| panic!("surface {child} missing at codegen"));
                        surf::NodeTarget::Surface {
                            id: child,
                            context_type: compiled.context_type(),
                            portals: child_state
                                .def
                                .portals
                                .iter()
                                .map(|group| surf::PortalSpec {
                                    group_index: *group,
                                    var_type: child_state.def.groups[*group].var_type.clone(),
                                })
                                .collect(),
                        }
                    }
                };
                surf::NodeSpec {
                    target,
                    sockets: node
                        .sockets
                        .iter()
                        .map(|socket| surf::SocketSpec {
                            group: socket.group,
                            written: socket.written,
                            read: socket.read,
                        })
                        .collect(),
                }
            })
            .collect();

        surf::SurfaceSpec {
            id: surface_id,
            groups,
            nodes,
        }
    }

    /// Re-resolve every cached address and offset, reallocate the root
    /// context, and re-run init.
    ///
    /// Runs after every deploy cycle, which makes trampoline
    /// re-resolution an enforced post-condition of deploy rather than an
    /// optional call-site responsibility.
    fn refresh_pointers(&mut self) {
        let Some(root_id) = self.root_surface_id() else {
            return;
        };

        // Per-surface tables.
        let surface_ids: Vec<u64> = self.surfaces.keys().copied().collect();
        for id in surface_ids {
            let Some(context_type) = self.surfaces[&id]
                .compiled
                .as_ref()
                .map(surf::CompiledSurface::context_type)
            else {
                continue;
            };
            let def_groups = self.surfaces[&id].def.groups.len();
            let def_nodes = self.surfaces[&id].def.nodes.len();

            let group_offsets: Vec<u64> = (0..def_groups)
                .map(|index| self.jit.field_offset(context_type, index as u32))
                .collect();

            let trampolines: Vec<TrampolineFn> = (0..def_nodes)
                .map(|index| {
                    let addr = self.jit.symbol_address(&surf::child_symbol(id, index));
                    // SAFETY: the surface module defines this symbol with
                    // the ptr(ptr) trampoline signature.
                    unsafe { std::mem::transmute::<usize, TrampolineFn>(addr) }
                })
                .collect();

            let mut extract_mask = 0u64;
            for (index, node) in self.surfaces[&id].def.nodes.iter().enumerate() {
                if node.sockets.iter().any(|s| s.extractor) && index < 64 {
                    extract_mask |= 1 << index;
                }
            }

            let state = self.surfaces.get_mut(&id).unwrap();
            state.group_offsets = group_offsets;
            state.trampolines = trampolines;
            state.extract_mask = extract_mask;
        }

        // Per-block control offsets.
        let block_ids: Vec<u64> = self.blocks.keys().copied().collect();
        for id in block_ids {
            let state = &self.blocks[&id];
            let block_ctx = state.block.context_type();
            let offsets: Vec<ControlOffsets> = state
                .block
                .controls()
                .iter()
                .enumerate()
                .map(|(index, control)| {
                    let storage_ty = cad_llvm::layout::control_storage_type(
                        self.context,
                        control.control_type,
                    );
                    let storage = self.jit.field_offset(block_ctx, index as u32);
                    ControlOffsets {
                        storage,
                        value: storage
                            + self
                                .jit
                                .field_offset(storage_ty, cad_llvm::layout::CONTROL_FIELD_VALUE),
                        data: storage
                            + self
                                .jit
                                .field_offset(storage_ty, cad_llvm::layout::CONTROL_FIELD_DATA),
                        shared: storage
                            + self
                                .jit
                                .field_offset(storage_ty, cad_llvm::layout::CONTROL_FIELD_SHARED),
                        ui: storage
                            + self.jit.field_offset(storage_ty, cad_llvm::layout::CONTROL_FIELD_UI),
                    }
                })
                .collect();
            self.blocks.get_mut(&id).unwrap().control_offsets = offsets;
        }

        // Root context and entry point.
        let root_type: StructType<'ctx> = self.surfaces[&root_id]
            .compiled
            .as_ref()
            .map(surf::CompiledSurface::context_type)
            .unwrap_or_else(|| panic!("root surface {root_id} not compiled"));
        let size = self.jit.store_size(root_type) as usize;
        let root_ctx = ContextBuffer::new(size);

        let init_addr = self.jit.symbol_address(&surf::init_symbol(root_id));
        let generate_addr = self.jit.symbol_address(&surf::generate_symbol(root_id));
        // SAFETY: both symbols follow the void(ptr) contract.
        let (init, generate) = unsafe {
            (
                std::mem::transmute::<usize, EntryFn>(init_addr),
                std::mem::transmute::<usize, EntryFn>(generate_addr),
            )
        };
        // SAFETY: the buffer is sized for the root context struct.
        unsafe { init(root_ctx.as_ptr()) };

        self.deployed = Some(Deployed {
            root_surface: root_id,
            root_ctx,
            generate,
        });
        tracing::info!(root = root_id, "graph deployed");
    }
}

/// Validation view over committed engine state.
pub(crate) struct EngineLookup<'a, 'ctx> {
    pub engine: &'a Engine<'ctx>,
}

impl GraphLookup for EngineLookup<'_, '_> {
    fn block_controls(&self, block_id: u64) -> Option<&[ControlRef]> {
        self.engine
            .blocks
            .get(&block_id)
            .map(|state| state.block.controls())
    }

    fn surface_portals(&self, surface_id: u64) -> Option<Vec<VarType>> {
        self.engine.surfaces.get(&surface_id).map(|state| {
            state
                .def
                .portals
                .iter()
                .map(|group| state.def.groups[*group].var_type.clone())
                .collect()
        })
    }
}
