//! The JIT engine.
//!
//! Owns target-machine selection, the optimization pipeline, and module
//! lifecycle for the whole compile-unit tree. Callers hold opaque
//! `ModuleKey`s; modules live in a free-list slab so removing one module
//! never invalidates other live keys.
//!
//! Removal has two modes. `remove_module` drops a module immediately and
//! may only be called at a safe point (the generation thread not inside
//! a block). `queue_remove` defers removal; `flush_removals` drains the
//! queue and is called with the runtime lock held, immediately before
//! the next deploy, so a module the generation thread may still be
//! executing is never pulled out from under it.

use inkwell::context::Context;
use inkwell::execution_engine::ExecutionEngine;
use inkwell::module::Module;
use inkwell::targets::TargetMachine;
use inkwell::OptimizationLevel;

use crate::intrinsics::TimingState;
use crate::{intrinsics, passes, target};

/// Opaque handle to a module owned by the JIT.
///
/// Slot index plus a generation counter; a key from before a slot was
/// reused never aliases the slot's new occupant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ModuleKey {
    slot: u32,
    generation: u32,
}

struct Slot<'ctx> {
    module: Option<Module<'ctx>>,
    generation: u32,
}

/// The JIT engine: one execution engine for the whole graph.
pub struct JitEngine<'ctx> {
    engine: ExecutionEngine<'ctx>,
    target_machine: TargetMachine,
    timing: Box<TimingState>,
    slots: Vec<Slot<'ctx>>,
    free: Vec<u32>,
    pending_removal: Vec<ModuleKey>,
}

impl<'ctx> JitEngine<'ctx> {
    /// Create the engine: select the native target machine and stand up
    /// an execution engine on an empty anchor module.
    ///
    /// # Panics
    /// Panics if LLVM cannot produce a JIT for the host; nothing can run
    /// without one.
    pub fn new(context: &'ctx Context) -> Self {
        target::initialize_native();
        let target_machine = target::native_machine();

        let anchor = context.create_module("cad.jit.anchor");
        let engine = anchor
            .create_jit_execution_engine(OptimizationLevel::Aggressive)
            .unwrap_or_else(|e| panic!("failed to create JIT execution engine: {e}"));

        JitEngine {
            engine,
            target_machine,
            timing: Box::new(TimingState::default()),
            slots: Vec::new(),
            free: Vec::new(),
            pending_removal: Vec::new(),
        }
    }

    /// Timing parameters shared with generated code.
    pub fn timing(&self) -> &TimingState {
        &self.timing
    }

    /// Verify, optimize, and add a module; returns its key.
    ///
    /// # Panics
    /// Panics if the module fails verification or is already present -
    /// both are compiler bugs, not user errors.
    pub fn add_module(&mut self, module: Module<'ctx>) -> ModuleKey {
        passes::verify_and_optimize(&module, &self.target_machine);

        self.engine
            .add_module(&module)
            .unwrap_or_else(|()| panic!("module added to the JIT twice"));
        intrinsics::map_into_engine(&self.engine, &module, &self.timing);

        let key = match self.free.pop() {
            Some(slot) => {
                let entry = &mut self.slots[slot as usize];
                entry.module = Some(module);
                ModuleKey {
                    slot,
                    generation: entry.generation,
                }
            }
            None => {
                let slot = self.slots.len() as u32;
                self.slots.push(Slot {
                    module: Some(module),
                    generation: 0,
                });
                ModuleKey {
                    slot,
                    generation: 0,
                }
            }
        };
        tracing::debug!(slot = key.slot, "module added to JIT");
        key
    }

    /// Remove a module immediately.
    ///
    /// Only legal at a safe point; modules that may be executing on the
    /// generation thread go through `queue_remove` instead.
    ///
    /// # Panics
    /// Panics on a stale or unknown key - using one is a bug in the
    /// compile-unit tree's bookkeeping.
    pub fn remove_module(&mut self, key: ModuleKey) {
        let entry = self
            .slots
            .get_mut(key.slot as usize)
            .filter(|entry| entry.generation == key.generation);
        let Some(entry) = entry else {
            panic!("remove_module: stale module key {key:?}");
        };
        let module = entry
            .module
            .take()
            .unwrap_or_else(|| panic!("remove_module: module already removed: {key:?}"));
        self.engine
            .remove_module(&module)
            .unwrap_or_else(|e| panic!("failed to remove module from JIT: {e}"));
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(key.slot);
        tracing::debug!(slot = key.slot, "module removed from JIT");
    }

    /// Queue a module for removal at the next safe point.
    pub fn queue_remove(&mut self, key: ModuleKey) {
        self.pending_removal.push(key);
    }

    /// Drain the deferred-removal queue.
    ///
    /// Call with the runtime lock held, between generation blocks.
    pub fn flush_removals(&mut self) {
        let pending = std::mem::take(&mut self.pending_removal);
        for key in pending {
            self.remove_module(key);
        }
    }

    /// Number of queued removals (for safe-point accounting).
    pub fn pending_removals(&self) -> usize {
        self.pending_removal.len()
    }

    /// True if the key refers to a live module.
    pub fn is_live(&self, key: ModuleKey) -> bool {
        self.slots
            .get(key.slot as usize)
            .is_some_and(|entry| entry.generation == key.generation && entry.module.is_some())
    }

    /// Resolve a symbol to its native address.
    pub fn find_symbol(&self, name: &str) -> Option<usize> {
        self.engine.get_function_address(name).ok()
    }

    /// Resolve a symbol that must exist.
    ///
    /// # Panics
    /// Panics if the symbol is missing - generated modules always export
    /// their contract symbols, so a miss is a compiler bug.
    pub fn symbol_address(&self, name: &str) -> usize {
        self.find_symbol(name)
            .unwrap_or_else(|| panic!("symbol `{name}` not resolvable in JIT"))
    }

    /// Byte offset of a struct field on the JIT's target.
    ///
    /// The checked accessor behind every host-visible pointer: offsets
    /// come from LLVM's target data, never from hand arithmetic.
    pub fn field_offset(&self, struct_type: inkwell::types::StructType<'ctx>, field: u32) -> u64 {
        self.engine
            .get_target_data()
            .offset_of_element(&struct_type, field)
            .unwrap_or_else(|| panic!("field {field} out of bounds for {struct_type:?}"))
    }

    /// Total byte size of a type on the JIT's target.
    pub fn store_size(&self, ty: inkwell::types::StructType<'ctx>) -> u64 {
        self.engine.get_target_data().get_store_size(&ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block;

    fn engine_with_block<'ctx>(
        context: &'ctx Context,
        id: u64,
        code: &str,
    ) -> (JitEngine<'ctx>, ModuleKey) {
        let mut jit = JitEngine::new(context);
        let mut compiled = block::compile(context, id, "test", code).unwrap();
        let key = jit.add_module(compiled.take_module().unwrap());
        (jit, key)
    }

    #[test]
    fn test_add_and_resolve() {
        let context = Context::create();
        let (jit, key) = engine_with_block(&context, 1, "out = 1 + 2");
        assert!(jit.is_live(key));
        assert!(jit.find_symbol("block_1_init").is_some());
        assert!(jit.find_symbol("block_1_generate").is_some());
        assert!(jit.find_symbol("block_1_missing").is_none());
    }

    #[test]
    fn test_generate_computes_value() {
        let context = Context::create();
        let (jit, _key) = engine_with_block(&context, 2, "out = 1 + 2");

        let mut compiled = block::compile(&context, 2, "test", "out = 1 + 2").unwrap();
        let ctx_type = compiled.context_type();
        drop(compiled.take_module());

        let size = jit.store_size(ctx_type) as usize;
        let mut storage = vec![0u8; size.max(1)];

        let init = jit.symbol_address("block_2_init");
        let generate = jit.symbol_address("block_2_generate");
        // SAFETY: symbols follow the void(ptr) instantiation contract.
        unsafe {
            let init: unsafe extern "C" fn(*mut u8) = std::mem::transmute(init);
            let generate: unsafe extern "C" fn(*mut u8) = std::mem::transmute(generate);
            init(storage.as_mut_ptr());
            generate(storage.as_mut_ptr());
        }

        // Control 0 value section holds { left, right, form }.
        let left = f64::from_le_bytes(storage[0..8].try_into().unwrap());
        let right = f64::from_le_bytes(storage[8..16].try_into().unwrap());
        assert_eq!(left, 3.0);
        assert_eq!(right, 3.0);
    }

    #[test]
    fn test_slot_reuse_does_not_invalidate_other_keys() {
        let context = Context::create();
        let mut jit = JitEngine::new(&context);

        let mut a = block::compile(&context, 10, "a", "out = 1").unwrap();
        let mut b = block::compile(&context, 11, "b", "out = 2").unwrap();
        let key_a = jit.add_module(a.take_module().unwrap());
        let key_b = jit.add_module(b.take_module().unwrap());

        jit.remove_module(key_a);
        assert!(!jit.is_live(key_a));
        assert!(jit.is_live(key_b));

        // The freed slot is reused with a fresh generation.
        let mut c = block::compile(&context, 12, "c", "out = 3").unwrap();
        let key_c = jit.add_module(c.take_module().unwrap());
        assert_eq!(key_c.slot, key_a.slot);
        assert_ne!(key_c, key_a);
        assert!(!jit.is_live(key_a));
        assert!(jit.is_live(key_c));
        assert!(jit.find_symbol("block_11_generate").is_some());
    }

    #[test]
    fn test_deferred_removal_keeps_module_resolvable() {
        let context = Context::create();
        let (mut jit, key) = engine_with_block(&context, 20, "out = sin(x)");

        jit.queue_remove(key);
        // Still resolvable until the flush at the next safe point.
        assert!(jit.is_live(key));
        assert!(jit.find_symbol("block_20_generate").is_some());
        assert_eq!(jit.pending_removals(), 1);

        jit.flush_removals();
        assert!(!jit.is_live(key));
        assert_eq!(jit.pending_removals(), 0);
    }

    #[test]
    #[should_panic(expected = "stale module key")]
    fn test_stale_key_panics() {
        let context = Context::create();
        let (mut jit, key) = engine_with_block(&context, 30, "out = 1");
        jit.remove_module(key);
        jit.remove_module(key);
    }

    #[test]
    fn test_timing_updates_without_recompile() {
        let context = Context::create();
        let (jit, _key) = engine_with_block(&context, 40, "out = bpm()");
        jit.timing().set_bpm(140.0);
        assert_eq!(jit.timing().bpm(), 140.0);
    }
}
