//! Runtime facade for cadence.
//!
//! Owns the id allocator, the compile-unit tree, the JIT engine, and
//! the deployed graph, and exposes the whole core to the host:
//! compile, commit, `run_update`, per-sample generation, and raw
//! control-pointer resolution.
//!
//! # Concurrency contract
//!
//! Two logical actors share a `Runtime`:
//!
//! - the **control thread** parses, compiles, commits transactions and
//!   calls `run_update`;
//! - the **generation thread** calls `lock()` and drives `generate`
//!   through the returned guard, dereferencing only previously cached
//!   pointers - it never allocates, never resolves symbols.
//!
//! Expensive user-script compilation (`compile`) runs without the
//! runtime lock; only the deploy swap inside `run_update` and the
//! generation calls hold it. Deferred module removal is flushed at the
//! start of `run_update`, a point where the generation thread is known
//! to be outside `generate`.

mod engine;

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

use cad_graph::Transaction;
use cad_ir::{ControlRef, Error, RuntimeError};
use cad_llvm::Context;

use engine::{Engine, EngineLookup};
pub use engine::ControlPointers;

/// Samples the host may generate between safe points.
pub const GENERATE_BATCH: usize = 256;

/// Cheap metadata describing a compiled block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub id: u64,
    pub name: String,
    pub controls: Vec<ControlRef>,
}

/// The runtime: top-level facade over the whole core.
pub struct Runtime<'ctx> {
    context: &'ctx Context,
    next_id: AtomicU64,
    inner: Mutex<Engine<'ctx>>,
}

// SAFETY: the supported concurrency model is exactly one control thread
// (compile/commit/run_update) plus one generation thread that only uses
// `lock()`. Every touch of LLVM state is either confined to the control
// thread or serialized by the runtime mutex; compiled code reached
// through cached function pointers is immutable once deployed.
#[allow(unsafe_code)]
unsafe impl Send for Runtime<'_> {}
#[allow(unsafe_code)]
unsafe impl Sync for Runtime<'_> {}

impl<'ctx> Runtime<'ctx> {
    /// Create a runtime over a host-owned LLVM context.
    pub fn new(context: &'ctx Context) -> Self {
        Runtime {
            context,
            next_id: AtomicU64::new(1),
            inner: Mutex::new(Engine::new(context)),
        }
    }

    /// Allocate a fresh graph-wide id.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Compile a custom node script.
    ///
    /// Codegen runs without the runtime lock; only registering the
    /// result takes it, briefly. Recompiling an existing id supersedes
    /// the previous block: its unit is marked stale and the old module
    /// is replaced at the next `run_update`. On error nothing changes -
    /// the previous good block keeps running.
    pub fn compile(&self, id: u64, name: &str, code: &str) -> Result<BlockInfo, Error> {
        let block = cad_llvm::compile(self.context, id, name, code)?;
        let info = BlockInfo {
            id,
            name: name.to_owned(),
            controls: block.controls().to_vec(),
        };

        let mut engine = self.inner.lock();
        let unit = engine.blocks.get(&id).and_then(|state| state.unit);
        engine.blocks.insert(
            id,
            engine::BlockState {
                block,
                unit,
                control_offsets: Vec::new(),
            },
        );
        if let Some(unit) = unit {
            engine.tree.schedule_compile(unit);
        }
        Ok(info)
    }

    /// Controls of a previously compiled block.
    pub fn block_info(&self, id: u64) -> Option<BlockInfo> {
        let engine = self.inner.lock();
        engine.blocks.get(&id).map(|state| BlockInfo {
            id,
            name: state.block.name().to_owned(),
            controls: state.block.controls().to_vec(),
        })
    }

    /// Apply a transaction as one logical unit.
    ///
    /// The whole batch is validated first; on error nothing is staged
    /// and the live graph is untouched.
    pub fn commit(&self, transaction: Transaction) -> Result<(), RuntimeError> {
        let mut engine = self.inner.lock();
        transaction.validate(&EngineLookup { engine: &*engine })?;
        engine.stage(transaction);
        tracing::debug!("transaction committed");
        Ok(())
    }

    /// Drain pending compile/deploy work.
    ///
    /// The single point where committed transactions and recompiled
    /// blocks actually produce and deploy native code. Holds the
    /// runtime lock for the deploy swap; queued module removals are
    /// flushed first, at a point where the generation thread is known
    /// not to be executing.
    pub fn run_update(&self) {
        let mut engine = self.inner.lock();
        engine.jit.flush_removals();
        engine.apply_staged();
        engine.rebuild_dirty();
    }

    /// Push a new tempo into the live graph without recompiling.
    pub fn set_bpm(&self, bpm: f64) {
        self.inner.lock().jit.timing().set_bpm(bpm);
    }

    /// Push a new sample rate into the live graph without recompiling.
    pub fn set_sample_rate(&self, sample_rate: f64) {
        self.inner.lock().jit.timing().set_sample_rate(sample_rate);
    }

    /// Acquire the runtime lock for a generation block.
    pub fn lock(&self) -> GenerateGuard<'_, 'ctx> {
        GenerateGuard {
            engine: self.inner.lock(),
        }
    }
}

/// Exclusive access for one generation block.
///
/// Everything here dereferences previously cached pointers only; there
/// is no allocation and no symbol resolution on this path.
pub struct GenerateGuard<'a, 'ctx> {
    engine: MutexGuard<'a, Engine<'ctx>>,
}

impl GenerateGuard<'_, '_> {
    /// Start a generation block; returns how many samples may be
    /// generated before the host must release and re-acquire the lock.
    pub fn begin_generate(&mut self) -> usize {
        GENERATE_BATCH
    }

    /// Advance the graph by one sample.
    pub fn generate(&mut self) {
        if let Some(deployed) = &self.engine.deployed {
            // SAFETY: the entry pointer was resolved at deploy time for
            // this exact context layout, and the buffer outlives the
            // call; the lock serializes against redeploys.
            unsafe { (deployed.generate)(deployed.root_ctx.as_ptr()) };
        }
    }

    /// Pointer to the root surface's context, for host navigation.
    pub fn root_ptr(&self) -> Option<*mut u8> {
        self.engine
            .deployed
            .as_ref()
            .map(|deployed| deployed.root_ctx.as_ptr())
    }

    /// Raw pointer to a portal's value storage.
    ///
    /// Valid until the next structural commit is deployed.
    pub fn portal_ptr(&self, index: usize) -> Option<*mut u8> {
        let deployed = self.engine.deployed.as_ref()?;
        let state = self.engine.surfaces.get(&deployed.root_surface)?;
        let group = *state.def.portals.get(index)?;
        let offset = *state.group_offsets.get(group)?;
        // SAFETY: offset comes from LLVM target data for this layout.
        Some(unsafe { deployed.root_ctx.as_ptr().add(offset as usize) })
    }

    /// Address of a node's embedded context within a surface context.
    ///
    /// Goes through the surface's cached trampoline; no symbol lookup.
    pub fn node_ptr(
        &self,
        surface_id: u64,
        surface_ptr: *mut u8,
        node_index: usize,
    ) -> Option<*mut u8> {
        let state = self.engine.surfaces.get(&surface_id)?;
        let trampoline = *state.trampolines.get(node_index)?;
        // SAFETY: the trampoline was generated for this surface's
        // layout; the caller supplies a pointer obtained from this API.
        Some(unsafe { trampoline(surface_ptr) })
    }

    /// The four host-visible pointers of one control.
    pub fn control_ptrs(
        &self,
        block_id: u64,
        block_ptr: *mut u8,
        control_index: usize,
    ) -> Option<ControlPointers> {
        let state = self.engine.blocks.get(&block_id)?;
        let offsets = state.control_offsets.get(control_index)?;
        // SAFETY: offsets come from LLVM target data for this layout.
        unsafe {
            Some(ControlPointers {
                value: block_ptr.add(offsets.value as usize),
                data: block_ptr.add(offsets.data as usize),
                shared: block_ptr.add(offsets.shared as usize),
                ui: block_ptr.add(offsets.ui as usize),
            })
        }
    }

    /// Whether a polymorphic extraction control is active for a node.
    pub fn is_node_extracted(&self, surface_id: u64, node_index: usize) -> bool {
        self.engine
            .surfaces
            .get(&surface_id)
            .is_some_and(|state| node_index < 64 && state.extract_mask & (1 << node_index) != 0)
    }
}
