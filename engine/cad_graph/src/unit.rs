//! The compile-unit tree.
//!
//! One unit per deployable module (a surface or a custom node). Units
//! live in an arena addressed by stable ids; parent links are ids, not
//! pointers, so recompilation-driven restructuring can never leave a
//! dangling back-reference.
//!
//! Dirtiness propagates upward: editing a child changes the parent's
//! layout (the child's context is embedded in it), so `schedule_compile`
//! on a leaf invalidates the whole ancestor chain up to the root.
//! `schedule_deploy` is the weaker form used when only placement or
//! wiring changed.
//!
//! The tree owns deployed modules through their JIT keys: replacing or
//! removing a unit queues the old module's removal, and the new module
//! is registered before the old key is queued, so there is never a
//! window where in-flight callers resolve to nothing.

use cad_llvm::inkwell::module::Module;
use cad_llvm::{JitEngine, ModuleKey};

/// Stable handle to a unit in the tree.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct UnitId(u32);

/// One node of the compile-unit tree.
#[derive(Debug)]
struct CompileUnit {
    parent: Option<UnitId>,
    children: Vec<UnitId>,
    needs_compile: bool,
    needs_deploy: bool,
    is_deployed: bool,
    deploy_key: Option<ModuleKey>,
}

impl CompileUnit {
    fn new(parent: Option<UnitId>) -> Self {
        CompileUnit {
            parent,
            children: Vec::new(),
            needs_compile: true,
            needs_deploy: true,
            is_deployed: false,
            deploy_key: None,
        }
    }
}

/// Arena of compile units.
#[derive(Debug, Default)]
pub struct UnitTree {
    units: Vec<Option<CompileUnit>>,
    free: Vec<u32>,
}

impl UnitTree {
    pub fn new() -> Self {
        UnitTree::default()
    }

    fn unit(&self, id: UnitId) -> &CompileUnit {
        self.units[id.0 as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("stale unit id {id:?}"))
    }

    fn unit_mut(&mut self, id: UnitId) -> &mut CompileUnit {
        self.units[id.0 as usize]
            .as_mut()
            .unwrap_or_else(|| panic!("stale unit id {id:?}"))
    }

    fn insert(&mut self, unit: CompileUnit) -> UnitId {
        match self.free.pop() {
            Some(slot) => {
                self.units[slot as usize] = Some(unit);
                UnitId(slot)
            }
            None => {
                self.units.push(Some(unit));
                UnitId((self.units.len() - 1) as u32)
            }
        }
    }

    /// Create a root unit (no parent).
    pub fn add_root(&mut self) -> UnitId {
        self.insert(CompileUnit::new(None))
    }

    /// Create a child unit. The new unit starts dirty, and its ancestors
    /// are invalidated because their layout now embeds it.
    pub fn add_child(&mut self, parent: UnitId) -> UnitId {
        let id = self.insert(CompileUnit::new(Some(parent)));
        self.unit_mut(parent).children.push(id);
        self.schedule_compile(parent);
        id
    }

    /// Remove a unit and its subtree, queueing removal of every deployed
    /// module. The parent is invalidated.
    pub fn remove(&mut self, id: UnitId, jit: &mut JitEngine<'_>) {
        let unit = self.unit(id);
        let parent = unit.parent;
        let children = unit.children.clone();
        for child in children {
            self.remove(child, jit);
        }

        let unit = self.units[id.0 as usize]
            .take()
            .unwrap_or_else(|| panic!("stale unit id {id:?}"));
        if let Some(key) = unit.deploy_key {
            jit.queue_remove(key);
        }
        self.free.push(id.0);

        if let Some(parent) = parent {
            if let Some(Some(parent_unit)) = self.units.get_mut(parent.0 as usize) {
                parent_unit.children.retain(|c| *c != id);
            }
            self.schedule_compile(parent);
        }
    }

    /// Mark a unit (and every ancestor) as needing recompilation.
    ///
    /// Idempotent: repeated calls before the next `compile` leave the
    /// unit in exactly one pending state.
    pub fn schedule_compile(&mut self, id: UnitId) {
        let unit = self.unit_mut(id);
        unit.needs_compile = true;
        unit.needs_deploy = true;
        if let Some(parent) = unit.parent {
            self.schedule_compile(parent);
        }
    }

    /// Mark a unit (and every ancestor) as needing redeployment only.
    pub fn schedule_deploy(&mut self, id: UnitId) {
        let unit = self.unit_mut(id);
        unit.needs_deploy = true;
        if let Some(parent) = unit.parent {
            self.schedule_deploy(parent);
        }
    }

    /// Clear a unit's compile flag after codegen has consumed its AST.
    pub fn mark_compiled(&mut self, id: UnitId) {
        self.unit_mut(id).needs_compile = false;
    }

    /// Deploy a freshly compiled module for this unit.
    ///
    /// The new module is added first; only then is the old one queued
    /// for deferred removal, so in-flight resolution always finds code.
    /// Clearing `needs_deploy` here makes trampoline re-resolution an
    /// enforced post-condition of deploy: the runtime re-reads every
    /// cached address for a unit whenever its deploy key changes.
    pub fn deploy<'ctx>(
        &mut self,
        id: UnitId,
        jit: &mut JitEngine<'ctx>,
        module: Module<'ctx>,
    ) -> ModuleKey {
        let key = jit.add_module(module);
        let unit = self.unit_mut(id);
        let old = unit.deploy_key.replace(key);
        unit.is_deployed = true;
        unit.needs_deploy = false;
        if let Some(old) = old {
            jit.queue_remove(old);
        }
        tracing::debug!(?id, "unit deployed");
        key
    }

    // -- accessors --

    pub fn parent(&self, id: UnitId) -> Option<UnitId> {
        self.unit(id).parent
    }

    pub fn children(&self, id: UnitId) -> &[UnitId] {
        &self.unit(id).children
    }

    pub fn needs_compile(&self, id: UnitId) -> bool {
        self.unit(id).needs_compile
    }

    pub fn needs_deploy(&self, id: UnitId) -> bool {
        self.unit(id).needs_deploy
    }

    pub fn is_deployed(&self, id: UnitId) -> bool {
        self.unit(id).is_deployed
    }

    pub fn deploy_key(&self, id: UnitId) -> Option<ModuleKey> {
        self.unit(id).deploy_key
    }

    /// All units of a subtree, the root included.
    pub fn subtree(&self, id: UnitId) -> Vec<UnitId> {
        let mut out = vec![id];
        let mut cursor = 0;
        while cursor < out.len() {
            out.extend_from_slice(self.children(out[cursor]));
            cursor += 1;
        }
        out
    }

    /// Units of the subtree that need work, children before parents.
    pub fn dirty_postorder(&self, root: UnitId) -> Vec<UnitId> {
        let mut out = Vec::new();
        self.collect_dirty(root, &mut out);
        out
    }

    fn collect_dirty(&self, id: UnitId, out: &mut Vec<UnitId>) {
        for child in self.children(id) {
            self.collect_dirty(*child, out);
        }
        let unit = self.unit(id);
        if unit.needs_compile || unit.needs_deploy {
            out.push(id);
        }
    }
}
