//! LLVM code generator and JIT engine for cadence.
//!
//! Lowers parsed custom node scripts into native modules with a fixed
//! instantiation contract, compiles graph surfaces that embed their
//! children's contexts, and owns the JIT that makes it all executable.
//!
//! The `inkwell` context is created by the embedder and outlives
//! everything here; all compiled artifacts borrow it.

pub mod block;
pub mod intrinsics;
pub mod jit;
pub mod layout;
pub mod passes;
mod sema;
pub mod surface;
pub mod target;

pub use block::{compile, Block};
pub use jit::{JitEngine, ModuleKey};
pub use surface::{
    compile_surface, CompiledSurface, GroupSpec, NodeSpec, NodeTarget, PortalSpec, SocketSpec,
    SurfaceSpec,
};

// Re-export so downstream crates use the same inkwell.
pub use inkwell;
pub use inkwell::context::Context;
