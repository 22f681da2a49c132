//! Native target machine selection.
//!
//! The JIT always targets the host: native triple, host CPU, host
//! features, aggressive codegen. Target initialization is process-wide
//! and happens once.

use std::sync::Once;

use inkwell::targets::{
    CodeModel, InitializationConfig, RelocMode, Target, TargetMachine,
};
use inkwell::OptimizationLevel;

static NATIVE_TARGET_INIT: Once = Once::new();

/// Initialize the native LLVM target.
///
/// Safe to call multiple times; initialization happens once.
///
/// # Panics
/// Panics if LLVM cannot initialize the native target - nothing can be
/// compiled in that case.
pub fn initialize_native() {
    NATIVE_TARGET_INIT.call_once(|| {
        Target::initialize_native(&InitializationConfig::default())
            .unwrap_or_else(|e| panic!("failed to initialize native LLVM target: {e}"));
    });
}

/// Create a target machine for the host, tuned to the host CPU.
///
/// # Panics
/// Panics on failure; a machine the JIT cannot target is unrecoverable.
pub fn native_machine() -> TargetMachine {
    initialize_native();

    let triple = TargetMachine::get_default_triple();
    let target = Target::from_triple(&triple)
        .unwrap_or_else(|e| panic!("no LLVM target for host triple: {e}"));

    let cpu = TargetMachine::get_host_cpu_name().to_string();
    let features = TargetMachine::get_host_cpu_features().to_string();

    target
        .create_target_machine(
            &triple,
            &cpu,
            &features,
            OptimizationLevel::Aggressive,
            RelocMode::Default,
            CodeModel::JITDefault,
        )
        .unwrap_or_else(|| {
            panic!(
                "LLVM returned no target machine for host '{}' cpu '{cpu}'",
                triple.as_str().to_string_lossy()
            )
        })
}
