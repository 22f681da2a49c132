//! Optimization pipeline.
//!
//! Every module added to the JIT runs through verification and the LLVM
//! new pass manager (`LLVMRunPasses` with a `default<O2>` pipeline, loop
//! and SLP vectorization forced on). A verifier failure is a code
//! generator bug, never a user error: it aborts with the module IR in
//! the panic message rather than degrading silently.

use std::ffi::CString;

use inkwell::module::Module;
use inkwell::targets::TargetMachine;
use llvm_sys::transforms::pass_builder::{
    LLVMCreatePassBuilderOptions, LLVMDisposePassBuilderOptions,
    LLVMPassBuilderOptionsSetLoopInterleaving, LLVMPassBuilderOptionsSetLoopUnrolling,
    LLVMPassBuilderOptionsSetLoopVectorization, LLVMPassBuilderOptionsSetSLPVectorization,
    LLVMPassBuilderOptionsRef, LLVMRunPasses,
};

/// Pipeline string for the standard per-module pipeline.
const PIPELINE: &str = "default<O2>";

/// RAII guard for `LLVMPassBuilderOptionsRef`.
struct PassBuilderOptionsGuard {
    options: LLVMPassBuilderOptionsRef,
}

impl PassBuilderOptionsGuard {
    fn new() -> Self {
        let options = unsafe { LLVMCreatePassBuilderOptions() };
        assert!(!options.is_null(), "failed to create pass builder options");
        Self { options }
    }

    fn as_ptr(&self) -> LLVMPassBuilderOptionsRef {
        self.options
    }
}

impl Drop for PassBuilderOptionsGuard {
    fn drop(&mut self) {
        unsafe {
            LLVMDisposePassBuilderOptions(self.options);
        }
    }
}

/// Extract an error message from an LLVM error, disposing the error.
///
/// # Safety
/// The error pointer must be valid and non-null.
unsafe fn extract_llvm_error_message(error: llvm_sys::error::LLVMErrorRef) -> String {
    let msg_ptr = llvm_sys::error::LLVMGetErrorMessage(error);
    if msg_ptr.is_null() {
        "unknown error".to_string()
    } else {
        let msg = std::ffi::CStr::from_ptr(msg_ptr)
            .to_string_lossy()
            .into_owned();
        llvm_sys::error::LLVMDisposeErrorMessage(msg_ptr);
        msg
    }
}

/// Verify and optimize a module in place.
///
/// # Panics
/// Panics if verification or the pass pipeline fails. Both indicate a
/// bug in the code generator, not bad user input.
pub fn verify_and_optimize(module: &Module<'_>, target_machine: &TargetMachine) {
    if let Err(message) = module.verify() {
        panic!(
            "generated module failed LLVM verification: {}\n--- module IR ---\n{}",
            message,
            module.print_to_string(),
        );
    }

    let guard = PassBuilderOptionsGuard::new();
    unsafe {
        LLVMPassBuilderOptionsSetLoopVectorization(guard.as_ptr(), 1);
        LLVMPassBuilderOptionsSetSLPVectorization(guard.as_ptr(), 1);
        LLVMPassBuilderOptionsSetLoopUnrolling(guard.as_ptr(), 1);
        LLVMPassBuilderOptionsSetLoopInterleaving(guard.as_ptr(), 1);
    }

    let pipeline = CString::new(PIPELINE).unwrap();
    let error = unsafe {
        LLVMRunPasses(
            module.as_mut_ptr(),
            pipeline.as_ptr(),
            target_machine.as_mut_ptr(),
            guard.as_ptr(),
        )
    };

    if !error.is_null() {
        let message = unsafe { extract_llvm_error_message(error) };
        panic!("optimization pipeline failed: {message}");
    }
}
