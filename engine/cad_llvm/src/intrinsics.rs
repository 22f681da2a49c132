//! Builtin intrinsic functions callable from generated code.
//!
//! A fixed table of `extern "C"` shims is registered with the execution
//! engine once per added module, so generated code calls them without
//! per-module symbol duplication. All shims are pure value functions;
//! none allocate or lock, which keeps them legal on the generation
//! thread.
//!
//! Timing parameters (bpm, sample rate) live in a `TimingState` owned by
//! the JIT engine and mapped into every module as the external global
//! `cad_timing`; writes are relaxed atomics so the control thread can
//! update them without stopping generation and without recompiling.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

use inkwell::context::Context;
use inkwell::execution_engine::ExecutionEngine;
use inkwell::module::{Linkage, Module};
use inkwell::types::BasicMetadataTypeEnum;
use inkwell::AddressSpace;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Name of the external timing global declared in every module.
pub const TIMING_GLOBAL: &str = "cad_timing";

/// Timing parameters shared with generated code.
///
/// Layout is `{ f64 bpm, f64 sample_rate }`; the atomics store the f64
/// bit patterns so the generated plain loads never tear on 64-bit
/// targets.
#[repr(C)]
pub struct TimingState {
    bpm: AtomicU64,
    sample_rate: AtomicU64,
}

impl TimingState {
    pub fn new(bpm: f64, sample_rate: f64) -> Self {
        TimingState {
            bpm: AtomicU64::new(bpm.to_bits()),
            sample_rate: AtomicU64::new(sample_rate.to_bits()),
        }
    }

    pub fn set_bpm(&self, bpm: f64) {
        self.bpm.store(bpm.to_bits(), Ordering::Relaxed);
    }

    pub fn set_sample_rate(&self, sample_rate: f64) {
        self.sample_rate.store(sample_rate.to_bits(), Ordering::Relaxed);
    }

    pub fn bpm(&self) -> f64 {
        f64::from_bits(self.bpm.load(Ordering::Relaxed))
    }

    pub fn sample_rate(&self) -> f64 {
        f64::from_bits(self.sample_rate.load(Ordering::Relaxed))
    }
}

impl Default for TimingState {
    fn default() -> Self {
        TimingState::new(120.0, 44_100.0)
    }
}

// -- Shims --

#[no_mangle]
pub extern "C" fn cad_sin(x: f64) -> f64 {
    x.sin()
}

#[no_mangle]
pub extern "C" fn cad_cos(x: f64) -> f64 {
    x.cos()
}

#[no_mangle]
pub extern "C" fn cad_tan(x: f64) -> f64 {
    x.tan()
}

#[no_mangle]
pub extern "C" fn cad_sqrt(x: f64) -> f64 {
    x.sqrt()
}

#[no_mangle]
pub extern "C" fn cad_abs(x: f64) -> f64 {
    x.abs()
}

#[no_mangle]
pub extern "C" fn cad_floor(x: f64) -> f64 {
    x.floor()
}

#[no_mangle]
pub extern "C" fn cad_ceil(x: f64) -> f64 {
    x.ceil()
}

#[no_mangle]
pub extern "C" fn cad_round(x: f64) -> f64 {
    x.round()
}

#[no_mangle]
pub extern "C" fn cad_exp(x: f64) -> f64 {
    x.exp()
}

#[no_mangle]
pub extern "C" fn cad_ln(x: f64) -> f64 {
    x.ln()
}

#[no_mangle]
pub extern "C" fn cad_log2(x: f64) -> f64 {
    x.log2()
}

#[no_mangle]
pub extern "C" fn cad_log10(x: f64) -> f64 {
    x.log10()
}

#[no_mangle]
pub extern "C" fn cad_pow(base: f64, exp: f64) -> f64 {
    base.powf(exp)
}

#[no_mangle]
pub extern "C" fn cad_atan2(y: f64, x: f64) -> f64 {
    y.atan2(x)
}

#[no_mangle]
pub extern "C" fn cad_min(a: f64, b: f64) -> f64 {
    a.min(b)
}

#[no_mangle]
pub extern "C" fn cad_max(a: f64, b: f64) -> f64 {
    a.max(b)
}

#[no_mangle]
pub extern "C" fn cad_clamp(x: f64, lo: f64, hi: f64) -> f64 {
    x.max(lo).min(hi)
}

/// Linear interpolation: `a + (b - a) * t`.
#[no_mangle]
pub extern "C" fn cad_mix(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

thread_local! {
    static RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_entropy());
}

/// Uniform random value in `[-1, 1)`.
#[no_mangle]
pub extern "C" fn cad_rand() -> f64 {
    RNG.with(|rng| rng.borrow_mut().gen_range(-1.0..1.0))
}

/// One intrinsic table entry: symbol name, argument count, address.
struct Intrinsic {
    name: &'static str,
    arity: u32,
    addr: usize,
}

/// The fixed intrinsic table. Order is insignificant; names are the ABI.
fn table() -> [Intrinsic; 19] {
    macro_rules! entry {
        ($name:literal, $arity:literal, $f:expr) => {
            Intrinsic {
                name: $name,
                arity: $arity,
                addr: $f as usize,
            }
        };
    }
    [
        entry!("cad_sin", 1, cad_sin as extern "C" fn(f64) -> f64),
        entry!("cad_cos", 1, cad_cos as extern "C" fn(f64) -> f64),
        entry!("cad_tan", 1, cad_tan as extern "C" fn(f64) -> f64),
        entry!("cad_sqrt", 1, cad_sqrt as extern "C" fn(f64) -> f64),
        entry!("cad_abs", 1, cad_abs as extern "C" fn(f64) -> f64),
        entry!("cad_floor", 1, cad_floor as extern "C" fn(f64) -> f64),
        entry!("cad_ceil", 1, cad_ceil as extern "C" fn(f64) -> f64),
        entry!("cad_round", 1, cad_round as extern "C" fn(f64) -> f64),
        entry!("cad_exp", 1, cad_exp as extern "C" fn(f64) -> f64),
        entry!("cad_ln", 1, cad_ln as extern "C" fn(f64) -> f64),
        entry!("cad_log2", 1, cad_log2 as extern "C" fn(f64) -> f64),
        entry!("cad_log10", 1, cad_log10 as extern "C" fn(f64) -> f64),
        entry!("cad_pow", 2, cad_pow as extern "C" fn(f64, f64) -> f64),
        entry!("cad_atan2", 2, cad_atan2 as extern "C" fn(f64, f64) -> f64),
        entry!("cad_min", 2, cad_min as extern "C" fn(f64, f64) -> f64),
        entry!("cad_max", 2, cad_max as extern "C" fn(f64, f64) -> f64),
        entry!("cad_clamp", 3, cad_clamp as extern "C" fn(f64, f64, f64) -> f64),
        entry!("cad_mix", 3, cad_mix as extern "C" fn(f64, f64, f64) -> f64),
        entry!("cad_rand", 0, cad_rand as extern "C" fn() -> f64),
    ]
}

/// Map a DSL-level builtin name to its intrinsic symbol and arity.
///
/// `bpm` and `sampleRate` are handled separately by the code generator
/// (they are loads from the timing global, not calls).
pub fn lookup(name: &str) -> Option<(&'static str, u32)> {
    let symbol = match name {
        "sin" => "cad_sin",
        "cos" => "cad_cos",
        "tan" => "cad_tan",
        "sqrt" => "cad_sqrt",
        "abs" => "cad_abs",
        "floor" => "cad_floor",
        "ceil" => "cad_ceil",
        "round" => "cad_round",
        "exp" => "cad_exp",
        "ln" => "cad_ln",
        "log2" => "cad_log2",
        "log10" => "cad_log10",
        "pow" => "cad_pow",
        "atan2" => "cad_atan2",
        "min" => "cad_min",
        "max" => "cad_max",
        "clamp" => "cad_clamp",
        "mix" => "cad_mix",
        "rand" => "cad_rand",
        _ => return None,
    };
    table()
        .iter()
        .find(|i| i.name == symbol)
        .map(|i| (i.name, i.arity))
}

/// Declare an intrinsic in a module, creating the declaration on first
/// use.
pub fn declare<'ctx>(
    module: &Module<'ctx>,
    symbol: &str,
    arity: u32,
) -> inkwell::values::FunctionValue<'ctx> {
    if let Some(existing) = module.get_function(symbol) {
        return existing;
    }
    let context = module.get_context();
    let f64_ty = context.f64_type();
    let params: Vec<BasicMetadataTypeEnum> = (0..arity).map(|_| f64_ty.into()).collect();
    let fn_ty = f64_ty.fn_type(&params, false);
    module.add_function(symbol, fn_ty, Some(Linkage::External))
}

/// Declare the external timing global `{ f64, f64 }` in a module.
pub fn declare_timing<'ctx>(
    context: &'ctx Context,
    module: &Module<'ctx>,
) -> inkwell::values::GlobalValue<'ctx> {
    if let Some(existing) = module.get_global(TIMING_GLOBAL) {
        return existing;
    }
    let f64_ty = context.f64_type();
    let ty = context.struct_type(&[f64_ty.into(), f64_ty.into()], false);
    let global = module.add_global(ty, Some(AddressSpace::default()), TIMING_GLOBAL);
    global.set_linkage(Linkage::External);
    global
}

/// Field index of bpm within the timing global.
pub const TIMING_FIELD_BPM: u32 = 0;
/// Field index of the sample rate within the timing global.
pub const TIMING_FIELD_SAMPLE_RATE: u32 = 1;

/// Register every intrinsic the module declares with the execution
/// engine, plus the timing global.
///
/// # Panics
/// Panics if the module declares an intrinsic-looking symbol missing
/// from the table - that is a code generator bug.
pub fn map_into_engine<'ctx>(
    engine: &ExecutionEngine<'ctx>,
    module: &Module<'ctx>,
    timing: &TimingState,
) {
    for intrinsic in table() {
        if let Some(decl) = module.get_function(intrinsic.name) {
            engine.add_global_mapping(&decl, intrinsic.addr);
        }
    }
    if let Some(global) = module.get_global(TIMING_GLOBAL) {
        engine.add_global_mapping(&global, std::ptr::from_ref(timing) as usize);
    }
}
