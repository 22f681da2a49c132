//! Memory layout of runtime values.
//!
//! Every `VarType`/`Form` combination maps to one concrete LLVM type with
//! a fixed, deterministic field order. Cross-module pointer arithmetic
//! (parent surfaces reaching into child contexts) depends on independent
//! recompilations of the same source producing the identical layout, so
//! nothing here may consult anything but the type shape itself.
//!
//! Host-visible byte offsets are derived from the JIT target machine's
//! `TargetData`, never hand-computed.

use inkwell::context::Context;
use inkwell::types::{BasicType, BasicTypeEnum, StructType};

use cad_ir::{ControlType, VarType, MIDI_EVENT_CAPACITY};

/// Size in bytes of the per-control scratch area exposed to the host as
/// the `data` pointer (scope capture, extract bookkeeping).
pub const CONTROL_DATA_BYTES: u32 = 64;

/// Field index of a control storage's value section.
pub const CONTROL_FIELD_VALUE: u32 = 0;
/// Field index of a control storage's scratch data section.
pub const CONTROL_FIELD_DATA: u32 = 1;
/// Field index of a control storage's shared word.
pub const CONTROL_FIELD_SHARED: u32 = 2;
/// Field index of a control storage's ui word.
pub const CONTROL_FIELD_UI: u32 = 3;

/// The `{ f64, f64, i8 }` layout of a `num` value: left and right
/// channels plus the form tag byte.
pub fn num_type(context: &Context) -> StructType<'_> {
    let f64_ty = context.f64_type();
    context.struct_type(
        &[f64_ty.into(), f64_ty.into(), context.i8_type().into()],
        false,
    )
}

/// The `{ i32, i8, i8, i8, i8 }` layout of one MIDI event.
pub fn midi_event_type(context: &Context) -> StructType<'_> {
    let i8_ty = context.i8_type();
    context.struct_type(
        &[
            context.i32_type().into(),
            i8_ty.into(),
            i8_ty.into(),
            i8_ty.into(),
            i8_ty.into(),
        ],
        false,
    )
}

/// The `{ i8, [16 x event] }` layout of a `midi` value.
pub fn midi_type(context: &Context) -> StructType<'_> {
    let events = midi_event_type(context).array_type(MIDI_EVENT_CAPACITY as u32);
    context.struct_type(&[context.i8_type().into(), events.into()], false)
}

/// Concrete layout for a value of the given logical type.
pub fn value_type<'ctx>(context: &'ctx Context, var_type: &VarType) -> BasicTypeEnum<'ctx> {
    match var_type {
        VarType::Num => num_type(context).into(),
        VarType::Midi => midi_type(context).into(),
        VarType::Tuple(items) => {
            let fields: Vec<BasicTypeEnum<'ctx>> = items
                .iter()
                .map(|item| value_type(context, item))
                .collect();
            context.struct_type(&fields, false).into()
        }
        VarType::Array(elem, n) => {
            let elem_ty = value_type(context, elem);
            elem_ty.array_type(*n as u32).into()
        }
    }
}

/// Storage layout for one control: the value itself plus the three
/// host-visible sections returned by `getControlPtrs`.
///
/// `{ value, [64 x i8] data, i64 shared, i64 ui }`
pub fn control_storage_type(context: &Context, control_type: ControlType) -> StructType<'_> {
    let value = value_type(context, &control_type.var_type());
    context.struct_type(
        &[
            value,
            context.i8_type().array_type(CONTROL_DATA_BYTES).into(),
            context.i64_type().into(),
            context.i64_type().into(),
        ],
        false,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use cad_ir::FormTag;

    #[test]
    fn test_num_layout_shape() {
        let context = Context::create();
        let ty = num_type(&context);
        assert_eq!(ty.count_fields(), 3);
        assert!(ty.get_field_type_at_index(0).unwrap().is_float_type());
        assert!(ty.get_field_type_at_index(2).unwrap().is_int_type());
    }

    #[test]
    fn test_midi_layout_shape() {
        let context = Context::create();
        let ty = midi_type(&context);
        assert_eq!(ty.count_fields(), 2);
        let events = ty.get_field_type_at_index(1).unwrap().into_array_type();
        assert_eq!(events.len(), MIDI_EVENT_CAPACITY as u32);
    }

    #[test]
    fn test_layout_is_deterministic() {
        // Two independent derivations of the same shape must agree.
        let context = Context::create();
        let shape = VarType::Tuple(vec![VarType::Num, VarType::Midi, VarType::num_extract()]);
        let a = value_type(&context, &shape);
        let b = value_type(&context, &shape);
        assert_eq!(a, b);
    }

    #[test]
    fn test_control_storage_has_four_sections() {
        let context = Context::create();
        for control_type in [
            ControlType::Audio,
            ControlType::Midi,
            ControlType::Scope,
            ControlType::AudioExtract,
            ControlType::MidiExtract,
        ] {
            let ty = control_storage_type(&context, control_type);
            assert_eq!(ty.count_fields(), 4);
        }
    }

    #[test]
    fn test_form_tag_fits_layout_byte() {
        // The form tag is stored in the i8 third field of a num value.
        for tag in FormTag::ALL {
            assert!((tag as u8) < 128);
        }
    }
}
