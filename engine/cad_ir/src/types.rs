//! The value/type model shared by the code generator and the host.
//!
//! `VarType` describes the logical type of a value group or control;
//! its concrete memory layout is derived deterministically in `cad_llvm`.
//! All values of a given form share an identical layout.

use std::fmt;

use smallvec::SmallVec;

/// Logical type of a runtime value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VarType {
    /// Stereo numeric pair plus form tag.
    Num,
    /// A fixed-capacity queue of MIDI events.
    Midi,
    /// Heterogeneous fixed product.
    Tuple(Vec<VarType>),
    /// Homogeneous fixed-length repetition.
    Array(Box<VarType>, usize),
}

impl VarType {
    /// Array element count used for extractor controls.
    pub const EXTRACT_SLOTS: usize = 8;

    /// Type of an audio extractor control (`num[]`).
    pub fn num_extract() -> VarType {
        VarType::Array(Box::new(VarType::Num), Self::EXTRACT_SLOTS)
    }

    /// Type of a MIDI extractor control (`midi[]`).
    pub fn midi_extract() -> VarType {
        VarType::Array(Box::new(VarType::Midi), Self::EXTRACT_SLOTS)
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarType::Num => write!(f, "num"),
            VarType::Midi => write!(f, "midi"),
            VarType::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            VarType::Array(elem, n) => write!(f, "{elem}[{n}]"),
        }
    }
}

/// Compile-time-selectable unit tag carried by every `num` value.
///
/// The discriminant is the byte stored in the value's third field; the
/// numbering is part of the host ABI and must not be reordered.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum FormTag {
    #[default]
    None = 0,
    Osc = 1,
    Note = 2,
    Freq = 3,
    Beats = 4,
    Secs = 5,
    Samples = 6,
    Db = 7,
    Q = 8,
    Deg = 9,
}

impl FormTag {
    /// All tags, in ABI order.
    pub const ALL: [FormTag; 10] = [
        FormTag::None,
        FormTag::Osc,
        FormTag::Note,
        FormTag::Freq,
        FormTag::Beats,
        FormTag::Secs,
        FormTag::Samples,
        FormTag::Db,
        FormTag::Q,
        FormTag::Deg,
    ];

    /// Parse a form name as it appears after `->` in source.
    pub fn from_name(name: &str) -> Option<FormTag> {
        Some(match name {
            "none" => FormTag::None,
            "osc" => FormTag::Osc,
            "note" => FormTag::Note,
            "freq" => FormTag::Freq,
            "beats" => FormTag::Beats,
            "secs" => FormTag::Secs,
            "samples" => FormTag::Samples,
            "db" => FormTag::Db,
            "q" => FormTag::Q,
            "deg" => FormTag::Deg,
            _ => return None,
        })
    }

    /// Source-level name of the form.
    pub fn name(self) -> &'static str {
        match self {
            FormTag::None => "none",
            FormTag::Osc => "osc",
            FormTag::Note => "note",
            FormTag::Freq => "freq",
            FormTag::Beats => "beats",
            FormTag::Secs => "secs",
            FormTag::Samples => "samples",
            FormTag::Db => "db",
            FormTag::Q => "q",
            FormTag::Deg => "deg",
        }
    }
}

impl fmt::Display for FormTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A form with its compile-time parameters.
///
/// A custom node type is parameterized by a `Form`; the parameter list is
/// fixed at codegen time, which fixes the parameter struct's layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Form {
    pub tag: FormTag,
    pub params: SmallVec<[f64; 2]>,
}

impl Form {
    /// Form with no parameters.
    pub fn plain(tag: FormTag) -> Self {
        Form {
            tag,
            params: SmallVec::new(),
        }
    }
}

impl Default for Form {
    fn default() -> Self {
        Form::plain(FormTag::None)
    }
}

/// Compile-time literal, used as a socket's default value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstantValue {
    Num {
        left: f64,
        right: f64,
        form: FormTag,
    },
    Tuple(Vec<ConstantValue>),
}

impl ConstantValue {
    /// A mono constant: both channels carry the same value.
    pub fn mono(value: f64, form: FormTag) -> Self {
        ConstantValue::Num {
            left: value,
            right: value,
            form,
        }
    }

    /// The `VarType` this constant inhabits.
    pub fn var_type(&self) -> VarType {
        match self {
            ConstantValue::Num { .. } => VarType::Num,
            ConstantValue::Tuple(items) => {
                VarType::Tuple(items.iter().map(ConstantValue::var_type).collect())
            }
        }
    }
}

/// Kind byte of a MIDI event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MidiEventKind {
    NoteOn = 0,
    NoteOff = 1,
    PolyAftertouch = 2,
    ChannelAftertouch = 3,
}

/// One MIDI event inside a `midi` value.
///
/// Layout mirrors the generated `{ i32, i8, i8, i8, i8 }` struct.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct MidiEvent {
    pub ticks: u32,
    pub kind: MidiEventKind,
    pub channel: u8,
    pub note: u8,
    pub param: u8,
}

/// Fixed capacity of a `midi` value's event queue.
pub const MIDI_EVENT_CAPACITY: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_tag_roundtrip() {
        for tag in FormTag::ALL {
            assert_eq!(FormTag::from_name(tag.name()), Some(tag));
        }
        assert_eq!(FormTag::from_name("hz"), None);
    }

    #[test]
    fn test_form_tag_abi_stability() {
        // Discriminants are part of the host ABI.
        assert_eq!(FormTag::None as u8, 0);
        assert_eq!(FormTag::Freq as u8, 3);
        assert_eq!(FormTag::Deg as u8, 9);
    }

    #[test]
    fn test_var_type_display() {
        let t = VarType::Tuple(vec![VarType::Num, VarType::Midi]);
        assert_eq!(t.to_string(), "(num, midi)");
        assert_eq!(VarType::num_extract().to_string(), "num[8]");
    }

    #[test]
    fn test_constant_value_type() {
        let c = ConstantValue::Tuple(vec![
            ConstantValue::mono(1.0, FormTag::None),
            ConstantValue::mono(440.0, FormTag::Freq),
        ]);
        assert_eq!(
            c.var_type(),
            VarType::Tuple(vec![VarType::Num, VarType::Num])
        );
    }

    #[test]
    fn test_midi_event_size() {
        // Must stay in sync with the generated { i32, i8, i8, i8, i8 } layout.
        assert_eq!(std::mem::size_of::<MidiEvent>(), 8);
    }
}
