//! Control descriptors produced by block compilation.
//!
//! A control is the externally visible surface of a compiled script. The
//! compiler records, per control, whether the script ever writes or reads
//! it; the graph builder uses the flags to decide wiring.

use std::fmt;

use crate::types::VarType;

/// Type of a declared control.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ControlType {
    /// `name:num` — a stereo audio/CV value.
    Audio,
    /// `name:midi` — a MIDI event queue.
    Midi,
    /// `name:scope` — an oscilloscope probe.
    Scope,
    /// `name:num[]` — a polyphonic audio extractor.
    AudioExtract,
    /// `name:midi[]` — a polyphonic MIDI extractor.
    MidiExtract,
}

impl ControlType {
    /// The value type stored for a control of this type.
    pub fn var_type(self) -> VarType {
        match self {
            ControlType::Audio | ControlType::Scope => VarType::Num,
            ControlType::Midi => VarType::Midi,
            ControlType::AudioExtract => VarType::num_extract(),
            ControlType::MidiExtract => VarType::midi_extract(),
        }
    }

    /// True for the polyphonic extractor types.
    #[inline]
    pub fn is_extractor(self) -> bool {
        matches!(self, ControlType::AudioExtract | ControlType::MidiExtract)
    }

    /// Source-level spelling of the declaration suffix.
    pub fn describe(self) -> &'static str {
        match self {
            ControlType::Audio => "num",
            ControlType::Midi => "midi",
            ControlType::Scope => "scope",
            ControlType::AudioExtract => "num[]",
            ControlType::MidiExtract => "midi[]",
        }
    }
}

impl fmt::Display for ControlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// One control exposed by a compiled block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRef {
    pub name: String,
    pub control_type: ControlType,
    /// The script assigns to this control somewhere.
    pub written: bool,
    /// The script reads this control's value somewhere.
    pub read: bool,
}

impl ControlRef {
    pub fn new(name: impl Into<String>, control_type: ControlType) -> Self {
        ControlRef {
            name: name.into(),
            control_type,
            written: false,
            read: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_var_types() {
        assert_eq!(ControlType::Audio.var_type(), VarType::Num);
        assert_eq!(ControlType::Midi.var_type(), VarType::Midi);
        assert_eq!(ControlType::AudioExtract.var_type(), VarType::num_extract());
    }

    #[test]
    fn test_extractor_flag() {
        assert!(ControlType::AudioExtract.is_extractor());
        assert!(ControlType::MidiExtract.is_extractor());
        assert!(!ControlType::Scope.is_extractor());
    }

    #[test]
    fn test_new_control_flags_clear() {
        let c = ControlRef::new("out", ControlType::Audio);
        assert!(!c.written);
        assert!(!c.read);
    }
}
