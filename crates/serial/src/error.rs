//! Error taxonomy.
//!
//! Structural problems (bad magic, truncated chunks, out-of-range offsets)
//! abort the whole operation and surface as [`SerialError`]. Semantic
//! problems (a type or property that no longer exists, a lost enum option)
//! are reported through [`ErrorReporter`] and the operation continues with
//! best-effort defaults.

use std::sync::Mutex;

use membuf::BufferError;
use rtti::StringId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SerialError {
    #[error("bad magic {found:#010x}, expected {expected:#010x}")]
    BadMagic { found: u32, expected: u32 },

    #[error("unsupported file version {0}")]
    UnsupportedVersion(u32),

    #[error("truncated file: need {need} bytes, have {have}")]
    Truncated { need: u64, have: u64 },

    #[error("chunk {chunk} out of bounds: offset {offset}, {count} entries in {len} byte file")]
    ChunkOutOfBounds {
        chunk: &'static str,
        offset: u32,
        count: u32,
        len: u64,
    },

    #[error("chunk {chunk} checksum mismatch")]
    ChunkChecksum { chunk: &'static str },

    #[error("reference index {index} out of range for {what} table of {len}")]
    BadReference {
        what: &'static str,
        index: u64,
        len: usize,
    },

    #[error("object payload underrun: need {need} bytes, {have} left")]
    PayloadUnderrun { need: u64, have: u64 },

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("table overflow: more than {limit} {what} entries")]
    TableOverflow { what: &'static str, limit: u32 },

    #[error("opcode stream allocation failed (page budget exhausted)")]
    StreamOutOfMemory,

    #[error("serialization writer failed; stream is incomplete")]
    WriterFailed,

    #[error("referenced buffer {crc:#018x} is missing from the file")]
    MissingBuffer { crc: u64 },

    #[error("no root object in file")]
    NoRootObject,

    #[error("unsupported format for this operation")]
    UnsupportedFormat,

    #[error("text parse error: {0}")]
    TextParse(String),

    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sink for recoverable, per-value errors. Loading never aborts on these;
/// the reporter is the place they become visible.
pub trait ErrorReporter: Send + Sync {
    fn report_type_missing(&self, context: &str, type_name: StringId);
    fn report_class_not_creatable(&self, context: &str, class_name: StringId);
    fn report_property_missing(&self, context: &str, class_name: StringId, property: StringId);
    fn report_property_type_changed(
        &self,
        context: &str,
        class_name: StringId,
        property: StringId,
        old_type: StringId,
        new_type: StringId,
    );
    fn report_enum_option_missing(&self, context: &str, enum_name: StringId, option: StringId);
    fn report_bitfield_flag_missing(&self, context: &str, bitfield_name: StringId, flag: StringId);
    fn report_resource_class_missing(&self, context: &str, class_name: StringId);
    fn report_guid_parse_failure(&self, context: &str, text: &str);
    fn report_array_overflow(&self, context: &str, count: u32, capacity: u32);
    fn report_duplicate_import(&self, context: &str, guid: &str);
    fn report_text_error(&self, context: &str, line: u64, message: &str);
}

/// Discards every report.
pub struct NullErrorReporter;

impl ErrorReporter for NullErrorReporter {
    fn report_type_missing(&self, _: &str, _: StringId) {}
    fn report_class_not_creatable(&self, _: &str, _: StringId) {}
    fn report_property_missing(&self, _: &str, _: StringId, _: StringId) {}
    fn report_property_type_changed(&self, _: &str, _: StringId, _: StringId, _: StringId, _: StringId) {
    }
    fn report_enum_option_missing(&self, _: &str, _: StringId, _: StringId) {}
    fn report_bitfield_flag_missing(&self, _: &str, _: StringId, _: StringId) {}
    fn report_resource_class_missing(&self, _: &str, _: StringId) {}
    fn report_guid_parse_failure(&self, _: &str, _: &str) {}
    fn report_array_overflow(&self, _: &str, _: u32, _: u32) {}
    fn report_duplicate_import(&self, _: &str, _: &str) {}
    fn report_text_error(&self, _: &str, _: u64, _: &str) {}
}

/// One recorded semantic error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReportedError {
    TypeMissing { type_name: StringId },
    ClassNotCreatable { class_name: StringId },
    PropertyMissing { class_name: StringId, property: StringId },
    PropertyTypeChanged {
        class_name: StringId,
        property: StringId,
        old_type: StringId,
        new_type: StringId,
    },
    EnumOptionMissing { enum_name: StringId, option: StringId },
    BitfieldFlagMissing { bitfield_name: StringId, flag: StringId },
    ResourceClassMissing { class_name: StringId },
    GuidParseFailure { text: String },
    ArrayOverflow { count: u32, capacity: u32 },
    DuplicateImport { guid: String },
    Text { line: u64, message: String },
}

/// Keeps every report; used by tests and tooling that present errors.
#[derive(Default)]
pub struct CollectingErrorReporter {
    errors: Mutex<Vec<ReportedError>>,
}

impl CollectingErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn errors(&self) -> Vec<ReportedError> {
        self.errors.lock().expect("reporter lock poisoned").clone()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.lock().expect("reporter lock poisoned").is_empty()
    }

    fn push(&self, error: ReportedError) {
        self.errors.lock().expect("reporter lock poisoned").push(error);
    }
}

impl ErrorReporter for CollectingErrorReporter {
    fn report_type_missing(&self, _: &str, type_name: StringId) {
        self.push(ReportedError::TypeMissing { type_name });
    }

    fn report_class_not_creatable(&self, _: &str, class_name: StringId) {
        self.push(ReportedError::ClassNotCreatable { class_name });
    }

    fn report_property_missing(&self, _: &str, class_name: StringId, property: StringId) {
        self.push(ReportedError::PropertyMissing { class_name, property });
    }

    fn report_property_type_changed(
        &self,
        _: &str,
        class_name: StringId,
        property: StringId,
        old_type: StringId,
        new_type: StringId,
    ) {
        self.push(ReportedError::PropertyTypeChanged {
            class_name,
            property,
            old_type,
            new_type,
        });
    }

    fn report_enum_option_missing(&self, _: &str, enum_name: StringId, option: StringId) {
        self.push(ReportedError::EnumOptionMissing { enum_name, option });
    }

    fn report_bitfield_flag_missing(&self, _: &str, bitfield_name: StringId, flag: StringId) {
        self.push(ReportedError::BitfieldFlagMissing { bitfield_name, flag });
    }

    fn report_resource_class_missing(&self, _: &str, class_name: StringId) {
        self.push(ReportedError::ResourceClassMissing { class_name });
    }

    fn report_guid_parse_failure(&self, _: &str, text: &str) {
        self.push(ReportedError::GuidParseFailure { text: text.to_string() });
    }

    fn report_array_overflow(&self, _: &str, count: u32, capacity: u32) {
        self.push(ReportedError::ArrayOverflow { count, capacity });
    }

    fn report_duplicate_import(&self, _: &str, guid: &str) {
        self.push(ReportedError::DuplicateImport { guid: guid.to_string() });
    }

    fn report_text_error(&self, _: &str, line: u64, message: &str) {
        self.push(ReportedError::Text {
            line,
            message: message.to_string(),
        });
    }
}
