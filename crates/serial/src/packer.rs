//! Opcode-to-payload lowering.
//!
//! Packed object payloads are tagless: the packer rewrites every reference
//! into its table index (adaptive-encoded), drops the structural markers
//! the reader recovers from the type system, and resolves skip distances.
//! Nested skip blocks pack into scratch buffers so each header can carry
//! the smallest of the 1/2/4-byte distance encodings.

use std::collections::HashMap;

use membuf::Buffer;
use rtti::{ResourceId, ResourceKey, StringId};

use crate::adaptive::write_adaptive;
use crate::error::SerialError;
use crate::stream::{Op, OpcodeStream};
use crate::writer::PropertyKey;

/// Table indices assigned to every collected reference, keyed by the forms
/// the opcodes carry.
#[derive(Default)]
pub struct MappedReferences {
    pub names: HashMap<StringId, u32>,
    pub types: HashMap<StringId, u32>,
    pub properties: HashMap<PropertyKey, u32>,
    /// 1-based; 0 encodes a null resource.
    pub imports: HashMap<ResourceKey, u32>,
    /// 1-based export indices by object instance id; 0 encodes null.
    pub objects: HashMap<u64, u32>,
}

impl MappedReferences {
    fn name_index(&self, name: StringId) -> u64 {
        if name.is_empty() {
            return 0;
        }
        u64::from(*self.names.get(&name).expect("name collected during write"))
    }

    fn type_index(&self, type_name: StringId) -> u64 {
        if type_name.is_empty() {
            return 0;
        }
        u64::from(*self.types.get(&type_name).expect("type collected during write"))
    }
}

/// Buffer payload modes inside a packed `DataInlineBuffer`.
pub const BUFFER_MODE_NULL: u8 = 0;
pub const BUFFER_MODE_INLINE: u8 = 1;
pub const BUFFER_MODE_TABLE: u8 = 2;

/// Packs one object's opcode stream into its payload byte form.
pub fn pack_stream(
    stream: &OpcodeStream,
    mapped: &MappedReferences,
) -> Result<Vec<u8>, SerialError> {
    // scratch stack: one buffer per open skip block, innermost on top
    let mut outputs: Vec<Vec<u8>> = vec![Vec::new()];

    for op in stream.ops() {
        match op {
            Op::SkipHeader => outputs.push(Vec::new()),
            Op::SkipLabel => {
                let block = outputs.pop().expect("skip label without header");
                let out = outputs
                    .last_mut()
                    .ok_or_else(|| SerialError::MalformedPayload("unbalanced skip label".into()))?;
                write_skip_frame(out, &block);
            }
            op => {
                let out = outputs.last_mut().expect("output stack never empty");
                match op {
                    Op::Nop => {}
                    // compound framing is implicit: the property list
                    // terminator below carries the structure
                    Op::Compound { .. } => {}
                    Op::CompoundEnd => write_adaptive(out, 0),
                    Op::Array { count } => write_adaptive(out, u64::from(count)),
                    Op::ArrayEnd => {}
                    Op::Property { class, name, type_name } => {
                        let key = PropertyKey { class, name, type_name };
                        let index = *mapped
                            .properties
                            .get(&key)
                            .expect("property collected during write");
                        write_adaptive(out, u64::from(index));
                    }
                    Op::DataAdaptiveNumber { value } => write_adaptive(out, u64::from(value)),
                    Op::DataBlock { data } => out.extend_from_slice(data),
                    Op::DataTypeRef { type_name } => {
                        let index = mapped.type_index(type_name);
                        write_adaptive(out, index);
                    }
                    Op::DataName { name } => {
                        let index = mapped.name_index(name);
                        write_adaptive(out, index);
                    }
                    Op::DataObjectPointer { object_id, .. } => {
                        // weak targets outside the strong closure fall back
                        // to null
                        let index = mapped.objects.get(&object_id).copied().unwrap_or(0);
                        write_adaptive(out, u64::from(index));
                    }
                    Op::DataResourceRef { guid, class } => {
                        let id = ResourceId::from_bytes(guid);
                        let index = if id.is_nil() {
                            0
                        } else {
                            let key = ResourceKey::new(id, class);
                            mapped.imports.get(&key).copied().unwrap_or(0)
                        };
                        write_adaptive(out, u64::from(index));
                    }
                    Op::DataInlineBuffer { slot } => {
                        let slot = stream.buffer_slot(slot).ok_or_else(|| {
                            SerialError::MalformedPayload("missing buffer slot".into())
                        })?;
                        pack_buffer_slot(
                            out,
                            slot.data.as_ref(),
                            slot.loader.as_ref().map(|l| l.crc()),
                        );
                    }
                    Op::DataAsyncFileBuffer => {
                        return Err(SerialError::MalformedPayload(
                            "reserved opcode in stream".into(),
                        ))
                    }
                    Op::SkipHeader | Op::SkipLabel => unreachable!("handled above"),
                }
            }
        }
    }

    if outputs.len() != 1 {
        return Err(SerialError::MalformedPayload(
            "unterminated skip block".into(),
        ));
    }
    Ok(outputs.pop().expect("output stack never empty"))
}

fn pack_buffer_slot(out: &mut Vec<u8>, data: Option<&Buffer>, loader_crc: Option<u64>) {
    if let Some(crc) = loader_crc {
        out.push(BUFFER_MODE_TABLE);
        out.extend_from_slice(&crc.to_le_bytes());
    } else if let Some(buffer) = data.filter(|b| !b.is_empty()) {
        out.push(BUFFER_MODE_INLINE);
        write_adaptive(out, buffer.len() as u64);
        out.extend_from_slice(buffer.data());
    } else {
        out.push(BUFFER_MODE_NULL);
    }
}

/// Emits a skip frame: the distance from after the header to after the
/// framed bytes, in the smallest of the 1/2/4-byte encodings.
fn write_skip_frame(out: &mut Vec<u8>, block: &[u8]) {
    let distance = block.len() as u64;
    if distance <= u8::MAX as u64 {
        out.push(1);
        out.push(distance as u8);
    } else if distance <= u16::MAX as u64 {
        out.push(2);
        out.extend_from_slice(&(distance as u16).to_le_bytes());
    } else {
        out.push(4);
        out.extend_from_slice(&(distance as u32).to_le_bytes());
    }
    out.extend_from_slice(block);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::PagePool;

    fn mapped_with_name(name: &str, index: u32) -> MappedReferences {
        let mut mapped = MappedReferences::default();
        mapped.names.insert(StringId::intern(name), index);
        mapped
    }

    #[test]
    fn test_pack_names_as_indices() {
        let mut stream = OpcodeStream::new(PagePool::new(None));
        stream.emit_name(StringId::intern("packer.option"));
        stream.emit_name(StringId::EMPTY);

        let mapped = mapped_with_name("packer.option", 7);
        let packed = pack_stream(&stream, &mapped).unwrap();
        assert_eq!(packed, [7, 0]);
    }

    #[test]
    fn test_pack_skip_frames() {
        let mut stream = OpcodeStream::new(PagePool::new(None));
        stream.emit_skip_header();
        stream.emit_data(&[0xAA, 0xBB]);
        stream.emit_skip_label();

        let packed = pack_stream(&stream, &MappedReferences::default()).unwrap();
        // width 1, distance 2, then the framed bytes
        assert_eq!(packed, [1, 2, 0xAA, 0xBB]);
    }

    #[test]
    fn test_pack_nested_skip_frames() {
        let mut stream = OpcodeStream::new(PagePool::new(None));
        stream.emit_skip_header();
        stream.emit_data(&[0x11]);
        stream.emit_skip_header();
        stream.emit_data(&[0x22]);
        stream.emit_skip_label();
        stream.emit_skip_label();

        let packed = pack_stream(&stream, &MappedReferences::default()).unwrap();
        // outer frame covers: 0x11 + inner frame (1, 1, 0x22)
        assert_eq!(packed, [1, 5, 0x11, 1, 1, 0x22]);
    }

    #[test]
    fn test_pack_wide_skip_frame() {
        let mut stream = OpcodeStream::new(PagePool::new(None));
        stream.emit_skip_header();
        stream.emit_data(&vec![0u8; 300]);
        stream.emit_skip_label();

        let packed = pack_stream(&stream, &MappedReferences::default()).unwrap();
        assert_eq!(packed[0], 2);
        assert_eq!(u16::from_le_bytes([packed[1], packed[2]]), 300);
        assert_eq!(packed.len(), 3 + 300);
    }

    #[test]
    fn test_unterminated_skip_block_fails() {
        let mut stream = OpcodeStream::new(PagePool::new(None));
        stream.emit_skip_header();
        stream.emit_data(&[1]);
        assert!(pack_stream(&stream, &MappedReferences::default()).is_err());
    }

    #[test]
    fn test_unmapped_weak_pointer_packs_null() {
        let mut stream = OpcodeStream::new(PagePool::new(None));
        stream.emit_object_pointer(12345, false);

        let packed = pack_stream(&stream, &MappedReferences::default()).unwrap();
        assert_eq!(packed, [0]);
    }

    #[test]
    fn test_compound_packs_to_terminator_only() {
        let mut stream = OpcodeStream::new(PagePool::new(None));
        stream.emit_compound(StringId::intern("packer.Compound"));
        stream.emit_compound_end();

        let packed = pack_stream(&stream, &MappedReferences::default()).unwrap();
        assert_eq!(packed, [0]);
    }
}
