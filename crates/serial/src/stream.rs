//! The serialization opcode stream.
//!
//! Writers do not produce file bytes directly; they append fixed-layout
//! opcode records into paged storage and the binary packer lowers the
//! record sequence into the packed payload later. Every record's length is
//! recoverable from its tag (plus the in-record size field for data
//! blocks), which is what keeps iteration a single linear walk. `NextPage`
//! is the only record that moves the read position to a non-adjacent
//! address.

use membuf::{AsyncBufferRef, Buffer};
use rtti::StringId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpcodeTag {
    Nop = 0,
    Compound = 1,
    CompoundEnd = 2,
    Array = 3,
    ArrayEnd = 4,
    Property = 5,
    SkipHeader = 6,
    SkipLabel = 7,
    DataAdaptiveNumber = 8,
    DataBlock1 = 9,
    DataBlock2 = 10,
    DataBlock4 = 11,
    DataTypeRef = 12,
    DataName = 13,
    DataInlineBuffer = 14,
    DataObjectPointer = 15,
    DataResourceRef = 16,
    /// Reserved for a future out-of-line form; never emitted today.
    DataAsyncFileBuffer = 17,
    NextPage = 18,
}

impl OpcodeTag {
    fn from_u8(value: u8) -> Option<OpcodeTag> {
        if value <= OpcodeTag::NextPage as u8 {
            // SAFETY: repr(u8) with contiguous discriminants 0..=18
            Some(unsafe { std::mem::transmute::<u8, OpcodeTag>(value) })
        } else {
            None
        }
    }
}

/// Non-POD payload of one `DataInlineBuffer` record; the stream owns these
/// in a side table so records stay fixed-size.
#[derive(Clone)]
pub struct InlineBufferSlot {
    pub data: Option<Buffer>,
    pub loader: Option<AsyncBufferRef>,
}

/// A decoded opcode, borrowed out of the stream.
#[derive(Clone, Debug)]
pub enum Op<'a> {
    Nop,
    Compound { type_name: StringId },
    CompoundEnd,
    Array { count: u32 },
    ArrayEnd,
    Property {
        class: StringId,
        name: StringId,
        type_name: StringId,
    },
    SkipHeader,
    SkipLabel,
    DataAdaptiveNumber { value: u32 },
    DataBlock { data: &'a [u8] },
    DataTypeRef { type_name: StringId },
    DataName { name: StringId },
    DataInlineBuffer { slot: u32 },
    DataObjectPointer { object_id: u64, strong: bool },
    DataResourceRef { guid: [u8; 16], class: StringId },
    DataAsyncFileBuffer,
}

/// Page source for opcode streams. An exhausted byte budget makes every
/// later allocation fail, which the stream turns into its sticky
/// out-of-memory state.
pub struct PagePool {
    page_size: usize,
    budget: Option<usize>,
    allocated: usize,
}

pub const DEFAULT_OPCODE_PAGE_SIZE: usize = 8192;

/// Tail bytes kept free in every page so the `NextPage` link always fits.
const PAGE_RESERVE: usize = 8;

impl PagePool {
    pub fn new(budget: Option<usize>) -> PagePool {
        PagePool {
            page_size: DEFAULT_OPCODE_PAGE_SIZE,
            budget,
            allocated: 0,
        }
    }

    pub fn with_page_size(page_size: usize, budget: Option<usize>) -> PagePool {
        PagePool {
            page_size,
            budget,
            allocated: 0,
        }
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    fn alloc_page(&mut self, required: usize) -> Option<Vec<u8>> {
        let size = (required.max(self.page_size)).next_power_of_two();
        if let Some(budget) = self.budget {
            if self.allocated + size > budget {
                return None;
            }
        }
        self.allocated += size;
        Some(Vec::with_capacity(size))
    }
}

/// Append-only opcode storage.
pub struct OpcodeStream {
    pages: Vec<Vec<u8>>,
    buffers: Vec<InlineBufferSlot>,
    pool: PagePool,
    out_of_memory: bool,
    total_ops: u64,
}

impl OpcodeStream {
    pub fn new(pool: PagePool) -> OpcodeStream {
        let mut stream = OpcodeStream {
            pages: Vec::new(),
            buffers: Vec::new(),
            pool,
            out_of_memory: false,
            total_ops: 0,
        };
        // first page is eager so emission never starts on empty storage
        if let Some(page) = stream.pool.alloc_page(0) {
            stream.pages.push(page);
        } else {
            stream.out_of_memory = true;
        }
        stream
    }

    /// Sticky: once a page allocation fails every later emit fails too.
    pub fn out_of_memory(&self) -> bool {
        self.out_of_memory
    }

    pub fn total_ops(&self) -> u64 {
        self.total_ops
    }

    pub fn buffer_slot(&self, index: u32) -> Option<&InlineBufferSlot> {
        self.buffers.get(index as usize)
    }

    fn ensure_room(&mut self, bytes: usize) -> bool {
        if self.out_of_memory {
            return false;
        }
        let page = self.pages.last().expect("stream always has a page");
        if page.len() + bytes <= page.capacity().saturating_sub(PAGE_RESERVE) {
            return true;
        }

        let Some(new_page) = self.pool.alloc_page(bytes + PAGE_RESERVE) else {
            self.out_of_memory = true;
            return false;
        };

        let next_index = self.pages.len() as u32;
        let page = self.pages.last_mut().expect("stream always has a page");
        page.push(OpcodeTag::NextPage as u8);
        page.extend_from_slice(&next_index.to_le_bytes());
        self.pages.push(new_page);
        true
    }

    fn emit(&mut self, tag: OpcodeTag, payload: &[u8]) -> bool {
        if !self.ensure_room(1 + payload.len()) {
            return false;
        }
        let page = self.pages.last_mut().expect("stream always has a page");
        page.push(tag as u8);
        page.extend_from_slice(payload);
        self.total_ops += 1;
        true
    }

    pub fn emit_nop(&mut self) -> bool {
        self.emit(OpcodeTag::Nop, &[])
    }

    pub fn emit_compound(&mut self, type_name: StringId) -> bool {
        self.emit(OpcodeTag::Compound, &type_name.index().to_le_bytes())
    }

    pub fn emit_compound_end(&mut self) -> bool {
        self.emit(OpcodeTag::CompoundEnd, &[])
    }

    pub fn emit_array(&mut self, count: u32) -> bool {
        self.emit(OpcodeTag::Array, &count.to_le_bytes())
    }

    pub fn emit_array_end(&mut self) -> bool {
        self.emit(OpcodeTag::ArrayEnd, &[])
    }

    pub fn emit_property(&mut self, class: StringId, name: StringId, type_name: StringId) -> bool {
        let mut payload = [0u8; 12];
        payload[0..4].copy_from_slice(&class.index().to_le_bytes());
        payload[4..8].copy_from_slice(&name.index().to_le_bytes());
        payload[8..12].copy_from_slice(&type_name.index().to_le_bytes());
        self.emit(OpcodeTag::Property, &payload)
    }

    pub fn emit_skip_header(&mut self) -> bool {
        self.emit(OpcodeTag::SkipHeader, &[])
    }

    pub fn emit_skip_label(&mut self) -> bool {
        self.emit(OpcodeTag::SkipLabel, &[])
    }

    pub fn emit_adaptive_number(&mut self, value: u32) -> bool {
        self.emit(OpcodeTag::DataAdaptiveNumber, &value.to_le_bytes())
    }

    /// Raw data block; the record kind follows the payload size.
    pub fn emit_data(&mut self, data: &[u8]) -> bool {
        if data.len() <= u8::MAX as usize {
            if !self.ensure_room(2 + data.len()) {
                return false;
            }
            let page = self.pages.last_mut().expect("stream always has a page");
            page.push(OpcodeTag::DataBlock1 as u8);
            page.push(data.len() as u8);
            page.extend_from_slice(data);
        } else if data.len() <= u16::MAX as usize {
            if !self.ensure_room(3 + data.len()) {
                return false;
            }
            let page = self.pages.last_mut().expect("stream always has a page");
            page.push(OpcodeTag::DataBlock2 as u8);
            page.extend_from_slice(&(data.len() as u16).to_le_bytes());
            page.extend_from_slice(data);
        } else {
            if !self.ensure_room(5 + data.len()) {
                return false;
            }
            let page = self.pages.last_mut().expect("stream always has a page");
            page.push(OpcodeTag::DataBlock4 as u8);
            page.extend_from_slice(&(data.len() as u32).to_le_bytes());
            page.extend_from_slice(data);
        }
        self.total_ops += 1;
        true
    }

    pub fn emit_type_ref(&mut self, type_name: StringId) -> bool {
        self.emit(OpcodeTag::DataTypeRef, &type_name.index().to_le_bytes())
    }

    pub fn emit_name(&mut self, name: StringId) -> bool {
        self.emit(OpcodeTag::DataName, &name.index().to_le_bytes())
    }

    pub fn emit_inline_buffer(&mut self, slot: InlineBufferSlot) -> bool {
        let index = self.buffers.len() as u32;
        if !self.emit(OpcodeTag::DataInlineBuffer, &index.to_le_bytes()) {
            return false;
        }
        self.buffers.push(slot);
        true
    }

    pub fn emit_object_pointer(&mut self, object_id: u64, strong: bool) -> bool {
        let mut payload = [0u8; 9];
        payload[0..8].copy_from_slice(&object_id.to_le_bytes());
        payload[8] = strong as u8;
        self.emit(OpcodeTag::DataObjectPointer, &payload)
    }

    pub fn emit_resource_ref(&mut self, guid: [u8; 16], class: StringId) -> bool {
        let mut payload = [0u8; 20];
        payload[0..16].copy_from_slice(&guid);
        payload[16..20].copy_from_slice(&class.index().to_le_bytes());
        self.emit(OpcodeTag::DataResourceRef, &payload)
    }

    pub fn ops(&self) -> StreamIterator<'_> {
        StreamIterator {
            stream: self,
            page: 0,
            pos: 0,
        }
    }
}

/// Linear opcode walk; page links are followed transparently.
pub struct StreamIterator<'a> {
    stream: &'a OpcodeStream,
    page: usize,
    pos: usize,
}

impl<'a> Iterator for StreamIterator<'a> {
    type Item = Op<'a>;

    fn next(&mut self) -> Option<Op<'a>> {
        loop {
            let page = self.stream.pages.get(self.page)?;
            if self.pos >= page.len() {
                // end of written data only ever happens on the last page
                return None;
            }
            let tag = OpcodeTag::from_u8(page[self.pos])?;
            let body = &page[self.pos + 1..];
            match tag {
                OpcodeTag::NextPage => {
                    let next = u32::from_le_bytes(body[0..4].try_into().unwrap()) as usize;
                    self.page = next;
                    self.pos = 0;
                }
                OpcodeTag::Nop => {
                    self.pos += 1;
                    return Some(Op::Nop);
                }
                OpcodeTag::Compound => {
                    let index = u32::from_le_bytes(body[0..4].try_into().unwrap());
                    self.pos += 5;
                    return Some(Op::Compound {
                        type_name: StringId::from_index(index),
                    });
                }
                OpcodeTag::CompoundEnd => {
                    self.pos += 1;
                    return Some(Op::CompoundEnd);
                }
                OpcodeTag::Array => {
                    let count = u32::from_le_bytes(body[0..4].try_into().unwrap());
                    self.pos += 5;
                    return Some(Op::Array { count });
                }
                OpcodeTag::ArrayEnd => {
                    self.pos += 1;
                    return Some(Op::ArrayEnd);
                }
                OpcodeTag::Property => {
                    let class = u32::from_le_bytes(body[0..4].try_into().unwrap());
                    let name = u32::from_le_bytes(body[4..8].try_into().unwrap());
                    let ty = u32::from_le_bytes(body[8..12].try_into().unwrap());
                    self.pos += 13;
                    return Some(Op::Property {
                        class: StringId::from_index(class),
                        name: StringId::from_index(name),
                        type_name: StringId::from_index(ty),
                    });
                }
                OpcodeTag::SkipHeader => {
                    self.pos += 1;
                    return Some(Op::SkipHeader);
                }
                OpcodeTag::SkipLabel => {
                    self.pos += 1;
                    return Some(Op::SkipLabel);
                }
                OpcodeTag::DataAdaptiveNumber => {
                    let value = u32::from_le_bytes(body[0..4].try_into().unwrap());
                    self.pos += 5;
                    return Some(Op::DataAdaptiveNumber { value });
                }
                OpcodeTag::DataBlock1 => {
                    let size = body[0] as usize;
                    let data = &body[1..1 + size];
                    self.pos += 2 + size;
                    return Some(Op::DataBlock { data });
                }
                OpcodeTag::DataBlock2 => {
                    let size = u16::from_le_bytes(body[0..2].try_into().unwrap()) as usize;
                    let data = &body[2..2 + size];
                    self.pos += 3 + size;
                    return Some(Op::DataBlock { data });
                }
                OpcodeTag::DataBlock4 => {
                    let size = u32::from_le_bytes(body[0..4].try_into().unwrap()) as usize;
                    let data = &body[4..4 + size];
                    self.pos += 5 + size;
                    return Some(Op::DataBlock { data });
                }
                OpcodeTag::DataTypeRef => {
                    let index = u32::from_le_bytes(body[0..4].try_into().unwrap());
                    self.pos += 5;
                    return Some(Op::DataTypeRef {
                        type_name: StringId::from_index(index),
                    });
                }
                OpcodeTag::DataName => {
                    let index = u32::from_le_bytes(body[0..4].try_into().unwrap());
                    self.pos += 5;
                    return Some(Op::DataName {
                        name: StringId::from_index(index),
                    });
                }
                OpcodeTag::DataInlineBuffer => {
                    let slot = u32::from_le_bytes(body[0..4].try_into().unwrap());
                    self.pos += 5;
                    return Some(Op::DataInlineBuffer { slot });
                }
                OpcodeTag::DataObjectPointer => {
                    let object_id = u64::from_le_bytes(body[0..8].try_into().unwrap());
                    let strong = body[8] != 0;
                    self.pos += 10;
                    return Some(Op::DataObjectPointer { object_id, strong });
                }
                OpcodeTag::DataResourceRef => {
                    let guid: [u8; 16] = body[0..16].try_into().unwrap();
                    let class = u32::from_le_bytes(body[16..20].try_into().unwrap());
                    self.pos += 21;
                    return Some(Op::DataResourceRef {
                        guid,
                        class: StringId::from_index(class),
                    });
                }
                OpcodeTag::DataAsyncFileBuffer => {
                    self.pos += 1;
                    return Some(Op::DataAsyncFileBuffer);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_tags(stream: &OpcodeStream) -> Vec<String> {
        stream
            .ops()
            .map(|op| format!("{op:?}").split_whitespace().next().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_emit_and_iterate() {
        let mut stream = OpcodeStream::new(PagePool::new(None));
        assert!(stream.emit_compound(StringId::intern("test.StreamType")));
        assert!(stream.emit_property(
            StringId::intern("test.StreamType"),
            StringId::intern("x"),
            StringId::intern("f32"),
        ));
        assert!(stream.emit_data(&[1, 2, 3, 4]));
        assert!(stream.emit_compound_end());

        let ops: Vec<_> = stream.ops().collect();
        assert_eq!(ops.len(), 4);
        match &ops[1] {
            Op::Property { name, .. } => assert_eq!(name.as_str(), "x"),
            other => panic!("unexpected {other:?}"),
        }
        match &ops[2] {
            Op::DataBlock { data } => assert_eq!(*data, &[1, 2, 3, 4]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_data_block_sizes() {
        let mut stream = OpcodeStream::new(PagePool::new(None));
        stream.emit_data(&[0u8; 10]);
        stream.emit_data(&vec![0u8; 300]);
        stream.emit_data(&vec![0u8; 70_000]);

        let sizes: Vec<usize> = stream
            .ops()
            .map(|op| match op {
                Op::DataBlock { data } => data.len(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(sizes, [10, 300, 70_000]);
    }

    #[test]
    fn test_page_links_are_transparent() {
        let mut stream =
            OpcodeStream::new(PagePool::with_page_size(64, None));
        for i in 0..100u32 {
            assert!(stream.emit_adaptive_number(i));
        }
        assert!(stream.pages.len() > 1);

        let values: Vec<u32> = stream
            .ops()
            .map(|op| match op {
                Op::DataAdaptiveNumber { value } => value,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(values, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_out_of_memory_is_sticky() {
        let mut stream = OpcodeStream::new(PagePool::with_page_size(64, Some(64)));
        let mut wrote = 0;
        while stream.emit_adaptive_number(wrote) {
            wrote += 1;
        }
        assert!(stream.out_of_memory());
        assert!(wrote > 0);
        // every later emit keeps failing
        assert!(!stream.emit_nop());
        assert!(!stream.emit_data(&[1]));
    }

    #[test]
    fn test_inline_buffer_side_table() {
        let mut stream = OpcodeStream::new(PagePool::new(None));
        stream.emit_inline_buffer(InlineBufferSlot {
            data: Some(Buffer::from_slice(b"abc")),
            loader: None,
        });
        let ops = collect_tags(&stream);
        assert_eq!(ops.len(), 1);
        let slot = stream.buffer_slot(0).unwrap();
        assert_eq!(slot.data.as_ref().unwrap().data(), b"abc");
    }

    #[test]
    fn test_large_block_gets_own_page() {
        let mut stream = OpcodeStream::new(PagePool::with_page_size(64, None));
        let big = vec![7u8; 1000];
        assert!(stream.emit_data(&big));
        match stream.ops().next().unwrap() {
            Op::DataBlock { data } => assert_eq!(data, &big[..]),
            other => panic!("unexpected {other:?}"),
        }
    }
}
