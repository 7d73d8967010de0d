//! Binary file tables.
//!
//! The packed file opens with a fixed header and seven indexed chunks
//! (strings, names, types, properties, imports, exports, buffers) followed
//! by the object payload region and the buffer region. All integers are
//! little-endian; every offset is measured from the file base so files can
//! be embedded at non-zero positions inside larger containers.

use bytes::{Buf, BufMut};

use crate::error::SerialError;

pub const FILE_MAGIC: u32 = u32::from_le_bytes(*b"OGRF");
/// Versions this implementation can read.
pub const FILE_VERSION_MIN: u32 = 1;
pub const FILE_VERSION_MAX: u32 = 2;
/// Version written by this implementation.
pub const FILE_VERSION_CURRENT: u32 = 2;
/// First version with an import table; older files degrade resources to
/// null.
pub const VERSION_IMPORT_TABLE: u32 = 2;

/// Header flag bit 0: buffers are delivered out of band, the buffer region
/// is absent and every buffer row has `data_offset == 0`.
pub const FLAG_EXTRACTED_BUFFERS: u32 = 1;

pub const CHUNK_COUNT: usize = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum ChunkType {
    Strings = 0,
    Names = 1,
    Types = 2,
    Properties = 3,
    Imports = 4,
    Exports = 5,
    Buffers = 6,
}

impl ChunkType {
    pub const ALL: [ChunkType; CHUNK_COUNT] = [
        ChunkType::Strings,
        ChunkType::Names,
        ChunkType::Types,
        ChunkType::Properties,
        ChunkType::Imports,
        ChunkType::Exports,
        ChunkType::Buffers,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ChunkType::Strings => "strings",
            ChunkType::Names => "names",
            ChunkType::Types => "types",
            ChunkType::Properties => "properties",
            ChunkType::Imports => "imports",
            ChunkType::Exports => "exports",
            ChunkType::Buffers => "buffers",
        }
    }

    /// Bytes per row; strings are a raw pool counted in bytes.
    pub fn row_size(&self) -> usize {
        match self {
            ChunkType::Strings => 1,
            ChunkType::Names => 4,
            ChunkType::Types => 2,
            ChunkType::Properties => 6,
            ChunkType::Imports => 18,
            ChunkType::Exports => 18,
            ChunkType::Buffers => 25,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChunkInfo {
    pub offset: u32,
    pub count: u32,
    pub crc: u32,
}

/// Fixed-layout file header: magic, version, flags, the chunk directory
/// and the three region terminators.
#[derive(Clone, Debug, Default)]
pub struct FileHeader {
    pub magic: u32,
    pub version: u32,
    pub flags: u32,
    pub chunks: [ChunkInfo; CHUNK_COUNT],
    pub headers_end: u32,
    pub objects_end: u32,
    pub buffers_end: u32,
}

pub const HEADER_SIZE: usize = 12 + CHUNK_COUNT * 12 + 12;

impl FileHeader {
    pub fn chunk(&self, chunk: ChunkType) -> &ChunkInfo {
        &self.chunks[chunk as usize]
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.put_u32_le(self.magic);
        out.put_u32_le(self.version);
        out.put_u32_le(self.flags);
        for chunk in &self.chunks {
            out.put_u32_le(chunk.offset);
            out.put_u32_le(chunk.count);
            out.put_u32_le(chunk.crc);
        }
        out.put_u32_le(self.headers_end);
        out.put_u32_le(self.objects_end);
        out.put_u32_le(self.buffers_end);
    }

    pub fn read_from(mut data: &[u8]) -> Result<FileHeader, SerialError> {
        if data.len() < HEADER_SIZE {
            return Err(SerialError::Truncated {
                need: HEADER_SIZE as u64,
                have: data.len() as u64,
            });
        }
        let mut header = FileHeader {
            magic: data.get_u32_le(),
            version: data.get_u32_le(),
            flags: data.get_u32_le(),
            ..FileHeader::default()
        };
        for chunk in header.chunks.iter_mut() {
            chunk.offset = data.get_u32_le();
            chunk.count = data.get_u32_le();
            chunk.crc = data.get_u32_le();
        }
        header.headers_end = data.get_u32_le();
        header.objects_end = data.get_u32_le();
        header.buffers_end = data.get_u32_le();
        Ok(header)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExportRow {
    pub class_type: u16,
    /// Bit 0 marks a root object.
    pub flags: u32,
    pub data_offset: u32,
    pub data_size: u32,
    pub crc: u32,
}

pub const EXPORT_FLAG_ROOT: u32 = 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImportRow {
    pub class_type: u16,
    pub guid: [u8; 16],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferRow {
    pub crc: u64,
    pub compression: u8,
    pub compressed_size: u32,
    pub uncompressed_size: u64,
    pub data_offset: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PropertyRow {
    pub class_type: u16,
    pub name: u16,
    pub type_index: u16,
}

/// Parsed and bounds-validated view over a serialized file.
pub struct FileTables<'a> {
    data: &'a [u8],
    header: FileHeader,
}

impl<'a> FileTables<'a> {
    /// Parses and fully validates the header: magic, version window, chunk
    /// bounds, region ordering and chunk checksums. A file that fails here
    /// is rejected before anything else looks at it.
    pub fn parse(data: &'a [u8]) -> Result<FileTables<'a>, SerialError> {
        let header = FileHeader::read_from(data)?;
        if header.magic != FILE_MAGIC {
            return Err(SerialError::BadMagic {
                found: header.magic,
                expected: FILE_MAGIC,
            });
        }
        if header.version < FILE_VERSION_MIN || header.version > FILE_VERSION_MAX {
            return Err(SerialError::UnsupportedVersion(header.version));
        }

        let len = data.len() as u64;
        for chunk_type in ChunkType::ALL {
            let chunk = header.chunk(chunk_type);
            let bytes = chunk.count as u64 * chunk_type.row_size() as u64;
            let end = chunk.offset as u64 + bytes;
            if end > len {
                return Err(SerialError::ChunkOutOfBounds {
                    chunk: chunk_type.name(),
                    offset: chunk.offset,
                    count: chunk.count,
                    len,
                });
            }
            let chunk_data = &data[chunk.offset as usize..end as usize];
            if crc32c::crc32c(chunk_data) != chunk.crc {
                return Err(SerialError::ChunkChecksum {
                    chunk: chunk_type.name(),
                });
            }
        }

        if header.headers_end as u64 > len
            || header.headers_end > header.objects_end
            || header.objects_end > header.buffers_end
        {
            return Err(SerialError::Truncated {
                need: header.objects_end as u64,
                have: len,
            });
        }
        // the buffer region is allowed to be missing only in extracted mode
        if header.flags & FLAG_EXTRACTED_BUFFERS == 0 && header.buffers_end as u64 > len {
            return Err(SerialError::Truncated {
                need: header.buffers_end as u64,
                have: len,
            });
        }

        let tables = FileTables { data, header };
        tables.validate_rows()?;
        Ok(tables)
    }

    fn validate_rows(&self) -> Result<(), SerialError> {
        let names = self.header.chunk(ChunkType::Names).count;
        let types = self.header.chunk(ChunkType::Types).count;
        let strings_len = self.header.chunk(ChunkType::Strings).count;

        for i in 0..names {
            if self.name_row(i) >= strings_len {
                return Err(SerialError::BadReference {
                    what: "strings",
                    index: self.name_row(i) as u64,
                    len: strings_len as usize,
                });
            }
        }
        for i in 0..types {
            if u32::from(self.type_row(i)) >= names {
                return Err(SerialError::BadReference {
                    what: "names",
                    index: self.type_row(i) as u64,
                    len: names as usize,
                });
            }
        }
        for i in 0..self.header.chunk(ChunkType::Properties).count {
            let row = self.property_row(i);
            if u32::from(row.class_type) >= types
                || u32::from(row.name) >= names
                || u32::from(row.type_index) >= types
            {
                return Err(SerialError::BadReference {
                    what: "types",
                    index: i as u64,
                    len: types as usize,
                });
            }
        }

        let objects_start = self.header.headers_end as u64;
        let objects_end = self.header.objects_end as u64;
        for i in 0..self.header.chunk(ChunkType::Exports).count {
            let row = self.export_row(i);
            let start = row.data_offset as u64;
            let end = start + row.data_size as u64;
            if start < objects_start || end > objects_end {
                return Err(SerialError::ChunkOutOfBounds {
                    chunk: "exports",
                    offset: row.data_offset,
                    count: row.data_size,
                    len: objects_end,
                });
            }
            if u32::from(row.class_type) >= types {
                return Err(SerialError::BadReference {
                    what: "types",
                    index: row.class_type as u64,
                    len: types as usize,
                });
            }
        }

        if self.header.flags & FLAG_EXTRACTED_BUFFERS == 0 {
            let buffers_end = self.header.buffers_end as u64;
            for i in 0..self.header.chunk(ChunkType::Buffers).count {
                let row = self.buffer_row(i);
                let start = row.data_offset as u64;
                let end = start + row.compressed_size as u64;
                if start < objects_end || end > buffers_end {
                    return Err(SerialError::ChunkOutOfBounds {
                        chunk: "buffers",
                        offset: row.data_offset,
                        count: row.compressed_size,
                        len: buffers_end,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn chunk_count(&self, chunk: ChunkType) -> u32 {
        self.header.chunk(chunk).count
    }

    fn chunk_data(&self, chunk: ChunkType) -> &'a [u8] {
        let info = self.header.chunk(chunk);
        let bytes = info.count as usize * chunk.row_size();
        &self.data[info.offset as usize..info.offset as usize + bytes]
    }

    /// NUL-terminated string at `offset` inside the string pool.
    pub fn string_at(&self, offset: u32) -> &'a str {
        let pool = self.chunk_data(ChunkType::Strings);
        let start = offset as usize;
        let end = pool[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| start + p)
            .unwrap_or(pool.len());
        std::str::from_utf8(&pool[start..end]).unwrap_or("")
    }

    pub fn name_row(&self, index: u32) -> u32 {
        let mut data = &self.chunk_data(ChunkType::Names)[index as usize * 4..];
        data.get_u32_le()
    }

    pub fn type_row(&self, index: u32) -> u16 {
        let mut data = &self.chunk_data(ChunkType::Types)[index as usize * 2..];
        data.get_u16_le()
    }

    pub fn property_row(&self, index: u32) -> PropertyRow {
        let mut data = &self.chunk_data(ChunkType::Properties)[index as usize * 6..];
        PropertyRow {
            class_type: data.get_u16_le(),
            name: data.get_u16_le(),
            type_index: data.get_u16_le(),
        }
    }

    pub fn import_row(&self, index: u32) -> ImportRow {
        let mut data = &self.chunk_data(ChunkType::Imports)[index as usize * 18..];
        let class_type = data.get_u16_le();
        let mut guid = [0u8; 16];
        data.copy_to_slice(&mut guid);
        ImportRow { class_type, guid }
    }

    pub fn export_row(&self, index: u32) -> ExportRow {
        let mut data = &self.chunk_data(ChunkType::Exports)[index as usize * 18..];
        ExportRow {
            class_type: data.get_u16_le(),
            flags: data.get_u32_le(),
            data_offset: data.get_u32_le(),
            data_size: data.get_u32_le(),
            crc: data.get_u32_le(),
        }
    }

    pub fn buffer_row(&self, index: u32) -> BufferRow {
        let mut data = &self.chunk_data(ChunkType::Buffers)[index as usize * 25..];
        BufferRow {
            crc: data.get_u64_le(),
            compression: data.get_u8(),
            compressed_size: data.get_u32_le(),
            uncompressed_size: data.get_u64_le(),
            data_offset: data.get_u32_le(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut header = FileHeader {
            magic: FILE_MAGIC,
            version: FILE_VERSION_CURRENT,
            flags: FLAG_EXTRACTED_BUFFERS,
            headers_end: 200,
            objects_end: 300,
            buffers_end: 300,
            ..FileHeader::default()
        };
        header.chunks[ChunkType::Exports as usize] = ChunkInfo {
            offset: 108,
            count: 2,
            crc: 0xAABB,
        };

        let mut out = Vec::new();
        header.write_to(&mut out);
        assert_eq!(out.len(), HEADER_SIZE);

        let parsed = FileHeader::read_from(&out).unwrap();
        assert_eq!(parsed.magic, FILE_MAGIC);
        assert_eq!(parsed.chunk(ChunkType::Exports).count, 2);
        assert_eq!(parsed.buffers_end, 300);
    }

    #[test]
    fn test_truncated_header_rejected() {
        let data = vec![0u8; HEADER_SIZE - 1];
        assert!(matches!(
            FileHeader::read_from(&data),
            Err(SerialError::Truncated { .. })
        ));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut header = FileHeader {
            magic: 0x12345678,
            version: FILE_VERSION_CURRENT,
            ..FileHeader::default()
        };
        header.headers_end = HEADER_SIZE as u32;
        header.objects_end = HEADER_SIZE as u32;
        header.buffers_end = HEADER_SIZE as u32;

        let mut out = Vec::new();
        header.write_to(&mut out);
        assert!(matches!(
            FileTables::parse(&out),
            Err(SerialError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_version_window() {
        for (version, ok) in [(0u32, false), (1, true), (2, true), (3, false)] {
            let header = FileHeader {
                magic: FILE_MAGIC,
                version,
                headers_end: HEADER_SIZE as u32,
                objects_end: HEADER_SIZE as u32,
                buffers_end: HEADER_SIZE as u32,
                ..FileHeader::default()
            };
            let mut out = Vec::new();
            header.write_to(&mut out);
            let result = FileTables::parse(&out);
            assert_eq!(result.is_ok(), ok, "version {version}");
        }
    }

    #[test]
    fn test_chunk_out_of_bounds_rejected() {
        let mut header = FileHeader {
            magic: FILE_MAGIC,
            version: FILE_VERSION_CURRENT,
            headers_end: HEADER_SIZE as u32,
            objects_end: HEADER_SIZE as u32,
            buffers_end: HEADER_SIZE as u32,
            ..FileHeader::default()
        };
        header.chunks[ChunkType::Names as usize] = ChunkInfo {
            offset: 1000,
            count: 10,
            crc: 0,
        };
        let mut out = Vec::new();
        header.write_to(&mut out);
        assert!(matches!(
            FileTables::parse(&out),
            Err(SerialError::ChunkOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_chunk_checksum_verified() {
        let mut header = FileHeader {
            magic: FILE_MAGIC,
            version: FILE_VERSION_CURRENT,
            ..FileHeader::default()
        };
        header.chunks[ChunkType::Strings as usize] = ChunkInfo {
            offset: HEADER_SIZE as u32,
            count: 4,
            crc: 0xBAD,
        };
        header.headers_end = HEADER_SIZE as u32 + 4;
        header.objects_end = header.headers_end;
        header.buffers_end = header.headers_end;

        let mut out = Vec::new();
        header.write_to(&mut out);
        out.extend_from_slice(b"abc\0");
        assert!(matches!(
            FileTables::parse(&out),
            Err(SerialError::ChunkChecksum { .. })
        ));
    }
}
