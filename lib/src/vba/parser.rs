/*! Parser for the `dir` stream and module streams of a VBA project.

Read more about the format here:
 https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-ovba/575462ba-bf67-4190-9fac-c275523c75fc

The `dir` stream is walked as a flat sequence of `(id, size, data)` records.
Records that are not needed are skipped by their size, so projects written
by unusual producers (non-English locales, missing optional records) are
still understood.
*/
use nom::number::complete::{le_u16, le_u32};

// Record ids
const PROJECTCODEPAGE: u16 = 0x0003;
const PROJECTNAME: u16 = 0x0004;
const PROJECTVERSION: u16 = 0x0009;
const MODULENAME: u16 = 0x0019;
const MODULESTREAMNAME: u16 = 0x001A;
const MODULETYPE_PROCEDURAL: u16 = 0x0021;
const MODULETYPE_DOCUMENT: u16 = 0x0022;
const MODULETERMINATOR: u16 = 0x002B;
const MODULEOFFSET: u16 = 0x0031;
const MODULESTREAMNAMEUNICODE: u16 = 0x0032;
const MODULENAMEUNICODE: u16 = 0x0047;

/// Size of the data produced by a compressed chunk.
const CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleType {
    /// Standard module.
    Procedural,
    /// Document, class or designer module.
    Document,
    Unknown,
}

/// A module as described by the `dir` stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRecord {
    pub name: String,
    /// Name of the stream holding the module, relative to the VBA storage.
    pub stream_name: String,
    /// Offset of the compressed source within the module stream.
    pub text_offset: u32,
    pub module_type: ModuleType,
}

/// What the `dir` stream tells about a project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirInfo {
    pub project_name: String,
    pub code_page: u16,
    pub modules: Vec<ModuleRecord>,
}

impl DirInfo {
    /// Parses a decompressed `dir` stream.
    pub fn parse(dir_stream: &[u8]) -> Result<Self, &'static str> {
        let mut info = DirInfo::default();
        let mut module: Option<ModuleRecord> = None;
        let mut input = dir_stream;

        while !input.is_empty() {
            let (rest, id) = parse_u16(input)?;
            let (rest, size) = parse_u32(rest)?;

            // PROJECTVERSION is the only record whose size field doesn't
            // cover its data. The size is always 4, and it's followed by
            // a u32 major version and a u16 minor version.
            let size = if id == PROJECTVERSION { 6 } else { size as usize };
            let (rest, data) = parse_bytes(rest, size)?;
            input = rest;

            match id {
                PROJECTCODEPAGE => {
                    info.code_page = parse_u16(data)?.1;
                }
                PROJECTNAME => {
                    info.project_name = decode_mbcs(data);
                }
                MODULENAME => {
                    if let Some(unterminated) = module.take() {
                        info.modules.push(unterminated);
                    }
                    module = Some(ModuleRecord {
                        name: decode_mbcs(data),
                        stream_name: String::new(),
                        text_offset: 0,
                        module_type: ModuleType::Unknown,
                    });
                }
                MODULENAMEUNICODE => {
                    if let Some(module) = module.as_mut() {
                        module.name = decode_utf16(data);
                    }
                }
                MODULESTREAMNAME => {
                    if let Some(module) = module.as_mut() {
                        module.stream_name = decode_mbcs(data);
                    }
                }
                MODULESTREAMNAMEUNICODE => {
                    if let Some(module) = module.as_mut() {
                        module.stream_name = decode_utf16(data);
                    }
                }
                MODULEOFFSET => {
                    if let Some(module) = module.as_mut() {
                        module.text_offset = parse_u32(data)?.1;
                    }
                }
                MODULETYPE_PROCEDURAL => {
                    if let Some(module) = module.as_mut() {
                        module.module_type = ModuleType::Procedural;
                    }
                }
                MODULETYPE_DOCUMENT => {
                    if let Some(module) = module.as_mut() {
                        module.module_type = ModuleType::Document;
                    }
                }
                MODULETERMINATOR => {
                    if let Some(module) = module.take() {
                        info.modules.push(module);
                    }
                }
                _ => {}
            }
        }

        if let Some(unterminated) = module {
            info.modules.push(unterminated);
        }

        for module in info.modules.iter_mut() {
            if module.stream_name.is_empty() {
                module.stream_name = module.name.clone();
            }
        }

        if info.modules.is_empty() {
            return Err("No modules in dir stream");
        }

        Ok(info)
    }
}

impl ModuleRecord {
    /// Extracts the source code from the module stream. The decompressed
    /// source is limited to `limit` bytes.
    pub fn source(
        &self,
        module_stream: &[u8],
        limit: usize,
    ) -> Result<String, &'static str> {
        let compressed = module_stream
            .get(self.text_offset as usize..)
            .ok_or("Module offset beyond the end of the stream")?;
        let source = decompress_stream(compressed, limit)?;
        Ok(decode_mbcs(&source))
    }
}

fn copytoken_help(difference: usize) -> (u16, u16, u32) {
    // Number of bits needed for representing `difference - 1`, but never
    // less than 4.
    let bit_count =
        (usize::BITS - difference.saturating_sub(1).leading_zeros()).max(4);
    let length_mask = 0xFFFF_u16 >> bit_count;
    let offset_mask = !length_mask;

    (length_mask, offset_mask, bit_count)
}

/// Decompresses a buffer compressed with the MS-OVBA algorithm, failing if
/// the output grows beyond `limit` bytes.
pub fn decompress_stream(
    compressed: &[u8],
    limit: usize,
) -> Result<Vec<u8>, &'static str> {
    if compressed.is_empty() {
        return Err("Empty input buffer");
    }

    if compressed[0] != 0x01 {
        return Err("Invalid signature byte");
    }

    let mut decompressed = Vec::new();
    let mut current = 1; // Skip signature byte

    while current < compressed.len() {
        let chunk_start = current;

        // We need 2 bytes for the chunk header
        let (_, chunk_header) = parse_u16(&compressed[current..])
            .map_err(|_| "Incomplete chunk header")?;

        // The chunk size includes the header.
        let chunk_size = (chunk_header & 0x0FFF) as usize + 3;
        let chunk_is_compressed = (chunk_header & 0x8000) != 0;

        current += 2;

        if !chunk_is_compressed {
            if decompressed.len() + CHUNK_SIZE > limit {
                return Err("Decompressed data exceeds the limit");
            }
            let raw = compressed
                .get(current..current + CHUNK_SIZE)
                .ok_or("Incomplete uncompressed chunk")?;
            decompressed.extend_from_slice(raw);
            current += CHUNK_SIZE;
            continue;
        }

        let chunk_end =
            std::cmp::min(compressed.len(), chunk_start + chunk_size);
        let decompressed_chunk_start = decompressed.len();

        while current < chunk_end {
            let flag_byte = compressed[current];
            current += 1;

            for bit_index in 0..8 {
                if current >= chunk_end {
                    break;
                }

                let chunk_len = decompressed.len() - decompressed_chunk_start;

                if (flag_byte & (1 << bit_index)) == 0 {
                    if chunk_len >= CHUNK_SIZE {
                        return Err("Chunk decompresses to more than 4096 bytes");
                    }
                    decompressed.push(compressed[current]);
                    current += 1;
                    continue;
                }

                let (_, copy_token) = parse_u16(&compressed[current..])
                    .map_err(|_| "Incomplete copy token")?;
                let (length_mask, offset_mask, bit_count) =
                    copytoken_help(chunk_len);

                let length = (copy_token & length_mask) as usize + 3;
                let offset =
                    ((copy_token & offset_mask) >> (16 - bit_count)) as usize
                        + 1;

                if offset > chunk_len {
                    return Err("Invalid copy token offset");
                }
                if chunk_len + length > CHUNK_SIZE {
                    return Err("Chunk decompresses to more than 4096 bytes");
                }

                // Source and destination can overlap, so bytes are copied
                // one by one.
                let copy_source = decompressed.len() - offset;
                for i in 0..length {
                    decompressed.push(decompressed[copy_source + i]);
                }
                current += 2;
            }
        }

        if decompressed.len() > limit {
            return Err("Decompressed data exceeds the limit");
        }
    }

    Ok(decompressed)
}

fn parse_u16(input: &[u8]) -> Result<(&[u8], u16), &'static str> {
    le_u16::<&[u8], nom::error::Error<&[u8]>>(input)
        .map_err(|_nom_err| "Failed to parse u16")
}

fn parse_u32(input: &[u8]) -> Result<(&[u8], u32), &'static str> {
    le_u32::<&[u8], nom::error::Error<&[u8]>>(input)
        .map_err(|_nom_err| "Failed to parse u32")
}

fn parse_bytes(
    input: &[u8],
    len: usize,
) -> Result<(&[u8], &[u8]), &'static str> {
    if input.len() < len {
        Err("Not enough bytes to parse the requested slice")
    } else {
        Ok((&input[len..], &input[..len]))
    }
}

/// Decodes text stored in the project's code page. Only ASCII matters for
/// detection, other bytes are mapped one to one.
fn decode_mbcs(data: &[u8]) -> String {
    data.iter().map(|b| *b as char).collect()
}

fn decode_utf16(data: &[u8]) -> String {
    crate::models::decode_utf16_lossy(data)
}
