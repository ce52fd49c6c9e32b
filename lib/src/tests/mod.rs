/*! Builders for the synthetic documents used in tests.

Nothing here is meant to produce files Office would open. They only need to
be faithful enough to the formats for exercising the scanner.
*/
use std::collections::BTreeMap;
use std::io::{Cursor, Write};

use zip::write::SimpleFileOptions;

pub(crate) const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">
  <Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>
  <Default Extension="xml" ContentType="application/xml"/>
  <Override PartName="/word/document.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml"/>
</Types>"#;

pub(crate) const PACKAGE_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
  <Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="word/document.xml"/>
</Relationships>"#;

pub(crate) const DOCUMENT_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>Quarterly report</w:t></w:r></w:p>
  </w:body>
</w:document>"#;

/// Creates a deflated ZIP archive with the given parts.
pub(crate) fn create_container(parts: &[(&str, &[u8])]) -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buffer);
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        for (name, data) in parts {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }

        zip.finish().unwrap();
    }
    buffer.into_inner()
}

/// Creates a minimal, benign word processing document with an extra set of
/// parts.
pub(crate) fn create_docx(extra: &[(&str, &[u8])]) -> Vec<u8> {
    let mut parts: Vec<(&str, &[u8])> = vec![
        ("[Content_Types].xml", CONTENT_TYPES.as_bytes()),
        ("_rels/.rels", PACKAGE_RELS.as_bytes()),
        ("word/document.xml", DOCUMENT_XML.as_bytes()),
    ];
    parts.extend_from_slice(extra);
    create_container(&parts)
}

/// Overwrites the uncompressed size declared by every central directory
/// entry.
pub(crate) fn patch_declared_sizes(zip: &mut [u8], size: u32) {
    const CENTRAL_DIRECTORY_SIGNATURE: &[u8] = b"PK\x01\x02";
    let mut pos = 0;
    while let Some(found) =
        memchr::memmem::find(&zip[pos..], CENTRAL_DIRECTORY_SIGNATURE)
    {
        let entry = pos + found;
        zip[entry + 24..entry + 28].copy_from_slice(&size.to_le_bytes());
        pos = entry + 4;
    }
}

const SECTOR_SIZE: usize = 512;
const MINI_SECTOR_SIZE: usize = 64;
const MINI_STREAM_CUTOFF: usize = 4096;
const ENDOFCHAIN: u32 = 0xFFFFFFFE;
const FREESECT: u32 = 0xFFFFFFFF;
const FATSECT: u32 = 0xFFFFFFFD;
const NOSTREAM: u32 = 0xFFFFFFFF;

/// Writes version 3 compound files.
///
/// Storages are created from the paths of the streams. Siblings are linked
/// through their right pointer only, which is a valid (if unbalanced)
/// tree.
#[derive(Default)]
pub(crate) struct CfbBuilder {
    streams: BTreeMap<String, Vec<u8>>,
}

enum Node {
    Storage { name: String, children: Vec<usize> },
    Stream { name: String, data: Vec<u8> },
}

impl CfbBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a stream. `path` uses `/` as separator.
    pub fn stream(mut self, path: &str, data: &[u8]) -> Self {
        self.streams.insert(path.to_string(), data.to_vec());
        self
    }

    pub fn build(&self) -> Vec<u8> {
        // Build the tree, the root is node 0.
        let mut nodes = vec![Node::Storage {
            name: "Root Entry".to_string(),
            children: vec![],
        }];

        for (path, data) in &self.streams {
            let mut parent = 0;
            let components = path.split('/').collect::<Vec<_>>();
            let (stream_name, storages) = components.split_last().unwrap();

            for storage in storages {
                let existing = match &nodes[parent] {
                    Node::Storage { children, .. } => {
                        children.iter().copied().find(|c| {
                            matches!(&nodes[*c], Node::Storage { name, .. } if name == storage)
                        })
                    }
                    Node::Stream { .. } => unreachable!(),
                };
                parent = match existing {
                    Some(id) => id,
                    None => {
                        nodes.push(Node::Storage {
                            name: storage.to_string(),
                            children: vec![],
                        });
                        let id = nodes.len() - 1;
                        add_child(&mut nodes, parent, id);
                        id
                    }
                };
            }

            nodes.push(Node::Stream {
                name: stream_name.to_string(),
                data: data.clone(),
            });
            let id = nodes.len() - 1;
            add_child(&mut nodes, parent, id);
        }

        // Lay out stream data. Small streams go to the mini stream.
        let mut mini_stream = Vec::new();
        let mut mini_fat: Vec<u32> = Vec::new();
        let mut big_streams: Vec<(usize, &[u8])> = Vec::new();
        let mut starts = vec![ENDOFCHAIN; nodes.len()];

        for (id, node) in nodes.iter().enumerate() {
            let Node::Stream { data, .. } = node else { continue };
            if data.is_empty() {
                continue;
            }
            if data.len() < MINI_STREAM_CUTOFF {
                let first = (mini_stream.len() / MINI_SECTOR_SIZE) as u32;
                let count = data.len().div_ceil(MINI_SECTOR_SIZE);
                starts[id] = first;
                for i in 0..count as u32 {
                    mini_fat.push(if i + 1 == count as u32 {
                        ENDOFCHAIN
                    } else {
                        first + i + 1
                    });
                }
                mini_stream.extend_from_slice(data);
                pad(&mut mini_stream, MINI_SECTOR_SIZE);
            } else {
                big_streams.push((id, data.as_slice()));
            }
        }

        let dir_sectors = nodes.len().div_ceil(SECTOR_SIZE / 128);
        let mini_fat_sectors = (mini_fat.len() * 4).div_ceil(SECTOR_SIZE);
        let mini_stream_sectors = mini_stream.len().div_ceil(SECTOR_SIZE);
        let big_sectors: usize = big_streams
            .iter()
            .map(|(_, data)| data.len().div_ceil(SECTOR_SIZE))
            .sum();

        let others =
            dir_sectors + mini_fat_sectors + mini_stream_sectors + big_sectors;
        let mut fat_sectors = 1;
        while fat_sectors * (SECTOR_SIZE / 4) < fat_sectors + others {
            fat_sectors += 1;
        }
        assert!(fat_sectors <= 109);

        let mut fat = vec![FATSECT; fat_sectors];
        let chain = |fat: &mut Vec<u32>, count: usize| -> u32 {
            if count == 0 {
                return ENDOFCHAIN;
            }
            let first = fat.len() as u32;
            for i in 0..count as u32 {
                fat.push(if i + 1 == count as u32 {
                    ENDOFCHAIN
                } else {
                    first + i + 1
                });
            }
            first
        };

        let first_dir = chain(&mut fat, dir_sectors);
        let first_mini_fat = chain(&mut fat, mini_fat_sectors);
        let first_mini_stream = chain(&mut fat, mini_stream_sectors);
        for (id, data) in &big_streams {
            starts[*id] = chain(&mut fat, data.len().div_ceil(SECTOR_SIZE));
        }
        fat.resize(fat_sectors * SECTOR_SIZE / 4, FREESECT);

        // Header
        let mut out = Vec::new();
        out.extend_from_slice(&[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1]);
        out.extend_from_slice(&[0; 16]);
        out.extend_from_slice(&0x3E_u16.to_le_bytes());
        out.extend_from_slice(&3_u16.to_le_bytes());
        out.extend_from_slice(&0xFFFE_u16.to_le_bytes());
        out.extend_from_slice(&9_u16.to_le_bytes());
        out.extend_from_slice(&6_u16.to_le_bytes());
        out.extend_from_slice(&[0; 6]);
        out.extend_from_slice(&0_u32.to_le_bytes());
        out.extend_from_slice(&(fat_sectors as u32).to_le_bytes());
        out.extend_from_slice(&first_dir.to_le_bytes());
        out.extend_from_slice(&0_u32.to_le_bytes());
        out.extend_from_slice(&(MINI_STREAM_CUTOFF as u32).to_le_bytes());
        out.extend_from_slice(&first_mini_fat.to_le_bytes());
        out.extend_from_slice(&(mini_fat_sectors as u32).to_le_bytes());
        out.extend_from_slice(&ENDOFCHAIN.to_le_bytes());
        out.extend_from_slice(&0_u32.to_le_bytes());
        for i in 0..109 {
            let sector = if i < fat_sectors { i as u32 } else { FREESECT };
            out.extend_from_slice(&sector.to_le_bytes());
        }
        assert_eq!(out.len(), SECTOR_SIZE);

        // FAT
        for entry in &fat {
            out.extend_from_slice(&entry.to_le_bytes());
        }

        // Directory
        let mut siblings = vec![NOSTREAM; nodes.len()];
        let mut first_child = vec![NOSTREAM; nodes.len()];
        for (id, node) in nodes.iter().enumerate() {
            if let Node::Storage { children, .. } = node {
                if let Some(first) = children.first() {
                    first_child[id] = *first as u32;
                }
                for pair in children.windows(2) {
                    siblings[pair[0]] = pair[1] as u32;
                }
            }
        }

        for (id, node) in nodes.iter().enumerate() {
            let (name, entry_type, start, size) = match node {
                Node::Storage { name, .. } if id == 0 => (
                    name,
                    5,
                    first_mini_stream,
                    mini_stream.len() as u64,
                ),
                Node::Storage { name, .. } => (name, 1, 0, 0),
                Node::Stream { name, data } => {
                    (name, 2, starts[id], data.len() as u64)
                }
            };
            out.extend_from_slice(&directory_entry(
                name,
                entry_type,
                siblings[id],
                first_child[id],
                start,
                size,
            ));
        }
        pad_with(&mut out, SECTOR_SIZE, 0);

        // Mini FAT
        for entry in &mini_fat {
            out.extend_from_slice(&entry.to_le_bytes());
        }
        pad_with(&mut out, SECTOR_SIZE, 0xFF);

        // Mini stream
        out.extend_from_slice(&mini_stream);
        pad(&mut out, SECTOR_SIZE);

        // Regular streams
        for (_, data) in &big_streams {
            out.extend_from_slice(data);
            pad(&mut out, SECTOR_SIZE);
        }

        out
    }
}

fn add_child(nodes: &mut [Node], parent: usize, child: usize) {
    if let Node::Storage { children, .. } = &mut nodes[parent] {
        children.push(child);
    }
}

fn pad(data: &mut Vec<u8>, alignment: usize) {
    pad_with(data, alignment, 0)
}

fn pad_with(data: &mut Vec<u8>, alignment: usize, byte: u8) {
    let len = data.len().div_ceil(alignment) * alignment;
    data.resize(len, byte);
}

pub(crate) fn directory_entry(
    name: &str,
    entry_type: u8,
    right: u32,
    child: u32,
    start: u32,
    size: u64,
) -> Vec<u8> {
    let mut entry = Vec::with_capacity(128);
    let utf16 = name.encode_utf16().collect::<Vec<_>>();
    assert!(utf16.len() < 32);
    for unit in &utf16 {
        entry.extend_from_slice(&unit.to_le_bytes());
    }
    entry.resize(64, 0);
    entry.extend_from_slice(&(((utf16.len() + 1) * 2) as u16).to_le_bytes());
    entry.push(entry_type);
    entry.push(1); // black
    entry.extend_from_slice(&NOSTREAM.to_le_bytes()); // left
    entry.extend_from_slice(&right.to_le_bytes());
    entry.extend_from_slice(&child.to_le_bytes());
    entry.extend_from_slice(&[0; 16]); // clsid
    entry.extend_from_slice(&[0; 4]); // state bits
    entry.extend_from_slice(&[0; 16]); // timestamps
    entry.extend_from_slice(&start.to_le_bytes());
    entry.extend_from_slice(&size.to_le_bytes());
    assert_eq!(entry.len(), 128);
    entry
}

/// Compresses `data` with the MS-OVBA algorithm, using literal tokens
/// only.
pub(crate) fn ovba_compress(data: &[u8]) -> Vec<u8> {
    let mut out = vec![0x01];
    // Literal-only chunks are 1/8 larger than their data, and a compressed
    // chunk can't be larger than 4098 bytes.
    for chunk in data.chunks(3584) {
        let mut body = Vec::new();
        for group in chunk.chunks(8) {
            body.push(0x00);
            body.extend_from_slice(group);
        }
        let header = (body.len() + 2 - 3) as u16 | 0x3000 | 0x8000;
        out.extend_from_slice(&header.to_le_bytes());
        out.extend_from_slice(&body);
    }
    out
}

fn record(out: &mut Vec<u8>, id: u16, data: &[u8]) {
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
}

fn utf16(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

/// Bytes stored before the compressed source in module streams.
const MODULE_PREFIX: &[u8] = b"\x00\x00\x00\x00";

/// Builds the decompressed `dir` stream of a project.
pub(crate) fn vba_dir_stream(project: &str, modules: &[&str]) -> Vec<u8> {
    let mut dir = Vec::new();
    record(&mut dir, 0x0001, &1_u32.to_le_bytes()); // SYSKIND
    record(&mut dir, 0x0002, &0x0407_u32.to_le_bytes()); // LCID
    record(&mut dir, 0x0014, &0x0407_u32.to_le_bytes()); // LCIDINVOKE
    record(&mut dir, 0x0003, &1252_u16.to_le_bytes()); // CODEPAGE
    record(&mut dir, 0x0004, project.as_bytes()); // NAME
    record(&mut dir, 0x0005, b""); // DOCSTRING
    record(&mut dir, 0x0040, b"");
    record(&mut dir, 0x0006, b""); // HELPFILEPATH
    record(&mut dir, 0x003D, b"");
    record(&mut dir, 0x0007, &0_u32.to_le_bytes()); // HELPCONTEXT
    record(&mut dir, 0x0008, &0_u32.to_le_bytes()); // LIBFLAGS
    // VERSION, its size field doesn't cover the minor version.
    dir.extend_from_slice(&0x0009_u16.to_le_bytes());
    dir.extend_from_slice(&4_u32.to_le_bytes());
    dir.extend_from_slice(&0x5F4A2B1C_u32.to_le_bytes());
    dir.extend_from_slice(&0x0011_u16.to_le_bytes());
    record(&mut dir, 0x000C, b""); // CONSTANTS
    record(&mut dir, 0x003C, b"");
    record(&mut dir, 0x000F, &(modules.len() as u16).to_le_bytes());
    record(&mut dir, 0x0013, &0xFFFF_u16.to_le_bytes()); // COOKIE

    for module in modules {
        record(&mut dir, 0x0019, module.as_bytes());
        record(&mut dir, 0x0047, &utf16(module));
        record(&mut dir, 0x001A, module.as_bytes());
        record(&mut dir, 0x0032, &utf16(module));
        record(&mut dir, 0x001C, b"");
        record(&mut dir, 0x0048, b"");
        record(
            &mut dir,
            0x0031,
            &(MODULE_PREFIX.len() as u32).to_le_bytes(),
        );
        record(&mut dir, 0x001E, &0_u32.to_le_bytes());
        record(&mut dir, 0x002C, &0xFFFF_u16.to_le_bytes());
        record(&mut dir, 0x0021, b"");
        record(&mut dir, 0x002B, b"");
    }

    record(&mut dir, 0x0010, b"");
    dir
}

/// Builds a `vbaProject.bin` holding the given `(module, source)` pairs.
pub(crate) fn vba_project(modules: &[(&str, &str)]) -> CfbBuilder {
    let names = modules.iter().map(|(name, _)| *name).collect::<Vec<_>>();

    let mut builder = CfbBuilder::new()
        .stream("PROJECT", b"ID=\"{00000000-0000-0000-0000-000000000000}\"\r\n")
        .stream("PROJECTwm", b"Module1\x00M\x00o\x00d\x00\x00\x00\x00\x00")
        .stream("VBA/_VBA_PROJECT", b"\xCC\x61\xFF\xFF\x00\x00\x00")
        .stream("VBA/dir", &ovba_compress(&vba_dir_stream("VBAProject", &names)));

    for (name, source) in modules {
        let mut stream = MODULE_PREFIX.to_vec();
        stream.extend_from_slice(&ovba_compress(source.as_bytes()));
        builder = builder.stream(&format!("VBA/{}", name), &stream);
    }

    builder
}

/// Creates a macro-enabled document whose project holds the given modules.
pub(crate) fn create_docm(modules: &[(&str, &str)]) -> Vec<u8> {
    let project = vba_project(modules).build();
    create_docx(&[("word/vbaProject.bin", project.as_slice())])
}
