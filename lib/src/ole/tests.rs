use pretty_assertions::assert_eq;

use crate::models::{Severity, StreamClass, ThreatKind};
use crate::ole::parser::{parse_directory_entry, OleError, OleFile};
use crate::ole::{describe, inspect_part_name, inspect_stream_name, streams};
use crate::tests::{directory_entry, vba_project, CfbBuilder};

/// Offset of the first directory sector in files written by [`CfbBuilder`]
/// with a single FAT sector.
const FIRST_DIR_SECTOR_OFFSET: usize = 1024;

// Header fields.
const NUM_FAT_SECTORS: usize = 44;
const FIRST_DIFAT_SECTOR: usize = 68;
const NUM_DIFAT_SECTORS: usize = 72;
const HEADER_DIFAT: usize = 76;

const ENDOFCHAIN: u32 = 0xFFFFFFFE;
const FREESECT: u32 = 0xFFFFFFFF;

fn set_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Appends a DIFAT sector listing `fat_sectors` and pointing to `next`.
/// Returns the number of the new sector.
fn append_difat_sector(
    data: &mut Vec<u8>,
    fat_sectors: &[u32],
    next: u32,
) -> u32 {
    let sector = (data.len() / 512 - 1) as u32;
    for i in 0..127 {
        let value = fat_sectors.get(i).copied().unwrap_or(FREESECT);
        data.extend_from_slice(&value.to_le_bytes());
    }
    data.extend_from_slice(&next.to_le_bytes());
    sector
}

fn sample() -> Vec<u8> {
    CfbBuilder::new()
        .stream("\x01Ole10Native", &[0x41; 100])
        .stream("Big", &[0x42; 5000])
        .build()
}

#[test]
fn stream_descriptors() {
    let data = sample();
    let streams = streams(&data).unwrap();

    assert_eq!(streams.len(), 2);

    assert_eq!(
        streams[0].raw_name,
        b"\x01\x00O\x00l\x00e\x001\x000\x00N\x00a\x00t\x00i\x00v\x00e\x00"
    );
    assert_eq!(streams[0].normalized_name, "Ole10Native");
    assert_eq!(streams[0].escaped_name(), "\\u{1}Ole10Native");
    assert_eq!(streams[0].size_bytes, 100);
    assert_eq!(streams[0].classification, StreamClass::LikelyNativeEmbedding);
    // Mini sector 0, inside the mini stream which starts at sector 3.
    assert_eq!(streams[0].byte_offset, 2048);

    assert_eq!(streams[1].path, "Big");
    assert_eq!(streams[1].size_bytes, 5000);
    assert_eq!(streams[1].classification, StreamClass::Unknown);
    assert_eq!(streams[1].byte_offset, 2560);

    for stream in &streams {
        let offset = stream.byte_offset as usize;
        assert_eq!(data[offset], if stream.path == "Big" { 0x42 } else { 0x41 });
    }
}

#[test]
fn read_streams() {
    let data = sample();
    let file = OleFile::parse(&data).unwrap();

    let native = file.find_stream("\u{1}ole10native");
    assert!(native.is_none(), "paths use normalized names");

    let native = file.find_stream("OLE10NATIVE").unwrap();
    assert_eq!(file.read_stream(native, 1024).unwrap(), vec![0x41; 100]);

    let big = file.find_stream("Big").unwrap();
    assert_eq!(file.read_stream(big, 1 << 20).unwrap(), vec![0x42; 5000]);

    assert_eq!(
        file.read_stream(big, 4096),
        Err(OleError::StreamTooLarge { name: "Big".to_string(), limit: 4096 })
    );
}

#[test]
fn storage_paths() {
    let data = vba_project(&[("Module1", "Sub Foo()\r\nEnd Sub\r\n")]).build();
    let streams = streams(&data).unwrap();

    let mut paths = streams
        .iter()
        .map(|s| (s.path.as_str(), s.classification))
        .collect::<Vec<_>>();
    paths.sort_by(|a, b| a.0.cmp(b.0));

    assert_eq!(
        paths,
        vec![
            ("PROJECT", StreamClass::LikelyMacroProject),
            ("PROJECTwm", StreamClass::LikelyMacroProject),
            ("VBA/Module1", StreamClass::LikelyMacroProject),
            ("VBA/_VBA_PROJECT", StreamClass::LikelyMacroProject),
            ("VBA/dir", StreamClass::LikelyMacroProject),
        ]
    );
}

#[test]
fn classification() {
    let data = CfbBuilder::new()
        .stream("\x05SummaryInformation", b"x")
        .stream("\x03ObjInfo", b"x")
        .stream("\x01CompObj", b"x")
        .stream("Package", b"x")
        .stream("Macros/VBA/ThisDocument", b"x")
        .stream("_VBA_PROJECT_CUR/Sheet1", b"x")
        .stream("__SRP_3", b"x")
        .stream("__SRP_", b"x")
        .stream("WordDocument", b"x")
        .build();

    let classes = streams(&data)
        .unwrap()
        .into_iter()
        .map(|s| (s.path, s.classification))
        .collect::<std::collections::HashMap<_, _>>();

    assert_eq!(classes["SummaryInformation"], StreamClass::LikelyCompoundMetadata);
    assert_eq!(classes["ObjInfo"], StreamClass::LikelyCompoundMetadata);
    assert_eq!(classes["CompObj"], StreamClass::LikelyNativeEmbedding);
    assert_eq!(classes["Package"], StreamClass::LikelyNativeEmbedding);
    assert_eq!(
        classes["Macros/VBA/ThisDocument"],
        StreamClass::LikelyMacroProject
    );
    assert_eq!(
        classes["_VBA_PROJECT_CUR/Sheet1"],
        StreamClass::LikelyMacroProject
    );
    assert_eq!(classes["__SRP_3"], StreamClass::LikelyMacroProject);
    assert_eq!(classes["__SRP_"], StreamClass::Unknown);
    assert_eq!(classes["WordDocument"], StreamClass::Unknown);
}

#[test]
fn control_prefixed_names() {
    let data = CfbBuilder::new()
        .stream("\x01Ole10Native", b"payload")
        .stream("\x05SummaryInformation", b"props")
        .stream("\x02Hidden", b"payload")
        .build();

    let file = OleFile::parse(&data).unwrap();
    let threats = file
        .streams()
        .iter()
        .map(|s| describe(&file, s).unwrap())
        .filter_map(|d| inspect_stream_name("word/embeddings/oleObject1.bin", &d))
        .collect::<Vec<_>>();

    assert_eq!(threats.len(), 1);
    assert_eq!(threats[0].kind, ThreatKind::SuspiciousStreamName);
    assert_eq!(threats[0].severity, Severity::Low);
    assert_eq!(threats[0].evidence["stream"], "\\u{2}Hidden");
}

#[test]
fn part_names() {
    for name in [
        "word/vbaProject.bin",
        "xl/vbaProject.bin",
        "word/embeddings/Microsoft_Word_Macro-Enabled_Document1.docm",
        "ppt/embeddings/Presentation.PPTM",
    ] {
        let threat = inspect_part_name(name).unwrap();
        assert_eq!(threat.kind, ThreatKind::SuspiciousStreamName);
        assert_eq!(threat.severity, Severity::Info);
    }

    assert!(inspect_part_name("word/embeddings/oleObject1.bin").is_none());
    assert!(inspect_part_name("word/media/image1.docx").is_none());
}

#[test]
fn not_ole() {
    assert_eq!(streams(b"").err(), Some(OleError::NotOle));
    assert_eq!(streams(b"PK\x03\x04").err(), Some(OleError::NotOle));
    assert_eq!(
        streams(b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1\x00\x00").err(),
        Some(OleError::TruncatedHeader)
    );
}

#[test]
fn truncated() {
    let data = sample();

    // Header and half of the FAT.
    assert_eq!(
        streams(&data[..768]).err(),
        Some(OleError::SectorOutOfRange { sector: 0 })
    );

    // Everything but the end of the big stream. The directory is fine, the
    // stream data is not.
    let truncated = &data[..3000];
    let file = OleFile::parse(truncated).unwrap();
    let big = file.find_stream("Big").unwrap();
    assert_eq!(
        file.read_stream(big, 1 << 20),
        Err(OleError::StreamOutOfRange { name: "Big".to_string() })
    );
}

#[test]
fn invalid_header() {
    let mut data = sample();
    // Sector shift 12 is only valid in version 4 files.
    data[30] = 12;

    assert_eq!(
        streams(&data).err(),
        Some(OleError::InvalidHeader { field: "sector_shift", value: 12 })
    );

    let mut data = sample();
    // Byte order mark.
    data[28] = 0xFF;
    assert_eq!(streams(&data).err(), Some(OleError::TruncatedHeader));
}

#[test]
fn fat_cycle() {
    let mut data = sample();
    // The FAT entry for the directory sector (1) points to itself.
    data[512 + 4..512 + 8].copy_from_slice(&1_u32.to_le_bytes());

    assert_eq!(streams(&data).err(), Some(OleError::ChainLoop { start: 1 }));
}

#[test]
fn directory_loop() {
    let mut data = sample();
    // The root's first child is the root itself.
    let child = FIRST_DIR_SECTOR_OFFSET + 76;
    data[child..child + 4].copy_from_slice(&0_u32.to_le_bytes());

    assert_eq!(
        streams(&data).err(),
        Some(OleError::DirectoryLoop { entry: 0 })
    );
}

#[test]
fn directory_out_of_range() {
    let mut data = sample();
    let child = FIRST_DIR_SECTOR_OFFSET + 76;
    data[child..child + 4].copy_from_slice(&1000_u32.to_le_bytes());

    assert_eq!(
        streams(&data).err(),
        Some(OleError::DirectoryOutOfRange { entry: 0, target: 1000 })
    );
}

#[test]
fn stream_beyond_payload() {
    let mut data = sample();
    // Entry 2 is `Big`, make it start far beyond the end of the payload.
    let start = FIRST_DIR_SECTOR_OFFSET + 2 * 128 + 116;
    data[start..start + 4].copy_from_slice(&0x00FF_FFFF_u32.to_le_bytes());

    assert!(matches!(
        streams(&data).err(),
        Some(OleError::FatOutOfRange { .. })
            | Some(OleError::StreamOutOfRange { .. })
    ));
}

#[test]
fn offsets_resolved_on_demand() {
    let mut data = sample();
    let start = FIRST_DIR_SECTOR_OFFSET + 2 * 128 + 116;
    set_u32(&mut data, start, 0x00FF_FFFF);

    // Parsing doesn't walk the chains of the streams.
    let file = OleFile::parse(&data).unwrap();
    let big = file.find_stream("Big").unwrap();

    assert_eq!(
        file.locate(big),
        Err(OleError::FatOutOfRange { sector: 0x00FF_FFFF })
    );
    assert_eq!(file.locate(file.find_stream("Ole10Native").unwrap()), Ok(2048));
}

#[test]
fn chains_walked_up_to_declared_size() {
    let mut data = sample();
    // `Big` takes sectors 4 to 13. The FAT entry of its last sector points
    // back to its first one, but the loop lies beyond the 5000 bytes
    // declared for the stream.
    set_u32(&mut data, 512 + 13 * 4, 4);

    let file = OleFile::parse(&data).unwrap();
    let big = file.find_stream("Big").unwrap();

    assert_eq!(file.locate(big), Ok(2560));
    assert_eq!(file.read_stream(big, 1 << 20).unwrap(), vec![0x42; 5000]);
}

#[test]
fn fat_sector_count_is_bounded() {
    let mut data = sample();
    set_u32(&mut data, NUM_FAT_SECTORS, u32::MAX);

    // Only the FAT sectors actually listed are loaded.
    assert_eq!(streams(&data).unwrap(), streams(&sample()).unwrap());
}

#[test]
fn repeated_fat_sectors() {
    let mut data = sample();
    set_u32(&mut data, NUM_FAT_SECTORS, u32::MAX);
    for i in 1..109 {
        set_u32(&mut data, HEADER_DIFAT + i * 4, 0);
    }

    assert_eq!(
        streams(&data).err(),
        Some(OleError::DuplicateFatSector { sector: 0 })
    );

    // The same through a DIFAT sector.
    let mut data = sample();
    set_u32(&mut data, NUM_FAT_SECTORS, u32::MAX);
    let difat = append_difat_sector(&mut data, &[0; 127], ENDOFCHAIN);
    set_u32(&mut data, FIRST_DIFAT_SECTOR, difat);
    set_u32(&mut data, NUM_DIFAT_SECTORS, 1);

    assert_eq!(
        streams(&data).err(),
        Some(OleError::DuplicateFatSector { sector: 0 })
    );
}

#[test]
fn difat_chain() {
    let mut data = sample();
    // The FAT sector is listed in a DIFAT sector instead of the header.
    set_u32(&mut data, HEADER_DIFAT, FREESECT);
    let difat = append_difat_sector(&mut data, &[0], ENDOFCHAIN);
    set_u32(&mut data, FIRST_DIFAT_SECTOR, difat);
    set_u32(&mut data, NUM_DIFAT_SECTORS, 1);

    assert_eq!(difat, 14);
    assert_eq!(streams(&data).unwrap(), streams(&sample()).unwrap());
}

#[test]
fn difat_loop() {
    let mut data = sample();
    set_u32(&mut data, HEADER_DIFAT, FREESECT);
    // Two FAT sectors are declared, but the only DIFAT sector lists one and
    // points to itself.
    set_u32(&mut data, NUM_FAT_SECTORS, 2);
    let difat = append_difat_sector(&mut data, &[0], 14);
    set_u32(&mut data, FIRST_DIFAT_SECTOR, difat);
    set_u32(&mut data, NUM_DIFAT_SECTORS, 3);

    assert_eq!(streams(&data).err(), Some(OleError::ChainLoop { start: 14 }));
}

#[test]
fn directory_entry_sizes() {
    let raw = directory_entry("Big", 2, u32::MAX, u32::MAX, 4, 0x1_0000_1388);

    // Version 3 files may have garbage in the high half of the size.
    let (_, entry) = parse_directory_entry(&raw, 3).unwrap();
    assert_eq!(entry.size, 0x1388);

    let (_, entry) = parse_directory_entry(&raw, 4).unwrap();
    assert_eq!(entry.size, 0x1_0000_1388);
}
