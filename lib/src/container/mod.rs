/*! Opens the ZIP container of an Office Open XML document.

Sizes found in the central directory are declared by whoever built the
archive and can't be trusted. The loader uses them only for deciding which
parts are worth decompressing, and then decompresses each admitted part with
a bounded read loop that aborts as soon as the data produced goes beyond the
declared size or the per-part ceiling.

Loading goes through `Unopened -> Validating -> {Parsed | Rejected}`. Both
final states are terminal, and both produce a scan result.
*/
use std::cmp::min;
use std::io::{Cursor, ErrorKind, Read};

use log::*;
use thiserror::Error;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::config::ScanConfig;
use crate::models::{ContainerMetadata, Severity, ThreatKind, ThreatRecord};


/// The compression ratio is only checked for parts whose declared size is
/// at least this large. Small parts can have absurd ratios without posing
/// any risk.
const RATIO_CHECK_FLOOR: u64 = 64 * 1024;

/// Size of the chunks read while decompressing a part.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Errors produced while decompressing a part.
#[derive(Error, Debug)]
pub(crate) enum PartError {
    /// The zip crate refused to open the part (encryption, unsupported
    /// compression method, corrupt local header...).
    #[error("can not open part: {0}")]
    Unreadable(#[from] ZipError),
    /// Decompression failed midway.
    #[error("can not decompress part: {0}")]
    Io(#[from] std::io::Error),
    /// The part produced more data than the central directory declared.
    #[error("part produced more than the {declared} bytes declared")]
    ExceedsDeclared { declared: u64 },
    /// The part produced more data than the per-part ceiling.
    #[error("part produced more than {ceiling} bytes")]
    ExceedsCeiling { ceiling: u64 },
}

impl PartError {
    /// Converts the error into the finding reported for `part`.
    pub(crate) fn into_threat(self, part: &Part) -> ThreatRecord {
        let record = match &self {
            PartError::Unreadable(_) | PartError::Io(_) => ThreatRecord::new(
                ThreatKind::MalformedContainer,
                Severity::Medium,
                part.name.as_str(),
            ),
            PartError::ExceedsDeclared { .. } => ThreatRecord::new(
                ThreatKind::ZipBomb,
                Severity::High,
                part.name.as_str(),
            ),
            PartError::ExceedsCeiling { .. } => ThreatRecord::new(
                ThreatKind::OversizedPart,
                Severity::High,
                part.name.as_str(),
            ),
        };
        record
            .with_evidence("reason", &self)
            .with_evidence("declared_uncompressed_bytes", part.declared_size)
            .with_evidence("declared_compressed_bytes", part.compressed_size)
    }
}

/// A part listed in the central directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Part {
    /// Path of the part inside the container.
    pub name: String,
    /// Index in the central directory, used for reading the part.
    pub index: usize,
    /// Compressed size, as declared.
    pub compressed_size: u64,
    /// Uncompressed size, as declared.
    pub declared_size: u64,
}

impl Part {
    /// Returns true if the name says this is an XML part.
    pub fn has_xml_name(&self) -> bool {
        let name = self.name.to_ascii_lowercase();
        name.ends_with(".xml") || name.ends_with(".rels") || name.ends_with(".vml")
    }
}

/// Outcome of [`load`].
pub(crate) enum Loaded<'a> {
    /// The central directory was read. The container holds the parts that
    /// passed the size gates.
    Parsed(Container<'a>),
    /// The archive could not be opened at all.
    Rejected(ThreatRecord),
}

/// An opened container.
pub(crate) struct Container<'a> {
    archive: ZipArchive<Cursor<&'a [u8]>>,
    /// Parts that passed the size gates, in central directory order.
    parts: Vec<Part>,
    /// Findings produced while validating the central directory.
    findings: Vec<ThreatRecord>,
    metadata: ContainerMetadata,
    max_part_bytes: u64,
}

impl<'a> Container<'a> {
    /// Parts admitted for analysis.
    pub fn parts(&self) -> &[Part] {
        self.parts.as_slice()
    }

    /// Takes the findings produced while validating the central directory.
    pub fn take_findings(&mut self) -> Vec<ThreatRecord> {
        std::mem::take(&mut self.findings)
    }

    /// Facts gathered from the central directory. The scan duration is
    /// left at zero.
    pub fn metadata(&self) -> &ContainerMetadata {
        &self.metadata
    }

    /// Decompresses a part.
    ///
    /// The data is read in chunks and the read is aborted as soon as the
    /// amount of data goes beyond the declared size or the per-part
    /// ceiling, whichever is hit first. This means that at most
    /// `min(declared size, ceiling) + READ_CHUNK_SIZE` bytes are ever
    /// materialized, no matter what the archive claims.
    pub fn read_part(&mut self, part: &Part) -> Result<Vec<u8>, PartError> {
        let mut file = self.archive.by_index(part.index)?;
        let ceiling = self.max_part_bytes;

        let mut data = Vec::with_capacity(
            min(min(part.declared_size, ceiling), READ_CHUNK_SIZE as u64)
                as usize,
        );
        let mut chunk = vec![0_u8; READ_CHUNK_SIZE];

        loop {
            let n = match file.read(chunk.as_mut_slice()) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            let produced = data.len() as u64 + n as u64;
            if produced > part.declared_size {
                return Err(PartError::ExceedsDeclared {
                    declared: part.declared_size,
                });
            }
            if produced > ceiling {
                return Err(PartError::ExceedsCeiling { ceiling });
            }
            data.extend_from_slice(&chunk[..n]);
        }

        Ok(data)
    }
}

/// Returns true if `declared` bytes stored in `compressed` bytes goes
/// beyond the maximum ratio.
fn exceeds_ratio(declared: u64, compressed: u64, max_ratio: u64) -> bool {
    if compressed == 0 {
        return declared > 0;
    }
    declared >= RATIO_CHECK_FLOOR
        && declared > compressed.saturating_mul(max_ratio)
}

/// Opens `data` as a ZIP archive and decides which parts are admitted.
pub(crate) fn load<'a>(data: &'a [u8], config: &ScanConfig) -> Loaded<'a> {
    // Unopened -> Validating
    let mut archive = match ZipArchive::new(Cursor::new(data)) {
        Ok(archive) => archive,
        Err(err) => {
            debug!("container rejected: {}", err);
            return Loaded::Rejected(
                ThreatRecord::new(
                    ThreatKind::MalformedContainer,
                    Severity::Medium,
                    "",
                )
                .with_evidence("reason", err)
                .with_evidence("input_bytes", data.len()),
            );
        }
    };

    let mut findings = Vec::new();
    let mut entries = Vec::with_capacity(archive.len());

    for index in 0..archive.len() {
        match archive.by_index_raw(index) {
            Ok(file) if file.is_dir() => {}
            Ok(file) => entries.push(Part {
                name: file.name().to_string(),
                index,
                compressed_size: file.compressed_size(),
                declared_size: file.size(),
            }),
            Err(err) => {
                warn!("central directory entry #{} unreadable: {}", index, err);
                findings.push(
                    ThreatRecord::new(
                        ThreatKind::MalformedContainer,
                        Severity::Medium,
                        "",
                    )
                    .with_evidence("reason", err)
                    .with_evidence("entry_index", index),
                );
            }
        }
    }

    let metadata = ContainerMetadata {
        part_count: entries.len() as u64,
        declared_uncompressed_bytes: entries
            .iter()
            .fold(0_u64, |acc, p| acc.saturating_add(p.declared_size)),
        declared_compressed_bytes: entries
            .iter()
            .fold(0_u64, |acc, p| acc.saturating_add(p.compressed_size)),
        ..Default::default()
    };

    let total = metadata.declared_uncompressed_bytes;
    let compressed = metadata.declared_compressed_bytes;

    if total > config.max_total_uncompressed_bytes
        || exceeds_ratio(total, compressed, config.max_compression_ratio)
    {
        warn!(
            "container declares {} bytes stored in {} bytes",
            total, compressed
        );
        findings.push(
            ThreatRecord::new(ThreatKind::ZipBomb, Severity::High, "")
                .with_evidence("declared_uncompressed_bytes", total)
                .with_evidence("declared_compressed_bytes", compressed)
                .with_evidence(
                    "max_total_uncompressed_bytes",
                    config.max_total_uncompressed_bytes,
                )
                .with_evidence(
                    "max_compression_ratio",
                    config.max_compression_ratio,
                ),
        );
    }

    if metadata.part_count > config.max_part_count {
        warn!("container has {} parts", metadata.part_count);
        findings.push(
            ThreatRecord::new(ThreatKind::ZipBomb, Severity::High, "")
                .with_evidence("part_count", metadata.part_count)
                .with_evidence("max_part_count", config.max_part_count),
        );
    }

    // Validating -> Parsed
    let mut parts = Vec::new();
    let mut admitted_bytes = 0_u64;

    for part in entries.into_iter().take(
        usize::try_from(config.max_part_count).unwrap_or(usize::MAX),
    ) {
        if exceeds_ratio(
            part.declared_size,
            part.compressed_size,
            config.max_compression_ratio,
        ) {
            findings.push(
                ThreatRecord::new(
                    ThreatKind::ZipBomb,
                    Severity::High,
                    part.name.as_str(),
                )
                .with_evidence("declared_uncompressed_bytes", part.declared_size)
                .with_evidence("declared_compressed_bytes", part.compressed_size)
                .with_evidence(
                    "max_compression_ratio",
                    config.max_compression_ratio,
                ),
            );
            continue;
        }

        if part.declared_size > config.max_part_bytes {
            findings.push(
                ThreatRecord::new(
                    ThreatKind::OversizedPart,
                    Severity::High,
                    part.name.as_str(),
                )
                .with_evidence("declared_uncompressed_bytes", part.declared_size)
                .with_evidence("max_part_bytes", config.max_part_bytes),
            );
            continue;
        }

        let cumulative = admitted_bytes.saturating_add(part.declared_size);

        // The container-level finding already covers this case.
        if cumulative > config.max_total_uncompressed_bytes {
            debug!("part `{}` skipped, total ceiling reached", part.name);
            continue;
        }

        admitted_bytes = cumulative;
        parts.push(part);
    }

    debug!(
        "container parsed: {} parts listed, {} admitted",
        metadata.part_count,
        parts.len()
    );

    Loaded::Parsed(Container {
        archive,
        parts,
        findings,
        metadata,
        max_part_bytes: config.max_part_bytes,
    })
}
