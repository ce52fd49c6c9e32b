/*! Locates compound-file (OLE) payloads among the binary parts of a
container and describes the streams inside them.

Embedded objects, ActiveX controls and VBA projects are all stored as
compound files. This module only finds them and classifies their streams,
the VBA projects are examined by the `vba` module.
*/
use log::*;

use crate::models::{
    decode_utf16_lossy, OleStreamDescriptor, Severity, StreamClass,
    ThreatKind, ThreatRecord,
};

pub(crate) mod parser;

#[cfg(test)]
mod tests;

pub use parser::OleError;
pub(crate) use parser::{OleFile, StreamEntry};

/// Extensions (and names) of parts that hold macro-enabled documents.
const MACRO_ENABLED_NAMES: &[&str] = &[
    ".docm",
    ".dotm",
    ".xlsm",
    ".xltm",
    ".xlam",
    ".xlsb",
    ".pptm",
    ".potm",
    ".ppsm",
    ".ppam",
    "vbaproject.bin",
];

/// Storages that hold VBA projects.
const MACRO_STORAGES: &[&str] = &["VBA", "_VBA_PROJECT_CUR", "Macros"];

/// Streams that belong to a VBA project regardless of where they are.
const MACRO_STREAMS: &[&str] = &["_VBA_PROJECT", "PROJECT", "PROJECTwm"];

/// Stored names of the streams holding the data of an embedded object.
/// Some of them start with a control character by convention.
const NATIVE_EMBEDDING_STREAMS: &[&str] =
    &["\x01Ole10Native", "\x01Ole", "\x01CompObj", "Package", "CONTENTS"];

/// Stored names of property sets and other bookkeeping streams.
const COMPOUND_METADATA_STREAMS: &[&str] = &[
    "\x05SummaryInformation",
    "\x05DocumentSummaryInformation",
    "\x03ObjInfo",
    "\x03EPRINT",
];

/// Returns true if `data` starts with the compound file signature.
pub(crate) fn is_ole(data: &[u8]) -> bool {
    data.starts_with(parser::OLECF_SIGNATURE)
}

/// Returns a finding if the name of `part` says it holds a macro-enabled
/// document or a VBA project.
pub(crate) fn inspect_part_name(part: &str) -> Option<ThreatRecord> {
    let lowercase = part.to_ascii_lowercase();
    let matched =
        MACRO_ENABLED_NAMES.iter().find(|name| lowercase.ends_with(*name))?;

    Some(
        ThreatRecord::new(ThreatKind::SuspiciousStreamName, Severity::Info, part)
            .with_evidence("matched", matched.trim_start_matches('.')),
    )
}

/// Parses a compound file and returns the streams reachable from its
/// root, in directory order.
///
/// ```
/// # use docscan::ole;
/// assert!(ole::streams(b"not a compound file").is_err());
/// ```
pub fn streams(data: &[u8]) -> Result<Vec<OleStreamDescriptor>, OleError> {
    let file = OleFile::parse(data)?;
    file.streams().iter().map(|s| describe(&file, s)).collect()
}

/// Builds the descriptor of a stream, resolving its offset in the payload.
pub(crate) fn describe(
    file: &OleFile,
    stream: &StreamEntry,
) -> Result<OleStreamDescriptor, OleError> {
    Ok(OleStreamDescriptor {
        raw_name: stream.raw_name.clone(),
        normalized_name: stream.name.clone(),
        path: stream.path.clone(),
        size_bytes: stream.size,
        byte_offset: file.locate(stream)?,
        classification: classify(stream),
    })
}

/// Classifies a stream by its name and the storages containing it.
pub(crate) fn classify(stream: &StreamEntry) -> StreamClass {
    let stored_name = decode_utf16_lossy(&stream.raw_name);

    if NATIVE_EMBEDDING_STREAMS.contains(&stored_name.as_str()) {
        return StreamClass::LikelyNativeEmbedding;
    }

    if COMPOUND_METADATA_STREAMS.contains(&stored_name.as_str()) {
        return StreamClass::LikelyCompoundMetadata;
    }

    let mut storages = stream.path.split('/').rev().skip(1);
    let in_macro_storage = storages.any(|storage| {
        MACRO_STORAGES.iter().any(|s| s.eq_ignore_ascii_case(storage))
    });

    if in_macro_storage
        || MACRO_STREAMS.iter().any(|s| s.eq_ignore_ascii_case(&stream.name))
        || is_srp_stream(&stream.name)
    {
        return StreamClass::LikelyMacroProject;
    }

    StreamClass::Unknown
}

/// `__SRP_0`, `__SRP_1`... hold the performance cache of a VBA project.
fn is_srp_stream(name: &str) -> bool {
    name.strip_prefix("__SRP_").is_some_and(|n| {
        !n.is_empty() && n.chars().all(|c| c.is_ascii_digit())
    })
}

/// Returns a finding if the stream's stored name starts with a
/// non-printable character and is not one of the names that use such
/// prefixes by convention.
pub(crate) fn inspect_stream_name(
    part: &str,
    stream: &OleStreamDescriptor,
) -> Option<ThreatRecord> {
    if !stream.has_control_prefix() {
        return None;
    }
    if matches!(
        stream.classification,
        StreamClass::LikelyNativeEmbedding
            | StreamClass::LikelyCompoundMetadata
    ) {
        return None;
    }

    debug!(
        "`{}` contains stream `{}` with a control prefix",
        part,
        stream.escaped_name()
    );

    Some(
        ThreatRecord::new(ThreatKind::SuspiciousStreamName, Severity::Low, part)
            .with_evidence("stream", stream.escaped_name())
            .with_evidence("path", stream.path.as_str())
            .with_evidence("byte_offset", stream.byte_offset),
    )
}

/// Converts a parse error into the finding reported for `part`.
pub(crate) fn parse_error(
    part: &str,
    payload_len: usize,
    err: &OleError,
) -> ThreatRecord {
    warn!("compound file in `{}` can not be parsed: {}", part, err);
    ThreatRecord::new(ThreatKind::OleParseError, Severity::Medium, part)
        .with_evidence("stage", "ole")
        .with_evidence("reason", err)
        .with_evidence("payload_bytes", payload_len)
}
