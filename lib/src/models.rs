use std::fmt::{Display, Formatter};
use std::time::Duration;

use indexmap::IndexMap;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

/// The kind of issue described by a [`ThreatRecord`].
///
/// This is a closed set. Adding a new kind forces every exhaustive `match`
/// over it (e.g. [`ThreatKind::default_hint`]) to be revisited.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum ThreatKind {
    /// The archive declares far more data than it stores.
    ZipBomb,
    /// A single part exceeds the per-part size ceiling.
    OversizedPart,
    /// The archive, or one of its parts, can't be read.
    MalformedContainer,
    /// An XML part declares a DTD or entities.
    XxeOrExternalEntity,
    /// A relationship points outside the container.
    DangerousRemoteReference,
    /// A compound-file payload, or an XML part, could not be parsed.
    OleParseError,
    /// A part or stream name suggests macros or obfuscation.
    SuspiciousStreamName,
    /// A VBA macro project was found.
    VbaMacroDetected,
    /// Code or fields that run automatically when the document is opened.
    AutoRunTriggerDetected,
    /// Some analysis capability was unavailable and confidence is reduced.
    ToolDegraded,
    /// The scan ran out of time and the result is partial.
    ScanTimeout,
    /// Unexpected condition inside the scanner itself.
    InternalError,
}

impl ThreatKind {
    /// Remediation hint used when the detecting stage doesn't provide a
    /// more specific one.
    pub fn default_hint(&self) -> &'static str {
        match self {
            ThreatKind::ZipBomb => {
                "reject the document; its declared size is disproportionate \
                 to its compressed size"
            }
            ThreatKind::OversizedPart => {
                "reject the document or raise the per-part limit after review"
            }
            ThreatKind::MalformedContainer => {
                "treat the document as untrusted; it is not a well-formed \
                 container"
            }
            ThreatKind::XxeOrExternalEntity => {
                "reject the document; office parts never need DTDs"
            }
            ThreatKind::DangerousRemoteReference => {
                "review the external target before opening the document"
            }
            ThreatKind::OleParseError => {
                "treat the embedded object as untrusted; it could not be \
                 fully analyzed"
            }
            ThreatKind::SuspiciousStreamName => {
                "review the document for macro or embedded content"
            }
            ThreatKind::VbaMacroDetected => {
                "strip macros or convert to a macro-free format before use"
            }
            ThreatKind::AutoRunTriggerDetected => {
                "do not open the document; it runs code automatically"
            }
            ThreatKind::ToolDegraded => "",
            ThreatKind::ScanTimeout => {
                "rescan with a larger deadline; the result is partial"
            }
            ThreatKind::InternalError => {
                "check the scanner configuration and logs"
            }
        }
    }
}

impl Display for ThreatKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Severity of a [`ThreatRecord`], ordered from least to most severe.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub enum Severity {
    /// Informational, does not indicate maliciousness by itself.
    Info,
    /// Low.
    Low,
    /// Medium.
    Medium,
    /// High.
    High,
    /// Critical.
    Critical,
}

impl Severity {
    /// Returns the severity one tier below this one. [`Severity::Info`]
    /// is the floor.
    pub fn lowered(self) -> Severity {
        match self {
            Severity::Critical => Severity::High,
            Severity::High => Severity::Medium,
            Severity::Medium => Severity::Low,
            Severity::Low | Severity::Info => Severity::Info,
        }
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Overall verdict of a scan, derived from its threats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    /// No threats at all.
    Clean,
    /// Highest threat is [`Severity::Info`].
    Info,
    /// Highest threat is [`Severity::Low`].
    Low,
    /// Highest threat is [`Severity::Medium`].
    Medium,
    /// Highest threat is [`Severity::High`].
    High,
    /// Highest threat is [`Severity::Critical`].
    Critical,
}

impl From<Severity> for Verdict {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Info => Verdict::Info,
            Severity::Low => Verdict::Low,
            Severity::Medium => Verdict::Medium,
            Severity::High => Verdict::High,
            Severity::Critical => Verdict::Critical,
        }
    }
}

impl Display for Verdict {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One detected issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreatRecord {
    /// What was found.
    pub kind: ThreatKind,
    /// How bad it is.
    pub severity: Severity,
    /// Path of the container part that produced the finding, empty for
    /// container-level findings.
    pub source_part: String,
    /// Supporting facts, in the order they were recorded.
    pub evidence: IndexMap<String, String>,
    /// Short human-readable remediation hint, may be empty.
    pub remediation_hint: String,
}

impl ThreatRecord {
    /// Creates a record with the default remediation hint for `kind` and
    /// empty evidence.
    pub fn new<S: Into<String>>(
        kind: ThreatKind,
        severity: Severity,
        source_part: S,
    ) -> Self {
        Self {
            kind,
            severity,
            source_part: source_part.into(),
            evidence: IndexMap::new(),
            remediation_hint: kind.default_hint().to_string(),
        }
    }

    /// Appends a piece of evidence.
    pub fn with_evidence<K: Into<String>, V: ToString>(
        mut self,
        key: K,
        value: V,
    ) -> Self {
        self.evidence.insert(key.into(), value.to_string());
        self
    }

    /// Replaces the remediation hint.
    pub fn with_hint<S: Into<String>>(mut self, hint: S) -> Self {
        self.remediation_hint = hint.into();
        self
    }
}

/// Facts about the scanned container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerMetadata {
    /// Number of parts listed in the central directory, directories
    /// excluded.
    pub part_count: u64,
    /// Sum of the uncompressed sizes declared by the central directory.
    pub declared_uncompressed_bytes: u64,
    /// Sum of the compressed sizes declared by the central directory.
    pub declared_compressed_bytes: u64,
    /// Wall-clock time spent in the scan.
    #[serde(rename = "scan_duration_ms", serialize_with = "as_millis")]
    pub scan_duration: Duration,
}

fn as_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis().try_into().unwrap_or(u64::MAX))
}

/// The aggregate output of one scan.
///
/// The verdict is not stored, it's always derived from `threats` by
/// [`ScanResult::verdict`].
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// Threats in detection order.
    pub threats: Vec<ThreatRecord>,
    /// Facts about the container.
    pub container_metadata: ContainerMetadata,
    /// True if some optional capability was unavailable and detection fell
    /// back to presence-only heuristics.
    pub degraded: bool,
}

impl ScanResult {
    /// Returns [`Verdict::Clean`] if there are no threats, or the highest
    /// severity among them otherwise.
    pub fn verdict(&self) -> Verdict {
        self.threats
            .iter()
            .map(|t| t.severity)
            .max()
            .map_or(Verdict::Clean, Verdict::from)
    }

    /// Returns true if some threat has the given kind.
    pub fn has(&self, kind: ThreatKind) -> bool {
        self.threats.iter().any(|t| t.kind == kind)
    }

    /// Returns an iterator over the threats of the given kind.
    pub fn threats_of(
        &self,
        kind: ThreatKind,
    ) -> impl Iterator<Item = &ThreatRecord> {
        self.threats.iter().filter(move |t| t.kind == kind)
    }

    /// Serializes the result as a single-line JSON document.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl Serialize for ScanResult {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut state = s.serialize_struct("ScanResult", 4)?;
        state.serialize_field("verdict", &self.verdict())?;
        state.serialize_field("degraded", &self.degraded)?;
        state.serialize_field("threats", &self.threats)?;
        state.serialize_field("container_metadata", &self.container_metadata)?;
        state.end()
    }
}

/// Classification of a stream found inside a compound-file payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamClass {
    /// Nothing known about the stream.
    Unknown,
    /// Part of a VBA macro project.
    LikelyMacroProject,
    /// Native data of an embedded object (e.g. `\x01Ole10Native`).
    LikelyNativeEmbedding,
    /// Property sets and other compound-file bookkeeping.
    LikelyCompoundMetadata,
}

/// One stream found inside a compound-file payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OleStreamDescriptor {
    /// Name exactly as stored in the directory entry (UTF-16LE, without
    /// the terminating null).
    pub raw_name: Vec<u8>,
    /// Name with control characters removed.
    pub normalized_name: String,
    /// Normalized names of the storages containing the stream, from the
    /// root, followed by the stream's own normalized name, joined by `/`.
    pub path: String,
    /// Declared size of the stream.
    pub size_bytes: u64,
    /// Offset of the stream's first byte within the payload.
    pub byte_offset: u64,
    /// What the stream most likely is.
    pub classification: StreamClass,
}

impl OleStreamDescriptor {
    /// Returns the stored name with control characters escaped, suitable
    /// for logs and evidence.
    pub fn escaped_name(&self) -> String {
        decode_utf16_lossy(&self.raw_name).escape_default().to_string()
    }

    /// Returns true if the stored name starts with a non-printable
    /// character.
    pub fn has_control_prefix(&self) -> bool {
        decode_utf16_lossy(&self.raw_name)
            .chars()
            .next()
            .is_some_and(|c| c.is_control())
    }
}

/// Decodes a UTF-16LE buffer, replacing invalid sequences. A trailing odd
/// byte is ignored.
pub(crate) fn decode_utf16_lossy(raw: &[u8]) -> String {
    let units = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
    char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}
