/*! Inspects the XML parts of a container.

Parts are parsed with DTD processing disabled, so the parser neither expands
entities nor fetches anything. The presence of a DTD is detected on the raw
text before parsing, because in an Office document the declaration alone is
already suspicious.
*/
use memchr::memmem;
use roxmltree::{Document, Node, ParsingOptions};

use log::*;

use crate::models::{decode_utf16_lossy, Severity, ThreatKind, ThreatRecord};


/// Maximum number of nodes in a single XML part.
const NODES_LIMIT: u32 = 1_000_000;

/// Maximum length of text copied into evidence.
const EVIDENCE_LEN: usize = 256;

/// Name of the part that lists content types.
const CONTENT_TYPES_PART: &str = "[Content_Types].xml";

/// URL schemes that launch local handlers or reach the local file system.
const DANGEROUS_SCHEMES: &[&str] = &[
    "file",
    "mhtml",
    "mk",
    "its",
    "search",
    "search-ms",
    "javascript",
    "vbscript",
];

/// Relationship types that make the application fetch and load content
/// when the document is opened.
const AUTO_FETCH_RELATIONSHIPS: &[&str] = &[
    "attachedTemplate",
    "oleObject",
    "frame",
    "subDocument",
    "externalLinkPath",
];

/// Returns true if `data` starts like an XML document.
pub(crate) fn looks_like_xml(data: &[u8]) -> bool {
    let data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
    if data.starts_with(b"\xFF\xFE<\x00") {
        return true;
    }
    data.iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'<')
}

/// Inspects an XML part and returns the threats found in it.
pub(crate) fn inspect(part: &str, data: &[u8]) -> Vec<ThreatRecord> {
    let mut threats = Vec::new();

    let text = match decode(data) {
        Ok(text) => text,
        Err(reason) => {
            threats.push(parse_error(part, reason));
            return threats;
        }
    };

    let has_dtd = match inspect_dtd(part, &text) {
        Some(threat) => {
            threats.push(threat);
            true
        }
        None => false,
    };

    let mut options = ParsingOptions::default();
    options.allow_dtd = false;
    options.nodes_limit = NODES_LIMIT;

    let doc = match Document::parse_with_options(&text, options) {
        Ok(doc) => doc,
        Err(roxmltree::Error::DtdDetected) if has_dtd => return threats,
        Err(err) => {
            warn!("XML part `{}` can not be parsed: {}", part, err);
            threats.push(parse_error(part, err));
            return threats;
        }
    };

    if part.to_ascii_lowercase().ends_with(".rels") {
        inspect_relationships(part, &doc, &mut threats);
    } else if part == CONTENT_TYPES_PART {
        inspect_content_types(part, &doc, &mut threats);
    } else {
        inspect_fields(part, &doc, &mut threats);
    }

    threats
}

/// Decodes the part as UTF-8, or UTF-16LE when it starts with the
/// corresponding byte order mark.
fn decode(data: &[u8]) -> Result<String, &'static str> {
    if let Some(utf16) = data.strip_prefix(b"\xFF\xFE") {
        return Ok(decode_utf16_lossy(utf16));
    }
    let data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
    std::str::from_utf8(data)
        .map(str::to_string)
        .map_err(|_| "invalid UTF-8")
}

fn parse_error<R: ToString>(part: &str, reason: R) -> ThreatRecord {
    ThreatRecord::new(ThreatKind::OleParseError, Severity::Medium, part)
        .with_evidence("stage", "xml")
        .with_evidence("reason", reason)
        .with_hint("treat the part as untrusted; it is not well-formed XML")
}

fn truncate(s: &str) -> String {
    s.chars()
        .take(EVIDENCE_LEN)
        .collect::<String>()
        .escape_default()
        .to_string()
}

/// Looks for a document type declaration. Returns a threat if there's one.
fn inspect_dtd(part: &str, text: &str) -> Option<ThreatRecord> {
    let bytes = text.as_bytes();
    let start = memmem::find(bytes, b"<!DOCTYPE")?;

    // Without internal subset, the declaration ends with the first `>`.
    // An internal subset opens with `[` before that `>` and ends with `]>`.
    let dtd = &bytes[start..];
    let first_gt = memchr::memchr(b'>', dtd);
    let end = match memchr::memchr(b'[', dtd) {
        Some(open) if first_gt.map_or(true, |gt| open < gt) => {
            memmem::find(&dtd[open..], b"]>")
                .map_or(dtd.len(), |pos| open + pos + 2)
        }
        _ => first_gt.map_or(dtd.len(), |gt| gt + 1),
    };
    let dtd = &dtd[..end];

    let entity_count = memmem::find_iter(dtd, b"<!ENTITY").count();
    let parameter_entities = memmem::find_iter(dtd, b"<!ENTITY %").count();
    let external = memmem::find(dtd, b"SYSTEM").is_some()
        || memmem::find(dtd, b"PUBLIC").is_some();

    let severity = if entity_count > 0 || external {
        Severity::High
    } else {
        Severity::Medium
    };

    warn!(
        "XML part `{}` declares a DTD with {} entities (external: {})",
        part, entity_count, external
    );

    Some(
        ThreatRecord::new(ThreatKind::XxeOrExternalEntity, severity, part)
            .with_evidence(
                "declaration",
                truncate(&String::from_utf8_lossy(dtd)),
            )
            .with_evidence("entity_count", entity_count)
            .with_evidence("parameter_entities", parameter_entities)
            .with_evidence("external", external)
            .with_evidence("byte_offset", start),
    )
}

/// Returns the scheme of a URL-like `target`, lowercase.
fn scheme(target: &str) -> Option<String> {
    let (scheme, _) = target.split_once(':')?;
    // A single letter is a drive letter, not a scheme.
    if scheme.len() < 2
        || !scheme.starts_with(|c: char| c.is_ascii_alphabetic())
        || !scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    {
        return None;
    }
    Some(scheme.to_ascii_lowercase())
}

fn is_local_path(target: &str) -> bool {
    let mut chars = target.chars();
    let first = chars.next();
    let second = chars.next();
    target.starts_with("\\\\")
        || target.starts_with("//")
        || (first.is_some_and(|c| c.is_ascii_alphabetic())
            && second == Some(':'))
}

/// Decides how dangerous an external relationship is.
///
/// Targets that reach the local file system or a protocol handler are
/// always [`Severity::High`], and so are relationships that make the
/// application load the target as soon as the document is opened (remote
/// templates, OLE links, frames). Other web targets are
/// [`Severity::Medium`], except hyperlinks, which need a click and are
/// [`Severity::Low`]. Scheme-less targets are relative to the document's
/// own location and are [`Severity::Low`].
pub(crate) fn remote_reference_severity(
    rel_type: &str,
    target: &str,
) -> Severity {
    let kind = rel_type.rsplit('/').next().unwrap_or(rel_type);
    let auto_fetch = AUTO_FETCH_RELATIONSHIPS
        .iter()
        .any(|t| t.eq_ignore_ascii_case(kind));
    let target = target.trim();

    let scheme = match scheme(target) {
        Some(scheme) => scheme,
        None if is_local_path(target) => return Severity::High,
        None if auto_fetch => return Severity::High,
        None => return Severity::Low,
    };

    if auto_fetch
        || scheme.starts_with("ms-")
        || DANGEROUS_SCHEMES.contains(&scheme.as_str())
    {
        return Severity::High;
    }

    match scheme.as_str() {
        "http" | "https" | "mailto"
            if kind.eq_ignore_ascii_case("hyperlink") =>
        {
            Severity::Low
        }
        _ => Severity::Medium,
    }
}

fn inspect_relationships(
    part: &str,
    doc: &Document,
    threats: &mut Vec<ThreatRecord>,
) {
    let relationships = doc
        .descendants()
        .filter(|n| n.has_tag_name_local("Relationship"));

    for rel in relationships {
        let external = rel
            .attribute("TargetMode")
            .is_some_and(|mode| mode.eq_ignore_ascii_case("External"));
        if !external {
            continue;
        }

        let rel_type = rel.attribute("Type").unwrap_or_default();
        let target = rel.attribute("Target").unwrap_or_default();
        let severity = remote_reference_severity(rel_type, target);

        debug!("`{}` references external target `{}`", part, target);

        threats.push(
            ThreatRecord::new(
                ThreatKind::DangerousRemoteReference,
                severity,
                part,
            )
            .with_evidence("id", rel.attribute("Id").unwrap_or_default())
            .with_evidence("type", rel_type)
            .with_evidence("target", truncate(target)),
        );
    }
}

fn inspect_content_types(
    part: &str,
    doc: &Document,
    threats: &mut Vec<ThreatRecord>,
) {
    for node in doc.descendants().filter(|n| n.is_element()) {
        let Some(content_type) = node.attribute("ContentType") else {
            continue;
        };
        let lowercase = content_type.to_ascii_lowercase();
        if !lowercase.contains("vbaproject")
            && !lowercase.contains("macroenabled")
        {
            continue;
        }
        let declared_for = node
            .attribute("PartName")
            .or_else(|| node.attribute("Extension"))
            .unwrap_or_default();

        threats.push(
            ThreatRecord::new(
                ThreatKind::SuspiciousStreamName,
                Severity::Info,
                part,
            )
            .with_evidence("content_type", content_type)
            .with_evidence("declared_for", declared_for),
        );
    }
}

/// Looks for dynamic data exchange fields, which run commands when the
/// document is opened and the user accepts to update links.
fn inspect_fields(
    part: &str,
    doc: &Document,
    threats: &mut Vec<ThreatRecord>,
) {
    // A single field instruction is often split across several runs, so
    // the pieces are joined before looking at them.
    let mut instructions = String::new();
    for node in doc.descendants() {
        if node.has_tag_name_local("instrText") {
            instructions.extend(node.text());
        } else if node.has_tag_name_local("fldSimple") {
            instructions.push(' ');
            instructions.extend(
                node.attributes()
                    .find(|attr| attr.name() == "instr")
                    .map(|attr| attr.value()),
            );
            instructions.push(' ');
        }
    }

    let upper = instructions.to_ascii_uppercase();
    let keyword = upper.split(|c: char| !c.is_ascii_alphanumeric()).find(
        |word| *word == "DDE" || *word == "DDEAUTO",
    );

    if let Some(keyword) = keyword {
        warn!("`{}` contains a {} field", part, keyword);
        threats.push(
            ThreatRecord::new(
                ThreatKind::AutoRunTriggerDetected,
                Severity::High,
                part,
            )
            .with_evidence("field", keyword)
            .with_evidence("instruction", truncate(instructions.trim())),
        );
    }
}

trait NodeExt {
    fn has_tag_name_local(&self, name: &str) -> bool;
}

impl NodeExt for Node<'_, '_> {
    /// Compares the local name of the element, ignoring its namespace.
    fn has_tag_name_local(&self, name: &str) -> bool {
        self.is_element() && self.tag_name().name() == name
    }
}
