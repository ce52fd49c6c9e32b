/*! Detects VBA macro projects and the auto-run triggers in their source.

Detection is capability-gated. The [`MacroAnalyzer`] used by a scanner is
chosen once, when the scanner is created:

* [`VbaProjectAnalyzer`] decompresses the project's `dir` stream, finds
  every module and scans its source for procedures that run automatically.
  Only available with the `deep-macro-parsing` feature.
* [`PresenceOnlyAnalyzer`] reports the macro project from the shape of the
  compound file alone, at a lower severity, and marks the result as
  degraded.
*/
use std::collections::BTreeSet;

use aho_corasick::{AhoCorasick, MatchKind};
use lazy_static::lazy_static;
use log::*;

use crate::config::ScanConfig;
use crate::models::{
    OleStreamDescriptor, Severity, StreamClass, ThreatKind, ThreatRecord,
};
use crate::ole::OleFile;
use crate::scanner::Deadline;

#[cfg(feature = "deep-macro-parsing")]
mod parser;


/// Procedures that Office runs when a document is opened, created, closed
/// or activated.
const AUTO_RUN_TRIGGERS: &[&str] = &[
    "AutoOpen",
    "Auto_Open",
    "AutoExec",
    "AutoNew",
    "AutoClose",
    "Auto_Close",
    "Document_Open",
    "Document_New",
    "Document_Close",
    "DocumentBeforeClose",
    "Workbook_Open",
    "Workbook_Activate",
    "Workbook_BeforeClose",
    "Auto_Activate",
    "Presentation_Open",
];

/// Event handlers of ActiveX controls that fire without user interaction
/// as soon as the control is rendered. They are matched as the suffix of
/// an identifier (`InkPicture1_Painted`).
const AUTO_RUN_HANDLER_SUFFIXES: &[&str] =
    &["_Layout", "_Painted", "_GotFocus", "_LostFocus", "_Resize"];

lazy_static! {
    static ref TRIGGERS: AhoCorasick = AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .match_kind(MatchKind::LeftmostLongest)
        .build(AUTO_RUN_TRIGGERS.iter().chain(AUTO_RUN_HANDLER_SUFFIXES))
        .unwrap();
}

#[cfg_attr(not(feature = "deep-macro-parsing"), allow(dead_code))]
fn is_identifier_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Returns the auto-run triggers found in `source`, sorted and without
/// duplicates.
///
/// Trigger names are matched ignoring case, and only when they are whole
/// identifiers. Handler suffixes must follow some identifier characters,
/// and the whole identifier is returned.
#[cfg_attr(not(feature = "deep-macro-parsing"), allow(dead_code))]
pub(crate) fn find_triggers(source: &[u8]) -> Vec<String> {
    let mut found = BTreeSet::new();

    for m in TRIGGERS.find_iter(source) {
        let ends_identifier =
            source.get(m.end()).map_or(true, |b| !is_identifier_byte(*b));
        if !ends_identifier {
            continue;
        }

        let pattern = m.pattern().as_usize();

        if let Some(trigger) = AUTO_RUN_TRIGGERS.get(pattern) {
            let starts_identifier = m.start() == 0
                || !is_identifier_byte(source[m.start() - 1]);
            if starts_identifier {
                found.insert(trigger.to_string());
            }
        } else {
            let start = source[..m.start()]
                .iter()
                .rposition(|b| !is_identifier_byte(*b))
                .map_or(0, |pos| pos + 1);
            if start < m.start() {
                found.insert(
                    String::from_utf8_lossy(&source[start..m.end()])
                        .into_owned(),
                );
            }
        }
    }

    found.into_iter().collect()
}

/// What a [`MacroAnalyzer`] looks at.
#[cfg_attr(not(feature = "deep-macro-parsing"), allow(dead_code))]
pub(crate) struct MacroInput<'a, 'data> {
    /// Container part holding the compound file.
    pub part: &'a str,
    pub file: &'a OleFile<'data>,
    /// Descriptors of every stream in `file`, in the same order as
    /// [`OleFile::streams`].
    pub streams: &'a [OleStreamDescriptor],
    /// Maximum number of bytes read or decompressed from any stream.
    pub limit: u64,
    pub deadline: &'a Deadline,
}

impl MacroInput<'_, '_> {
    /// Returns true if some stream looks like part of a VBA project.
    pub fn has_macro_streams(&self) -> bool {
        self.streams
            .iter()
            .any(|s| s.classification == StreamClass::LikelyMacroProject)
    }

    fn macro_stream_count(&self) -> usize {
        self.streams
            .iter()
            .filter(|s| s.classification == StreamClass::LikelyMacroProject)
            .count()
    }
}

/// Findings produced by a [`MacroAnalyzer`].
#[derive(Debug, Default)]
pub(crate) struct MacroReport {
    pub threats: Vec<ThreatRecord>,
    /// True if the analysis was less thorough than it could have been.
    pub degraded: bool,
    /// True if some stream or module was skipped because the deadline
    /// passed.
    pub timed_out: bool,
}

/// Examines the macro project inside a compound file.
pub(crate) trait MacroAnalyzer: Send + Sync {
    /// Name used in logs and evidence.
    fn name(&self) -> &'static str;

    /// Analyzes a compound file that has at least one macro-shaped stream.
    fn analyze(&self, input: &MacroInput) -> MacroReport;
}

/// Returns the analyzer to use with `config`.
#[cfg_attr(not(feature = "deep-macro-parsing"), allow(unused_variables))]
pub(crate) fn analyzer_for(config: &ScanConfig) -> Box<dyn MacroAnalyzer> {
    #[cfg(feature = "deep-macro-parsing")]
    {
        if config.deep_macro_parsing {
            return Box::new(VbaProjectAnalyzer);
        }
    }
    Box::new(PresenceOnlyAnalyzer)
}

/// Reports macro projects from the compound file structure alone.
pub(crate) struct PresenceOnlyAnalyzer;

impl MacroAnalyzer for PresenceOnlyAnalyzer {
    fn name(&self) -> &'static str {
        "presence-only"
    }

    fn analyze(&self, input: &MacroInput) -> MacroReport {
        warn!(
            "macro project in `{}` not parsed, deep macro parsing is disabled",
            input.part
        );

        MacroReport {
            threats: vec![
                ThreatRecord::new(
                    ThreatKind::VbaMacroDetected,
                    Severity::High.lowered(),
                    input.part,
                )
                .with_evidence("analyzer", self.name())
                .with_evidence("project_parsed", false)
                .with_evidence("macro_streams", input.macro_stream_count()),
                ThreatRecord::new(
                    ThreatKind::ToolDegraded,
                    Severity::Info,
                    input.part,
                )
                .with_evidence("capability", "deep-macro-parsing")
                .with_hint(
                    "enable deep macro parsing for detecting auto-run \
                     triggers",
                ),
            ],
            degraded: true,
            timed_out: false,
        }
    }
}

/// Parses VBA projects and scans the source of their modules.
#[cfg(feature = "deep-macro-parsing")]
pub(crate) struct VbaProjectAnalyzer;

#[cfg(feature = "deep-macro-parsing")]
struct ModuleReport {
    name: String,
    module_type: parser::ModuleType,
    triggers: Vec<String>,
}

#[cfg(feature = "deep-macro-parsing")]
struct ProjectReport {
    name: String,
    code_page: u16,
    modules: Vec<ModuleReport>,
    /// Modules were left unread when the deadline passed.
    timed_out: bool,
}

#[cfg(feature = "deep-macro-parsing")]
impl VbaProjectAnalyzer {
    /// Parses the project whose `dir` stream is `dir`.
    fn parse_project(
        &self,
        input: &MacroInput,
        dir: &crate::ole::StreamEntry,
    ) -> Result<ProjectReport, &'static str> {
        let limit = usize::try_from(input.limit).unwrap_or(usize::MAX);

        let compressed = input
            .file
            .read_stream(dir, input.limit)
            .map_err(|_| "Can not read dir stream")?;
        let dir_stream = parser::decompress_stream(&compressed, limit)?;
        let info = parser::DirInfo::parse(&dir_stream)?;

        let storage = dir.path.rsplit_once('/').map_or("", |(s, _)| s);
        let mut modules = Vec::with_capacity(info.modules.len());
        let mut timed_out = false;

        for module in &info.modules {
            if input.deadline.expired() {
                timed_out = true;
                break;
            }
            let path = if storage.is_empty() {
                module.stream_name.clone()
            } else {
                format!("{}/{}", storage, module.stream_name)
            };
            let stream = input
                .file
                .find_stream(&path)
                .ok_or("Module stream not found")?;
            let data = input
                .file
                .read_stream(stream, input.limit)
                .map_err(|_| "Can not read module stream")?;
            let source = module.source(&data, limit)?;

            debug!(
                "module `{}` in `{}`: {} bytes of source",
                module.name,
                input.part,
                source.len()
            );

            modules.push(ModuleReport {
                name: module.name.clone(),
                module_type: module.module_type,
                triggers: find_triggers(source.as_bytes()),
            });
        }

        Ok(ProjectReport {
            name: info.project_name,
            code_page: info.code_page,
            modules,
            timed_out,
        })
    }

    fn report_parsed(
        &self,
        input: &MacroInput,
        project: ProjectReport,
        report: &mut MacroReport,
    ) {
        report.timed_out |= project.timed_out;

        let has_triggers =
            project.modules.iter().any(|m| !m.triggers.is_empty());
        let module_names = project
            .modules
            .iter()
            .map(|m| m.name.as_str())
            .collect::<Vec<_>>()
            .join(",");

        report.threats.push(
            ThreatRecord::new(
                ThreatKind::VbaMacroDetected,
                if has_triggers { Severity::Critical } else { Severity::High },
                input.part,
            )
            .with_evidence("analyzer", self.name())
            .with_evidence("project_parsed", true)
            .with_evidence("project", project.name)
            .with_evidence("code_page", project.code_page)
            .with_evidence("modules", module_names),
        );

        for module in project.modules {
            if module.triggers.is_empty() {
                continue;
            }
            warn!(
                "module `{}` in `{}` has auto-run triggers: {}",
                module.name,
                input.part,
                module.triggers.join(",")
            );
            report.threats.push(
                ThreatRecord::new(
                    ThreatKind::AutoRunTriggerDetected,
                    Severity::Critical,
                    input.part,
                )
                .with_evidence("module", module.name)
                .with_evidence(
                    "module_type",
                    format!("{:?}", module.module_type),
                )
                .with_evidence("triggers", module.triggers.join(",")),
            );
        }
    }

    /// Reports a project that could not be parsed, scanning the raw bytes
    /// of the macro-shaped streams for triggers.
    fn report_unparsed(
        &self,
        input: &MacroInput,
        reason: &str,
        report: &mut MacroReport,
    ) {
        warn!(
            "macro project in `{}` can not be parsed: {}",
            input.part, reason
        );

        report.threats.push(
            ThreatRecord::new(
                ThreatKind::VbaMacroDetected,
                Severity::High,
                input.part,
            )
            .with_evidence("analyzer", self.name())
            .with_evidence("project_parsed", false)
            .with_evidence("reason", reason)
            .with_evidence("macro_streams", input.macro_stream_count()),
        );

        let macro_streams = input
            .file
            .streams()
            .iter()
            .zip(input.streams)
            .filter(|(_, d)| {
                d.classification == StreamClass::LikelyMacroProject
            });

        for (stream, descriptor) in macro_streams {
            if input.deadline.expired() {
                report.timed_out = true;
                break;
            }
            let Ok(data) = input.file.read_stream(stream, input.limit) else {
                continue;
            };
            let triggers = find_triggers(&data);
            if triggers.is_empty() {
                continue;
            }
            report.threats.push(
                ThreatRecord::new(
                    ThreatKind::AutoRunTriggerDetected,
                    Severity::Critical,
                    input.part,
                )
                .with_evidence("stream", descriptor.path.as_str())
                .with_evidence("triggers", triggers.join(","))
                .with_evidence("raw_scan", true),
            );
        }
    }
}

#[cfg(feature = "deep-macro-parsing")]
impl MacroAnalyzer for VbaProjectAnalyzer {
    fn name(&self) -> &'static str {
        "vba-project"
    }

    fn analyze(&self, input: &MacroInput) -> MacroReport {
        let mut report = MacroReport::default();

        let dirs = input
            .file
            .streams()
            .iter()
            .zip(input.streams)
            .filter(|(s, d)| {
                s.name.eq_ignore_ascii_case("dir")
                    && d.classification == StreamClass::LikelyMacroProject
            })
            .map(|(s, _)| s)
            .collect::<Vec<_>>();

        if dirs.is_empty() {
            self.report_unparsed(input, "No dir stream found", &mut report);
            return report;
        }

        for dir in dirs {
            match self.parse_project(input, dir) {
                Ok(project) => self.report_parsed(input, project, &mut report),
                Err(reason) => {
                    self.report_unparsed(input, reason, &mut report)
                }
            }
        }

        report
    }
}
