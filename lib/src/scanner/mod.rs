/*! This module implements the document scanner.

The scanner runs every stage of the pipeline over a document: the container
loader, the XML inspector, the OLE locator and stream analyzer, and the
macro detector. It aggregates what they find into a [`ScanResult`].

A scan never fails. Malformed or hostile input, an invalid configuration
or a panic inside some stage all end up as findings in the result.
*/
use std::any::Any;
use std::fs;
use std::hash::BuildHasherDefault;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use log::*;
use rustc_hash::FxHasher;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::{ConfigError, ScanConfig};
use crate::container::{self, Loaded, Part};
use crate::models::{ScanResult, Severity, ThreatKind, ThreatRecord};
use crate::ole::{self, OleFile};
use crate::vba::{self, MacroAnalyzer, MacroInput};
use crate::xml;


/// Error returned by [`Scanner::scan_file`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ScanError {
    /// Could not open the scanned file.
    #[error("can not open `{path}`: {err}")]
    OpenError {
        /// Path of the file being scanned.
        path: PathBuf,
        /// Error that occurred.
        err: std::io::Error,
    },
}

/// Soft deadline of a scan. Stages check it at part and stream boundaries.
pub(crate) struct Deadline {
    start: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        Self { start: Instant::now(), budget }
    }

    pub fn expired(&self) -> bool {
        self.start.elapsed() >= self.budget
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

type CacheMap = IndexMap<[u8; 32], ScanResult, BuildHasherDefault<FxHasher>>;

/// Results of previous scans, keyed by the SHA-256 digest of the scanned
/// data. When full, the oldest result is evicted.
struct ScanCache {
    entries: RwLock<CacheMap>,
    capacity: usize,
}

impl ScanCache {
    fn new(capacity: usize) -> Self {
        Self { entries: RwLock::new(CacheMap::default()), capacity }
    }

    fn get(&self, key: &[u8; 32]) -> Option<ScanResult> {
        // A poisoned lock is a miss, the scan is just repeated.
        self.entries.read().ok()?.get(key).cloned()
    }

    fn insert(&self, key: [u8; 32], result: &ScanResult) {
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        if entries.len() >= self.capacity {
            entries.shift_remove_index(0);
        }
        entries.insert(key, result.clone());
    }

    fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }
}

/// What the analysis of a single part produced.
#[derive(Default)]
struct PartOutcome {
    threats: Vec<ThreatRecord>,
    degraded: bool,
    timed_out: bool,
}

/// Scans documents.
///
/// A scanner is created once with some [`ScanConfig`] and can be shared
/// among threads, [`Scanner::scan`] only needs a shared reference.
///
/// ```
/// # use docscan::{ScanConfig, Scanner, Verdict};
/// let scanner = Scanner::new(ScanConfig::default());
/// let result = scanner.scan(b"definitely not a zip file");
/// assert_eq!(result.verdict(), Verdict::Medium);
/// ```
pub struct Scanner {
    config: ScanConfig,
    config_error: Option<ConfigError>,
    analyzer: Box<dyn MacroAnalyzer>,
    cache: Option<ScanCache>,
}

impl Scanner {
    /// Creates a new scanner.
    ///
    /// The configuration is validated here. If it's invalid the scanner is
    /// still created, but every scan produces a single
    /// [`ThreatKind::InternalError`] describing the problem.
    pub fn new(config: ScanConfig) -> Self {
        let config_error = config.validate().err();
        if let Some(err) = &config_error {
            error!("invalid scan configuration: {}", err);
        }

        let analyzer = vba::analyzer_for(&config);
        debug!("macro analyzer: {}", analyzer.name());

        let cache = (config.cache_capacity > 0)
            .then(|| ScanCache::new(config.cache_capacity));

        Self { config, config_error, analyzer, cache }
    }

    /// Returns the configuration used by this scanner.
    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Scans a document held in memory.
    pub fn scan(&self, data: &[u8]) -> ScanResult {
        self.scan_named(data, None)
    }

    /// Scans a document held in memory. `name` only appears in logs.
    pub fn scan_named(&self, data: &[u8], name: Option<&str>) -> ScanResult {
        let name = name.unwrap_or("<memory>");

        let key = self
            .cache
            .as_ref()
            .map(|_| -> [u8; 32] { Sha256::digest(data).into() });

        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some(result) = cache.get(key) {
                debug!("`{}` found in cache", name);
                return result;
            }
        }

        let result = self.scan_uncached(data, name);

        // Partial results are not cached, a later scan may complete.
        let partial = result.has(ThreatKind::ScanTimeout)
            || result.has(ThreatKind::InternalError);

        if let (Some(cache), Some(key), false) = (&self.cache, key, partial) {
            cache.insert(key, &result);
        }

        result
    }

    /// Scans a file.
    pub fn scan_file<P>(&self, target: P) -> Result<ScanResult, ScanError>
    where
        P: AsRef<Path>,
    {
        let path = target.as_ref();
        let data = fs::read(path).map_err(|err| ScanError::OpenError {
            path: path.to_path_buf(),
            err,
        })?;
        Ok(self.scan_named(&data, path.to_str()))
    }

    /// Removes every result from the cache.
    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    fn scan_uncached(&self, data: &[u8], name: &str) -> ScanResult {
        let deadline = Deadline::new(self.config.deadline);
        let mut result = ScanResult::default();

        if let Some(err) = &self.config_error {
            result.threats.push(
                ThreatRecord::new(ThreatKind::InternalError, Severity::High, "")
                    .with_evidence("stage", "config")
                    .with_evidence("reason", err),
            );
            return result;
        }

        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| {
            self.run(data, name, &deadline, &mut result)
        })) {
            result.threats.push(internal_error("container", "", panic));
        }

        result.container_metadata.scan_duration = deadline.elapsed();

        info!(
            "scanned `{}`: {} ({} threats) in {:?}",
            name,
            result.verdict(),
            result.threats.len(),
            result.container_metadata.scan_duration
        );

        result
    }

    /// Runs the pipeline, appending findings to `result` in detection
    /// order.
    fn run(
        &self,
        data: &[u8],
        name: &str,
        deadline: &Deadline,
        result: &mut ScanResult,
    ) {
        let mut container = match container::load(data, &self.config) {
            Loaded::Parsed(container) => container,
            Loaded::Rejected(threat) => {
                debug!("`{}` is not a readable container", name);
                result.threats.push(threat);
                return;
            }
        };

        result.container_metadata = container.metadata().clone();
        result.threats.extend(container.take_findings());

        let parts = container.parts().to_vec();
        let mut analyzed = 0;
        let mut timed_out = false;

        for part in &parts {
            if deadline.expired() {
                timed_out = true;
                break;
            }

            let data = match container.read_part(part) {
                Ok(data) => data,
                Err(err) => {
                    warn!("part `{}` of `{}`: {}", part.name, name, err);
                    result.threats.push(err.into_threat(part));
                    continue;
                }
            };

            let outcome = catch_unwind(AssertUnwindSafe(|| {
                self.analyze_part(part, &data, deadline)
            }))
            .unwrap_or_else(|panic| PartOutcome {
                threats: vec![internal_error("part", &part.name, panic)],
                ..Default::default()
            });

            analyzed += 1;
            result.threats.extend(outcome.threats);
            result.degraded |= outcome.degraded;

            if outcome.timed_out {
                timed_out = true;
                break;
            }
        }

        if timed_out {
            warn!(
                "scan of `{}` timed out after {} of {} parts",
                name,
                analyzed,
                parts.len()
            );
            result.threats.push(
                ThreatRecord::new(ThreatKind::ScanTimeout, Severity::Medium, "")
                    .with_evidence(
                        "deadline_ms",
                        self.config.deadline.as_millis(),
                    )
                    .with_evidence("parts_analyzed", analyzed)
                    .with_evidence("parts_admitted", parts.len()),
            );
        }
    }

    /// Runs the stages that apply to a single part.
    fn analyze_part(
        &self,
        part: &Part,
        data: &[u8],
        deadline: &Deadline,
    ) -> PartOutcome {
        let mut outcome = PartOutcome::default();

        if part.has_xml_name() || xml::looks_like_xml(data) {
            debug!("inspecting XML part `{}`", part.name);
            outcome.threats = xml::inspect(&part.name, data);
            return outcome;
        }

        outcome.threats.extend(ole::inspect_part_name(&part.name));

        if !ole::is_ole(data) {
            debug!("binary part `{}` classified as Unknown", part.name);
            return outcome;
        }

        let file = match OleFile::parse(data) {
            Ok(file) => file,
            Err(err) => {
                outcome.threats.push(ole::parse_error(
                    &part.name,
                    data.len(),
                    &err,
                ));
                return outcome;
            }
        };

        let mut streams = Vec::with_capacity(file.streams().len());
        let mut suspicious_names = Vec::new();

        // Resolving a stream's offset walks its sector chain, so the
        // deadline is checked before each one.
        for stream in file.streams() {
            if deadline.expired() {
                outcome.timed_out = true;
                return outcome;
            }
            let descriptor = match ole::describe(&file, stream) {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    outcome.threats.push(ole::parse_error(
                        &part.name,
                        data.len(),
                        &err,
                    ));
                    return outcome;
                }
            };
            debug!(
                "`{}`: stream `{}` ({} bytes at {:#x}) is {:?}",
                part.name,
                descriptor.escaped_name(),
                descriptor.size_bytes,
                descriptor.byte_offset,
                descriptor.classification
            );
            suspicious_names
                .extend(ole::inspect_stream_name(&part.name, &descriptor));
            streams.push(descriptor);
        }

        outcome.threats.extend(suspicious_names);

        let input = MacroInput {
            part: &part.name,
            file: &file,
            streams: &streams,
            limit: self.config.max_part_bytes,
            deadline,
        };

        if input.has_macro_streams() {
            let report = self.analyzer.analyze(&input);
            outcome.threats.extend(report.threats);
            outcome.degraded |= report.degraded;
            outcome.timed_out = report.timed_out;
        }

        outcome
    }
}

/// Builds the finding for a panic caught at a stage boundary.
fn internal_error(
    stage: &str,
    part: &str,
    panic: Box<dyn Any + Send>,
) -> ThreatRecord {
    let reason = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());

    error!("panic while scanning `{}` ({} stage): {}", part, stage, reason);

    ThreatRecord::new(ThreatKind::InternalError, Severity::High, part)
        .with_evidence("stage", stage)
        .with_evidence("reason", reason)
}
