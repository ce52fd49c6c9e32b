/*! A security scanner for Office Open XML documents.

The scanner opens the ZIP container of a `.docx`, `.xlsx`, `.pptx` (or any of
their macro-enabled variants), and looks for the tricks used by malicious
documents: decompression bombs, XML external entities, remote templates and
other external references, embedded OLE objects, VBA macros and the
procedures that make them run automatically.

Documents are treated as hostile. Every size and offset found in them is
checked before use, decompression is bounded, DTDs are never processed and
nothing is ever fetched from the network.

The main type in this crate is [`Scanner`]. A scanner is created once with a
[`ScanConfig`] and can be shared by any number of threads. Each scan returns a
[`ScanResult`] holding the detected threats in the order they were found, a
verdict derived from them, and some facts about the container.

# Example

```rust
# use docscan::{ScanConfig, Scanner, ThreatKind, Verdict};
// Create a scanner with the default limits.
let scanner = Scanner::new(ScanConfig::default());

// Scan some data. Any input produces a result, even if it's not a
// document at all.
let result = scanner.scan(b"%PDF-1.7");

assert_eq!(result.verdict(), Verdict::Medium);
assert!(result.has(ThreatKind::MalformedContainer));
```
*/

#![deny(missing_docs)]

pub use config::ConfigError;
pub use config::ScanConfig;

pub use models::ContainerMetadata;
pub use models::OleStreamDescriptor;
pub use models::ScanResult;
pub use models::Severity;
pub use models::StreamClass;
pub use models::ThreatKind;
pub use models::ThreatRecord;
pub use models::Verdict;

pub use scanner::ScanError;
pub use scanner::Scanner;

pub use ole::OleError;

mod config;
mod container;
mod models;
mod scanner;
mod vba;
mod xml;

pub mod ole;

#[cfg(test)]
mod tests;
