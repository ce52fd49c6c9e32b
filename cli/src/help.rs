pub const CONFIG_FILE: &str = r#"Config file for docscan

Specifies a config file which controls the limits used while scanning. If the
config file is not specified, ${HOME}/.docscan.toml is used. If it does not
exist the default limits are applied.

Limits go in the [scan] table, for example:

[scan]
max_compression_ratio = 50
deadline = 5000
deep_macro_parsing = false

Options passed in the command line take precedence over the config file."#;

pub const OUTPUT_FORMAT_LONG_HELP: &str = r#"Output format

The format in which results will be displayed. Any errors or warnings will not
be in this format, only results.

Examples:

--output-format=ndjson"#;

pub const THREADS_LONG_HELP: &str = r#"Use the specified number of threads

The default value is automatically determined based on the number of CPU cores."#;

pub const SCAN_LONG_HELP: &str = r#"Scan a document or a directory of documents

<TARGET_PATH> can be an Office Open XML document (.docx, .xlsx, .pptx, or their
macro-enabled variants) or a directory. Every file in the directory is scanned,
whatever its extension. Files that are not documents are reported as malformed
containers.

For each file the verdict is printed, followed by the detected threats."#;

pub const SCAN_RECURSIVE_LONG_HELP: &str = r#"Scan directories recursively

When <TARGET_PATH> is a directory, this option enables recursive scanning
of its contents. You can optionally specify a <MAX_DEPTH> to limit how deep
the scan goes:

--recursive     scan nested subdirectories up to 100 levels deep.
--recursive=0   scan only the files in <TARGET_PATH> (no subdirectories)
--recursive=3   scan up to 3 levels deep, including nested subdirectories

If --recursive is not specified, the default behavior is --recursive=0."#;

pub const TIMEOUT_LONG_HELP: &str = r#"Stop analyzing a document after the given number of seconds

The deadline applies to every document independently. When a document runs out
of time the result is partial and includes a ScanTimeout threat."#;

pub const NO_DEEP_MACRO_LONG_HELP: &str = r#"Don't parse VBA projects

Macro projects are still detected from the structure of the compound files
that contain them, but auto-run triggers are not looked for and results are
marked as degraded."#;
