use std::io::{stdout, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{arg, value_parser, ArgMatches, Command, ValueEnum};
use rayon::prelude::*;
use yansi::Color::{self, Cyan, Green, Red, Yellow};
use yansi::Paint;

use docscan::{ScanConfig, ScanResult, Scanner, Severity, Verdict};

use crate::commands::size_parser;
use crate::help;
use crate::walk::Walker;

#[derive(Clone, ValueEnum)]
enum OutputFormats {
    /// Default output format.
    Text,
    /// Newline delimited JSON (i.e: one JSON object per line).
    Ndjson,
}

#[rustfmt::skip]
pub fn scan() -> Command {
    super::command("scan")
        .about("Scan a document or directory")
        .long_about(help::SCAN_LONG_HELP)
        .arg(
            arg!(<TARGET_PATH>)
                .help("Path to the file or directory that will be scanned")
                .value_parser(value_parser!(PathBuf))
        )
        // Keep options sorted alphabetically by their long name.
        // For instance, --bar goes before --foo.
        .arg(
            arg!(--"max-part-size" <SIZE>)
                .help("Maximum uncompressed size of a single part (e.g. 64M)")
                .value_parser(size_parser)
        )
        .arg(
            arg!(--"max-ratio" <RATIO>)
                .help("Maximum compression ratio of a part")
                .value_parser(value_parser!(u64).range(1..))
        )
        .arg(
            arg!(--"max-total-size" <SIZE>)
                .help("Maximum uncompressed size of all parts together (e.g. 512M)")
                .value_parser(size_parser)
        )
        .arg(
            arg!(--"no-deep-macro")
                .help("Detect macro projects without parsing them")
                .long_help(help::NO_DEEP_MACRO_LONG_HELP)
        )
        .arg(
            arg!(-o --"output-format" <FORMAT>)
                .help("Output format for results")
                .long_help(help::OUTPUT_FORMAT_LONG_HELP)
                .value_parser(value_parser!(OutputFormats))
        )
        .arg(
            arg!(-r --"recursive" [MAX_DEPTH])
                .help("Scan directories recursively")
                .long_help(help::SCAN_RECURSIVE_LONG_HELP)
                .default_missing_value("100")
                .require_equals(true)
                .value_parser(value_parser!(usize))
        )
        .arg(
            arg!(-p --"threads" <NUM_THREADS>)
                .help("Use the given number of threads")
                .long_help(help::THREADS_LONG_HELP)
                .value_parser(value_parser!(u8).range(1..))
        )
        .arg(
            arg!(-a --"timeout" <SECONDS>)
                .help("Stop analyzing a document after the given number of seconds")
                .long_help(help::TIMEOUT_LONG_HELP)
                .value_parser(value_parser!(u64).range(1..))
        )
}

/// Applies the command-line options to the configuration read from the
/// config file.
fn scan_config(args: &ArgMatches, mut config: ScanConfig) -> ScanConfig {
    if let Some(timeout) = args.get_one::<u64>("timeout") {
        config = config.deadline(Duration::from_secs(*timeout));
    }
    if let Some(ratio) = args.get_one::<u64>("max-ratio") {
        config = config.max_compression_ratio(*ratio);
    }
    if let Some(size) = args.get_one::<u64>("max-part-size") {
        config = config.max_part_bytes(*size);
    }
    if let Some(size) = args.get_one::<u64>("max-total-size") {
        config = config.max_total_uncompressed_bytes(*size);
    }
    if args.get_flag("no-deep-macro") {
        config = config.deep_macro_parsing(false);
    }
    config
}

pub fn exec_scan(args: &ArgMatches, config: ScanConfig) -> anyhow::Result<()> {
    let target_path = args.get_one::<PathBuf>("TARGET_PATH").unwrap();
    let num_threads = args.get_one::<u8>("threads");
    let recursive = args.get_one::<usize>("recursive");
    let output_format = args.get_one::<OutputFormats>("output-format");

    if recursive.is_some() && target_path.is_file() {
        bail!(
            "can't use '{}' when <TARGET_PATH> is a file",
            Paint::bold("--recursive")
        );
    }

    let config = scan_config(args, config);

    // The scanner reports an invalid configuration as a finding in every
    // result. In the command line it's better to fail early.
    config.validate().context("invalid configuration")?;

    let mut walker = Walker::path(target_path);
    walker.max_depth(*recursive.unwrap_or(&0));

    let files = walker.collect(Err)?;

    let mut pool = rayon::ThreadPoolBuilder::new();
    if let Some(num_threads) = num_threads {
        pool = pool.num_threads(*num_threads as usize);
    }
    let pool = pool.build()?;

    let scanner = Scanner::new(config);

    // Files are scanned in parallel but results are printed in the order
    // in which the files were found.
    let results = pool.install(|| {
        files
            .par_iter()
            .map(|path| scanner.scan_file(path))
            .collect::<Vec<_>>()
    });

    let mut errors = 0;
    let mut stdout = stdout().lock();

    for (path, result) in files.iter().zip(results) {
        match result {
            Ok(result) => match output_format {
                Some(OutputFormats::Ndjson) => {
                    print_json(&mut stdout, path, &result)?
                }
                Some(OutputFormats::Text) | None => {
                    print_text(&mut stdout, path, &result)?
                }
            },
            Err(err) => {
                errors += 1;
                eprintln!("{} {}", "error:".paint(Red).bold(), err);
            }
        }
    }

    if errors > 0 {
        bail!("{} file(s) could not be scanned", errors);
    }

    Ok(())
}

fn verdict_color(verdict: Verdict) -> Color {
    match verdict {
        Verdict::Clean => Green,
        Verdict::Info | Verdict::Low => Cyan,
        Verdict::Medium => Yellow,
        Verdict::High | Verdict::Critical => Red,
    }
}

fn severity_color(severity: Severity) -> Color {
    match severity {
        Severity::Info | Severity::Low => Cyan,
        Severity::Medium => Yellow,
        Severity::High | Severity::Critical => Red,
    }
}

fn print_text<W: Write>(
    output: &mut W,
    path: &Path,
    result: &ScanResult,
) -> anyhow::Result<()> {
    let verdict = result.verdict();

    writeln!(
        output,
        "{} {}{}",
        verdict.to_string().paint(verdict_color(verdict)).bold(),
        path.display(),
        if result.degraded { " (degraded)" } else { "" }
    )?;

    for threat in &result.threats {
        let severity = threat.severity.to_string();

        let evidence = threat
            .evidence
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>()
            .join(" ");

        let part = if threat.source_part.is_empty() {
            String::new()
        } else {
            format!(" [{}]", threat.source_part)
        };

        writeln!(
            output,
            "  {} {:?}{}: {}",
            severity.paint(severity_color(threat.severity)),
            threat.kind,
            part,
            evidence
        )?;
    }

    Ok(())
}

fn print_json<W: Write>(
    output: &mut W,
    path: &Path,
    result: &ScanResult,
) -> anyhow::Result<()> {
    let json = serde_json::json!({
        "path": path.to_string_lossy(),
        "result": result,
    });
    writeln!(output, "{}", json)?;
    Ok(())
}
