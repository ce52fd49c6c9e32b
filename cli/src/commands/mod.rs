mod scan;

pub use scan::*;

use std::path::PathBuf;

use anyhow::anyhow;
use clap::{arg, command, crate_authors, Command};

use crate::{commands, help, APP_HELP_TEMPLATE};

pub fn command(name: &'static str) -> Command {
    Command::new(name).help_template(
        r#"{about-with-newline}
{usage-heading}
  {usage}

{all-args}
"#,
    )
}

pub fn cli() -> Command {
    command!()
        .author(crate_authors!("\n")) // requires `cargo` feature
        .arg_required_else_help(true)
        .arg(
            arg!(-C --config <CONFIG_FILE> "Config file")
                .value_parser(existing_path_parser)
                .long_help(help::CONFIG_FILE),
        )
        .help_template(APP_HELP_TEMPLATE)
        .subcommand_required(true)
        .subcommands(vec![commands::scan()])
}

/// Parses a path and makes sure that it exists.
fn existing_path_parser(input: &str) -> Result<PathBuf, anyhow::Error> {
    let path = PathBuf::from(input);
    if path.try_exists()? {
        Ok(path)
    } else {
        Err(anyhow!("file not found"))
    }
}

/// Parses a size in bytes, optionally followed by a `K`, `M` or `G` suffix
/// (powers of 1024).
fn size_parser(input: &str) -> Result<u64, anyhow::Error> {
    let input = input.trim();
    let (digits, multiplier) = match input.char_indices().last() {
        Some((pos, 'K' | 'k')) => (&input[..pos], 1 << 10),
        Some((pos, 'M' | 'm')) => (&input[..pos], 1 << 20),
        Some((pos, 'G' | 'g')) => (&input[..pos], 1 << 30),
        _ => (input, 1),
    };

    let n: u64 = digits
        .parse()
        .map_err(|_| anyhow!("`{}` is not a valid size", input))?;

    n.checked_mul(multiplier)
        .ok_or_else(|| anyhow!("`{}` is too large", input))
}
