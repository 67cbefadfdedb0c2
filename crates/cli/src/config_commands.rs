use std::path::Path;

use {anyhow::Result, clap::Subcommand};

use switchboard_config::{Severity, SwitchboardConfig, ValidationResult, validate_file};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Validate the configuration file and report errors/warnings.
    Check {
        /// Show informational diagnostics in addition to errors and warnings.
        #[arg(long)]
        verbose: bool,
    },
    /// Print the effective configuration with secrets redacted.
    Show,
}

pub fn handle_config(action: ConfigAction, config_path: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Check { verbose } => {
            let result = validate_file(config_path);
            let errors = report(&result, verbose);
            if errors > 0 {
                std::process::exit(1);
            }
            Ok(())
        },
        ConfigAction::Show => {
            let config = crate::load(config_path)?;
            print!("{}", render(&config)?);
            Ok(())
        },
    }
}

fn render(config: &SwitchboardConfig) -> Result<String> {
    Ok(toml::to_string_pretty(config)?)
}

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// Print diagnostics to stderr and return the error count.
fn report(result: &ValidationResult, verbose: bool) -> usize {
    if let Some(ref path) = result.config_path {
        eprintln!("Checking {}\n", path.display());
    } else {
        eprintln!("No config file found; checking defaults.\n");
    }

    let mut shown = 0;
    for d in &result.diagnostics {
        if d.severity == Severity::Info && !verbose {
            continue;
        }

        let (color, label) = match d.severity {
            Severity::Error => (RED, "error"),
            Severity::Warning => (YELLOW, "warning"),
            Severity::Info => (CYAN, "info"),
        };

        if d.path.is_empty() {
            eprintln!("  {BOLD}{color}{label}{RESET} {}", d.message);
        } else {
            eprintln!("  {BOLD}{color}{label}{RESET} {}: {}", d.path, d.message);
        }
        shown += 1;
    }

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);

    if shown > 0 {
        eprintln!();
    }

    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("{errors} error(s), {warnings} warning(s)");
    }
    errors
}
