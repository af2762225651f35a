use argprobe_core::config::{ArgprobeConfig, SandboxBackendType};
use argprobe_core::dictionary::Dictionary;
use argprobe_core::fuzzer::{ArgumentsFuzzer, Finding, FuzzerOptions};
use argprobe_core::oracle::OracleClient;
use argprobe_core::sandbox::SandboxSession;

use clap::{Parser, ValueEnum};
use log::info;
use std::path::PathBuf;
use std::time::Instant;

const DEFAULT_CONFIG_FILE: &str = "argprobe.toml";

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Backend {
    Docker,
    Local,
}

impl From<Backend> for SandboxBackendType {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Docker => SandboxBackendType::Docker,
            Backend::Local => SandboxBackendType::Local,
        }
    }
}

/// Fuzz the arguments of an ELF executable.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// ELF executable to analyze
    #[clap(long)]
    elf: PathBuf,
    /// Newline-delimited arguments dictionary
    #[clap(long)]
    dictionary: PathBuf,
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Per-execution timeout in seconds
    #[clap(long, value_parser = clap::value_parser!(u64).range(1..))]
    timeout: Option<u64>,
    #[clap(long, value_enum)]
    backend: Option<Backend>,
    /// Add random garbage tokens to the baseline
    #[clap(long)]
    random_baseline: bool,
    /// Print the full report as JSON
    #[clap(long)]
    json: bool,
}

fn load_config(cli: &Cli) -> Result<ArgprobeConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            ArgprobeConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_config_path.exists() {
                info!("Loading default configuration: {default_config_path:?}");
                ArgprobeConfig::load_from_file(&default_config_path)?
            } else {
                info!("No config file found, using built-in defaults");
                ArgprobeConfig::default()
            }
        }
    };

    if let Some(timeout) = cli.timeout {
        config.fuzzer.timeout_secs = timeout;
    }
    if let Some(backend) = cli.backend {
        config.sandbox.backend = backend.into();
    }
    if cli.random_baseline {
        config.fuzzer.random_baseline_arguments = true;
    }
    config.validate()?;
    Ok(config)
}

fn print_findings(findings: &[Finding]) {
    if findings.is_empty() {
        println!("No argument was detected for the given program.");
        return;
    }
    println!("Several arguments were detected for the given program:");
    for finding in findings {
        let roles: Vec<String> = finding.roles.iter().map(ToString::to_string).collect();
        let argument = if finding.argument.is_empty() {
            "(no argument)"
        } else {
            finding.argument.as_str()
        };
        println!("{argument}\t{}", roles.join(", "));
    }
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    log::debug!("Effective configuration: {config:#?}");

    let dictionary = Dictionary::load(&cli.dictionary)?;
    info!("Loaded {} tokens from {:?}", dictionary.len(), cli.dictionary);

    let session = SandboxSession::create(&cli.elf, &config.sandbox)?;
    let oracle = OracleClient::new(session, config.fuzzer.timeout());
    let mut fuzzer = ArgumentsFuzzer::new(
        oracle,
        dictionary.into_tokens(),
        FuzzerOptions::from(&config.fuzzer),
    );

    let start_time = Instant::now();
    let report = fuzzer.run()?;
    info!("Fuzzing finished in {:.2?}", start_time.elapsed());

    // Tear the sandbox down before printing.
    drop(fuzzer.into_oracle().into_session());

    if cli.json {
        println!("{}", report.to_json_pretty()?);
    } else {
        print_findings(&report.findings);
    }
    Ok(())
}
