//! hsm-ceremony CLI.
//!
//! Runs a single CA ceremony described by a YAML configuration file.

use ceremony::ceremony::run;
use ceremony::config::CeremonyConfig;
use ceremony::error::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hsm-ceremony")]
#[command(about = "Offline CA ceremonies against a PKCS#11 HSM", long_about = None)]
struct Cli {
    /// Path to ceremony configuration file
    #[arg(long)]
    config: PathBuf,

    /// Run against a throwaway in-memory token instead of the PKCS#11 module.
    /// Keys are lost when the process exits.
    #[arg(long)]
    rehearsal: bool,
}

fn run_ceremony(config: &CeremonyConfig, rehearsal: bool) -> Result<()> {
    if rehearsal {
        warn!("rehearsal: keys live in an in-memory token and are discarded on exit");
        return run(config, &ceremony::hsm::soft::SoftHsm::new());
    }
    run_on_device(config)
}

#[cfg(feature = "pkcs11")]
fn run_on_device(config: &CeremonyConfig) -> Result<()> {
    run(config, &ceremony::hsm::pkcs11::Pkcs11Connector)
}

#[cfg(not(feature = "pkcs11"))]
fn run_on_device(_config: &CeremonyConfig) -> Result<()> {
    Err(ceremony::CeremonyError::ConfigValidation(
        "built without PKCS#11 support; rebuild with --features pkcs11 or pass --rehearsal"
            .to_string(),
    ))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = CeremonyConfig::load(&cli.config)
        .and_then(|config| run_ceremony(&config, cli.rehearsal));
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key_config(dir: &TempDir) -> CeremonyConfig {
        let yaml = format!(
            "ceremony-type: key\n\
             pkcs11:\n  module: /usr/lib/softhsm/libsofthsm2.so\n  store-key-with-label: cli key\n\
             key:\n  type: ecdsa\n  ecdsa-curve: P-256\n\
             outputs:\n  public-key-path: {}\n",
            dir.path().join("cli.pub.pem").display()
        );
        CeremonyConfig::from_yaml(&yaml).unwrap()
    }

    #[test]
    fn test_rehearsal_is_opt_in() {
        let cli = Cli::try_parse_from(["hsm-ceremony", "--config", "root.yaml"]).unwrap();
        assert!(!cli.rehearsal);
        let cli =
            Cli::try_parse_from(["hsm-ceremony", "--config", "root.yaml", "--rehearsal"]).unwrap();
        assert!(cli.rehearsal);
    }

    #[test]
    fn test_rehearsal_runs_in_memory() {
        let dir = TempDir::new().unwrap();
        run_ceremony(&key_config(&dir), true).unwrap();
        assert!(dir.path().join("cli.pub.pem").exists());
    }

    #[cfg(not(feature = "pkcs11"))]
    #[test]
    fn test_no_device_support_refuses_to_run() {
        let dir = TempDir::new().unwrap();
        let err = run_ceremony(&key_config(&dir), false).unwrap_err();
        assert!(err.to_string().contains("--rehearsal"));
        assert!(!dir.path().join("cli.pub.pem").exists());
    }
}
