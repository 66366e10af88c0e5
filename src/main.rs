//! Jury node binary.
//!
//! Usage:
//!   jury demo                      # run the in-process protocol demo
//!   jury demo --jurors 5 --sig-num 3
//!   jury keygen                    # create or show the configured account keys
//!   jury --data-dir ./node1 keygen

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use jury::config::JuryConfig;
use jury::demo::{run_demo, DemoOptions};
use jury::transaction::Address;

/// Permissioned contract-execution jury.
#[derive(Parser, Debug)]
#[command(
    name = "jury",
    version,
    about = "Jury core for permissioned DAG contract execution"
)]
struct Cli {
    /// Data directory holding jury.toml and key files.
    #[arg(long, default_value = "./jury-data", global = true)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the protocol demo on an in-process network.
    Demo {
        /// Number of jurors to start.
        #[arg(long, default_value_t = 4)]
        jurors: usize,

        /// Signatures required to commit a user-contract result.
        #[arg(long, default_value_t = jury::constants::CONTRACT_SIG_NUM)]
        sig_num: usize,

        /// Per-step timeout in seconds.
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },

    /// Load or generate the signing keys listed in jury.toml.
    Keygen,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Demo {
            jurors,
            sig_num,
            timeout_secs,
        } => {
            let report = run_demo(DemoOptions {
                jurors,
                sig_num,
                step_timeout: Duration::from_secs(timeout_secs),
            })
            .await?;
            tracing::info!(?report, "Demo finished");
            Ok(())
        }
        Command::Keygen => run_keygen(&cli.data_dir),
    }
}

fn run_keygen(data_dir: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = JuryConfig::load(data_dir);
    if config.jury.accounts.is_empty() {
        println!("No accounts configured in {}", data_dir.join("jury.toml").display());
        return Ok(());
    }
    for file in &config.jury.accounts {
        let keypair = jury::node::load_or_generate_keypair(&data_dir.join(file))?;
        println!("{file}: {}", Address::from_public_key(&keypair.public));
    }
    Ok(())
}
