//! PERMBRIDGE CLI
//!
//! Asks a guest module whether a user holds a permission on a meeting and
//! prints the answer as a sentence.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Parser, ValueEnum};
use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use permbridge_core::{BridgeConfig, KeyFraming};
use permbridge_loader::Loader;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "permbridge")]
#[command(about = "PERMBRIDGE - permission checks answered by a WASM guest", long_about = None)]
struct Cli {
    /// User to check
    user_id: i32,
    /// Meeting the permission applies to
    meeting_id: i32,
    /// Permission name
    perm: String,
    /// Module binary, as a path or HTTP(S) URL
    #[arg(long, default_value = "module.wasm")]
    module: String,
    /// Permission database, as a path or HTTP(S) URL
    #[arg(long, default_value = "db.json")]
    database: String,
    /// How the guest passes lookup keys
    #[arg(long, value_enum, default_value_t = Framing::NullTerminated)]
    key_framing: Framing,
    /// Fuel budget per check
    #[arg(long)]
    max_fuel: Option<u64>,
    /// Guest memory cap in bytes
    #[arg(long)]
    max_memory: Option<u64>,
    /// Fetch timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// Log filter directive
    #[arg(long, default_value = "permbridge=info")]
    log_filter: String,
    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Framing {
    /// Keys end with a NUL byte
    NullTerminated,
    /// Keys are passed as an (offset, length) pair
    LengthPrefixed,
}

impl From<Framing> for KeyFraming {
    fn from(framing: Framing) -> Self {
        match framing {
            Framing::NullTerminated => KeyFraming::NullTerminated,
            Framing::LengthPrefixed => KeyFraming::LengthPrefixed,
        }
    }
}

impl Cli {
    fn bridge_config(&self) -> BridgeConfig {
        let mut config = BridgeConfig::default().with_key_framing(self.key_framing.into());
        if let Some(fuel) = self.max_fuel {
            config = config.with_max_fuel(fuel);
        }
        if let Some(bytes) = self.max_memory {
            config = config.with_max_memory_bytes(bytes);
        }
        if let Some(secs) = self.timeout {
            config = config.with_fetch_timeout(Duration::from_secs(secs));
        }
        config
    }
}

async fn run(cli: &Cli) -> Result<String> {
    let checker = Loader::new(cli.bridge_config())?
        .load(&cli.module, &cli.database)
        .await
        .wrap_err_with(|| format!("loading {} with {}", cli.module, cli.database))?;

    let verdict = checker
        .check(cli.user_id, cli.meeting_id, &cli.perm)
        .wrap_err("permission check failed")?;
    tracing::info!(
        user_id = cli.user_id,
        meeting_id = cli.meeting_id,
        perm = %cli.perm,
        verdict = %verdict,
        "permission checked"
    );
    Ok(verdict.sentence(cli.user_id, &cli.perm))
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(cli.log_filter.as_str())
        .with_writer(std::io::stderr);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    println!("{}", run(&cli).await?);
    Ok(())
}
