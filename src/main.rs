use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

use tokenvault::{load_config, OAuthHandler, TokenStore};

/// Provisioning and inspection tool for the token vault
#[derive(Parser, Debug)]
#[command(name = "tokenvault", version, about = "Encrypted OAuth token custody")]
struct Cli {
    /// Configuration file (optional; defaults and TOKENVAULT_* env apply)
    #[arg(short, long, default_value = "tokenvault.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a new base64 encryption key
    Keygen,
    #[command(flatten)]
    Vault(VaultCommand),
}

/// Commands that open the configured token store
#[derive(Subcommand, Debug)]
enum VaultCommand {
    /// List stored identifiers
    List,
    /// Show whether an identifier is missing, unreadable, or present
    Status { identifier: String },
    /// Print a live access token, refreshing it first if needed
    Token { identifier: String },
    /// Print the provider authorization URL for an identifier
    ///
    /// The printed state is not remembered across invocations, so the CLI flow
    /// skips CSRF validation. Check that the redirect carries the same state
    /// before running `complete`.
    Authorize { identifier: String },
    /// Exchange an authorization code and store the result
    ///
    /// No CSRF state check is performed here; only paste codes from a
    /// redirect you started yourself.
    Complete { identifier: String, code: String },
    /// Delete the credentials for an identifier
    Delete { identifier: String },
    /// Delete every stored credential
    Reset {
        /// Required confirmation
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tokenvault=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen => {
            let key = TokenStore::generate_encryption_key();
            println!("{}", key.to_base64());
            Ok(())
        }
        Commands::Vault(command) => run(command, &cli.config).await,
    }
}

async fn run(command: VaultCommand, config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let handler = OAuthHandler::from_config(&config).context("Failed to open token store")?;

    match command {
        VaultCommand::List => {
            for identifier in handler.store().list()? {
                println!("{}", identifier);
            }
        }
        VaultCommand::Status { identifier } => {
            let status = handler.status(&identifier)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        VaultCommand::Token { identifier } => {
            let token = handler.token_for(&identifier).await?;
            println!("{}", token);
        }
        VaultCommand::Authorize { identifier } => {
            let request = handler.begin_authorization(&identifier)?;
            println!("{}", request.url);
            info!(
                state = %request.state,
                "Open the URL above, then run `tokenvault complete` with the returned code"
            );
        }
        VaultCommand::Complete { identifier, code } => {
            let record = handler.complete_authorization(&identifier, &code).await?;
            println!(
                "Stored credentials for '{}' (expires_at: {})",
                record.identifier,
                record
                    .expires_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string())
            );
        }
        VaultCommand::Delete { identifier } => {
            if handler.revoke(&identifier).await? {
                println!("Deleted '{}'", identifier);
            } else {
                println!("Nothing stored for '{}'", identifier);
            }
        }
        VaultCommand::Reset { yes } => {
            if !yes {
                bail!("refusing to delete every credential without --yes");
            }
            handler.reset().await?;
            println!("Token store reset");
        }
    }

    Ok(())
}
