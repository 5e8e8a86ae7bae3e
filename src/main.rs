use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use mockwise::{Mockwise, Settings};
use mw_auth::ApiRequest;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Command-line driver for the Mockwise API client
#[derive(Parser)]
#[command(name = "mockwise")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the restored session
    Status,

    /// Send one authorized GET and print the response body
    Get {
        /// Path relative to the API base URL
        path: String,
    },

    /// Sign in with email and password
    Login {
        email: String,
        #[arg(long, env = "MOCKWISE_PASSWORD", hide_env_values = true)]
        password: String,
        /// Keep the credential across restarts
        #[arg(long)]
        remember: bool,
    },

    /// Sign out and clear stored credentials
    Logout,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())
        .await
        .context("Failed to load settings")?;
    debug!(?settings, "Settings loaded");

    let app = Mockwise::from_settings(&settings)
        .await
        .context("Failed to initialise client")?;

    match cli.command {
        Commands::Status => {
            let status = app.session_status();
            match app.credentials().get() {
                Some(credential) => println!(
                    "signed in: {:?}, session {}s left, token expires {}",
                    status.state,
                    status.remaining.as_secs(),
                    credential.expires_at
                ),
                None => println!("signed out"),
            }
        }
        Commands::Get { path } => {
            let response = app
                .authorized_send(ApiRequest::get(path.as_str()))
                .await
                .with_context(|| format!("GET {} failed", path))?;
            println!("{}", response.body);
        }
        Commands::Login {
            email,
            password,
            remember,
        } => {
            let credential = app.login(&email, &password, remember).await?;
            println!("signed in until {}", credential.expires_at);
        }
        Commands::Logout => {
            app.logout().await?;
            println!("signed out");
        }
    }

    Ok(())
}
