use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use genrelay_core::{
    client::{ClientOptions, RelayClient, StaticTokenSource, StreamOptions},
    config::Config,
    model::GenerationRequest,
    relay::{self, AppState},
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "genrelay: streaming generation relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ClientArgs {
    /// Relay base URL
    #[arg(long, env = "GENRELAY_URL", default_value = "http://127.0.0.1:8787")]
    url: String,
    /// Bearer token for the relay
    #[arg(long, env = "GENRELAY_TOKEN", hide_env_values = true)]
    token: String,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    temperature: Option<f32>,
    #[arg(long)]
    max_tokens: Option<u32>,
    #[arg(long)]
    json: bool,
    #[arg(short, long, help = "Prompt text")]
    prompt: String,
}

impl ClientArgs {
    fn request(&self) -> GenerationRequest {
        GenerationRequest {
            prompt: self.prompt.clone(),
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            provider: self.provider.clone(),
            json_mode: self.json.then_some(true),
        }
    }

    fn client(&self) -> anyhow::Result<RelayClient> {
        Ok(RelayClient::new(
            self.url.clone(),
            Arc::new(StaticTokenSource::new(self.token.clone())),
            ClientOptions::default(),
        )?)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Serve {
        /// JSON or TOML config file; environment overrides apply on top
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Buffered generation through a running relay
    Generate(ClientArgs),
    /// Streamed generation (prints fragments live, ctrl-c cancels)
    Stream {
        #[command(flatten)]
        args: ClientArgs,
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config } => {
            let mut cfg = match config {
                Some(path) => Config::from_path(&path)?,
                None => Config::default(),
            };
            cfg.apply_env_from(|k| std::env::var(k).ok())?;
            let state = AppState::from_config(&cfg)?;
            relay::run_server(state, &cfg.server.bind, relay::ctrl_c()).await?;
        }
        Commands::Generate(args) => {
            let text = args.client()?.generate(&args.request()).await?;
            println!("{text}");
        }
        Commands::Stream { args, timeout_secs } => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_signal.cancel();
                }
            });

            let client = args.client()?;
            let opts = StreamOptions {
                cancel: Some(cancel),
                timeout: Duration::from_secs(timeout_secs),
            };
            let res = client
                .stream(
                    &args.request(),
                    |fragment| {
                        print!("{fragment}");
                        io::stdout().flush().ok();
                    },
                    opts,
                )
                .await;
            println!();
            match res {
                Ok(_) => {}
                Err(e) if e.is_cancellation() => eprintln!("[cancelled]"),
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(())
}
