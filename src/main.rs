//! `chatpool` command line: complete one document, or watch a directory

use anyhow::{Context, Result};
use chatpool::{
    AppConfig, BedrockClient, CancellationToken, CompletionClient, FileCompletionScheduler, KeyedClient,
    OpenAiClient, PoolWatcher, Vendor,
};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "chatpool", version, about = "Complete the conversations embedded in chat documents")]
struct Cli {
    /// JSON configuration file; flags override its values
    #[arg(long, global = true, env = "CHATPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Default log level, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "info", env = "CHATPOOL_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Complete every pending conversation of one document
    Complete(CompleteArgs),
    /// Keep completing files that appear in a directory until interrupted
    Watch(WatchArgs),
}

#[derive(Debug, Args)]
struct CompleteArgs {
    path: PathBuf,
    /// Write here instead of rewriting PATH
    new_path: Option<PathBuf>,
    #[command(flatten)]
    completion: CompletionFlags,
}

#[derive(Debug, Args)]
struct WatchArgs {
    dir: PathBuf,
    /// Write completed files here instead of rewriting them in place
    #[arg(long)]
    out_dir: Option<PathBuf>,
    /// Files completed at once
    #[arg(long)]
    max_files: Option<usize>,
    /// Seconds between directory scans
    #[arg(long)]
    poll_interval: Option<u64>,
    /// Seconds between status lines
    #[arg(long)]
    status_interval: Option<u64>,
    /// Accepted file extension, repeatable
    #[arg(long = "extension")]
    extensions: Vec<String>,
    /// Complete a done file again when it changes
    #[arg(long)]
    reprocess_on_change: bool,
    /// Watch DIR/in and complete files through DIR/.cache into DIR/out (or --out-dir)
    #[arg(long)]
    staged: bool,
    #[command(flatten)]
    completion: CompletionFlags,
}

#[derive(Debug, Args)]
struct CompletionFlags {
    #[arg(long, env = "CHATPOOL_MODEL")]
    model: Option<String>,
    /// Per-call timeout in seconds
    #[arg(long, env = "CHATPOOL_TIMEOUT")]
    timeout: Option<u64>,
    /// Retries after the first attempt
    #[arg(long, env = "CHATPOOL_RETRIES")]
    retries: Option<u32>,
    /// Jobs in flight per file
    #[arg(long, env = "CHATPOOL_MAX_CONCURRENT")]
    max_concurrent: Option<usize>,
    /// openai or bedrock; inferred from the model when omitted
    #[arg(long, env = "CHATPOOL_VENDOR")]
    vendor: Option<Vendor>,
    #[arg(long)]
    api_key: Option<String>,
    /// File holding the API key
    #[arg(long)]
    api_key_file: Option<PathBuf>,
    /// Environment variable holding the API key
    #[arg(long)]
    api_key_env: Option<String>,
    #[arg(long, env = "CHATPOOL_BASE_URL")]
    base_url: Option<String>,
    #[arg(long, env = "AWS_REGION")]
    aws_region: Option<String>,
    /// Line separating two conversation units
    #[arg(long, env = "CHATPOOL_SEPARATOR")]
    separator: Option<String>,
}

impl CompletionFlags {
    fn apply(&self, config: &mut AppConfig) {
        let completion = &mut config.completion;
        if let Some(model) = &self.model {
            completion.model = model.clone();
        }
        if let Some(timeout) = self.timeout {
            completion.timeout_secs = timeout;
        }
        if let Some(retries) = self.retries {
            completion.retries = retries;
        }
        if self.max_concurrent.is_some() {
            completion.max_concurrent = self.max_concurrent;
        }
        if self.vendor.is_some() {
            completion.vendor = self.vendor;
        }

        let client = &mut config.client;
        if self.api_key.is_some() {
            client.api_key = self.api_key.clone();
        }
        if self.api_key_file.is_some() {
            client.api_key_file = self.api_key_file.clone();
        }
        if let Some(env) = &self.api_key_env {
            client.api_key_env = env.clone();
        }
        if let Some(base_url) = &self.base_url {
            client.base_url = base_url.clone();
        }
        if self.aws_region.is_some() {
            client.aws_region = self.aws_region.clone();
        }
        if let Some(separator) = &self.separator {
            config.document.separator = separator.clone();
        }
    }
}

impl WatchArgs {
    fn apply(&self, config: &mut AppConfig) {
        self.completion.apply(config);
        let pool = &mut config.pool;
        if self.out_dir.is_some() {
            pool.out_dir = self.out_dir.clone();
        }
        if self.max_files.is_some() {
            pool.max_files = self.max_files;
        }
        if let Some(secs) = self.poll_interval {
            pool.poll_interval_secs = secs;
        }
        if let Some(secs) = self.status_interval {
            pool.status_interval_secs = secs;
        }
        if !self.extensions.is_empty() {
            pool.extensions = self.extensions.clone();
        }
        if self.reprocess_on_change {
            pool.reprocess_on_change = true;
        }
        if self.staged {
            pool.staged = true;
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Build the client for the configured vendor. Key problems surface here,
/// before any file is touched.
async fn build_client(config: &AppConfig) -> Result<Arc<dyn CompletionClient>> {
    let vendor = config.completion.vendor()?;
    info!("Using {} for model {}", vendor.as_str(), config.completion.model);

    let client: Arc<dyn CompletionClient> = match vendor {
        Vendor::OpenAi => Arc::new(
            OpenAiClient::from_key_source(&config.client.key_source())
                .context("Failed to set up the OpenAI client")?
                .with_base_url(&config.client.base_url),
        ),
        Vendor::Bedrock => Arc::new(BedrockClient::from_env(config.client.aws_region.clone()).await),
    };
    Ok(client)
}

/// Cancel `token` on Ctrl-C
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing dispatched work before exiting");
            token.cancel();
        }
    });
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Complete(args) => {
            args.completion.apply(&mut config);
            config.completion.validate()?;
            config.document.validate().map_err(anyhow::Error::msg)?;
            let client = build_client(&config).await?;
            let scheduler = FileCompletionScheduler::new(client).with_parse_config(config.document.clone());

            let cancel = CancellationToken::new();
            cancel_on_interrupt(cancel.clone());

            let result = scheduler
                .complete_file(&args.path, args.new_path.as_deref(), &config.completion, &cancel)
                .await
                .with_context(|| format!("Failed to complete {}", args.path.display()))?;
            println!("{}", result.summary());
        }
        Command::Watch(args) => {
            args.apply(&mut config);
            config.validate()?;
            let client = build_client(&config).await?;
            let scheduler = Arc::new(FileCompletionScheduler::new(client).with_parse_config(config.document.clone()));
            let watcher = PoolWatcher::from_settings(&args.dir, scheduler, config.completion.clone(), &config.pool)?;

            let stop = CancellationToken::new();
            cancel_on_interrupt(stop.clone());

            let summary = watcher
                .run(stop)
                .await
                .with_context(|| format!("Failed to watch {}", args.dir.display()))?;
            println!(
                "{} file(s) completed, {} failed, {} skipped",
                summary.files_completed, summary.files_failed, summary.files_skipped
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
