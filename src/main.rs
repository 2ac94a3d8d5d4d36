//! Mock Redirect Rules - CLI Entry Point
//!
//! Each invocation boots the background controller (reconciling the host
//! table with the persisted rules), then runs one rule store operation.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mock_redirect_rules::directive::{decode_data_uri, XHR_RESOURCE_TYPE};
use mock_redirect_rules::host::RequestDetails;
use mock_redirect_rules::{
    Background, FileStorage, HttpMethod, InMemoryHost, KeyValueStorage, MemoryStorage,
    MockRulesConfig, RedirectHost, RuleDraft, RuleId, RulePatch, RuleStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "mock-redirect-rules",
    about = "Manage mock API rules and the redirect directives they produce",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "mock-rules.yaml")]
    config: PathBuf,

    /// Override the storage file from the configuration
    #[arg(short, long)]
    storage: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "warn")]
    log_level: Level,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List persisted rules
    List,
    /// Add a rule
    Add {
        /// URL filter to match
        #[arg(long)]
        path: String,
        /// HTTP method to match
        #[arg(long, default_value = "GET")]
        method: HttpMethod,
        /// Response body (JSON)
        #[arg(long, conflicts_with = "mock_file")]
        mock: Option<String>,
        /// Read the response body from a file
        #[arg(long)]
        mock_file: Option<PathBuf>,
        /// Store the rule without activating it
        #[arg(long)]
        disabled: bool,
    },
    /// Change fields of a rule
    Update {
        id: RuleId,
        #[arg(long)]
        path: Option<String>,
        #[arg(long)]
        method: Option<HttpMethod>,
        #[arg(long)]
        mock: Option<String>,
    },
    /// Activate a rule
    Enable { id: RuleId },
    /// Deactivate a rule
    Disable { id: RuleId },
    /// Delete a rule
    Remove { id: RuleId },
    /// Show the active redirect directives
    Directives,
    /// Show which rule would answer a request
    Match {
        /// Request URL
        url: String,
        #[arg(long, default_value = "GET")]
        method: HttpMethod,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        println!("{}", include_str!("../config/default-config.yaml"));
        return Ok(());
    }

    let mut config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        MockRulesConfig::from_file(&args.config)?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration");
        MockRulesConfig::default()
    };
    if let Some(path) = args.storage {
        config.storage.path = Some(path);
    }

    if args.validate {
        config.validate()?;
        println!("Configuration is valid");
        return Ok(());
    }

    let storage: Arc<dyn KeyValueStorage> = match &config.storage.path {
        Some(path) => Arc::new(FileStorage::new(path)),
        None => Arc::new(MemoryStorage::new()),
    };
    let host = Arc::new(InMemoryHost::new(config.host.max_dynamic_rules));
    let background = Background::start(host.clone(), storage.as_ref(), &config)
        .await
        .context("failed to reconcile host redirect table")?;

    let store = RuleStore::from_config(background.client.clone(), storage.clone(), &config);
    store.load().await?;

    match args.command.unwrap_or(Command::List) {
        Command::List => {
            for rule in store.rules() {
                println!(
                    "{:>10}  {:<7} {:<3} {}  {}",
                    rule.id,
                    rule.method,
                    if rule.enabled { "on" } else { "off" },
                    rule.path,
                    rule.mock
                );
            }
        }
        Command::Add {
            path,
            method,
            mock,
            mock_file,
            disabled,
        } => {
            let mock = match mock_file {
                Some(file) => std::fs::read_to_string(&file)
                    .with_context(|| format!("failed to read {}", file.display()))?,
                None => mock.unwrap_or_default(),
            };
            let mut draft = RuleDraft::new(path, method, mock);
            draft.enabled = !disabled;
            let rule = store.add(draft).await?;
            println!("{}", serde_json::to_string_pretty(&rule)?);
        }
        Command::Update {
            id,
            path,
            method,
            mock,
        } => {
            let patch = RulePatch {
                id,
                path,
                method,
                enabled: None,
                mock,
            };
            let rule = store.update(patch).await?;
            println!("{}", serde_json::to_string_pretty(&rule)?);
        }
        Command::Enable { id } => {
            store.update(RulePatch::new(id).enabled(true)).await?;
        }
        Command::Disable { id } => {
            store.update(RulePatch::new(id).enabled(false)).await?;
        }
        Command::Remove { id } => {
            store.remove(id).await?;
        }
        Command::Directives => {
            let directives = host.get_dynamic_rules().await?;
            println!("{}", serde_json::to_string_pretty(&directives)?);
        }
        Command::Match { url, method } => {
            let method = method.as_host_method();
            let hit = host.evaluate(&RequestDetails {
                url: &url,
                method: &method,
                resource_type: XHR_RESOURCE_TYPE,
            });
            match hit {
                Some(directive) => {
                    let redirect = directive.action.redirect_url();
                    println!("rule {} -> {}", directive.id, redirect);
                    if let Some(body) = decode_data_uri(redirect) {
                        println!("{}", body);
                    }
                }
                None => {
                    println!("no rule matches; request goes to the network");
                }
            }
        }
    }

    Ok(())
}
