mod config;
mod logging;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use config::AppConfig;
use mg_link::{
    FetchPolicy, GatewayClient, GatewayClientBuilder, GraphQLResponse, Operation, OperationError,
};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// metaGOTHIC gateway client
#[derive(Parser)]
#[command(name = "mg-client")]
#[command(about = "Run GraphQL operations against the metaGOTHIC gateway")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print effective configuration (YAML) and exit
    #[arg(long, global = true)]
    print_config: bool,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a query and print the response
    Query {
        #[command(flatten)]
        document: DocumentArgs,

        /// Skip the cache and always ask the gateway
        #[arg(long)]
        network_only: bool,
    },
    /// Run a mutation and print the response
    Mutate {
        #[command(flatten)]
        document: DocumentArgs,
    },
    /// Print subscription results as they arrive (Ctrl-C stops)
    Subscribe {
        #[command(flatten)]
        document: DocumentArgs,

        /// Stop after this many results
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Validate configuration and exit
    Check,
}

#[derive(Args)]
struct DocumentArgs {
    /// GraphQL document text
    #[arg(short, long, conflicts_with = "file", required_unless_present = "file")]
    document: Option<String>,

    /// Read the GraphQL document from a file
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Variables as a JSON object
    #[arg(long)]
    variables: Option<String>,

    /// Operation to run when the document defines several
    #[arg(long)]
    operation_name: Option<String>,
}

impl DocumentArgs {
    fn operation(&self, client: &GatewayClient) -> Result<Operation> {
        let source = match (&self.document, &self.file) {
            (Some(document), _) => document.clone(),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?,
            (None, None) => bail!("either --document or --file is required"),
        };

        let operation = match &self.operation_name {
            Some(name) => client.named_operation(&source, name)?,
            None => client.operation(&source)?,
        };

        let Some(variables) = &self.variables else {
            return Ok(operation);
        };
        let variables: Map<String, Value> =
            serde_json::from_str(variables).context("--variables must be a JSON object")?;
        Ok(operation.with_variables(variables))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    config.apply_verbosity(cli.verbose);
    logging::init(&config.logging)?;

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    let Some(command) = cli.command else {
        bail!("no command given; see --help");
    };

    let client = build_client(&config)?;
    let result = match command {
        Commands::Check => {
            println!("Configuration is valid");
            println!("{}", config.to_yaml()?);
            Ok(())
        }
        Commands::Query {
            document,
            network_only,
        } => {
            let policy = if network_only {
                FetchPolicy::NetworkOnly
            } else {
                FetchPolicy::CacheFirst
            };
            let response = client
                .query_with(document.operation(&client)?, policy)
                .await
                .map_err(classified)?;
            print_response(&response)
        }
        Commands::Mutate { document } => {
            let response = client
                .mutate(document.operation(&client)?)
                .await
                .map_err(classified)?;
            print_response(&response)
        }
        Commands::Subscribe { document, limit } => {
            subscribe(&client, document.operation(&client)?, limit).await
        }
    };

    client.shutdown();
    result
}

/// Building validates endpoints, headers, TLS roots and the cache policy
/// without contacting the gateway, which is all `check` needs.
fn build_client(config: &AppConfig) -> Result<GatewayClient> {
    tracing::debug!(endpoint = %config.link.http_endpoint, "building gateway client");
    GatewayClientBuilder::with_config(config.link.clone())
        .cache_policy(config.cache.clone())
        .build()
        .context("invalid configuration")
}

async fn subscribe(client: &GatewayClient, operation: Operation, limit: Option<usize>) -> Result<()> {
    let mut subscription = client.subscribe(operation).await.map_err(classified)?;
    let mut received = 0usize;

    loop {
        if limit.is_some_and(|limit| received >= limit) {
            break;
        }

        let item = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted; cancelling subscription");
                subscription.cancel();
                break;
            }
            item = subscription.recv() => item,
        };

        match item {
            Some(Ok(response)) => {
                print_response(&response)?;
                received += 1;
            }
            Some(Err(err)) => return Err(classified(err)),
            None => break,
        }
    }

    tracing::debug!(received, "subscription finished");
    Ok(())
}

fn print_response(response: &GraphQLResponse) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(())
}

fn classified(err: OperationError) -> anyhow::Error {
    let classification = err.classification;
    anyhow::Error::new(err).context(format!("{classification} failure"))
}
