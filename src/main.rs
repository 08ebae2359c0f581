//! NeuroLibre publisher daemon and client.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use neurolibre_publisher::{
    api::{self, ApiState},
    archiver::{ArtifactTools, ShellTools},
    build::{BinderHubTrigger, BuildDispatcher},
    config::{self, PublisherConfig},
    deposit::DepositOrchestrator,
    lock::LockStore,
    zenodo::ZenodoClient,
};

/// Build dispatch and Zenodo archival for NeuroLibre preprints.
#[derive(Parser)]
#[command(name = "neurolibre-publisher", about = "Build and archive NeuroLibre preprints")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST API daemon.
    Daemon {
        /// Address to bind the API server.
        #[arg(long, default_value = "0.0.0.0:29876", env = "PUBLISHER_BIND")]
        bind: String,

        /// Data directory for records, archives and locks.
        #[arg(long, env = "PUBLISHER_DATA_DIR")]
        data_dir: Option<PathBuf>,

        /// Directory for build lock markers (defaults under the data dir).
        #[arg(long, env = "PUBLISHER_LOCK_DIR")]
        lock_dir: Option<PathBuf>,

        /// Root of locally built books (defaults under the data dir).
        #[arg(long, env = "PUBLISHER_BOOK_DIR")]
        book_dir: Option<PathBuf>,

        /// Directory holding one subdirectory per dataset project.
        #[arg(long, env = "PUBLISHER_DATASET_DIR")]
        dataset_dir: Option<PathBuf>,

        /// BinderHub base URL.
        #[arg(long, env = "BINDER_URL", default_value = config::DEFAULT_BINDER_URL)]
        binder_url: String,

        /// Zenodo base URL.
        #[arg(long, env = "ZENODO_URL", default_value = config::DEFAULT_ZENODO_URL)]
        zenodo_url: String,

        /// Zenodo access token.
        #[arg(long, env = "ZENODO_TOKEN", hide_env_values = true)]
        zenodo_token: String,

        /// rsync host holding built books (user@host).
        #[arg(long, env = "PUBLISHER_MIRROR_HOST")]
        mirror_host: Option<String>,

        /// Seconds between consecutive Zenodo calls in a batch.
        #[arg(long, env = "PUBLISHER_REQUEST_DELAY", default_value_t = 2)]
        request_delay: u64,

        /// Seconds after which a build lock is considered abandoned.
        #[arg(long, env = "PUBLISHER_LOCK_STALE_AFTER", default_value_t = 1800)]
        lock_stale_after: u64,

        /// DOI prefix of the journal.
        #[arg(long, env = "PUBLISHER_DOI_PREFIX", default_value = config::DEFAULT_DOI_PREFIX)]
        doi_prefix: String,

        /// Journal name used in filenames and the parent DOI.
        #[arg(long, env = "PUBLISHER_JOURNAL", default_value = "NeuroLibre")]
        journal: String,
    },

    /// Trigger a book build and stream its output.
    Build {
        /// Repository URL, e.g. https://github.com/org/repo.
        #[arg(long)]
        repo_url: String,

        /// Commit to build (defaults to the remote HEAD).
        #[arg(long)]
        commit: Option<String>,

        /// Publisher API URL.
        #[arg(long, env = "PUBLISHER_API_URL", default_value = "http://localhost:29876")]
        api_url: String,
    },

    /// Publish all uploaded deposits of a submission.
    Publish {
        #[arg(long)]
        issue_id: u32,

        /// Publisher API URL.
        #[arg(long, env = "PUBLISHER_API_URL", default_value = "http://localhost:29876")]
        api_url: String,
    },

    /// Show daemon status.
    Status {
        /// Publisher API URL.
        #[arg(long, env = "PUBLISHER_API_URL", default_value = "http://localhost:29876")]
        api_url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "neurolibre_publisher=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            bind,
            data_dir,
            lock_dir,
            book_dir,
            dataset_dir,
            binder_url,
            zenodo_url,
            zenodo_token,
            mirror_host,
            request_delay,
            lock_stale_after,
            doi_prefix,
            journal,
        } => {
            let mut config = match data_dir {
                Some(dir) => PublisherConfig::new(dir),
                None => PublisherConfig::default(),
            }
            .with_binder_url(binder_url)
            .with_zenodo(zenodo_url, zenodo_token)
            .with_mirror_host(mirror_host)
            .with_request_delay(Duration::from_secs(request_delay))
            .with_lock_stale_after(Duration::from_secs(lock_stale_after))
            .with_journal(doi_prefix, journal);
            if let Some(dir) = lock_dir {
                config = config.with_lock_dir(dir);
            }
            if let Some(dir) = book_dir {
                config = config.with_book_dir(dir);
            }
            if let Some(dir) = dataset_dir {
                config = config.with_dataset_dir(dir);
            }

            run_daemon(&bind, config).await?;
        }

        Commands::Build {
            repo_url,
            commit,
            api_url,
        } => {
            build(&api_url, &repo_url, commit.as_deref()).await?;
        }

        Commands::Publish { issue_id, api_url } => {
            publish(&api_url, issue_id).await?;
        }

        Commands::Status { api_url } => {
            show_status(&api_url).await?;
        }
    }

    Ok(())
}

/// Run the API daemon.
async fn run_daemon(bind: &str, config: PublisherConfig) -> Result<()> {
    tracing::info!(config = ?config, "Starting publisher daemon...");

    if config.zenodo_token.is_empty() {
        tracing::warn!("No Zenodo token configured; deposit calls will be rejected");
    }

    let http = reqwest::Client::builder()
        .user_agent(concat!("neurolibre-publisher/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let tools: Arc<dyn ArtifactTools> =
        Arc::new(ShellTools::new(http.clone(), config.mirror_host.clone()));
    let zenodo = Arc::new(ZenodoClient::new(
        http.clone(),
        &config.zenodo_url,
        &config.zenodo_token,
    ));

    let orchestrator = DepositOrchestrator::from_config(&config, zenodo, tools.clone());
    let dispatcher = BuildDispatcher::new(
        LockStore::new(&config.lock_dir, config.lock_stale_after),
        Arc::new(BinderHubTrigger::new(http)),
        tools,
        &config.binder_url,
    );

    let state = Arc::new(ApiState::new(orchestrator, dispatcher));
    api::serve(state, bind).await?;

    Ok(())
}

/// Trigger a build via API and print lines as they arrive.
async fn build(api_url: &str, repo_url: &str, commit: Option<&str>) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!("{}/api/v1/resources/books", api_url);

    let body = serde_json::json!({
        "repo_url": repo_url,
        "commit": commit,
    });

    let response = client.post(&url).json(&body).send().await?;

    if response.status() == reqwest::StatusCode::CONFLICT {
        let conflict: serde_json::Value = response.json().await?;
        println!("Already building ({}s)", conflict["age_secs"]);
        println!("Check status: {}", conflict["status_url"].as_str().unwrap_or("?"));
        return Ok(());
    }

    if !response.status().is_success() {
        let error_text = response.text().await?;
        anyhow::bail!("Failed to start build: {}", error_text);
    }

    let mut stream = response.bytes_stream();
    let mut stdout = std::io::stdout();
    while let Some(chunk) = stream.next().await {
        stdout.write_all(&chunk?)?;
        stdout.flush()?;
    }

    Ok(())
}

/// Publish via API and print per-resource outcomes.
async fn publish(api_url: &str, issue_id: u32) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!("{}/api/v1/zenodo/publish", api_url);

    let response = client
        .post(&url)
        .json(&serde_json::json!({ "issue_id": issue_id }))
        .send()
        .await?;

    if !response.status().is_success() {
        let error_text = response.text().await?;
        anyhow::bail!("Failed to publish: {}", error_text);
    }

    let body: serde_json::Value = response.json().await?;
    let outcomes = body["outcomes"].as_array().cloned().unwrap_or_default();

    println!("{:<12} {:<20} {}", "RESOURCE", "STATUS", "DOI / REASON");
    println!("{}", "-".repeat(64));

    for outcome in outcomes {
        let detail = outcome["doi"]
            .as_str()
            .or_else(|| outcome["reason"].as_str())
            .unwrap_or("");
        println!(
            "{:<12} {:<20} {}",
            outcome["resource"].as_str().unwrap_or("?"),
            outcome["status"].as_str().unwrap_or("?"),
            detail
        );
    }

    Ok(())
}

/// Show daemon status via API.
async fn show_status(api_url: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!("{}/api/v1/status", api_url);

    let response = client.get(&url).send().await?;

    if !response.status().is_success() {
        anyhow::bail!("Failed to get status: {}", response.status());
    }

    let status: serde_json::Value = response.json().await?;

    println!("Publisher Status");
    println!("================");
    println!("Status:   {}", status["status"]);
    println!("Version:  {}", status["version"]);
    println!("Binder:   {}", status["binder_url"]);
    println!("Uptime:   {}s", status["uptime_secs"]);

    Ok(())
}
