use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use dialoguer::{theme::ColorfulTheme, Input, Password};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use annotator::api::{self, AppState};
use annotator::assignment::get_unlabeled;
use annotator::auth::{hash_password, Credentials};
use annotator::environment::{Settings, StoreBackend};
use annotator::logging::{configure_logging, LogOutput};
use annotator::reconcile::{Reconciler, StorageEvent};
use annotator::session::{fetch_work_or_empty, run_interactive, AnnotationSession, WorkSource};
use annotator::storage::keys::is_valid_username;
use annotator::table::{encode_rows, DuplicatePolicy};

#[derive(Parser)]
#[command(author, version, about = "Rule-of-law news annotation tool", long_about = None)]
struct Cli {
    /// Object store backend (s3 or local); defaults to STORE_BACKEND
    #[arg(long, global = true)]
    backend: Option<StoreBackend>,

    /// Root directory of the local store; defaults to LOCAL_STORE_PATH
    #[arg(long, global = true)]
    store_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the work-assignment and reconciliation endpoints over HTTP
    Serve {
        /// Port to listen on; defaults to PORT
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print the articles a user still has to label, as JSON rows
    Unlabeled {
        #[arg(short, long)]
        username: String,

        /// Write the rows to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Rebuild a user's labeled corpus from all of their batches
    Concatenate {
        /// Key of the newly written batch; the user is its first path segment
        #[arg(short, long, conflicts_with = "username", required_unless_present = "username")]
        key: Option<String>,

        /// Bucket holding the batch; defaults to RAW_LABELED_BUCKET
        #[arg(short, long, requires = "key")]
        bucket: Option<String>,

        /// Reconcile this user directly
        #[arg(short, long)]
        username: Option<String>,

        /// Which duplicate survives: first or last; defaults to DUPLICATE_POLICY
        #[arg(long)]
        keep: Option<DuplicatePolicy>,
    },

    /// Log in and annotate articles interactively
    Annotate {
        /// Skip the prompt and log in as this user
        #[arg(short, long)]
        username: Option<String>,

        /// Fetch work from a running server instead of the store
        #[arg(long, env = "ANNOTATOR_API_URL")]
        api_url: Option<String>,

        /// Write all annotations to this CSV file when the session ends
        #[arg(short, long)]
        export: Option<PathBuf>,

        /// Minimum annotations before sending; defaults to MIN_ANNOTATIONS
        #[arg(long)]
        min_annotations: Option<usize>,
    },

    /// Print the bcrypt hash to store in the credentials file for a password
    HashPassword,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let output = match cli.command {
        Commands::Annotate { .. } | Commands::HashPassword => LogOutput::FileOnly,
        _ => LogOutput::Console,
    };
    configure_logging(output);

    let mut settings = Settings::from_env()?;
    if let Some(backend) = cli.backend {
        settings.backend = backend;
    }
    if let Some(path) = cli.store_path {
        settings.local_store_path = path;
    }

    match cli.command {
        Commands::Serve { port } => {
            let store = settings.open_store().await;
            let reconciler = Reconciler::new(
                store.clone(),
                settings.buckets.clone(),
                settings.duplicate_policy,
            );
            let state = AppState {
                store,
                buckets: settings.buckets.clone(),
                reconciler: Arc::new(reconciler),
                api_key: settings.api_key.clone(),
            };
            api::serve(state, port.unwrap_or(settings.port)).await?;
        }

        Commands::Unlabeled { username, output } => {
            if !is_valid_username(&username) {
                bail!("invalid username '{}'", username);
            }
            let store = settings.open_store().await;
            let pending = get_unlabeled(store.as_ref(), &settings.buckets, &username).await?;
            let bytes = encode_rows(&pending)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &bytes)
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!("Wrote {} unlabeled rows for {} to {}", pending.len(), username, path.display());
                }
                None => {
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(&bytes)?;
                    stdout.write_all(b"\n")?;
                }
            }
        }

        Commands::Concatenate {
            key,
            bucket,
            username,
            keep,
        } => {
            let store = settings.open_store().await;
            let reconciler = Reconciler::new(
                store,
                settings.buckets.clone(),
                keep.unwrap_or(settings.duplicate_policy),
            );

            let reports = match (key, username) {
                (Some(key), _) => {
                    let bucket = bucket.unwrap_or_else(|| settings.buckets.raw_labeled.clone());
                    reconciler
                        .handle_event(&StorageEvent::for_object(&bucket, &key))
                        .await?
                }
                (None, Some(username)) => vec![reconciler.reconcile_user(&username).await?],
                (None, None) => bail!("either --key or --username is required"),
            };

            for report in reports {
                println!(
                    "{}: {} rows processed from {} batches -> {}/{}",
                    report.username,
                    report.rows_processed,
                    report.batches,
                    settings.buckets.processed,
                    report.key
                );
            }
        }

        Commands::Annotate {
            username,
            api_url,
            export,
            min_annotations,
        } => {
            if let Some(min) = min_annotations {
                settings.flush_policy.min_records = min;
            }
            annotate(&settings, username, api_url, export).await?;
        }

        Commands::HashPassword => {
            let password = Password::with_theme(&ColorfulTheme::default())
                .with_prompt("Password")
                .with_confirmation("Repeat password", "Passwords do not match")
                .interact()?;
            println!("{}", hash_password(&password)?);
        }
    }

    Ok(())
}

async fn annotate(
    settings: &Settings,
    username: Option<String>,
    api_url: Option<String>,
    export: Option<PathBuf>,
) -> Result<()> {
    let theme = ColorfulTheme::default();
    let credentials = Credentials::load(&settings.credentials_path)?;

    let username = match username {
        Some(username) => username,
        None => Input::with_theme(&theme)
            .with_prompt("Username")
            .interact_text()?,
    };
    let password = Password::with_theme(&theme)
        .with_prompt("Password")
        .interact()?;
    let display_name = match credentials.authenticate(&username, &password) {
        Ok(entry) => entry.name.clone(),
        Err(e) => {
            println!("{}", e.to_string().red());
            return Err(anyhow!(e));
        }
    };
    if !is_valid_username(&username) {
        bail!("username '{}' cannot be used as a storage prefix", username);
    }
    println!("Logged in as {}", format!("{} - {}", display_name, username).bold());

    let store = settings.open_store().await;
    let client = reqwest::Client::new();

    println!("Retrieving data for labeling process...");
    let source = match api_url.as_deref() {
        Some(url) => WorkSource::Remote {
            client: &client,
            url,
            api_key: settings.api_key.as_deref(),
        },
        None => WorkSource::Store {
            store: store.as_ref(),
            buckets: &settings.buckets,
        },
    };
    let (work, error) = fetch_work_or_empty(&source, &username).await;
    if let Some(e) = error {
        println!("{}", "An error occurred retrieving the data.".red());
        println!("{}", format!("{:#}", e).red());
    }

    let mut session = AnnotationSession::new(username, work, settings.flush_policy);
    info!(
        "Session for {} started with {} articles",
        session.username(),
        session.work_len()
    );
    run_interactive(
        &mut session,
        store.as_ref(),
        &settings.buckets.raw_labeled,
        export.as_deref(),
    )
    .await
}
