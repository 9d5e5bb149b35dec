use anyhow::Result;
use clap::{Parser, Subcommand};

use arcadia_sync::auth::AuthFlow;
use arcadia_sync::config::{SyncBackend, SyncConfig};
use arcadia_sync::github::provision::ProvisionOutcome;
use arcadia_sync::github::GithubClient;
use arcadia_sync::sync::SyncService;

#[derive(Parser)]
#[command(
    name = "arcadia-sync",
    about = "Arcadia Sync — cloud synchronization for the Arcadia game library",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Data directory holding config.toml and the local library tree
    #[arg(long, env = "ARCADIA_SYNC_DATA_DIR", global = true)]
    data_dir: Option<std::path::PathBuf>,

    /// Sync backend: github | webdav
    #[arg(long, env = "ARCADIA_SYNC_BACKEND", global = true)]
    backend: Option<SyncBackend>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "ARCADIA_SYNC_LOG", global = true)]
    log: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in to GitHub via the browser OAuth flow.
    ///
    /// Prints an authorization URL, waits for the redirect on the local
    /// callback port, and stores the resulting credential in config.toml.
    ///
    /// Examples:
    ///   arcadia-sync login
    Login,
    /// Create or adopt the remote library repository.
    ///
    /// Checks whether `my-arcadia` exists under the signed-in account.
    /// Absent: creates it and pushes the local library. Present with an
    /// empty local library: clones it into place. Present while the local
    /// library holds data: reports the divergence and exits with code 2 —
    /// choose a side with `push` or `pull`.
    Init,
    /// Commit local changes and force-push the library to the remote.
    ///
    /// The local library is authoritative: remote history is overwritten.
    Push {
        /// Commit message (default: millisecond timestamp)
        #[arg(long, short = 'm')]
        message: Option<String>,
    },
    /// Overwrite the local library with the remote state.
    ///
    /// Destructive: local commits and uncommitted changes are discarded.
    /// Use --check first to see whether anything would be lost.
    Pull {
        /// Only report whether local work would be discarded; change nothing.
        #[arg(long)]
        check: bool,
    },
    /// Show the configured backend and library tree state.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = SyncConfig::new(args.data_dir, args.backend, args.log);

    tracing_subscriber::fmt()
        .with_env_filter(config.log.as_str())
        .compact()
        .init();

    match args.command {
        Command::Login => login(config).await,
        Command::Init => init(config).await,
        Command::Push { message } => {
            let service = SyncService::new(config)?;
            service.sync_now(message.as_deref()).await?;
            println!("Library pushed.");
            Ok(())
        }
        Command::Pull { check } => pull(config, check).await,
        Command::Status => status(config).await,
    }
}

async fn login(mut config: SyncConfig) -> Result<()> {
    let gh = GithubClient::new(
        &config.github.api_base_url,
        &config.github.oauth_base_url,
    )?;
    let flow = AuthFlow::start(&gh, &config.github).await?;
    println!(
        "Open this URL in your browser to authorize Arcadia:\n\n  {}\n",
        flow.authorize_url()
    );
    let credential = flow.finish(&gh).await?;
    config.persist_credential(&credential.username, &credential.access_token)?;
    println!("Signed in as {}.", credential.username);
    Ok(())
}

async fn init(config: SyncConfig) -> Result<()> {
    let service = SyncService::new(config)?;
    match service.initialize().await? {
        ProvisionOutcome::Created { remote_url } => {
            println!("Created {remote_url} and pushed the local library.");
        }
        ProvisionOutcome::ExistingEmpty { remote_url } => {
            println!("Adopted the existing remote library from {remote_url}.");
        }
        ProvisionOutcome::ExistingDiverged { remote_url } => {
            eprintln!(
                "The remote library at {remote_url} already holds data, and so does the local one.\n\
                 Choose a side: `arcadia-sync push` overwrites the remote, `arcadia-sync pull` overwrites the local library."
            );
            std::process::exit(2);
        }
    }
    Ok(())
}

async fn pull(config: SyncConfig, check: bool) -> Result<()> {
    let service = SyncService::new(config)?;
    if check {
        if service.pull_preflight().await? {
            println!("A pull would discard local changes the remote does not have.");
            std::process::exit(2);
        }
        println!("Nothing local would be lost by a pull.");
        return Ok(());
    }
    service.pull().await?;
    println!("Library updated from remote.");
    Ok(())
}

async fn status(config: SyncConfig) -> Result<()> {
    let service = SyncService::new(config)?;
    let status = service.status().await?;
    let backend = match status.backend {
        SyncBackend::Github => "github",
        SyncBackend::Webdav => "webdav",
    };
    println!("backend:    {backend}");
    println!("sync tree:  {}", status.sync_tree.display());
    println!(
        "tree state: {}",
        if status.tree_exists { "present" } else { "absent" }
    );
    if status.backend == SyncBackend::Github && status.tree_exists {
        println!("ahead:      {}", status.ahead);
        println!("behind:     {}", status.behind);
    }
    Ok(())
}
