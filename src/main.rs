// ABOUTME: CLI entry point for roomsync
// ABOUTME: Parses commands and routes to the server or client role

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use roomsync::client::{ReplicaLocks, SyncClient};
use roomsync::cursor::CursorStore;
use roomsync::schema::SchemaDef;
use roomsync::server::{ReplicaCache, ServerState};

#[derive(Parser)]
#[command(name = "roomsync")]
#[command(about = "Local-first change synchronization over room-scoped replicas", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync server
    Serve {
        /// Address to listen on
        #[arg(long, env = "ROOMSYNC_ADDR", default_value = "127.0.0.1:8090")]
        addr: SocketAddr,
        /// Directory for room replica databases (omit for in-memory replicas)
        #[arg(long, env = "ROOMSYNC_DATA_DIR")]
        data_dir: Option<PathBuf>,
        /// Path to the canonical schema .sql file
        #[arg(long, env = "ROOMSYNC_SCHEMA")]
        schema: PathBuf,
    },
    /// Run one round trip against a room
    Sync {
        #[command(flatten)]
        opts: ClientOpts,
    },
    /// Round trip on a fixed interval until stopped
    Watch {
        #[command(flatten)]
        opts: ClientOpts,
        /// Seconds between round trips
        #[arg(long, default_value_t = 30)]
        interval: u64,
    },
}

#[derive(clap::Args)]
struct ClientOpts {
    /// Base URL of the sync server
    #[arg(long, env = "ROOMSYNC_SERVER")]
    server: String,
    /// Room to synchronize with
    #[arg(long)]
    room: String,
    /// Path to the local replica database
    #[arg(long)]
    db: PathBuf,
    /// Path to the canonical schema .sql file
    #[arg(long, env = "ROOMSYNC_SCHEMA")]
    schema: PathBuf,
    /// Directory for cursor state (defaults to ~/.roomsync)
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG has highest precedence, then --log, then "info".
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Serve {
            addr,
            data_dir,
            schema,
        } => {
            let schema = SchemaDef::load(&schema)?;
            tracing::info!(
                schema = %schema.name,
                fingerprint = schema.fingerprint(),
                "starting sync server"
            );
            let state = Arc::new(ServerState {
                replicas: ReplicaCache::new(schema, data_dir),
            });
            roomsync::server::serve(addr, state).await
        }
        Commands::Sync { opts } => {
            let client = build_client(&opts).await?;
            let summary = client.round_trip().await?;
            tracing::info!(
                sent = summary.sent,
                accepted = summary.accepted,
                received = summary.received,
                last_sent = summary.last_sent,
                last_seen = summary.last_seen,
                "round trip completed"
            );
            Ok(())
        }
        Commands::Watch { opts, interval } => {
            let client = build_client(&opts).await?;
            client
                .watch(Duration::from_secs(interval))
                .await
                .map_err(Into::into)
        }
    }
}

async fn build_client(opts: &ClientOpts) -> anyhow::Result<SyncClient> {
    let schema = SchemaDef::load(&opts.schema)?;
    let state_dir = match &opts.state_dir {
        Some(dir) => dir.clone(),
        None => dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("could not determine home directory"))?
            .join(".roomsync"),
    };
    let cursors = CursorStore::open(&state_dir)?;
    let locks = ReplicaLocks::new();
    let store = locks
        .open_replica(&opts.room, Some(&opts.db), &schema)
        .await
        .context("failed to open local replica")?;
    SyncClient::new(
        &opts.server,
        &opts.room,
        schema.fingerprint(),
        store,
        cursors,
    )
    .map_err(Into::into)
}
