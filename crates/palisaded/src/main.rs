use std::path::PathBuf;

use clap::Parser;

mod config;
mod serve;
mod subcommands;

use config::Config;

/// A transparent, high-availability reverse proxy for fleets of storage
/// nodes.
#[derive(clap::Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[clap(long, env = "PALISADE_CONFIG", default_value = "palisade.toml")]
    config: PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run the proxy.
    Serve,
    /// Check that the durable backend is reachable.
    PingBackend,
    /// Apply pending schema migrations to the durable backend.
    ApplySchema,
    /// Report which schema migrations have been applied.
    SchemaStatus,
    /// Dial and health-check every configured storage node.
    DialNodes,
    /// Report repositories whose latest writes are not fully replicated.
    Dataloss(subcommands::DatalossArgs),
    /// Accept dataloss by declaring one replica authoritative.
    AcceptDataloss(subcommands::AcceptDatalossArgs),
    /// Change the number of storages assigned to host a repository.
    SetReplicationFactor(subcommands::SetReplicationFactorArgs),
    /// List the configured virtual storages and their nodes.
    ListStorages,
}

fn main() -> anyhow::Result<()> {
    // Required in order for libraries to use `rustls` for TLS.
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("failed to install default crypto provider");

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(async move {
        match cli.command {
            Command::Serve => serve::run(config).await,
            Command::PingBackend => subcommands::ping_backend(&config).await,
            Command::ApplySchema => subcommands::apply_schema(&config).await,
            Command::SchemaStatus => subcommands::schema_status(&config).await,
            Command::DialNodes => subcommands::dial_nodes(&config).await,
            Command::Dataloss(args) => subcommands::dataloss(&config, args).await,
            Command::AcceptDataloss(args) => subcommands::accept_dataloss(&config, args).await,
            Command::SetReplicationFactor(args) => {
                subcommands::set_replication_factor(&config, args).await
            }
            Command::ListStorages => subcommands::list_storages(&config),
        }
    });

    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    result
}
