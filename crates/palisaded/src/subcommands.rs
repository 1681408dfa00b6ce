//! Management subcommands operating directly on the durable backend and the
//! configured nodes. Text on stdout, exit code through the returned result.

use std::time::Duration;

use anyhow::Context;
use datastore::{
    ChangeType, NodeStatusStore, PgNodeStore, PgQueue, PgRepositoryStore, ReplicationJob,
    ReplicationQueue, RepositoryStore, ShardPrimaryStore,
};
use nodes::NodeSet;
use proto::health::{HealthCheckRequest, HealthClient, ServingStatus};

use crate::config::Config;

async fn pool(config: &Config) -> anyhow::Result<sqlx::PgPool> {
    let database = config
        .database
        .as_ref()
        .context("no database is configured")?;
    datastore::postgres::connect(&database.url)
        .await
        .context("failed to connect to the durable backend")
}

fn repository_store(config: &Config, pool: sqlx::PgPool) -> PgRepositoryStore {
    PgRepositoryStore::new(pool, config.configured_storages())
}

pub async fn ping_backend(config: &Config) -> anyhow::Result<()> {
    let pool = pool(config).await?;
    datastore::postgres::schema::ping(&pool).await?;
    println!("backend is reachable");
    Ok(())
}

pub async fn apply_schema(config: &Config) -> anyhow::Result<()> {
    let pool = pool(config).await?;
    let applied = datastore::postgres::schema::apply(&pool).await?;
    if applied.is_empty() {
        println!("schema is up to date");
    }
    for id in applied {
        println!("applied {id}");
    }
    Ok(())
}

pub async fn schema_status(config: &Config) -> anyhow::Result<()> {
    let pool = pool(config).await?;
    for (id, applied) in datastore::postgres::schema::status(&pool).await? {
        println!("{} {id}", if applied { "applied" } else { "pending" });
    }
    Ok(())
}

pub async fn dial_nodes(config: &Config) -> anyhow::Result<()> {
    let nodes = NodeSet::dial(&config.node_configs())?;
    let mut failures = 0;

    for node in nodes.iter() {
        let mut client = HealthClient::new(node.channel.clone());
        let check = tokio::time::timeout(
            Duration::from_secs(5),
            client.check(HealthCheckRequest {
                service: String::new(),
            }),
        )
        .await;

        let outcome = match check {
            Ok(Ok(response)) if response.get_ref().status == ServingStatus::Serving as i32 => {
                "SERVING".to_string()
            }
            Ok(Ok(response)) => format!("NOT SERVING ({})", response.get_ref().status),
            Ok(Err(status)) => {
                failures += 1;
                format!("ERROR: {status}")
            }
            Err(_elapsed) => {
                failures += 1;
                "ERROR: timed out".to_string()
            }
        };
        println!(
            "{}/{} ({}): {outcome}",
            node.virtual_storage, node.storage, node.address
        );
    }

    anyhow::ensure!(failures == 0, "{failures} nodes failed their health check");
    Ok(())
}

#[derive(clap::Args, Debug)]
pub struct DatalossArgs {
    /// Limit the report to one virtual storage.
    #[clap(long)]
    virtual_storage: Option<String>,
    /// Also list repositories which are merely missing an assigned replica,
    /// rather than having lost their latest writes.
    #[clap(long)]
    include_partially_replicated: bool,
}

pub async fn dataloss(config: &Config, args: DatalossArgs) -> anyhow::Result<()> {
    let pool = pool(config).await?;
    let store = repository_store(config, pool.clone());
    let node_store = PgNodeStore::new(pool);
    let healthy = node_store
        .healthy_storages(Duration::from_secs(10), Duration::from_secs(60))
        .await?;

    let virtual_storages: Vec<String> = match args.virtual_storage {
        Some(name) => vec![name],
        None => {
            let mut names: Vec<String> =
                config.configured_storages().into_keys().collect();
            names.sort();
            names
        }
    };

    for virtual_storage in virtual_storages {
        println!("virtual storage: {virtual_storage}");
        let healthy = healthy.get(&virtual_storage).cloned().unwrap_or_default();

        let mut repositories = store
            .get_partially_available_repositories(&virtual_storage)
            .await?;
        repositories.retain(|info| {
            args.include_partially_replicated || {
                let primary = info.primary.as_deref();
                info.replicas
                    .iter()
                    .find(|replica| Some(replica.storage.as_str()) == primary)
                    .map(|replica| replica.generation < info.generation)
                    .unwrap_or(true)
            }
        });

        if repositories.is_empty() {
            println!("  all repositories are fully available");
            continue;
        }
        for info in repositories {
            println!(
                "  {} (generation {}, primary {}):",
                info.relative_path,
                info.generation,
                info.primary.as_deref().unwrap_or("<none>"),
            );
            for replica in info.replicas {
                let mut notes = Vec::new();
                if replica.assigned {
                    notes.push("assigned");
                }
                if !healthy.contains(&replica.storage) {
                    notes.push("unhealthy");
                }
                println!(
                    "    {}: generation {} behind by {} [{}]",
                    replica.storage,
                    replica.generation,
                    info.generation - replica.generation,
                    notes.join(", "),
                );
            }
        }
    }
    Ok(())
}

#[derive(clap::Args, Debug)]
pub struct AcceptDatalossArgs {
    #[clap(long)]
    virtual_storage: String,
    #[clap(long)]
    relative_path: String,
    /// The storage whose copy of the repository becomes the new
    /// authoritative version.
    #[clap(long)]
    authoritative_storage: String,
}

pub async fn accept_dataloss(config: &Config, args: AcceptDatalossArgs) -> anyhow::Result<()> {
    let storages = config.configured_storages();
    let members = storages
        .get(&args.virtual_storage)
        .with_context(|| format!("unknown virtual storage {:?}", args.virtual_storage))?;
    anyhow::ensure!(
        members.contains(&args.authoritative_storage),
        "unknown authoritative storage {:?}",
        args.authoritative_storage
    );

    let pool = pool(config).await?;
    let store = repository_store(config, pool.clone());
    let queue = PgQueue::new(pool.clone());

    store
        .set_authoritative_replica(
            &args.virtual_storage,
            &args.relative_path,
            &args.authoritative_storage,
        )
        .await?;

    // Spread the authoritative version to every other assigned storage.
    let assignments = store
        .get_host_assignments(&args.virtual_storage, &args.relative_path)
        .await?;
    for target in assignments {
        if target == args.authoritative_storage {
            continue;
        }
        queue
            .enqueue(ReplicationJob {
                change: ChangeType::Update,
                virtual_storage: args.virtual_storage.clone(),
                relative_path: args.relative_path.clone(),
                source_storage: Some(args.authoritative_storage.clone()),
                target_storage: target.clone(),
                params: None,
            })
            .await?;
        println!("scheduled replication to {target}");
    }

    // A legacy shard demoted by failover becomes writable again.
    let node_store = PgNodeStore::new(pool);
    match node_store.clear_demotion(&args.virtual_storage).await {
        Ok(()) => println!("cleared read-only demotion of {}", args.virtual_storage),
        Err(datastore::DatastoreError::NoRowsAffected) => (),
        Err(err) => return Err(err.into()),
    }

    println!(
        "accepted dataloss: {} is now authoritative for {}/{}",
        args.authoritative_storage, args.virtual_storage, args.relative_path
    );
    Ok(())
}

#[derive(clap::Args, Debug)]
pub struct SetReplicationFactorArgs {
    #[clap(long)]
    virtual_storage: String,
    #[clap(long)]
    repository: String,
    #[clap(long)]
    replication_factor: usize,
}

pub async fn set_replication_factor(
    config: &Config,
    args: SetReplicationFactorArgs,
) -> anyhow::Result<()> {
    let storages = config.configured_storages();
    let members = storages
        .get(&args.virtual_storage)
        .with_context(|| format!("unknown virtual storage {:?}", args.virtual_storage))?;
    anyhow::ensure!(
        (1..=members.len()).contains(&args.replication_factor),
        "replication factor must be between 1 and {}, got {}",
        members.len(),
        args.replication_factor
    );

    let pool = pool(config).await?;
    let store = repository_store(config, pool);
    let assigned = store
        .set_replication_factor(
            &args.virtual_storage,
            &args.repository,
            args.replication_factor,
        )
        .await?;
    println!("current assignments: {}", assigned.join(", "));
    Ok(())
}

pub fn list_storages(config: &Config) -> anyhow::Result<()> {
    for virtual_storage in &config.virtual_storages {
        println!("{}:", virtual_storage.name);
        for node in &virtual_storage.nodes {
            println!("  {} ({})", node.storage, node.address);
        }
    }
    Ok(())
}
