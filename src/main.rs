use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast;

use oras_inspect::gateway::{Connector, LayoutConnector, RegistryGateway};
use oras_inspect::referrers::{progress_percent, NodeKind};
use oras_inspect::{
    CoordinatorConfig, InspectorConfig, LoadCoordinator, Reference, ReferrerNode, SourceKind,
    TagOrDigest,
};

#[derive(Parser)]
#[command(name = "oras-inspect")]
#[command(about = "Inspect OCI manifests and the artifacts that refer to them")]
struct Cli {
    /// Local registry layout directory (overrides config)
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a manifest and its referrer tree
    Inspect {
        reference: String,
        /// Reload even if already current
        #[arg(long)]
        force: bool,
    },
    /// List repositories in a registry
    Repos { registry: String },
    /// List tags in a repository (registry/repository)
    Tags { repository: String },
    /// Store a manifest file in the local layout
    Push {
        /// registry/repository[:tag]
        reference: String,
        manifest: PathBuf,
    },
    /// Delete a manifest by tag or digest
    Delete { reference: String },
    /// Show or edit the reference history
    History {
        #[arg(long, conflicts_with = "remove")]
        clear: bool,
        #[arg(long, value_name = "REFERENCE")]
        remove: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();

    let mut config = InspectorConfig::load()?;
    if let Some(root) = cli.root {
        config.layout_root = root;
    }
    let connector = LayoutConnector::new(config.ensure_layout_root()?);

    match cli.command {
        Command::Inspect { reference, force } => {
            let coordinator = spawn_coordinator(connector, &config);
            inspect(&coordinator, &reference, force).await
        }
        Command::Repos { registry } => {
            let gateway = connector.connect(&registry).await?;
            for repository in gateway.list_repositories().await? {
                println!("{}", repository);
            }
            Ok(())
        }
        Command::Tags { repository } => {
            let reference = Reference::parse(&repository)?;
            let gateway = connector.connect(reference.registry()).await?;
            for tag in gateway.list_tags(reference.repository()).await? {
                println!("{}", tag);
            }
            Ok(())
        }
        Command::Push {
            reference,
            manifest,
        } => {
            let reference = Reference::parse(&reference)?;
            let json = std::fs::read_to_string(&manifest)
                .with_context(|| format!("Failed to read manifest: {:?}", manifest))?;
            let gateway = connector.gateway(reference.registry());
            let digest = gateway.put_manifest(reference.repository(), &json, reference.tag())?;
            println!("{}", reference.with_content(TagOrDigest::Digest(digest.parse()?)));
            Ok(())
        }
        Command::Delete { reference } => {
            let coordinator = spawn_coordinator(connector, &config);
            delete(&coordinator, &reference).await
        }
        Command::History { clear, remove } => {
            let coordinator = spawn_coordinator(connector, &config);
            if clear {
                coordinator.clear_history();
            } else if let Some(entry) = remove {
                if !coordinator.remove_history_entry(&entry) {
                    anyhow::bail!("{} is not in history", entry);
                }
            }
            for entry in coordinator.history() {
                println!("{}", entry);
            }
            Ok(())
        }
    }
}

fn setup_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("ORAS_INSPECT_LOG")
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn spawn_coordinator(connector: LayoutConnector, config: &InspectorConfig) -> LoadCoordinator {
    let connector: Arc<dyn Connector> = Arc::new(connector);
    LoadCoordinator::spawn(connector, CoordinatorConfig::from(config))
}

async fn inspect(coordinator: &LoadCoordinator, reference: &str, force: bool) -> Result<()> {
    let notifications = coordinator.notifications();
    let mut completed = notifications.on_load_completed();
    let mut failed = notifications.on_load_failed();
    let mut progress = notifications.on_referrer_progress();
    let mut loaded = notifications.on_referrers_loaded();
    let mut referrers_failed = notifications.on_referrers_failed();

    coordinator.request_load(reference, SourceKind::ReferenceBox, force)?;

    let identity = tokio::select! {
        event = completed.recv() => event.context("Load coordinator stopped")?.identity,
        event = failed.recv() => {
            let event = event.context("Load coordinator stopped")?;
            return Err(event.error).context(format!("Failed to load {}", event.reference));
        }
    };

    println!("Registry:   {}", identity.registry);
    println!("Repository: {}", identity.repository);
    println!("Digest:     {}", identity.manifest_digest);
    println!("Media type: {}", identity.media_type);
    if let Some(tag) = coordinator.selection().selected_tag {
        println!("Tag:        {}", tag);
    }
    println!();
    println!("{}", identity.raw_manifest_json.trim_end());
    println!();

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("  {msg} [{bar:40.cyan/blue}] {pos}%")
            .context("Failed to create progress template")?
            .progress_chars("█▓░"),
    );
    bar.set_message("Loading referrers");

    loop {
        tokio::select! {
            event = progress.recv() => match event {
                Ok(event) => bar.set_position(progress_percent(event.count) as u64),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = loaded.recv() => {
                let event = event.context("Load coordinator stopped")?;
                bar.finish_and_clear();
                let tree = coordinator.referrer_tree();
                print_tree(&tree.nodes, 0);
                println!("{} referrers loaded", event.count);
                break;
            }
            event = referrers_failed.recv() => {
                let event = event.context("Load coordinator stopped")?;
                bar.finish_and_clear();
                eprintln!("Referrers unavailable: {}", event.error);
                break;
            }
        }
    }
    Ok(())
}

fn print_tree(nodes: &[ReferrerNode], depth: usize) {
    for node in nodes {
        let marker = match node.kind {
            NodeKind::Group => "+",
            NodeKind::Descriptor => "-",
            NodeKind::AnnotationLeaf => "·",
        };
        println!("{}{} {}", "  ".repeat(depth), marker, node.display);
        print_tree(&node.children, depth + 1);
    }
}

async fn delete(coordinator: &LoadCoordinator, reference: &str) -> Result<()> {
    let notifications = coordinator.notifications();
    let mut deleted = notifications.on_manifest_deleted();
    let mut failed = notifications.on_delete_failed();

    coordinator.delete_manifest(reference)?;

    tokio::select! {
        event = deleted.recv() => {
            let event = event.context("Load coordinator stopped")?;
            println!("Deleted {} ({})", event.reference, event.digest);
            Ok(())
        }
        event = failed.recv() => {
            let event = event.context("Load coordinator stopped")?;
            Err(event.error).context(format!("Failed to delete {}", event.reference))
        }
    }
}
