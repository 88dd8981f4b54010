//! Courseware Ledger CLI
//!
//! Operator tool over an on-disk ledger.
//!
//! ## Usage
//!
//! ```bash
//! # Publish a tree (JSON: deploymentId, cohortId, optional changeId, root)
//! courseware-ledger publish --tree tree.json
//!
//! # Current change of a deployment, or every change with --all
//! courseware-ledger latest --deployment <uuid> --all
//!
//! # One element with its children and parent
//! courseware-ledger tree --deployment <uuid> --element <uuid>
//!
//! # Check forward edges against back-references
//! courseware-ledger verify --deployment <uuid>
//!
//! # Progress rows of a student
//! courseware-ledger progress --deployment <uuid> --student <uuid>
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use courseware_ledger::services::events::spawn_logging_listener;
use courseware_ledger::{
    ChangeId, Config, Consistency, CoursewareNode, MigrationPhase, PinnedDeployment, PublishRequest, Services,
};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "courseware-ledger")]
#[command(about = "Deployment versioning and learner progress ledger")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "COURSEWARE_LEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "COURSEWARE_LEDGER_DIR")]
    storage_dir: Option<PathBuf>,

    /// Tenant keyspace
    #[arg(long, env = "COURSEWARE_LEDGER_KEYSPACE")]
    keyspace: Option<String>,

    /// Consistency level (one, local_quorum, quorum, all)
    #[arg(long)]
    consistency: Option<Consistency>,

    /// Back-reference migration phase (legacy_only, dual_write, unified_only)
    #[arg(long)]
    edge_migration: Option<MigrationPhase>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Freeze a courseware tree as a new deployment snapshot
    Publish {
        /// JSON file describing the tree
        #[arg(long)]
        tree: PathBuf,

        /// Change id to publish under (minted when absent)
        #[arg(long)]
        change_id: Option<ChangeId>,
    },

    /// Show the latest change of a deployment
    Latest {
        #[arg(long)]
        deployment: Uuid,

        /// List every change, newest first
        #[arg(long)]
        all: bool,
    },

    /// Show one element of a snapshot with its edges
    Tree {
        #[arg(long)]
        deployment: Uuid,

        #[arg(long)]
        element: Uuid,

        /// Snapshot to read (latest when absent)
        #[arg(long)]
        change_id: Option<ChangeId>,
    },

    /// Check every edge pair of a snapshot
    Verify {
        #[arg(long)]
        deployment: Uuid,

        #[arg(long)]
        change_id: Option<ChangeId>,
    },

    /// List a student's progress rows in a deployment
    Progress {
        #[arg(long)]
        deployment: Uuid,

        #[arg(long)]
        student: Uuid,
    },
}

/// Publish input as written by the authoring pipeline
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TreeFile {
    deployment_id: Uuid,
    cohort_id: Uuid,
    #[serde(default)]
    change_id: Option<ChangeId>,
    root: CoursewareNode,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("courseware_ledger=info".parse()?))
        .init();

    let args = Args::parse();

    // Load config
    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(keyspace) = args.keyspace {
        config.keyspace = keyspace;
    }
    if let Some(consistency) = args.consistency {
        config.consistency = consistency;
    }
    if let Some(phase) = args.edge_migration {
        config.edge_migration = phase;
    }

    let services = Services::open(&config)?;
    let _listener = spawn_logging_listener(services.events.clone());

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if args.config.is_none() && !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    match args.command {
        Command::Publish { tree, change_id } => {
            let content = std::fs::read_to_string(&tree).with_context(|| format!("reading {}", tree.display()))?;
            let file: TreeFile = serde_json::from_str(&content).context("parsing tree file")?;
            let request = PublishRequest {
                deployment_id: file.deployment_id,
                cohort_id: file.cohort_id,
                change_id: change_id.or(file.change_id).unwrap_or_else(ChangeId::new),
                root: file.root,
            };
            let change_id = services.publish(&request).await?;
            println!("{}", change_id);
        }

        Command::Latest { deployment, all } => {
            if all {
                for change_id in services.versions.list_changes(deployment).await? {
                    println!("{}", change_id);
                }
            } else {
                match services.versions.find_latest(deployment).await? {
                    Some(deployed) => println!("{}", serde_json::to_string_pretty(&deployed)?),
                    None => bail!("content not yet available: deployment {} was never published", deployment),
                }
            }
        }

        Command::Tree {
            deployment,
            element,
            change_id,
        } => {
            let pin = match change_id {
                Some(change_id) => PinnedDeployment::new(deployment, change_id),
                None => services.versions.require_pin(deployment).await?,
            };
            let Some(found) = services.tree.find_element(pin, element).await? else {
                bail!("element {} not found in {}", element, pin);
            };
            let children = services.tree.find_children(pin, element).await?;
            let parent = services
                .tree
                .find_parent(pin, element, Some(found.element_type))
                .await?;

            let view = serde_json::json!({
                "element": found,
                "children": children.iter().collect::<Vec<_>>(),
                "parent": parent,
            });
            println!("{}", serde_json::to_string_pretty(&view)?);
        }

        Command::Verify { deployment, change_id } => {
            let deployed = match change_id {
                Some(change_id) => services.versions.find(deployment, change_id).await?,
                None => services.versions.find_latest(deployment).await?,
            };
            let Some(deployed) = deployed else {
                bail!("content not yet available: deployment {}", deployment);
            };
            let pin = PinnedDeployment::new(deployment, deployed.change_id());
            let report = services.tree.verify(pin, deployed.activity_id).await?;

            println!(
                "checked {} elements, {} duplicate cells",
                report.elements_checked, report.duplicate_cells
            );
            for fault in &report.missing_back_refs {
                println!("missing back-reference: {} -> {}", fault.parent_id, fault.child_id);
            }
            for fault in &report.mismatched_back_refs {
                println!("mismatched back-reference: {} -> {}", fault.parent_id, fault.child_id);
            }
            for fault in &report.orphan_back_refs {
                println!("unlisted back-reference: {} -> {}", fault.parent_id, fault.child_id);
            }
            for element_id in &report.missing_elements {
                println!("missing element row: {}", element_id);
            }
            if !report.is_clean() {
                warn!(pin = %pin, "Snapshot edges are inconsistent; republish to repair");
                bail!("snapshot {} is inconsistent", pin);
            }
        }

        Command::Progress { deployment, student } => {
            let rows = services.progress.find_student_progress(deployment, student).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }

    Ok(())
}
