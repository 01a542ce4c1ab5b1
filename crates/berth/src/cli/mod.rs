//! CLI command definitions and handlers.

use std::collections::BTreeMap;
use std::path::PathBuf;

use berth_common::ContainerId;
use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{eyre, Result, WrapErr};
use tabled::{Table, Tabled};

use crate::filesystem;
use crate::runtime::{CreateContainer, Engine, EngineConfig};
use crate::volume::{ContainerMountSet, MountLayer, MountSource};

/// berth - container volume lifecycle manager
#[derive(Parser)]
#[command(name = "berth")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Root directory for berth data
    #[arg(long, global = true, env = "BERTH_ROOT")]
    pub root: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Listing output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Aligned table.
    Table,
    /// JSON array.
    Json,
}

/// Top-level commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Create a container and resolve its volumes
    Create {
        /// Image name or absolute rootfs path
        image: String,

        /// Mount a volume (`/target`, `name:/target[:ro]`, `/host:/target[:ro]`)
        #[arg(short = 'v', long = "volume")]
        volumes: Vec<String>,

        /// Remove the container and its anonymous volumes when it stops
        #[arg(long = "rm")]
        auto_remove: bool,

        /// Container ID
        #[arg(long)]
        name: Option<String>,
    },

    /// Start a created container and show its mounts
    Start {
        /// Container ID
        container_id: String,

        /// Bind the mount plan under this directory (requires privileges)
        #[arg(long)]
        mount: Option<PathBuf>,
    },

    /// Stop a container
    Stop {
        /// Container ID
        container_id: String,
    },

    /// Remove containers
    Rm {
        /// Container IDs
        #[arg(required = true)]
        container_ids: Vec<String>,

        /// Remove anonymous volumes associated with the container
        #[arg(short = 'v', long = "volumes")]
        volumes: bool,
    },

    /// List containers
    Ps {
        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,

        /// Only display container IDs
        #[arg(short, long)]
        quiet: bool,
    },

    /// Manage volumes
    #[command(subcommand)]
    Volume(VolumeCommands),
}

/// Volume commands.
#[derive(Subcommand)]
pub enum VolumeCommands {
    /// List volumes
    Ls {
        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,

        /// Only display volume names
        #[arg(short, long)]
        quiet: bool,
    },

    /// Create a named volume
    Create {
        /// Volume name
        name: String,

        /// Set metadata (`key=value`)
        #[arg(long = "label")]
        labels: Vec<String>,
    },

    /// Display detailed information on volumes
    Inspect {
        /// Volume names
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Remove volumes
    Rm {
        /// Volume names
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Remove unused volumes
    Prune,
}

#[derive(Tabled)]
struct ContainerRow {
    #[tabled(rename = "CONTAINER ID")]
    id: String,
    #[tabled(rename = "IMAGE")]
    image: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "MOUNTS")]
    mounts: usize,
    #[tabled(rename = "CREATED")]
    created: String,
}

#[derive(Tabled)]
struct VolumeRow {
    #[tabled(rename = "VOLUME NAME")]
    name: String,
    #[tabled(rename = "KIND")]
    kind: String,
    #[tabled(rename = "REFS")]
    refs: usize,
}

#[derive(Tabled)]
struct MountRow {
    #[tabled(rename = "TARGET")]
    target: String,
    #[tabled(rename = "TYPE")]
    kind: String,
    #[tabled(rename = "SOURCE")]
    source: String,
    #[tabled(rename = "MODE")]
    mode: &'static str,
}

impl From<&MountLayer> for MountRow {
    fn from(layer: &MountLayer) -> Self {
        let (kind, source) = match &layer.source {
            MountSource::Volume { id, kind } => (kind.to_string(), id.to_string()),
            MountSource::Bind => ("bind".to_string(), layer.host_path.display().to_string()),
        };
        Self {
            target: layer.target.display().to_string(),
            kind,
            source,
            mode: if layer.read_only { "ro" } else { "rw" },
        }
    }
}

fn parse_labels(labels: &[String]) -> Result<BTreeMap<String, String>> {
    labels
        .iter()
        .map(|label| {
            let (key, value) = label.split_once('=').unwrap_or((label.as_str(), ""));
            if key.is_empty() {
                return Err(eyre!("invalid label '{label}': empty key"));
            }
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}

impl Cli {
    /// Build the engine configuration from flags and the config file.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path)?,
            None => EngineConfig::default(),
        };
        if let Some(root) = &self.root {
            config = config.with_root(root);
        }
        Ok(config)
    }

    /// Execute the CLI command.
    pub fn execute(self) -> Result<()> {
        let engine = Engine::open(self.engine_config()?).wrap_err("Failed to open berth root")?;

        match self.command {
            Commands::Create {
                image,
                volumes,
                auto_remove,
                name,
            } => {
                let id = name.map(ContainerId::new).transpose()?;
                let mounts = ContainerMountSet::parse(&volumes)?;
                let id = engine.create_container(CreateContainer {
                    id,
                    image,
                    mounts,
                    auto_remove,
                })?;
                println!("{id}");
                Ok(())
            }

            Commands::Start {
                container_id,
                mount,
            } => {
                if mount.is_some() && engine.config().rootless {
                    return Err(eyre!("--mount needs root privileges; rootless engines only report the mount plan"));
                }
                let id = ContainerId::new(container_id)?;
                let view = engine.start_container(&id)?;

                if let Some(root) = mount {
                    filesystem::execute_plan(&root, &view.mount_plan())
                        .wrap_err_with(|| format!("Failed to mount container {id}"))?;
                }

                let rows: Vec<MountRow> = view.layers().iter().map(MountRow::from).collect();
                if rows.is_empty() {
                    println!("Container {id} started (no mounts)");
                } else {
                    println!("{}", Table::new(rows));
                }
                for index in view.shadowed() {
                    println!("mount #{index} is shadowed by a later mount at the same target");
                }
                Ok(())
            }

            Commands::Stop { container_id } => {
                let id = ContainerId::new(container_id)?;
                if engine.stop_container(&id)?.is_some() {
                    println!("Container {id} stopped and removed");
                } else {
                    println!("Container {id} stopped");
                }
                Ok(())
            }

            Commands::Rm {
                container_ids,
                volumes,
            } => {
                let mut failed = 0;
                for raw in container_ids {
                    let result = ContainerId::new(raw.as_str())
                        .and_then(|id| engine.remove_container(&id, volumes));
                    match result {
                        Ok(report) => {
                            println!("{raw}");
                            for volume in &report.retained {
                                eprintln!("warning: volume {volume} could not be deleted; run `berth volume prune`");
                            }
                        }
                        Err(e) => {
                            eprintln!("Error: {e}");
                            failed += 1;
                        }
                    }
                }
                if failed > 0 {
                    return Err(eyre!("failed to remove {failed} container(s)"));
                }
                Ok(())
            }

            Commands::Ps { format, quiet } => {
                let containers = engine.list_containers();
                if quiet {
                    for c in containers {
                        println!("{}", c.id);
                    }
                } else if format == OutputFormat::Json {
                    println!("{}", serde_json::to_string_pretty(&containers)?);
                } else {
                    let rows: Vec<ContainerRow> = containers
                        .iter()
                        .map(|c| ContainerRow {
                            id: c.id.to_string(),
                            image: c.image.clone(),
                            status: c.status.to_string(),
                            mounts: c.mounts.len(),
                            created: c.created.format("%Y-%m-%d %H:%M:%S").to_string(),
                        })
                        .collect();
                    println!("{}", Table::new(rows));
                }
                Ok(())
            }

            Commands::Volume(command) => execute_volume(&engine, command),
        }
    }
}

fn execute_volume(engine: &Engine, command: VolumeCommands) -> Result<()> {
    match command {
        VolumeCommands::Ls { format, quiet } => {
            let volumes = engine.list_volumes();
            if quiet {
                for v in volumes {
                    println!("{}", v.id);
                }
            } else if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&volumes)?);
            } else {
                let rows: Vec<VolumeRow> = volumes
                    .iter()
                    .map(|v| VolumeRow {
                        name: v.id.to_string(),
                        kind: v.kind.to_string(),
                        refs: v.ref_count,
                    })
                    .collect();
                println!("{}", Table::new(rows));
            }
            Ok(())
        }

        VolumeCommands::Create { name, labels } => {
            let record = engine.create_volume(&name, parse_labels(&labels)?)?;
            println!("{}", record.id);
            Ok(())
        }

        VolumeCommands::Inspect { names } => {
            let records = names
                .iter()
                .map(|name| engine.inspect_volume(name))
                .collect::<Result<Vec<_>, _>>()?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }

        VolumeCommands::Rm { names } => {
            let mut failed = 0;
            for name in names {
                match engine.remove_volume(&name) {
                    Ok(()) => println!("{name}"),
                    Err(e) => {
                        eprintln!("Error: {e}");
                        failed += 1;
                    }
                }
            }
            if failed > 0 {
                return Err(eyre!("failed to remove {failed} volume(s)"));
            }
            Ok(())
        }

        VolumeCommands::Prune => {
            let report = engine.prune_volumes();
            for id in &report.deleted {
                println!("Deleted: {id}");
            }
            println!("Total volumes removed: {}", report.count());
            if !report.failed.is_empty() {
                return Err(eyre!("failed to prune {} volume(s)", report.failed.len()));
            }
            Ok(())
        }
    }
}
