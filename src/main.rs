mod commands;
mod config;
mod config_loader;
mod database;
mod docker;
mod error;
mod git;
mod hooks;
mod models;
mod profile_processor;
mod proxy_processor;
mod scheduler;
mod service_processor;
mod storage_processor;
mod template_processor;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

use crate::commands::{InstallOptions, LogHandle, StopOptions, Target};

#[derive(Parser)]
#[command(name = "dockerup")]
#[command(about = "Install and run a profile's services, storages and reverse proxy with docker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Clone)]
struct TargetArgs {
    /// Profile name (defaults to the first registered profile)
    #[arg(short, long)]
    profile: Option<String>,
    /// Environment, selects `configs.<env>.yml` (defaults to the profile's default env, then prod)
    #[arg(short, long)]
    env: Option<String>,
}

impl From<TargetArgs> for Target {
    fn from(args: TargetArgs) -> Self {
        Target {
            profile: args.profile,
            env: args.env,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Clone, build and start every enabled service of a profile
    Install {
        #[command(flatten)]
        target: TargetArgs,
        /// Services not to clone again
        #[arg(long, value_delimiter = ',')]
        skip_clone: Vec<String>,
        /// Services whose image is not rebuilt
        #[arg(long, value_delimiter = ',')]
        skip_build: Vec<String>,
        /// Services built with --no-cache
        #[arg(long, value_delimiter = ',')]
        no_cache_build: Vec<String>,
        /// Keep dangling images
        #[arg(long)]
        skip_remove_unused_images: bool,
        /// Also remove storage containers and recreate the proxy
        #[arg(long)]
        remove_containers: bool,
    },
    /// Build service images without restarting containers
    Build {
        #[command(flatten)]
        target: TargetArgs,
        /// Only this service
        #[arg(long)]
        service: Option<String>,
        #[arg(long)]
        no_cache: bool,
    },
    /// Build and push the base images services list under `docker.push`
    Push {
        #[command(flatten)]
        target: TargetArgs,
        /// Only this service
        #[arg(long)]
        service: Option<String>,
        /// Registry path to push under, like harbor.company.com/project
        #[arg(long)]
        docker_project: Option<String>,
    },
    /// Stop services and storages
    Stop {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long, value_delimiter = ',')]
        services: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        storages: Vec<String>,
        #[arg(long)]
        all_services: bool,
        #[arg(long)]
        all_storages: bool,
        /// Remove the containers after stopping them
        #[arg(long)]
        remove_containers: bool,
    },
    /// Show the logs of a service or storage container
    Log {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        service: String,
        #[arg(short, long)]
        follow: bool,
    },
    /// Manage registered profiles
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },
    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum ProfileAction {
    /// Register a profile directory, creating a starter profile when it does not exist
    Add {
        path: PathBuf,
        /// Profile name (defaults to the directory's .profile file)
        #[arg(short, long)]
        name: Option<String>,
        /// Defaults to prod, or the first environment found
        #[arg(long)]
        default_env: Option<String>,
    },
    /// List registered profiles
    List,
    /// Forget a profile
    Remove { name: String },
}

fn init_logging() -> LogHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
    handle
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_handle = init_logging();

    if let Err(e) = run(cli, log_handle).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli, log_handle: LogHandle) -> Result<()> {
    if let Commands::Version = cli.command {
        // Version command doesn't need database
        commands::Commands::show_version();
        return Ok(());
    }

    let needs_docker = !matches!(cli.command, Commands::Profile { .. });
    if needs_docker && std::env::var("USER").unwrap_or_default() != "root" {
        anyhow::bail!("dockerup must be run with root privileges to drive docker (use sudo)");
    }

    let settings = config::Config::from_env();
    if let Some(parent) = settings.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = database::Database::new(&settings.database_url()).await?;
    let commands = commands::Commands::new(db, settings, Some(log_handle));

    match cli.command {
        Commands::Install {
            target,
            skip_clone,
            skip_build,
            no_cache_build,
            skip_remove_unused_images,
            remove_containers,
        } => {
            commands
                .install(InstallOptions {
                    target: target.into(),
                    skip_clone,
                    skip_build,
                    no_cache_build,
                    skip_remove_unused_images,
                    remove_containers,
                })
                .await
        }
        Commands::Build {
            target,
            service,
            no_cache,
        } => {
            commands
                .build(&target.into(), service.as_deref(), no_cache)
                .await
        }
        Commands::Push {
            target,
            service,
            docker_project,
        } => {
            commands
                .push(&target.into(), service.as_deref(), docker_project.as_deref())
                .await
        }
        Commands::Stop {
            target,
            services,
            storages,
            all_services,
            all_storages,
            remove_containers,
        } => {
            commands
                .stop(StopOptions {
                    target: target.into(),
                    services,
                    storages,
                    all_services,
                    all_storages,
                    remove_containers,
                })
                .await
        }
        Commands::Log {
            target,
            service,
            follow,
        } => commands.log(&target.into(), &service, follow).await,
        Commands::Profile { action } => match action {
            ProfileAction::Add {
                path,
                name,
                default_env,
            } => {
                commands
                    .profile_add(&path, name.as_deref(), default_env)
                    .await
            }
            ProfileAction::List => commands.profile_list().await,
            ProfileAction::Remove { name } => commands.profile_remove(&name).await,
        },
        Commands::Version => Ok(()),
    }
}
