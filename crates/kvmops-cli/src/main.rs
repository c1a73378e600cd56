//! `kvmops` entry point.
//!
//! Drives one libvirt-managed machine per invocation. Identities live as
//! JSON files under the state directory, so commands can be repeated and
//! interrupted `create` runs resumed.

mod config;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use config::CliConfig;
use kvmops_core::{
    JsonFileStore, LibvirtdMachine, MachineBackend, MachineKey, MachineServices, NixImageBuilder,
    SshKeygen,
};
use kvmops_vm::{Definition, SystemRunner};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "kvmops")]
#[command(about = "Lifecycle controller for libvirt-managed KVM machines")]
#[command(version)]
struct Cli {
    /// Identity store directory (overrides KVMOPS_STATE_DIR)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// libvirt connection URI (overrides KVMOPS_CONNECT_URI)
    #[arg(long, global = true)]
    connect_uri: Option<String>,

    /// Give up waiting for a DHCP lease after this many seconds
    #[arg(long, global = true)]
    lease_timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct MachineArgs {
    /// Deployment UUID
    #[arg(long)]
    deployment: Uuid,

    /// Machine name within the deployment
    #[arg(long)]
    name: String,
}

impl MachineArgs {
    fn key(&self) -> MachineKey {
        MachineKey::new(self.deployment, self.name.as_str())
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Provision and register the machine if needed, then start it
    Create {
        #[command(flatten)]
        machine: MachineArgs,

        /// Machine definition (JSON)
        #[arg(long)]
        definition: PathBuf,
    },

    /// Start the machine, or refresh its address if already running
    Start {
        #[command(flatten)]
        machine: MachineArgs,
    },

    /// Force-stop the machine
    Stop {
        #[command(flatten)]
        machine: MachineArgs,
    },

    /// Stop, unregister and delete the machine's disks
    Destroy {
        #[command(flatten)]
        machine: MachineArgs,
    },

    /// Print the persisted identity as JSON
    Show {
        #[command(flatten)]
        machine: MachineArgs,
    },

    /// Print the machine's current DHCP address
    Address {
        #[command(flatten)]
        machine: MachineArgs,
    },

    /// Print the domain descriptor a definition renders to
    Render {
        #[command(flatten)]
        machine: MachineArgs,

        /// Machine definition (JSON)
        #[arg(long)]
        definition: PathBuf,
    },
}

impl Commands {
    fn machine(&self) -> &MachineArgs {
        match self {
            Self::Create { machine, .. }
            | Self::Start { machine }
            | Self::Stop { machine }
            | Self::Destroy { machine }
            | Self::Show { machine }
            | Self::Address { machine }
            | Self::Render { machine, .. } => machine,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries command output
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("kvmops=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = CliConfig::from_env();
    if let Some(dir) = cli.state_dir {
        config.state_dir = dir;
    }
    if let Some(uri) = cli.connect_uri {
        config.connect_uri = uri;
    }
    if let Some(secs) = cli.lease_timeout {
        config.lease_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    tracing::debug!(?config, "Configuration loaded");

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received interrupt, cancelling");
            interrupt.cancel();
        }
    });

    let mut machine = open_machine(cli.command.machine().key(), &config).await?;

    match cli.command {
        Commands::Create { definition, .. } => {
            let definition = load_definition(&definition).await?;
            machine.create(&definition, &cancel).await?;
            println!("{}", machine.ssh_address()?);
        }
        Commands::Start { .. } => {
            machine.start(&cancel).await?;
            match machine.identity().private_ipv4.as_deref() {
                Some(address) => println!("{address}"),
                None => tracing::warn!("Machine is running but has no address yet"),
            }
        }
        Commands::Stop { .. } => machine.stop().await?,
        Commands::Destroy { .. } => machine.destroy().await?,
        Commands::Show { .. } => {
            let mut identity = machine.identity().clone();
            if let Some(pair) = identity.ssh_key_pair.as_mut() {
                pair.private_key = "<redacted>".into();
            }
            println!("{}", serde_json::to_string_pretty(&identity)?);
        }
        Commands::Address { .. } => {
            let address = machine
                .resolve_address()
                .await?
                .context("no DHCP lease for the machine's MAC")?;
            println!("{address}");
        }
        Commands::Render { definition, .. } => {
            let definition = load_definition(&definition).await?;
            print!("{}", machine.render_descriptor(&definition)?);
        }
    }

    Ok(())
}

async fn open_machine(key: MachineKey, config: &CliConfig) -> anyhow::Result<LibvirtdMachine> {
    let runner = Arc::new(SystemRunner);
    let images = NixImageBuilder::new(runner.clone(), &config.work_dir)
        .eval_args(config.nix_args.clone())
        .nix_path_args(config.nix_path_args());

    let services = MachineServices {
        runner: runner.clone(),
        store: Arc::new(JsonFileStore::new(&config.state_dir)),
        images: Arc::new(images),
        keys: Arc::new(SshKeygen::new(runner)),
    };

    let machine = LibvirtdMachine::open(key, config.controller()?, services)
        .await
        .context("failed to open machine")?;
    Ok(machine)
}

async fn load_definition(path: &Path) -> anyhow::Result<Definition> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read definition {}", path.display()))?;
    Ok(Definition::from_json(&text)?)
}
