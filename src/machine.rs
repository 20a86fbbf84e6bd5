//! # High-level environment lifecycle (recommended)
//!
//! [Machine] drives the virtualization control plane through the command
//! executor: it defines the guest from a synthesized descriptor, provisions
//! its disk idempotently, powers it on and off, manages snapshots and grows
//! the disk. The environment under management is whichever one the persisted
//! arbitration config names; [Machine::create] writes that record.
//!
//! Disk and snapshot operations can legitimately take minutes on large
//! images. Callers should poll [Machine::state] instead of assuming
//! sub-second completion.

use std::path::PathBuf;

use tracing::{debug, info, instrument, warn};

use crate::descriptor::{synthesize, ConfigurationError, DomainConfig, IMAGE_DIR};
use crate::executor::{Execute, ExecuteError};
use crate::store::{ArbitrationConfig, ConfigStore, StoreError};

pub(crate) const LIBVIRT_URI: &str = "qemu:///system";
const STORAGE_POOL: &str = "default";

#[derive(thiserror::Error, Debug)]
pub enum MachineError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Execute(#[from] ExecuteError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Could not prepare domain definition: {0}")]
    Setup(String),
    #[error("Could not parse control-plane output: {0}")]
    Parse(String),
}

/// Guest power state as reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Running,
    Stopped,
    /// The control plane was unreachable or reported a transient state.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub name: String,
    pub creation_time: String,
    pub state: String,
}

/// An instance of the managed environment.
#[derive(Debug)]
pub struct Machine<E> {
    executor: E,
    store: ConfigStore,
}

impl<E: Execute> Machine<E> {
    pub fn new(executor: E, store: ConfigStore) -> Machine<E> {
        Machine { executor, store }
    }

    async fn virsh(&self, args: Vec<String>) -> Result<crate::executor::CommandOutput, ExecuteError> {
        let mut full = vec!["-c".to_string(), LIBVIRT_URI.to_string()];
        full.extend(args);
        self.executor.run("virsh", &full).await
    }

    /// Create the environment from the configuration. Goes through a few
    /// steps:
    ///
    /// 1. Synthesize the domain descriptor (pure, fails before any side
    ///    effect on constraint violation)
    /// 2. Persist the arbitration config so later arbitration calls know the
    ///    thread split and device addresses
    /// 3. Provision the backing disk volume, only if it does not exist yet
    /// 4. Define the domain from the serialized descriptor
    ///
    /// Re-running against an existing environment redefines the domain but
    /// never destroys or duplicates the disk.
    #[instrument(skip(self, config), fields(name = %config.name))]
    pub async fn create(&self, config: &DomainConfig) -> Result<(), MachineError> {
        // Step 1. Synthesize the descriptor
        let descriptor = synthesize(config)?;
        for warning in &descriptor.warnings {
            warn!("{warning}");
        }

        // Step 2. Persist the arbitration config
        self.store.save(&ArbitrationConfig {
            total_threads: config.total_threads,
            host_threads: config.host_threads,
            last_env_name: config.name.clone(),
            gpu_address: config.gpu_address,
            audio_address: config.audio_address,
        })?;

        // Step 3. Provision the disk volume, idempotently
        let volume = format!("{}.qcow2", config.name);
        let probe = self
            .virsh(vec![
                "vol-info".to_string(),
                "--pool".to_string(),
                STORAGE_POOL.to_string(),
                volume.clone(),
            ])
            .await?;
        if probe.success() {
            info!("Volume {volume} already exists, leaving it in place");
        } else {
            info!("Creating volume {volume} ({} GiB)", config.disk_size_gb);
            self.virsh(vec![
                "vol-create-as".to_string(),
                STORAGE_POOL.to_string(),
                volume.clone(),
                format!("{}G", config.disk_size_gb),
                "--format".to_string(),
                "qcow2".to_string(),
            ])
            .await?
            .require_success(&format!("virsh vol-create-as {volume}"))?;
        }

        // Step 4. Define the domain
        let xml_path = std::env::temp_dir().join(format!("{}.xml", config.name));
        std::fs::write(&xml_path, descriptor.to_xml())
            .map_err(|e| MachineError::Setup(format!("could not write {xml_path:?}: {e}")))?;
        self.virsh(vec![
            "define".to_string(),
            xml_path.display().to_string(),
        ])
        .await?
        .require_success("virsh define")?;
        info!("Environment {} defined", config.name);
        Ok(())
    }

    /// Boot the managed environment.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), MachineError> {
        let name = self.env_name()?;
        self.virsh(vec!["start".to_string(), name.clone()])
            .await?
            .require_success(&format!("virsh start {name}"))?;
        Ok(())
    }

    /// Ask the guest to shut down gracefully.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), MachineError> {
        let name = self.env_name()?;
        self.virsh(vec!["shutdown".to_string(), name.clone()])
            .await?
            .require_success(&format!("virsh shutdown {name}"))?;
        Ok(())
    }

    /// Current power state. Transient or unreadable states report
    /// [PowerState::Unknown] rather than failing, so this is safe to poll
    /// while a handoff or power transition is in flight.
    pub async fn state(&self) -> Result<PowerState, MachineError> {
        let name = self.env_name()?;
        let output = self.virsh(vec!["domstate".to_string(), name]).await?;
        if !output.success() {
            return Ok(PowerState::Unknown);
        }
        Ok(match output.stdout.trim() {
            "running" => PowerState::Running,
            "shut off" => PowerState::Stopped,
            _ => PowerState::Unknown,
        })
    }

    /// Current virtual disk size in GiB, read from the control plane.
    pub async fn disk_size_gb(&self) -> Result<u64, MachineError> {
        let path = self.disk_path()?;
        let output = self
            .executor
            .run("qemu-img", &["info".to_string(), path.display().to_string()])
            .await?
            .require_success(&format!("qemu-img info {}", path.display()))?;
        parse_virtual_size_gb(&output.stdout)
            .ok_or_else(|| MachineError::Parse("no virtual size in qemu-img output".to_string()))
    }

    /// Grow the virtual disk by `delta_gb` and return the new size.
    ///
    /// Shrinking is destructive and unsupported: a zero or negative delta is
    /// rejected here, before any command runs.
    #[instrument(skip(self))]
    pub async fn expand_disk(&self, delta_gb: i64) -> Result<u64, MachineError> {
        if delta_gb <= 0 {
            return Err(MachineError::InvalidRequest(format!(
                "disk expansion must be positive, got {delta_gb} GiB"
            )));
        }
        let current = self.disk_size_gb().await?;
        let new_size = current + delta_gb as u64;
        let path = self.disk_path()?;
        debug!("Resizing {} from {current} GiB to {new_size} GiB", path.display());
        self.executor
            .run(
                "qemu-img",
                &[
                    "resize".to_string(),
                    path.display().to_string(),
                    format!("{new_size}G"),
                ],
            )
            .await?
            .require_success("qemu-img resize")?;
        Ok(new_size)
    }

    /// Take a snapshot, forwarded as an atomic request: the control plane
    /// either records it completely or not at all.
    #[instrument(skip(self, description))]
    pub async fn snapshot_create(
        &self,
        name: &str,
        description: &str,
    ) -> Result<(), MachineError> {
        let env = self.env_name()?;
        self.virsh(vec![
            "snapshot-create-as".to_string(),
            "--domain".to_string(),
            env,
            "--name".to_string(),
            name.to_string(),
            "--description".to_string(),
            description.to_string(),
            "--atomic".to_string(),
        ])
        .await?
        .require_success(&format!("virsh snapshot-create-as {name}"))?;
        Ok(())
    }

    pub async fn snapshot_list(&self) -> Result<Vec<Snapshot>, MachineError> {
        let env = self.env_name()?;
        let output = self
            .virsh(vec!["snapshot-list".to_string(), env])
            .await?
            .require_success("virsh snapshot-list")?;
        Ok(parse_snapshot_table(&output.stdout))
    }

    /// Revert to a snapshot. Passes `--running` so the guest is in a
    /// runnable state afterward regardless of its state beforehand.
    #[instrument(skip(self))]
    pub async fn snapshot_revert(&self, name: &str) -> Result<(), MachineError> {
        let env = self.env_name()?;
        self.virsh(vec![
            "snapshot-revert".to_string(),
            env,
            "--snapshotname".to_string(),
            name.to_string(),
            "--running".to_string(),
        ])
        .await?
        .require_success(&format!("virsh snapshot-revert {name}"))?;
        Ok(())
    }

    /// Delete a snapshot. Irreversible; any confirmation happens at the
    /// caller.
    #[instrument(skip(self))]
    pub async fn snapshot_delete(&self, name: &str) -> Result<(), MachineError> {
        let env = self.env_name()?;
        self.virsh(vec![
            "snapshot-delete".to_string(),
            env,
            "--snapshotname".to_string(),
            name.to_string(),
        ])
        .await?
        .require_success(&format!("virsh snapshot-delete {name}"))?;
        Ok(())
    }

    fn env_name(&self) -> Result<String, MachineError> {
        Ok(self.store.load()?.last_env_name)
    }

    fn disk_path(&self) -> Result<PathBuf, MachineError> {
        let name = self.env_name()?;
        Ok(PathBuf::from(IMAGE_DIR).join(format!("{name}.qcow2")))
    }
}

/// Extract the virtual size in GiB from `qemu-img info` output, e.g.
/// `virtual size: 128 GiB (137438953472 bytes)`.
fn parse_virtual_size_gb(output: &str) -> Option<u64> {
    let line = output
        .lines()
        .find_map(|l| l.trim().strip_prefix("virtual size:"))?;
    let mut parts = line.split_whitespace();
    let value: f64 = parts.next()?.parse().ok()?;
    let unit = parts.next()?;
    match unit {
        "GiB" | "G" => Some(value.round() as u64),
        "TiB" | "T" => Some((value * 1024.0).round() as u64),
        _ => None,
    }
}

/// Parse the `virsh snapshot-list` table: a header, a dashed separator, then
/// one row per snapshot with whitespace-separated name, creation time and
/// state.
fn parse_snapshot_table(output: &str) -> Vec<Snapshot> {
    let mut snapshots = Vec::new();
    let mut past_separator = false;
    for line in output.lines() {
        let trimmed = line.trim();
        if !past_separator {
            past_separator = trimmed.starts_with('-');
            continue;
        }
        if trimmed.is_empty() {
            continue;
        }
        let parts: Vec<&str> = trimmed.split_whitespace().collect();
        if parts.len() < 3 {
            continue;
        }
        snapshots.push(Snapshot {
            name: parts[0].to_string(),
            creation_time: parts[1..parts.len() - 1].join(" "),
            state: parts[parts.len() - 1].to_string(),
        });
    }
    snapshots
}
