//! GPU ownership arbitration.
//!
//! Moving a GPU between the host driver and vfio-pci is a two-phase resource
//! handoff with a strict order. Toward the guest: unload the host driver
//! modules, load the VFIO modules, then detach the device node from host
//! management. Loading VFIO before the host driver is fully gone can fail to
//! claim the device, and detaching before the driver swap leaves the device
//! driverless for both sides. Toward the host the sequence reverses.

use tracing::{debug, instrument};

use crate::address::BusAddress;
use crate::arbiter::{run_sequence, ArbiterError, Ownership, OwnershipTarget, Step};
use crate::executor::Execute;
use crate::inventory::parse_lspci_line;
use crate::machine::LIBVIRT_URI;
use crate::store::ConfigStore;

/// Host GPU driver modules, in unload order.
const HOST_DRIVER_MODULES: [&str; 3] = ["nvidia_modeset", "nvidia_uvm", "nvidia"];
/// Passthrough driver modules.
const VFIO_MODULES: [&str; 3] = ["vfio_pci", "vfio_pci_core", "vfio_iommu_type1"];

#[derive(Debug)]
pub struct GpuArbiter<E> {
    executor: E,
    store: ConfigStore,
}

impl<E: Execute> GpuArbiter<E> {
    pub fn new(executor: E, store: ConfigStore) -> GpuArbiter<E> {
        GpuArbiter { executor, store }
    }

    /// Hand the GPU to the given side.
    ///
    /// The device address resolves in precedence order: the explicit
    /// `address` argument, then the last-bound address from the persisted
    /// arbitration config, then a scan of the bus for a display-class
    /// device. [ArbiterError::NoGpuFound] when none resolves.
    #[instrument(skip(self))]
    pub async fn set_owner(
        &self,
        target: OwnershipTarget,
        address: Option<BusAddress>,
    ) -> Result<(), ArbiterError> {
        let address = self.resolve_address(address).await?;
        debug!("Arbitrating GPU at {}", address);
        let nodedev = address.nodedev_id();
        let steps = match target {
            OwnershipTarget::Guest => vec![
                Step {
                    name: "unload-host-driver",
                    program: "rmmod",
                    args: module_args(&HOST_DRIVER_MODULES),
                },
                Step {
                    name: "load-vfio-driver",
                    program: "modprobe",
                    args: verbose_module_args(&VFIO_MODULES),
                },
                Step {
                    name: "detach-device",
                    program: "virsh",
                    args: nodedev_args("nodedev-detach", &nodedev),
                },
            ],
            OwnershipTarget::Host => vec![
                Step {
                    name: "reattach-device",
                    program: "virsh",
                    args: nodedev_args("nodedev-reattach", &nodedev),
                },
                Step {
                    name: "unload-vfio-driver",
                    program: "rmmod",
                    args: module_args(&VFIO_MODULES),
                },
                Step {
                    name: "load-host-driver",
                    program: "modprobe",
                    args: verbose_module_args(&HOST_DRIVER_MODULES),
                },
            ],
        };
        run_sequence(&self.executor, steps).await
    }

    /// Infer the current owner from the kernel's live driver bindings:
    /// guest iff vfio-pci is the driver in use on a display-class device.
    /// [Ownership::Unknown] when the readback fails or shows no display
    /// device at all (e.g. observed mid-handoff).
    pub async fn current_owner(&self) -> Result<Ownership, ArbiterError> {
        let output = self.executor.run("lspci", &["-k".to_string()]).await?;
        if !output.success() {
            return Ok(Ownership::Unknown);
        }
        Ok(infer_owner_from_bindings(&output.stdout))
    }

    async fn resolve_address(
        &self,
        explicit: Option<BusAddress>,
    ) -> Result<BusAddress, ArbiterError> {
        if let Some(address) = explicit {
            return Ok(address);
        }
        if let Some(address) = self.store.load()?.gpu_address {
            return Ok(address);
        }
        // Last resort: scan the bus for the first display-class device.
        let output = self
            .executor
            .run("lspci", &["-nn".to_string()])
            .await?;
        if !output.success() {
            return Err(ArbiterError::NoGpuFound);
        }
        output
            .stdout
            .lines()
            .filter_map(parse_lspci_line)
            .find(|device| device.class.is_display())
            .map(|device| device.address)
            .ok_or(ArbiterError::NoGpuFound)
    }
}

fn module_args(modules: &[&str]) -> Vec<String> {
    modules.iter().map(|m| m.to_string()).collect()
}

fn verbose_module_args(modules: &[&str]) -> Vec<String> {
    let mut args = vec!["-v".to_string()];
    args.extend(modules.iter().map(|m| m.to_string()));
    args
}

fn nodedev_args(action: &str, nodedev: &str) -> Vec<String> {
    vec![
        "-c".to_string(),
        LIBVIRT_URI.to_string(),
        action.to_string(),
        nodedev.to_string(),
    ]
}

/// Walk `lspci -k` output: device headers are unindented, their properties
/// indented below. Guest iff a VGA/3D device reports vfio-pci as the driver
/// in use.
fn infer_owner_from_bindings(output: &str) -> Ownership {
    let mut in_display_device = false;
    let mut saw_display_device = false;
    for line in output.lines() {
        let indented = line.starts_with(' ') || line.starts_with('\t');
        if !indented {
            in_display_device =
                line.contains("VGA compatible controller") || line.contains("3D controller");
            saw_display_device |= in_display_device;
            continue;
        }
        if in_display_device {
            if let Some(driver) = line.trim().strip_prefix("Kernel driver in use:") {
                if driver.trim() == "vfio-pci" {
                    return Ownership::Guest;
                }
            }
        }
    }
    if saw_display_device {
        Ownership::Host
    } else {
        Ownership::Unknown
    }
}
