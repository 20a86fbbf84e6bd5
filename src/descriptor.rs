//! # Domain descriptor synthesis
//!
//! [synthesize] is the pure core of the crate: it turns an operator-chosen
//! [DomainConfig] into a [DomainDescriptor], a complete hardware description
//! for the guest. No I/O happens here; the only failure mode is a constraint
//! violation, so a [ConfigurationError] never leaves partial side effects.
//!
//! The descriptor serializes to the libvirt domain XML through
//! [DomainDescriptor::to_xml]. Memory is expressed in KiB, PCI addresses as
//! hex `domain`/`bus`/`slot`/`function` attributes, and the pin table carries
//! one element per vcpu index.

use std::fmt::Write as _;

use crate::address::BusAddress;
use crate::inventory::UsbDevice;

/// Directory holding the guest disk images.
pub const IMAGE_DIR: &str = "/var/lib/libvirt/images";
/// Directory holding installer and driver images.
pub const ESSENTIALS_DIR: &str = "/var/lib/libvirt/images/fusionpilot-essentials";

const NVRAM_DIR: &str = "/var/lib/libvirt/qemu/nvram";
const OVMF_CODE: &str = "/usr/share/edk2/x64/OVMF_CODE.secboot.4m.fd";
const OVMF_VARS: &str = "/usr/share/edk2/x64/OVMF_VARS.4m.fd";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("host thread reservation {host} is out of range for {total} total threads (need 1 <= host < total)")]
    ThreadRange { total: u32, host: u32 },
    #[error("only {available} guest thread(s) remain, a paired-thread guest needs at least 2")]
    NotEnoughGuestThreads { available: u32 },
    #[error("GPU and companion audio function must be selected together or declined together")]
    PartialPassthrough,
    #[error("PCI address {0} is listed in more than one passthrough entry")]
    DuplicateHostdev(BusAddress),
}

/// Shared-memory video buffer tier, keyed by the guest resolution the
/// operator intends to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionTier {
    FullHd,
    Qhd,
    UltraHd,
}

impl ResolutionTier {
    pub fn shmem_size_mib(&self) -> u32 {
        match self {
            ResolutionTier::FullHd => 32,
            ResolutionTier::Qhd => 64,
            ResolutionTier::UltraHd => 128,
        }
    }

    /// Map a user-facing label onto a tier. An unrecognized label falls back
    /// to the smallest buffer: this is a quality setting, not a correctness
    /// one, so it must not fail the synthesis.
    pub fn from_label(label: &str) -> ResolutionTier {
        match label {
            "1080p" => ResolutionTier::FullHd,
            "1440p" => ResolutionTier::Qhd,
            "4K" | "2160p" => ResolutionTier::UltraHd,
            other => {
                log::warn!("Unknown resolution tier '{other}', using the 1080p buffer size");
                ResolutionTier::FullHd
            }
        }
    }
}

/// USB device identity for passthrough, as vendor/product hex ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbIdentity {
    pub vendor_id: String,
    pub product_id: String,
}

impl From<&UsbDevice> for UsbIdentity {
    fn from(device: &UsbDevice) -> UsbIdentity {
        UsbIdentity {
            vendor_id: device.vendor_id.clone(),
            product_id: device.product_id.clone(),
        }
    }
}

/// Operator-chosen synthesis input, immutable once built
/// (see [DomainConfigBuilder](crate::builder::domain::DomainConfigBuilder)).
///
/// The host keeps the contiguous low range `[0, host_threads)`; every other
/// logical CPU belongs exclusively to the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainConfig {
    pub name: String,
    pub memory_gb: u64,
    pub total_threads: u32,
    pub host_threads: u32,
    pub gpu_address: Option<BusAddress>,
    pub audio_address: Option<BusAddress>,
    pub usb_devices: Vec<UsbIdentity>,
    pub disk_size_gb: u64,
    pub stealth_mode: bool,
    pub remove_hypervisor_feature: bool,
    pub paired_threads: bool,
    pub video_channel: Option<ResolutionTier>,
    pub audio_channel: bool,
    pub installer_image: String,
    pub driver_image: Option<String>,
}

/// One vcpu-to-physical-CPU pin entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VcpuPin {
    pub vcpu: u32,
    pub host_cpu: u32,
}

/// A shared-memory region exposed to both host and guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShmemChannel {
    pub name: String,
    pub size_mib: u32,
}

/// The synthesized hardware description.
///
/// Invariants held by construction: every vcpu index in `[0, vcpus)` has
/// exactly one pin entry, pin targets cover the guest-exclusive CPU range
/// bijectively, and each PCI address appears in at most one hostdev entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDescriptor {
    pub name: String,
    pub memory_kib: u64,
    pub vcpus: u32,
    pub vcpu_pins: Vec<VcpuPin>,
    pub emulator_cpuset: String,
    pub topology_cores: u32,
    pub topology_threads: u32,
    pub pci_hostdevs: Vec<BusAddress>,
    pub usb_hostdevs: Vec<UsbIdentity>,
    pub shmem_channels: Vec<ShmemChannel>,
    pub stealth_mode: bool,
    pub remove_hypervisor_feature: bool,
    pub disk_path: String,
    pub installer_path: String,
    pub driver_path: Option<String>,
    /// Human-readable notes about adjustments made during synthesis, e.g. an
    /// odd guest thread count rounded down for the paired topology.
    pub warnings: Vec<String>,
}

/// Compute a descriptor from the configuration.
///
/// Pure and deterministic; fails only on constraint violation.
pub fn synthesize(config: &DomainConfig) -> Result<DomainDescriptor, ConfigurationError> {
    if config.host_threads < 1 || config.host_threads >= config.total_threads {
        return Err(ConfigurationError::ThreadRange {
            total: config.total_threads,
            host: config.host_threads,
        });
    }

    let mut warnings = Vec::new();
    let mut vcpus = config.total_threads - config.host_threads;
    if config.paired_threads {
        if vcpus % 2 != 0 {
            // Silent truncation would corrupt the pin table expectation, so
            // the adjustment is surfaced on the descriptor.
            warnings.push(format!(
                "guest thread count {} is odd, rounded down to {} for the paired-thread topology; \
                 physical CPU {} stays unused",
                vcpus,
                vcpus - 1,
                config.total_threads - 1
            ));
            vcpus -= 1;
        }
        if vcpus < 2 {
            return Err(ConfigurationError::NotEnoughGuestThreads {
                available: config.total_threads - config.host_threads,
            });
        }
    }

    let vcpu_pins: Vec<VcpuPin> = (0..vcpus)
        .map(|i| VcpuPin {
            vcpu: i,
            host_cpu: i + config.host_threads,
        })
        .collect();

    let pci_hostdevs = match (config.gpu_address, config.audio_address) {
        (Some(gpu), Some(audio)) => {
            if gpu == audio {
                return Err(ConfigurationError::DuplicateHostdev(gpu));
            }
            vec![gpu, audio]
        }
        (None, None) => Vec::new(),
        // A lone GPU or a lone audio function is a common source of guest
        // driver failure; reject it instead of silently emitting one entry.
        _ => return Err(ConfigurationError::PartialPassthrough),
    };

    let mut shmem_channels = Vec::new();
    if let Some(tier) = config.video_channel {
        shmem_channels.push(ShmemChannel {
            name: "looking-glass".to_string(),
            size_mib: tier.shmem_size_mib(),
        });
    }
    if config.audio_channel {
        shmem_channels.push(ShmemChannel {
            name: "scream-ivshmem".to_string(),
            size_mib: 2,
        });
    }

    let topology_threads = if config.paired_threads { 2 } else { 1 };

    Ok(DomainDescriptor {
        name: config.name.clone(),
        memory_kib: config.memory_gb * 1024 * 1024,
        vcpus,
        vcpu_pins,
        emulator_cpuset: cpuset_range(config.host_threads),
        topology_cores: vcpus / topology_threads,
        topology_threads,
        pci_hostdevs,
        usb_hostdevs: config.usb_devices.clone(),
        shmem_channels,
        stealth_mode: config.stealth_mode,
        remove_hypervisor_feature: config.remove_hypervisor_feature,
        disk_path: format!("{IMAGE_DIR}/{}.qcow2", config.name),
        installer_path: format!("{ESSENTIALS_DIR}/{}", config.installer_image),
        driver_path: config
            .driver_image
            .as_ref()
            .map(|image| format!("{ESSENTIALS_DIR}/{image}")),
        warnings,
    })
}

/// Range expression for the reserved host CPUs, `0` for a single thread.
fn cpuset_range(threads: u32) -> String {
    if threads > 1 {
        format!("0-{}", threads - 1)
    } else {
        "0".to_string()
    }
}

impl DomainDescriptor {
    /// Serialize to the libvirt domain XML document.
    pub fn to_xml(&self) -> String {
        let mut xml = String::new();
        let w = &mut xml;

        let _ = writeln!(w, "<domain type=\"kvm\">");
        let _ = writeln!(w, "  <name>{}</name>", self.name);
        let _ = writeln!(w, "  <metadata>");
        let _ = writeln!(
            w,
            "    <libosinfo:libosinfo xmlns:libosinfo=\"http://libosinfo.org/xmlns/libvirt/domain/1.0\">"
        );
        let _ = writeln!(w, "      <libosinfo:os id=\"http://microsoft.com/win/11\"/>");
        let _ = writeln!(w, "    </libosinfo:libosinfo>");
        let _ = writeln!(w, "  </metadata>");
        let _ = writeln!(w, "  <memory unit=\"KiB\">{}</memory>", self.memory_kib);
        let _ = writeln!(
            w,
            "  <currentMemory unit=\"KiB\">{}</currentMemory>",
            self.memory_kib
        );
        let _ = writeln!(w, "  <vcpu placement=\"static\">{}</vcpu>", self.vcpus);
        let _ = writeln!(w, "  <iothreads>1</iothreads>");

        let _ = writeln!(w, "  <cputune>");
        for pin in &self.vcpu_pins {
            let _ = writeln!(
                w,
                "    <vcpupin vcpu=\"{}\" cpuset=\"{}\"/>",
                pin.vcpu, pin.host_cpu
            );
        }
        let _ = writeln!(w, "    <emulatorpin cpuset=\"{}\"/>", self.emulator_cpuset);
        let _ = writeln!(
            w,
            "    <iothreadpin iothread=\"1\" cpuset=\"{}\"/>",
            self.emulator_cpuset
        );
        let _ = writeln!(w, "    <emulatorsched scheduler=\"fifo\" priority=\"1\"/>");
        for pin in &self.vcpu_pins {
            let _ = writeln!(
                w,
                "    <vcpusched vcpus=\"{}\" scheduler=\"fifo\" priority=\"1\"/>",
                pin.vcpu
            );
        }
        let _ = writeln!(w, "  </cputune>");

        let _ = writeln!(w, "  <os firmware=\"efi\">");
        if self.stealth_mode {
            let _ = writeln!(w, "    <smbios mode=\"sysinfo\"/>");
        }
        let _ = writeln!(
            w,
            "    <type arch=\"x86_64\" machine=\"pc-q35-10.1\">hvm</type>"
        );
        let _ = writeln!(
            w,
            "    <loader readonly=\"yes\" secure=\"yes\" type=\"pflash\" format=\"raw\">{OVMF_CODE}</loader>"
        );
        let _ = writeln!(
            w,
            "    <nvram template=\"{OVMF_VARS}\" templateFormat=\"raw\" format=\"raw\">{NVRAM_DIR}/{}_VARS.fd</nvram>",
            self.name
        );
        let _ = writeln!(w, "    <boot dev=\"hd\"/>");
        let _ = writeln!(w, "  </os>");

        let _ = writeln!(w, "  <features>");
        let _ = writeln!(w, "    <acpi/>");
        let _ = writeln!(w, "    <apic/>");
        let _ = writeln!(w, "    <hyperv mode=\"custom\">");
        let _ = writeln!(w, "      <relaxed state=\"on\"/>");
        let _ = writeln!(w, "      <vapic state=\"on\"/>");
        let _ = writeln!(w, "      <spinlocks state=\"on\" retries=\"8191\"/>");
        let _ = writeln!(w, "      <vpindex state=\"on\"/>");
        let _ = writeln!(w, "      <runtime state=\"on\"/>");
        let _ = writeln!(w, "      <synic state=\"on\"/>");
        let _ = writeln!(w, "      <stimer state=\"on\"/>");
        let _ = writeln!(w, "      <tlbflush state=\"on\"/>");
        let _ = writeln!(w, "      <ipi state=\"on\"/>");
        let _ = writeln!(w, "      <avic state=\"on\"/>");
        let _ = writeln!(w, "    </hyperv>");
        let _ = writeln!(w, "    <kvm>");
        let _ = writeln!(
            w,
            "      <hidden state=\"{}\"/>",
            if self.stealth_mode { "on" } else { "off" }
        );
        let _ = writeln!(w, "      <hint-dedicated state=\"on\"/>");
        let _ = writeln!(w, "    </kvm>");
        let _ = writeln!(w, "    <vmport state=\"off\"/>");
        let _ = writeln!(w, "    <smm state=\"on\"/>");
        let _ = writeln!(w, "  </features>");

        let _ = writeln!(
            w,
            "  <cpu mode=\"host-passthrough\" check=\"none\" migratable=\"on\">"
        );
        let _ = writeln!(
            w,
            "    <topology sockets=\"1\" dies=\"1\" clusters=\"1\" cores=\"{}\" threads=\"{}\"/>",
            self.topology_cores, self.topology_threads
        );
        let _ = writeln!(w, "    <cache mode=\"passthrough\"/>");
        if self.remove_hypervisor_feature {
            let _ = writeln!(w, "    <feature policy=\"disable\" name=\"hypervisor\"/>");
        }
        let _ = writeln!(w, "    <feature policy=\"require\" name=\"topoext\"/>");
        let _ = writeln!(w, "  </cpu>");

        let _ = writeln!(w, "  <clock offset=\"localtime\">");
        let _ = writeln!(w, "    <timer name=\"rtc\" tickpolicy=\"catchup\"/>");
        let _ = writeln!(w, "    <timer name=\"pit\" tickpolicy=\"delay\"/>");
        let _ = writeln!(w, "    <timer name=\"hpet\" present=\"no\"/>");
        let _ = writeln!(w, "    <timer name=\"hypervclock\" present=\"yes\"/>");
        let _ = writeln!(w, "    <timer name=\"tsc\" present=\"yes\" mode=\"native\"/>");
        let _ = writeln!(w, "  </clock>");
        let _ = writeln!(w, "  <pm>");
        let _ = writeln!(w, "    <suspend-to-mem enabled=\"no\"/>");
        let _ = writeln!(w, "    <suspend-to-disk enabled=\"no\"/>");
        let _ = writeln!(w, "  </pm>");

        if self.stealth_mode {
            let _ = writeln!(w, "  <sysinfo type=\"smbios\">");
            let _ = writeln!(w, "    <baseBoard>");
            let _ = writeln!(
                w,
                "      <entry name=\"manufacturer\">ASUSTeK COMPUTER INC.</entry>"
            );
            let _ = writeln!(
                w,
                "      <entry name=\"product\">ROG STRIX X570-E GAMING</entry>"
            );
            let _ = writeln!(w, "    </baseBoard>");
            let _ = writeln!(w, "    <system>");
            let _ = writeln!(
                w,
                "      <entry name=\"manufacturer\">ASUSTeK COMPUTER INC.</entry>"
            );
            let _ = writeln!(
                w,
                "      <entry name=\"product\">ROG STRIX X570-E GAMING</entry>"
            );
            let _ = writeln!(w, "    </system>");
            let _ = writeln!(w, "  </sysinfo>");
        }

        let _ = writeln!(w, "  <devices>");
        let _ = writeln!(w, "    <emulator>/usr/bin/qemu-system-x86_64</emulator>");
        let _ = writeln!(w, "    <disk type=\"file\" device=\"disk\">");
        let _ = writeln!(
            w,
            "      <driver name=\"qemu\" type=\"qcow2\" cache=\"none\" io=\"native\" discard=\"unmap\"/>"
        );
        let _ = writeln!(w, "      <source file=\"{}\"/>", self.disk_path);
        let _ = writeln!(w, "      <target dev=\"vda\" bus=\"virtio\"/>");
        let _ = writeln!(w, "    </disk>");
        let _ = writeln!(w, "    <disk type=\"file\" device=\"cdrom\">");
        let _ = writeln!(w, "      <driver name=\"qemu\" type=\"raw\"/>");
        let _ = writeln!(w, "      <source file=\"{}\"/>", self.installer_path);
        let _ = writeln!(w, "      <target dev=\"sdb\" bus=\"sata\"/>");
        let _ = writeln!(w, "      <readonly/>");
        let _ = writeln!(w, "    </disk>");
        if let Some(driver_path) = &self.driver_path {
            let _ = writeln!(w, "    <disk type=\"file\" device=\"cdrom\">");
            let _ = writeln!(w, "      <driver name=\"qemu\" type=\"raw\"/>");
            let _ = writeln!(w, "      <source file=\"{driver_path}\"/>");
            let _ = writeln!(w, "      <target dev=\"sdc\" bus=\"sata\"/>");
            let _ = writeln!(w, "      <readonly/>");
            let _ = writeln!(w, "    </disk>");
        }
        let _ = writeln!(
            w,
            "    <controller type=\"usb\" index=\"0\" model=\"qemu-xhci\" ports=\"15\"/>"
        );
        let _ = writeln!(w, "    <interface type=\"network\">");
        let _ = writeln!(w, "      <source network=\"default\"/>");
        let _ = writeln!(w, "      <model type=\"virtio\"/>");
        let _ = writeln!(w, "      <driver queues=\"8\"/>");
        let _ = writeln!(w, "    </interface>");
        let _ = writeln!(w, "    <tpm model=\"tpm-crb\">");
        let _ = writeln!(w, "      <backend type=\"emulator\" version=\"2.0\"/>");
        let _ = writeln!(w, "    </tpm>");
        let _ = writeln!(w, "    <graphics type=\"spice\" autoport=\"yes\">");
        let _ = writeln!(w, "      <listen type=\"address\"/>");
        let _ = writeln!(w, "      <image compression=\"off\"/>");
        let _ = writeln!(w, "    </graphics>");
        let _ = writeln!(w, "    <audio id=\"1\" type=\"spice\"/>");
        let _ = writeln!(w, "    <video>");
        let _ = writeln!(
            w,
            "      <model type=\"qxl\" ram=\"65536\" vram=\"65536\" vgamem=\"16384\" heads=\"1\" primary=\"yes\"/>"
        );
        let _ = writeln!(w, "    </video>");

        for usb in &self.usb_hostdevs {
            let _ = writeln!(
                w,
                "    <hostdev mode=\"subsystem\" type=\"usb\" managed=\"yes\">"
            );
            let _ = writeln!(w, "      <source>");
            let _ = writeln!(w, "        <vendor id=\"0x{}\"/>", usb.vendor_id);
            let _ = writeln!(w, "        <product id=\"0x{}\"/>", usb.product_id);
            let _ = writeln!(w, "      </source>");
            let _ = writeln!(w, "    </hostdev>");
        }

        for address in &self.pci_hostdevs {
            let (bus, slot, function) = address.xml_attributes();
            let _ = writeln!(
                w,
                "    <hostdev mode=\"subsystem\" type=\"pci\" managed=\"yes\">"
            );
            let _ = writeln!(w, "      <driver name=\"vfio\"/>");
            let _ = writeln!(w, "      <source>");
            let _ = writeln!(
                w,
                "        <address domain=\"0x0000\" bus=\"{bus}\" slot=\"{slot}\" function=\"{function}\"/>"
            );
            let _ = writeln!(w, "      </source>");
            let _ = writeln!(w, "    </hostdev>");
        }

        for channel in &self.shmem_channels {
            let _ = writeln!(w, "    <shmem name=\"{}\">", channel.name);
            let _ = writeln!(w, "      <model type=\"ivshmem-plain\"/>");
            let _ = writeln!(w, "      <size unit=\"M\">{}</size>", channel.size_mib);
            let _ = writeln!(w, "    </shmem>");
        }

        let _ = writeln!(w, "  </devices>");
        let _ = writeln!(w, "</domain>");
        xml
    }
}
