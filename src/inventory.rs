//! # Hardware inventory reader
//!
//! Parses raw bus-enumeration output into typed records: PCI devices from
//! `lspci -nn`, USB devices from `lsusb`, the logical CPU count from `nproc`,
//! and the installer images available on disk. The inventory is ephemeral and
//! re-read on demand; lines that do not match the expected shape are skipped
//! rather than failing the whole enumeration, since `lspci` output routinely
//! contains devices this crate does not care about.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::address::BusAddress;
use crate::executor::{Execute, ExecuteError};

#[derive(thiserror::Error, Debug)]
pub enum InventoryError {
    #[error(transparent)]
    Execute(#[from] ExecuteError),
    #[error("Could not parse enumeration output: {0}")]
    Parse(String),
    #[error("Could not read image directory {0}: {1}")]
    ImageDir(PathBuf, String),
}

/// Coarse PCI device class, derived from the `lspci` class description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Vga,
    ThreeD,
    Audio,
    Other,
}

impl DeviceClass {
    /// Display-class devices are candidates for GPU passthrough.
    pub fn is_display(&self) -> bool {
        matches!(self, DeviceClass::Vga | DeviceClass::ThreeD)
    }

    fn from_description(description: &str) -> DeviceClass {
        if description.contains("VGA") {
            DeviceClass::Vga
        } else if description.contains("3D") {
            DeviceClass::ThreeD
        } else if description.contains("Audio") {
            DeviceClass::Audio
        } else {
            DeviceClass::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PciDevice {
    pub address: BusAddress,
    pub name: String,
    /// The bracketed `vvvv:dddd` vendor/device pair from `lspci -nn`.
    pub vendor_device: String,
    pub class: DeviceClass,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsbDevice {
    pub bus: String,
    pub device: String,
    pub vendor_id: String,
    pub product_id: String,
    pub name: String,
}

/// Reads hardware inventories through the command executor.
#[derive(Debug)]
pub struct InventoryReader<E> {
    executor: E,
    image_dir: PathBuf,
}

impl<E: Execute> InventoryReader<E> {
    pub fn new(executor: E, image_dir: PathBuf) -> InventoryReader<E> {
        InventoryReader {
            executor,
            image_dir,
        }
    }

    /// All PCI devices visible on the bus.
    pub async fn pci_devices(&self) -> Result<Vec<PciDevice>, InventoryError> {
        let output = self
            .executor
            .run("lspci", &["-nn".to_string()])
            .await?
            .require_success("lspci -nn")?;
        let devices: Vec<PciDevice> = output.stdout.lines().filter_map(parse_lspci_line).collect();
        debug!("Enumerated {} PCI devices", devices.len());
        Ok(devices)
    }

    /// PCI devices a passthrough setup cares about: displays and their audio
    /// functions.
    pub async fn display_devices(&self) -> Result<Vec<PciDevice>, InventoryError> {
        let devices = self.pci_devices().await?;
        Ok(devices
            .into_iter()
            .filter(|d| d.class.is_display() || d.class == DeviceClass::Audio)
            .collect())
    }

    pub async fn usb_devices(&self) -> Result<Vec<UsbDevice>, InventoryError> {
        let output = self
            .executor
            .run("lsusb", &[])
            .await?
            .require_success("lsusb")?;
        Ok(output.stdout.lines().filter_map(parse_lsusb_line).collect())
    }

    pub async fn logical_cpus(&self) -> Result<u32, InventoryError> {
        let output = self
            .executor
            .run("nproc", &[])
            .await?
            .require_success("nproc")?;
        output
            .stdout
            .trim()
            .parse()
            .map_err(|_| InventoryError::Parse(format!("nproc returned '{}'", output.stdout.trim())))
    }

    /// Names of the `.iso` images available in the configured image directory.
    /// A missing directory reads as no images, matching a host that has not
    /// been provisioned yet.
    pub fn installer_images(&self) -> Result<Vec<String>, InventoryError> {
        if !self.image_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.image_dir)
            .map_err(|e| InventoryError::ImageDir(self.image_dir.clone(), e.to_string()))?;
        let mut images: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| Path::new(name).extension().is_some_and(|ext| ext == "iso"))
            .collect();
        images.sort();
        Ok(images)
    }
}

/// Parse one `lspci -nn` line, e.g.
/// `01:00.0 VGA compatible controller [0300]: NVIDIA Corporation GA104 [10de:2484] (rev a1)`
pub(crate) fn parse_lspci_line(line: &str) -> Option<PciDevice> {
    let (address_text, rest) = line.split_once(' ')?;
    let address: BusAddress = address_text.parse().ok()?;
    let (class_description, device_text) = rest.split_once(": ")?;

    // The vendor/device pair is the last bracketed `vvvv:dddd` token.
    let vendor_device = device_text
        .rmatch_indices('[')
        .find_map(|(start, _)| {
            let candidate = &device_text[start + 1..];
            let end = candidate.find(']')?;
            let inner = &candidate[..end];
            is_id_pair(inner).then(|| inner.to_string())
        })?;

    let name_end = device_text.find(&format!("[{vendor_device}]"))?;
    let name = device_text[..name_end].trim().to_string();

    Some(PciDevice {
        address,
        name,
        vendor_device,
        class: DeviceClass::from_description(class_description),
    })
}

fn is_id_pair(text: &str) -> bool {
    match text.split_once(':') {
        Some((vendor, device)) => {
            vendor.len() == 4
                && device.len() == 4
                && vendor.chars().all(|c| c.is_ascii_hexdigit())
                && device.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}

/// Parse one `lsusb` line, e.g.
/// `Bus 001 Device 004: ID 046d:c52b Logitech, Inc. Unifying Receiver`
fn parse_lsusb_line(line: &str) -> Option<UsbDevice> {
    let mut parts = line.split_whitespace();
    if parts.next()? != "Bus" {
        return None;
    }
    let bus = parts.next()?.to_string();
    if parts.next()? != "Device" {
        return None;
    }
    let device = parts.next()?.trim_end_matches(':').to_string();
    if parts.next()? != "ID" {
        return None;
    }
    let id = parts.next()?;
    if !is_id_pair(id) {
        return None;
    }
    let (vendor_id, product_id) = id.split_once(':')?;
    let name = parts.collect::<Vec<_>>().join(" ");

    Some(UsbDevice {
        bus,
        device,
        vendor_id: vendor_id.to_string(),
        product_id: product_id.to_string(),
        name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::fake::FakeExecutor;

    const LSPCI_NN: &str = "\
00:00.0 Host bridge [0600]: Advanced Micro Devices, Inc. [AMD] Starship/Matisse Root Complex [1022:1480]
01:00.0 VGA compatible controller [0300]: NVIDIA Corporation GA104 [GeForce RTX 3070] [10de:2484] (rev a1)
01:00.1 Audio device [0403]: NVIDIA Corporation GA104 High Definition Audio Controller [10de:228b] (rev a1)
0a:00.0 3D controller [0302]: NVIDIA Corporation GP107M [GeForce GTX 1050 Mobile] [10de:1c8d] (rev a1)
garbage line without an address";

    const LSUSB: &str = "\
Bus 001 Device 004: ID 046d:c52b Logitech, Inc. Unifying Receiver
Bus 003 Device 002: ID 8087:0029 Intel Corp. AX200 Bluetooth
not a usb line";

    #[test]
    fn parses_lspci_display_and_audio_lines() {
        let gpu = parse_lspci_line(
            "01:00.0 VGA compatible controller [0300]: NVIDIA Corporation GA104 [GeForce RTX 3070] [10de:2484] (rev a1)",
        )
        .unwrap();
        assert_eq!(gpu.address, "01:00.0".parse().unwrap());
        assert_eq!(gpu.class, DeviceClass::Vga);
        assert_eq!(gpu.vendor_device, "10de:2484");
        assert_eq!(gpu.name, "NVIDIA Corporation GA104 [GeForce RTX 3070]");

        let audio = parse_lspci_line(
            "01:00.1 Audio device [0403]: NVIDIA Corporation GA104 High Definition Audio Controller [10de:228b] (rev a1)",
        )
        .unwrap();
        assert_eq!(audio.class, DeviceClass::Audio);
        assert_eq!(audio.address, "01:00.1".parse().unwrap());
    }

    #[test]
    fn skips_unparsable_lspci_lines() {
        assert!(parse_lspci_line("garbage line without an address").is_none());
        assert!(parse_lspci_line("").is_none());
    }

    #[test]
    fn parses_lsusb_line() {
        let dev =
            parse_lsusb_line("Bus 001 Device 004: ID 046d:c52b Logitech, Inc. Unifying Receiver")
                .unwrap();
        assert_eq!(dev.bus, "001");
        assert_eq!(dev.device, "004");
        assert_eq!(dev.vendor_id, "046d");
        assert_eq!(dev.product_id, "c52b");
        assert_eq!(dev.name, "Logitech, Inc. Unifying Receiver");
    }

    #[tokio::test]
    async fn enumerates_pci_devices_skipping_noise() {
        let executor = FakeExecutor::new(vec![FakeExecutor::ok(LSPCI_NN)]);
        let reader = InventoryReader::new(executor, PathBuf::from("/nonexistent"));
        let devices = reader.pci_devices().await.unwrap();
        assert_eq!(devices.len(), 4);
        assert_eq!(devices[1].class, DeviceClass::Vga);
        assert_eq!(devices[3].class, DeviceClass::ThreeD);
        assert_eq!(devices[3].address, "0a:00.0".parse().unwrap());
    }

    #[tokio::test]
    async fn display_devices_filters_to_passthrough_candidates() {
        let executor = FakeExecutor::new(vec![FakeExecutor::ok(LSPCI_NN)]);
        let reader = InventoryReader::new(executor, PathBuf::from("/nonexistent"));
        let devices = reader.display_devices().await.unwrap();
        let classes: Vec<DeviceClass> = devices.iter().map(|d| d.class).collect();
        assert_eq!(
            classes,
            vec![DeviceClass::Vga, DeviceClass::Audio, DeviceClass::ThreeD]
        );
    }

    #[tokio::test]
    async fn enumerates_usb_devices() {
        let executor = FakeExecutor::new(vec![FakeExecutor::ok(LSUSB)]);
        let reader = InventoryReader::new(executor, PathBuf::from("/nonexistent"));
        let devices = reader.usb_devices().await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].vendor_id, "8087");
    }

    #[tokio::test]
    async fn reads_logical_cpu_count() {
        let executor = FakeExecutor::new(vec![FakeExecutor::ok("16\n")]);
        let reader = InventoryReader::new(executor, PathBuf::from("/nonexistent"));
        assert_eq!(reader.logical_cpus().await.unwrap(), 16);
    }

    #[tokio::test]
    async fn unparsable_cpu_count_is_an_error() {
        let executor = FakeExecutor::new(vec![FakeExecutor::ok("???")]);
        let reader = InventoryReader::new(executor, PathBuf::from("/nonexistent"));
        assert!(matches!(
            reader.logical_cpus().await,
            Err(InventoryError::Parse(_))
        ));
    }

    #[test]
    fn lists_iso_images_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("virtio-win.iso"), b"").unwrap();
        std::fs::write(dir.path().join("Win11.iso"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();
        let executor = FakeExecutor::new(vec![]);
        let reader = InventoryReader::new(executor, dir.path().to_path_buf());
        assert_eq!(
            reader.installer_images().unwrap(),
            vec!["Win11.iso".to_string(), "virtio-win.iso".to_string()]
        );
    }

    #[test]
    fn missing_image_dir_reads_as_empty() {
        let executor = FakeExecutor::new(vec![]);
        let reader = InventoryReader::new(executor, PathBuf::from("/definitely/not/here"));
        assert_eq!(reader.installer_images().unwrap(), Vec::<String>::new());
    }
}
