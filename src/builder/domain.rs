use crate::address::BusAddress;
use crate::builder::{assert_not_none, Builder, BuilderError};
use crate::descriptor::{DomainConfig, ResolutionTier, UsbIdentity};

/// Builder for [DomainConfig], the synthesis input.
///
/// Name, memory, thread split, disk size and the installer image are
/// required; everything else defaults to off. Guest threads are paired
/// (two hardware threads per core) unless disabled with
/// [`without_paired_threads`](Self::without_paired_threads).
#[derive(Debug)]
pub struct DomainConfigBuilder {
    name: String,
    memory_gb: Option<u64>,
    total_threads: Option<u32>,
    host_threads: Option<u32>,
    gpu_address: Option<BusAddress>,
    audio_address: Option<BusAddress>,
    usb_devices: Vec<UsbIdentity>,
    disk_size_gb: Option<u64>,
    stealth_mode: bool,
    remove_hypervisor_feature: bool,
    paired_threads: bool,
    video_channel: Option<ResolutionTier>,
    audio_channel: bool,
    installer_image: Option<String>,
    driver_image: Option<String>,
}

impl DomainConfigBuilder {
    pub fn new(name: String) -> DomainConfigBuilder {
        DomainConfigBuilder {
            name,
            memory_gb: None,
            total_threads: None,
            host_threads: None,
            gpu_address: None,
            audio_address: None,
            usb_devices: Vec::new(),
            disk_size_gb: None,
            stealth_mode: false,
            remove_hypervisor_feature: false,
            paired_threads: true,
            video_channel: None,
            audio_channel: false,
            installer_image: None,
            driver_image: None,
        }
    }

    pub fn with_memory_gb(mut self, memory_gb: u64) -> DomainConfigBuilder {
        self.memory_gb = Some(memory_gb);
        self
    }

    /// Total logical CPUs on the machine and how many stay reserved for the
    /// host. The guest receives everything above the host range.
    pub fn with_threads(mut self, total: u32, host: u32) -> DomainConfigBuilder {
        self.total_threads = Some(total);
        self.host_threads = Some(host);
        self
    }

    pub fn with_gpu(mut self, address: BusAddress) -> DomainConfigBuilder {
        self.gpu_address = Some(address);
        self
    }

    /// The GPU's companion audio function. Synthesis requires it together
    /// with the GPU address or not at all.
    pub fn with_gpu_audio(mut self, address: BusAddress) -> DomainConfigBuilder {
        self.audio_address = Some(address);
        self
    }

    pub fn with_usb_device(mut self, device: UsbIdentity) -> DomainConfigBuilder {
        self.usb_devices.push(device);
        self
    }

    pub fn with_disk_size_gb(mut self, disk_size_gb: u64) -> DomainConfigBuilder {
        self.disk_size_gb = Some(disk_size_gb);
        self
    }

    /// Hide the hypervisor from the guest: KVM hidden state plus SMBIOS
    /// host-board identity.
    pub fn with_stealth_mode(mut self) -> DomainConfigBuilder {
        self.stealth_mode = true;
        self
    }

    /// Drop the `hypervisor` CPUID feature entirely. Legal together with
    /// stealth mode; combining both removes the paravirtual timer
    /// cooperation and costs guest timekeeping precision.
    pub fn with_hypervisor_feature_removed(mut self) -> DomainConfigBuilder {
        self.remove_hypervisor_feature = true;
        self
    }

    /// Expose guest CPUs as single-threaded cores instead of paired threads.
    pub fn without_paired_threads(mut self) -> DomainConfigBuilder {
        self.paired_threads = false;
        self
    }

    /// Enable the shared-memory video channel sized for the given tier.
    pub fn with_video_channel(mut self, tier: ResolutionTier) -> DomainConfigBuilder {
        self.video_channel = Some(tier);
        self
    }

    /// Enable the shared-memory audio channel.
    pub fn with_audio_channel(mut self) -> DomainConfigBuilder {
        self.audio_channel = true;
        self
    }

    pub fn with_installer_image(mut self, image: String) -> DomainConfigBuilder {
        self.installer_image = Some(image);
        self
    }

    /// Optional paravirtual driver image attached as a second cdrom.
    pub fn with_driver_image(mut self, image: String) -> DomainConfigBuilder {
        self.driver_image = Some(image);
        self
    }
}

impl Builder<DomainConfig> for DomainConfigBuilder {
    fn try_build(self) -> Result<DomainConfig, BuilderError> {
        assert_not_none(stringify!(self.memory_gb), &self.memory_gb)?;
        assert_not_none(stringify!(self.total_threads), &self.total_threads)?;
        assert_not_none(stringify!(self.host_threads), &self.host_threads)?;
        assert_not_none(stringify!(self.disk_size_gb), &self.disk_size_gb)?;
        assert_not_none(stringify!(self.installer_image), &self.installer_image)?;
        Ok(DomainConfig {
            name: self.name,
            memory_gb: self.memory_gb.unwrap(),
            total_threads: self.total_threads.unwrap(),
            host_threads: self.host_threads.unwrap(),
            gpu_address: self.gpu_address,
            audio_address: self.audio_address,
            usb_devices: self.usb_devices,
            disk_size_gb: self.disk_size_gb.unwrap(),
            stealth_mode: self.stealth_mode,
            remove_hypervisor_feature: self.remove_hypervisor_feature,
            paired_threads: self.paired_threads,
            video_channel: self.video_channel,
            audio_channel: self.audio_channel,
            installer_image: self.installer_image.unwrap(),
            driver_image: self.driver_image,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> DomainConfigBuilder {
        DomainConfigBuilder::new("win11".to_string())
            .with_memory_gb(16)
            .with_threads(16, 2)
            .with_disk_size_gb(256)
            .with_installer_image("Win11_25H2_x64.iso".to_string())
    }

    #[test]
    fn full_config() {
        let config = minimal()
            .with_gpu("01:00.0".parse().unwrap())
            .with_gpu_audio("01:00.1".parse().unwrap())
            .with_video_channel(ResolutionTier::UltraHd)
            .with_audio_channel()
            .with_stealth_mode()
            .try_build()
            .unwrap();
        assert_eq!(config.name, "win11");
        assert_eq!(config.total_threads, 16);
        assert!(config.paired_threads);
        assert!(config.stealth_mode);
        assert!(config.audio_channel);
    }

    #[test]
    fn minimal_config_builds() {
        let config = minimal().try_build().unwrap();
        assert!(config.gpu_address.is_none());
        assert!(config.video_channel.is_none());
        assert!(!config.remove_hypervisor_feature);
    }

    #[test]
    #[should_panic]
    fn partial_config() {
        DomainConfigBuilder::new("win11".to_string())
            .with_memory_gb(16)
            .try_build()
            .unwrap();
    }

    #[test]
    fn missing_installer_image_is_reported_by_field() {
        let result = minimal_without_image().try_build();
        assert_eq!(
            result.err().unwrap(),
            BuilderError::MissingRequiredField(stringify!(self.installer_image).to_string())
        );
    }

    fn minimal_without_image() -> DomainConfigBuilder {
        DomainConfigBuilder::new("win11".to_string())
            .with_memory_gb(16)
            .with_threads(16, 2)
            .with_disk_size_gb(256)
    }
}
