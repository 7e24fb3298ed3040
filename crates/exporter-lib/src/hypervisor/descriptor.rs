//! XML descriptor schemas
//!
//! Only the parts of the domain, capabilities and storage pool documents the
//! collectors read are modeled. Unknown elements and attributes are ignored.

use crate::error::{ApiError, ApiErrorCode};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiskTarget {
    #[serde(default)]
    pub dev: String,
    #[serde(default)]
    pub bus: String,
}

/// Backing of a disk; which attribute is set depends on the disk type
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiskSource {
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub dev: String,
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub volume: String,
    /// network disks
    #[serde(default)]
    pub name: String,
}

impl DiskSource {
    pub fn is_empty(&self) -> bool {
        [
            &self.file,
            &self.dev,
            &self.dir,
            &self.pool,
            &self.volume,
            &self.name,
        ]
        .iter()
        .all(|s| s.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Disk {
    /// `disk`, `cdrom`, `floppy` or `lun`
    #[serde(default)]
    pub device: String,
    #[serde(rename = "type", default)]
    pub disk_type: String,
    #[serde(default)]
    pub source: Option<DiskSource>,
    #[serde(default)]
    pub target: Option<DiskTarget>,
}

impl Disk {
    /// False for a removable drive with no medium inserted. Such a drive has
    /// a target but every stats call on it fails.
    pub fn has_media(&self) -> bool {
        let removable = matches!(self.device.as_str(), "cdrom" | "floppy");
        !removable || self.source.as_ref().is_some_and(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InterfaceTarget {
    #[serde(default)]
    pub dev: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InterfaceMac {
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Interface {
    #[serde(rename = "type", default)]
    pub interface_type: String,
    #[serde(default)]
    pub mac: Option<InterfaceMac>,
    #[serde(default)]
    pub target: Option<InterfaceTarget>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostDev {
    #[serde(default)]
    pub mode: String,
    #[serde(rename = "type", default)]
    pub hostdev_type: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Tpm {
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Rng {
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Devices {
    #[serde(rename = "disk", default)]
    pub disks: Vec<Disk>,
    #[serde(rename = "interface", default)]
    pub interfaces: Vec<Interface>,
    #[serde(rename = "hostdev", default)]
    pub hostdevs: Vec<HostDev>,
    #[serde(rename = "tpm", default)]
    pub tpms: Vec<Tpm>,
    #[serde(rename = "rng", default)]
    pub rngs: Vec<Rng>,
}

/// Parsed domain descriptor
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DomainDescriptor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub devices: Devices,
}

impl DomainDescriptor {
    pub fn parse(xml: &str) -> Result<Self, ApiError> {
        serde_xml_rs::from_str(xml).map_err(|e| {
            ApiError::new(
                ApiErrorCode::Parse,
                format!("invalid domain descriptor: {e}"),
            )
        })
    }

    /// Target names of all disks that declare one, in document order
    pub fn disk_targets(&self) -> Vec<String> {
        target_names(self.devices.disks.iter())
    }

    /// Like [`Self::disk_targets`], without empty removable drives
    pub fn attached_disk_targets(&self) -> Vec<String> {
        target_names(self.devices.disks.iter().filter(|d| d.has_media()))
    }

    /// Target names of all interfaces that declare one, in document order
    pub fn interface_targets(&self) -> Vec<String> {
        self.devices
            .interfaces
            .iter()
            .filter_map(|i| i.target.as_ref())
            .map(|t| t.dev.clone())
            .filter(|dev| !dev.is_empty())
            .collect()
    }
}

fn target_names<'a>(disks: impl Iterator<Item = &'a Disk>) -> Vec<String> {
    disks
        .filter_map(|d| d.target.as_ref())
        .map(|t| t.dev.clone())
        .filter(|dev| !dev.is_empty())
        .collect()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostCpu {
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CapabilitiesHost {
    #[serde(default)]
    pub cpu: Option<HostCpu>,
}

/// Parsed host capabilities document
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub host: CapabilitiesHost,
}

impl Capabilities {
    pub fn parse(xml: &str) -> Result<Self, ApiError> {
        serde_xml_rs::from_str(xml).map_err(|e| {
            ApiError::new(ApiErrorCode::Parse, format!("invalid capabilities: {e}"))
        })
    }

    pub fn arch(&self) -> &str {
        self.host.cpu.as_ref().map_or("", |c| c.arch.as_str())
    }

    pub fn cpu_model(&self) -> &str {
        self.host.cpu.as_ref().map_or("", |c| c.model.as_str())
    }
}

/// Parsed storage pool descriptor
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PoolDescriptor {
    #[serde(rename = "type", default)]
    pub pool_type: String,
}

impl PoolDescriptor {
    pub fn parse(xml: &str) -> Result<Self, ApiError> {
        serde_xml_rs::from_str(xml).map_err(|e| {
            ApiError::new(ApiErrorCode::Parse, format!("invalid pool descriptor: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN_XML: &str = r#"
<domain type='kvm' id='3'>
  <name>web-01</name>
  <uuid>6f1b8f0c-6b55-4d3c-9b6a-2b0c3f7e1a10</uuid>
  <memory unit='KiB'>2097152</memory>
  <devices>
    <emulator>/usr/bin/qemu-system-x86_64</emulator>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/var/lib/libvirt/images/web-01.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
    <controller type='usb' index='0'/>
    <interface type='network'>
      <mac address='52:54:00:6b:3c:58'/>
      <source network='default'/>
      <target dev='vnet0'/>
      <model type='virtio'/>
    </interface>
    <interface type='bridge'>
      <mac address='52:54:00:6b:3c:59'/>
      <source bridge='br0'/>
    </interface>
    <tpm model='tpm-crb'>
      <backend type='emulator' version='2.0'/>
    </tpm>
    <hostdev mode='subsystem' type='pci' managed='yes'>
      <source>
        <address domain='0x0000' bus='0x03' slot='0x00' function='0x0'/>
      </source>
    </hostdev>
    <rng model='virtio'>
      <backend model='random'>/dev/urandom</backend>
    </rng>
  </devices>
</domain>
"#;

    #[test]
    fn test_parse_domain_descriptor() {
        let desc = DomainDescriptor::parse(DOMAIN_XML).unwrap();
        assert_eq!(desc.name, "web-01");
        assert_eq!(desc.disk_targets(), vec!["vda", "sda"]);
        assert_eq!(desc.devices.disks[1].device, "cdrom");
        // the cdrom has no medium
        assert_eq!(desc.attached_disk_targets(), vec!["vda"]);
        // interface without a target is skipped
        assert_eq!(desc.interface_targets(), vec!["vnet0"]);
        assert_eq!(desc.devices.tpms.len(), 1);
        assert_eq!(desc.devices.hostdevs[0].hostdev_type, "pci");
        assert_eq!(desc.devices.rngs[0].model, "virtio");
    }

    #[test]
    fn test_removable_drive_with_medium_is_attached() {
        let xml = r#"
<domain type='kvm'>
  <name>installer</name>
  <devices>
    <disk type='file' device='cdrom'>
      <source file='/var/lib/libvirt/iso/debian-12.iso'/>
      <target dev='sdb' bus='sata'/>
    </disk>
    <disk type='network' device='disk'>
      <source protocol='rbd' name='vms/installer-root'>
        <host name='ceph-mon1' port='6789'/>
      </source>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='block' device='floppy'>
      <target dev='fda'/>
    </disk>
  </devices>
</domain>
"#;
        let desc = DomainDescriptor::parse(xml).unwrap();
        assert_eq!(desc.disk_targets(), vec!["sdb", "vda", "fda"]);
        assert_eq!(desc.attached_disk_targets(), vec!["sdb", "vda"]);
    }

    #[test]
    fn test_parse_domain_without_devices() {
        let desc =
            DomainDescriptor::parse("<domain type='kvm'><name>bare</name></domain>").unwrap();
        assert!(desc.disk_targets().is_empty());
        assert!(desc.interface_targets().is_empty());
    }

    #[test]
    fn test_parse_garbage_fails() {
        let err = DomainDescriptor::parse("<domain><name>broken</domain>").unwrap_err();
        assert_eq!(err.code, ApiErrorCode::Parse);
    }

    #[test]
    fn test_parse_capabilities() {
        let xml = r#"
<capabilities>
  <host>
    <uuid>4c4c4544-0042-3510-8052-b4c04f4b4d32</uuid>
    <cpu>
      <arch>x86_64</arch>
      <model>Skylake-Client-IBRS</model>
      <vendor>Intel</vendor>
    </cpu>
  </host>
</capabilities>
"#;
        let caps = Capabilities::parse(xml).unwrap();
        assert_eq!(caps.arch(), "x86_64");
        assert_eq!(caps.cpu_model(), "Skylake-Client-IBRS");
    }

    #[test]
    fn test_parse_pool_descriptor() {
        let pool = PoolDescriptor::parse("<pool type='dir'><name>default</name></pool>").unwrap();
        assert_eq!(pool.pool_type, "dir");
    }
}
