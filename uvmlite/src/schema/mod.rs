//! Compute system configuration document.
//!
//! Field names and nesting follow the host compute service schema (v2.1).
//! Optional sub-structures are omitted when absent, and empty strings, false
//! booleans and zero counts are omitted the same way the service's own
//! encoder does, so a document built here round-trips through the service
//! unchanged.
//!
//! Device tables are `BTreeMap`s keyed by the decimal index so that
//! serialization is deterministic.

pub mod merge;
pub mod modify;
pub mod options;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uvmlite_shared::constants::schema as schema_consts;

pub use merge::merge_json;
pub use modify::{ModifySettingRequest, RequestType};

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

/// Root of the document handed to the compute service at creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ComputeSystemDoc {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<SchemaVersion>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub should_terminate_on_last_handle_closed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_machine: Option<VirtualMachine>,
}

impl ComputeSystemDoc {
    /// Serialize to the JSON value dispatched to the compute service.
    pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }

    /// Access the virtual machine section, creating it if absent.
    pub fn vm_mut(&mut self) -> &mut VirtualMachine {
        self.virtual_machine.get_or_insert_with(VirtualMachine::default)
    }

    pub fn devices(&self) -> Option<&Devices> {
        self.virtual_machine.as_ref()?.devices.as_ref()
    }

    pub fn devices_mut(&mut self) -> &mut Devices {
        self.vm_mut().devices.get_or_insert_with(Devices::default)
    }

    pub fn chipset_mut(&mut self) -> &mut Chipset {
        self.vm_mut().chipset.get_or_insert_with(Chipset::default)
    }

    pub fn topology_mut(&mut self) -> &mut Topology {
        self.vm_mut()
            .compute_topology
            .get_or_insert_with(Topology::default)
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        self.topology_mut().memory.get_or_insert_with(Memory::default)
    }

    pub fn processor_mut(&mut self) -> &mut Processor {
        self.topology_mut()
            .processor
            .get_or_insert_with(Processor::default)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
}

impl SchemaVersion {
    pub const fn v21() -> Self {
        Self {
            major: schema_consts::VERSION_MAJOR,
            minor: schema_consts::VERSION_MINOR,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualMachine {
    #[serde(default, skip_serializing_if = "is_false")]
    pub stop_on_reset: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chipset: Option<Chipset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_topology: Option<Topology>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devices: Option<Devices>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_connection: Option<GuestConnection>,
}

// ============================================================================
// CHIPSET
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Chipset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uefi: Option<Uefi>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux_kernel_direct: Option<LinuxKernelDirect>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Uefi {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_this: Option<UefiBootEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UefiBootEntry {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vmb_fs_root_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub optional_data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LinuxKernelDirect {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kernel_file_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub init_rd_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kernel_cmd_line: String,
}

// ============================================================================
// TOPOLOGY
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Topology {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Memory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor: Option<Processor>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Memory {
    #[serde(rename = "SizeInMB", default, skip_serializing_if = "is_zero_i32")]
    pub size_in_mb: i32,
    #[serde(default, skip_serializing_if = "is_false")]
    pub allow_overcommit: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub enable_deferred_commit: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub enable_hot_hint: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub enable_cold_hint: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub enable_cold_discard_hint: bool,
    #[serde(rename = "LowMMIOGapInMB", default, skip_serializing_if = "is_zero_u64")]
    pub low_mmio_gap_in_mb: u64,
    #[serde(rename = "HighMMIOBaseInMB", default, skip_serializing_if = "is_zero_u64")]
    pub high_mmio_base_in_mb: u64,
    #[serde(rename = "HighMMIOGapInMB", default, skip_serializing_if = "is_zero_u64")]
    pub high_mmio_gap_in_mb: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Processor {
    #[serde(default, skip_serializing_if = "is_zero_i32")]
    pub count: i32,
}

// ============================================================================
// DEVICES
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Devices {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scsi: BTreeMap<String, Scsi>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_p_mem: Option<VirtualPMemController>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hv_socket: Option<HvSocket>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan9: Option<Plan9>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_smb: Option<VirtualSmb>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub com_ports: BTreeMap<String, ComPort>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub network_adapters: BTreeMap<String, NetworkAdapter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyboard: Option<Keyboard>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enhanced_mode_video: Option<EnhancedModeVideo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_monitor: Option<VideoMonitor>,
}

/// A SCSI controller; the attachment table is keyed by LUN.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Scsi {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attachments: BTreeMap<String, Attachment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Attachment {
    #[serde(rename = "Type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualPMemController {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub devices: BTreeMap<String, VirtualPMemDevice>,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub maximum_count: u32,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub maximum_size_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualPMemDevice {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host_path: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_format: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HvSocket {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hv_socket_config: Option<HvSocketSystemConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HvSocketSystemConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_bind_security_descriptor: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Plan9 {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shares: Vec<Plan9Share>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Plan9Share {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub port: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualSmb {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shares: Vec<VirtualSmbShare>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualSmbShare {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<VirtualSmbShareOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualSmbShareOptions {
    #[serde(default, skip_serializing_if = "is_false")]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub take_backup_privilege: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub cache_io: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub share_read: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ComPort {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub named_pipe: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkAdapter {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Keyboard {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnhancedModeVideo {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoMonitor {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GuestConnection {
    #[serde(default, skip_serializing_if = "is_false")]
    pub use_vsock: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub use_connected_suspend: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_names_follow_service_schema() {
        let mut doc = ComputeSystemDoc {
            owner: "tests".into(),
            schema_version: Some(SchemaVersion::v21()),
            should_terminate_on_last_handle_closed: true,
            virtual_machine: None,
        };
        doc.memory_mut().size_in_mb = 512;
        doc.memory_mut().allow_overcommit = true;
        doc.processor_mut().count = 2;
        doc.devices_mut().scsi.insert(
            "0".into(),
            Scsi {
                attachments: BTreeMap::from([(
                    "1".to_string(),
                    Attachment {
                        kind: "VirtualDisk".into(),
                        path: "C:\\disk.vhdx".into(),
                        read_only: true,
                    },
                )]),
            },
        );

        let value = doc.to_value().unwrap();
        assert_eq!(
            value,
            json!({
                "Owner": "tests",
                "SchemaVersion": {"Major": 2, "Minor": 1},
                "ShouldTerminateOnLastHandleClosed": true,
                "VirtualMachine": {
                    "ComputeTopology": {
                        "Memory": {"SizeInMB": 512, "AllowOvercommit": true},
                        "Processor": {"Count": 2}
                    },
                    "Devices": {
                        "Scsi": {
                            "0": {"Attachments": {"1": {
                                "Type": "VirtualDisk",
                                "Path": "C:\\disk.vhdx",
                                "ReadOnly": true
                            }}}
                        }
                    }
                }
            })
        );
    }

    #[test]
    fn test_empty_marker_devices_serialize_as_objects() {
        let mut doc = ComputeSystemDoc::default();
        doc.devices_mut().plan9 = Some(Plan9::default());
        doc.devices_mut().keyboard = Some(Keyboard {});

        let value = doc.to_value().unwrap();
        assert_eq!(value["VirtualMachine"]["Devices"]["Plan9"], json!({}));
        assert_eq!(value["VirtualMachine"]["Devices"]["Keyboard"], json!({}));
    }

    #[test]
    fn test_deserialize_accepts_service_document() {
        let value = json!({
            "Owner": "svc",
            "VirtualMachine": {
                "Devices": {
                    "VirtualPMem": {
                        "MaximumCount": 4,
                        "MaximumSizeBytes": 4096,
                        "Devices": {"0": {"HostPath": "a.vhd", "ImageFormat": "Vhd1"}}
                    }
                }
            }
        });
        let doc: ComputeSystemDoc = serde_json::from_value(value).unwrap();
        let vpmem = doc.devices().unwrap().virtual_p_mem.as_ref().unwrap();
        assert_eq!(vpmem.maximum_count, 4);
        assert_eq!(vpmem.devices["0"].image_format, "Vhd1");
    }
}
