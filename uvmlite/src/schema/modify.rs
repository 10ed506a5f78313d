//! Live modification requests sent to a created compute system.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    Add,
    Remove,
    Update,
}

/// A single "modify" call: what to change, where, and with which settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModifySettingRequest {
    pub resource_path: String,
    pub request_type: RequestType,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub settings: Value,
}

impl ModifySettingRequest {
    /// Build an `Add` request carrying `settings` serialized with schema names.
    pub fn add<T: Serialize>(
        resource_path: impl Into<String>,
        settings: &T,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            resource_path: resource_path.into(),
            request_type: RequestType::Add,
            settings: serde_json::to_value(settings)?,
        })
    }

    pub fn remove(resource_path: impl Into<String>) -> Self {
        Self {
            resource_path: resource_path.into(),
            request_type: RequestType::Remove,
            settings: Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Attachment;
    use serde_json::json;

    #[test]
    fn test_add_request_wire_format() {
        let req = ModifySettingRequest::add(
            "VirtualMachine/Devices/Scsi/0/Attachments/3",
            &Attachment {
                kind: "PassThru".into(),
                path: "\\\\.\\PhysicalDrive1".into(),
                read_only: false,
            },
        )
        .unwrap();

        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({
                "ResourcePath": "VirtualMachine/Devices/Scsi/0/Attachments/3",
                "RequestType": "Add",
                "Settings": {"Type": "PassThru", "Path": "\\\\.\\PhysicalDrive1"}
            })
        );
    }

    #[test]
    fn test_remove_request_has_no_settings() {
        let req = ModifySettingRequest::remove("VirtualMachine/Devices/VirtualPMem/Devices/2");
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["RequestType"], "Remove");
        assert!(value.get("Settings").is_none());
    }
}
