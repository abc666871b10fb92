use std::{fs, path::Path};

use uuid::Uuid;

use crate::domain::DeviceDescriptor;

pub trait DeviceIdentity: Send + Sync {
    fn describe(&self) -> DeviceDescriptor;
}

/// Identity of the machine the tracker runs on.
#[derive(Debug, Clone)]
pub struct HostDevice {
    device_id: String,
    device_name: String,
    os: String,
}

impl HostDevice {
    pub fn detect(device_id: Option<String>, device_name: Option<String>) -> Self {
        let device_id = device_id
            .filter(|v| !v.trim().is_empty())
            .or_else(|| read_trimmed("/etc/machine-id"))
            .unwrap_or_else(|| {
                let generated = Uuid::new_v4().to_string();
                tracing::warn!(device_id = %generated, "no stable machine id found; using a random one for this run");
                generated
            });

        let device_name = device_name
            .filter(|v| !v.trim().is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|v| !v.trim().is_empty()))
            .or_else(|| read_trimmed("/etc/hostname"))
            .unwrap_or_else(|| "unknown-device".to_string());

        let os = fs::read_to_string("/etc/os-release")
            .ok()
            .and_then(|raw| os_from_release(&raw))
            .unwrap_or_else(|| std::env::consts::OS.to_string());

        Self {
            device_id,
            device_name,
            os,
        }
    }
}

impl DeviceIdentity for HostDevice {
    fn describe(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            os: self.os.clone(),
        }
    }
}

impl DeviceIdentity for DeviceDescriptor {
    fn describe(&self) -> DeviceDescriptor {
        self.clone()
    }
}

fn read_trimmed(path: impl AsRef<Path>) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// "<name> <version>" out of an os-release file.
fn os_from_release(raw: &str) -> Option<String> {
    let mut name = None;
    let mut version = None;

    for line in raw.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "NAME" if name.is_none() => name = Some(value),
            "VERSION_ID" => version = Some(value),
            _ => {}
        }
    }

    match (name, version) {
        (Some(n), Some(v)) => Some(format!("{n} {v}")),
        (Some(n), None) => Some(n),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_take_precedence() {
        let device = HostDevice::detect(Some("fixed-id".into()), Some("field-unit".into()));
        let desc = device.describe();
        assert_eq!(desc.device_id, "fixed-id");
        assert_eq!(desc.device_name, "field-unit");
        assert!(!desc.os.is_empty());
    }

    #[test]
    fn blank_overrides_are_ignored() {
        let desc = HostDevice::detect(Some("  ".into()), None).describe();
        assert!(!desc.device_id.trim().is_empty());
        assert!(!desc.device_name.is_empty());
    }

    #[test]
    fn parses_os_release() {
        let raw = "PRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\nNAME=\"Debian GNU/Linux\"\nVERSION_ID=\"12\"\n";
        assert_eq!(os_from_release(raw).as_deref(), Some("Debian GNU/Linux 12"));
        assert_eq!(os_from_release("ID=arch\nNAME=\"Arch Linux\"").as_deref(), Some("Arch Linux"));
        assert_eq!(os_from_release("garbage"), None);
    }

    #[test]
    fn describe_is_stable_across_calls() {
        let device = HostDevice::detect(None, None);
        assert_eq!(device.describe(), device.describe());
    }
}
