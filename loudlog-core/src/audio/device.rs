//! Audio input device enumeration and selection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[cfg(feature = "audio-cpal")]
use crate::error::{LoudlogError, Result};

/// Metadata about an audio input device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Position in the host's input device list (what `--device` takes).
    pub index: usize,
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Whether this is the system default input device.
    pub is_default: bool,
    pub default_sample_rate: Option<u32>,
    pub default_channels: Option<u16>,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = if self.is_default { '*' } else { ' ' };
        write!(f, "{marker} {:>3}  {}", self.index, self.name)?;
        if let (Some(rate), Some(ch)) = (self.default_sample_rate, self.default_channels) {
            write!(f, "  ({rate} Hz, {ch} ch)")?;
        }
        Ok(())
    }
}

/// Which input device to open.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceSelector {
    /// The host's default input device.
    #[default]
    Default,
    /// Index into the host's input device list.
    Index(usize),
    /// Exact device name.
    Name(String),
}

impl FromStr for DeviceSelector {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("default") {
            return Ok(DeviceSelector::Default);
        }
        match trimmed.parse::<usize>() {
            Ok(index) => Ok(DeviceSelector::Index(index)),
            Err(_) => Ok(DeviceSelector::Name(trimmed.to_string())),
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Default => f.write_str("default"),
            DeviceSelector::Index(index) => write!(f, "#{index}"),
            DeviceSelector::Name(name) => f.write_str(name),
        }
    }
}

/// Resolve `selector` to a cpal input device.
///
/// Unlike a desktop picker, an explicit selection that does not match is an
/// error rather than a silent fallback: the recording must come from the
/// device the operator configured.
#[cfg(feature = "audio-cpal")]
pub fn resolve_input_device(
    host: &cpal::Host,
    selector: &DeviceSelector,
) -> Result<cpal::Device> {
    use cpal::traits::{DeviceTrait, HostTrait};

    match selector {
        DeviceSelector::Default => host
            .default_input_device()
            .ok_or(LoudlogError::NoDefaultInputDevice),
        DeviceSelector::Index(index) => host
            .input_devices()
            .map_err(|e| LoudlogError::Device(e.to_string()))?
            .nth(*index)
            .ok_or_else(|| LoudlogError::Device(format!("no input device at index {index}"))),
        DeviceSelector::Name(wanted) => host
            .input_devices()
            .map_err(|e| LoudlogError::Device(e.to_string()))?
            .find(|device| device.name().map(|n| &n == wanted).unwrap_or(false))
            .ok_or_else(|| LoudlogError::Device(format!("input device '{wanted}' not found"))),
    }
}

/// List all available audio input devices on the system.
///
/// Returns an empty `Vec` if cpal is not available or no devices exist.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    match host.input_devices() {
        Ok(devices) => devices
            .enumerate()
            .map(|(index, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Input Device {}", index + 1));
                let default_config = device.default_input_config().ok();
                DeviceInfo {
                    index,
                    is_default: default_name.as_deref() == Some(name.as_str()),
                    name,
                    default_sample_rate: default_config.as_ref().map(|c| c.sample_rate().0),
                    default_channels: default_config.as_ref().map(|c| c.channels()),
                }
            })
            .collect(),
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            vec![]
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}
