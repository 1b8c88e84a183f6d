//! Audio device enumeration and lookup.

use serde::{Deserialize, Serialize};

/// Which side of the duplex a device serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceDirection {
    Input,
    Output,
}

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    pub direction: DeviceDirection,
    /// Whether this is the system default for its direction.
    pub is_default: bool,
    /// Heuristic flag for inputs that capture system output instead of a voice.
    pub is_loopback_like: bool,
    /// Heuristic pick for the best device in this direction.
    pub is_recommended: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "loopback",
    "monitor of",
    "virtual output",
];

const MIC_POSITIVE_KEYWORDS: &[&str] = &[
    "microphone",
    "mic",
    "array",
    "headset",
    "usb",
    "webcam",
];

/// Best-effort heuristic for loopback/system-output capture devices.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Score a device name for likely voice-microphone intent. Higher is better.
pub fn mic_preference_score(name: &str) -> i32 {
    let lowered = name.trim().to_ascii_lowercase();
    let mut score = if is_loopback_like_name(&lowered) { -16 } else { 8 };
    if MIC_POSITIVE_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        score += 6;
    }
    score
}

/// Mark the recommended entry and order the list best-first.
fn rank(list: &mut [DeviceInfo]) {
    let best = list
        .iter()
        .enumerate()
        .max_by_key(|(_, d)| {
            let base = match d.direction {
                DeviceDirection::Input => mic_preference_score(&d.name),
                DeviceDirection::Output => 0,
            };
            base + if d.is_default { 2 } else { 0 }
        })
        .map(|(idx, _)| idx);
    if let Some(best) = best.and_then(|idx| list.get_mut(idx)) {
        best.is_recommended = true;
    }
    list.sort_by_key(|d| {
        (
            !d.is_recommended,
            d.is_loopback_like,
            !d.is_default,
            d.name.to_ascii_lowercase(),
        )
    });
}

#[cfg(feature = "audio-cpal")]
fn collect<I>(
    devices: I,
    default_name: Option<String>,
    direction: DeviceDirection,
) -> Vec<DeviceInfo>
where
    I: Iterator<Item = cpal::Device>,
{
    use cpal::traits::DeviceTrait;

    let mut list = devices
        .enumerate()
        .map(|(idx, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Device {}", idx + 1));
            let is_default = default_name.as_deref() == Some(name.as_str());
            let is_loopback_like =
                direction == DeviceDirection::Input && is_loopback_like_name(&name);
            DeviceInfo {
                name,
                direction,
                is_default,
                is_loopback_like,
                is_recommended: false,
            }
        })
        .collect::<Vec<_>>();
    rank(&mut list);
    list
}

/// List all audio input devices. Empty if enumeration fails.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    match host.input_devices() {
        Ok(devices) => collect(devices, default_name, DeviceDirection::Input),
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            vec![]
        }
    }
}

/// List all audio output devices. Empty if enumeration fails.
#[cfg(feature = "audio-cpal")]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());
    match host.output_devices() {
        Ok(devices) => collect(devices, default_name, DeviceDirection::Output),
        Err(e) => {
            tracing::warn!("failed to enumerate output devices: {e}");
            vec![]
        }
    }
}

/// Find an input device by exact name.
#[cfg(feature = "audio-cpal")]
pub fn find_input(host: &cpal::Host, name: &str) -> Option<cpal::Device> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let found = host
        .input_devices()
        .ok()?
        .find(|d| d.name().map(|n| n == name).unwrap_or(false));
    if found.is_none() {
        tracing::warn!("preferred input device '{}' not found, falling back", name);
    }
    found
}

/// Find an output device by exact name.
#[cfg(feature = "audio-cpal")]
pub fn find_output(host: &cpal::Host, name: &str) -> Option<cpal::Device> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let found = host
        .output_devices()
        .ok()?
        .find(|d| d.name().map(|n| n == name).unwrap_or(false));
    if found.is_none() {
        tracing::warn!("preferred output device '{}' not found, falling back", name);
    }
    found
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    vec![]
}
