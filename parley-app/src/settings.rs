//! Persistent application settings (JSON file in app data directory).

use std::fs;
use std::path::{Path, PathBuf};

use parley_core::{EngineConfig, SessionConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    pub source_language: String,
    pub target_language: String,
    pub persona: Option<String>,
    pub frame_samples: usize,
    pub completion_poll_ms: u64,
    pub start_muted: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            preferred_input_device: None,
            preferred_output_device: None,
            source_language: "en".into(),
            target_language: "es".into(),
            persona: None,
            frame_samples: 4_096,
            completion_poll_ms: 10,
            start_muted: false,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.source_language = normalize_language(&self.source_language, "en");
        self.target_language = normalize_language(&self.target_language, "es");
        self.frame_samples = self.frame_samples.clamp(256, 16_384);
        self.completion_poll_ms = self.completion_poll_ms.clamp(2, 100);
        self.preferred_input_device = trimmed(&self.preferred_input_device);
        self.preferred_output_device = trimmed(&self.preferred_output_device);
        self.persona = trimmed(&self.persona);
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            frame_samples: self.frame_samples,
            completion_poll_ms: self.completion_poll_ms,
            ..EngineConfig::default()
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            source_language: Some(self.source_language.clone()),
            target_language: Some(self.target_language.clone()),
            persona: self.persona.clone(),
            extra: serde_json::Value::Null,
        }
    }
}

fn trimmed(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Map common spellings onto short language codes. Unknown codes pass through
/// lowercased; empty input falls back to `default`.
pub fn normalize_language(raw: &str, default: &str) -> String {
    let lang = raw.trim().to_ascii_lowercase();
    match lang.as_str() {
        "" => default.into(),
        "eng" | "english" | "en-us" | "en-gb" => "en".into(),
        "spa" | "spanish" | "es-es" | "es-mx" => "es".into(),
        "fra" | "fre" | "french" | "fr-fr" => "fr".into(),
        "deu" | "ger" | "german" | "de-de" => "de".into(),
        "zh-cn" | "zh-hans" | "mandarin" | "chinese" => "zh".into(),
        "jpn" | "japanese" => "ja".into(),
        _ => lang,
    }
}

pub fn default_settings_path() -> PathBuf {
    if let Some(path) = std::env::var_os("PARLEY_SETTINGS") {
        return PathBuf::from(path);
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Parley")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("parley")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("parley-settings-{}-{name}", std::process::id()))
            .join("settings.json")
    }

    #[test]
    fn normalize_clamps_and_trims() {
        let mut settings = AppSettings {
            preferred_input_device: Some("  ".into()),
            preferred_output_device: Some(" Speakers ".into()),
            source_language: "English".into(),
            target_language: "".into(),
            frame_samples: 10,
            completion_poll_ms: 1_000,
            ..AppSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.preferred_input_device, None);
        assert_eq!(settings.preferred_output_device.as_deref(), Some("Speakers"));
        assert_eq!(settings.source_language, "en");
        assert_eq!(settings.target_language, "es");
        assert_eq!(settings.frame_samples, 256);
        assert_eq!(settings.completion_poll_ms, 100);
    }

    #[test]
    fn unknown_language_passes_through_lowercased() {
        assert_eq!(normalize_language(" PT-BR ", "en"), "pt-br");
    }

    #[test]
    fn missing_or_corrupt_file_falls_back_to_defaults() {
        let missing = scratch_path("missing");
        assert_eq!(load_settings(&missing), AppSettings::default());

        let corrupt = scratch_path("corrupt");
        fs::create_dir_all(corrupt.parent().unwrap()).unwrap();
        fs::write(&corrupt, "{ not json").unwrap();
        assert_eq!(load_settings(&corrupt), AppSettings::default());
        let _ = fs::remove_dir_all(corrupt.parent().unwrap());
    }

    #[test]
    fn saved_settings_load_back_normalized() {
        let path = scratch_path("saved");
        let settings = AppSettings {
            target_language: "french".into(),
            persona: Some("tutor".into()),
            start_muted: true,
            ..AppSettings::default()
        };
        save_settings(&path, &settings).unwrap();

        let loaded = load_settings(&path);
        assert_eq!(loaded.target_language, "fr");
        assert_eq!(loaded.persona.as_deref(), Some("tutor"));
        assert!(loaded.start_muted);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn session_config_carries_language_pair() {
        let cfg = AppSettings::default().session_config();
        assert_eq!(cfg.source_language.as_deref(), Some("en"));
        assert_eq!(cfg.target_language.as_deref(), Some("es"));
    }
}
