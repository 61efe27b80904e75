//! Equipment settings source.
//!
//! The settings file is a line-oriented `key=value` document owned by the host. Only the
//! equipment identifier is read from it.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const UNKNOWN_EQPID: &str = "UNKNOWN";
const EQPID_KEY: &str = "eqpid";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub eqpid: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            eqpid: UNKNOWN_EQPID.to_string(),
        }
    }
}

impl Settings {
    pub fn with_eqpid(eqpid: impl Into<String>) -> Self {
        Self {
            eqpid: eqpid.into(),
        }
    }

    /// Reads the settings file; an unreadable file yields the unknown sentinel.
    pub async fn load(path: &Path) -> Self {
        match tokio::fs::read(path).await {
            Ok(bytes) => Self::parse(&String::from_utf8_lossy(&bytes)),
            Err(err) => {
                warn!(error = %err, path = %path.display(), "settings unreadable; using unknown eqpid");
                Self::default()
            }
        }
    }

    pub fn parse(text: &str) -> Self {
        let eqpid = text
            .lines()
            .map(str::trim_start)
            .find(|line| {
                line.get(..EQPID_KEY.len())
                    .map(|prefix| prefix.eq_ignore_ascii_case(EQPID_KEY))
                    .unwrap_or(false)
            })
            .and_then(|line| line.split_once('='))
            .map(|(_, value)| value.trim().to_string())
            .filter(|value| !value.is_empty());

        match eqpid {
            Some(eqpid) => Self { eqpid },
            None => {
                debug!("no Eqpid entry in settings; using unknown eqpid");
                Self::default()
            }
        }
    }
}

/// Either a settings file to read on each call or an already-resolved value.
#[derive(Debug, Clone)]
pub enum SettingsSource {
    Path(PathBuf),
    Inline(Settings),
}

impl SettingsSource {
    pub async fn resolve(&self) -> Settings {
        match self {
            SettingsSource::Path(path) => Settings::load(path).await,
            SettingsSource::Inline(settings) => settings.clone(),
        }
    }
}

impl From<Settings> for SettingsSource {
    fn from(settings: Settings) -> Self {
        SettingsSource::Inline(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eqpid_prefix_match_is_case_insensitive() {
        let settings = Settings::parse("Site=FAB2\nEQPID = AOI-07 \nOther=1\n");
        assert_eq!(settings.eqpid, "AOI-07");
    }

    #[test]
    fn missing_key_yields_unknown_sentinel() {
        assert_eq!(Settings::parse("Site=FAB2\n").eqpid, UNKNOWN_EQPID);
        assert_eq!(Settings::parse("Eqpid=\n").eqpid, UNKNOWN_EQPID);
    }

    #[tokio::test]
    async fn unreadable_file_yields_unknown_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("missing.ini")).await;
        assert_eq!(settings, Settings::default());
    }

    #[tokio::test]
    async fn settings_file_is_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.ini");
        std::fs::write(&path, "eqpid=PA-01\n").unwrap();
        let source = SettingsSource::Path(path);
        assert_eq!(source.resolve().await.eqpid, "PA-01");
    }
}
