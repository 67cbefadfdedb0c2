use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{
    env_subst::substitute_env,
    error::{Context, Error, Result},
    schema::SwitchboardConfig,
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "switchboard.toml",
    "switchboard.yaml",
    "switchboard.yml",
    "switchboard.json",
];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> Result<SwitchboardConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./switchboard.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/switchboard/switchboard.{toml,yaml,yml,json}` (user-global)
///
/// Returns `SwitchboardConfig::default()` if no config file is found or the
/// file fails to parse.
pub fn discover_and_load() -> SwitchboardConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    SwitchboardConfig::default()
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    if let Some(dirs) = directories::ProjectDirs::from("", "", "switchboard") {
        let config_dir = dirs.config_dir();
        for name in CONFIG_FILENAMES {
            let p = config_dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }

    None
}

pub(crate) fn parse_config(raw: &str, path: &Path) -> Result<SwitchboardConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => Err(Error::UnsupportedFormat {
            extension: ext.to_string(),
        }),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, secrecy::ExposeSecret};

    #[test]
    fn loads_toml_with_partial_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchboard.toml");
        std::fs::write(
            &path,
            "[server]\nport = 8080\n\n[relay]\nagent_poll_interval_ms = 500\n",
        )
        .unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.server.bind, "127.0.0.1");
        assert_eq!(cfg.relay.agent_poll_interval_ms, 500);
        assert_eq!(cfg.relay.assistant_poll_interval_ms, 1_000);
    }

    #[test]
    fn loads_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("switchboard.yaml");
        std::fs::write(&yaml, "agent:\n  topic_id: abc\n").unwrap();
        assert_eq!(load_config(&yaml).unwrap().agent.topic_id, "abc");

        let json = dir.path().join("switchboard.json");
        std::fs::write(&json, r#"{"handoff": {"transcript_limit": 5}}"#).unwrap();
        assert_eq!(load_config(&json).unwrap().handoff.transcript_limit, 5);
    }

    #[test]
    fn substitutes_env_placeholders_before_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchboard.toml");
        // PATH is set in every test environment.
        std::fs::write(&path, "[agent]\npassword = \"${PATH}\"\n").unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(
            cfg.agent.password.expose_secret(),
            &std::env::var("PATH").unwrap()
        );
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchboard.ini");
        std::fs::write(&path, "port=1").unwrap();
        assert!(matches!(
            load_config(&path),
            Err(Error::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(&dir.path().join("nope.toml")).is_err());
    }
}
