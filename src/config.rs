// config.rs — host configuration file
//
// Defaults live here; the config file and the command line both override
// them, command line last. Parse errors fall back to defaults with a
// warning rather than aborting the emulator.

use serde::Deserialize;
use std::path::{Path, PathBuf};

// ── top-level ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// On-screen display overlay.
    #[serde(default = "default_true")]
    pub osd: bool,
    /// Core speed limiter at startup.
    #[serde(default = "default_true")]
    pub speed_limiter: bool,
    /// Desktop dimensions used to size the agent-mode window.
    #[serde(default = "default_desktop_width")]
    pub desktop_width: u32,
    #[serde(default = "default_desktop_height")]
    pub desktop_height: u32,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// `unix:<path>` or a bare socket path; the server stays off without it.
    pub endpoint: Option<String>,
    /// `watch` or `train`.
    pub profile: Option<String>,
}

fn default_true() -> bool {
    true
}
fn default_desktop_width() -> u32 {
    1920
}
fn default_desktop_height() -> u32 {
    1080
}

impl Default for Config {
    fn default() -> Self {
        Self {
            osd: true,
            speed_limiter: true,
            desktop_width: default_desktop_width(),
            desktop_height: default_desktop_height(),
            agent: AgentConfig::default(),
        }
    }
}

// ── loading ───────────────────────────────────────────────────────────────────

impl Config {
    pub fn load(override_path: Option<&Path>) -> Self {
        let Some(path) = Self::config_path(override_path) else {
            tracing::info!("No config file found — using defaults");
            return Config::default();
        };
        tracing::info!("Loading config from {}", path.display());
        match std::fs::read_to_string(&path) {
            Ok(text) => match toml::from_str::<Config>(&text) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!(
                        "Config parse error in {}: {e} — using defaults",
                        path.display()
                    );
                    Config::default()
                }
            },
            Err(e) => {
                tracing::warn!("Could not read {}: {e} — using defaults", path.display());
                Config::default()
            }
        }
    }

    fn config_path(override_path: Option<&Path>) -> Option<PathBuf> {
        if let Some(p) = override_path {
            return Some(p.to_path_buf());
        }
        if let Ok(p) = std::env::var("M64AGENT_CONFIG") {
            let path = PathBuf::from(p);
            if path.exists() {
                return Some(path);
            }
        }
        let xdg_base = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_default();
                PathBuf::from(home).join(".config")
            });
        let path = xdg_base.join("m64agent").join("config.toml");
        path.exists().then_some(path)
    }
}

// ── agent profile ─────────────────────────────────────────────────────────────

/// Startup preset for automation clients: `watch` keeps the session
/// observable (OSD + speed limiter on), `train` strips both for
/// throughput.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentProfile {
    Watch,
    Train,
}

impl AgentProfile {
    /// Case-insensitive parse; unknown values warn and select nothing,
    /// leaving the current settings untouched.
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("watch") {
            Some(AgentProfile::Watch)
        } else if s.eq_ignore_ascii_case("train") {
            Some(AgentProfile::Train)
        } else {
            tracing::warn!("unknown --agent-profile value '{s}'");
            None
        }
    }
}

// ── window sizing ─────────────────────────────────────────────────────────────

/// Largest 4:3 rectangle that fits inside the desktop; agent mode forces
/// the window to this size.
pub fn largest_4x3(desktop_w: u32, desktop_h: u32) -> (u32, u32) {
    if desktop_w == 0 || desktop_h == 0 {
        return (1024, 768);
    }
    if desktop_w * 3 > desktop_h * 4 {
        (desktop_h * 4 / 3, desktop_h)
    } else {
        (desktop_w, desktop_w * 3 / 4)
    }
}

// ── tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_osd_and_limiter() {
        let cfg = Config::default();
        assert!(cfg.osd);
        assert!(cfg.speed_limiter);
        assert!(cfg.agent.endpoint.is_none());
    }

    #[test]
    fn toml_round_trip_with_agent_table() {
        let cfg: Config = toml::from_str(
            r#"
            osd = false
            [agent]
            endpoint = "unix:/tmp/agent.sock"
            profile = "train"
            "#,
        )
        .unwrap();
        assert!(!cfg.osd);
        assert!(cfg.speed_limiter);
        assert_eq!(cfg.agent.endpoint.as_deref(), Some("unix:/tmp/agent.sock"));
        assert_eq!(cfg.agent.profile.as_deref(), Some("train"));
    }

    #[test]
    fn profile_parse_is_case_insensitive_and_lenient() {
        assert_eq!(AgentProfile::parse("watch"), Some(AgentProfile::Watch));
        assert_eq!(AgentProfile::parse("TRAIN"), Some(AgentProfile::Train));
        assert_eq!(AgentProfile::parse("spectate"), None);
    }

    #[test]
    fn window_fits_the_smaller_desktop_axis() {
        assert_eq!(largest_4x3(1920, 1080), (1440, 1080));
        assert_eq!(largest_4x3(1024, 768), (1024, 768));
        assert_eq!(largest_4x3(800, 1280), (800, 600));
        assert_eq!(largest_4x3(0, 0), (1024, 768));
    }
}
