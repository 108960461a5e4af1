//! Load config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/toxpup/config.toml or /etc/toxpup/config.toml,
/// unless `--config` names one explicitly.
/// Env overrides: TOXPUP_NODES_FILE, TOXPUP_SAVES_FOLDER, TOXPUP_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Bootstrap node list, JSON (default nodes.json).
    #[serde(default = "default_nodes_file")]
    pub nodes_file: PathBuf,
    #[serde(default = "default_nodes_url")]
    pub nodes_url: String,
    /// Refresh the node list from `nodes_url` on startup.
    #[serde(default = "default_true")]
    pub update_nodes: bool,
    #[serde(default = "default_saves_folder")]
    pub saves_folder: PathBuf,
    /// Honour per-puppet `savefile` paths.
    #[serde(default)]
    pub allow_full_save_path: bool,
    /// Filter used when RUST_LOG is unset (default info).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub puppets: Vec<PuppetConfig>,
}

/// One bridged account.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PuppetConfig {
    pub name: String,
    #[serde(default)]
    pub savefile: Option<PathBuf>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

fn default_nodes_file() -> PathBuf {
    PathBuf::from("nodes.json")
}
fn default_nodes_url() -> String {
    "https://nodes.tox.chat/json".to_string()
}
fn default_true() -> bool {
    true
}
fn default_saves_folder() -> PathBuf {
    PathBuf::from("toxsaves")
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nodes_file: default_nodes_file(),
            nodes_url: default_nodes_url(),
            update_nodes: default_true(),
            saves_folder: default_saves_folder(),
            allow_full_save_path: false,
            log_level: default_log_level(),
            puppets: Vec::new(),
        }
    }
}

impl Config {
    /// Where a puppet's save lives. Explicit paths only count when the
    /// operator allowed them.
    pub fn save_path(&self, puppet: &PuppetConfig) -> PathBuf {
        match &puppet.savefile {
            Some(path) if self.allow_full_save_path => path.clone(),
            _ => self.saves_folder.join(format!("{}.tox", puppet.name)),
        }
    }

    /// Directory for files received from peers.
    pub fn received_dir(&self) -> PathBuf {
        self.saves_folder.join("received")
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("TOXPUP_NODES_FILE") {
            self.nodes_file = PathBuf::from(s);
        }
        if let Some(s) = var("TOXPUP_SAVES_FOLDER") {
            self.saves_folder = PathBuf::from(s);
        }
        if let Some(s) = var("TOXPUP_LOG") {
            self.log_level = s;
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (i, puppet) in self.puppets.iter().enumerate() {
            if puppet.name.is_empty() || !puppet.name.chars().all(|c| c.is_ascii_alphanumeric()) {
                bail!(
                    "puppet name {:?} may only contain numbers and letters",
                    puppet.name
                );
            }
            if self.puppets[..i].iter().any(|p| p.name == puppet.name) {
                bail!("duplicate puppet name {:?}", puppet.name);
            }
        }
        Ok(())
    }
}

/// Load config: default, then config file (explicit or first found), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => load_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => load_file(&path)?,
            None => Config::default(),
        },
    };
    c.apply_env(|k| std::env::var(k).ok());
    c.validate()?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/toxpup/config.toml"));
    }
    out.push(PathBuf::from("/etc/toxpup/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_from_empty_file() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.nodes_file, PathBuf::from("nodes.json"));
        assert_eq!(c.nodes_url, "https://nodes.tox.chat/json");
        assert!(c.update_nodes);
        assert_eq!(c.saves_folder, PathBuf::from("toxsaves"));
        assert!(!c.allow_full_save_path);
        assert_eq!(c.log_level, "info");
        assert!(c.puppets.is_empty());
    }

    #[test]
    fn parses_puppets() {
        let c: Config = toml::from_str(
            r#"
            saves_folder = "/var/lib/toxpup"
            update_nodes = false

            [[puppets]]
            name = "alice"
            display_name = "Alice"
            avatar_url = "https://example.org/a.png"

            [[puppets]]
            name = "bob2"
            savefile = "/tmp/bob.tox"
            "#,
        )
        .unwrap();
        assert!(!c.update_nodes);
        assert_eq!(c.puppets.len(), 2);
        assert_eq!(c.puppets[0].display_name.as_deref(), Some("Alice"));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
        assert!(toml::from_str::<Config>("[[puppets]]\nname = \"a\"\nkey = 1").is_err());
    }

    #[test]
    fn savefile_needs_permission() {
        let mut c = Config::default();
        let p = PuppetConfig {
            name: "bob".into(),
            savefile: Some(PathBuf::from("/tmp/bob.tox")),
            display_name: None,
            avatar_url: None,
        };
        assert_eq!(c.save_path(&p), PathBuf::from("toxsaves/bob.tox"));
        c.allow_full_save_path = true;
        assert_eq!(c.save_path(&p), PathBuf::from("/tmp/bob.tox"));
    }

    #[test]
    fn env_overrides() {
        let mut c = Config::default();
        c.apply_env(|k| match k {
            "TOXPUP_SAVES_FOLDER" => Some("/data".into()),
            "TOXPUP_LOG" => Some("debug".into()),
            _ => None,
        });
        assert_eq!(c.saves_folder, PathBuf::from("/data"));
        assert_eq!(c.received_dir(), PathBuf::from("/data/received"));
        assert_eq!(c.log_level, "debug");
        assert_eq!(c.nodes_file, PathBuf::from("nodes.json"));
    }

    #[test]
    fn puppet_names_are_alphanumeric_and_unique() {
        let bad: Config = toml::from_str("[[puppets]]\nname = \"al ice\"").unwrap();
        assert!(bad.validate().is_err());
        let dup: Config =
            toml::from_str("[[puppets]]\nname = \"a\"\n[[puppets]]\nname = \"a\"").unwrap();
        assert!(dup.validate().is_err());
    }

    #[test]
    fn explicit_path_must_parse() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "log_level = \"warn\"").unwrap();
        let c = load_file(f.path()).unwrap();
        assert_eq!(c.log_level, "warn");

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "log_level = ").unwrap();
        assert!(load_file(bad.path()).is_err());
        assert!(load_file(Path::new("/nonexistent/toxpup.toml")).is_err());
    }
}
