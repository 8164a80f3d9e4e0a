//! Configuration loading and the merged in-memory probe store.
//!
//! One or more YAML files in a directory are folded into a single
//! [`ConfigStore`]. Merging is strict: a server field may be set by at most
//! one file, probe names are globally unique, and argument names may not
//! collide with the request control parameters. Any violation aborts the
//! load; the exporter never serves a partially merged configuration.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

/// Port used when neither a config file nor a CLI flag provides one.
pub const DEFAULT_PORT: u16 = 8501;

/// Query parameter names reserved by the probe endpoint itself.
pub const RESERVED_PARAMS: &[&str] = &["module", "debug"];

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read config file {file}: {source}")]
    ReadFile {
        file: String,
        source: std::io::Error,
    },
    #[error("failed to parse yaml ({file}): {source}")]
    Parse {
        file: String,
        source: serde_yaml::Error,
    },
    #[error("'{field}' is already set, remove it from {file}")]
    ServerFieldAlreadySet { field: &'static str, file: String },
    #[error("probe name '{name}' must match ^[a-zA-Z0-9:_]+$ ({file})")]
    InvalidProbeName { name: String, file: String },
    #[error("probe '{name}' already exists, remove it from {file}")]
    DuplicateProbe { name: String, file: String },
    #[error("probe '{name}' has a label without key or value ({file})")]
    InvalidLabel { name: String, file: String },
    #[error("argument '{param}' already exists for probe '{name}' ({file})")]
    DuplicateArgument {
        param: String,
        name: String,
        file: String,
    },
    #[error("argument '{param}' on probe '{name}' is a reserved parameter ({file})")]
    ReservedArgument {
        param: String,
        name: String,
        file: String,
    },
}

/// One YAML declaration file.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    server: Option<ServerBlock>,
    probes: Option<Vec<ProbeBlock>>,
}

/// The optional `server` block of a declaration file.
#[derive(Debug, Deserialize)]
struct ServerBlock {
    host: Option<String>,
    port: Option<u16>,
    auth_user: Option<String>,
    auth_password: Option<String>,
}

/// One entry of the `probes` sequence.
#[derive(Debug, Deserialize)]
struct ProbeBlock {
    name: String,
    cmd: String,
    #[serde(default)]
    subsystem: String,
    #[serde(default)]
    labels: Vec<LabelBlock>,
    #[serde(default)]
    arguments: Vec<ArgumentBlock>,
}

#[derive(Debug, Deserialize)]
struct LabelBlock {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct ArgumentBlock {
    dynamic: Option<bool>,
    param: Option<String>,
    default: Option<String>,
}

/// Listener and auth settings, merged across all files.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub auth_user: Option<String>,
    pub auth_password: Option<String>,
}

impl ServerSettings {
    /// The `host:port` string to bind; an empty host means all interfaces.
    pub fn listen_addr(&self) -> String {
        let host = if self.host.is_empty() {
            "0.0.0.0"
        } else {
            &self.host
        };
        format!("{}:{}", host, self.port)
    }
}

/// How a single probe argument is resolved per request.
#[derive(Debug, Clone)]
pub struct ArgumentSpec {
    /// May be supplied by the caller via query parameter.
    pub dynamic: bool,
    /// Fallback value when the caller supplies nothing.
    pub default_value: Option<String>,
}

/// A fully validated probe.
#[derive(Debug, Clone)]
pub struct ProbeDefinition {
    /// The executable to run.
    pub command: String,
    /// Metric subsystem segment for this probe's gauges.
    pub subsystem: String,
    /// Constant label names, parallel to `label_values`.
    pub label_names: Vec<String>,
    pub label_values: Vec<String>,
    /// Argument specs keyed by effective name.
    pub arguments: HashMap<String, ArgumentSpec>,
    /// Effective argument names in declaration order. Command argument
    /// position is significant, so this is never recomputed after load.
    pub argument_order: Vec<String>,
}

/// The merged configuration. Built once at startup, read-only afterwards.
#[derive(Debug, Default)]
pub struct ConfigStore {
    pub server: ServerSettings,
    pub probes: HashMap<String, ProbeDefinition>,
}

impl ConfigStore {
    /// Load and merge every `.yaml`/`.yml` file in `dir`, in lexical order.
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        info!(dir = %dir.display(), "Looking for configuration files");

        let entries = fs::read_dir(dir).map_err(|source| ConfigError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && has_config_extension(p))
            .collect();
        // Lexical order keeps duplicate detection deterministic.
        paths.sort();

        let mut store = Self::default();

        for path in paths {
            let file = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            debug!(%file, "loading config file");

            let content =
                fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
                    file: file.clone(),
                    source,
                })?;

            let doc: ConfigFile =
                serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                    file: file.clone(),
                    source,
                })?;

            if let Some(server) = doc.server {
                store.merge_server(server, &file)?;
            }

            if let Some(probes) = doc.probes {
                store.merge_probes(probes, &file)?;
            }
        }

        Ok(store)
    }

    /// Apply CLI overrides; explicit flags win over file values. A port
    /// still unset afterwards falls back to [`DEFAULT_PORT`].
    pub fn apply_overrides(&mut self, host: Option<String>, port: Option<u16>) {
        if let Some(host) = host {
            self.server.host = host;
        }

        if let Some(port) = port {
            self.server.port = port;
        }

        if self.server.port == 0 {
            self.server.port = DEFAULT_PORT;
        }
    }

    /// Look up a probe by name.
    pub fn probe(&self, name: &str) -> Option<&ProbeDefinition> {
        self.probes.get(name)
    }

    fn merge_server(&mut self, block: ServerBlock, file: &str) -> Result<(), ConfigError> {
        debug!(%file, "merging server block");

        if let Some(host) = block.host {
            if !self.server.host.is_empty() {
                return Err(ConfigError::ServerFieldAlreadySet {
                    field: "host",
                    file: file.to_string(),
                });
            }
            self.server.host = host;
        }

        if let Some(port) = block.port {
            if self.server.port != 0 {
                return Err(ConfigError::ServerFieldAlreadySet {
                    field: "port",
                    file: file.to_string(),
                });
            }
            self.server.port = port;
        }

        if let Some(user) = block.auth_user {
            if self.server.auth_user.is_some() {
                return Err(ConfigError::ServerFieldAlreadySet {
                    field: "auth_user",
                    file: file.to_string(),
                });
            }
            self.server.auth_user = Some(user);
        }

        if let Some(password) = block.auth_password {
            if self.server.auth_password.is_some() {
                return Err(ConfigError::ServerFieldAlreadySet {
                    field: "auth_password",
                    file: file.to_string(),
                });
            }
            self.server.auth_password = Some(password);
        }

        Ok(())
    }

    fn merge_probes(&mut self, blocks: Vec<ProbeBlock>, file: &str) -> Result<(), ConfigError> {
        debug!(%file, "merging probes block");

        for block in blocks {
            debug!(name = %block.name, "found probe");

            if !is_valid_probe_name(&block.name) {
                return Err(ConfigError::InvalidProbeName {
                    name: block.name,
                    file: file.to_string(),
                });
            }

            if self.probes.contains_key(&block.name) {
                return Err(ConfigError::DuplicateProbe {
                    name: block.name,
                    file: file.to_string(),
                });
            }

            let mut label_names = Vec::with_capacity(block.labels.len());
            let mut label_values = Vec::with_capacity(block.labels.len());
            for label in &block.labels {
                if label.key.is_empty() || label.value.is_empty() {
                    return Err(ConfigError::InvalidLabel {
                        name: block.name,
                        file: file.to_string(),
                    });
                }
                label_names.push(label.key.clone());
                label_values.push(label.value.clone());
            }

            let mut arguments = HashMap::with_capacity(block.arguments.len());
            let mut argument_order = Vec::with_capacity(block.arguments.len());

            for (index, argument) in block.arguments.iter().enumerate() {
                // Effective name: explicit `param`, else the declaration
                // index rendered as a string.
                let arg_name = argument
                    .param
                    .clone()
                    .unwrap_or_else(|| index.to_string());

                if arguments.contains_key(&arg_name) {
                    return Err(ConfigError::DuplicateArgument {
                        param: arg_name,
                        name: block.name,
                        file: file.to_string(),
                    });
                }

                if RESERVED_PARAMS.contains(&arg_name.as_str()) {
                    return Err(ConfigError::ReservedArgument {
                        param: arg_name,
                        name: block.name,
                        file: file.to_string(),
                    });
                }

                argument_order.push(arg_name.clone());
                arguments.insert(
                    arg_name,
                    ArgumentSpec {
                        dynamic: argument.dynamic.unwrap_or(false),
                        default_value: argument.default.clone(),
                    },
                );
            }

            info!(name = %block.name, "Probe initialized");

            self.probes.insert(
                block.name,
                ProbeDefinition {
                    command: block.cmd,
                    subsystem: block.subsystem,
                    label_names,
                    label_values,
                    arguments,
                    argument_order,
                },
            );
        }

        Ok(())
    }
}

fn has_config_extension(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn is_valid_probe_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == ':' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, name: &str, content: &str) {
        fs::write(dir.path().join(name), content).unwrap();
    }

    #[test]
    fn test_load_single_probe() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            "probes.yaml",
            r#"
server:
  host: 127.0.0.1
  port: 9500
probes:
  - name: ping_gateway
    cmd: /usr/bin/ping
    subsystem: ping
    labels:
      - key: target
        value: gateway
    arguments:
      - param: count
        default: "-c3"
      - param: host
        dynamic: true
        default: 192.168.1.1
"#,
        );

        let store = ConfigStore::load_dir(dir.path()).unwrap();

        assert_eq!(store.server.host, "127.0.0.1");
        assert_eq!(store.server.port, 9500);

        let probe = store.probe("ping_gateway").unwrap();
        assert_eq!(probe.command, "/usr/bin/ping");
        assert_eq!(probe.subsystem, "ping");
        assert_eq!(probe.label_names, vec!["target"]);
        assert_eq!(probe.label_values, vec!["gateway"]);
        assert_eq!(probe.argument_order, vec!["count", "host"]);
        assert!(probe.arguments["host"].dynamic);
        assert_eq!(
            probe.arguments["count"].default_value.as_deref(),
            Some("-c3")
        );
    }

    #[test]
    fn test_argument_order_matches_arguments() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            "probes.yaml",
            r#"
probes:
  - name: ordered
    cmd: /bin/echo
    arguments:
      - param: z
        default: "1"
      - param: a
        default: "2"
      - param: m
        default: "3"
"#,
        );

        let store = ConfigStore::load_dir(dir.path()).unwrap();
        let probe = store.probe("ordered").unwrap();

        assert_eq!(probe.argument_order.len(), probe.arguments.len());
        assert_eq!(probe.argument_order, vec!["z", "a", "m"]);
        for name in &probe.argument_order {
            assert!(probe.arguments.contains_key(name));
        }
    }

    #[test]
    fn test_unnamed_arguments_use_declaration_index() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            "probes.yaml",
            r#"
probes:
  - name: positional
    cmd: /bin/echo
    arguments:
      - default: first
      - default: second
"#,
        );

        let store = ConfigStore::load_dir(dir.path()).unwrap();
        let probe = store.probe("positional").unwrap();

        assert_eq!(probe.argument_order, vec!["0", "1"]);
    }

    #[test]
    fn test_server_fields_merge_across_files() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "a.yaml", "server:\n  host: 10.0.0.1\n");
        write_config(&dir, "b.yaml", "server:\n  port: 9000\n");

        let store = ConfigStore::load_dir(dir.path()).unwrap();

        assert_eq!(store.server.host, "10.0.0.1");
        assert_eq!(store.server.port, 9000);
    }

    #[test]
    fn test_duplicate_server_field_is_fatal() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "a.yaml", "server:\n  port: 9000\n");
        write_config(&dir, "b.yaml", "server:\n  port: 9001\n");

        let err = ConfigStore::load_dir(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ServerFieldAlreadySet { field: "port", .. }
        ));
        assert!(err.to_string().contains("b.yaml"));
    }

    #[test]
    fn test_duplicate_probe_across_files_is_fatal() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            "a.yaml",
            "probes:\n  - name: dup\n    cmd: /bin/true\n",
        );
        write_config(
            &dir,
            "b.yaml",
            "probes:\n  - name: dup\n    cmd: /bin/false\n",
        );

        let err = ConfigStore::load_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateProbe { .. }));
    }

    #[test]
    fn test_invalid_probe_name_is_fatal() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            "a.yaml",
            "probes:\n  - name: \"bad name!\"\n    cmd: /bin/true\n",
        );

        let err = ConfigStore::load_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidProbeName { .. }));
    }

    #[test]
    fn test_reserved_argument_name_is_fatal() {
        for reserved in RESERVED_PARAMS {
            let dir = TempDir::new().unwrap();
            write_config(
                &dir,
                "a.yaml",
                &format!(
                    "probes:\n  - name: p\n    cmd: /bin/true\n    arguments:\n      - param: {}\n",
                    reserved
                ),
            );

            let err = ConfigStore::load_dir(dir.path()).unwrap_err();
            assert!(matches!(err, ConfigError::ReservedArgument { .. }));
        }
    }

    #[test]
    fn test_duplicate_argument_name_is_fatal() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            "a.yaml",
            r#"
probes:
  - name: p
    cmd: /bin/true
    arguments:
      - param: host
      - param: host
"#,
        );

        let err = ConfigStore::load_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateArgument { .. }));
    }

    #[test]
    fn test_empty_label_is_fatal() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            "a.yaml",
            r#"
probes:
  - name: p
    cmd: /bin/true
    labels:
      - key: target
        value: ""
"#,
        );

        let err = ConfigStore::load_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLabel { .. }));
    }

    #[test]
    fn test_unparsable_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "a.yaml", "probes: [not: valid: yaml\n");

        let err = ConfigStore::load_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_non_yaml_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "notes.txt", "this is not yaml at all {{{");
        write_config(
            &dir,
            "probes.yml",
            "probes:\n  - name: p\n    cmd: /bin/true\n",
        );

        let store = ConfigStore::load_dir(dir.path()).unwrap();
        assert!(store.probe("p").is_some());
    }

    #[test]
    fn test_missing_directory_is_fatal() {
        let err = ConfigStore::load_dir("/definitely/not/a/real/dir").unwrap_err();
        assert!(matches!(err, ConfigError::ReadDir { .. }));
    }

    #[test]
    fn test_overrides_win_over_files() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "a.yaml", "server:\n  host: 10.0.0.1\n  port: 9000\n");

        let mut store = ConfigStore::load_dir(dir.path()).unwrap();
        store.apply_overrides(Some("127.0.0.1".to_string()), Some(9100));

        assert_eq!(store.server.host, "127.0.0.1");
        assert_eq!(store.server.port, 9100);
    }

    #[test]
    fn test_default_port_applies_when_unset() {
        let mut store = ConfigStore::default();
        store.apply_overrides(None, None);

        assert_eq!(store.server.port, DEFAULT_PORT);
        assert_eq!(store.server.listen_addr(), format!("0.0.0.0:{}", DEFAULT_PORT));
    }
}
