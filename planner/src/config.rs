// config.rs — Compilation configuration: targets, host and default placements
//
// Describes the devices available to one planning run. Handed to the planner
// once; never mutated afterwards.
//
// Preconditions: none (loaded from JSON or built in code).
// Postconditions: a validated config has a non-empty, uniquely named target
//   list and fully constrained, canonical host and default placements.
// Failure modes: I/O and JSON errors, unknown targets, out-of-range devices,
//   partial host/default placements.
// Side effects: `load` reads one file.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::intrinsics::CalleeRule;
use crate::placement::Placement;

// ── Data types ──────────────────────────────────────────────────────────────

/// One compilation target and how many devices of it exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub name: String,
    /// Device kind (e.g. `cpu`, `gpu`). Placements may name a target by kind.
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default = "default_devices")]
    pub devices: u32,
}

fn default_devices() -> u32 {
    1
}

/// Configuration for one planning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompilationConfig {
    pub targets: Vec<TargetConfig>,
    /// Placement for host-side scalars such as shapes and sizes.
    pub host: Placement,
    /// Placement for primitives with no other constraint. Defaults to `host`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_primitive: Option<Placement>,
    /// Extra or overriding special-operator rules.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub intrinsics: BTreeMap<String, CalleeRule>,
}

/// Errors that can occur while loading or applying a configuration.
#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: Option<PathBuf>,
        message: String,
    },
    NoTargets,
    DuplicateTarget(String),
    UnknownTarget(String),
    DeviceOutOfRange {
        target: String,
        device: u32,
        devices: u32,
    },
    NotFullyConstrained {
        what: &'static str,
        placement: Placement,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => write!(f, "{}: {}", path.display(), source),
            ConfigError::Parse {
                path: Some(path),
                message,
            } => write!(f, "{}: {}", path.display(), message),
            ConfigError::Parse {
                path: None,
                message,
            } => write!(f, "config: {}", message),
            ConfigError::NoTargets => write!(f, "config declares no targets"),
            ConfigError::DuplicateTarget(name) => {
                write!(f, "target '{}' is declared more than once", name)
            }
            ConfigError::UnknownTarget(name) => write!(f, "unknown target '{}'", name),
            ConfigError::DeviceOutOfRange {
                target,
                device,
                devices,
            } => write!(
                f,
                "device {} out of range for target '{}' ({} device(s))",
                device, target, devices
            ),
            ConfigError::NotFullyConstrained { what, placement } => write!(
                f,
                "{} placement '{}' must set target, device and memory scope",
                what, placement
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

// ── Construction ────────────────────────────────────────────────────────────

impl Default for CompilationConfig {
    /// A single `llvm` CPU target; host and default placements are `llvm:0:`.
    fn default() -> Self {
        CompilationConfig {
            targets: vec![TargetConfig {
                name: "llvm".to_string(),
                kind: Some("cpu".to_string()),
                devices: 1,
            }],
            host: Placement::new("llvm", 0, ""),
            default_primitive: None,
            intrinsics: BTreeMap::new(),
        }
    }
}

impl CompilationConfig {
    /// Build and validate a configuration in code.
    pub fn new(
        targets: Vec<TargetConfig>,
        host: Placement,
        default_primitive: Option<Placement>,
    ) -> Result<Self, ConfigError> {
        CompilationConfig {
            targets,
            host,
            default_primitive,
            intrinsics: BTreeMap::new(),
        }
        .validated()
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: CompilationConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse {
                path: None,
                message: e.to_string(),
            })?;
        config.validated()
    }

    /// Load and validate a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json(&text).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: Some(path.to_path_buf()),
                message,
            },
            other => other,
        })
    }

    /// Check target names and canonicalize the host and default placements.
    fn validated(mut self) -> Result<Self, ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        let mut seen = HashSet::new();
        for target in &self.targets {
            if !seen.insert(target.name.as_str()) {
                return Err(ConfigError::DuplicateTarget(target.name.clone()));
            }
        }

        let host = self.canonical(&self.host)?;
        if !host.is_fully_constrained() {
            return Err(ConfigError::NotFullyConstrained {
                what: "host",
                placement: host,
            });
        }
        self.host = host;

        if let Some(default) = self.default_primitive.take() {
            let default = self.canonical(&default)?;
            if !default.is_fully_constrained() {
                return Err(ConfigError::NotFullyConstrained {
                    what: "default primitive",
                    placement: default,
                });
            }
            self.default_primitive = Some(default);
        }
        Ok(self)
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    /// The canonical host placement.
    pub fn host_placement(&self) -> &Placement {
        &self.host
    }

    /// The placement primitives fall back to when nothing constrains them.
    pub fn default_primitive_placement(&self) -> &Placement {
        self.default_primitive.as_ref().unwrap_or(&self.host)
    }

    /// Find a target by name, then by kind.
    pub fn find_target(&self, name_or_kind: &str) -> Option<&TargetConfig> {
        self.targets
            .iter()
            .find(|t| t.name == name_or_kind)
            .or_else(|| {
                self.targets
                    .iter()
                    .find(|t| t.kind.as_deref() == Some(name_or_kind))
            })
    }

    /// Target used to complete a placement that sets only device or scope.
    fn context_target(&self) -> Option<&str> {
        self.default_primitive
            .as_ref()
            .and_then(|p| p.target.as_deref())
            .or(self.host.target.as_deref())
            .or_else(|| self.targets.first().map(|t| t.name.as_str()))
    }

    /// Canonicalize `placement`: resolve its target by name or kind, fill a
    /// missing target from context, and check the device index. Fully
    /// unconstrained placements are returned unchanged.
    pub fn canonical(&self, placement: &Placement) -> Result<Placement, ConfigError> {
        if placement.is_fully_unconstrained() {
            return Ok(placement.clone());
        }
        let requested = match placement.target.as_deref().or(self.context_target()) {
            Some(name) => name,
            None => return Err(ConfigError::NoTargets),
        };
        let target = self
            .find_target(requested)
            .ok_or_else(|| ConfigError::UnknownTarget(requested.to_string()))?;
        if let Some(device) = placement.device {
            if device >= target.devices {
                return Err(ConfigError::DeviceOutOfRange {
                    target: target.name.clone(),
                    device,
                    devices: target.devices,
                });
            }
        }
        Ok(Placement {
            target: Some(target.name.clone()),
            device: placement.device,
            memory_scope: placement.memory_scope.clone(),
        })
    }

    /// Canonical compact JSON, used for fingerprinting.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
