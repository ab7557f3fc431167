// placement.rs — Placement descriptors: (target, device index, memory scope)
//
// Each field may be unset. The all-unset descriptor is "fully unconstrained";
// one with every field set is "fully constrained". Descriptors are ordered by
// refinement: a descriptor refines another when it sets a superset of its
// fields with equal values on the overlap.
//
// Textual form is `target:device:scope` with `?` for an unset field, e.g.
// `cuda:0:global`, `cuda:?:?`, `?:?:?`. An empty scope is a set scope
// (`llvm:0:` means default memory on llvm device 0).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A possibly partial execution placement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Placement {
    pub target: Option<String>,
    pub device: Option<u32>,
    pub memory_scope: Option<String>,
}

impl Placement {
    /// The all-unset placement.
    pub fn unconstrained() -> Self {
        Self::default()
    }

    /// A fully constrained placement.
    pub fn new(target: impl Into<String>, device: u32, memory_scope: impl Into<String>) -> Self {
        Placement {
            target: Some(target.into()),
            device: Some(device),
            memory_scope: Some(memory_scope.into()),
        }
    }

    /// A placement constraining only the target.
    pub fn for_target(target: impl Into<String>) -> Self {
        Placement {
            target: Some(target.into()),
            ..Self::default()
        }
    }

    pub fn is_fully_unconstrained(&self) -> bool {
        self.target.is_none() && self.device.is_none() && self.memory_scope.is_none()
    }

    pub fn is_fully_constrained(&self) -> bool {
        self.target.is_some() && self.device.is_some() && self.memory_scope.is_some()
    }

    /// Field-wise join. A field is set in the result when at most one side
    /// sets it, or both set it to the same value. Returns `None` when both
    /// sides set some field to different values.
    pub fn join(&self, other: &Placement) -> Option<Placement> {
        Some(Placement {
            target: join_field(&self.target, &other.target)?,
            device: join_field(&self.device, &other.device)?,
            memory_scope: join_field(&self.memory_scope, &other.memory_scope)?,
        })
    }

    /// Keep every field already set, filling the unset ones from `default`.
    ///
    /// Unlike `join` this never fails: where both sides are set, `self` wins.
    pub fn default_from(&self, default: &Placement) -> Placement {
        Placement {
            target: self.target.clone().or_else(|| default.target.clone()),
            device: self.device.or(default.device),
            memory_scope: self
                .memory_scope
                .clone()
                .or_else(|| default.memory_scope.clone()),
        }
    }

    /// True when `self` is at least as constrained as `other`: every field
    /// `other` sets is set in `self` to the same value.
    pub fn refines(&self, other: &Placement) -> bool {
        refines_field(&self.target, &other.target)
            && refines_field(&self.device, &other.device)
            && refines_field(&self.memory_scope, &other.memory_scope)
    }
}

fn join_field<T: Clone + PartialEq>(lhs: &Option<T>, rhs: &Option<T>) -> Option<Option<T>> {
    match (lhs, rhs) {
        (Some(l), Some(r)) if l != r => None,
        (Some(l), _) => Some(Some(l.clone())),
        (None, r) => Some(r.clone()),
    }
}

fn refines_field<T: PartialEq>(lhs: &Option<T>, rhs: &Option<T>) -> bool {
    match (lhs, rhs) {
        (_, None) => true,
        (Some(l), Some(r)) => l == r,
        (None, Some(_)) => false,
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(t) => write!(f, "{}", t)?,
            None => write!(f, "?")?,
        }
        match self.device {
            Some(d) => write!(f, ":{}", d)?,
            None => write!(f, ":?")?,
        }
        match &self.memory_scope {
            Some(s) => write!(f, ":{}", s),
            None => write!(f, ":?"),
        }
    }
}

// ── Parsing ─────────────────────────────────────────────────────────────────

/// A malformed placement literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementParseError {
    pub input: String,
    pub message: String,
}

impl fmt::Display for PlacementParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid placement '{}': {}", self.input, self.message)
    }
}

impl std::error::Error for PlacementParseError {}

impl FromStr for Placement {
    type Err = PlacementParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |message: String| PlacementParseError {
            input: s.to_string(),
            message,
        };

        let mut parts = s.splitn(3, ':');
        let target = match parts.next().unwrap_or("") {
            "" | "?" => None,
            name => {
                if !name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                {
                    return Err(err(format!("bad target name '{}'", name)));
                }
                Some(name.to_string())
            }
        };
        let device = match parts.next() {
            None | Some("") | Some("?") => None,
            Some(d) => Some(
                d.parse::<u32>()
                    .map_err(|_| err(format!("bad device index '{}'", d)))?,
            ),
        };
        let memory_scope = match parts.next() {
            None | Some("?") => None,
            Some(scope) => Some(scope.to_string()),
        };

        Ok(Placement {
            target,
            device,
            memory_scope,
        })
    }
}

impl TryFrom<String> for Placement {
    type Error = PlacementParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Placement> for String {
    fn from(p: Placement) -> String {
        p.to_string()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
