// intrinsics.rs — Fixed placement rules for special operators
//
// A small table from operator name to the shape of its callee domain. The
// table is built once by the caller (standard rules plus any config
// extensions) and threaded into `DeviceDomains`; nothing here is looked up
// from global state.
//
// Operators absent from the table are plain primitives: every argument and
// the result share one first-order domain.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Where one parameter (or the result) of a special operator must live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    /// The host placement.
    Host,
    /// One free first-order domain shared by every `Shared` slot of a call.
    Shared,
    /// A fresh free domain mirroring the argument's shape.
    Free,
    /// The placement given by the named call attribute.
    Attr(String),
}

/// Rule for building the callee domain of a special operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalleeRule {
    /// `on_device(body, scope = P, fixed = b)`: `fn(<P>):<P>` when fixed,
    /// `fn(<P>):?x?` otherwise.
    OnDevice,
    /// One slot per parameter plus the result.
    Slots { params: Vec<Slot>, result: Slot },
}

impl CalleeRule {
    fn slots(params: &[Slot], result: Slot) -> Self {
        CalleeRule::Slots {
            params: params.to_vec(),
            result,
        }
    }

    /// Number of arguments the rule expects, if fixed.
    pub fn arity(&self) -> usize {
        match self {
            CalleeRule::OnDevice => 1,
            CalleeRule::Slots { params, .. } => params.len(),
        }
    }
}

/// Operator name → placement rule.
#[derive(Debug, Clone, Default)]
pub struct IntrinsicTable {
    rules: BTreeMap<String, CalleeRule>,
}

impl IntrinsicTable {
    /// An empty table: every operator is a plain primitive.
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard annotation and memory-management operators.
    pub fn standard() -> Self {
        use Slot::*;
        let mut table = Self::new();
        table.insert("on_device", CalleeRule::OnDevice);
        table.insert(
            "device_copy",
            CalleeRule::slots(&[Attr("src".into())], Attr("dst".into())),
        );
        table.insert(
            "alloc_storage",
            CalleeRule::slots(&[Host, Host], Attr("scope".into())),
        );
        table.insert("alloc_tensor", CalleeRule::slots(&[Shared, Host, Host], Shared));
        table.insert("shape_of", CalleeRule::slots(&[Free], Host));
        table.insert("reshape_tensor", CalleeRule::slots(&[Shared, Host], Shared));
        table.insert("invoke_op", CalleeRule::slots(&[Free, Shared, Shared], Shared));
        table
    }

    /// Standard rules overridden/extended by `extra`.
    pub fn with_extensions(extra: &BTreeMap<String, CalleeRule>) -> Self {
        let mut table = Self::standard();
        for (name, rule) in extra {
            table.insert(name, rule.clone());
        }
        table
    }

    pub fn insert(&mut self, name: &str, rule: CalleeRule) {
        self.rules.insert(name.to_string(), rule);
    }

    pub fn lookup(&self, name: &str) -> Option<&CalleeRule> {
        self.rules.get(name)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
