//! Key-transform strategies
//!
//! A strategy maps the stripped suffix of a local path (or a relay item
//! name) to an object key, or rejects it. Strategies are resolved by name
//! once when a policy is compiled.

use anyhow::Result;
use chrono::Utc;
use std::fmt;

use super::spec::PolicySettings;

type TransformFn = fn(&str, &PolicySettings) -> Option<String>;

/// A resolved key-transform strategy
#[derive(Clone, Copy)]
pub struct KeyTransform {
    name: &'static str,
    apply: TransformFn,
}

impl fmt::Debug for KeyTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyTransform").field(&self.name).finish()
    }
}

impl PartialEq for KeyTransform {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

const REGISTRY: &[KeyTransform] = &[
    KeyTransform {
        name: "identity",
        apply: identity,
    },
    KeyTransform {
        name: "basename",
        apply: basename,
    },
    KeyTransform {
        name: "dated",
        apply: dated,
    },
    KeyTransform {
        name: "skip-hidden",
        apply: skip_hidden,
    },
];

impl KeyTransform {
    /// Resolve a strategy by name; `None` selects `identity`
    pub fn resolve(name: Option<&str>) -> Result<Self> {
        let name = name.unwrap_or("identity");
        REGISTRY
            .iter()
            .find(|t| t.name == name)
            .copied()
            .ok_or_else(|| {
                let known: Vec<&str> = REGISTRY.iter().map(|t| t.name).collect();
                anyhow::anyhow!(
                    "Unknown key transform '{}' (known: {})",
                    name,
                    known.join(", ")
                )
            })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn apply(&self, suffix: &str, settings: &PolicySettings) -> Option<String> {
        (self.apply)(suffix, settings)
    }
}

fn join_key(prefix: &str, rest: &str) -> Option<String> {
    let rest = rest.trim_start_matches('/');
    if rest.is_empty() {
        return None;
    }
    Some(format!("{}{}", prefix, rest))
}

fn identity(suffix: &str, settings: &PolicySettings) -> Option<String> {
    join_key(&settings.prefix, suffix)
}

fn basename(suffix: &str, settings: &PolicySettings) -> Option<String> {
    let name = suffix.rsplit('/').next().unwrap_or(suffix);
    join_key(&settings.prefix, name)
}

fn dated(suffix: &str, settings: &PolicySettings) -> Option<String> {
    let day = Utc::now().format("%Y/%m/%d/");
    join_key(&format!("{}{}", settings.prefix, day), suffix)
}

fn skip_hidden(suffix: &str, settings: &PolicySettings) -> Option<String> {
    if suffix.split('/').any(|part| part.starts_with('.')) {
        return None;
    }
    join_key(&settings.prefix, suffix)
}
