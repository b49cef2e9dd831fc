use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::transform::KeyTransform;

/// Declarative synchronization rule, as written in the agent config
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PolicySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Handler kind: `upload`, `download` or `relay`
    pub handler: String,

    /// Glob selecting local files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// Leading path text removed before key computation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strip: Option<String>,

    /// Key prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub delete_after_upload: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub move_after_upload: Option<PathBuf>,
}

/// Values a policy inherits when it doesn't set them itself
#[derive(Debug, Clone)]
pub struct PolicyDefaults {
    pub bucket: Option<String>,
    pub pop_timeout: Duration,
}

impl Default for PolicyDefaults {
    fn default() -> Self {
        Self {
            bucket: None,
            pop_timeout: Duration::from_secs(1),
        }
    }
}

/// Effective settings of one policy
#[derive(Debug, Clone, PartialEq)]
pub struct PolicySettings {
    pub name: String,
    pub kind: String,
    pub pattern: String,
    pub strip: String,
    pub prefix: String,
    pub bucket: String,
    pub directory: Option<PathBuf>,
    pub keys: Vec<String>,
    pub host: String,
    pub port: Option<u16>,
    pub queue: String,
    pub delete_after_upload: bool,
    pub move_after_upload: Option<PathBuf>,
    pub pop_timeout: Duration,
}

#[cfg(test)]
impl PolicySettings {
    pub(crate) fn for_tests(kind: &str) -> Self {
        Self {
            name: format!("{}-test", kind),
            kind: kind.to_string(),
            pattern: "**/*".to_string(),
            strip: String::new(),
            prefix: String::new(),
            bucket: "test".to_string(),
            directory: None,
            keys: Vec::new(),
            host: "127.0.0.1".to_string(),
            port: None,
            queue: "fieldsync:test".to_string(),
            delete_after_upload: false,
            move_after_upload: None,
            pop_timeout: Duration::from_millis(50),
        }
    }
}

/// A policy ready to run: settings with defaults applied, transform resolved
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPolicy {
    pub settings: PolicySettings,
    pub transform: KeyTransform,
}

impl CompiledPolicy {
    pub fn compile(spec: &PolicySpec, index: usize, defaults: &PolicyDefaults) -> Result<Self> {
        let kind = spec.handler.trim().to_lowercase();
        let name = spec
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", kind, index));

        let transform = KeyTransform::resolve(spec.transform.as_deref())
            .with_context(|| format!("Policy '{}'", name))?;

        let pattern = resolve_pattern(spec.pattern.as_deref(), spec.directory.as_deref());
        glob::Pattern::new(&pattern)
            .with_context(|| format!("Policy '{}' has an invalid pattern: {}", name, pattern))?;

        let strip = match (&spec.strip, &spec.directory) {
            (Some(strip), _) => strip.clone(),
            (None, Some(dir)) => format!("{}/", dir.display().to_string().trim_end_matches('/')),
            (None, None) => String::new(),
        };

        let bucket = spec.bucket.clone().or_else(|| defaults.bucket.clone());

        let settings = PolicySettings {
            queue: spec
                .queue
                .clone()
                .unwrap_or_else(|| format!("fieldsync:{}", name)),
            name,
            kind,
            pattern,
            strip,
            prefix: spec.prefix.clone().unwrap_or_default(),
            bucket: bucket.unwrap_or_default(),
            directory: spec.directory.clone(),
            keys: spec.keys.clone(),
            host: spec.host.clone().unwrap_or_else(|| "127.0.0.1".to_string()),
            port: spec.port,
            delete_after_upload: spec.delete_after_upload,
            move_after_upload: spec.move_after_upload.clone(),
            pop_timeout: defaults.pop_timeout,
        };

        validate_for_kind(&settings)?;

        Ok(Self {
            settings,
            transform,
        })
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Object key for a local path, or `None` if the transform rejects it
    pub fn key_for_path(&self, path: &Path) -> Option<String> {
        let path = path.to_string_lossy();
        self.key_for(strip_prefix(&path, &self.settings.strip))
    }

    /// Object key for an already stripped suffix
    pub fn key_for(&self, suffix: &str) -> Option<String> {
        self.transform.apply(suffix, &self.settings)
    }
}

fn resolve_pattern(pattern: Option<&str>, directory: Option<&Path>) -> String {
    match (pattern, directory) {
        (Some(pattern), Some(dir)) if !Path::new(pattern).is_absolute() => {
            dir.join(pattern).to_string_lossy().into_owned()
        }
        (Some(pattern), _) => pattern.to_string(),
        (None, Some(dir)) => dir.join("**/*").to_string_lossy().into_owned(),
        (None, None) => "**/*".to_string(),
    }
}

fn validate_for_kind(settings: &PolicySettings) -> Result<()> {
    let needs_bucket = matches!(settings.kind.as_str(), "upload" | "download" | "relay");
    if needs_bucket && settings.bucket.is_empty() {
        anyhow::bail!(
            "Policy '{}' has no bucket and object_store.bucket is not set",
            settings.name
        );
    }

    match settings.kind.as_str() {
        "download" => {
            if settings.directory.is_none() {
                anyhow::bail!("Download policy '{}' requires a directory", settings.name);
            }
        }
        "relay" => {
            if settings.port.is_none() {
                anyhow::bail!("Relay policy '{}' requires a port", settings.name);
            }
        }
        _ => {}
    }

    Ok(())
}

/// Remove `strip` from the front of `path`; paths outside it keep their full text
pub fn strip_prefix<'a>(path: &'a str, strip: &str) -> &'a str {
    path.strip_prefix(strip).unwrap_or(path)
}

/// Compile every spec; a policy that fails is logged and left out
pub fn compile_all(specs: &[PolicySpec], defaults: &PolicyDefaults) -> Vec<CompiledPolicy> {
    specs
        .iter()
        .enumerate()
        .filter_map(|(index, spec)| match CompiledPolicy::compile(spec, index, defaults) {
            Ok(policy) => Some(policy),
            Err(e) => {
                tracing::error!("Skipping policy: {:#}", e);
                None
            }
        })
        .collect()
}

/// SHA-256 over the serialized policy list
pub fn fingerprint(specs: &[PolicySpec]) -> String {
    let serialized = serde_json::to_vec(specs).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&serialized);
    format!("sha256:{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(handler: &str) -> PolicySpec {
        PolicySpec {
            name: None,
            handler: handler.to_string(),
            pattern: None,
            strip: None,
            prefix: None,
            transform: None,
            bucket: Some("site".to_string()),
            directory: None,
            keys: Vec::new(),
            host: None,
            port: None,
            queue: None,
            delete_after_upload: false,
            move_after_upload: None,
        }
    }

    #[test]
    fn defaults_are_applied() {
        let policy = CompiledPolicy::compile(&spec("upload"), 2, &PolicyDefaults::default()).unwrap();
        assert_eq!(policy.name(), "upload-2");
        assert_eq!(policy.settings.pattern, "**/*");
        assert_eq!(policy.transform.name(), "identity");
        assert_eq!(policy.settings.queue, "fieldsync:upload-2");
    }

    #[test]
    fn directory_anchors_pattern_and_strip() {
        let mut s = spec("upload");
        s.directory = Some(PathBuf::from("/data/out"));
        s.pattern = Some("*.csv".to_string());
        s.prefix = Some("site1/".to_string());

        let policy = CompiledPolicy::compile(&s, 0, &PolicyDefaults::default()).unwrap();
        assert_eq!(policy.settings.pattern, "/data/out/*.csv");
        assert_eq!(
            policy.key_for_path(Path::new("/data/out/a.csv")).as_deref(),
            Some("site1/a.csv")
        );
    }

    #[test]
    fn bucket_falls_back_to_default() {
        let mut s = spec("upload");
        s.bucket = None;
        assert!(CompiledPolicy::compile(&s, 0, &PolicyDefaults::default()).is_err());

        let defaults = PolicyDefaults {
            bucket: Some("shared".to_string()),
            ..PolicyDefaults::default()
        };
        let policy = CompiledPolicy::compile(&s, 0, &defaults).unwrap();
        assert_eq!(policy.settings.bucket, "shared");
    }

    #[test]
    fn handler_specific_requirements() {
        assert!(CompiledPolicy::compile(&spec("download"), 0, &PolicyDefaults::default()).is_err());
        assert!(CompiledPolicy::compile(&spec("relay"), 0, &PolicyDefaults::default()).is_err());

        let mut relay = spec("relay");
        relay.port = Some(9000);
        assert!(CompiledPolicy::compile(&relay, 0, &PolicyDefaults::default()).is_ok());
    }

    #[test]
    fn unknown_kind_compiles() {
        let policy = CompiledPolicy::compile(&spec("mirror"), 0, &PolicyDefaults::default()).unwrap();
        assert_eq!(policy.settings.kind, "mirror");
    }

    #[test]
    fn compile_all_skips_broken_policies() {
        let mut broken = spec("upload");
        broken.transform = Some("nope".to_string());
        let compiled = compile_all(&[broken, spec("upload")], &PolicyDefaults::default());
        assert_eq!(compiled.len(), 1);
        assert_eq!(compiled[0].name(), "upload-1");
    }

    #[test]
    fn fingerprint_tracks_changes() {
        let a = vec![spec("upload")];
        let mut b = a.clone();
        assert_eq!(fingerprint(&a), fingerprint(&b));

        b[0].prefix = Some("x/".to_string());
        assert_ne!(fingerprint(&a), fingerprint(&b));
        assert!(fingerprint(&a).starts_with("sha256:"));
    }

    #[test]
    fn strip_keeps_unrelated_paths() {
        assert_eq!(strip_prefix("/data/out/a", "/data/out/"), "a");
        assert_eq!(strip_prefix("/other/a", "/data/out/"), "/other/a");
    }
}
