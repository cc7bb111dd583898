//! Project file loading
//!
//! A project is a single `converge.toml`:
//!
//! ```toml
//! [settings]
//! state = ".converge/state.json"
//! jobs = 8
//!
//! [kinds.network]
//! immutable = ["cidr"]
//! timeout_secs = 30
//! retries = 2
//!
//! [[resource]]
//! kind = "network"
//! name = "main"
//! attributes = { cidr = "10.0.0.0/16" }
//!
//! [[resource]]
//! kind = "subnet"
//! name = "a"
//! attributes = { network = "${network.main.id}", cidr = "10.0.1.0/24" }
//! ```

use anyhow::{Context, Result, bail};
use declarative::{
    Attributes, ExecuteOptions, KindRegistry, KindSpec, Reference, ResourceGraph, ResourceId,
    ResourceNode, RetryConfig, Value,
};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// File looked up in the current directory when `--config` is not given
pub const DEFAULT_FILE: &str = "converge.toml";

const DEFAULT_STATE: &str = ".converge/state.json";
const DEFAULT_PROVIDER_ROOT: &str = ".converge/objects";

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\$\{([A-Za-z0-9_-]+)\.([A-Za-z0-9_-]+)\.([A-Za-z0-9_.-]+)\}$")
        .expect("reference pattern is valid")
});

static NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("name pattern is valid"));

// ============================================================================
// File format
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProjectFile {
    #[serde(default)]
    settings: Settings,
    #[serde(default)]
    kinds: BTreeMap<String, KindConfig>,
    #[serde(default, rename = "resource")]
    resources: Vec<ResourceConfig>,
}

/// `[settings]` table
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// State file path, relative to the project file
    pub state: Option<String>,
    /// Directory the local provider keeps objects in
    pub provider_root: Option<String>,
    /// Worker pool size
    pub jobs: Option<usize>,
    /// Default per-action timeout
    pub timeout_secs: Option<u64>,
}

/// `[kinds.<kind>]` table
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct KindConfig {
    #[serde(default)]
    immutable: Vec<String>,
    timeout_secs: Option<u64>,
    /// Extra attempts after a transient failure
    retries: Option<u32>,
    retry_delay_ms: Option<u64>,
}

/// `[[resource]]` entry
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResourceConfig {
    kind: String,
    name: String,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    attributes: toml::Table,
}

// ============================================================================
// Project
// ============================================================================

/// A loaded and validated project
#[derive(Debug)]
pub struct Project {
    /// The project file
    pub path: PathBuf,
    pub settings: Settings,
    pub kinds: KindRegistry,
    pub graph: ResourceGraph,
}

impl Project {
    /// Load `path`, or `converge.toml` in the current directory
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => expand(&p.to_string_lossy()),
            None => PathBuf::from(DEFAULT_FILE),
        };
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Could not read project file {}", path.display()))?;
        let project = Self::parse(&content, path.clone())
            .with_context(|| format!("Invalid project file {}", path.display()))?;

        log::debug!(
            "Loaded {} resources from {}",
            project.graph.len(),
            path.display()
        );
        Ok(project)
    }

    /// Parse project file content; `path` anchors relative settings
    pub fn parse(content: &str, path: PathBuf) -> Result<Self> {
        let file: ProjectFile = toml::from_str(content)?;

        let mut kinds = KindRegistry::new();
        for (kind, config) in &file.kinds {
            kinds.register(kind.as_str(), kind_spec(config));
        }

        let nodes = file
            .resources
            .iter()
            .map(resource_node)
            .collect::<Result<Vec<_>>>()?;
        let graph = ResourceGraph::new(nodes)?;

        Ok(Self {
            path,
            settings: file.settings,
            kinds,
            graph,
        })
    }

    /// Directory holding the project file
    pub fn base_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    pub fn state_path(&self) -> PathBuf {
        self.resolve(self.settings.state.as_deref().unwrap_or(DEFAULT_STATE))
    }

    pub fn provider_root(&self) -> PathBuf {
        self.resolve(
            self.settings
                .provider_root
                .as_deref()
                .unwrap_or(DEFAULT_PROVIDER_ROOT),
        )
    }

    /// Execution options from settings, with command-line overrides
    pub fn execute_options(&self, jobs: Option<usize>, timeout_secs: Option<u64>) -> ExecuteOptions {
        let defaults = ExecuteOptions::default();
        ExecuteOptions {
            jobs: jobs.or(self.settings.jobs).unwrap_or(defaults.jobs).max(1),
            timeout: timeout_secs
                .or(self.settings.timeout_secs)
                .map_or(defaults.timeout, Duration::from_secs),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let expanded = expand(path);
        if expanded.is_absolute() {
            expanded
        } else {
            self.base_dir().join(expanded)
        }
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

fn kind_spec(config: &KindConfig) -> KindSpec {
    let mut spec = KindSpec::new().immutable(config.immutable.iter().cloned());
    if let Some(secs) = config.timeout_secs {
        spec = spec.timeout(Duration::from_secs(secs));
    }
    if let Some(retries) = config.retries {
        let delay = Duration::from_millis(config.retry_delay_ms.unwrap_or(500));
        spec = spec.retry(RetryConfig::new(retries + 1, delay, 2.0));
    }
    spec
}

fn resource_node(config: &ResourceConfig) -> Result<ResourceNode> {
    for part in [&config.kind, &config.name] {
        if !NAME.is_match(part) {
            bail!("invalid resource name '{part}': use letters, digits, '_' and '-'");
        }
    }
    let id = ResourceId::new(&config.kind, &config.name);

    let mut node = ResourceNode::new(id.clone());
    node.attributes = config
        .attributes
        .iter()
        .map(|(name, value)| {
            convert(value)
                .map(|v| (name.clone(), v))
                .with_context(|| format!("{id}.{name}"))
        })
        .collect::<Result<Attributes>>()?;

    for dep in &config.depends_on {
        let dep: ResourceId = dep
            .parse()
            .with_context(|| format!("{id}: invalid depends_on entry"))?;
        node = node.after(dep);
    }

    Ok(node)
}

/// Convert a TOML value, turning `"${kind.name.attr}"` strings into references
fn convert(value: &toml::Value) -> Result<Value> {
    Ok(match value {
        toml::Value::String(s) => parse_string(s)?,
        toml::Value::Integer(i) => Value::from(*i),
        toml::Value::Float(f) => Value::Number(*f),
        toml::Value::Boolean(b) => Value::Bool(*b),
        toml::Value::Datetime(d) => Value::String(d.to_string()),
        toml::Value::Array(items) => Value::List(items.iter().map(convert).collect::<Result<_>>()?),
        toml::Value::Table(table) => Value::Map(
            table
                .iter()
                .map(|(k, v)| convert(v).map(|v| (k.clone(), v)))
                .collect::<Result<_>>()?,
        ),
    })
}

fn parse_string(s: &str) -> Result<Value> {
    if let Some(caps) = REFERENCE.captures(s) {
        let target = ResourceId::new(&caps[1], &caps[2]);
        return Ok(Value::Reference(Reference::new(target, &caps[3])));
    }
    if s.contains("${") {
        bail!("'{s}': a reference must be the whole value, like \"${{kind.name.attribute}}\"");
    }
    Ok(Value::String(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
[settings]
jobs = 2

[kinds.network]
immutable = ["cidr"]
timeout_secs = 30
retries = 2

[[resource]]
kind = "subnet"
name = "a"
depends_on = ["network.main"]
attributes = { network = "${network.main.id}", cidr = "10.0.1.0/24", tags = ["x", "${network.main.name}"] }

[[resource]]
kind = "network"
name = "main"
attributes = { cidr = "10.0.0.0/16", size = 3, public = false }
"#;

    fn parse(content: &str) -> Result<Project> {
        Project::parse(content, PathBuf::from("/srv/project/converge.toml"))
    }

    #[test]
    fn test_parse_example() {
        let project = parse(EXAMPLE).unwrap();
        assert_eq!(project.graph.len(), 2);

        let subnet = ResourceId::new("subnet", "a");
        let network = ResourceId::new("network", "main");
        let node = project.graph.node(&subnet).unwrap();
        assert_eq!(
            node.attributes["network"],
            Value::Reference(Reference::new(network.clone(), "id"))
        );
        assert_eq!(node.depends_on, vec![network.clone()]);
        assert_eq!(project.graph.dependencies(&subnet), vec![&network]);

        let main = project.graph.node(&network).unwrap();
        assert_eq!(main.attributes["size"], Value::from(3));
        assert_eq!(main.attributes["public"], Value::Bool(false));

        assert!(project.kinds.get("network").is_immutable("cidr"));
        assert_eq!(
            project.kinds.timeout_for("network", Duration::from_secs(1)),
            Duration::from_secs(30)
        );
        assert_eq!(project.kinds.retry_for("network").max_attempts, 3);
        assert_eq!(project.kinds.retry_for("subnet").max_attempts, 1);
    }

    #[test]
    fn test_paths_relative_to_project_file() {
        let project = parse(EXAMPLE).unwrap();
        assert_eq!(
            project.state_path(),
            PathBuf::from("/srv/project/.converge/state.json")
        );
        assert_eq!(
            project.provider_root(),
            PathBuf::from("/srv/project/.converge/objects")
        );
    }

    #[test]
    fn test_execute_options_overrides() {
        let project = parse(EXAMPLE).unwrap();
        assert_eq!(project.execute_options(None, None).jobs, 2);
        assert_eq!(project.execute_options(Some(6), None).jobs, 6);
        assert_eq!(
            project.execute_options(None, Some(5)).timeout,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_embedded_reference_rejected() {
        let err = parse(
            r#"
[[resource]]
kind = "bucket"
name = "b"
attributes = { url = "https://${network.main.id}/x" }
"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("whole value"));
    }

    #[test]
    fn test_reference_to_unknown_resource_rejected() {
        let err = parse(
            r#"
[[resource]]
kind = "bucket"
name = "b"
attributes = { network = "${network.missing.id}" }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown resource network.missing"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(parse("[settings]\nworkers = 3\n").is_err());
    }

    #[test]
    fn test_invalid_name_rejected() {
        let err = parse(
            r#"
[[resource]]
kind = "bucket"
name = "a.b"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid resource name"));
    }
}
