//! Name resolution.
//!
//! Agents are project-scoped: the agent `dev` of project `myapp` lives in a
//! container named `agentbox.myapp.dev`.

use crate::config::{Project, Settings};
use crate::engine::{Engine, EngineError};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::debug;

/// Tool prefix for container names and labels.
pub const PREFIX: &str = "agentbox";

/// Label marking containers created by this tool.
pub const LABEL_MANAGED: &str = "agentbox.managed";
/// Label carrying the project key.
pub const LABEL_PROJECT: &str = "agentbox.project";
/// Label carrying the agent name.
pub const LABEL_AGENT: &str = "agentbox.agent";

/// Image sentinel meaning "the project's image".
pub const IMAGE_SENTINEL: &str = "@";

static AGENT_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_-]{0,62}$").expect("agent name pattern is valid")
});

#[derive(Debug, Error)]
pub enum NameError {
    #[error("invalid agent name {0:?}: use letters, digits, '-' or '_' (max 63 chars)")]
    InvalidAgent(String),

    #[error("no image specified: set default_image in settings or agentbox.toml, or build a project image")]
    NoImage,

    #[error("{op}: {source}")]
    Engine {
        op: String,
        #[source]
        source: EngineError,
    },
}

/// Check that `name` is usable as an agent token.
pub fn validate_agent_name(name: &str) -> Result<(), NameError> {
    if AGENT_NAME.is_match(name) {
        Ok(())
    } else {
        Err(NameError::InvalidAgent(name.to_string()))
    }
}

/// Map an agent token to its container name.
///
/// Names containing `.` or `:` are already full names (or IDs with a
/// registry-style qualifier) and pass through unchanged.
#[must_use]
pub fn resolve_container_name(project_key: &str, agent: &str) -> String {
    if agent.contains('.') || agent.contains(':') {
        agent.to_string()
    } else {
        format!("{PREFIX}.{project_key}.{agent}")
    }
}

#[must_use]
pub fn resolve_container_names(project_key: &str, agents: &[String]) -> Vec<String> {
    agents
        .iter()
        .map(|agent| resolve_container_name(project_key, agent))
        .collect()
}

/// Generate an agent name not present in `taken`.
#[must_use]
pub fn generate_agent_name(taken: &HashSet<String>) -> String {
    let mut generator = names::Generator::default();
    let mut counter = 1u32;
    loop {
        let base = generator.next().unwrap_or_else(|| "agent".to_string());
        if !taken.contains(&base) {
            return base;
        }
        counter += 1;
        let numbered = format!("{base}-{counter}");
        if !taken.contains(&numbered) {
            return numbered;
        }
    }
}

/// A `cp` argument split into container and path parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerPath {
    /// Container reference; empty for host paths and for `:/path`.
    pub container: String,
    pub path: String,
    pub is_container: bool,
}

impl ContainerPath {
    fn host(arg: &str) -> Self {
        Self {
            container: String::new(),
            path: arg.to_string(),
            is_container: false,
        }
    }
}

/// Split a `cp` argument of the form `[container]:path`.
///
/// A single alphabetic character before the colon is a drive letter, not a
/// container. Absolute paths and paths starting with `.` are always host
/// paths. `-` is the stdin/stdout placeholder.
#[must_use]
pub fn parse_container_path(arg: &str) -> ContainerPath {
    if arg == "-" || arg.starts_with('/') || arg.starts_with('.') {
        return ContainerPath::host(arg);
    }
    let Some((left, right)) = arg.split_once(':') else {
        return ContainerPath::host(arg);
    };
    let mut chars = left.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        if c.is_ascii_alphabetic() {
            return ContainerPath::host(arg);
        }
    }
    ContainerPath {
        container: left.to_string(),
        path: right.to_string(),
        is_container: true,
    }
}

/// Resolve an image reference, expanding the `@` sentinel.
///
/// For `@` the search order is: the newest image labelled with the project
/// key, the settings default image, the project default image.
pub async fn resolve_image(
    spec: &str,
    engine: &dyn Engine,
    project: &Project,
    settings: &Settings,
) -> Result<String, NameError> {
    if spec != IMAGE_SENTINEL {
        return Ok(spec.to_string());
    }

    let filter = [format!("{LABEL_PROJECT}={}", project.key)];
    let mut images = engine
        .list_images(&filter)
        .await
        .map_err(|source| NameError::Engine {
            op: format!("listing images for project {}", project.key),
            source,
        })?;
    images.sort_by(|a, b| b.created.cmp(&a.created));

    if let Some(image) = images.first() {
        let tag = image
            .repo_tags
            .iter()
            .flatten()
            .find(|t| t.as_str() != "<none>:<none>")
            .cloned();
        let resolved = tag.unwrap_or_else(|| image.id.clone());
        debug!(image = %resolved, "resolved project image");
        return Ok(resolved);
    }

    settings
        .default_image
        .clone()
        .or_else(|| project.config.default_image.clone())
        .ok_or(NameError::NoImage)
}
