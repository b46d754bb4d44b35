// ContainerInfo: a job or step container and the host/container path mappings
// used to translate file paths that cross the container boundary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use runner_common::constants::pipeline::DOCKER_PREFIX;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Image reference without the `docker://` prefix.
    pub image: String,

    /// Set once the container has been created.
    pub container_id: Option<String>,

    pub container_name: String,

    pub environment: HashMap<String, String>,

    /// Host path prefix to container path prefix.
    pub path_mappings: Vec<(PathBuf, PathBuf)>,

    pub is_job_container: bool,
}

impl ContainerInfo {
    pub fn new(image: impl AsRef<str>) -> Self {
        let image = image.as_ref();
        Self {
            image: image.strip_prefix(DOCKER_PREFIX).unwrap_or(image).to_string(),
            ..Self::default()
        }
    }

    pub fn add_path_mapping(&mut self, host: impl Into<PathBuf>, container: impl Into<PathBuf>) {
        self.path_mappings.push((host.into(), container.into()));
    }

    /// Map a host path into the container. Paths outside every mapping are
    /// returned unchanged.
    pub fn translate_to_container_path(&self, host_path: &Path) -> PathBuf {
        self.path_mappings
            .iter()
            .find_map(|(host, container)| {
                host_path
                    .strip_prefix(host)
                    .ok()
                    .map(|rest| join_non_empty(container, rest))
            })
            .unwrap_or_else(|| host_path.to_path_buf())
    }

    /// Map a container path back to the host.
    pub fn translate_to_host_path(&self, container_path: &Path) -> PathBuf {
        self.path_mappings
            .iter()
            .find_map(|(host, container)| {
                container_path
                    .strip_prefix(container)
                    .ok()
                    .map(|rest| join_non_empty(host, rest))
            })
            .unwrap_or_else(|| container_path.to_path_buf())
    }
}

fn join_non_empty(base: &Path, rest: &Path) -> PathBuf {
    if rest.as_os_str().is_empty() {
        base.to_path_buf()
    } else {
        base.join(rest)
    }
}
