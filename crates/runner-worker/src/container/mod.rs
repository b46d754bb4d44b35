// Container model and the container-engine abstraction.

pub mod container_info;
pub mod container_runtime;

pub use container_info::ContainerInfo;
pub use container_runtime::{ContainerRunOptions, ContainerRuntime, DockerContainerRuntime};
