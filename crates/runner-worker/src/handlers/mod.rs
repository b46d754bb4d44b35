// Handlers: one per action kind, plus the step hosts and output processing
// they share.

pub mod composite_handler;
pub mod container_handler;
pub mod handler;
pub mod node_script_handler;
pub mod output_manager;
pub mod plugin_handler;
pub mod script_handler;
pub mod step_host;
