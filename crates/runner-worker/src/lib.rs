// runner-worker: job and step execution engine.
//
// Architecture:
//   Worker::run_async → JobRunner::run_async → JobExtension::initialize_job
//     → StepsRunner::run_async → ActionRunner → per-kind Handler::run_async

pub mod action_command_manager;
pub mod action_manager;
pub mod action_manifest_manager;
pub mod action_runner;
pub mod command_extensions;
pub mod container;
pub mod directory_manager;
pub mod execution_context;
pub mod expressions;
pub mod handlers;
pub mod issue_matcher;
pub mod job_extension;
pub mod job_runner;
pub mod services;
pub mod steps_context;
pub mod steps_runner;
pub mod variables;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;
