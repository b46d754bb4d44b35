// StepsRunner: drains the job-steps queue, then the post-job stack (most
// recently registered first). Each step gets its own child context, its
// condition evaluated against the job status, and a timeout; its result is
// merged into the job result.

use anyhow::Result;
use runner_common::constants::DEFAULT_STEP_TIMEOUT_MINUTES;
use runner_common::util::task_result_util::{TaskResult, TaskResultUtil};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::execution_context::{ExecutionContext, IStep};

pub struct StepsRunner;

impl StepsRunner {
    pub fn new() -> Self {
        Self
    }

    pub async fn run_async(&self, job: &mut ExecutionContext) -> Result<()> {
        loop {
            let step = match job.dequeue_job_step() {
                Some(step) => step,
                None => match job.pop_post_job_step() {
                    Some(step) => step,
                    None => break,
                },
            };
            self.run_step(job, step).await;
        }
        Ok(())
    }

    async fn run_step(&self, job: &mut ExecutionContext, step: Arc<dyn IStep>) {
        let mut context = job.create_child(
            step.display_name(),
            "",
            step.context_name(),
            step.action_id().map(str::to_string),
        );

        match context.evaluate_condition(step.condition(), &job.status()) {
            Ok(true) => {}
            Ok(false) => {
                context.debug("Skipping step due to condition evaluation.");
                context.complete(Some(TaskResult::Skipped));
                tracing::debug!(step = %step.display_name(), "skipped");
                return;
            }
            Err(e) => {
                context.error(&format!("Error evaluating 'if' of step '{}': {e}", step.display_name()));
                let result = context.complete(Some(TaskResult::Failed));
                job.set_result(TaskResultUtil::merge_task_results(job.result(), result));
                return;
            }
        }

        context.start();
        tracing::info!(step = %step.display_name(), "Starting step");

        let minutes = step
            .timeout_in_minutes()
            .filter(|m| *m > 0)
            .unwrap_or(DEFAULT_STEP_TIMEOUT_MINUTES);
        let timeout = Duration::from_secs(u64::from(minutes) * 60);
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = {
            let step_token = context.cancel_token();
            let job_token = job.cancel_token();
            // Steps that run after the job was cancelled (`always()`) are not
            // cancelled by it again.
            let follow_job = !job_token.is_cancelled();
            let timed_out = Arc::clone(&timed_out);
            tokio::spawn(async move {
                tokio::select! {
                    _ = job_token.cancelled(), if follow_job => {}
                    _ = tokio::time::sleep(timeout) => timed_out.store(true, Ordering::SeqCst),
                    _ = step_token.cancelled() => return,
                }
                step_token.cancel();
            })
        };

        let outcome = step.run_async(&mut context).await;
        watchdog.abort();

        if let Err(e) = outcome {
            if context.cancel_token().is_cancelled() {
                if timed_out.load(Ordering::SeqCst) {
                    context.error(&format!("The action has timed out after {minutes} minutes."));
                    context.set_result(TaskResult::Failed);
                } else {
                    context.error("The operation was canceled.");
                    context.set_result(TaskResult::Canceled);
                }
                context.debug(&format!("{e:#}"));
            } else {
                context.error_chain(&e);
                context.set_result(TaskResult::Failed);
            }
        }

        context.fold_command_result();
        context.apply_continue_on_error(step.continue_on_error());
        let result = context.complete(None);
        tracing::info!(step = %step.display_name(), %result, "Finished step");

        if result != TaskResult::Skipped {
            job.set_result(TaskResultUtil::merge_task_results(job.result(), result));
        }
    }
}
