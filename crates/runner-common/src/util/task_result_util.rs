// TaskResult and the rules for combining step results into a job result.

use serde::{Deserialize, Serialize};

use crate::action_result::ActionResult;

/// Offset added to TaskResult values to produce process return codes.
const RETURN_CODE_OFFSET: i32 = 100;

/// Terminal status of a step or job. Declaration order is severity order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum TaskResult {
    Succeeded = 0,
    SucceededWithIssues = 1,
    Failed = 2,
    Canceled = 3,
    Skipped = 4,
    Abandoned = 5,
}

impl TaskResult {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(TaskResult::Succeeded),
            1 => Some(TaskResult::SucceededWithIssues),
            2 => Some(TaskResult::Failed),
            3 => Some(TaskResult::Canceled),
            4 => Some(TaskResult::Skipped),
            5 => Some(TaskResult::Abandoned),
            _ => None,
        }
    }

    pub fn to_action_result(self) -> ActionResult {
        match self {
            TaskResult::Succeeded | TaskResult::SucceededWithIssues => ActionResult::Success,
            TaskResult::Failed | TaskResult::Abandoned => ActionResult::Failure,
            TaskResult::Canceled => ActionResult::Cancelled,
            TaskResult::Skipped => ActionResult::Skipped,
        }
    }
}

impl std::fmt::Display for TaskResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskResult::Succeeded => "Succeeded",
            TaskResult::SucceededWithIssues => "SucceededWithIssues",
            TaskResult::Failed => "Failed",
            TaskResult::Canceled => "Canceled",
            TaskResult::Skipped => "Skipped",
            TaskResult::Abandoned => "Abandoned",
        };
        f.write_str(name)
    }
}

pub struct TaskResultUtil;

impl TaskResultUtil {
    /// Process exit code the worker reports for a job result.
    pub fn translate_to_return_code(result: TaskResult) -> i32 {
        RETURN_CODE_OFFSET + (result as i32)
    }

    /// Inverse of `translate_to_return_code`; unknown codes mean `Failed`.
    pub fn translate_from_return_code(return_code: i32) -> TaskResult {
        TaskResult::from_i32(return_code - RETURN_CODE_OFFSET).unwrap_or(TaskResult::Failed)
    }

    /// Fold `coming_result` into `current_result`, keeping the worse one.
    ///
    /// Once the current result is worse than `Failed` (canceled, skipped,
    /// abandoned) it sticks.
    pub fn merge_task_results(
        current_result: Option<TaskResult>,
        coming_result: TaskResult,
    ) -> TaskResult {
        match current_result {
            None => coming_result,
            Some(current) if current > TaskResult::Failed => current,
            Some(current) => current.max(coming_result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_codes() {
        assert_eq!(TaskResultUtil::translate_to_return_code(TaskResult::Succeeded), 100);
        assert_eq!(TaskResultUtil::translate_to_return_code(TaskResult::Canceled), 103);
        assert_eq!(TaskResultUtil::translate_from_return_code(102), TaskResult::Failed);
        assert_eq!(TaskResultUtil::translate_from_return_code(999), TaskResult::Failed);
    }

    #[test]
    fn merge_keeps_worst() {
        assert_eq!(TaskResultUtil::merge_task_results(None, TaskResult::Skipped), TaskResult::Skipped);
        assert_eq!(
            TaskResultUtil::merge_task_results(Some(TaskResult::Succeeded), TaskResult::Failed),
            TaskResult::Failed
        );
        assert_eq!(
            TaskResultUtil::merge_task_results(Some(TaskResult::Failed), TaskResult::Succeeded),
            TaskResult::Failed
        );
        assert_eq!(
            TaskResultUtil::merge_task_results(Some(TaskResult::Canceled), TaskResult::Abandoned),
            TaskResult::Canceled
        );
    }

    #[test]
    fn to_action_result() {
        assert_eq!(TaskResult::SucceededWithIssues.to_action_result(), ActionResult::Success);
        assert_eq!(TaskResult::Abandoned.to_action_result(), ActionResult::Failure);
        assert_eq!(TaskResult::Canceled.to_action_result(), ActionResult::Cancelled);
    }
}
