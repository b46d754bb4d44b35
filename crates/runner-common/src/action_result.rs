// ActionResult: the step status vocabulary exposed to workflow expressions
// through the `steps` context (`steps.<id>.outcome` / `.conclusion`).

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionResult {
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl ActionResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionResult::Success => "success",
            ActionResult::Failure => "failure",
            ActionResult::Cancelled => "cancelled",
            ActionResult::Skipped => "skipped",
        }
    }
}

impl fmt::Display for ActionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ActionResult::Cancelled).unwrap(), "\"cancelled\"");
        assert_eq!(ActionResult::Failure.to_string(), "failure");
    }
}
