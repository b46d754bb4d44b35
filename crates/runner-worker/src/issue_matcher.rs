// IssueMatcher: regex problem matchers that turn step output into issues.
// Configuration is the `problemMatcher` JSON format; a matcher is one or more
// patterns, where a multi-pattern matcher carries captured fields forward
// from line to line and may loop on its last pattern.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::{Duration, Instant};

use runner_sdk::IOUtil;

/// Upper bound for a compiled pattern, keeps hostile configs from exhausting memory.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A matcher configuration that cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatcherConfigError {
    #[error("Owner must not be empty")]
    EmptyOwner,

    #[error("Matcher '{owner}' contains unexpected default severity '{severity}'")]
    UnexpectedSeverity { owner: String, severity: String },

    #[error("Matcher '{0}' does not contain any patterns")]
    NoPatterns(String),

    #[error("Only the last pattern in a multiline matcher may set 'loop'")]
    LoopNotLast,

    #[error("The loop pattern must set 'message'")]
    LoopWithoutMessage,

    #[error("The property '{0}' is set twice")]
    PropertySetTwice(&'static str),

    #[error("The property '{property}' is set to {value} which is out of range")]
    OutOfRange { property: &'static str, value: i64 },

    #[error("At least one pattern must set 'message'")]
    NoMessage,

    #[error("Duplicate owner name '{0}'")]
    DuplicateOwner(String),

    #[error("Matcher '{owner}' has an invalid regular expression: {message}")]
    InvalidRegex { owner: String, message: String },
}

/// A single match attempt ran past the matcher's time budget.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Matching '{owner}' took longer than {timeout:?}")]
pub struct MatchTimeout {
    pub owner: String,
    pub timeout: Duration,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// The root of a matcher file: `{"problemMatcher": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueMatchersConfig {
    #[serde(rename = "problemMatcher", default)]
    pub matchers: Vec<IssueMatcherConfig>,
}

impl IssueMatchersConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        IOUtil::load_object(path)
    }

    /// Validate every matcher and reject owners that repeat (case-insensitive).
    pub fn validate(&self) -> Result<(), MatcherConfigError> {
        let mut owners = HashSet::new();
        for matcher in &self.matchers {
            if !owners.insert(matcher.owner.to_lowercase()) {
                return Err(MatcherConfigError::DuplicateOwner(matcher.owner.clone()));
            }
            matcher.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueMatcherConfig {
    #[serde(default)]
    pub owner: String,

    /// Default severity: empty, `error` or `warning`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,

    #[serde(rename = "pattern", default)]
    pub patterns: Vec<IssuePatternConfig>,
}

impl IssueMatcherConfig {
    /// A pattern-less config naming only an owner. Used to announce removals.
    pub fn owner_only(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), MatcherConfigError> {
        if self.owner.is_empty() {
            return Err(MatcherConfigError::EmptyOwner);
        }

        let severity = self.severity.clone().unwrap_or_default();
        match severity.to_lowercase().as_str() {
            "" | "error" | "warning" => {}
            _ => {
                return Err(MatcherConfigError::UnexpectedSeverity {
                    owner: self.owner.clone(),
                    severity,
                })
            }
        }

        if self.patterns.is_empty() {
            return Err(MatcherConfigError::NoPatterns(self.owner.clone()));
        }

        let mut seen = FieldIndexes::default();
        let last = self.patterns.len() - 1;
        for (i, pattern) in self.patterns.iter().enumerate() {
            pattern.validate(&self.owner, i == 0, i == last, &mut seen)?;
        }

        if seen.message.is_none() {
            return Err(MatcherConfigError::NoMessage);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuePatternConfig {
    #[serde(rename = "regexp", default)]
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_path: Option<i64>,
    #[serde(rename = "loop", default)]
    pub is_loop: bool,
}

/// Capture indexes already claimed by earlier patterns.
#[derive(Default)]
struct FieldIndexes {
    file: Option<i64>,
    line: Option<i64>,
    column: Option<i64>,
    severity: Option<i64>,
    code: Option<i64>,
    message: Option<i64>,
    from_path: Option<i64>,
}

impl IssuePatternConfig {
    fn validate(
        &self,
        owner: &str,
        is_first: bool,
        is_last: bool,
        seen: &mut FieldIndexes,
    ) -> Result<(), MatcherConfigError> {
        if self.is_loop && (is_first || !is_last) {
            return Err(MatcherConfigError::LoopNotLast);
        }
        if self.is_loop && self.message.is_none() {
            return Err(MatcherConfigError::LoopWithoutMessage);
        }

        let group_count = compile(owner, &self.pattern)?.captures_len() as i64;
        claim("file", group_count, self.file, &mut seen.file)?;
        claim("line", group_count, self.line, &mut seen.line)?;
        claim("column", group_count, self.column, &mut seen.column)?;
        claim("severity", group_count, self.severity, &mut seen.severity)?;
        claim("code", group_count, self.code, &mut seen.code)?;
        claim("message", group_count, self.message, &mut seen.message)?;
        claim("fromPath", group_count, self.from_path, &mut seen.from_path)?;
        Ok(())
    }
}

fn claim(
    property: &'static str,
    group_count: i64,
    value: Option<i64>,
    tracked: &mut Option<i64>,
) -> Result<(), MatcherConfigError> {
    let Some(value) = value else {
        return Ok(());
    };
    if tracked.is_some() {
        return Err(MatcherConfigError::PropertySetTwice(property));
    }
    if value < 0 || value >= group_count {
        return Err(MatcherConfigError::OutOfRange { property, value });
    }
    *tracked = Some(value);
    Ok(())
}

fn compile(owner: &str, pattern: &str) -> Result<Regex, MatcherConfigError> {
    RegexBuilder::new(pattern)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|e| MatcherConfigError::InvalidRegex {
            owner: owner.to_string(),
            message: e.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Fields captured for one issue. `None` means no pattern captures the field;
/// a configured group that did not participate yields an empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssueMatch {
    pub file: Option<String>,
    pub line: Option<String>,
    pub column: Option<String>,
    pub severity: Option<String>,
    pub code: Option<String>,
    pub message: Option<String>,
    pub from_path: Option<String>,
}

impl IssueMatch {
    fn new(
        running: Option<&IssueMatch>,
        pattern: &IssuePattern,
        captures: &regex::Captures<'_>,
        default_severity: Option<&str>,
    ) -> Self {
        let take = |prior: Option<&Option<String>>, index: Option<usize>| {
            prior
                .and_then(|p| p.clone())
                .or_else(|| group_value(captures, index))
        };
        let mut matched = Self {
            file: take(running.map(|r| &r.file), pattern.file),
            line: take(running.map(|r| &r.line), pattern.line),
            column: take(running.map(|r| &r.column), pattern.column),
            severity: take(running.map(|r| &r.severity), pattern.severity),
            code: take(running.map(|r| &r.code), pattern.code),
            message: take(running.map(|r| &r.message), pattern.message),
            from_path: take(running.map(|r| &r.from_path), pattern.from_path),
        };

        if let Some(default) = default_severity.filter(|d| !d.is_empty()) {
            if matched.severity.as_deref().map_or(true, str::is_empty) {
                matched.severity = Some(default.to_string());
            }
        }
        matched
    }
}

fn group_value(captures: &regex::Captures<'_>, index: Option<usize>) -> Option<String> {
    let index = index?;
    if index >= captures.len() {
        return None;
    }
    Some(captures.get(index).map_or(String::new(), |m| m.as_str().to_string()))
}

#[derive(Debug, Clone)]
struct IssuePattern {
    regex: Regex,
    file: Option<usize>,
    line: Option<usize>,
    column: Option<usize>,
    severity: Option<usize>,
    code: Option<usize>,
    message: Option<usize>,
    from_path: Option<usize>,
    is_loop: bool,
}

impl IssuePattern {
    fn new(owner: &str, config: &IssuePatternConfig) -> Result<Self, MatcherConfigError> {
        let index = |v: Option<i64>| v.and_then(|i| usize::try_from(i).ok());
        Ok(Self {
            regex: compile(owner, &config.pattern)?,
            file: index(config.file),
            line: index(config.line),
            column: index(config.column),
            severity: index(config.severity),
            code: index(config.code),
            message: index(config.message),
            from_path: index(config.from_path),
            is_loop: config.is_loop,
        })
    }
}

/// A compiled matcher plus its in-progress multi-line state.
///
/// `state[i]` holds the accumulated match after pattern `i` for a chain that
/// is still open; it only ever has `patterns.len() - 1` slots because a match
/// of the last pattern completes the chain.
#[derive(Debug, Clone)]
pub struct IssueMatcher {
    owner: String,
    default_severity: String,
    patterns: Vec<IssuePattern>,
    state: Vec<Option<IssueMatch>>,
    timeout: Duration,
}

impl IssueMatcher {
    pub fn new(config: &IssueMatcherConfig, timeout: Duration) -> Result<Self, MatcherConfigError> {
        let patterns = config
            .patterns
            .iter()
            .map(|p| IssuePattern::new(&config.owner, p))
            .collect::<Result<Vec<_>, _>>()?;
        if patterns.is_empty() {
            return Err(MatcherConfigError::NoPatterns(config.owner.clone()));
        }

        let mut matcher = Self {
            owner: config.owner.clone(),
            default_severity: config.severity.clone().unwrap_or_default(),
            patterns,
            state: Vec::new(),
            timeout,
        };
        matcher.reset();
        Ok(matcher)
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Drop any partially matched chain.
    pub fn reset(&mut self) {
        self.state = vec![None; self.patterns.len() - 1];
    }

    /// Whether a multi-line chain is open.
    pub fn is_mid_sequence(&self) -> bool {
        self.state.iter().any(Option::is_some)
    }

    /// Feed one line.
    ///
    /// Returns the completed match, if the line completes one. On timeout the
    /// state is left exactly as it was before the call.
    pub fn try_match(&mut self, line: &str) -> Result<Option<IssueMatch>, MatchTimeout> {
        let started = Instant::now();

        if self.patterns.len() == 1 {
            let pattern = &self.patterns[0];
            let captures = pattern.regex.captures(line);
            self.check_budget(started)?;
            return Ok(captures.map(|c| {
                IssueMatch::new(None, pattern, &c, Some(&self.default_severity))
            }));
        }

        let snapshot = self.state.clone();
        match self.match_chain(line, started) {
            Ok(result) => Ok(result),
            Err(timeout) => {
                self.state = snapshot;
                Err(timeout)
            }
        }
    }

    /// Later stages are tried first so a loop pattern sees its running match
    /// before an earlier stage overwrites it.
    fn match_chain(
        &mut self,
        line: &str,
        started: Instant,
    ) -> Result<Option<IssueMatch>, MatchTimeout> {
        let last = self.patterns.len() - 1;
        for i in (0..=last).rev() {
            let running = if i > 0 { self.state[i - 1].clone() } else { None };
            if i > 0 && running.is_none() {
                continue;
            }

            let pattern = &self.patterns[i];
            let captures = pattern.regex.captures(line);
            self.check_budget(started)?;

            match captures {
                Some(captures) if i == last => {
                    let matched = IssueMatch::new(
                        running.as_ref(),
                        pattern,
                        &captures,
                        Some(&self.default_severity),
                    );
                    let is_loop = pattern.is_loop;
                    self.reset();
                    if is_loop {
                        self.state[i - 1] = running;
                    }
                    return Ok(Some(matched));
                }
                Some(captures) => {
                    self.state[i] = Some(IssueMatch::new(running.as_ref(), pattern, &captures, None));
                }
                None if i == last => self.state[i - 1] = None,
                None => self.state[i] = None,
            }
        }
        Ok(None)
    }

    fn check_budget(&self, started: Instant) -> Result<(), MatchTimeout> {
        if started.elapsed() >= self.timeout {
            return Err(MatchTimeout {
                owner: self.owner.clone(),
                timeout: self.timeout,
            });
        }
        Ok(())
    }
}
