use serde::{Deserialize, Serialize};

use super::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueLevel {
    Info,
    Warning,
    Error,
}

impl IssueLevel {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            IssueLevel::Info => "info",
            IssueLevel::Warning => "warning",
            IssueLevel::Error => "error",
        }
    }

    pub(crate) fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "info" => Ok(IssueLevel::Info),
            "warning" => Ok(IssueLevel::Warning),
            "error" => Ok(IssueLevel::Error),
            other => Err(StoreError::InvalidState(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueChoice {
    Retry,
    Cancel,
    Overwrite,
    KeepBoth,
}

impl IssueChoice {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            IssueChoice::Retry => "retry",
            IssueChoice::Cancel => "cancel",
            IssueChoice::Overwrite => "overwrite",
            IssueChoice::KeepBoth => "keep_both",
        }
    }

    pub(crate) fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "retry" => Ok(IssueChoice::Retry),
            "cancel" => Ok(IssueChoice::Cancel),
            "overwrite" => Ok(IssueChoice::Overwrite),
            "keep_both" => Ok(IssueChoice::KeepBoth),
            other => Err(StoreError::InvalidState(other.to_string())),
        }
    }
}

/// A problem the user has to see, and optionally decide on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub level: IssueLevel,
    pub title: String,
    pub description: String,
    pub choices: Vec<IssueChoice>,
}

impl Issue {
    pub fn error(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            level: IssueLevel::Error,
            title: title.into(),
            description: description.into(),
            choices: vec![IssueChoice::Retry, IssueChoice::Cancel],
        }
    }

    pub fn warning(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            level: IssueLevel::Warning,
            title: title.into(),
            description: description.into(),
            choices: Vec::new(),
        }
    }

    pub fn with_choices(mut self, choices: &[IssueChoice]) -> Self {
        self.choices = choices.to_vec();
        self
    }

    pub fn needs_answer(&self) -> bool {
        !self.choices.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRecord {
    pub issue_id: i64,
    pub partition_id: String,
    pub record_id: Option<i64>,
    pub issue: Issue,
    pub answer: Option<IssueChoice>,
    pub created: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_issues_offer_retry_and_cancel() {
        let issue = Issue::error("Upload failed", "disk full");
        assert_eq!(issue.level, IssueLevel::Error);
        assert!(issue.needs_answer());
        assert!(issue.choices.contains(&IssueChoice::Cancel));
    }

    #[test]
    fn warnings_need_no_answer() {
        assert!(!Issue::warning("Partial copy", "2 of 3 copied").needs_answer());
    }

    #[test]
    fn choice_strings_parse_back() {
        for choice in [
            IssueChoice::Retry,
            IssueChoice::Cancel,
            IssueChoice::Overwrite,
            IssueChoice::KeepBoth,
        ] {
            assert_eq!(IssueChoice::parse(choice.as_str()).unwrap(), choice);
        }
    }
}
