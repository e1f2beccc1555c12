//! Cache keys for Redmine API queries.

use sha2::{Digest, Sha256};

use crate::cache::QueryKey;

/// Prefix shared by every issue query, for bulk invalidation.
pub const ISSUES_PREFIX: &str = "issues:";

/// Query key types for Redmine API calls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RedmineQuery {
  /// The account the API key belongs to
  MyAccount,
  /// Open issues assigned to the current user
  AssignedIssues { project_id: Option<u64> },
  /// Free-text issue search
  IssueSearch { text: String, extended: bool },
  /// A single issue by id
  Issue { id: u64 },
  /// Projects visible to the current user
  Projects,
  /// Activities selectable for time entries
  TimeEntryActivities,
}

impl RedmineQuery {
  /// True for keys produced by issue queries.
  pub fn is_issue_key(key: &str) -> bool {
    key.starts_with(ISSUES_PREFIX)
  }
}

impl QueryKey for RedmineQuery {
  fn cache_key(&self) -> String {
    match self {
      Self::MyAccount => "my_account".to_string(),
      Self::AssignedIssues { project_id } => match project_id {
        Some(id) => format!("{}assigned:{}", ISSUES_PREFIX, id),
        None => format!("{}assigned", ISSUES_PREFIX),
      },
      Self::IssueSearch { text, extended } => {
        // Hashed for stable, fixed-length keys
        let input = format!("{}:{}", extended, normalize_search(text));
        let mut hasher = Sha256::new();
        hasher.update(input.as_bytes());
        format!("{}search:{}", ISSUES_PREFIX, hex::encode(hasher.finalize()))
      }
      Self::Issue { id } => format!("{}detail:{}", ISSUES_PREFIX, id),
      Self::Projects => "projects".to_string(),
      Self::TimeEntryActivities => "time_entry_activities".to_string(),
    }
  }

  fn description(&self) -> String {
    match self {
      Self::MyAccount => "my account".to_string(),
      Self::AssignedIssues { project_id: Some(id) } => format!("assigned issues in project {}", id),
      Self::AssignedIssues { project_id: None } => "assigned issues".to_string(),
      Self::IssueSearch { text, extended } => {
        if *extended {
          format!("issues matching '{}' (all projects)", text)
        } else {
          format!("issues matching '{}'", text)
        }
      }
      Self::Issue { id } => format!("issue #{}", id),
      Self::Projects => "projects".to_string(),
      Self::TimeEntryActivities => "time entry activities".to_string(),
    }
  }
}

/// Normalize search text for consistent hashing.
/// Trims, collapses whitespace and lowercases.
fn normalize_search(text: &str) -> String {
  text
    .split_whitespace()
    .collect::<Vec<_>>()
    .join(" ")
    .to_lowercase()
}
