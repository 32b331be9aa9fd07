//! Materialized-path referral tree.
//!
//! Every user carries a stable label and the labels of all its ancestors,
//! nearest first: `upline[0]` is the direct referrer, `upline[1]` the
//! referrer's referrer, and so on. A user `level` levels below `X` is any user
//! whose `upline[level - 1] == X`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vaultledger_core::{DomainError, DomainResult, UserId};

/// A node label in the referral tree (`[A-Za-z0-9_]+`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UplineLabel(String);

impl UplineLabel {
    /// Label derived from the user id.
    pub fn for_user(user_id: UserId) -> Self {
        Self(user_id.as_uuid().simple().to_string())
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(DomainError::validation(format!("invalid upline label: {s:?}")));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for UplineLabel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ancestors of a user, nearest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UplinePath(Vec<UplineLabel>);

impl UplinePath {
    pub fn from_labels(labels: Vec<UplineLabel>) -> Self {
        Self(labels)
    }

    /// Path of a user referred by `referrer`.
    pub fn below(referrer: &UserAccount) -> Self {
        let mut labels = Vec::with_capacity(referrer.upline.0.len() + 1);
        labels.push(referrer.upline_label.clone());
        labels.extend(referrer.upline.0.iter().cloned());
        Self(labels)
    }

    /// Direct referrer, if any.
    pub fn referrer(&self) -> Option<&UplineLabel> {
        self.0.first()
    }

    pub fn ancestors(&self) -> &[UplineLabel] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn has_ancestor_at(&self, label: &UplineLabel, level: usize) -> bool {
        level >= 1 && self.0.get(level - 1) == Some(label)
    }
}

/// The referral-relevant part of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: UserId,
    pub upline_label: UplineLabel,
    pub upline: UplinePath,
    pub joined_at: DateTime<Utc>,
}

impl UserAccount {
    pub fn register(referrer: Option<&UserAccount>, joined_at: DateTime<Utc>) -> Self {
        let id = UserId::new();
        Self {
            id,
            upline_label: UplineLabel::for_user(id),
            upline: referrer.map(UplinePath::below).unwrap_or_default(),
            joined_at,
        }
    }

    /// Whole days since the user joined.
    pub fn days_since_joined(&self, now: DateTime<Utc>) -> i64 {
        (now - self.joined_at).num_days()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_grow_nearest_first() {
        let now = Utc::now();
        let root = UserAccount::register(None, now);
        let child = UserAccount::register(Some(&root), now);
        let grandchild = UserAccount::register(Some(&child), now);

        assert_eq!(root.upline.referrer(), None);
        assert_eq!(grandchild.upline.referrer(), Some(&child.upline_label));
        assert_eq!(grandchild.upline.depth(), 2);
        assert!(grandchild.upline.has_ancestor_at(&root.upline_label, 2));
        assert!(!grandchild.upline.has_ancestor_at(&root.upline_label, 1));
        assert!(!grandchild.upline.has_ancestor_at(&root.upline_label, 0));
    }

    #[test]
    fn labels_reject_path_syntax() {
        assert!(UplineLabel::parse("def_1").is_ok());
        assert!(UplineLabel::parse("").is_err());
        assert!(UplineLabel::parse("abc.def").is_err());
        assert!(UplineLabel::parse("a-b").is_err());
    }
}
