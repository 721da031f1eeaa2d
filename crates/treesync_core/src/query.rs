//! Query predicates over nodes.
//!
//! Only the filters the data model needs are supported: equality and
//! membership on `owner_id`, equality on `is_root`, and conjunction.

use crate::node::NodeRecord;
use crate::types::OwnerId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A filter over nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Predicate {
    /// Matches every node.
    All,
    /// `owner_id == owner`
    OwnerEq(OwnerId),
    /// `owner_id IN owners`
    OwnerIn(Vec<OwnerId>),
    /// `is_root == flag`
    IsRoot(bool),
    /// Every inner predicate matches.
    And(Vec<Predicate>),
}

impl Predicate {
    /// All nodes of `owner`.
    #[must_use]
    pub fn owned_by(owner: &OwnerId) -> Self {
        Predicate::OwnerEq(owner.clone())
    }

    /// The root node of `owner`.
    #[must_use]
    pub fn root_of(owner: &OwnerId) -> Self {
        Predicate::And(vec![
            Predicate::OwnerEq(owner.clone()),
            Predicate::IsRoot(true),
        ])
    }

    /// Conjunction of `self` and `other`.
    #[must_use]
    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And(mut parts) => {
                parts.push(other);
                Predicate::And(parts)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    /// Evaluates the predicate against a field view of a node.
    #[must_use]
    pub fn matches_fields(&self, owner: &OwnerId, is_root: bool) -> bool {
        match self {
            Predicate::All => true,
            Predicate::OwnerEq(expected) => owner == expected,
            Predicate::OwnerIn(owners) => owners.contains(owner),
            Predicate::IsRoot(flag) => is_root == *flag,
            Predicate::And(parts) => parts.iter().all(|p| p.matches_fields(owner, is_root)),
        }
    }

    /// Evaluates the predicate against a record.
    #[must_use]
    pub fn matches(&self, record: &NodeRecord) -> bool {
        self.matches_fields(&record.owner_id, record.is_root)
    }

    /// Returns true if every node the predicate can match is owned by
    /// `owner`.
    #[must_use]
    pub fn confined_to(&self, owner: &OwnerId) -> bool {
        match self {
            Predicate::All | Predicate::IsRoot(_) => false,
            Predicate::OwnerEq(expected) => expected == owner,
            Predicate::OwnerIn(owners) => !owners.is_empty() && owners.iter().all(|o| o == owner),
            Predicate::And(parts) => parts.iter().any(|p| p.confined_to(owner)),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::All => f.write_str("TRUEPREDICATE"),
            Predicate::OwnerEq(owner) => write!(f, "owner_id == '{owner}'"),
            Predicate::OwnerIn(owners) => {
                f.write_str("owner_id IN {")?;
                for (i, owner) in owners.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "'{owner}'")?;
                }
                f.write_str("}")
            }
            Predicate::IsRoot(flag) => write!(f, "is_root == {flag}"),
            Predicate::And(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" AND ")?;
                    }
                    write!(f, "({part})")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_predicate_needs_owner_and_flag() {
        let alice = OwnerId::from("alice");
        let pred = Predicate::root_of(&alice);
        assert!(pred.matches_fields(&alice, true));
        assert!(!pred.matches_fields(&alice, false));
        assert!(!pred.matches_fields(&OwnerId::from("bob"), true));
    }

    #[test]
    fn membership() {
        let pred = Predicate::OwnerIn(vec!["a".into(), "b".into()]);
        assert!(pred.matches_fields(&"b".into(), false));
        assert!(!pred.matches_fields(&"c".into(), false));
    }

    #[test]
    fn and_flattens() {
        let pred = Predicate::root_of(&"alice".into()).and(Predicate::All);
        match pred {
            Predicate::And(parts) => assert_eq!(parts.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn confinement() {
        let alice = OwnerId::from("alice");
        assert!(Predicate::owned_by(&alice).confined_to(&alice));
        assert!(Predicate::root_of(&alice).confined_to(&alice));
        assert!(!Predicate::All.confined_to(&alice));
        assert!(!Predicate::OwnerIn(vec!["alice".into(), "bob".into()]).confined_to(&alice));
        assert!(!Predicate::OwnerIn(vec![]).confined_to(&alice));
    }

    #[test]
    fn display_reads_like_a_query() {
        let pred = Predicate::root_of(&"alice".into());
        assert_eq!(pred.to_string(), "(owner_id == 'alice') AND (is_root == true)");
    }
}
