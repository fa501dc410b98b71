//! Navigation modes.
//!
//! Every mode is a pure function of the current key: it names one search in
//! key order (exact, first at or after a bound, last before a bound) and a
//! check on the record that search lands on. Some checks derive a second key
//! that must then be looked up exactly.
//!
//! ```text
//!   1            document root
//!   1.0.1        attribute of 1
//!   1.1          FirstChild(1)
//!   1.1.1
//!   1.2          NextSibling(1.1), LastChild(1)
//!   2            NextDocument(1.2)
//! ```

use bracket_common::types::{DeweyId, ATTRIBUTE_DIVISION};

use crate::buffer::LatchMode;

/// Where to move a cursor, relative to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NavigationMode {
    /// The record with exactly this key.
    ToKey,
    /// The last record before this key: where it would be inserted after.
    ToInsertPos,
    /// The first record of the index.
    First,
    /// The first element child.
    FirstChild,
    /// The last element child.
    LastChild,
    /// The next element sibling.
    NextSibling,
    /// The previous element sibling.
    PrevSibling,
    /// The next attribute of the same element, or an element's first attribute.
    NextAttribute,
    /// The owning element.
    Parent,
    /// The root of the following document.
    NextDocument,
}

/// Outcome of a navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationStatus {
    /// Positioned on the target.
    Found,
    /// The target does not exist.
    NotExistent,
    /// The search ran past the last record.
    AfterLast,
    /// The search ran before the first record.
    BeforeFirst,
}

impl NavigationStatus {
    /// Returns true for [`NavigationStatus::Found`].
    pub fn is_found(self) -> bool {
        matches!(self, Self::Found)
    }
}

/// Access intent of a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    /// Leaves are latched shared.
    #[default]
    Read,
    /// Leaves are latched for update and upgraded to exclusive when the
    /// cursor modifies them.
    Update,
}

impl OpenMode {
    /// Latch mode used on leaves.
    pub fn latch(self) -> LatchMode {
        match self {
            Self::Read => LatchMode::Shared,
            Self::Update => LatchMode::Update,
        }
    }
}

/// One search in key order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Seek {
    /// Exactly this key.
    Exact(DeweyId),
    /// First record with key >= bound.
    AtLeast(DeweyId),
    /// Last record with key < bound.
    Before(DeweyId),
}

/// Check applied to the record a [`Seek`] lands on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Accept {
    /// Any record.
    Any,
    /// An element child of the key.
    ChildOf(DeweyId),
    /// An element sibling of the key.
    SiblingOf(DeweyId),
    /// An attribute of the element.
    AttributeOf(DeweyId),
    /// A descendant whose child-level ancestor is then looked up.
    LastChildOf(DeweyId),
    /// A record whose ancestor at the key's level must be a sibling.
    PrevSiblingOf(DeweyId),
}

/// What to do with the record a search landed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// This is the target.
    Accept,
    /// No target exists.
    Reject,
    /// The target is this other key.
    Exact(DeweyId),
}

/// A search plus its check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Plan {
    pub seek: Seek,
    pub accept: Accept,
}

impl NavigationMode {
    /// Plans the search for this mode from `key`.
    ///
    /// Returns `None` if the target cannot exist (the parent of a document
    /// root).
    pub(crate) fn plan(self, key: &DeweyId) -> Option<Plan> {
        let (seek, accept) = match self {
            Self::ToKey => (Seek::Exact(key.clone()), Accept::Any),
            Self::ToInsertPos => (Seek::Before(key.clone()), Accept::Any),
            Self::First => (Seek::AtLeast(DeweyId::document(0)), Accept::Any),
            Self::FirstChild => (
                Seek::AtLeast(key.first_child_bound()),
                Accept::ChildOf(key.clone()),
            ),
            Self::LastChild => (
                Seek::Before(key.subtree_bound()),
                Accept::LastChildOf(key.clone()),
            ),
            Self::NextSibling => (
                Seek::AtLeast(key.subtree_bound()),
                Accept::SiblingOf(key.clone()),
            ),
            Self::PrevSibling => (Seek::Before(key.clone()), Accept::PrevSiblingOf(key.clone())),
            Self::NextAttribute => {
                if key.is_attribute() {
                    let owner = key.parent()?;
                    (Seek::AtLeast(key.subtree_bound()), Accept::AttributeOf(owner))
                } else {
                    (
                        Seek::AtLeast(key.child(ATTRIBUTE_DIVISION)),
                        Accept::AttributeOf(key.clone()),
                    )
                }
            }
            Self::Parent => (Seek::Exact(key.parent()?), Accept::Any),
            Self::NextDocument => (Seek::AtLeast(key.next_document_bound()), Accept::Any),
        };
        Some(Plan { seek, accept })
    }
}

impl Accept {
    /// Judges the record a search landed on.
    pub(crate) fn judge(&self, found: &DeweyId) -> Verdict {
        let verdict = |ok: bool| if ok { Verdict::Accept } else { Verdict::Reject };
        match self {
            Self::Any => Verdict::Accept,
            Self::ChildOf(key) => verdict(key.is_parent_of(found)),
            Self::SiblingOf(key) => verdict(key.is_sibling_of(found)),
            Self::AttributeOf(owner) => {
                verdict(found.is_attribute() && found.parent().as_ref() == Some(owner))
            }
            Self::LastChildOf(key) => {
                if !key.is_ancestor_of(found) {
                    return Verdict::Reject;
                }
                let child = found.truncate(key.level() + 1);
                if !key.is_parent_of(&child) {
                    return Verdict::Reject;
                }
                if &child == found {
                    Verdict::Accept
                } else {
                    Verdict::Exact(child)
                }
            }
            Self::PrevSiblingOf(key) => {
                if found.level() < key.level() {
                    return Verdict::Reject;
                }
                let sibling = found.truncate(key.level());
                let is_element = sibling.divisions().last() != Some(&ATTRIBUTE_DIVISION);
                if !is_element || !sibling.is_sibling_of(key) {
                    return Verdict::Reject;
                }
                if &sibling == found {
                    Verdict::Accept
                } else {
                    Verdict::Exact(sibling)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> DeweyId {
        s.parse().unwrap()
    }

    fn judge(mode: NavigationMode, from: &str, found: &str) -> Verdict {
        mode.plan(&key(from)).unwrap().accept.judge(&key(found))
    }

    #[test]
    fn test_plans() {
        let plan = NavigationMode::FirstChild.plan(&key("1")).unwrap();
        assert_eq!(plan.seek, Seek::AtLeast(key("1.1")));

        let plan = NavigationMode::NextSibling.plan(&key("1.1")).unwrap();
        assert_eq!(plan.seek, Seek::AtLeast(key("1.2")));

        let plan = NavigationMode::NextDocument.plan(&key("1.7.3")).unwrap();
        assert_eq!(plan.seek, Seek::AtLeast(key("2")));

        assert!(NavigationMode::Parent.plan(&key("4")).is_none());
        let plan = NavigationMode::Parent.plan(&key("1.0.3")).unwrap();
        assert_eq!(plan.seek, Seek::Exact(key("1")));
    }

    #[test]
    fn test_first_child_and_sibling_checks() {
        assert_eq!(judge(NavigationMode::FirstChild, "1", "1.1"), Verdict::Accept);
        assert_eq!(judge(NavigationMode::FirstChild, "1", "2"), Verdict::Reject);
        assert_eq!(judge(NavigationMode::NextSibling, "1.1", "1.2"), Verdict::Accept);
        assert_eq!(judge(NavigationMode::NextSibling, "1.2", "2"), Verdict::Reject);
    }

    #[test]
    fn test_last_child_derives_child_key() {
        assert_eq!(
            judge(NavigationMode::LastChild, "1", "1.3.4.1"),
            Verdict::Exact(key("1.3"))
        );
        assert_eq!(judge(NavigationMode::LastChild, "1", "1.3"), Verdict::Accept);
        // only attributes below the element
        assert_eq!(judge(NavigationMode::LastChild, "1", "1.0.2"), Verdict::Reject);
        assert_eq!(judge(NavigationMode::LastChild, "1", "1"), Verdict::Reject);
    }

    #[test]
    fn test_prev_sibling_skips_attributes_and_ancestors() {
        assert_eq!(
            judge(NavigationMode::PrevSibling, "1.3", "1.2.5"),
            Verdict::Exact(key("1.2"))
        );
        assert_eq!(judge(NavigationMode::PrevSibling, "1.3", "1.2"), Verdict::Accept);
        assert_eq!(judge(NavigationMode::PrevSibling, "1.1", "1.0.1"), Verdict::Reject);
        assert_eq!(judge(NavigationMode::PrevSibling, "1.1", "1"), Verdict::Reject);
    }

    #[test]
    fn test_next_attribute() {
        assert_eq!(judge(NavigationMode::NextAttribute, "1", "1.0.1"), Verdict::Accept);
        assert_eq!(judge(NavigationMode::NextAttribute, "1.0.1", "1.0.2"), Verdict::Accept);
        assert_eq!(judge(NavigationMode::NextAttribute, "1.0.2", "1.1"), Verdict::Reject);
    }
}
