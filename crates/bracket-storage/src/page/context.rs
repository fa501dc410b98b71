//! Tree page contexts.

use bracket_common::types::{DeweyId, PageId, PageKind};

use super::branch::BranchPage;
use super::leaf::LeafPage;

/// Fields shared by leaf and branch pages.
pub trait TreeContext {
    /// Leaf or branch.
    fn kind(&self) -> PageKind;

    /// Root page of the owning index.
    fn root(&self) -> PageId;

    /// Previous page on the same level.
    fn prev(&self) -> Option<PageId>;

    /// Sets the previous pointer.
    fn set_prev(&mut self, prev: Option<PageId>);

    /// Distance from the leaf level.
    fn height(&self) -> u16;

    /// Number of records or separators.
    fn entry_count(&self) -> usize;

    /// Smallest key stored in the page.
    fn first_key(&self) -> Option<&DeweyId>;
}

/// Result of an insert attempt that checks free space first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Inserted at this slot.
    Inserted(usize),
    /// The page cannot take the entry; split and retry.
    NoSpace,
}

impl InsertOutcome {
    /// Returns true for [`InsertOutcome::NoSpace`].
    pub fn is_no_space(&self) -> bool {
        matches!(self, Self::NoSpace)
    }
}

/// A formatted tree page: either shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageContext {
    /// Records.
    Leaf(LeafPage),
    /// Separators.
    Branch(BranchPage),
}

impl PageContext {
    /// Creates an empty context of `kind`.
    pub fn new(kind: PageKind, root: PageId, height: u16) -> Self {
        match kind {
            PageKind::Leaf => Self::Leaf(LeafPage::new(root)),
            PageKind::Branch => Self::Branch(BranchPage::new(root, height)),
        }
    }

    fn inner(&self) -> &dyn TreeContext {
        match self {
            Self::Leaf(leaf) => leaf,
            Self::Branch(branch) => branch,
        }
    }

    /// Returns the leaf, if this is one.
    pub fn as_leaf(&self) -> Option<&LeafPage> {
        match self {
            Self::Leaf(leaf) => Some(leaf),
            Self::Branch(_) => None,
        }
    }

    /// Returns the branch, if this is one.
    pub fn as_branch(&self) -> Option<&BranchPage> {
        match self {
            Self::Branch(branch) => Some(branch),
            Self::Leaf(_) => None,
        }
    }

    pub(super) fn body_len(&self) -> usize {
        match self {
            Self::Leaf(leaf) => leaf.body_len(),
            Self::Branch(branch) => branch.body_len(),
        }
    }
}

impl TreeContext for PageContext {
    fn kind(&self) -> PageKind {
        self.inner().kind()
    }

    fn root(&self) -> PageId {
        self.inner().root()
    }

    fn prev(&self) -> Option<PageId> {
        self.inner().prev()
    }

    fn set_prev(&mut self, prev: Option<PageId>) {
        match self {
            Self::Leaf(leaf) => leaf.set_prev(prev),
            Self::Branch(branch) => branch.set_prev(prev),
        }
    }

    fn height(&self) -> u16 {
        self.inner().height()
    }

    fn entry_count(&self) -> usize {
        self.inner().entry_count()
    }

    fn first_key(&self) -> Option<&DeweyId> {
        self.inner().first_key()
    }
}
