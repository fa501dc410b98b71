//! Typed log operations and their binary encoding.
//!
//! Every operation is encoded as a 1-byte type tag followed by a
//! type-specific, big-endian payload:
//!
//! ```text
//! +-----+--------------------------------------------------+
//! | tag | payload                                          |
//! +-----+--------------------------------------------------+
//!
//! Allocate / Deallocate      page(8) unit(4)
//! DeallocateDeferred         container(4) n(4) {page(8) unit(4)}*n m(4) {unit(4)}*m
//! CreateUnit / DropUnit      container(4) unit(4)
//! Next/Prev/LowPage          page(8) root(8) old(8) new(8)
//! Branch*                    page(8) root(8) key child(8) [new child(8)]
//! Leaf*                      page(8) root(8) record [record]
//! LeafSmo* / Sequence*       page(8) root(8) n(4) {record}*n
//! HighKeyUpdate              page(8) root(8) [flag key] [flag key]
//! Format                     page(8) state(old) state(new)
//! ```
//!
//! A record is `key flag(1) len(4) value`; a key is `count(2) {division(4)}`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use bracket_common::types::{ContainerId, DeweyId, NodeRecord, PageId, PageKind, UnitId};

use crate::error::{LogError, LogResult};

/// Log operation type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperationType {
    /// Transaction commit.
    Commit = 1,
    /// Transaction abort completed.
    Abort = 2,
    /// End of a structure modification (dummy CLR).
    SmoEnd = 3,
    /// Block allocated to a unit.
    Allocate = 11,
    /// Block released from a unit.
    Deallocate = 12,
    /// Batched post-commit reclamation of pages and units.
    DeallocateDeferred = 13,
    /// Unit created.
    CreateUnit = 14,
    /// Unit dropped.
    DropUnit = 15,
    /// Leaf next-page pointer changed.
    NextPage = 31,
    /// Previous-page pointer changed.
    PrevPage = 32,
    /// Branch low-page pointer changed.
    LowPage = 33,
    /// Separator inserted into a branch.
    BranchInsert = 34,
    /// Separator deleted from a branch.
    BranchDelete = 35,
    /// Separator child pointer changed.
    BranchUpdate = 36,
    /// Record inserted into a leaf.
    LeafInsert = 37,
    /// Record deleted from a leaf.
    LeafDelete = 38,
    /// Record value changed.
    LeafUpdate = 39,
    /// Records moved into a leaf by a split.
    LeafSmoInsert = 40,
    /// Records moved out of a leaf by a split.
    LeafSmoDelete = 41,
    /// Leaf high key changed.
    HighKeyUpdate = 42,
    /// Page formatted (type change).
    Format = 43,
    /// Node sequence inserted into a leaf.
    SequenceInsert = 44,
    /// Node sequence deleted from a leaf.
    SequenceDelete = 45,
}

impl OperationType {
    /// Converts the type to its tag byte.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses a tag byte.
    pub fn from_u8(value: u8) -> LogResult<Self> {
        Ok(match value {
            1 => Self::Commit,
            2 => Self::Abort,
            3 => Self::SmoEnd,
            11 => Self::Allocate,
            12 => Self::Deallocate,
            13 => Self::DeallocateDeferred,
            14 => Self::CreateUnit,
            15 => Self::DropUnit,
            31 => Self::NextPage,
            32 => Self::PrevPage,
            33 => Self::LowPage,
            34 => Self::BranchInsert,
            35 => Self::BranchDelete,
            36 => Self::BranchUpdate,
            37 => Self::LeafInsert,
            38 => Self::LeafDelete,
            39 => Self::LeafUpdate,
            40 => Self::LeafSmoInsert,
            41 => Self::LeafSmoDelete,
            42 => Self::HighKeyUpdate,
            43 => Self::Format,
            44 => Self::SequenceInsert,
            45 => Self::SequenceDelete,
            other => return Err(LogError::unknown_operation(other)),
        })
    }

    /// Returns true for operations on block allocation state.
    pub const fn is_page_operation(self) -> bool {
        matches!(
            self,
            Self::Allocate
                | Self::Deallocate
                | Self::DeallocateDeferred
                | Self::CreateUnit
                | Self::DropUnit
        )
    }

    /// Returns true for operations on bracket index pages.
    pub const fn is_index_operation(self) -> bool {
        (self as u8) >= 31 && (self as u8) <= 45
    }
}

/// Pointer field targeted by a pointer update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerField {
    /// Leaf `next` pointer.
    Next,
    /// `previous` pointer (leaf or branch).
    Previous,
    /// Branch low-child pointer.
    Low,
}

impl PointerField {
    /// Operation type used to log this field.
    pub const fn op_type(self) -> OperationType {
        match self {
            Self::Next => OperationType::NextPage,
            Self::Previous => OperationType::PrevPage,
            Self::Low => OperationType::LowPage,
        }
    }
}

impl fmt::Display for PointerField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Next => f.write_str("NEXT"),
            Self::Previous => f.write_str("PREV"),
            Self::Low => f.write_str("LOW"),
        }
    }
}

/// Page-level fields reset by a format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatState {
    /// Leaf or branch.
    pub kind: PageKind,
    /// Owning unit.
    pub unit: UnitId,
    /// Root page of the owning index.
    pub root: PageId,
    /// Height (0 for leaves).
    pub height: u16,
}

impl FormatState {
    const ENCODED_LEN: usize = 1 + 4 + PageId::SIZE + 2;

    /// State of a page that was never formatted. Only its root is checked.
    pub const UNFORMATTED: Self = Self {
        kind: PageKind::Leaf,
        unit: UnitId::NONE,
        root: PageId::NO_PAGE,
        height: 0,
    };

    /// Returns true for [`FormatState::UNFORMATTED`].
    pub fn is_unformatted(&self) -> bool {
        !self.root.is_valid()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind.as_u8());
        buf.put_u32(self.unit.as_u32());
        buf.put_slice(&self.root.to_be_bytes());
        buf.put_u16(self.height);
    }

    fn decode(buf: &mut &[u8]) -> LogResult<Self> {
        need(buf, Self::ENCODED_LEN, "format state")?;
        let flag = buf.get_u8();
        let kind = PageKind::from_u8(flag).ok_or_else(|| LogError::unknown_operation(flag))?;
        let unit = UnitId::new(buf.get_u32());
        let root = get_page(buf)?;
        let height = buf.get_u16();
        Ok(Self {
            kind,
            unit,
            root,
            height,
        })
    }
}

/// A typed, binary-encodable log operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOperation {
    /// Transaction commit.
    Commit,
    /// Transaction abort completed.
    Abort,
    /// Closes a structure modification; logged as a CLR so rollback skips it.
    SmoEnd,
    /// Block allocated to a unit.
    Allocate {
        /// Allocated page.
        page: PageId,
        /// Owning unit.
        unit: UnitId,
    },
    /// Block released from a unit.
    Deallocate {
        /// Released page.
        page: PageId,
        /// Owning unit.
        unit: UnitId,
    },
    /// Batched deferred reclamation.
    DeallocateDeferred {
        /// Container holding all pages and units.
        container: ContainerId,
        /// Pages to release with their owning units.
        pages: Vec<(PageId, UnitId)>,
        /// Units to drop.
        units: Vec<UnitId>,
    },
    /// Unit created.
    CreateUnit {
        /// Container.
        container: ContainerId,
        /// New unit.
        unit: UnitId,
    },
    /// Unit dropped.
    DropUnit {
        /// Container.
        container: ContainerId,
        /// Dropped unit.
        unit: UnitId,
    },
    /// Pointer field update.
    Pointer {
        /// Which pointer.
        field: PointerField,
        /// Updated page.
        page: PageId,
        /// Root of the owning index.
        root: PageId,
        /// Target before the update.
        old: Option<PageId>,
        /// Target after the update.
        new: Option<PageId>,
    },
    /// Separator inserted into a branch.
    BranchInsert {
        /// Branch page.
        page: PageId,
        /// Root of the owning index.
        root: PageId,
        /// Separator key.
        key: DeweyId,
        /// Child for keys at or above the separator.
        child: PageId,
    },
    /// Separator deleted from a branch.
    BranchDelete {
        /// Branch page.
        page: PageId,
        /// Root of the owning index.
        root: PageId,
        /// Separator key.
        key: DeweyId,
        /// Child it pointed to.
        child: PageId,
    },
    /// Separator child pointer changed.
    BranchUpdate {
        /// Branch page.
        page: PageId,
        /// Root of the owning index.
        root: PageId,
        /// Separator key.
        key: DeweyId,
        /// Child before the update.
        old_child: PageId,
        /// Child after the update.
        new_child: PageId,
    },
    /// Record inserted into a leaf.
    LeafInsert {
        /// Leaf page.
        page: PageId,
        /// Root of the owning index.
        root: PageId,
        /// Inserted record.
        record: NodeRecord,
    },
    /// Record deleted from a leaf.
    LeafDelete {
        /// Leaf page.
        page: PageId,
        /// Root of the owning index.
        root: PageId,
        /// Deleted record (before image).
        record: NodeRecord,
    },
    /// Record value changed.
    LeafUpdate {
        /// Leaf page.
        page: PageId,
        /// Root of the owning index.
        root: PageId,
        /// Before image.
        old: NodeRecord,
        /// After image.
        new: NodeRecord,
    },
    /// Records moved into a leaf by a structure modification.
    LeafSmoInsert {
        /// Leaf page.
        page: PageId,
        /// Root of the owning index.
        root: PageId,
        /// Moved records in key order.
        records: Vec<NodeRecord>,
    },
    /// Records moved out of a leaf by a structure modification.
    LeafSmoDelete {
        /// Leaf page.
        page: PageId,
        /// Root of the owning index.
        root: PageId,
        /// Moved records in key order.
        records: Vec<NodeRecord>,
    },
    /// Leaf high key changed.
    HighKeyUpdate {
        /// Leaf page.
        page: PageId,
        /// Root of the owning index.
        root: PageId,
        /// Before image.
        old: Option<DeweyId>,
        /// After image.
        new: Option<DeweyId>,
    },
    /// Page formatted.
    Format {
        /// Formatted page.
        page: PageId,
        /// Fields before the format.
        old: FormatState,
        /// Fields after the format.
        new: FormatState,
    },
    /// Node sequence inserted into a leaf.
    SequenceInsert {
        /// Leaf page.
        page: PageId,
        /// Root of the owning index.
        root: PageId,
        /// Inserted records in key order.
        records: Vec<NodeRecord>,
    },
    /// Node sequence deleted from a leaf.
    SequenceDelete {
        /// Leaf page.
        page: PageId,
        /// Root of the owning index.
        root: PageId,
        /// Deleted records in key order.
        records: Vec<NodeRecord>,
    },
}

impl LogOperation {
    /// Returns the type tag of this operation.
    pub fn op_type(&self) -> OperationType {
        match self {
            Self::Commit => OperationType::Commit,
            Self::Abort => OperationType::Abort,
            Self::SmoEnd => OperationType::SmoEnd,
            Self::Allocate { .. } => OperationType::Allocate,
            Self::Deallocate { .. } => OperationType::Deallocate,
            Self::DeallocateDeferred { .. } => OperationType::DeallocateDeferred,
            Self::CreateUnit { .. } => OperationType::CreateUnit,
            Self::DropUnit { .. } => OperationType::DropUnit,
            Self::Pointer { field, .. } => field.op_type(),
            Self::BranchInsert { .. } => OperationType::BranchInsert,
            Self::BranchDelete { .. } => OperationType::BranchDelete,
            Self::BranchUpdate { .. } => OperationType::BranchUpdate,
            Self::LeafInsert { .. } => OperationType::LeafInsert,
            Self::LeafDelete { .. } => OperationType::LeafDelete,
            Self::LeafUpdate { .. } => OperationType::LeafUpdate,
            Self::LeafSmoInsert { .. } => OperationType::LeafSmoInsert,
            Self::LeafSmoDelete { .. } => OperationType::LeafSmoDelete,
            Self::HighKeyUpdate { .. } => OperationType::HighKeyUpdate,
            Self::Format { .. } => OperationType::Format,
            Self::SequenceInsert { .. } => OperationType::SequenceInsert,
            Self::SequenceDelete { .. } => OperationType::SequenceDelete,
        }
    }

    /// Returns the page this operation modifies, if any.
    pub fn page_id(&self) -> Option<PageId> {
        match self {
            Self::Commit
            | Self::Abort
            | Self::SmoEnd
            | Self::DeallocateDeferred { .. }
            | Self::CreateUnit { .. }
            | Self::DropUnit { .. } => None,
            Self::Allocate { page, .. }
            | Self::Deallocate { page, .. }
            | Self::Pointer { page, .. }
            | Self::BranchInsert { page, .. }
            | Self::BranchDelete { page, .. }
            | Self::BranchUpdate { page, .. }
            | Self::LeafInsert { page, .. }
            | Self::LeafDelete { page, .. }
            | Self::LeafUpdate { page, .. }
            | Self::LeafSmoInsert { page, .. }
            | Self::LeafSmoDelete { page, .. }
            | Self::HighKeyUpdate { page, .. }
            | Self::Format { page, .. }
            | Self::SequenceInsert { page, .. }
            | Self::SequenceDelete { page, .. } => Some(*page),
        }
    }

    /// Returns the root page of the index this operation belongs to.
    pub fn root_page_id(&self) -> Option<PageId> {
        match self {
            Self::Pointer { root, .. }
            | Self::BranchInsert { root, .. }
            | Self::BranchDelete { root, .. }
            | Self::BranchUpdate { root, .. }
            | Self::LeafInsert { root, .. }
            | Self::LeafDelete { root, .. }
            | Self::LeafUpdate { root, .. }
            | Self::LeafSmoInsert { root, .. }
            | Self::LeafSmoDelete { root, .. }
            | Self::HighKeyUpdate { root, .. }
            | Self::SequenceInsert { root, .. }
            | Self::SequenceDelete { root, .. } => Some(*root),
            Self::Format { new, .. } => Some(new.root),
            _ => None,
        }
    }

    /// Returns true if this operation is never undone.
    pub fn is_redo_only(&self) -> bool {
        matches!(
            self,
            Self::Commit | Self::Abort | Self::SmoEnd | Self::DeallocateDeferred { .. }
        )
    }

    /// Returns the operation that reverses this one, or `None` for redo-only
    /// operations.
    ///
    /// Compensation records carry the inverse, so replaying a CLR is an
    /// ordinary redo.
    pub fn inverse(&self) -> Option<LogOperation> {
        let op = match self.clone() {
            Self::Commit | Self::Abort | Self::SmoEnd | Self::DeallocateDeferred { .. } => {
                return None;
            }
            Self::Allocate { page, unit } => Self::Deallocate { page, unit },
            Self::Deallocate { page, unit } => Self::Allocate { page, unit },
            Self::CreateUnit { container, unit } => Self::DropUnit { container, unit },
            Self::DropUnit { container, unit } => Self::CreateUnit { container, unit },
            Self::Pointer {
                field,
                page,
                root,
                old,
                new,
            } => Self::Pointer {
                field,
                page,
                root,
                old: new,
                new: old,
            },
            Self::BranchInsert {
                page,
                root,
                key,
                child,
            } => Self::BranchDelete {
                page,
                root,
                key,
                child,
            },
            Self::BranchDelete {
                page,
                root,
                key,
                child,
            } => Self::BranchInsert {
                page,
                root,
                key,
                child,
            },
            Self::BranchUpdate {
                page,
                root,
                key,
                old_child,
                new_child,
            } => Self::BranchUpdate {
                page,
                root,
                key,
                old_child: new_child,
                new_child: old_child,
            },
            Self::LeafInsert { page, root, record } => Self::LeafDelete { page, root, record },
            Self::LeafDelete { page, root, record } => Self::LeafInsert { page, root, record },
            Self::LeafUpdate {
                page,
                root,
                old,
                new,
            } => Self::LeafUpdate {
                page,
                root,
                old: new,
                new: old,
            },
            Self::LeafSmoInsert {
                page,
                root,
                records,
            } => Self::LeafSmoDelete {
                page,
                root,
                records,
            },
            Self::LeafSmoDelete {
                page,
                root,
                records,
            } => Self::LeafSmoInsert {
                page,
                root,
                records,
            },
            Self::SequenceInsert {
                page,
                root,
                records,
            } => Self::SequenceDelete {
                page,
                root,
                records,
            },
            Self::SequenceDelete {
                page,
                root,
                records,
            } => Self::SequenceInsert {
                page,
                root,
                records,
            },
            Self::HighKeyUpdate {
                page,
                root,
                old,
                new,
            } => Self::HighKeyUpdate {
                page,
                root,
                old: new,
                new: old,
            },
            Self::Format { page, old, new } => Self::Format {
                page,
                old: new,
                new: old,
            },
        };
        Some(op)
    }

    /// Size of the encoding, tag included.
    pub fn encoded_len(&self) -> usize {
        const P: usize = PageId::SIZE;
        let list_len = |list: &[NodeRecord]| -> usize {
            4 + list.iter().map(NodeRecord::encoded_len).sum::<usize>()
        };
        let opt_key = |key: &Option<DeweyId>| 1 + key.as_ref().map_or(0, DeweyId::encoded_len);

        1 + match self {
            Self::Commit | Self::Abort | Self::SmoEnd => 0,
            Self::Allocate { .. } | Self::Deallocate { .. } => P + 4,
            Self::DeallocateDeferred { pages, units, .. } => {
                4 + 4 + pages.len() * (P + 4) + 4 + units.len() * 4
            }
            Self::CreateUnit { .. } | Self::DropUnit { .. } => 8,
            Self::Pointer { .. } => 4 * P,
            Self::BranchInsert { key, .. } | Self::BranchDelete { key, .. } => {
                2 * P + key.encoded_len() + P
            }
            Self::BranchUpdate { key, .. } => 2 * P + key.encoded_len() + 2 * P,
            Self::LeafInsert { record, .. } | Self::LeafDelete { record, .. } => {
                2 * P + record.encoded_len()
            }
            Self::LeafUpdate { old, new, .. } => 2 * P + old.encoded_len() + new.encoded_len(),
            Self::LeafSmoInsert { records, .. }
            | Self::LeafSmoDelete { records, .. }
            | Self::SequenceInsert { records, .. }
            | Self::SequenceDelete { records, .. } => 2 * P + list_len(records),
            Self::HighKeyUpdate { old, new, .. } => 2 * P + opt_key(old) + opt_key(new),
            Self::Format { .. } => P + 2 * FormatState::ENCODED_LEN,
        }
    }

    /// Encodes the operation (tag + payload).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Appends the encoding to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.op_type().as_u8());

        match self {
            Self::Commit | Self::Abort | Self::SmoEnd => {}
            Self::Allocate { page, unit } | Self::Deallocate { page, unit } => {
                buf.put_slice(&page.to_be_bytes());
                buf.put_u32(unit.as_u32());
            }
            Self::DeallocateDeferred {
                container,
                pages,
                units,
            } => {
                buf.put_u32(container.as_u32());
                buf.put_u32(pages.len() as u32);
                for (page, unit) in pages {
                    buf.put_slice(&page.to_be_bytes());
                    buf.put_u32(unit.as_u32());
                }
                buf.put_u32(units.len() as u32);
                for unit in units {
                    buf.put_u32(unit.as_u32());
                }
            }
            Self::CreateUnit { container, unit } | Self::DropUnit { container, unit } => {
                buf.put_u32(container.as_u32());
                buf.put_u32(unit.as_u32());
            }
            Self::Pointer {
                page,
                root,
                old,
                new,
                ..
            } => {
                put_base(buf, *page, *root);
                buf.put_slice(&PageId::encode_opt(*old));
                buf.put_slice(&PageId::encode_opt(*new));
            }
            Self::BranchInsert {
                page,
                root,
                key,
                child,
            }
            | Self::BranchDelete {
                page,
                root,
                key,
                child,
            } => {
                put_base(buf, *page, *root);
                key.encode(buf);
                buf.put_slice(&child.to_be_bytes());
            }
            Self::BranchUpdate {
                page,
                root,
                key,
                old_child,
                new_child,
            } => {
                put_base(buf, *page, *root);
                key.encode(buf);
                buf.put_slice(&old_child.to_be_bytes());
                buf.put_slice(&new_child.to_be_bytes());
            }
            Self::LeafInsert { page, root, record } | Self::LeafDelete { page, root, record } => {
                put_base(buf, *page, *root);
                put_record(buf, record);
            }
            Self::LeafUpdate {
                page,
                root,
                old,
                new,
            } => {
                put_base(buf, *page, *root);
                put_record(buf, old);
                put_record(buf, new);
            }
            Self::LeafSmoInsert {
                page,
                root,
                records,
            }
            | Self::LeafSmoDelete {
                page,
                root,
                records,
            }
            | Self::SequenceInsert {
                page,
                root,
                records,
            }
            | Self::SequenceDelete {
                page,
                root,
                records,
            } => {
                put_base(buf, *page, *root);
                buf.put_u32(records.len() as u32);
                for record in records {
                    put_record(buf, record);
                }
            }
            Self::HighKeyUpdate {
                page,
                root,
                old,
                new,
            } => {
                put_base(buf, *page, *root);
                put_opt_key(buf, old.as_ref());
                put_opt_key(buf, new.as_ref());
            }
            Self::Format { page, old, new } => {
                buf.put_slice(&page.to_be_bytes());
                old.encode(buf);
                new.encode(buf);
            }
        }
    }

    /// Decodes an operation from its encoding.
    ///
    /// Unknown tags fail with [`LogError::UnknownOperation`].
    pub fn decode(bytes: &[u8]) -> LogResult<Self> {
        let mut buf = bytes;
        need(&buf, 1, "operation tag")?;
        let op_type = OperationType::from_u8(buf.get_u8())?;
        let buf = &mut buf;

        Ok(match op_type {
            OperationType::Commit => Self::Commit,
            OperationType::Abort => Self::Abort,
            OperationType::SmoEnd => Self::SmoEnd,
            OperationType::Allocate => {
                let (page, unit) = get_page_unit(buf)?;
                Self::Allocate { page, unit }
            }
            OperationType::Deallocate => {
                let (page, unit) = get_page_unit(buf)?;
                Self::Deallocate { page, unit }
            }
            OperationType::DeallocateDeferred => {
                let container = ContainerId::new(get_u32(buf, "container id")?);
                let count = get_u32(buf, "page count")? as usize;
                let mut pages = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    pages.push(get_page_unit(buf)?);
                }
                let count = get_u32(buf, "unit count")? as usize;
                let mut units = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    units.push(UnitId::new(get_u32(buf, "unit id")?));
                }
                Self::DeallocateDeferred {
                    container,
                    pages,
                    units,
                }
            }
            OperationType::CreateUnit | OperationType::DropUnit => {
                let container = ContainerId::new(get_u32(buf, "container id")?);
                let unit = UnitId::new(get_u32(buf, "unit id")?);
                if op_type == OperationType::CreateUnit {
                    Self::CreateUnit { container, unit }
                } else {
                    Self::DropUnit { container, unit }
                }
            }
            OperationType::NextPage | OperationType::PrevPage | OperationType::LowPage => {
                let field = match op_type {
                    OperationType::NextPage => PointerField::Next,
                    OperationType::PrevPage => PointerField::Previous,
                    _ => PointerField::Low,
                };
                let (page, root) = get_base(buf)?;
                let old = Some(get_page(buf)?).filter(|p| p.is_valid());
                let new = Some(get_page(buf)?).filter(|p| p.is_valid());
                Self::Pointer {
                    field,
                    page,
                    root,
                    old,
                    new,
                }
            }
            OperationType::BranchInsert | OperationType::BranchDelete => {
                let (page, root) = get_base(buf)?;
                let key = DeweyId::decode(buf)?;
                let child = get_page(buf)?;
                if op_type == OperationType::BranchInsert {
                    Self::BranchInsert {
                        page,
                        root,
                        key,
                        child,
                    }
                } else {
                    Self::BranchDelete {
                        page,
                        root,
                        key,
                        child,
                    }
                }
            }
            OperationType::BranchUpdate => {
                let (page, root) = get_base(buf)?;
                let key = DeweyId::decode(buf)?;
                let old_child = get_page(buf)?;
                let new_child = get_page(buf)?;
                Self::BranchUpdate {
                    page,
                    root,
                    key,
                    old_child,
                    new_child,
                }
            }
            OperationType::LeafInsert | OperationType::LeafDelete => {
                let (page, root) = get_base(buf)?;
                let record = get_record(buf)?;
                if op_type == OperationType::LeafInsert {
                    Self::LeafInsert { page, root, record }
                } else {
                    Self::LeafDelete { page, root, record }
                }
            }
            OperationType::LeafUpdate => {
                let (page, root) = get_base(buf)?;
                let old = get_record(buf)?;
                let new = get_record(buf)?;
                Self::LeafUpdate {
                    page,
                    root,
                    old,
                    new,
                }
            }
            OperationType::LeafSmoInsert
            | OperationType::LeafSmoDelete
            | OperationType::SequenceInsert
            | OperationType::SequenceDelete => {
                let (page, root) = get_base(buf)?;
                let count = get_u32(buf, "record count")? as usize;
                let mut records = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    records.push(get_record(buf)?);
                }
                match op_type {
                    OperationType::LeafSmoInsert => Self::LeafSmoInsert {
                        page,
                        root,
                        records,
                    },
                    OperationType::LeafSmoDelete => Self::LeafSmoDelete {
                        page,
                        root,
                        records,
                    },
                    OperationType::SequenceInsert => Self::SequenceInsert {
                        page,
                        root,
                        records,
                    },
                    _ => Self::SequenceDelete {
                        page,
                        root,
                        records,
                    },
                }
            }
            OperationType::HighKeyUpdate => {
                let (page, root) = get_base(buf)?;
                let old = get_opt_key(buf)?;
                let new = get_opt_key(buf)?;
                Self::HighKeyUpdate {
                    page,
                    root,
                    old,
                    new,
                }
            }
            OperationType::Format => {
                let page = get_page(buf)?;
                let old = FormatState::decode(buf)?;
                let new = FormatState::decode(buf)?;
                Self::Format { page, old, new }
            }
        })
    }
}

impl fmt::Display for LogOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Commit => f.write_str("Commit"),
            Self::Abort => f.write_str("Abort"),
            Self::SmoEnd => f.write_str("SmoEnd"),
            Self::Allocate { page, unit } => write!(f, "Allocate({page} unit {unit})"),
            Self::Deallocate { page, unit } => write!(f, "Deallocate({page} unit {unit})"),
            Self::DeallocateDeferred {
                container,
                pages,
                units,
            } => write!(
                f,
                "DeallocateDeferred(container {container}: {} pages, {} units)",
                pages.len(),
                units.len()
            ),
            Self::CreateUnit { container, unit } => write!(f, "CreateUnit({container}.{unit})"),
            Self::DropUnit { container, unit } => write!(f, "DropUnit({container}.{unit})"),
            Self::Pointer {
                field,
                page,
                root,
                old,
                new,
            } => write!(
                f,
                "Pointer({page}.{field} {old:?} -> {new:?} in index {root})"
            ),
            Self::Format { page, old, new } => write!(
                f,
                "Format({page} {}/{} -> {}/{} in index {})",
                old.kind, old.height, new.kind, new.height, new.root
            ),
            other => {
                let page = other.page_id().unwrap_or(PageId::NO_PAGE);
                let root = other.root_page_id().unwrap_or(PageId::NO_PAGE);
                write!(f, "{:?}({page} in index {root})", other.op_type())
            }
        }
    }
}

// ===== Encoding helpers =====

fn put_base(buf: &mut BytesMut, page: PageId, root: PageId) {
    buf.put_slice(&page.to_be_bytes());
    buf.put_slice(&root.to_be_bytes());
}

fn put_record(buf: &mut BytesMut, record: &NodeRecord) {
    record.key.encode(buf);
    buf.put_u8(u8::from(record.external));
    buf.put_u32(record.value.len() as u32);
    buf.put_slice(&record.value);
}

fn put_opt_key(buf: &mut BytesMut, key: Option<&DeweyId>) {
    match key {
        Some(key) => {
            buf.put_u8(1);
            key.encode(buf);
        }
        None => buf.put_u8(0),
    }
}

fn need(buf: &&[u8], needed: usize, what: &'static str) -> LogResult<()> {
    if buf.remaining() < needed {
        return Err(LogError::truncated(what, needed, buf.remaining()));
    }
    Ok(())
}

fn get_u32(buf: &mut &[u8], what: &'static str) -> LogResult<u32> {
    need(buf, 4, what)?;
    Ok(buf.get_u32())
}

fn get_page(buf: &mut &[u8]) -> LogResult<PageId> {
    need(buf, PageId::SIZE, "page id")?;
    let mut bytes = [0u8; 8];
    buf.copy_to_slice(&mut bytes);
    Ok(PageId::from_be_bytes(bytes))
}

fn get_base(buf: &mut &[u8]) -> LogResult<(PageId, PageId)> {
    Ok((get_page(buf)?, get_page(buf)?))
}

fn get_page_unit(buf: &mut &[u8]) -> LogResult<(PageId, UnitId)> {
    let page = get_page(buf)?;
    let unit = UnitId::new(get_u32(buf, "unit id")?);
    Ok((page, unit))
}

fn get_record(buf: &mut &[u8]) -> LogResult<NodeRecord> {
    let key = DeweyId::decode(buf)?;
    need(buf, 5, "record header")?;
    let external = buf.get_u8() != 0;
    let len = buf.get_u32() as usize;
    need(buf, len, "record value")?;
    let value = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(NodeRecord {
        key,
        value,
        external,
    })
}

fn get_opt_key(buf: &mut &[u8]) -> LogResult<Option<DeweyId>> {
    need(buf, 1, "key flag")?;
    if buf.get_u8() == 0 {
        Ok(None)
    } else {
        Ok(Some(DeweyId::decode(buf)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> DeweyId {
        s.parse().unwrap()
    }

    fn round_trip(op: &LogOperation) -> LogOperation {
        let bytes = op.encode();
        assert_eq!(bytes.len(), op.encoded_len(), "length of {op}");
        assert_eq!(bytes[0], op.op_type().as_u8());
        LogOperation::decode(&bytes).unwrap()
    }

    #[test]
    fn test_allocate_wire_format() {
        let op = LogOperation::Allocate {
            page: PageId::new(1, 5),
            unit: UnitId::new(3),
        };
        let bytes = op.encode();
        assert_eq!(&bytes[..], &[11, 0, 0, 0, 1, 0, 0, 0, 5, 0, 0, 0, 3]);
        assert_eq!(round_trip(&op), op);
    }

    #[test]
    fn test_deferred_deallocation_batches() {
        let op = LogOperation::DeallocateDeferred {
            container: ContainerId::new(2),
            pages: vec![
                (PageId::new(2, 7), UnitId::new(1)),
                (PageId::new(2, 9), UnitId::new(4)),
            ],
            units: vec![UnitId::new(4), UnitId::new(5)],
        };
        assert_eq!(round_trip(&op), op);
        assert!(op.is_redo_only());
        assert_eq!(op.page_id(), None);
    }

    #[test]
    fn test_pointer_update_keeps_no_page() {
        let op = LogOperation::Pointer {
            field: PointerField::Previous,
            page: PageId::new(1, 8),
            root: PageId::new(1, 2),
            old: None,
            new: Some(PageId::new(1, 3)),
        };
        let decoded = round_trip(&op);
        assert_eq!(decoded, op);
        assert_eq!(decoded.op_type(), OperationType::PrevPage);
        assert_eq!(decoded.root_page_id(), Some(PageId::new(1, 2)));
    }

    #[test]
    fn test_leaf_operations() {
        let page = PageId::new(1, 4);
        let root = PageId::new(1, 2);
        let old = NodeRecord::new(key("1.3"), &b"old"[..]);
        let new = NodeRecord::external(key("1.3"), PageId::new(1, 40));

        let ops = [
            LogOperation::LeafInsert {
                page,
                root,
                record: old.clone(),
            },
            LogOperation::LeafUpdate {
                page,
                root,
                old: old.clone(),
                new: new.clone(),
            },
            LogOperation::SequenceDelete {
                page,
                root,
                records: vec![old, new],
            },
            LogOperation::HighKeyUpdate {
                page,
                root,
                old: None,
                new: Some(key("2.1")),
            },
        ];
        for op in &ops {
            assert_eq!(&round_trip(op), op);
        }
    }

    #[test]
    fn test_format_state() {
        let op = LogOperation::Format {
            page: PageId::new(1, 2),
            old: FormatState {
                kind: PageKind::Leaf,
                unit: UnitId::new(1),
                root: PageId::new(1, 2),
                height: 0,
            },
            new: FormatState {
                kind: PageKind::Branch,
                unit: UnitId::new(1),
                root: PageId::new(1, 2),
                height: 1,
            },
        };
        assert_eq!(round_trip(&op), op);
        assert!(op.to_string().contains("leaf/0 -> branch/1"));
    }

    #[test]
    fn test_inverse() {
        let page = PageId::new(1, 4);
        let root = PageId::new(1, 2);
        let record = NodeRecord::new(key("1.1"), &b"v"[..]);

        let insert = LogOperation::LeafInsert {
            page,
            root,
            record: record.clone(),
        };
        assert_eq!(
            insert.inverse(),
            Some(LogOperation::LeafDelete { page, root, record })
        );

        let pointer = LogOperation::Pointer {
            field: PointerField::Next,
            page,
            root,
            old: None,
            new: Some(PageId::new(1, 9)),
        };
        let inverse = pointer.inverse().unwrap();
        assert!(matches!(
            inverse,
            LogOperation::Pointer { old: Some(_), new: None, .. }
        ));
        assert_eq!(inverse.inverse().unwrap(), pointer);

        let format = LogOperation::Format {
            page,
            old: FormatState::UNFORMATTED,
            new: FormatState {
                kind: PageKind::Leaf,
                unit: UnitId::new(1),
                root,
                height: 0,
            },
        };
        match format.inverse().unwrap() {
            LogOperation::Format { new, .. } => assert!(new.is_unformatted()),
            other => panic!("unexpected {other}"),
        }

        assert_eq!(LogOperation::Commit.inverse(), None);
        assert_eq!(
            LogOperation::Allocate { page, unit: UnitId::new(1) }.inverse(),
            Some(LogOperation::Deallocate { page, unit: UnitId::new(1) })
        );
    }

    #[test]
    fn test_unknown_tag_fails() {
        let err = LogOperation::decode(&[99, 0, 0]).unwrap_err();
        assert!(matches!(err, LogError::UnknownOperation { tag: 99 }));
        assert!(OperationType::from_u8(0).is_err());
    }

    #[test]
    fn test_truncated_payload_fails() {
        let op = LogOperation::BranchInsert {
            page: PageId::new(1, 4),
            root: PageId::new(1, 2),
            key: key("1.5"),
            child: PageId::new(1, 9),
        };
        let bytes = op.encode();
        let err = LogOperation::decode(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(err.is_decode_error());
    }

    #[test]
    fn test_type_classes() {
        assert!(OperationType::Allocate.is_page_operation());
        assert!(!OperationType::Allocate.is_index_operation());
        assert!(OperationType::Format.is_index_operation());
        assert!(!OperationType::Commit.is_index_operation());
    }
}
