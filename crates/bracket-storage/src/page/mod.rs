//! In-memory pages and their block image.
//!
//! # Block layout
//!
//! ```text
//! +--------+------+------+-----+----------+------------------------+
//! | marker | body | unit | LSN | checksum | body ...               |
//! |   1    |  1   |  4   |  8  |    4     |                        |
//! +--------+------+------+-----+----------+------------------------+
//!
//! tree body   kind(1) root(8) prev(8) height(2)
//!   leaf        next(8) [flag key] count(2) {key flag(1) len(4) value}*
//!   branch      low(8) count(2) {key child(8)}*
//! blob body   next(8) len(4) data
//! ```
//!
//! A block whose marker byte is clear has never been written since it was
//! allocated and decodes as an unformatted page.

mod branch;
mod checksum;
mod context;
mod error;
mod leaf;

use bytes::{Buf, BufMut, Bytes};

use bracket_common::constants::BLOCK_IN_USE;
use bracket_common::types::{DeweyId, Lsn, NodeRecord, PageId, PageKind, UnitId};
use bracket_wal::{FormatState, LogOperation, PointerField};

pub use branch::{BranchPage, ChildSlot, BRANCH_HEADER_SIZE};
pub use checksum::{compute_page_checksum, verify_page_checksum};
pub use context::{InsertOutcome, PageContext, TreeContext};
pub use error::{PageError, PageResult};
pub use leaf::{LeafPage, LEAF_HEADER_SIZE};

/// Size of the common page header.
pub const PAGE_HEADER_SIZE: usize = 1 + 1 + 4 + 8 + 4;

/// Size of the tree header that follows the page header.
pub const TREE_HEADER_SIZE: usize = 1 + 8 + 8 + 2;

/// Size of the blob header that follows the page header.
pub const BLOB_HEADER_SIZE: usize = 8 + 4;

const CHECKSUM_OFFSET: usize = 14;

const BODY_UNFORMATTED: u8 = 0;
const BODY_TREE: u8 = 1;
const BODY_BLOB: u8 = 2;

const RECORD_EXTERNAL: u8 = 1;

/// One link of an externalized value chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobPage {
    /// Next link.
    pub next: Option<PageId>,
    /// Bytes stored in this link.
    pub data: Bytes,
}

impl BlobPage {
    /// Payload bytes one blob page can hold.
    pub fn capacity(block_size: usize) -> usize {
        block_size - PAGE_HEADER_SIZE - BLOB_HEADER_SIZE
    }
}

/// What a page currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageBody {
    /// Allocated, never formatted.
    Unformatted,
    /// Leaf or branch of a bracket index.
    Tree(PageContext),
    /// Part of an externalized value.
    Blob(BlobPage),
}

impl PageBody {
    fn name(&self) -> &'static str {
        match self {
            Self::Unformatted => "unformatted",
            Self::Tree(PageContext::Leaf(_)) => "leaf",
            Self::Tree(PageContext::Branch(_)) => "branch",
            Self::Blob(_) => "blob",
        }
    }
}

/// A decoded page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    id: PageId,
    lsn: Lsn,
    unit: UnitId,
    capacity: usize,
    body: PageBody,
}

impl Page {
    /// Creates an unformatted page for a block of `capacity` bytes.
    pub fn new(id: PageId, unit: UnitId, capacity: usize) -> Self {
        Self {
            id,
            lsn: Lsn::INVALID,
            unit,
            capacity,
            body: PageBody::Unformatted,
        }
    }

    /// Page id.
    pub fn id(&self) -> PageId {
        self.id
    }

    /// LSN of the last change applied to this page.
    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    /// Stamps the LSN of a change.
    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.lsn = lsn;
    }

    /// Owning unit.
    pub fn unit(&self) -> UnitId {
        self.unit
    }

    /// Block size.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Page body.
    pub fn body(&self) -> &PageBody {
        &self.body
    }

    /// Returns true if the page was never formatted.
    pub fn is_unformatted(&self) -> bool {
        matches!(self.body, PageBody::Unformatted)
    }

    /// Tree context, if formatted as a tree page.
    pub fn context(&self) -> Option<&PageContext> {
        match &self.body {
            PageBody::Tree(ctx) => Some(ctx),
            _ => None,
        }
    }

    fn wrong_kind(&self, expected: &'static str) -> PageError {
        PageError::WrongKind {
            page: self.id,
            expected,
            found: self.body.name(),
        }
    }

    /// Tree context or a [`PageError::WrongKind`].
    pub fn tree(&self) -> PageResult<&PageContext> {
        self.context().ok_or_else(|| self.wrong_kind("tree"))
    }

    /// Mutable tree context.
    pub fn tree_mut(&mut self) -> PageResult<&mut PageContext> {
        let err = self.wrong_kind("tree");
        match &mut self.body {
            PageBody::Tree(ctx) => Ok(ctx),
            _ => Err(err),
        }
    }

    /// Leaf context.
    pub fn leaf(&self) -> PageResult<&LeafPage> {
        match &self.body {
            PageBody::Tree(PageContext::Leaf(leaf)) => Ok(leaf),
            _ => Err(self.wrong_kind("leaf")),
        }
    }

    /// Mutable leaf context.
    pub fn leaf_mut(&mut self) -> PageResult<&mut LeafPage> {
        let err = self.wrong_kind("leaf");
        match &mut self.body {
            PageBody::Tree(PageContext::Leaf(leaf)) => Ok(leaf),
            _ => Err(err),
        }
    }

    /// Branch context.
    pub fn branch(&self) -> PageResult<&BranchPage> {
        match &self.body {
            PageBody::Tree(PageContext::Branch(branch)) => Ok(branch),
            _ => Err(self.wrong_kind("branch")),
        }
    }

    /// Mutable branch context.
    pub fn branch_mut(&mut self) -> PageResult<&mut BranchPage> {
        let err = self.wrong_kind("branch");
        match &mut self.body {
            PageBody::Tree(PageContext::Branch(branch)) => Ok(branch),
            _ => Err(err),
        }
    }

    /// Blob link.
    pub fn blob(&self) -> PageResult<&BlobPage> {
        match &self.body {
            PageBody::Blob(blob) => Ok(blob),
            _ => Err(self.wrong_kind("blob")),
        }
    }

    /// Turns the page into a blob link.
    pub fn set_blob(&mut self, blob: BlobPage) -> PageResult<()> {
        let needed = PAGE_HEADER_SIZE + BLOB_HEADER_SIZE + blob.data.len();
        if needed > self.capacity {
            return Err(PageError::Overflow {
                page: self.id,
                needed,
                available: self.capacity,
            });
        }
        self.body = PageBody::Blob(blob);
        Ok(())
    }

    /// Fields a format would overwrite.
    pub fn format_state(&self) -> FormatState {
        match &self.body {
            PageBody::Tree(ctx) => FormatState {
                kind: ctx.kind(),
                unit: self.unit,
                root: ctx.root(),
                height: ctx.height(),
            },
            _ => FormatState {
                unit: self.unit,
                ..FormatState::UNFORMATTED
            },
        }
    }

    /// Replaces the content with an empty context described by `state`.
    pub fn format(&mut self, state: FormatState) {
        self.unit = state.unit;
        self.body = if state.is_unformatted() {
            PageBody::Unformatted
        } else {
            PageBody::Tree(PageContext::new(state.kind, state.root, state.height))
        };
    }

    /// Bytes the page occupies when encoded.
    pub fn encoded_len(&self) -> usize {
        PAGE_HEADER_SIZE
            + match &self.body {
                PageBody::Unformatted => 0,
                PageBody::Tree(ctx) => TREE_HEADER_SIZE + ctx.body_len(),
                PageBody::Blob(blob) => BLOB_HEADER_SIZE + blob.data.len(),
            }
    }

    /// Unused bytes.
    pub fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.encoded_len())
    }

    /// Returns true if `extra` more bytes fit.
    pub fn fits(&self, extra: usize) -> bool {
        extra <= self.free_space()
    }

    /// Record bytes an empty leaf of a `block_size` page can hold.
    pub fn usable_leaf_space(block_size: usize) -> usize {
        block_size.saturating_sub(PAGE_HEADER_SIZE + TREE_HEADER_SIZE + LEAF_HEADER_SIZE)
    }

    /// Applies an index operation to the page content.
    ///
    /// Either the whole operation is applied or the page is left unchanged.
    /// The LSN is not touched.
    pub fn apply(&mut self, op: &LogOperation) -> PageResult<()> {
        if let LogOperation::Format { new, .. } = op {
            self.format(*new);
            return Ok(());
        }

        let growth = Self::growth(op);
        if growth > 0 && growth as usize > self.free_space() {
            return Err(PageError::Overflow {
                page: self.id,
                needed: growth as usize,
                available: self.free_space(),
            });
        }

        let id = self.id;
        match op {
            LogOperation::Pointer { field, new, .. } => match field {
                PointerField::Next => self.leaf_mut()?.set_next(*new),
                PointerField::Previous => self.tree_mut()?.set_prev(*new),
                PointerField::Low => self.branch_mut()?.set_low(*new),
            },
            LogOperation::BranchInsert { key, child, .. } => {
                self.branch_mut()?.insert(id, key.clone(), *child)?;
            }
            LogOperation::BranchDelete { key, .. } => {
                self.branch_mut()?.remove(id, key)?;
            }
            LogOperation::BranchUpdate { key, new_child, .. } => {
                self.branch_mut()?.update(id, key, *new_child)?;
            }
            LogOperation::LeafInsert { record, .. } => {
                self.leaf_mut()?.insert(id, record.clone())?;
            }
            LogOperation::LeafDelete { record, .. } => {
                self.leaf_mut()?.remove(id, &record.key)?;
            }
            LogOperation::LeafUpdate { new, .. } => {
                self.leaf_mut()?.update(id, new.clone())?;
            }
            LogOperation::LeafSmoInsert { records, .. }
            | LogOperation::SequenceInsert { records, .. } => {
                let leaf = self.leaf_mut()?;
                if let Some(dup) = records.iter().find(|r| leaf.search(&r.key).is_ok()) {
                    return Err(PageError::DuplicateKey {
                        page: id,
                        key: dup.key.clone(),
                    });
                }
                for record in records {
                    leaf.insert(id, record.clone())?;
                }
            }
            LogOperation::LeafSmoDelete { records, .. }
            | LogOperation::SequenceDelete { records, .. } => {
                let leaf = self.leaf_mut()?;
                if let Some(missing) = records.iter().find(|r| leaf.search(&r.key).is_err()) {
                    return Err(PageError::KeyNotFound {
                        page: id,
                        key: missing.key.clone(),
                    });
                }
                for record in records {
                    leaf.remove(id, &record.key)?;
                }
            }
            LogOperation::HighKeyUpdate { new, .. } => {
                self.leaf_mut()?.set_high_key(new.clone());
            }
            other => {
                return Err(PageError::UnsupportedOperation {
                    page: id,
                    operation: other.to_string(),
                })
            }
        }
        Ok(())
    }

    /// Bytes an operation adds to a page (negative if it frees space).
    fn growth(op: &LogOperation) -> isize {
        let key_len = |key: &Option<DeweyId>| key.as_ref().map_or(0, DeweyId::encoded_len) as isize;
        let records_len =
            |records: &[NodeRecord]| records.iter().map(record_len).sum::<usize>() as isize;
        match op {
            LogOperation::BranchInsert { key, .. } => (key.encoded_len() + PageId::SIZE) as isize,
            LogOperation::BranchDelete { key, .. } => -((key.encoded_len() + PageId::SIZE) as isize),
            LogOperation::LeafInsert { record, .. } => record_len(record) as isize,
            LogOperation::LeafDelete { record, .. } => -(record_len(record) as isize),
            LogOperation::LeafUpdate { old, new, .. } => {
                record_len(new) as isize - record_len(old) as isize
            }
            LogOperation::LeafSmoInsert { records, .. }
            | LogOperation::SequenceInsert { records, .. } => records_len(records),
            LogOperation::LeafSmoDelete { records, .. }
            | LogOperation::SequenceDelete { records, .. } => -records_len(records),
            LogOperation::HighKeyUpdate { old, new, .. } => key_len(new) - key_len(old),
            _ => 0,
        }
    }

    /// Encodes the page into a block image with a fresh checksum.
    pub fn encode(&self) -> PageResult<Vec<u8>> {
        let len = self.encoded_len();
        if len > self.capacity {
            return Err(PageError::Overflow {
                page: self.id,
                needed: len,
                available: self.capacity,
            });
        }

        let mut buf = Vec::with_capacity(self.capacity);
        buf.put_u8(BLOCK_IN_USE);
        buf.put_u8(match self.body {
            PageBody::Unformatted => BODY_UNFORMATTED,
            PageBody::Tree(_) => BODY_TREE,
            PageBody::Blob(_) => BODY_BLOB,
        });
        buf.put_u32(self.unit.as_u32());
        buf.put_u64(self.lsn.as_u64());
        buf.put_u32(0);

        match &self.body {
            PageBody::Unformatted => {}
            PageBody::Tree(ctx) => {
                buf.put_u8(ctx.kind().as_u8());
                buf.put_slice(&ctx.root().to_be_bytes());
                buf.put_slice(&PageId::encode_opt(ctx.prev()));
                buf.put_u16(ctx.height());
                match ctx {
                    PageContext::Leaf(leaf) => leaf.encode_body(&mut buf),
                    PageContext::Branch(branch) => branch.encode_body(&mut buf),
                }
            }
            PageBody::Blob(blob) => {
                buf.put_slice(&PageId::encode_opt(blob.next));
                buf.put_u32(blob.data.len() as u32);
                buf.put_slice(&blob.data);
            }
        }

        buf.resize(self.capacity, 0);
        let checksum = compute_page_checksum(&buf, CHECKSUM_OFFSET);
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_be_bytes());
        Ok(buf)
    }

    /// Decodes a block image read for page `id`.
    pub fn decode(id: PageId, bytes: &[u8]) -> PageResult<Self> {
        let capacity = bytes.len();
        if capacity < PAGE_HEADER_SIZE {
            return Err(PageError::corrupted(id, "block smaller than page header"));
        }
        if bytes[0] == 0 {
            return Ok(Self::new(id, UnitId::NONE, capacity));
        }
        verify_page_checksum(bytes, CHECKSUM_OFFSET).map_err(|(stored, computed)| {
            PageError::ChecksumMismatch {
                page: id,
                stored,
                computed,
            }
        })?;

        let mut buf = &bytes[1..];
        let body_type = buf.get_u8();
        let unit = UnitId::new(buf.get_u32());
        let lsn = Lsn::new(buf.get_u64());
        buf.advance(4);

        let body = match body_type {
            BODY_UNFORMATTED => PageBody::Unformatted,
            BODY_TREE => {
                if buf.remaining() < TREE_HEADER_SIZE {
                    return Err(PageError::corrupted(id, "truncated tree header"));
                }
                let flag = buf.get_u8();
                let kind = PageKind::from_u8(flag)
                    .ok_or_else(|| PageError::corrupted(id, format!("unknown page kind {flag}")))?;
                let root = get_page_opt(id, &mut buf)?
                    .ok_or_else(|| PageError::corrupted(id, "tree page without root"))?;
                let prev = get_page_opt(id, &mut buf)?;
                let height = buf.get_u16();
                PageBody::Tree(match kind {
                    PageKind::Leaf => {
                        PageContext::Leaf(LeafPage::decode_body(id, root, prev, &mut buf)?)
                    }
                    PageKind::Branch => PageContext::Branch(BranchPage::decode_body(
                        id, root, prev, height, &mut buf,
                    )?),
                })
            }
            BODY_BLOB => {
                let next = get_page_opt(id, &mut buf)?;
                if buf.remaining() < 4 {
                    return Err(PageError::corrupted(id, "truncated blob header"));
                }
                let len = buf.get_u32() as usize;
                if buf.remaining() < len {
                    return Err(PageError::corrupted(id, "blob data past end of block"));
                }
                PageBody::Blob(BlobPage {
                    next,
                    data: Bytes::copy_from_slice(&buf[..len]),
                })
            }
            other => {
                return Err(PageError::corrupted(id, format!("unknown body type {other}")));
            }
        };

        Ok(Self {
            id,
            lsn,
            unit,
            capacity,
            body,
        })
    }
}

// ===== Encoding helpers =====

pub(crate) fn record_len(record: &NodeRecord) -> usize {
    record.encoded_len()
}

fn put_record(buf: &mut impl BufMut, record: &NodeRecord) {
    record.key.encode(buf);
    buf.put_u8(if record.external { RECORD_EXTERNAL } else { 0 });
    buf.put_u32(record.value.len() as u32);
    buf.put_slice(&record.value);
}

fn get_record(page: PageId, buf: &mut &[u8]) -> PageResult<NodeRecord> {
    let key = DeweyId::decode(buf).map_err(|e| PageError::corrupted(page, e.to_string()))?;
    if buf.remaining() < 5 {
        return Err(PageError::corrupted(page, "truncated record header"));
    }
    let flag = buf.get_u8();
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(PageError::corrupted(page, "record value past end of block"));
    }
    let value = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(NodeRecord {
        key,
        value,
        external: flag & RECORD_EXTERNAL != 0,
    })
}

fn put_opt_key(buf: &mut impl BufMut, key: Option<&DeweyId>) {
    match key {
        Some(key) => {
            buf.put_u8(1);
            key.encode(buf);
        }
        None => buf.put_u8(0),
    }
}

fn get_opt_key(page: PageId, buf: &mut &[u8]) -> PageResult<Option<DeweyId>> {
    if buf.remaining() < 1 {
        return Err(PageError::corrupted(page, "truncated key flag"));
    }
    match buf.get_u8() {
        0 => Ok(None),
        _ => DeweyId::decode(buf)
            .map(Some)
            .map_err(|e| PageError::corrupted(page, e.to_string())),
    }
}

fn get_page_opt(page: PageId, buf: &mut &[u8]) -> PageResult<Option<PageId>> {
    if buf.remaining() < PageId::SIZE {
        return Err(PageError::corrupted(page, "truncated page pointer"));
    }
    let mut bytes = [0u8; PageId::SIZE];
    buf.copy_to_slice(&mut bytes);
    Ok(PageId::decode_opt(bytes))
}
