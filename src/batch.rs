//! The microbatch: the unit of data transfer between stages.
//!
//! A [`Microbatch`] is a fixed-capacity slab of decorated items. The slab is
//! allocated in one shot when the microbatch is created, items are then
//! allocated, built and committed in place. Only committed items are visible
//! to iteration, in insertion order.
//!
//! Between stages a microbatch travels inside a [`Message`], either as a
//! type-erased payload ([`AnyBatch`], one allocation per batch, never per
//! item) or as a control token carrying a [`Sentinel`].

use std::any::Any;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

use coarsetime::Instant;
use derivative::Derivative;

/// Identifier of a logical stream.
///
/// Every microbatch carries the tag of the stream it belongs to. The nil tag
/// designates the top-level pipeline stream, nested iterations allocate fresh
/// tags for each pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u64);

/// Generator for fresh tags. Zero is reserved for the nil tag.
static NEXT_TAG: AtomicU64 = AtomicU64::new(1);

impl Tag {
    /// The tag of the top-level pipeline stream.
    pub const NIL: Tag = Tag(0);

    /// Allocate a tag never returned before in this process.
    pub fn fresh() -> Tag {
        Tag(NEXT_TAG.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_nil(&self) -> bool {
        self.0 == 0
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Per-slot descriptor stored next to each payload item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenMeta {
    /// Hash of the grouping key, set by key-partitioning emitters.
    pub key_hint: Option<u64>,
}

/// Sentinels carried by control tokens.
///
/// `Begin`/`End` bracket an entire execution and always carry the nil tag.
/// `CstreamBegin`/`CstreamEnd` bracket a tagged stream segment, one pair per
/// iteration pass or join side. `FromLeft`/`FromRight` are injected by the
/// pair collector right after `CstreamBegin` to tell downstream which branch
/// produced the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    Begin,
    End,
    CstreamBegin,
    CstreamEnd,
    FromLeft,
    FromRight,
}

impl Display for Sentinel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Sentinel::Begin => "begin",
            Sentinel::End => "end",
            Sentinel::CstreamBegin => "c-begin",
            Sentinel::CstreamEnd => "c-end",
            Sentinel::FromLeft => "from-left",
            Sentinel::FromRight => "from-right",
        };
        write!(f, "{name}")
    }
}

/// The side of a pair farm a token originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub(crate) fn sentinel(&self) -> Sentinel {
        match self {
            Side::Left => Sentinel::FromLeft,
            Side::Right => Sentinel::FromRight,
        }
    }
}

/// A type-erased microbatch moving along an edge of the stage network.
///
/// The box is the only allocation paid when crossing an edge, the slab it
/// wraps is moved, never copied.
pub type AnyBatch = Box<dyn Any + Send>;

/// Erase the item type of a microbatch so that it can travel through the
/// untyped stage network.
pub fn seal<T: Send + 'static>(batch: Microbatch<T>) -> AnyBatch {
    Box::new(batch)
}

/// Recover a typed microbatch from an erased payload.
///
/// Panics if the payload holds a different item type: the compiler wires
/// every edge between stages of matching types, a mismatch here means the
/// network is miswired and is not recoverable.
pub fn open<T: Send + 'static>(batch: AnyBatch) -> Microbatch<T> {
    match batch.downcast::<Microbatch<T>>() {
        Ok(b) => *b,
        Err(_) => panic!(
            "microbatch payload is not {}: stage network is miswired",
            std::any::type_name::<T>()
        ),
    }
}

/// Try to recover a typed microbatch, handing the payload back on mismatch.
pub fn try_open<T: Send + 'static>(batch: AnyBatch) -> Result<Microbatch<T>, AnyBatch> {
    batch.downcast::<Microbatch<T>>().map(|b| *b)
}

/// What travels on an edge between two stages: either a microbatch of data
/// or a control token.
#[derive(Derivative)]
#[derivative(Debug)]
pub enum Message {
    /// A microbatch of data items belonging to the stream `tag`.
    Batch {
        tag: Tag,
        #[derivative(Debug = "ignore")]
        batch: AnyBatch,
    },
    /// A control token for the stream `tag`.
    Sync { tag: Tag, token: Sentinel },
}

impl Message {
    pub(crate) fn sync(tag: Tag, token: Sentinel) -> Message {
        Message::Sync { tag, token }
    }

    pub(crate) fn batch(tag: Tag, batch: AnyBatch) -> Message {
        Message::Batch { tag, batch }
    }
}

/// Fixed-capacity slab of decorated items.
///
/// Each slot stores a [`TokenMeta`] descriptor next to the payload item. An
/// item goes through three phases: allocated (slot reserved and built),
/// committed (visible to iteration). `committed <= built <= capacity` always
/// holds. Dropping the microbatch drops every built item, committed or not.
///
/// A microbatch is exclusively owned by the stage holding it; ownership
/// transfers by move through the edge channels.
pub struct Microbatch<T> {
    slots: Vec<(TokenMeta, T)>,
    // the vector may over-allocate, the logical capacity is tracked apart
    capacity: usize,
    committed: usize,
    created_at: Instant,
}

impl<T> Microbatch<T> {
    /// Allocate the slab for up to `capacity` items in a single call.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "microbatch capacity must be positive");
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            committed: 0,
            created_at: Instant::now(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of committed items.
    pub fn len(&self) -> usize {
        self.committed
    }

    pub fn is_empty(&self) -> bool {
        self.committed == 0
    }

    /// True when every slot has been allocated.
    pub fn is_full(&self) -> bool {
        self.slots.len() == self.capacity
    }

    /// When the slab was allocated.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Build an item in the next free slot and return a reference to it,
    /// without committing. Returns `None` when the slab is full.
    ///
    /// Every slot is handed out exactly once.
    pub fn allocate(&mut self, meta: TokenMeta, item: T) -> Option<&mut T> {
        if self.is_full() {
            return None;
        }
        self.slots.push((meta, item));
        self.slots.last_mut().map(|(_, item)| item)
    }

    /// Commit the last allocated item, making it visible to iteration.
    ///
    /// Calling `commit` without a preceding uncommitted `allocate` is a
    /// programmer error.
    pub fn commit(&mut self) {
        assert!(
            self.committed < self.slots.len(),
            "commit without a preceding allocate"
        );
        self.committed += 1;
    }

    /// Allocate and commit in one call. Panics when the slab is full, check
    /// [`is_full`](Microbatch::is_full) first.
    pub fn push(&mut self, item: T) {
        self.push_with(TokenMeta::default(), item);
    }

    /// Like [`push`](Microbatch::push) with an explicit descriptor.
    pub fn push_with(&mut self, meta: TokenMeta, item: T) {
        match self.allocate(meta, item) {
            Some(_) => self.commit(),
            None => panic!("push on a full microbatch"),
        }
    }

    /// Drop every built item, committed or not. The slab stays allocated.
    pub fn clear(&mut self) {
        self.slots.truncate(0);
        self.committed = 0;
    }

    /// Iterate over the committed items, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots[..self.committed].iter().map(|(_, item)| item)
    }

    /// Iterate over the committed slots with their descriptors.
    pub fn iter_with_meta(&self) -> impl Iterator<Item = (&TokenMeta, &T)> {
        self.slots[..self.committed]
            .iter()
            .map(|(meta, item)| (meta, item))
    }

    /// Consume the microbatch yielding the committed slots, in insertion
    /// order. Built but uncommitted items are dropped.
    pub fn drain(mut self) -> impl Iterator<Item = (TokenMeta, T)> {
        self.slots.truncate(self.committed);
        self.slots.into_iter()
    }
}

/// Build a single-item microbatch.
impl<T> From<T> for Microbatch<T> {
    fn from(item: T) -> Self {
        let mut mb = Microbatch::new(1);
        mb.push(item);
        mb
    }
}
