use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

/// Block kind. Kinds below [`ObjectType::NO_SCAN`] hold [`crate::Value`]
/// words the marker traces; kinds at or above it hold raw data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectType {
    /// Plain record of values.
    Tuple = 0,
    /// One-field indirection the collector may short-circuit.
    Forward,
    /// Suspended or forced lazy value, never short-circuited.
    Lazy,
    /// Ephemeron record: link, domain, payload, keys. Traced specially.
    Ephemeron,
    /// Boxed float, raw bits.
    Double,
    /// Raw byte payload.
    Bytes,
    /// Foreign block with identity semantics; copies share it.
    Custom,
}

impl ObjectType {
    pub const COUNT: usize = Self::Custom as usize + 1;
    pub const NO_SCAN: u8 = Self::Double as u8;

    #[inline(always)]
    pub const fn is_scannable(self) -> bool {
        (self as u8) < Self::NO_SCAN
    }

    /// Kinds handed out by reference instead of being copied.
    #[inline(always)]
    pub const fn is_opaque(self) -> bool {
        matches!(self, Self::Custom | Self::Ephemeron)
    }
}

/// GC / bookkeeping flags stored atomically in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct HeaderFlags(pub u8);

impl HeaderFlags {
    pub const NONE: Self = Self(0);
    pub const REMEMBERED: Self = Self(1 << 0);
    /// Lives in its owner domain's nursery.
    pub const YOUNG: Self = Self(1 << 1);
    /// Reclaimed by a sweep; must never be read again.
    pub const FREED: Self = Self(1 << 2);

    #[inline(always)]
    pub const fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    #[inline(always)]
    pub const fn with(self, flag: Self) -> Self {
        Self(self.0 | flag.0)
    }

    #[inline(always)]
    pub const fn without(self, flag: Self) -> Self {
        Self(self.0 & !flag.0)
    }
}

/// The 8-byte header in front of every block.
///
/// ```text
/// byte 0:    object_type
/// byte 1:    flags (atomic): Remembered | Young | Freed
/// byte 2:    mark  (atomic): epoch of the last cycle that marked the block
/// byte 3:    reserved
/// bytes 4‥5: owner domain (atomic), meaningful while Young
/// bytes 6‥7: reserved
/// ```
///
/// A block is marked for the current cycle iff `mark == epoch`. Epoch 0 is
/// never current, so fresh blocks start unmarked.
#[repr(C)]
pub struct Header {
    object_type: ObjectType,
    flags: AtomicU8,
    mark: AtomicU8,
    _reserved: u8,
    owner: AtomicU32,
}

const _: () = assert!(size_of::<Header>() == 8);

impl Header {
    pub fn new(object_type: ObjectType) -> Self {
        Self {
            object_type,
            flags: AtomicU8::new(0),
            mark: AtomicU8::new(0),
            _reserved: 0,
            owner: AtomicU32::new(0),
        }
    }

    #[inline(always)]
    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    // ── flags ──────────────────────────────────────────────────────

    #[inline(always)]
    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags(self.flags.load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub fn set_flags(&self, flags: HeaderFlags) {
        self.flags.store(flags.0, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn has_flag(&self, flag: HeaderFlags) -> bool {
        self.flags().contains(flag)
    }

    #[inline(always)]
    pub fn add_flag(&self, flag: HeaderFlags) {
        self.flags.fetch_or(flag.0, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn remove_flag(&self, flag: HeaderFlags) {
        self.flags.fetch_and(!flag.0, Ordering::Relaxed);
    }

    /// Atomically OR flags and return the *previous* flags value.
    #[inline(always)]
    pub fn fetch_or_flags(&self, flag: HeaderFlags) -> HeaderFlags {
        HeaderFlags(self.flags.fetch_or(flag.0, Ordering::Relaxed))
    }

    // ── mark ───────────────────────────────────────────────────────

    #[inline(always)]
    pub fn mark(&self) -> u8 {
        self.mark.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_mark(&self, epoch: u8) {
        self.mark.store(epoch, Ordering::Relaxed);
    }

    /// Marks the block for `epoch`. Returns `true` if this call did it,
    /// `false` if the block already carried `epoch`.
    #[inline(always)]
    pub fn try_mark(&self, epoch: u8) -> bool {
        self.mark.swap(epoch, Ordering::AcqRel) != epoch
    }

    // ── owner ──────────────────────────────────────────────────────

    #[inline(always)]
    pub fn owner(&self) -> u32 {
        self.owner.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_owner(&self, domain: u32) {
        self.owner.store(domain, Ordering::Relaxed);
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("type", &self.object_type())
            .field("flags", &self.flags())
            .field("mark", &self.mark())
            .field("owner", &self.owner())
            .finish()
    }
}

/// Kind and size (in words) of a block; what an allocation request needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    pub object_type: ObjectType,
    pub words: usize,
}

impl Shape {
    pub const fn new(object_type: ObjectType, words: usize) -> Self {
        Self { object_type, words }
    }
}
