/// Tag constants.
const FIXNUM_MASK: u64 = 0b1;
const TAG_MASK: u64 = 0b11;
const REF_TAG: u64 = 0b01;
const NONE_BITS: u64 = !0;

/// A tagged 64-bit value.
///
/// Encoding:
/// - **Fixnum**:    `...XXXXX0`: 63-bit signed integer (low bit 0).
/// - **Reference**: `...XXXX01`: index of a block in the heap's object table.
/// - **None**:      all bits set: the empty-slot sentinel, never a real value.
///
/// References carry a table index instead of an address so that blocks can
/// be promoted between generations without rewriting the words that point at
/// them.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    /// The empty-slot sentinel.
    pub const NONE: Value = Value(NONE_BITS);

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn is_none(self) -> bool {
        self.0 == NONE_BITS
    }

    /// True for fixnums and the `NONE` sentinel.
    #[inline(always)]
    pub const fn is_immediate(self) -> bool {
        !self.is_ref()
    }

    // ── Fixnum ─────────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_fixnum(self) -> bool {
        self.0 & FIXNUM_MASK == 0
    }

    #[inline(always)]
    pub fn from_i64(n: i64) -> Self {
        debug_assert!(
            (-(1i64 << 62)..(1i64 << 62)).contains(&n),
            "fixnum overflow: {n}"
        );
        Self((n << 1) as u64)
    }

    /// Returns the integer if this is a fixnum.
    #[inline(always)]
    pub const fn as_i64(self) -> Option<i64> {
        if self.is_fixnum() {
            Some((self.0 as i64) >> 1)
        } else {
            None
        }
    }

    // ── Reference ──────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_ref(self) -> bool {
        self.0 & TAG_MASK == REF_TAG
    }

    #[inline(always)]
    pub fn from_index(index: usize) -> Self {
        let bits = (index as u64) << 2;
        debug_assert_eq!(bits >> 2, index as u64, "object index overflow");
        Self(bits | REF_TAG)
    }

    /// Object table index of a reference.
    #[inline(always)]
    pub const fn index(self) -> usize {
        debug_assert!(self.is_ref());
        (self.0 >> 2) as usize
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::NONE
    }
}

impl core::fmt::Debug for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_none() {
            write!(f, "None")
        } else if let Some(n) = self.as_i64() {
            write!(f, "Fixnum({n})")
        } else {
            write!(f, "Ref(#{})", self.index())
        }
    }
}
