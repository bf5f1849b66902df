//! What the ephemeron operations need from the collector, allocator and
//! object model.
//!
//! The operations never reach for global state: the current domain and the
//! collector phase come from the [`Runtime`] passed into every call, so the
//! phase machine can be driven directly in tests.

use object::{Shape, Value};

/// Identifier of a domain, one per parallel mutator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(pub u32);

impl DomainId {
    /// Never handed out: id allocation stops one short of it.
    pub const INVALID: DomainId = DomainId(u32::MAX);

    #[inline]
    pub fn as_value(self) -> Value {
        Value::from_i64(self.0 as i64)
    }

    #[inline]
    pub fn from_value(value: Value) -> Option<Self> {
        value
            .as_i64()
            .and_then(|raw| u32::try_from(raw).ok())
            .map(DomainId)
    }
}

impl core::fmt::Display for DomainId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "domain {}", self.0)
    }
}

/// Collector phase as seen by the ephemeron operations.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcPhase {
    /// No major cycle in progress (or sweeping): no marking, no dead checks.
    Idle = 0,
    /// Tracing reachable tenured blocks.
    Mark = 1,
    /// Marking is over; unmarked tenured blocks are dead and ephemerons
    /// are being cleaned.
    Clean = 2,
}

impl From<u8> for GcPhase {
    fn from(val: u8) -> Self {
        match val {
            1 => GcPhase::Mark,
            2 => GcPhase::Clean,
            _ => GcPhase::Idle,
        }
    }
}

/// Services the ephemeron operations consume.
///
/// One `Runtime` is the view of a single domain: `current_domain` is fixed
/// and every mutation goes through that domain's nursery and remembered set.
pub trait Runtime {
    fn current_domain(&self) -> DomainId;
    fn current_phase(&self) -> GcPhase;

    // ── object model ──────────────────────────────────────────────

    /// Kind and size of the block `obj` refers to.
    fn shape(&self, obj: Value) -> Shape;

    /// True iff `value` refers to a block in a domain nursery. Immediates
    /// are never young.
    fn is_young(&self, value: Value) -> bool;

    fn field(&self, obj: Value, index: usize) -> Value;

    /// Plain store: no barrier of any kind.
    fn set_field(&mut self, obj: Value, index: usize, value: Value);

    /// Store into an ordinary block with the generational barrier.
    fn store_field(&mut self, obj: Value, index: usize, value: Value);

    /// Copies the raw words of `src` into `dst`; both have the same shape.
    fn copy_words(&mut self, src: Value, dst: Value);

    // ── liveness oracle ───────────────────────────────────────────

    /// Valid outside [`GcPhase::Clean`].
    fn is_marked(&self, value: Value) -> bool;

    /// Valid only during [`GcPhase::Clean`]. Young blocks are always alive.
    fn is_unmarked_during_clean(&self, value: Value) -> bool;

    /// Marks `value` reachable for the rest of the mark phase. Idempotent.
    fn force_mark(&mut self, value: Value);

    // ── allocation ────────────────────────────────────────────────
    //
    // Fresh blocks come back with every word set to `Value::NONE`. Any
    // allocation may run incremental collector work, including cleaning
    // the caller's own ephemerons.

    fn max_object_words(&self) -> usize;

    /// Allocates directly in the shared tenured heap.
    fn allocate_shared(&mut self, shape: Shape) -> Value;

    /// Allocates a block whose words will be traced.
    fn allocate_scannable(&mut self, shape: Shape) -> Value;

    /// Allocates a block of raw words for a byte-wise copy.
    fn allocate_opaque_copy(&mut self, shape: Shape) -> Value;

    // ── remembered set ────────────────────────────────────────────

    /// Records that word `slot` of `record` now points into the nursery.
    fn register_write_barrier(&mut self, record: Value, slot: usize);

    // ── registry ──────────────────────────────────────────────────

    /// Head of the calling domain's live-ephemeron list.
    fn ephemeron_list_head(&self) -> Value;
    fn set_ephemeron_list_head(&mut self, head: Value);
}

/// Dead in the sense of the cleaning phase: a tenured block left unmarked.
#[inline]
pub(crate) fn is_dead_during_clean<R: Runtime + ?Sized>(rt: &R, value: Value) -> bool {
    debug_assert!(!value.is_none());
    value.is_ref() && rt.is_unmarked_during_clean(value)
}

/// Shades a value the mutator is about to receive while marking is active.
#[inline]
pub(crate) fn darken_if_marking<R: Runtime + ?Sized>(rt: &mut R, value: Value) {
    if rt.current_phase() == GcPhase::Mark
        && value.is_ref()
        && !rt.is_young(value)
        && !rt.is_marked(value)
    {
        rt.force_mark(value);
    }
}
