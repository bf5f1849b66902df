//! Shared tenured heap and collector state for the ephemeron runtime.
//!
//! Every block lives in one object table shared by all domains. A reference
//! is an index into that table, so promotion out of a nursery never moves
//! anything. A block is young while it carries [`HeaderFlags::YOUNG`]; it
//! belongs to the nursery of the domain that allocated it until the next
//! minor collection.
//!
//! Major cycles are incremental and snapshot-at-the-beginning:
//!
//! - `Idle -> Mark`: nurseries are emptied, the epoch advances and every
//!   domain darkens its roots.
//! - `Mark`: domains drain the shared gray queue a slice at a time.
//! - `Mark -> Clean`: the coordinator drains what is left and runs the
//!   ephemeron fix-point.
//! - `Clean`: each domain cleans its own ephemerons a slice at a time.
//! - `Clean -> Idle`: every domain finishes its list, then unmarked tenured
//!   blocks are swept.
//!
//! Phase changes only happen inside a rendezvous, see [`Domain`].

use std::{
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    },
};

use ephemeron::{Cleaned, DATA_OFFSET, DomainId, FIRST_KEY, GcPhase, LINK_OFFSET};
use object::{Header, HeaderFlags, ObjectType, Shape, Value};
use parking_lot::{Mutex, RwLock};

use crate::{Domain, SenseBarrier};

// ── Heap settings ─────────────────────────────────────────────────────

/// Sizing and pacing of the heap. All sizes are in words.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Largest block a single allocation may request.
    pub max_object_words: usize,
    /// Nursery words a domain may use before it asks for a minor collection.
    pub nursery_words: usize,
    /// Tenured words allocated since the last cycle start that trigger the
    /// next major cycle.
    pub cycle_words: usize,
    /// Units of marking or cleaning work per incremental slice.
    pub slice_budget: usize,
    /// Allocations between two incremental slices.
    pub alloc_per_slice: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            max_object_words: 1 << 16,
            nursery_words: 64 * 1024,
            cycle_words: 256 * 1024,
            slice_budget: 64,
            alloc_per_slice: 16,
        }
    }
}

impl HeapSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_object_words == 0
            || self.nursery_words == 0
            || self.cycle_words == 0
        {
            return Err("Sizes must be > 0");
        }
        if self.max_object_words <= FIRST_KEY {
            return Err("max_object_words must leave room for an ephemeron");
        }
        if self.max_object_words > self.nursery_words {
            return Err("max_object_words must fit in the nursery");
        }
        if self.slice_budget == 0 || self.alloc_per_slice == 0 {
            return Err("slice_budget and alloc_per_slice must be > 0");
        }
        Ok(())
    }
}

// ── GC request / state ────────────────────────────────────────────────

/// Work a rendezvous was called for.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcRequest {
    None = 0,
    /// Empty every nursery.
    Minor = 1,
    /// `Idle -> Mark`.
    StartCycle = 2,
    /// `Mark -> Clean`.
    FinishMarking = 3,
    /// `Clean -> Idle`.
    FinishCleaning = 4,
}

impl From<u8> for GcRequest {
    fn from(val: u8) -> Self {
        match val {
            1 => GcRequest::Minor,
            2 => GcRequest::StartCycle,
            3 => GcRequest::FinishMarking,
            4 => GcRequest::FinishCleaning,
            _ => GcRequest::None,
        }
    }
}

impl GcRequest {
    /// The request that moves `phase` to the next one.
    pub fn advancing(phase: GcPhase) -> Self {
        match phase {
            GcPhase::Idle => GcRequest::StartCycle,
            GcPhase::Mark => GcRequest::FinishMarking,
            GcPhase::Clean => GcRequest::FinishCleaning,
        }
    }

    /// Whether the request may be made while the heap is in `phase`.
    pub fn applies_to(self, phase: GcPhase) -> bool {
        match self {
            GcRequest::None => false,
            GcRequest::Minor => true,
            _ => GcRequest::advancing(phase) == self,
        }
    }

    /// Phase once the rendezvous for this request is over.
    pub fn next_phase(self, phase: GcPhase) -> GcPhase {
        match self {
            GcRequest::StartCycle => GcPhase::Mark,
            GcRequest::FinishMarking => GcPhase::Clean,
            GcRequest::FinishCleaning => GcPhase::Idle,
            GcRequest::None | GcRequest::Minor => phase,
        }
    }
}

/// Packed collector state: (request, phase, cycle, domains).
#[derive(Debug)]
pub struct GcState(AtomicU64);

impl GcState {
    const REQUEST_MASK: u64 = 0b111;
    const PHASE_SHIFT: u32 = 3;
    const PHASE_MASK: u64 = 0b11;
    const CYCLE_SHIFT: u32 = 5;
    const CYCLE_MASK: u64 = (1u64 << 27) - 1; // 27 bits
    const DOMAINS_SHIFT: u32 = 32;

    #[inline(always)]
    fn pack(request: GcRequest, phase: GcPhase, cycle: u32, domains: u32) -> u64 {
        debug_assert!((cycle as u64) <= Self::CYCLE_MASK);
        (request as u64)
            | ((phase as u64) << Self::PHASE_SHIFT)
            | ((cycle as u64) << Self::CYCLE_SHIFT)
            | ((domains as u64) << Self::DOMAINS_SHIFT)
    }

    #[inline(always)]
    fn unpack(word: u64) -> (GcRequest, GcPhase, u32, u32) {
        let request = GcRequest::from((word & Self::REQUEST_MASK) as u8);
        let phase = GcPhase::from(((word >> Self::PHASE_SHIFT) & Self::PHASE_MASK) as u8);
        let cycle = ((word >> Self::CYCLE_SHIFT) & Self::CYCLE_MASK) as u32;
        let domains = (word >> Self::DOMAINS_SHIFT) as u32;
        (request, phase, cycle, domains)
    }

    pub fn new() -> Self {
        Self(AtomicU64::new(Self::pack(GcRequest::None, GcPhase::Idle, 0, 0)))
    }

    /// Returns (request, phase, cycle, domains, raw word).
    #[inline(always)]
    pub fn load(&self, ord: Ordering) -> (GcRequest, GcPhase, u32, u32, u64) {
        let w = self.0.load(ord);
        let (r, p, c, d) = Self::unpack(w);
        (r, p, c, d, w)
    }

    #[inline(always)]
    pub fn phase(&self) -> GcPhase {
        self.load(Ordering::Acquire).1
    }

    /// Register a domain. Only allowed while no request is active.
    pub fn register_domain(&self) {
        use std::sync::atomic::Ordering::*;
        loop {
            let (request, phase, cycle, domains, cur) = self.load(Acquire);
            if request != GcRequest::None {
                std::thread::yield_now();
                continue;
            }
            let domains = domains.checked_add(1).expect("domain count overflow");
            let next = Self::pack(request, phase, cycle, domains);
            if self.0.compare_exchange(cur, next, AcqRel, Acquire).is_ok() {
                return;
            }
        }
    }

    /// Deregister a domain, provided the state is still exactly `expected`
    /// and no request is active.
    pub fn deregister_domain(&self, expected: u64) -> bool {
        use std::sync::atomic::Ordering::*;
        let (request, phase, cycle, domains) = Self::unpack(expected);
        if request != GcRequest::None {
            return false;
        }
        let domains = domains.checked_sub(1).expect("domain count underflow");
        let next = Self::pack(request, phase, cycle, domains);
        self.0.compare_exchange(expected, next, AcqRel, Acquire).is_ok()
    }

    /// Attempt to post `requested`.
    /// Returns (posted, active request, participants).
    ///
    /// Fails with [`GcRequest::None`] when `requested` does not apply to the
    /// current phase, which happens when another domain got there first.
    pub fn try_request(&self, requested: GcRequest) -> (bool, GcRequest, u32) {
        use std::sync::atomic::Ordering::*;
        loop {
            let (request, phase, cycle, domains, cur) = self.load(Acquire);
            if request != GcRequest::None {
                return (false, request, domains);
            }
            if !requested.applies_to(phase) {
                return (false, GcRequest::None, domains);
            }
            let cycle = if requested == GcRequest::StartCycle {
                cycle.wrapping_add(1) & (Self::CYCLE_MASK as u32)
            } else {
                cycle
            };
            let next = Self::pack(requested, phase, cycle, domains);
            if self.0.compare_exchange(cur, next, AcqRel, Acquire).is_ok() {
                return (true, requested, domains);
            }
        }
    }

    /// End the active request (coordinator only), moving to its next phase.
    pub fn finish(&self) {
        use std::sync::atomic::Ordering::*;
        loop {
            let (request, phase, cycle, domains, cur) = self.load(Acquire);
            if request == GcRequest::None {
                return;
            }
            let next = Self::pack(GcRequest::None, request.next_phase(phase), cycle, domains);
            if self.0.compare_exchange(cur, next, AcqRel, Acquire).is_ok() {
                return;
            }
        }
    }
}

impl Default for GcState {
    fn default() -> Self {
        Self::new()
    }
}

// ── Trackers / sync ───────────────────────────────────────────────────

/// What a domain hands to the coordinator at a rendezvous.
#[derive(Debug, Default)]
pub struct RootSet {
    pub roots: Vec<Value>,
    /// Tenured blocks holding a reference into a nursery.
    pub remember: Vec<Value>,
    /// Ephemeron slots holding a reference into a nursery.
    pub ephemeron_refs: Vec<(Value, usize)>,
    /// The domain's nursery.
    pub young: Vec<Value>,
    /// Head of the domain's ephemeron registry.
    pub ephemerons: Value,
}

/// Global counters.
#[derive(Debug)]
pub struct Trackers {
    /// Current mark epoch; a block is marked iff its mark equals it.
    pub epoch: AtomicU8,
    /// Next domain id. Ids are handed out once and never wrap.
    pub next_domain: AtomicU32,
    /// Tenured words allocated since the current or last cycle started.
    pub tenured_allocated: AtomicUsize,
    pub minor_collections: AtomicU64,
    pub cycles: AtomicU64,
    pub promoted: AtomicU64,
    pub freed_young: AtomicU64,
    pub swept: AtomicU64,
    pub released_keys: AtomicU64,
    pub released_data: AtomicU64,
}

/// Snapshot of [`Trackers`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub minor_collections: u64,
    /// Completed major cycles.
    pub cycles: u64,
    pub promoted: u64,
    pub freed_young: u64,
    pub swept: u64,
    pub released_keys: u64,
    pub released_data: u64,
}

/// Synchronization state for rendezvous.
#[derive(Debug)]
pub struct SyncState {
    pub state: GcState,
    pub barrier: SenseBarrier,
    /// Submissions of the current rendezvous.
    pub inputs: Mutex<Vec<RootSet>>,
    /// Registry heads left behind by deregistered domains, waiting to be
    /// adopted by the next coordinator.
    pub orphans: Mutex<Vec<Value>>,
}

impl SyncState {
    fn new() -> Self {
        Self {
            state: GcState::new(),
            barrier: SenseBarrier::new(),
            inputs: Mutex::new(Vec::new()),
            orphans: Mutex::new(Vec::new()),
        }
    }
}

// ── HeapInner ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct HeapObject {
    header: Header,
    words: Box<[AtomicU64]>,
}

/// Core shared heap state.
#[derive(Debug)]
pub struct HeapInner {
    pub settings: HeapSettings,
    pub track: Trackers,
    pub sync: SyncState,
    objects: RwLock<Vec<HeapObject>>,
    /// Marked blocks whose fields have not been scanned yet.
    gray: Mutex<Vec<Value>>,
}

impl HeapInner {
    pub fn new(settings: HeapSettings) -> Self {
        settings.validate().expect("Invalid Heap Settings");

        let track = Trackers {
            epoch: AtomicU8::new(1),
            next_domain: AtomicU32::new(0),
            tenured_allocated: AtomicUsize::new(0),
            minor_collections: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
            promoted: AtomicU64::new(0),
            freed_young: AtomicU64::new(0),
            swept: AtomicU64::new(0),
            released_keys: AtomicU64::new(0),
            released_data: AtomicU64::new(0),
        };

        Self {
            settings,
            track,
            sync: SyncState::new(),
            objects: RwLock::new(Vec::new()),
            gray: Mutex::new(Vec::new()),
        }
    }

    pub fn epoch(&self) -> u8 {
        self.track.epoch.load(Ordering::Relaxed)
    }

    pub fn phase(&self) -> GcPhase {
        self.sync.state.phase()
    }

    pub fn stats(&self) -> HeapStats {
        let t = &self.track;
        HeapStats {
            minor_collections: t.minor_collections.load(Ordering::Relaxed),
            cycles: t.cycles.load(Ordering::Relaxed),
            promoted: t.promoted.load(Ordering::Relaxed),
            freed_young: t.freed_young.load(Ordering::Relaxed),
            swept: t.swept.load(Ordering::Relaxed),
            released_keys: t.released_keys.load(Ordering::Relaxed),
            released_data: t.released_data.load(Ordering::Relaxed),
        }
    }

    /// Hands out a fresh domain id. Panics once the id space is used up
    /// rather than giving a live domain's id to a new one.
    pub fn next_domain_id(&self) -> DomainId {
        let id = self
            .track
            .next_domain
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(1))
            .expect("domain ids exhausted");
        DomainId(id)
    }

    // ── Object table ──────────────────────────────────────────────────

    /// Appends a block with every word set to [`Value::NONE`].
    pub fn allocate(&self, shape: Shape, young: bool, owner: DomainId, mark: u8) -> Value {
        let header = Header::new(shape.object_type);
        if young {
            header.set_flags(HeaderFlags::YOUNG);
            header.set_owner(owner.0);
        }
        header.set_mark(mark);
        let words = (0..shape.words)
            .map(|_| AtomicU64::new(Value::NONE.raw()))
            .collect();

        let mut objects = self.objects.write();
        let value = Value::from_index(objects.len());
        objects.push(HeapObject { header, words });
        value
    }

    #[inline]
    fn with_object<T>(&self, value: Value, f: impl FnOnce(&HeapObject) -> T) -> T {
        debug_assert!(value.is_ref(), "{value:?} is not a reference");
        let objects = self.objects.read();
        f(&objects[value.index()])
    }

    pub(crate) fn with_header<T>(&self, value: Value, f: impl FnOnce(&Header) -> T) -> T {
        self.with_object(value, |o| f(&o.header))
    }

    pub fn shape(&self, value: Value) -> Shape {
        self.with_object(value, |o| Shape::new(o.header.object_type(), o.words.len()))
    }

    pub fn field(&self, value: Value, index: usize) -> Value {
        self.with_object(value, |o| Value::from_raw(o.words[index].load(Ordering::Relaxed)))
    }

    pub fn set_field(&self, value: Value, index: usize, field: Value) {
        self.with_object(value, |o| o.words[index].store(field.raw(), Ordering::Relaxed));
    }

    pub fn fields(&self, value: Value) -> Vec<Value> {
        self.with_object(value, |o| {
            o.words
                .iter()
                .map(|w| Value::from_raw(w.load(Ordering::Relaxed)))
                .collect()
        })
    }

    pub fn copy_words(&self, src: Value, dst: Value) {
        let words = self.fields(src);
        self.with_object(dst, |o| {
            debug_assert_eq!(o.words.len(), words.len());
            for (slot, word) in o.words.iter().zip(words) {
                slot.store(word.raw(), Ordering::Relaxed);
            }
        });
    }

    pub fn flags(&self, value: Value) -> HeaderFlags {
        self.with_object(value, |o| o.header.flags())
    }

    /// Immediates are never young.
    pub fn is_young(&self, value: Value) -> bool {
        value.is_ref() && self.flags(value).contains(HeaderFlags::YOUNG)
    }

    pub fn is_freed(&self, value: Value) -> bool {
        value.is_ref() && self.flags(value).contains(HeaderFlags::FREED)
    }

    pub fn is_marked(&self, value: Value) -> bool {
        if !value.is_ref() {
            return false;
        }
        let epoch = self.epoch();
        self.with_object(value, |o| o.header.mark() == epoch)
    }

    /// Number of blocks not reclaimed yet, young ones included.
    pub fn live_objects(&self) -> usize {
        self.objects
            .read()
            .iter()
            .filter(|o| !o.header.has_flag(HeaderFlags::FREED))
            .count()
    }

    /// Fields the collector follows. Ephemerons are handled apart and raw
    /// kinds have none.
    fn traced_fields(&self, value: Value) -> Vec<Value> {
        self.with_object(value, |o| match o.header.object_type() {
            ObjectType::Ephemeron => Vec::new(),
            ty if ty.is_scannable() => o
                .words
                .iter()
                .map(|w| Value::from_raw(w.load(Ordering::Relaxed)))
                .collect(),
            _ => Vec::new(),
        })
    }

    // ── Marking ───────────────────────────────────────────────────────

    /// Marks a tenured block and queues it for scanning. Returns `true` if
    /// this call marked it.
    pub fn darken(&self, value: Value) -> bool {
        if !value.is_ref() {
            return false;
        }
        let epoch = self.epoch();
        let newly = self.with_object(value, |o| {
            let flags = o.header.flags();
            debug_assert!(!flags.contains(HeaderFlags::FREED), "darkening freed {value:?}");
            !flags.contains(HeaderFlags::YOUNG) && o.header.try_mark(epoch)
        });
        if newly {
            self.gray.lock().push(value);
        }
        newly
    }

    fn scan(&self, value: Value) {
        for child in self.traced_fields(value) {
            self.darken(child);
        }
    }

    /// Scans up to `budget` gray blocks. Returns `true` once the gray queue
    /// is empty.
    pub fn mark_slice(&self, budget: usize) -> bool {
        for _ in 0..budget {
            let next = self.gray.lock().pop();
            let Some(value) = next else {
                return true;
            };
            self.scan(value);
        }
        self.gray.lock().is_empty()
    }

    fn drain_gray(&self) -> usize {
        let mut scanned = 0;
        loop {
            let next = self.gray.lock().pop();
            let Some(value) = next else {
                return scanned;
            };
            self.scan(value);
            scanned += 1;
        }
    }

    fn advance_epoch(&self) -> u8 {
        use std::sync::atomic::Ordering::*;
        loop {
            let current = self.track.epoch.load(Relaxed);
            let mut next = current.wrapping_add(1);
            if next == 0 {
                next = 1;
            }
            match self
                .track
                .epoch
                .compare_exchange(current, next, Release, Relaxed)
            {
                Ok(_) => return next,
                Err(_) => continue,
            }
        }
    }

    // ── Collection steps (coordinator only) ───────────────────────────

    /// Runs the coordinator's share of a rendezvous over every domain's
    /// submission.
    pub(crate) fn collect(&self, request: GcRequest, inputs: &[RootSet]) {
        match request {
            GcRequest::Minor => self.minor_collection(inputs),
            GcRequest::StartCycle => {
                self.minor_collection(inputs);
                let epoch = self.advance_epoch();
                self.track.tenured_allocated.store(0, Ordering::Relaxed);
                log::debug!("major cycle started (epoch {epoch})");
            }
            GcRequest::FinishMarking => self.finish_marking(inputs),
            GcRequest::FinishCleaning => {
                let swept = self.sweep();
                self.track.swept.fetch_add(swept as u64, Ordering::Relaxed);
                let cycles = self.track.cycles.fetch_add(1, Ordering::Relaxed) + 1;
                log::debug!("major cycle {cycles} finished: {swept} blocks swept");
            }
            GcRequest::None => {}
        }
    }

    /// Promotes every reachable young block in place and frees the rest.
    ///
    /// Young keys of ephemerons are weak: a young payload is only promoted
    /// once every key of its record survives, and young keys nothing else
    /// reaches are cleared together with their payload.
    fn minor_collection(&self, inputs: &[RootSet]) {
        let mut promotion = Promotion {
            black: self.phase() != GcPhase::Idle,
            epoch: self.epoch(),
            stack: Vec::new(),
            promoted: 0,
        };

        for input in inputs {
            for &obj in &input.remember {
                if self.is_freed(obj) {
                    continue;
                }
                self.with_object(obj, |o| o.header.remove_flag(HeaderFlags::REMEMBERED));
                for child in self.traced_fields(obj) {
                    promotion.visit(self, child);
                }
            }
            for &root in &input.roots {
                promotion.visit(self, root);
            }
        }
        promotion.drain(self);

        let mut records: Vec<Value> = inputs
            .iter()
            .flat_map(|input| input.ephemeron_refs.iter().map(|&(record, _)| record))
            .filter(|&record| !self.is_freed(record))
            .collect();
        records.sort_unstable_by_key(|record| record.raw());
        records.dedup();

        loop {
            let mut progress = false;
            for &record in &records {
                let data = self.field(record, DATA_OFFSET);
                if self.is_young(data) && self.young_keys_survive(record) {
                    promotion.visit(self, data);
                    promotion.drain(self);
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }

        let mut cleared = 0;
        for &record in &records {
            let words = self.shape(record).words;
            let mut dead_key = false;
            for offset in FIRST_KEY..words {
                let key = self.field(record, offset);
                if !self.is_young(key) {
                    continue;
                }
                match self.forward_target(key).filter(|&t| !self.is_young(t)) {
                    Some(target) => self.set_field(record, offset, target),
                    None => {
                        self.set_field(record, offset, Value::NONE);
                        dead_key = true;
                        cleared += 1;
                    }
                }
            }
            let data = self.field(record, DATA_OFFSET);
            if !data.is_none() && (dead_key || self.is_young(data)) {
                self.set_field(record, DATA_OFFSET, Value::NONE);
                cleared += 1;
            }
        }

        let mut freed = 0;
        {
            let mut objects = self.objects.write();
            for &young in inputs.iter().flat_map(|input| &input.young) {
                let o = &mut objects[young.index()];
                if o.header.has_flag(HeaderFlags::YOUNG) {
                    o.header.set_flags(HeaderFlags::FREED);
                    o.words = Box::default();
                    freed += 1;
                }
            }
        }

        self.track.minor_collections.fetch_add(1, Ordering::Relaxed);
        self.track.promoted.fetch_add(promotion.promoted as u64, Ordering::Relaxed);
        self.track.freed_young.fetch_add(freed, Ordering::Relaxed);
        log::debug!(
            "minor collection: {} promoted, {freed} freed, {cleared} ephemeron slots cleared",
            promotion.promoted
        );
    }

    fn young_keys_survive(&self, record: Value) -> bool {
        let words = self.shape(record).words;
        (FIRST_KEY..words).all(|offset| self.survives_minor(self.field(record, offset)))
    }

    /// A young key forwarding to a block outside the nursery lives on as
    /// that block.
    fn survives_minor(&self, key: Value) -> bool {
        !self.is_young(key) || self.forward_target(key).is_some_and(|t| !self.is_young(t))
    }

    /// Target of a forwarding block the ephemeron cleaning would
    /// short-circuit; mirrors [`ephemeron::resolve_forward`].
    fn forward_target(&self, value: Value) -> Option<Value> {
        if !value.is_ref() {
            return None;
        }
        let shape = self.shape(value);
        if shape.object_type != ObjectType::Forward || shape.words == 0 {
            return None;
        }
        let target = self.field(value, 0);
        if !target.is_ref() {
            return None;
        }
        match self.shape(target).object_type {
            ObjectType::Forward | ObjectType::Lazy | ObjectType::Double => None,
            _ => Some(target),
        }
    }

    /// Drains the gray queue and traces ephemeron payloads until nothing new
    /// gets marked.
    ///
    /// A payload is traced when its record is marked and every non-empty key
    /// is alive: immediate, young, or marked.
    fn finish_marking(&self, inputs: &[RootSet]) {
        let orphans = self.sync.orphans.lock().clone();
        let mut records = Vec::new();
        for head in inputs.iter().map(|input| input.ephemerons).chain(orphans) {
            let mut record = head;
            while !record.is_none() {
                records.push(record);
                record = self.field(record, LINK_OFFSET);
            }
        }

        let mut scanned = self.drain_gray();
        let mut traced = 0;
        loop {
            let mut progress = false;
            for &record in &records {
                if !self.is_marked(record) {
                    continue;
                }
                let data = self.field(record, DATA_OFFSET);
                if !data.is_ref() || self.is_young(data) || self.is_marked(data) {
                    continue;
                }
                if self.keys_alive(record) {
                    self.darken(data);
                    traced += 1;
                    progress = true;
                }
            }
            if !progress {
                break;
            }
            scanned += self.drain_gray();
        }

        log::debug!(
            "marking finished: {scanned} blocks scanned, {traced} of {} ephemeron payloads traced",
            records.len()
        );
    }

    fn keys_alive(&self, record: Value) -> bool {
        let words = self.shape(record).words;
        let alive = |key: Value| !key.is_ref() || self.is_young(key) || self.is_marked(key);
        (FIRST_KEY..words).all(|offset| {
            let key = self.field(record, offset);
            alive(key) || self.forward_target(key).is_some_and(alive)
        })
    }

    /// Reclaims every tenured block the cycle left unmarked.
    fn sweep(&self) -> usize {
        let epoch = self.epoch();
        let mut objects = self.objects.write();
        let mut swept = 0;
        for o in objects.iter_mut() {
            let flags = o.header.flags();
            if flags.contains(HeaderFlags::FREED)
                || flags.contains(HeaderFlags::YOUNG)
                || o.header.mark() == epoch
            {
                continue;
            }
            o.header.set_flags(HeaderFlags::FREED);
            o.words = Box::default();
            swept += 1;
        }
        swept
    }

    pub(crate) fn take_orphans(&self) -> Vec<Value> {
        std::mem::take(&mut *self.sync.orphans.lock())
    }

    pub(crate) fn note_cleaned(&self, cleaned: Cleaned) {
        if cleaned.is_empty() {
            return;
        }
        self.track
            .released_keys
            .fetch_add(cleaned.keys as u64, Ordering::Relaxed);
        if cleaned.data {
            self.track.released_data.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Worklist of a minor collection.
struct Promotion {
    /// Promote marked: the block was allocated during a cycle.
    black: bool,
    epoch: u8,
    stack: Vec<Value>,
    promoted: usize,
}

impl Promotion {
    fn visit(&mut self, heap: &HeapInner, value: Value) {
        if !value.is_ref() {
            return;
        }
        let promoted = heap.with_object(value, |o| {
            if !o.header.has_flag(HeaderFlags::YOUNG) {
                return false;
            }
            o.header.remove_flag(HeaderFlags::YOUNG);
            if self.black {
                o.header.set_mark(self.epoch);
            }
            true
        });
        if promoted {
            self.promoted += 1;
            self.stack.push(value);
        }
    }

    fn drain(&mut self, heap: &HeapInner) {
        while let Some(value) = self.stack.pop() {
            for child in heap.traced_fields(value) {
                self.visit(heap, child);
            }
        }
    }
}

// ── Heap (Arc wrapper) ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Heap(Arc<HeapInner>);

impl Heap {
    #[must_use]
    pub fn new(settings: HeapSettings) -> Self {
        Self(Arc::new(HeapInner::new(settings)))
    }

    /// Registers a new domain on this heap.
    #[must_use]
    pub fn domain(&self) -> Domain {
        Domain::new(self.clone())
    }
}

impl Deref for Heap {
    type Target = HeapInner;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_settings() -> HeapSettings {
        HeapSettings {
            max_object_words: 64,
            nursery_words: 1024,
            cycle_words: 4096,
            slice_budget: 8,
            alloc_per_slice: 4,
        }
    }

    fn tuple(heap: &HeapInner, fields: &[Value]) -> Value {
        let v = heap.allocate(Shape::new(ObjectType::Tuple, fields.len()), false, DomainId(0), 0);
        for (i, &f) in fields.iter().enumerate() {
            heap.set_field(v, i, f);
        }
        v
    }

    #[test]
    fn settings_validation() {
        assert!(HeapSettings::default().validate().is_ok());
        assert!(create_test_settings().validate().is_ok());

        let mut s = create_test_settings();
        s.max_object_words = FIRST_KEY;
        assert!(s.validate().is_err());

        let mut s = create_test_settings();
        s.max_object_words = s.nursery_words + 1;
        assert!(s.validate().is_err());

        let mut s = create_test_settings();
        s.slice_budget = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn state_pack_round_trip() {
        for (r, p, c, d) in [
            (GcRequest::None, GcPhase::Idle, 0, 0),
            (GcRequest::FinishCleaning, GcPhase::Clean, (1 << 27) - 1, u32::MAX),
            (GcRequest::Minor, GcPhase::Mark, 12345, 7),
        ] {
            assert_eq!(GcState::unpack(GcState::pack(r, p, c, d)), (r, p, c, d));
        }
    }

    #[test]
    fn requests_follow_the_phase_machine() {
        let state = GcState::new();
        state.register_domain();

        assert_eq!(state.try_request(GcRequest::FinishMarking), (false, GcRequest::None, 1));
        assert_eq!(state.try_request(GcRequest::StartCycle), (true, GcRequest::StartCycle, 1));
        // Only one coordinator at a time.
        assert_eq!(state.try_request(GcRequest::Minor), (false, GcRequest::StartCycle, 1));
        state.finish();

        let (request, phase, cycle, domains, _) = state.load(Ordering::Relaxed);
        assert_eq!((request, phase, cycle, domains), (GcRequest::None, GcPhase::Mark, 1, 1));

        assert!(state.try_request(GcRequest::Minor).0);
        state.finish();
        assert_eq!(state.phase(), GcPhase::Mark);

        assert!(state.try_request(GcRequest::FinishMarking).0);
        state.finish();
        assert!(state.try_request(GcRequest::FinishCleaning).0);
        state.finish();
        assert_eq!(state.phase(), GcPhase::Idle);
    }

    #[test]
    fn deregistration_needs_an_unchanged_idle_word() {
        let state = GcState::new();
        state.register_domain();
        state.register_domain();
        let (_, _, _, _, word) = state.load(Ordering::Relaxed);

        assert!(state.try_request(GcRequest::Minor).0);
        assert!(!state.deregister_domain(word));
        let (_, _, _, _, busy) = state.load(Ordering::Relaxed);
        assert!(!state.deregister_domain(busy));
        state.finish();

        let (_, _, _, _, word) = state.load(Ordering::Relaxed);
        assert!(state.deregister_domain(word));
        assert_eq!(state.load(Ordering::Relaxed).3, 1);
    }

    #[test]
    fn epoch_skips_zero() {
        let heap = HeapInner::new(create_test_settings());
        heap.track.epoch.store(u8::MAX, Ordering::Relaxed);
        assert_eq!(heap.advance_epoch(), 1);
        assert_eq!(heap.advance_epoch(), 2);
    }

    #[test]
    fn fresh_blocks_are_empty_and_unmarked() {
        let heap = HeapInner::new(create_test_settings());
        let v = heap.allocate(Shape::new(ObjectType::Tuple, 3), false, DomainId(0), 0);
        assert_eq!(heap.fields(v), vec![Value::NONE; 3]);
        assert!(!heap.is_marked(v));
        assert!(!heap.is_young(v));
        assert_eq!(heap.shape(v), Shape::new(ObjectType::Tuple, 3));

        let y = heap.allocate(Shape::new(ObjectType::Bytes, 1), true, DomainId(3), 0);
        assert!(heap.is_young(y));
        assert_eq!(heap.with_object(y, |o| o.header.owner()), 3);
    }

    #[test]
    fn marking_traces_tuples_but_not_ephemerons() {
        let heap = HeapInner::new(create_test_settings());
        let leaf = tuple(&heap, &[]);
        let behind_ephemeron = tuple(&heap, &[]);
        let e = heap.allocate(Shape::new(ObjectType::Ephemeron, FIRST_KEY + 1), false, DomainId(0), 0);
        heap.set_field(e, DATA_OFFSET, behind_ephemeron);
        let raw = heap.allocate(Shape::new(ObjectType::Double, 1), false, DomainId(0), 0);
        heap.set_field(raw, 0, leaf);
        let root = tuple(&heap, &[leaf, e, raw, Value::from_i64(4)]);

        assert!(heap.darken(root));
        assert!(!heap.darken(root), "second darken is a no-op");
        assert!(heap.mark_slice(usize::MAX));

        for v in [root, leaf, e, raw] {
            assert!(heap.is_marked(v), "{v:?}");
        }
        assert!(!heap.is_marked(behind_ephemeron));
    }

    #[test]
    fn mark_slice_respects_budget() {
        let heap = HeapInner::new(create_test_settings());
        let mut chain = Value::from_i64(0);
        for _ in 0..10 {
            chain = tuple(&heap, &[chain]);
        }
        heap.darken(chain);
        assert!(!heap.mark_slice(3));
        assert!(heap.mark_slice(100));
    }

    #[test]
    fn sweep_reclaims_unmarked_tenured_only() {
        let heap = HeapInner::new(create_test_settings());
        let live = tuple(&heap, &[]);
        let dead = tuple(&heap, &[Value::from_i64(1)]);
        let young = heap.allocate(Shape::new(ObjectType::Tuple, 1), true, DomainId(0), 0);
        heap.darken(live);

        assert_eq!(heap.sweep(), 1);
        assert!(heap.is_freed(dead));
        assert!(!heap.is_freed(live));
        assert!(!heap.is_freed(young));
        assert_eq!(heap.shape(dead).words, 0);
        assert_eq!(heap.live_objects(), 2);
    }

    #[test]
    fn minor_collection_promotes_reachable_and_frees_rest() {
        let heap = HeapInner::new(create_test_settings());
        let young = |heap: &HeapInner, fields: &[Value]| {
            let v = heap.allocate(Shape::new(ObjectType::Tuple, fields.len()), true, DomainId(0), 0);
            for (i, &f) in fields.iter().enumerate() {
                heap.set_field(v, i, f);
            }
            v
        };
        let child = young(&heap, &[]);
        let rooted = young(&heap, &[child]);
        let garbage = young(&heap, &[]);
        let via_old = young(&heap, &[]);
        let old = tuple(&heap, &[via_old]);

        heap.minor_collection(&[RootSet {
            roots: vec![rooted],
            remember: vec![old],
            young: vec![child, rooted, garbage, via_old],
            ..Default::default()
        }]);

        for v in [child, rooted, via_old] {
            assert!(!heap.is_young(v) && !heap.is_freed(v), "{v:?}");
            assert!(!heap.is_marked(v), "promoted outside a cycle stays unmarked");
        }
        assert!(heap.is_freed(garbage));
        assert_eq!(heap.stats().promoted, 3);
        assert_eq!(heap.stats().freed_young, 1);
    }

    #[test]
    fn minor_collection_treats_young_keys_weakly() {
        let heap = HeapInner::new(create_test_settings());
        let young = |heap: &HeapInner| heap.allocate(Shape::new(ObjectType::Tuple, 0), true, DomainId(0), 0);
        let record = |heap: &HeapInner, key: Value, data: Value| {
            let e = heap.allocate(Shape::new(ObjectType::Ephemeron, FIRST_KEY + 1), false, DomainId(0), 0);
            heap.set_field(e, DATA_OFFSET, data);
            heap.set_field(e, FIRST_KEY, key);
            e
        };

        let live_key = young(&heap);
        let live_data = young(&heap);
        let dead_key = young(&heap);
        let dead_data = young(&heap);
        let kept = record(&heap, live_key, live_data);
        let dropped = record(&heap, dead_key, dead_data);

        heap.minor_collection(&[RootSet {
            roots: vec![live_key],
            ephemeron_refs: vec![
                (kept, FIRST_KEY),
                (kept, DATA_OFFSET),
                (dropped, FIRST_KEY),
                (dropped, DATA_OFFSET),
            ],
            young: vec![live_key, live_data, dead_key, dead_data],
            ..Default::default()
        }]);

        assert_eq!(heap.field(kept, FIRST_KEY), live_key);
        assert_eq!(heap.field(kept, DATA_OFFSET), live_data);
        assert!(!heap.is_freed(live_data));

        assert_eq!(heap.field(dropped, FIRST_KEY), Value::NONE);
        assert_eq!(heap.field(dropped, DATA_OFFSET), Value::NONE);
        assert!(heap.is_freed(dead_key) && heap.is_freed(dead_data));
    }

    #[test]
    fn fixpoint_traces_payloads_of_live_keys_only() {
        let heap = HeapInner::new(create_test_settings());
        let record = |heap: &HeapInner, next: Value, keys: &[Value], data: Value| {
            let e = heap.allocate(
                Shape::new(ObjectType::Ephemeron, FIRST_KEY + keys.len()),
                false,
                DomainId(0),
                0,
            );
            heap.set_field(e, LINK_OFFSET, next);
            heap.set_field(e, DATA_OFFSET, data);
            for (i, &k) in keys.iter().enumerate() {
                heap.set_field(e, FIRST_KEY + i, k);
            }
            e
        };

        // k1 is rooted; d1 is only reachable through e1 and is itself the key
        // of e2, whose payload must therefore be traced too.
        let k1 = tuple(&heap, &[]);
        let d1 = tuple(&heap, &[]);
        let d2 = tuple(&heap, &[]);
        let dead_key = tuple(&heap, &[]);
        let d3 = tuple(&heap, &[]);
        let e3 = record(&heap, Value::NONE, &[k1, dead_key], d3);
        let e2 = record(&heap, e3, &[d1, Value::NONE], d2);
        let e1 = record(&heap, e2, &[k1], d1);
        let root = tuple(&heap, &[k1, e1, e2, e3]);

        heap.advance_epoch();
        heap.darken(root);
        heap.finish_marking(&[RootSet {
            ephemerons: e1,
            ..Default::default()
        }]);

        assert!(heap.is_marked(d1));
        assert!(heap.is_marked(d2));
        assert!(!heap.is_marked(d3));
        assert!(!heap.is_marked(dead_key));
    }
}
