//! A domain is one mutator thread's view of the heap: its nursery, its
//! remembered sets, its roots and its ephemeron registry.
//!
//! Domains cooperate through rendezvous. Whoever wins the request in
//! [`crate::GcState::try_request`] posts it; every domain, the requester
//! included, joins at its next allocation or safepoint. A rendezvous has four
//! barrier-separated steps:
//!
//! 1. every domain submits a [`RootSet`]; the last to arrive becomes the
//!    coordinator,
//! 2. the coordinator runs the collection over all submissions,
//! 3. every domain catches up with the result,
//! 4. the coordinator publishes the next phase.

use std::sync::atomic::Ordering;

use ephemeron::{DOMAIN_OFFSET, DomainId, Ephemeron, GcPhase, Runtime};
use object::{HeaderFlags, ObjectType, Shape, Value};

use crate::{GcRequest, Heap, RootSet};

pub struct Domain {
    heap: Heap,
    id: DomainId,
    roots: Vec<Value>,
    /// Blocks allocated in the nursery since the last minor collection.
    young: Vec<Value>,
    nursery_used: usize,
    /// Tenured blocks holding nursery references.
    remember: Vec<Value>,
    /// Ephemeron slots holding nursery references.
    ephemeron_refs: Vec<(Value, usize)>,
    /// Registry head. During `Clean` this is the list being rebuilt.
    ephemerons: Value,
    /// Next record still to clean in the current cycle.
    clean_cursor: Option<Ephemeron>,
    until_slice: usize,
}

impl Domain {
    #[must_use]
    pub fn new(heap: Heap) -> Self {
        let id = heap.next_domain_id();
        heap.sync.state.register_domain();
        log::trace!("{id} registered");
        let until_slice = heap.settings.alloc_per_slice;
        Self {
            heap,
            id,
            roots: Vec::new(),
            young: Vec::new(),
            nursery_used: 0,
            remember: Vec::new(),
            ephemeron_refs: Vec::new(),
            ephemerons: Value::NONE,
            clean_cursor: None,
            until_slice,
        }
    }

    pub fn id(&self) -> DomainId {
        self.id
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn phase(&self) -> GcPhase {
        self.heap.phase()
    }

    // ── Roots ─────────────────────────────────────────────────────────

    pub fn push_root(&mut self, value: Value) -> usize {
        self.roots.push(value);
        self.roots.len() - 1
    }

    pub fn pop_root(&mut self) -> Option<Value> {
        self.roots.pop()
    }

    pub fn root(&self, index: usize) -> Value {
        self.roots[index]
    }

    pub fn set_root(&mut self, index: usize, value: Value) {
        self.roots[index] = value;
    }

    pub fn roots(&self) -> &[Value] {
        &self.roots
    }

    pub fn truncate_roots(&mut self, len: usize) {
        self.roots.truncate(len);
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Allocates a nursery block holding `words`.
    pub fn alloc(&mut self, object_type: ObjectType, words: &[Value]) -> Value {
        self.allocate_with(object_type, words, true)
    }

    pub fn alloc_tuple(&mut self, words: &[Value]) -> Value {
        self.alloc(ObjectType::Tuple, words)
    }

    /// Allocates directly in the tenured heap.
    pub fn alloc_shared(&mut self, object_type: ObjectType, words: &[Value]) -> Value {
        self.allocate_with(object_type, words, false)
    }

    fn allocate_with(&mut self, object_type: ObjectType, words: &[Value], young: bool) -> Value {
        // Keep traced words alive across the collection the allocation may run.
        let pinned = object_type.is_scannable();
        let base = self.roots.len();
        if pinned {
            self.roots.extend_from_slice(words);
        }
        let obj = self.allocate(Shape::new(object_type, words.len()), young);
        let words = if pinned {
            self.roots.split_off(base)
        } else {
            words.to_vec()
        };
        for (i, word) in words.into_iter().enumerate() {
            if young || !pinned {
                self.heap.set_field(obj, i, word);
            } else {
                self.store_field(obj, i, word);
            }
        }
        obj
    }

    fn allocate(&mut self, shape: Shape, young: bool) -> Value {
        let max = self.heap.settings.max_object_words;
        assert!(
            shape.words <= max,
            "block of {} words exceeds the maximum of {max}",
            shape.words
        );

        self.poll();
        if young && self.nursery_used + shape.words > self.heap.settings.nursery_words {
            self.collect_minor();
        }

        let mark = if !young && self.heap.phase() != GcPhase::Idle {
            self.heap.epoch()
        } else {
            0
        };
        let obj = self.heap.allocate(shape, young, self.id, mark);
        if young {
            self.young.push(obj);
            self.nursery_used += shape.words;
        } else {
            self.heap
                .track
                .tenured_allocated
                .fetch_add(shape.words, Ordering::Relaxed);
        }
        obj
    }

    #[inline]
    fn poll(&mut self) {
        self.until_slice = self.until_slice.saturating_sub(1);
        if self.until_slice == 0 {
            self.until_slice = self.heap.settings.alloc_per_slice;
            self.safepoint();
        } else if self.heap.sync.state.load(Ordering::Relaxed).0 != GcRequest::None {
            self.rendezvous();
        }
    }

    // ── Mutation ──────────────────────────────────────────────────────

    /// Store into an ordinary block. Ephemeron slots go through
    /// [`Ephemeron`] instead.
    pub fn store_field(&mut self, obj: Value, index: usize, value: Value) {
        debug_assert_ne!(self.heap.shape(obj).object_type, ObjectType::Ephemeron);
        if self.heap.phase() == GcPhase::Mark {
            // Snapshot barrier: the overwritten value was reachable when
            // marking started.
            self.heap.darken(self.heap.field(obj, index));
        }
        self.heap.set_field(obj, index, value);
        if self.heap.is_young(value) && !self.heap.is_young(obj) {
            self.write_barrier(obj);
        }
    }

    #[inline]
    fn write_barrier(&mut self, obj: Value) {
        let prev = self.heap.with_header(obj, |h| h.fetch_or_flags(HeaderFlags::REMEMBERED));
        if !prev.contains(HeaderFlags::REMEMBERED) {
            self.remember.push(obj);
        }
    }

    // ── Collection ────────────────────────────────────────────────────

    /// Joins a pending rendezvous, then does one slice of incremental work
    /// for the current phase.
    pub fn safepoint(&mut self) {
        if self.heap.sync.state.load(Ordering::Acquire).0 != GcRequest::None {
            self.rendezvous();
        }

        let budget = self.heap.settings.slice_budget;
        match self.heap.phase() {
            GcPhase::Idle => {
                let allocated = self.heap.track.tenured_allocated.load(Ordering::Relaxed);
                if allocated >= self.heap.settings.cycle_words {
                    self.request(GcRequest::StartCycle);
                }
            }
            GcPhase::Mark => {
                if self.heap.mark_slice(budget) {
                    self.request(GcRequest::FinishMarking);
                }
            }
            GcPhase::Clean => {
                if self.clean_slice(budget) {
                    self.request(GcRequest::FinishCleaning);
                }
            }
        }
    }

    /// Empties every nursery.
    pub fn collect_minor(&mut self) {
        while !self.request(GcRequest::Minor) && !self.nursery_is_empty() {}
    }

    /// Drives the heap to the next phase, doing the remaining work of the
    /// current one. Returns the phase reached.
    pub fn advance_phase(&mut self) -> GcPhase {
        let (_, phase, cycle, _, _) = self.heap.sync.state.load(Ordering::Acquire);
        let request = GcRequest::advancing(phase);
        loop {
            match phase {
                GcPhase::Mark => while !self.heap.mark_slice(usize::MAX) {},
                GcPhase::Clean => self.finish_cleaning(),
                GcPhase::Idle => {}
            }
            self.request(request);
            let (_, now, now_cycle, _, _) = self.heap.sync.state.load(Ordering::Acquire);
            if now != phase || now_cycle != cycle {
                return now;
            }
        }
    }

    /// Runs the current major cycle to completion, starting one if idle.
    pub fn finish_cycle(&mut self) {
        if self.phase() == GcPhase::Idle {
            self.advance_phase();
        }
        while self.phase() != GcPhase::Idle {
            self.advance_phase();
        }
    }

    /// Cleans up to `budget` records. Returns `true` once every record of
    /// this cycle is clean.
    fn clean_slice(&mut self, budget: usize) -> bool {
        for _ in 0..budget {
            if self.clean_cursor.is_none() {
                break;
            }
            self.clean_next();
        }
        self.clean_cursor.is_none()
    }

    fn finish_cleaning(&mut self) {
        while self.clean_cursor.is_some() {
            self.clean_next();
        }
    }

    /// Cleans the record under the cursor and moves it to the rebuilt list.
    /// Unmarked records are dropped from the registry; the sweep frees them.
    fn clean_next(&mut self) {
        let Some(record) = self.clean_cursor else {
            return;
        };
        self.clean_cursor = record.next_live(&*self);
        if !self.heap.is_marked(record.as_value()) {
            return;
        }
        let cleaned = ephemeron::clean(self, record);
        self.heap.note_cleaned(cleaned);
        let head = Ephemeron::cast(&*self, self.ephemerons);
        record.relink(self, head);
        self.ephemerons = record.as_value();
    }

    /// Entries in the remembered sets, ephemeron slots included.
    pub fn remembered_len(&self) -> usize {
        self.remember.len() + self.ephemeron_refs.len()
    }

    fn nursery_is_empty(&self) -> bool {
        self.young.is_empty()
    }

    /// Records left in [`Self::ephemerons`] plus those still waiting to be
    /// cleaned.
    pub fn registry_len(&self) -> usize {
        let mut len = 0;
        for head in [Ephemeron::cast(self, self.ephemerons), self.clean_cursor] {
            let mut next = head;
            while let Some(record) = next {
                len += 1;
                next = record.next_live(self);
            }
        }
        len
    }

    // ── Rendezvous ────────────────────────────────────────────────────

    /// Posts `request`, or joins whatever request is active instead. Returns
    /// `true` if `request` itself was the one carried out.
    fn request(&mut self, request: GcRequest) -> bool {
        let (posted, active, _) = self.heap.sync.state.try_request(request);
        if active != GcRequest::None {
            self.rendezvous();
        }
        posted
    }

    /// Joins the active request. The domain that completes the submission
    /// barrier leads the rest of the rendezvous.
    fn rendezvous(&mut self) {
        let heap = self.heap.clone();
        let (request, _, _, participants, _) = heap.sync.state.load(Ordering::Acquire);
        if request == GcRequest::None {
            return;
        }
        let participants = participants as usize;

        // Phase 1: settle local work, submit
        if request == GcRequest::FinishCleaning {
            self.finish_cleaning();
        }
        let input = self.submission(request);
        heap.sync.inputs.lock().push(input);
        let leader = heap.sync.barrier.wait(participants);

        // Phase 2: leader collects
        if leader {
            let inputs = std::mem::take(&mut *heap.sync.inputs.lock());
            debug_assert_eq!(inputs.len(), participants);
            heap.collect(request, &inputs);
        }
        heap.sync.barrier.wait(participants);

        // Phase 3: catch up
        if leader {
            self.adopt_orphans();
        }
        match request {
            GcRequest::StartCycle => {
                for &root in &self.roots {
                    heap.darken(root);
                }
            }
            GcRequest::FinishMarking => {
                self.clean_cursor = Ephemeron::cast(&*self, self.ephemerons);
                self.ephemerons = Value::NONE;
            }
            _ => {}
        }
        heap.sync.barrier.wait(participants);

        // Phase 4: publish, exit handshake
        if leader {
            heap.sync.state.finish();
            log::trace!("{} finished {request:?}", self.id);
        }
        heap.sync.barrier.wait(participants);
    }

    fn submission(&mut self, request: GcRequest) -> RootSet {
        match request {
            GcRequest::Minor | GcRequest::StartCycle => {
                self.nursery_used = 0;
                RootSet {
                    roots: self.roots.clone(),
                    remember: std::mem::take(&mut self.remember),
                    ephemeron_refs: std::mem::take(&mut self.ephemeron_refs),
                    young: std::mem::take(&mut self.young),
                    ephemerons: self.ephemerons,
                }
            }
            _ => RootSet {
                ephemerons: self.ephemerons,
                ..Default::default()
            },
        }
    }

    /// Takes over the registries of deregistered domains.
    fn adopt_orphans(&mut self) {
        let orphans = self.heap.take_orphans();
        let mut adopted = 0;
        for head in orphans {
            let mut next = Ephemeron::cast(&*self, head);
            while let Some(record) = next {
                next = record.next_live(&*self);
                self.heap
                    .set_field(record.as_value(), DOMAIN_OFFSET, self.id.as_value());
                let head = Ephemeron::cast(&*self, self.ephemerons);
                record.relink(self, head);
                self.ephemerons = record.as_value();
                adopted += 1;
            }
        }
        if adopted > 0 {
            log::debug!("{} adopted {adopted} orphaned ephemerons", self.id);
        }
    }
}

impl Runtime for Domain {
    fn current_domain(&self) -> DomainId {
        self.id
    }

    fn current_phase(&self) -> GcPhase {
        self.heap.phase()
    }

    fn shape(&self, obj: Value) -> Shape {
        self.heap.shape(obj)
    }

    fn is_young(&self, value: Value) -> bool {
        self.heap.is_young(value)
    }

    fn field(&self, obj: Value, index: usize) -> Value {
        self.heap.field(obj, index)
    }

    fn set_field(&mut self, obj: Value, index: usize, value: Value) {
        self.heap.set_field(obj, index, value);
    }

    fn store_field(&mut self, obj: Value, index: usize, value: Value) {
        Domain::store_field(self, obj, index, value);
    }

    fn copy_words(&mut self, src: Value, dst: Value) {
        self.heap.copy_words(src, dst);
    }

    fn is_marked(&self, value: Value) -> bool {
        self.heap.is_marked(value)
    }

    fn is_unmarked_during_clean(&self, value: Value) -> bool {
        debug_assert_eq!(self.heap.phase(), GcPhase::Clean);
        value.is_ref() && !self.heap.is_young(value) && !self.heap.is_marked(value)
    }

    fn force_mark(&mut self, value: Value) {
        self.heap.darken(value);
    }

    fn max_object_words(&self) -> usize {
        self.heap.settings.max_object_words
    }

    fn allocate_shared(&mut self, shape: Shape) -> Value {
        self.allocate(shape, false)
    }

    fn allocate_scannable(&mut self, shape: Shape) -> Value {
        self.allocate(shape, true)
    }

    fn allocate_opaque_copy(&mut self, shape: Shape) -> Value {
        self.allocate(shape, true)
    }

    fn register_write_barrier(&mut self, record: Value, slot: usize) {
        self.ephemeron_refs.push((record, slot));
    }

    fn ephemeron_list_head(&self) -> Value {
        self.ephemerons
    }

    fn set_ephemeron_list_head(&mut self, head: Value) {
        self.ephemerons = head;
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        loop {
            let (request, phase, _, _, word) = self.heap.sync.state.load(Ordering::Acquire);
            if request != GcRequest::None {
                self.rendezvous();
                continue;
            }
            if !self.nursery_is_empty() {
                self.collect_minor();
                continue;
            }
            if phase == GcPhase::Clean && self.clean_cursor.is_some() {
                self.finish_cleaning();
                continue;
            }

            // Held across the CAS so the coordinator cannot miss the list.
            let mut orphans = self.heap.sync.orphans.lock();
            if self.heap.sync.state.deregister_domain(word) {
                if !self.ephemerons.is_none() {
                    orphans.push(self.ephemerons);
                }
                break;
            }
        }
        log::trace!("{} deregistered", self.id);
    }
}
