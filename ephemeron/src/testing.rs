//! A single-domain in-memory runtime for unit tests.
//!
//! Tests drive the phase, marks and domain by hand. An allocation hook
//! stands in for the incremental collector work a real allocation may run.

use object::{ObjectType, Shape, Value};

use crate::{DomainId, GcPhase, Runtime};

struct Block {
    shape: Shape,
    young: bool,
    marked: bool,
    words: Vec<Value>,
}

type AllocationHook = Box<dyn FnOnce(&mut TestRuntime)>;

pub(crate) struct TestRuntime {
    pub domain: DomainId,
    pub phase: GcPhase,
    /// Every `register_write_barrier` call, in order.
    pub barrier_log: Vec<(Value, usize)>,
    /// Every `force_mark` call, in order.
    pub forced: Vec<Value>,
    blocks: Vec<Block>,
    head: Value,
    max_words: usize,
    allocations: usize,
    hook: Option<AllocationHook>,
}

impl TestRuntime {
    pub fn new(domain: u32) -> Self {
        Self {
            domain: DomainId(domain),
            phase: GcPhase::Idle,
            barrier_log: Vec::new(),
            forced: Vec::new(),
            blocks: Vec::new(),
            head: Value::NONE,
            max_words: 1 << 16,
            allocations: 0,
            hook: None,
        }
    }

    pub fn with_max_words(mut self, max_words: usize) -> Self {
        self.max_words = max_words;
        self
    }

    /// Unmarked tuple outside the nursery.
    pub fn tenured(&mut self, words: &[Value]) -> Value {
        self.block(ObjectType::Tuple, words, false)
    }

    pub fn young(&mut self, words: &[Value]) -> Value {
        self.block(ObjectType::Tuple, words, true)
    }

    pub fn block(&mut self, object_type: ObjectType, words: &[Value], young: bool) -> Value {
        self.push(Shape::new(object_type, words.len()), young, false, words.to_vec())
    }

    pub fn mark(&mut self, value: Value) {
        self.get_mut(value).marked = true;
    }

    pub fn words(&self, value: Value) -> Vec<Value> {
        self.get(value).words.clone()
    }

    /// Number of `allocate_*` calls made through the runtime.
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    /// Runs `hook` inside the next allocation.
    pub fn on_next_allocation<F>(&mut self, hook: F)
    where
        F: FnOnce(&mut TestRuntime) + 'static,
    {
        self.hook = Some(Box::new(hook));
    }

    fn push(&mut self, shape: Shape, young: bool, marked: bool, words: Vec<Value>) -> Value {
        let value = Value::from_index(self.blocks.len());
        self.blocks.push(Block {
            shape,
            young,
            marked,
            words,
        });
        value
    }

    fn allocate(&mut self, shape: Shape, young: bool) -> Value {
        self.allocations += 1;
        let black = !young && self.phase != GcPhase::Idle;
        let value = self.push(shape, young, black, vec![Value::NONE; shape.words]);
        if let Some(hook) = self.hook.take() {
            hook(self);
        }
        value
    }

    fn get(&self, value: Value) -> &Block {
        assert!(value.is_ref(), "{value:?} is not a block");
        &self.blocks[value.index()]
    }

    fn get_mut(&mut self, value: Value) -> &mut Block {
        assert!(value.is_ref(), "{value:?} is not a block");
        &mut self.blocks[value.index()]
    }
}

impl Runtime for TestRuntime {
    fn current_domain(&self) -> DomainId {
        self.domain
    }

    fn current_phase(&self) -> GcPhase {
        self.phase
    }

    fn shape(&self, obj: Value) -> Shape {
        self.get(obj).shape
    }

    fn is_young(&self, value: Value) -> bool {
        value.is_ref() && self.get(value).young
    }

    fn field(&self, obj: Value, index: usize) -> Value {
        self.get(obj).words[index]
    }

    fn set_field(&mut self, obj: Value, index: usize, value: Value) {
        self.get_mut(obj).words[index] = value;
    }

    fn store_field(&mut self, obj: Value, index: usize, value: Value) {
        self.set_field(obj, index, value);
    }

    fn copy_words(&mut self, src: Value, dst: Value) {
        let words = self.words(src);
        self.get_mut(dst).words = words;
    }

    fn is_marked(&self, value: Value) -> bool {
        value.is_ref() && self.get(value).marked
    }

    fn is_unmarked_during_clean(&self, value: Value) -> bool {
        assert_eq!(self.phase, GcPhase::Clean);
        let block = self.get(value);
        !block.young && !block.marked
    }

    fn force_mark(&mut self, value: Value) {
        self.get_mut(value).marked = true;
        self.forced.push(value);
    }

    fn max_object_words(&self) -> usize {
        self.max_words
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
        self.barrier_log.push((record, slot));
    }

    fn ephemeron_list_head(&self) -> Value {
        self.head
    }

    fn set_ephemeron_list_head(&mut self, head: Value) {
        self.head = head;
    }
}
