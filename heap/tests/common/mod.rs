#![allow(dead_code)]

use heap::{Domain, Heap, HeapSettings};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Settings under which nothing collects unless a test asks for it.
pub fn quiet_settings() -> HeapSettings {
    HeapSettings {
        max_object_words: 64,
        nursery_words: 1 << 16,
        cycle_words: 1 << 30,
        slice_budget: 16,
        alloc_per_slice: 1 << 20,
    }
}

/// Settings that collect often.
pub fn busy_settings() -> HeapSettings {
    HeapSettings {
        max_object_words: 64,
        nursery_words: 512,
        cycle_words: 2048,
        slice_budget: 8,
        alloc_per_slice: 4,
    }
}

pub fn create_test_env() -> (Heap, Domain) {
    init_logger();
    let heap = Heap::new(quiet_settings());
    let domain = heap.domain();
    (heap, domain)
}
