use clap::Parser as ClapParser;
use std::{process, thread, time::Instant};

use ephemeron::{Ephemeron, EphemeronError, FIRST_KEY};
use heap::{Domain, Heap, HeapSettings};
use object::{ObjectType, Value};
use rand::{Rng, SeedableRng, rngs::StdRng};

/// Tracked records per kind and domain.
const TRACKED: usize = 24;

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
/// Runs several domains against one heap, exercising every ephemeron
/// operation while minor collections and incremental major cycles run, and
/// checks the payload contingency invariants along the way.
struct Cli {
    #[arg(long, default_value_t = 4, help = "Number of domains, one thread each")]
    domains: usize,

    #[arg(long, default_value_t = 50_000, help = "Operations per domain")]
    iterations: usize,

    #[arg(long, default_value_t = 4, help = "Maximum keys per ephemeron")]
    keys: usize,

    #[arg(long, default_value_t = 0x5eed, help = "Base seed; domain i uses seed + i")]
    seed: u64,

    #[arg(long, help = "Units of marking or cleaning work per slice")]
    slice_budget: Option<usize>,

    #[arg(long, help = "Allocations between two incremental slices")]
    alloc_per_slice: Option<usize>,

    #[arg(long, help = "Nursery size in words")]
    nursery_words: Option<usize>,

    #[arg(long, help = "Tenured words allocated before a major cycle starts")]
    cycle_words: Option<usize>,
}

impl Cli {
    fn settings(&self) -> HeapSettings {
        let base = HeapSettings {
            max_object_words: 256,
            nursery_words: 4096,
            cycle_words: 16 * 1024,
            slice_budget: 32,
            alloc_per_slice: 8,
        };
        HeapSettings {
            slice_budget: self.slice_budget.unwrap_or(base.slice_budget),
            alloc_per_slice: self.alloc_per_slice.unwrap_or(base.alloc_per_slice),
            nursery_words: self.nursery_words.unwrap_or(base.nursery_words),
            cycle_words: self.cycle_words.unwrap_or(base.cycle_words),
            ..base
        }
    }
}

/// A record whose keys are all rooted: keys and payload must never go away.
struct Strong {
    record: Ephemeron,
    keys: Vec<Option<Value>>,
    data: Value,
    tag: i64,
}

/// A record whose reference keys are not rooted.
struct Weak {
    record: Ephemeron,
    /// Key slots that were given a block.
    armed: Vec<bool>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Report {
    operations: usize,
    checks: usize,
    copies: usize,
    blits: usize,
}

struct Driver {
    domain: Domain,
    rng: StdRng,
    max_keys: usize,
    strong: Vec<Strong>,
    weak: Vec<Weak>,
    next_tag: i64,
    report: Report,
}

impl Driver {
    fn new(heap: &Heap, seed: u64, max_keys: usize) -> Self {
        Self {
            domain: heap.domain(),
            rng: StdRng::seed_from_u64(seed),
            max_keys,
            strong: Vec::new(),
            weak: Vec::new(),
            next_tag: 0,
            report: Report::default(),
        }
    }

    fn run(mut self, iterations: usize) -> Result<Report, EphemeronError> {
        for _ in 0..iterations {
            self.step()?;
            self.reroot();
            self.report.operations += 1;
        }
        log::debug!("{} done: {:?}", self.domain.id(), self.report);
        Ok(self.report)
    }

    fn tag(&mut self) -> i64 {
        self.next_tag += 1;
        self.next_tag
    }

    /// A fresh key: a nursery block, a tenured block or a fixnum. Blocks are
    /// pinned as roots until the next [`Driver::reroot`].
    fn fresh_value(&mut self, pin: bool) -> Value {
        let value = match self.rng.random_range(0..3) {
            0 => self.domain.alloc_tuple(&[Value::from_i64(7)]),
            1 => self.domain.alloc_shared(ObjectType::Tuple, &[Value::from_i64(7)]),
            _ => return Value::from_i64(self.rng.random_range(-50..50)),
        };
        if pin {
            self.domain.push_root(value);
        }
        value
    }

    fn step(&mut self) -> Result<(), EphemeronError> {
        match self.rng.random_range(0..12) {
            0 | 1 => self.create_strong(),
            2 => self.create_weak(),
            3 | 4 => self.check_strong(),
            5 => self.check_weak(),
            6 => self.replace_key(),
            7 => self.copy_out(),
            8 => self.blit(),
            9 => self.out_of_bounds(),
            _ => {
                self.garbage();
                Ok(())
            }
        }
    }

    fn create_strong(&mut self) -> Result<(), EphemeronError> {
        let num_keys = self.rng.random_range(0..=self.max_keys);
        let record = Ephemeron::create(&mut self.domain, num_keys as i64)?;
        self.domain.push_root(record.as_value());
        let mut keys = Vec::with_capacity(num_keys);
        for i in 0..num_keys {
            if self.rng.random_bool(0.2) {
                keys.push(None);
                continue;
            }
            let key = self.fresh_value(true);
            record.set_key(&mut self.domain, i as i64, key)?;
            keys.push(Some(key));
        }
        let tag = self.tag();
        let data = self.domain.alloc_tuple(&[Value::from_i64(tag)]);
        record.set_data(&mut self.domain, data)?;

        if self.strong.len() >= TRACKED {
            let victim = self.rng.random_range(0..self.strong.len());
            self.strong.swap_remove(victim);
        }
        self.strong.push(Strong { record, keys, data, tag });
        Ok(())
    }

    fn create_weak(&mut self) -> Result<(), EphemeronError> {
        let num_keys = self.rng.random_range(1..=self.max_keys.max(1));
        let record = Ephemeron::create(&mut self.domain, num_keys as i64)?;
        self.domain.push_root(record.as_value());
        // Payload first: a key dying later must take it along.
        let tag = self.tag();
        let data = self.domain.alloc_tuple(&[Value::from_i64(tag)]);
        record.set_data(&mut self.domain, data)?;
        let mut armed = vec![false; num_keys];
        for (i, slot) in armed.iter_mut().enumerate() {
            let key = self.fresh_value(false);
            record.set_key(&mut self.domain, i as i64, key)?;
            *slot = key.is_ref();
        }

        if self.weak.len() >= TRACKED {
            self.weak.remove(0);
        }
        self.weak.push(Weak { record, armed });
        Ok(())
    }

    fn check_strong(&mut self) -> Result<(), EphemeronError> {
        if self.strong.is_empty() {
            return Ok(());
        }
        let entry = &self.strong[self.rng.random_range(0..self.strong.len())];
        let d = &mut self.domain;
        for (i, &expected) in entry.keys.iter().enumerate() {
            let got = entry.record.get_key(d, i as i64)?;
            assert_eq!(got, expected, "{}: key {i} of live record changed", d.id());
            assert_eq!(entry.record.check_key(d, i as i64)?, expected.is_some());
        }
        assert_eq!(
            entry.record.get_data(d)?,
            Some(entry.data),
            "{}: payload of live record lost",
            d.id()
        );
        assert_eq!(d.heap().field(entry.data, 0), Value::from_i64(entry.tag));
        self.report.checks += 1;
        Ok(())
    }

    fn check_weak(&mut self) -> Result<(), EphemeronError> {
        if self.weak.is_empty() {
            return Ok(());
        }
        let entry = &self.weak[self.rng.random_range(0..self.weak.len())];
        let d = &mut self.domain;
        let mut lost_key = false;
        for (i, &armed) in entry.armed.iter().enumerate() {
            if armed && !entry.record.check_key(d, i as i64)? {
                lost_key = true;
            }
        }
        if lost_key {
            assert!(
                !entry.record.check_data(d)?,
                "{}: payload outlived a dead key",
                d.id()
            );
        }
        self.report.checks += 1;
        Ok(())
    }

    fn replace_key(&mut self) -> Result<(), EphemeronError> {
        let Some(index) = self.pick_strong_with_keys() else {
            return Ok(());
        };
        let slot = self.rng.random_range(0..self.strong[index].keys.len());
        let record = self.strong[index].record;
        if self.rng.random_bool(0.25) {
            record.unset_key(&mut self.domain, slot as i64)?;
            self.strong[index].keys[slot] = None;
        } else {
            let key = self.fresh_value(true);
            record.set_key(&mut self.domain, slot as i64, key)?;
            self.strong[index].keys[slot] = Some(key);
        }
        Ok(())
    }

    fn copy_out(&mut self) -> Result<(), EphemeronError> {
        let Some(index) = self.pick_strong_with_keys() else {
            return Ok(());
        };
        let slot = self.rng.random_range(0..self.strong[index].keys.len());
        let record = self.strong[index].record;
        let expected = self.strong[index].keys[slot];

        let copy = record.get_key_copy(&mut self.domain, slot as i64)?;
        match (copy, expected) {
            (None, None) => {}
            (Some(copy), Some(original)) if original.is_ref() => {
                let heap = self.domain.heap();
                assert_ne!(copy, original, "scannable key handed out by reference");
                assert_eq!(heap.fields(copy), heap.fields(original));
            }
            (Some(copy), Some(original)) => assert_eq!(copy, original),
            (copy, expected) => panic!("key copy {copy:?}, expected {expected:?}"),
        }

        let data = record.get_data_copy(&mut self.domain)?;
        let tag = Value::from_i64(self.strong[index].tag);
        let data = data.expect("payload of live record lost");
        assert_eq!(self.domain.heap().fields(data), vec![tag]);
        self.report.copies += 1;
        Ok(())
    }

    fn blit(&mut self) -> Result<(), EphemeronError> {
        if self.strong.is_empty() {
            return Ok(());
        }
        let src = self.rng.random_range(0..self.strong.len());
        let dst = self.rng.random_range(0..self.strong.len());
        let src_keys = self.strong[src].keys.len();
        let dst_keys = self.strong[dst].keys.len();
        let length = self.rng.random_range(0..=src_keys.min(dst_keys));
        let src_offset = self.rng.random_range(0..=src_keys - length);
        let dst_offset = self.rng.random_range(0..=dst_keys - length);

        Ephemeron::blit_keys(
            &mut self.domain,
            self.strong[src].record,
            src_offset as i64,
            self.strong[dst].record,
            dst_offset as i64,
            length as i64,
        )?;

        let moved = self.strong[src].keys[src_offset..src_offset + length].to_vec();
        self.strong[dst].keys[dst_offset..dst_offset + length].copy_from_slice(&moved);
        self.report.blits += 1;
        Ok(())
    }

    /// Invalid requests must fail and leave the record alone.
    fn out_of_bounds(&mut self) -> Result<(), EphemeronError> {
        let Some(entry) = self.strong.last() else {
            return Ok(());
        };
        let record = entry.record;
        let keys = entry.keys.len() as i64;
        let d = &mut self.domain;
        for index in [-1, keys, keys + 3] {
            let err = record.get_key(d, index).unwrap_err();
            assert!(err.is_out_of_bounds(), "{err}");
            assert!(record.set_key(d, index, Value::from_i64(0)).is_err());
        }
        let err = Ephemeron::blit_keys(d, record, 0, record, 1, keys).unwrap_err();
        assert!(err.is_out_of_bounds(), "{err}");
        let max = (d.heap().settings.max_object_words - FIRST_KEY) as i64;
        assert!(Ephemeron::create(d, max + 1).is_err());
        assert!(Ephemeron::create(d, -1).is_err());
        Ok(())
    }

    fn garbage(&mut self) {
        for _ in 0..self.rng.random_range(1..16) {
            let words = self.rng.random_range(0..8);
            self.domain.alloc_tuple(&vec![Value::from_i64(1); words]);
        }
        if self.rng.random_bool(0.3) {
            let words = self.rng.random_range(1..32);
            self.domain.alloc_shared(ObjectType::Bytes, &vec![Value::from_i64(0); words]);
        }
    }

    fn pick_strong_with_keys(&mut self) -> Option<usize> {
        let candidates: Vec<usize> = (0..self.strong.len())
            .filter(|&i| !self.strong[i].keys.is_empty())
            .collect();
        if candidates.is_empty() {
            return None;
        }
        Some(candidates[self.rng.random_range(0..candidates.len())])
    }

    /// Roots are exactly the tracked records and the keys of strong ones.
    fn reroot(&mut self) {
        self.domain.truncate_roots(0);
        for entry in &self.strong {
            self.domain.push_root(entry.record.as_value());
            for key in entry.keys.iter().flatten() {
                self.domain.push_root(*key);
            }
        }
        for entry in &self.weak {
            self.domain.push_root(entry.record.as_value());
        }
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let settings = cli.settings();
    if let Err(err) = settings.validate() {
        eprintln!("Invalid heap settings: {err}");
        process::exit(2);
    }
    if cli.keys + FIRST_KEY > settings.max_object_words {
        eprintln!(
            "--keys {} exceeds the maximum of {}",
            cli.keys,
            settings.max_object_words - FIRST_KEY
        );
        process::exit(2);
    }
    if cli.domains == 0 {
        eprintln!("--domains must be at least 1");
        process::exit(2);
    }

    let heap = Heap::new(settings);
    let start = Instant::now();

    let handles: Vec<_> = (0..cli.domains)
        .map(|i| {
            let heap = heap.clone();
            let seed = cli.seed.wrapping_add(i as u64);
            let (iterations, keys) = (cli.iterations, cli.keys);
            thread::spawn(move || Driver::new(&heap, seed, keys).run(iterations))
        })
        .collect();

    let mut total = Report::default();
    let mut failed = false;
    for (i, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(report)) => {
                total.operations += report.operations;
                total.checks += report.checks;
                total.copies += report.copies;
                total.blits += report.blits;
            }
            Ok(Err(err)) => {
                eprintln!("Domain thread {i} failed: {err}");
                failed = true;
            }
            Err(_) => {
                eprintln!("Domain thread {i} violated an invariant");
                failed = true;
            }
        }
    }
    if failed {
        process::exit(1);
    }

    let stats = heap.stats();
    println!(
        "{} operations ({} checks, {} copies, {} blits) in {:.2?}",
        total.operations,
        total.checks,
        total.copies,
        total.blits,
        start.elapsed()
    );
    println!(
        "{} minor collections, {} major cycles, {} promoted, {} swept, \
         {} keys and {} payloads released",
        stats.minor_collections,
        stats.cycles,
        stats.promoted,
        stats.swept,
        stats.released_keys,
        stats.released_data
    );
}
