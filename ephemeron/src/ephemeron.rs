//! Ephemeron records and their slot accessors.
//!
//! A record is one block of type [`ObjectType::Ephemeron`]:
//!
//! ```text
//! [0] registry link   next record of the owning domain, or NONE
//! [1] owning domain   fixnum
//! [2] payload         value or NONE
//! [3..3+K) keys       value or NONE
//! ```
//!
//! The incremental collector cleans records one at a time during
//! [`GcPhase::Clean`], interleaved with the mutator. Every accessor below
//! therefore first settles the slots it is about to observe, so that callers
//! see each record as if the whole cleaning pass had already run.

use object::{ObjectType, Shape, Value};

use crate::{
    DomainId, EphemeronError, GcPhase, Result, Runtime,
    clean::short_circuit,
    runtime::{darken_if_marking, is_dead_during_clean},
};

pub const LINK_OFFSET: usize = 0;
pub const DOMAIN_OFFSET: usize = 1;
pub const DATA_OFFSET: usize = 2;
pub const FIRST_KEY: usize = 3;

/// Handle to an ephemeron record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Ephemeron(Value);

impl Ephemeron {
    /// Allocates a record with `num_keys` empty keys and an empty payload,
    /// owned by the calling domain and linked into its registry.
    pub fn create<R: Runtime + ?Sized>(rt: &mut R, num_keys: i64) -> Result<Self> {
        let max_keys = rt.max_object_words().saturating_sub(FIRST_KEY);
        let words = usize::try_from(num_keys)
            .ok()
            .filter(|&keys| keys <= max_keys)
            .map(|keys| keys + FIRST_KEY)
            .ok_or(EphemeronError::InvalidSize {
                op: "create",
                requested: num_keys,
                max: max_keys,
            })?;

        let record = rt.allocate_shared(Shape::new(ObjectType::Ephemeron, words));

        let domain = rt.current_domain();
        let head = rt.ephemeron_list_head();
        rt.set_field(record, LINK_OFFSET, head);
        rt.set_field(record, DOMAIN_OFFSET, domain.as_value());
        for offset in DATA_OFFSET..words {
            rt.set_field(record, offset, Value::NONE);
        }
        rt.set_ephemeron_list_head(record);

        Ok(Self(record))
    }

    /// Views `value` as a record if it refers to an ephemeron block.
    pub fn cast<R: Runtime + ?Sized>(rt: &R, value: Value) -> Option<Self> {
        if !value.is_ref() || rt.shape(value).object_type != ObjectType::Ephemeron {
            return None;
        }
        debug_assert!(DomainId::from_value(rt.field(value, DOMAIN_OFFSET)).is_some());
        Some(Self(value))
    }

    #[inline]
    pub fn as_value(self) -> Value {
        self.0
    }

    pub fn num_keys<R: Runtime + ?Sized>(self, rt: &R) -> usize {
        rt.shape(self.0).words - FIRST_KEY
    }

    /// A corrupt domain word reads as [`DomainId::INVALID`], which no domain
    /// ever holds, so every owner check on the record fails.
    pub fn owner<R: Runtime + ?Sized>(self, rt: &R) -> DomainId {
        let word = rt.field(self.0, DOMAIN_OFFSET);
        debug_assert!(DomainId::from_value(word).is_some(), "{:?}: bad domain word", self.0);
        DomainId::from_value(word).unwrap_or(DomainId::INVALID)
    }

    // ── registry ──────────────────────────────────────────────────

    /// Next record in the owner's registry.
    pub fn next_live<R: Runtime + ?Sized>(self, rt: &R) -> Option<Ephemeron> {
        let link = rt.field(self.0, LINK_OFFSET);
        (!link.is_none()).then_some(Self(link))
    }

    /// Rewrites the registry link. Only the collector's list rebuild calls
    /// this; the operations never touch the link after creation.
    pub fn relink<R: Runtime + ?Sized>(self, rt: &mut R, next: Option<Ephemeron>) {
        let link = next.map_or(Value::NONE, Ephemeron::as_value);
        rt.set_field(self.0, LINK_OFFSET, link);
    }

    // ── keys ──────────────────────────────────────────────────────

    pub fn set_key<R: Runtime + ?Sized>(self, rt: &mut R, index: i64, value: Value) -> Result<()> {
        let offset = self.key_offset(rt, "set_key", index)?;
        self.check_owner(rt, "set_key")?;
        self.check_key_clean(rt, offset);
        self.store_slot(rt, offset, value);
        Ok(())
    }

    pub fn unset_key<R: Runtime + ?Sized>(self, rt: &mut R, index: i64) -> Result<()> {
        self.set_key(rt, index, Value::NONE)
    }

    pub fn get_key<R: Runtime + ?Sized>(self, rt: &mut R, index: i64) -> Result<Option<Value>> {
        let offset = self.key_offset(rt, "get_key", index)?;
        self.check_owner(rt, "get_key")?;
        if self.is_key_none(rt, offset) {
            return Ok(None);
        }
        let value = rt.field(self.0, offset);
        darken_if_marking(rt, value);
        Ok(Some(value))
    }

    pub fn check_key<R: Runtime + ?Sized>(self, rt: &mut R, index: i64) -> Result<bool> {
        let offset = self.key_offset(rt, "check_key", index)?;
        self.check_owner(rt, "check_key")?;
        Ok(!self.is_key_none(rt, offset))
    }

    // ── payload ───────────────────────────────────────────────────

    pub fn set_data<R: Runtime + ?Sized>(self, rt: &mut R, value: Value) -> Result<()> {
        self.check_owner(rt, "set_data")?;
        self.clean_if_cleaning(rt);
        self.store_slot(rt, DATA_OFFSET, value);
        Ok(())
    }

    pub fn unset_data<R: Runtime + ?Sized>(self, rt: &mut R) -> Result<()> {
        self.set_data(rt, Value::NONE)
    }

    pub fn get_data<R: Runtime + ?Sized>(self, rt: &mut R) -> Result<Option<Value>> {
        self.check_owner(rt, "get_data")?;
        self.clean_if_cleaning(rt);
        let value = rt.field(self.0, DATA_OFFSET);
        if value.is_none() {
            return Ok(None);
        }
        darken_if_marking(rt, value);
        Ok(Some(value))
    }

    pub fn check_data<R: Runtime + ?Sized>(self, rt: &mut R) -> Result<bool> {
        self.check_owner(rt, "check_data")?;
        self.clean_if_cleaning(rt);
        Ok(!rt.field(self.0, DATA_OFFSET).is_none())
    }

    // ── helpers shared with copy, blit and clean ─────────────────

    pub(crate) fn check_owner<R: Runtime + ?Sized>(self, rt: &R, op: &'static str) -> Result<()> {
        let owner = self.owner(rt);
        let caller = rt.current_domain();
        if owner != caller {
            return Err(EphemeronError::WrongDomain { op, owner, caller });
        }
        Ok(())
    }

    pub(crate) fn key_offset<R: Runtime + ?Sized>(
        self,
        rt: &R,
        op: &'static str,
        index: i64,
    ) -> Result<usize> {
        let keys = self.num_keys(rt);
        usize::try_from(index)
            .ok()
            .filter(|&i| i < keys)
            .map(|i| i + FIRST_KEY)
            .ok_or(EphemeronError::IndexOutOfBounds { op, index, keys })
    }

    /// Stores `value` in a slot, registering the record in the remembered set
    /// when the slot starts pointing into the nursery.
    pub(crate) fn store_slot<R: Runtime + ?Sized>(self, rt: &mut R, offset: usize, value: Value) {
        debug_assert_eq!(self.owner(rt), rt.current_domain());
        if rt.is_young(value) {
            let old = rt.field(self.0, offset);
            rt.set_field(self.0, offset, value);
            if !rt.is_young(old) {
                rt.register_write_barrier(self.0, offset);
            }
        } else {
            rt.set_field(self.0, offset, value);
        }
    }

    /// During cleaning, a dead key about to be observed takes the payload
    /// with it, exactly as the full clean would. Forwarded keys are judged by
    /// their final target.
    pub(crate) fn check_key_clean<R: Runtime + ?Sized>(self, rt: &mut R, offset: usize) {
        debug_assert!(offset >= FIRST_KEY);
        if rt.current_phase() != GcPhase::Clean {
            return;
        }
        let key = rt.field(self.0, offset);
        if key.is_none() {
            return;
        }
        let key = short_circuit(rt, self.0, offset, key);
        if is_dead_during_clean(rt, key) {
            log::trace!("{:?}: dead key at slot {} released with payload", self.0, offset);
            rt.set_field(self.0, offset, Value::NONE);
            rt.set_field(self.0, DATA_OFFSET, Value::NONE);
        }
    }

    pub(crate) fn is_key_none<R: Runtime + ?Sized>(self, rt: &mut R, offset: usize) -> bool {
        self.check_key_clean(rt, offset);
        rt.field(self.0, offset).is_none()
    }

    /// Payload liveness depends on every key, so there is no cheap check.
    pub(crate) fn clean_if_cleaning<R: Runtime + ?Sized>(self, rt: &mut R) {
        if rt.current_phase() == GcPhase::Clean {
            crate::clean(rt, self);
        }
    }
}
