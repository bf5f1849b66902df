//! The per-record cleaning pass.

use object::{ObjectType, Value};

use crate::{
    Ephemeron, GcPhase, Runtime,
    ephemeron::{DATA_OFFSET, FIRST_KEY},
};

/// What one call to [`clean`] released.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Cleaned {
    pub keys: usize,
    pub data: bool,
}

impl Cleaned {
    pub fn is_empty(&self) -> bool {
        self.keys == 0 && !self.data
    }
}

/// One hop of forwarding resolution.
///
/// Returns the target when `value` is a forwarding block that may be
/// short-circuited. Chains through `Forward`, `Lazy` and `Double` targets, and
/// immediate targets, are left alone. The caller decides whether to rewrite
/// the slot it read `value` from.
pub fn resolve_forward<R: Runtime + ?Sized>(rt: &R, value: Value) -> Option<Value> {
    if !value.is_ref() || rt.shape(value).object_type != ObjectType::Forward {
        return None;
    }
    let target = rt.field(value, 0);
    if !target.is_ref() {
        return None;
    }
    match rt.shape(target).object_type {
        ObjectType::Forward | ObjectType::Lazy | ObjectType::Double => None,
        _ => Some(target),
    }
}

/// Follows `child`, read from `record[offset]`, through forwarding blocks
/// and rewrites the slot to the final target.
pub(crate) fn short_circuit<R: Runtime + ?Sized>(
    rt: &mut R,
    record: Value,
    offset: usize,
    mut child: Value,
) -> Value {
    while let Some(target) = resolve_forward(rt, child) {
        rt.set_field(record, offset, target);
        if rt.is_young(target) {
            rt.register_write_barrier(record, offset);
        }
        child = target;
    }
    child
}

/// Removes dead keys from `e`, and the payload with them.
///
/// Forwarded keys are first short-circuited to their final target. A key is
/// released when it refers to an unmarked tenured block; if any key was
/// released the payload goes too. A record without keys never loses its
/// payload here.
pub fn clean<R: Runtime + ?Sized>(rt: &mut R, e: Ephemeron) -> Cleaned {
    debug_assert_eq!(rt.current_phase(), GcPhase::Clean);
    debug_assert_eq!(e.owner(rt), rt.current_domain());

    let record = e.as_value();
    let size = FIRST_KEY + e.num_keys(rt);
    let mut cleaned = Cleaned::default();

    for offset in FIRST_KEY..size {
        let child = rt.field(record, offset);
        if child.is_none() {
            continue;
        }
        let child = short_circuit(rt, record, offset, child);

        if child.is_ref() && rt.is_unmarked_during_clean(child) {
            rt.set_field(record, offset, Value::NONE);
            cleaned.keys += 1;
        }
    }

    if cleaned.keys > 0 && !rt.field(record, DATA_OFFSET).is_none() {
        rt.set_field(record, DATA_OFFSET, Value::NONE);
        cleaned.data = true;
    }

    if !cleaned.is_empty() {
        log::trace!(
            "{:?}: released {} key(s){}",
            record,
            cleaned.keys,
            if cleaned.data { " and payload" } else { "" }
        );
    }
    cleaned
}
