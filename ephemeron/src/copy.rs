//! Copying getters.
//!
//! The copy is allocated before the source is read for good: allocation can
//! run collector work that clears the very slot being copied, so the slot is
//! settled and read again afterwards and only that fresh read is copied.

use object::{Shape, Value};

use crate::{
    Ephemeron, Result, Runtime,
    ephemeron::DATA_OFFSET,
    runtime::darken_if_marking,
};

impl Ephemeron {
    /// Like [`Ephemeron::get_key`], but a scannable block comes back as a
    /// fresh shallow copy.
    pub fn get_key_copy<R: Runtime + ?Sized>(self, rt: &mut R, index: i64) -> Result<Option<Value>> {
        let offset = self.key_offset(rt, "get_key_copy", index)?;
        self.check_owner(rt, "get_key_copy")?;
        Ok(copy_slot(rt, |rt| {
            if self.is_key_none(rt, offset) {
                None
            } else {
                Some(rt.field(self.as_value(), offset))
            }
        }))
    }

    /// Like [`Ephemeron::get_data`], but a scannable block comes back as a
    /// fresh shallow copy.
    pub fn get_data_copy<R: Runtime + ?Sized>(self, rt: &mut R) -> Result<Option<Value>> {
        self.check_owner(rt, "get_data_copy")?;
        Ok(copy_slot(rt, |rt| {
            self.clean_if_cleaning(rt);
            let value = rt.field(self.as_value(), DATA_OFFSET);
            (!value.is_none()).then_some(value)
        }))
    }
}

/// `read` settles the slot and returns its current value, if present.
fn copy_slot<R, F>(rt: &mut R, mut read: F) -> Option<Value>
where
    R: Runtime + ?Sized,
    F: FnMut(&mut R) -> Option<Value>,
{
    let mut source = read(rt)?;
    loop {
        if !source.is_ref() {
            darken_if_marking(rt, source);
            return Some(source);
        }
        let shape = rt.shape(source);
        if shape.object_type.is_opaque() {
            darken_if_marking(rt, source);
            return Some(source);
        }

        let copy = if shape.object_type.is_scannable() {
            rt.allocate_scannable(shape)
        } else {
            rt.allocate_opaque_copy(shape)
        };

        source = read(rt)?;
        if !source.is_ref() || rt.shape(source) != shape {
            // The slot now holds something of another shape; start over
            // with what is there now.
            continue;
        }

        fill_copy(rt, source, copy, shape);
        return Some(copy);
    }
}

fn fill_copy<R: Runtime + ?Sized>(rt: &mut R, source: Value, copy: Value, shape: Shape) {
    if shape.object_type.is_scannable() {
        for i in 0..shape.words {
            let field = rt.field(source, i);
            darken_if_marking(rt, field);
            rt.store_field(copy, i, field);
        }
    } else {
        rt.copy_words(source, copy);
    }
}
