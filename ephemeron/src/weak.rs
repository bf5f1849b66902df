//! Weak arrays: ephemerons whose payload is never used.

use object::Value;

use crate::{Ephemeron, Result, Runtime};

/// An array of weak references, cleared by the collector when their
/// referents die.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct WeakArray(Ephemeron);

impl WeakArray {
    pub fn create<R: Runtime + ?Sized>(rt: &mut R, len: i64) -> Result<Self> {
        Ephemeron::create(rt, len).map(Self)
    }

    pub fn len<R: Runtime + ?Sized>(self, rt: &R) -> usize {
        self.0.num_keys(rt)
    }

    pub fn is_empty<R: Runtime + ?Sized>(self, rt: &R) -> bool {
        self.len(rt) == 0
    }

    /// `None` empties the slot.
    pub fn set<R: Runtime + ?Sized>(self, rt: &mut R, index: i64, value: Option<Value>) -> Result<()> {
        match value {
            Some(value) => self.0.set_key(rt, index, value),
            None => self.0.unset_key(rt, index),
        }
    }

    pub fn get<R: Runtime + ?Sized>(self, rt: &mut R, index: i64) -> Result<Option<Value>> {
        self.0.get_key(rt, index)
    }

    pub fn get_copy<R: Runtime + ?Sized>(self, rt: &mut R, index: i64) -> Result<Option<Value>> {
        self.0.get_key_copy(rt, index)
    }

    pub fn check<R: Runtime + ?Sized>(self, rt: &mut R, index: i64) -> Result<bool> {
        self.0.check_key(rt, index)
    }

    pub fn blit<R: Runtime + ?Sized>(
        rt: &mut R,
        src: WeakArray,
        src_offset: i64,
        dst: WeakArray,
        dst_offset: i64,
        length: i64,
    ) -> Result<()> {
        Ephemeron::blit_keys(rt, src.0, src_offset, dst.0, dst_offset, length)
    }

    pub fn as_ephemeron(self) -> Ephemeron {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GcPhase, testing::TestRuntime};

    #[test]
    fn set_get_and_clear() {
        let mut rt = TestRuntime::new(0);
        let w = WeakArray::create(&mut rt, 3).unwrap();
        assert_eq!(w.len(&rt), 3);
        let x = rt.tenured(&[Value::from_i64(1)]);

        w.set(&mut rt, 1, Some(x)).unwrap();
        assert_eq!(w.get(&mut rt, 1).unwrap(), Some(x));
        assert!(w.check(&mut rt, 1).unwrap());
        assert!(!w.check(&mut rt, 0).unwrap());

        w.set(&mut rt, 1, None).unwrap();
        assert_eq!(w.get(&mut rt, 1).unwrap(), None);
        assert!(w.get(&mut rt, 3).unwrap_err().is_out_of_bounds());
    }

    #[test]
    fn dead_referents_disappear() {
        let mut rt = TestRuntime::new(0);
        let w = WeakArray::create(&mut rt, 2).unwrap();
        let dead = rt.tenured(&[]);
        let live = rt.tenured(&[]);
        rt.mark(live);
        w.set(&mut rt, 0, Some(dead)).unwrap();
        w.set(&mut rt, 1, Some(live)).unwrap();

        rt.phase = GcPhase::Clean;
        assert!(!w.check(&mut rt, 0).unwrap());
        assert_eq!(w.get(&mut rt, 1).unwrap(), Some(live));
    }

    #[test]
    fn copy_and_blit_delegate() {
        let mut rt = TestRuntime::new(0);
        let a = WeakArray::create(&mut rt, 2).unwrap();
        let b = WeakArray::create(&mut rt, 2).unwrap();
        let x = rt.tenured(&[Value::from_i64(5)]);
        a.set(&mut rt, 0, Some(x)).unwrap();

        let copy = a.get_copy(&mut rt, 0).unwrap().unwrap();
        assert_ne!(copy, x);
        assert_eq!(rt.words(copy), vec![Value::from_i64(5)]);

        WeakArray::blit(&mut rt, a, 0, b, 1, 1).unwrap();
        assert_eq!(b.get(&mut rt, 1).unwrap(), Some(x));
        assert!(b.as_ephemeron().get_data(&mut rt).unwrap().is_none());
    }
}
