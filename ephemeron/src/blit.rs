//! Range copies between records of the calling domain.

use crate::{
    Ephemeron, EphemeronError, GcPhase, Result, Runtime,
    ephemeron::{DATA_OFFSET, FIRST_KEY},
};

impl Ephemeron {
    /// Copies keys `src[src_offset..src_offset + length]` into
    /// `dst[dst_offset..dst_offset + length]`.
    ///
    /// `src` and `dst` may be the same record with overlapping ranges; the
    /// result is as if the source range had been read out first.
    pub fn blit_keys<R: Runtime + ?Sized>(
        rt: &mut R,
        src: Ephemeron,
        src_offset: i64,
        dst: Ephemeron,
        dst_offset: i64,
        length: i64,
    ) -> Result<()> {
        src.check_owner(rt, "blit_keys")?;
        dst.check_owner(rt, "blit_keys")?;
        let src_start = src.key_range(rt, "blit_keys", src_offset, length)?;
        let dst_start = dst.key_range(rt, "blit_keys", dst_offset, length)?;
        let length = length as usize;
        if length == 0 {
            return Ok(());
        }

        clean_both(rt, src, dst);

        let copy = |rt: &mut R, i: usize| {
            let value = rt.field(src.as_value(), src_start + i);
            dst.store_slot(rt, dst_start + i, value);
        };
        if dst_offset < src_offset {
            for i in 0..length {
                copy(rt, i);
            }
        } else {
            for i in (0..length).rev() {
                copy(rt, i);
            }
        }
        Ok(())
    }

    /// Copies the payload of `src` into `dst`.
    pub fn blit_data<R: Runtime + ?Sized>(rt: &mut R, src: Ephemeron, dst: Ephemeron) -> Result<()> {
        src.check_owner(rt, "blit_data")?;
        dst.check_owner(rt, "blit_data")?;
        clean_both(rt, src, dst);
        let value = rt.field(src.as_value(), DATA_OFFSET);
        dst.store_slot(rt, DATA_OFFSET, value);
        Ok(())
    }

    /// First word offset of `length` keys starting at key `offset`.
    fn key_range<R: Runtime + ?Sized>(
        self,
        rt: &R,
        op: &'static str,
        offset: i64,
        length: i64,
    ) -> Result<usize> {
        let keys = self.num_keys(rt);
        let in_range = offset >= 0
            && length >= 0
            && offset
                .checked_add(length)
                .is_some_and(|end| end as u64 <= keys as u64);
        if !in_range {
            return Err(EphemeronError::RangeOutOfBounds {
                op,
                offset,
                length,
                keys,
            });
        }
        Ok(offset as usize + FIRST_KEY)
    }
}

fn clean_both<R: Runtime + ?Sized>(rt: &mut R, src: Ephemeron, dst: Ephemeron) {
    if rt.current_phase() == GcPhase::Clean {
        crate::clean(rt, src);
        if dst != src {
            crate::clean(rt, dst);
        }
    }
}
