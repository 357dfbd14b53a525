//! Flag computation for the arithmetic primitives.
//!
//! Every helper takes the operands already masked to `size`, computes the
//! result in a wider integer and updates EFLAGS in place. PF reflects even
//! parity of the low result byte (set when the number of 1 bits is even).

use crate::decode::OperandSize;
use crate::state::EFlags;

#[inline]
pub(crate) fn parity(byte: u8) -> bool {
    byte.count_ones() % 2 == 0
}

/// Sets SF, ZF and PF from `result`.
#[inline]
pub(crate) fn set_szp(flags: &mut EFlags, result: u32, size: OperandSize) {
    let result = result & size.mask();
    flags.set(EFlags::ZF, result == 0);
    flags.set(EFlags::SF, result & size.sign_bit() != 0);
    flags.set(EFlags::PF, parity(result as u8));
}

pub(crate) fn add_with_flags(flags: &mut EFlags, dest: u32, src: u32, carry_in: bool, size: OperandSize) -> u32 {
    let mask = size.mask();
    let dest = dest & mask;
    let src = src & mask;
    let full = u64::from(dest) + u64::from(src) + u64::from(carry_in);
    let result = full as u32 & mask;

    flags.set(EFlags::CF, full > u64::from(mask));
    flags.set(EFlags::OF, (dest ^ result) & (src ^ result) & size.sign_bit() != 0);
    flags.set(EFlags::AF, (dest ^ src ^ result) & 0x10 != 0);
    set_szp(flags, result, size);
    result
}

pub(crate) fn sub_with_flags(flags: &mut EFlags, dest: u32, src: u32, borrow_in: bool, size: OperandSize) -> u32 {
    let mask = size.mask();
    let dest = dest & mask;
    let src = src & mask;
    let subtrahend = u64::from(src) + u64::from(borrow_in);
    let result = u64::from(dest).wrapping_sub(subtrahend) as u32 & mask;

    flags.set(EFlags::CF, u64::from(dest) < subtrahend);
    flags.set(EFlags::OF, (dest ^ src) & (dest ^ result) & size.sign_bit() != 0);
    flags.set(EFlags::AF, (dest ^ src ^ result) & 0x10 != 0);
    set_szp(flags, result, size);
    result
}

/// AND/OR/XOR/TEST: CF and OF cleared, AF cleared.
pub(crate) fn logic_with_flags(flags: &mut EFlags, result: u32, size: OperandSize) -> u32 {
    let result = result & size.mask();
    flags.remove(EFlags::CF | EFlags::OF | EFlags::AF);
    set_szp(flags, result, size);
    result
}

/// INC/DEC leave CF untouched.
pub(crate) fn inc_with_flags(flags: &mut EFlags, dest: u32, size: OperandSize) -> u32 {
    let cf = flags.contains(EFlags::CF);
    let result = add_with_flags(flags, dest, 1, false, size);
    flags.set(EFlags::CF, cf);
    result
}

pub(crate) fn dec_with_flags(flags: &mut EFlags, dest: u32, size: OperandSize) -> u32 {
    let cf = flags.contains(EFlags::CF);
    let result = sub_with_flags(flags, dest, 1, false, size);
    flags.set(EFlags::CF, cf);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SIZES: [OperandSize; 3] = [OperandSize::Size8, OperandSize::Size16, OperandSize::Size32];

    #[test]
    fn add_0x7f_plus_1_sets_overflow_and_sign() {
        let mut flags = EFlags::FIXED;
        let result = add_with_flags(&mut flags, 0x7F, 0x01, false, OperandSize::Size8);
        assert_eq!(result, 0x80);
        assert!(flags.contains(EFlags::OF));
        assert!(flags.contains(EFlags::SF));
        assert!(!flags.contains(EFlags::ZF));
        assert!(!flags.contains(EFlags::CF));
        // 0x80 has a single set bit: odd parity, PF clear.
        assert!(!flags.contains(EFlags::PF));
        assert!(flags.contains(EFlags::AF));
    }

    #[test]
    fn sub_borrow_and_zero() {
        let mut flags = EFlags::FIXED;
        assert_eq!(sub_with_flags(&mut flags, 0, 1, false, OperandSize::Size16), 0xFFFF);
        assert!(flags.contains(EFlags::CF | EFlags::SF | EFlags::AF | EFlags::PF));
        assert_eq!(sub_with_flags(&mut flags, 5, 5, false, OperandSize::Size32), 0);
        assert!(flags.contains(EFlags::ZF));
        assert!(!flags.contains(EFlags::CF));
    }

    #[test]
    fn logic_clears_af() {
        let mut flags = EFlags::AF | EFlags::CF | EFlags::OF;
        logic_with_flags(&mut flags, 0x0F, OperandSize::Size8);
        assert!(!flags.intersects(EFlags::AF | EFlags::CF | EFlags::OF));
        assert!(flags.contains(EFlags::PF));
    }

    #[test]
    fn inc_preserves_carry() {
        let mut flags = EFlags::CF;
        assert_eq!(inc_with_flags(&mut flags, 0xFF, OperandSize::Size8), 0);
        assert!(flags.contains(EFlags::CF | EFlags::ZF));
    }

    proptest! {
        #[test]
        fn add_matches_reference(a: u32, b: u32, carry: bool, size_index in 0usize..3) {
            let size = SIZES[size_index];
            let mask = size.mask();
            let (a, b) = (a & mask, b & mask);
            let mut flags = EFlags::FIXED;
            let result = add_with_flags(&mut flags, a, b, carry, size);

            let wide = u64::from(a) + u64::from(b) + u64::from(carry);
            prop_assert_eq!(result, wide as u32 & mask);
            prop_assert_eq!(flags.contains(EFlags::CF), wide > u64::from(mask));

            let bits = size.bits();
            let sa = i64::from(size.sign_extend(a) as i32);
            let sb = i64::from(size.sign_extend(b) as i32);
            let signed = sa + sb + i64::from(carry);
            let min = -(1i64 << (bits - 1));
            let max = (1i64 << (bits - 1)) - 1;
            prop_assert_eq!(flags.contains(EFlags::OF), signed < min || signed > max);
            prop_assert_eq!(flags.contains(EFlags::ZF), result == 0);
        }

        #[test]
        fn sub_matches_reference(a: u32, b: u32, borrow: bool, size_index in 0usize..3) {
            let size = SIZES[size_index];
            let mask = size.mask();
            let (a, b) = (a & mask, b & mask);
            let mut flags = EFlags::FIXED;
            let result = sub_with_flags(&mut flags, a, b, borrow, size);

            prop_assert_eq!(result, a.wrapping_sub(b).wrapping_sub(u32::from(borrow)) & mask);
            prop_assert_eq!(flags.contains(EFlags::CF), u64::from(a) < u64::from(b) + u64::from(borrow));

            let bits = size.bits();
            let signed = i64::from(size.sign_extend(a) as i32)
                - i64::from(size.sign_extend(b) as i32)
                - i64::from(borrow);
            let min = -(1i64 << (bits - 1));
            let max = (1i64 << (bits - 1)) - 1;
            prop_assert_eq!(flags.contains(EFlags::OF), signed < min || signed > max);
            prop_assert_eq!(flags.contains(EFlags::PF), (result as u8).count_ones() % 2 == 0);
        }
    }
}
