
use core::cmp::Ordering;

use crate::sys::{itick, utick};


// alignup/aligndown
pub(crate) trait Align {
    fn alignup(self, align: usize) -> Self;
    fn aligndown(self, align: usize) -> Self;
}

impl Align for usize {
    #[inline]
    fn aligndown(self, align: usize) -> usize {
        self - (self % align)
    }

    #[inline]
    fn alignup(self, align: usize) -> usize {
        (self + align-1).aligndown(align)
    }
}

#[inline]
pub(crate) fn aligndown<T: Align>(a: T, align: usize) -> T {
    a.aligndown(align)
}

#[inline]
pub(crate) fn alignup<T: Align>(a: T, align: usize) -> T {
    a.alignup(align)
}

// npw2
pub(crate) trait Npw2 {
    fn npw2(self) -> u8;
}

impl Npw2 for usize {
    #[inline]
    fn npw2(self) -> u8 {
        self.next_power_of_two().trailing_zeros() as u8
    }
}

#[inline]
pub(crate) fn npw2<T: Npw2>(a: T) -> u8 {
    a.npw2()
}

// sdiff/scmp, signed comparison of unsigned ticks, wrap-safe
// over a half-range
pub(crate) trait Scmp {
    type Output;
    fn sdiff(self, b: Self) -> Self::Output;
    fn scmp(self, b: Self) -> Ordering;
}

impl Scmp for utick {
    type Output = itick;

    #[inline]
    fn sdiff(self, b: utick) -> itick {
        self.wrapping_sub(b) as itick
    }

    #[inline]
    fn scmp(self, b: utick) -> Ordering {
        self.sdiff(b).cmp(&0)
    }
}

#[inline]
pub(crate) fn sdiff<T: Scmp>(a: T, b: T) -> <T as Scmp>::Output {
    a.sdiff(b)
}

#[inline]
pub(crate) fn scmp<T: Scmp>(a: T, b: T) -> Ordering {
    a.scmp(b)
}
