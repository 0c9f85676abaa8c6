pub mod address_space;
pub mod frame_allocator;
pub mod heap;
pub mod mem_object;
pub mod page_info;
pub mod paging;
pub mod regions;
pub mod temp_mapper;
pub mod tlb;

use core::{
    fmt::{Debug, LowerHex},
    ops::{Add, AddAssign, Sub, SubAssign},
};

use paging::PAGE_SIZE;

use crate::limine::HHDM;

/// A virtual memory address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

/// A physical memory address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl Debug for VirtAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "VirtAddr({self:#x})")
    }
}

impl Debug for PhysAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PhysAddr({self:#x})")
    }
}

#[inline(always)]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

#[inline(always)]
pub const fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

macro_rules! impl_addr_ty {
    ($ty: ty) => {
        impl $ty {
            #[inline(always)]
            pub const fn null() -> Self {
                Self(0)
            }

            #[inline(always)]
            pub const fn is_null(&self) -> bool {
                self.0 == 0
            }

            #[inline(always)]
            pub const fn from(value: usize) -> Self {
                Self(value)
            }

            #[inline(always)]
            pub const fn into_raw(self) -> usize {
                self.0
            }

            /// Aligns (rounds) up to the next multiple of `alignment`
            #[inline(always)]
            pub const fn to_next_multiple_of(self, alignment: usize) -> Self {
                Self(align_up(self.0, alignment))
            }

            /// Aligns (rounds) down to the previous multiple of `alignment`
            #[inline(always)]
            pub const fn to_previous_multiple_of(self, alignment: usize) -> Self {
                Self(align_down(self.0, alignment))
            }

            #[inline(always)]
            pub const fn to_next_page(self) -> Self {
                self.to_next_multiple_of(PAGE_SIZE)
            }

            #[inline(always)]
            pub const fn to_previous_page(self) -> Self {
                self.to_previous_multiple_of(PAGE_SIZE)
            }

            #[inline(always)]
            pub const fn is_page_aligned(&self) -> bool {
                self.0 % PAGE_SIZE == 0
            }
        }

        impl LowerHex for $ty {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                LowerHex::fmt(&self.0, f)
            }
        }

        impl From<usize> for $ty {
            #[inline(always)]
            fn from(value: usize) -> Self {
                Self::from(value)
            }
        }

        impl Add<usize> for $ty {
            type Output = $ty;
            #[inline(always)]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl AddAssign<usize> for $ty {
            #[inline(always)]
            fn add_assign(&mut self, rhs: usize) {
                *self = *self + rhs
            }
        }

        impl Sub<$ty> for $ty {
            type Output = usize;
            #[inline(always)]
            fn sub(self, rhs: $ty) -> Self::Output {
                self.0 - rhs.0
            }
        }

        impl Sub<usize> for $ty {
            type Output = Self;
            #[inline(always)]
            fn sub(self, rhs: usize) -> Self::Output {
                Self(self.0 - rhs)
            }
        }

        impl SubAssign<usize> for $ty {
            #[inline(always)]
            fn sub_assign(&mut self, rhs: usize) {
                *self = *self - rhs
            }
        }
    };
}

impl_addr_ty!(VirtAddr);
impl_addr_ty!(PhysAddr);

impl VirtAddr {
    #[inline(always)]
    pub fn from_ptr<T: ?Sized>(value: *const T) -> Self {
        Self(value.addr())
    }

    #[inline(always)]
    pub const fn into_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns the equivalent PhysAddr for this address assuming it lies in
    /// the HHDM. Only meaningful for addresses gotten from
    /// [`PhysAddr::into_virt`].
    #[inline(always)]
    pub fn into_phys(self) -> PhysAddr {
        PhysAddr(self.0 - *HHDM)
    }
}

impl PhysAddr {
    /// The higher-half direct-map view of this physical address
    #[inline(always)]
    pub fn into_virt(self) -> VirtAddr {
        VirtAddr(self.0 | *HHDM)
    }
}

impl<T> From<*const T> for VirtAddr {
    #[inline(always)]
    fn from(value: *const T) -> Self {
        Self::from_ptr(value)
    }
}

impl<T> From<*mut T> for VirtAddr {
    #[inline(always)]
    fn from(value: *mut T) -> Self {
        Self::from_ptr(value)
    }
}

/// Brings up everything that has to exist before the first heap allocation:
/// the frame zones, the kernel heap, then the kernel-half root table and the
/// boot CPU's temporary-mapping window.
pub fn init() {
    frame_allocator::init();
    heap::init();
    crate::arch::paging::init_kernel_root();
    temp_mapper::init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn align_laws() {
        assert_eq!(align_up(0x1001, PAGE_SIZE), 0x2000);
        assert_eq!(align_down(0x1fff, PAGE_SIZE), 0x1000);
        assert_eq!(VirtAddr::from(0x2010).to_previous_page(), VirtAddr::from(0x2000));
        assert_eq!(VirtAddr::from(0x100).to_next_page(), VirtAddr::from(0x1000));
    }

    #[test_case]
    fn hhdm_round_trip() {
        let phys = PhysAddr::from(0x1000);
        assert_eq!(phys.into_virt().into_phys(), phys);
    }
}
