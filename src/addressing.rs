//! Physical and Virtual Memory Addressing Schemes.
//!
//! This module provides the two address types used throughout the crate:
//! [`Va`] for user and kernel virtual addresses, and [`Pa`] for the
//! physical addresses of user frames.
//!
//! The user half of the virtual address space ends at [`KERNEL_BASE`]. User
//! stacks start at [`USER_STACK_TOP`] and grow downward.
//!
//! Both types support the usual address arithmetic (`+`, `-`, `|`, `&`
//! with a `usize`, and `-` between two addresses of the same type).

/// The size of a single page in memory, in bytes.
pub const PAGE_SIZE: usize = 0x1000;

/// A mask for extracting the offset within a page from a given address.
pub const PAGE_MASK: usize = 0xfff;

/// First kernel virtual address. Every address below it belongs to user
/// space.
pub const KERNEL_BASE: usize = 0x80_0400_0000;

/// Initial user stack pointer. The first stack page sits right below it.
pub const USER_STACK_TOP: usize = 0x4748_0000;

/// [`USER_STACK_TOP`] as a [`Va`].
pub const USER_STACK: Va = Va(USER_STACK_TOP);

/// Default bound on how far the user stack may grow below
/// [`USER_STACK_TOP`].
pub const DEFAULT_MAX_STACK_SIZE: usize = 0x10_0000;

/// Represents a physical address.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

impl Pa {
    /// Creates a new physical address if the address is valid.
    ///
    /// # Returns
    /// - `Some(Pa)` if the address is below `0xffff_0000_0000_0000`.
    /// - `None` otherwise.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < 0xffff_0000_0000_0000 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Returns the raw `usize` representation of the physical address.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }
}

/// Represents a virtual address.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// Creates a new virtual address if the address is canonical.
    ///
    /// # Arguments
    /// - `addr`: A `usize` representing the virtual address.
    ///
    /// # Returns
    /// - `Some(Va)`: If the address is within the valid virtual memory range.
    /// - `None`: If the address is non-canonical.
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Returns the raw `usize` representation of the virtual address.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Aligns the virtual address down to the nearest page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Aligns the virtual address up to the nearest page boundary.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Extracts the offset within the memory page from the virtual address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Returns `true` if the address lies in user space.
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < KERNEL_BASE
    }

    /// Adds `len` to the address, failing on overflow or a non-canonical
    /// result.
    #[inline]
    pub const fn checked_add(self, len: usize) -> Option<Self> {
        match self.0.checked_add(len) {
            Some(v) => Va::new(v),
            None => None,
        }
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 += other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::Sub<Self> for $t {
            type Output = usize;

            fn sub(self, other: Self) -> Self::Output {
                self.0 - other.0
            }
        }
        impl core::ops::SubAssign<usize> for $t {
            fn sub_assign(&mut self, other: usize) {
                self.0 -= other
            }
        }
        impl core::ops::BitOr<usize> for $t {
            type Output = Self;

            fn bitor(self, other: usize) -> Self {
                Self(self.0 | other)
            }
        }
        impl core::ops::BitAnd<usize> for $t {
            type Output = Self;

            fn bitand(self, other: usize) -> Self {
                Self(self.0 & other)
            }
        }
    };
}

impl_arith!(Va);
impl_arith!(Pa);

macro_rules! impl_fmt {
    ($t: ty, $name: literal) => {
        impl core::fmt::Debug for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!($name, "(0x{:x})"), self.0)
            }
        }
        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!($name, "(0x{:x})"), self.0)
            }
        }
    };
}

impl_fmt!(Va, "Va");
impl_fmt!(Pa, "Pa");
