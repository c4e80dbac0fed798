//! # Id Masks
//!
//! 32-bit sets of VF, hardware scheduler and world switch ids.

use core::fmt;
use core::ops::{BitAnd, BitOr, BitOrAssign};

use crate::types::{HwSchedId, VfId, WorldSwitchId};

macro_rules! id_mask {
    ($(#[$meta:meta])* $name:ident, $id:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
        #[repr(transparent)]
        pub struct $name(u32);

        impl $name {
            /// Empty set
            pub const EMPTY: Self = Self(0);

            /// Wrap raw bits, dropping bits beyond the id range
            #[inline]
            pub const fn from_bits(bits: u32) -> Self {
                Self(bits & (u32::MAX >> (32 - $id::LIMIT as u32)))
            }

            /// Single-id set
            #[inline]
            pub const fn only(id: $id) -> Self {
                Self(id.bit())
            }

            /// Raw bits
            #[inline]
            pub const fn bits(self) -> u32 {
                self.0
            }

            /// True when no id is set
            #[inline]
            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            /// Membership test
            #[inline]
            pub const fn contains(self, id: $id) -> bool {
                self.0 & id.bit() != 0
            }

            /// Add an id
            #[inline]
            pub fn insert(&mut self, id: $id) {
                self.0 |= id.bit();
            }

            /// Remove an id
            #[inline]
            pub fn remove(&mut self, id: $id) {
                self.0 &= !id.bit();
            }

            /// Copy with an id added
            #[inline]
            pub const fn with(self, id: $id) -> Self {
                Self(self.0 | id.bit())
            }

            /// Copy with an id removed
            #[inline]
            pub const fn without(self, id: $id) -> Self {
                Self(self.0 & !id.bit())
            }

            /// Set union
            #[inline]
            pub const fn union(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }

            /// Set intersection
            #[inline]
            pub const fn intersection(self, other: Self) -> Self {
                Self(self.0 & other.0)
            }

            /// Set difference
            #[inline]
            pub const fn difference(self, other: Self) -> Self {
                Self(self.0 & !other.0)
            }

            /// Whether the sets share an id
            #[inline]
            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            /// Whether every id of `other` is in `self`
            #[inline]
            pub const fn is_superset(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            /// Number of ids set
            #[inline]
            pub const fn count(self) -> u32 {
                self.0.count_ones()
            }

            /// Lowest id set
            #[inline]
            pub const fn first(self) -> Option<$id> {
                if self.0 == 0 {
                    None
                } else {
                    $id::new(self.0.trailing_zeros())
                }
            }

            /// Ids in ascending order
            pub fn iter(self) -> impl Iterator<Item = $id> {
                let bits = self.0;
                $id::all().filter(move |id| bits & id.bit() != 0)
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                self.union(rhs)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl BitAnd for $name {
            type Output = Self;

            fn bitand(self, rhs: Self) -> Self {
                self.intersection(rhs)
            }
        }

        impl FromIterator<$id> for $name {
            fn from_iter<I: IntoIterator<Item = $id>>(iter: I) -> Self {
                let mut mask = Self::EMPTY;
                for id in iter {
                    mask.insert(id);
                }
                mask
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "(0x{:08x})"), self.0)
            }
        }
    };
}

id_mask!(
    /// Set of VF slots
    VfMask,
    VfId
);

id_mask!(
    /// Set of hardware scheduler blocks
    HwSchedMask,
    HwSchedId
);

id_mask!(
    /// Set of world switches
    WorldSwitchMask,
    WorldSwitchId
);

impl VfMask {
    /// First `num_vf` VFs, PF excluded
    pub const fn first_n(num_vf: u32) -> Self {
        if num_vf >= VfId::PF.raw() {
            Self(!VfId::PF.bit())
        } else {
            Self((1u32 << num_vf) - 1)
        }
    }

    /// VFs only, PF removed
    #[inline]
    pub const fn without_pf(self) -> Self {
        self.without(VfId::PF)
    }
}

impl HwSchedMask {
    /// Shift the mask down so `base` becomes bit 0
    ///
    /// Used to derive XCC masks from graphics block ids.
    #[inline]
    pub const fn shifted_down(self, base: HwSchedId) -> u32 {
        self.0 >> base.raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_ops() {
        let mut mask = HwSchedMask::EMPTY;
        mask.insert(HwSchedId::from_index(3));
        mask.insert(HwSchedId::from_index(12));
        assert_eq!(mask.count(), 2);
        assert_eq!(mask.first(), HwSchedId::new(3));
        let ids: [u32; 2] = [3, 12];
        assert!(mask.iter().map(HwSchedId::raw).eq(ids.iter().copied()));
        mask.remove(HwSchedId::from_index(3));
        assert_eq!(mask.bits(), 1 << 12);
        assert_eq!(mask.shifted_down(HwSchedId::from_index(12)), 1);
    }

    #[test]
    fn test_vf_first_n() {
        assert_eq!(VfMask::first_n(0).bits(), 0);
        assert_eq!(VfMask::first_n(4).bits(), 0xf);
        assert!(!VfMask::first_n(31).contains(VfId::PF));
        assert_eq!(VfMask::first_n(2).with(VfId::PF).without_pf().bits(), 0b11);
    }
}
