//! A small hand-rolled bitset helper, used everywhere phase and reason
//! flags are combined into one first-class type instead of compared as
//! strings (connection type flags, transfer/search state). The same
//! handful of lines a cratetorrent-style codebase reaches for instead of
//! pulling in a dependency for it.

macro_rules! bitset {
    ($(#[$meta:meta])* $vis:vis struct $name:ident: $repr:ty {
        $($(#[$fmeta:meta])* $flag:ident = $value:expr;)*
    }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
        $vis struct $name($repr);

        impl $name {
            $($(#[$fmeta])* pub const $flag: Self = Self($value);)*

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            pub const fn bits(self) -> $repr {
                self.0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}(0b{:b})", stringify!($name), self.0)
            }
        }
    };
}

pub(crate) use bitset;

#[cfg(test)]
mod tests {
    bitset! {
        pub struct TestFlags: u8 {
            A = 1 << 0;
            B = 1 << 1;
            C = 1 << 2;
        }
    }

    #[test]
    fn union_and_contains() {
        let ab = TestFlags::A | TestFlags::B;
        assert!(ab.contains(TestFlags::A));
        assert!(ab.contains(TestFlags::B));
        assert!(!ab.contains(TestFlags::C));
        assert!(ab.intersects(TestFlags::C | TestFlags::A));
    }

    #[test]
    fn insert_and_remove() {
        let mut flags = TestFlags::empty();
        flags.insert(TestFlags::A | TestFlags::C);
        assert!(flags.contains(TestFlags::A));
        flags.remove(TestFlags::A);
        assert!(!flags.contains(TestFlags::A));
        assert!(flags.contains(TestFlags::C));
    }
}
