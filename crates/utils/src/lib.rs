#![no_std]

pub use portal_abi as abi;
pub use portal_abi::consts;
pub use portal_abi::errors;

pub mod types {
    use core::{borrow::Borrow, ops::Deref};

    use portal_abi::consts;

    /// Fixed-capacity name used for tasks and named ports
    pub type Name = HeaplessString<{ consts::MAX_NAME_LENGTH }>;

    #[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
    /// Wrapper around [`heapless::String<N>`] that provides additional functionality
    pub struct HeaplessString<const N: usize>(heapless::String<N>);

    impl<const N: usize> Borrow<str> for HeaplessString<N> {
        fn borrow(&self) -> &str {
            &self.0
        }
    }

    impl<const N: usize> Deref for HeaplessString<N> {
        type Target = heapless::String<N>;

        fn deref(&self) -> &Self::Target {
            &self.0
        }
    }

    impl<const N: usize> HeaplessString<N> {
        #[inline(always)]
        /// Creates a new [`HeaplessString<N>`] from a static str, panics if length is more then `N`
        pub fn new_const(str: &'static str) -> Self {
            let inner =
                heapless::String::try_from(str).expect("HeaplessString::new_const: str too long");
            Self(inner)
        }

        #[inline(always)]
        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl<const N: usize> From<heapless::String<N>> for HeaplessString<N> {
        #[inline(always)]
        fn from(value: heapless::String<N>) -> Self {
            Self(value)
        }
    }

    impl<'a, const N: usize> TryFrom<&'a str> for HeaplessString<N> {
        type Error = <heapless::String<N> as TryFrom<&'a str>>::Error;
        fn try_from(value: &'a str) -> Result<Self, Self::Error> {
            Ok(heapless::String::try_from(value)?.into())
        }
    }

    impl<const N: usize> core::fmt::Display for HeaplessString<N> {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            f.write_str(&self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::types::Name;

    #[test]
    fn name_limits() {
        assert!(Name::try_from("init").is_ok());

        let too_long = [b'a'; portal_abi::consts::MAX_NAME_LENGTH + 1];
        let too_long = core::str::from_utf8(&too_long).unwrap();
        assert!(Name::try_from(too_long).is_err());
    }
}
