/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use digest::Digest;

pub trait ObjectId: Sized + Copy {
    type Digest: Digest;

    const NULL: Self;

    fn as_raw_bytes(&self) -> &[u8];
    fn as_raw_bytes_mut(&mut self) -> &mut [u8];
    fn is_null(&self) -> bool {
        self.as_raw_bytes().iter().all(|&b| b == 0)
    }
    fn create() -> OidCreator<Self> {
        OidCreator(Self::Digest::new())
    }
    fn from_digest(h: Self::Digest) -> Self;
    fn from_raw_bytes(b: &[u8]) -> Option<Self> {
        (b.len() == Self::NULL.as_raw_bytes().len()).then(|| {
            let mut result = Self::NULL;
            result.as_raw_bytes_mut().clone_from_slice(b);
            result
        })
    }
}

macro_rules! oid_impl {
    ($name:ident($base_type:ident)) => {
        impl From<$name> for $base_type {
            fn from(o: $name) -> $base_type {
                let mut result = $base_type::NULL;
                let slice = result.as_raw_bytes_mut();
                slice.clone_from_slice(&o.as_raw_bytes()[..slice.len()]);
                result
            }
        }

        impl PartialEq<$base_type> for $name {
            fn eq(&self, other: &$base_type) -> bool {
                self.as_raw_bytes() == other.as_raw_bytes()
            }
        }

        impl PartialEq<$name> for $base_type {
            fn eq(&self, other: &$name) -> bool {
                self.as_raw_bytes() == other.as_raw_bytes()
            }
        }
    };
}
pub(crate) use oid_impl;

macro_rules! oid_type {
    ($name:ident($base_type:ident)) => {
        oid_type!($name for <$base_type as $crate::oid::ObjectId>::Digest);

        impl $name {
            pub fn from_unchecked(o: $base_type) -> Self {
                use $crate::oid::ObjectId;
                Self::from_raw_bytes(o.as_raw_bytes()).unwrap()
            }
        }

        $crate::oid::oid_impl!($name($base_type));
    };
    ($name:ident for $typ:ty) => {
        #[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
        pub struct $name([u8; 20]);

        impl $name {
            pub const fn from_raw_bytes_array(b: [u8; 20]) -> Self {
                Self(b)
            }
        }

        impl $crate::oid::ObjectId for $name {
            type Digest = $typ;

            const NULL: Self = Self([0; 20]);

            fn as_raw_bytes(&self) -> &[u8] {
                &self.0
            }

            fn as_raw_bytes_mut(&mut self) -> &mut [u8] {
                &mut self.0
            }

            fn from_digest(h: Self::Digest) -> Self {
                use digest::Digest;
                Self(h.finalize().into())
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                use $crate::oid::ObjectId;
                for x in self.as_raw_bytes() {
                    write!(f, "{:02x}", x)?;
                }
                Ok(())
            }
        }

        $crate::util::derive_debug_display!($name);

        impl ::std::str::FromStr for $name {
            type Err = hex::FromHexError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                use $crate::oid::ObjectId;
                let mut result = Self::NULL;
                hex::decode_to_slice(s, result.as_raw_bytes_mut())?;
                Ok(result)
            }
        }
    };
}
pub(crate) use oid_type;

pub struct OidCreator<O: ObjectId>(O::Digest);

impl<O: ObjectId> OidCreator<O> {
    pub fn update<B: AsRef<[u8]>>(&mut self, data: B) {
        self.0.update(data);
    }

    pub fn finalize(self) -> O {
        O::from_digest(self.0)
    }
}
