//! Id types used within the IR

use serde::{Deserialize, Serialize};
use std::{
    cell::Cell,
    fmt::{self, Debug, Display},
    num::NonZeroU32,
};

/// Creates an id type and a corresponding id generator
macro_rules! create_ids {
    ($($name:ident = $prefix:literal),* $(,)?) => {
        ::paste::paste! {
            $(
                #[derive(
                    Clone,
                    Copy,
                    PartialEq,
                    Eq,
                    PartialOrd,
                    Ord,
                    Hash,
                    Deserialize,
                    Serialize,
                )]
                #[serde(transparent)]
                #[repr(transparent)]
                pub struct $name(NonZeroU32);

                #[automatically_derived]
                #[allow(dead_code)]
                impl $name {
                    #[inline]
                    pub(crate) fn new(id: u32) -> Self {
                        match NonZeroU32::new(id) {
                            Some(id) => Self(id),
                            None => zero_id(stringify!($name)),
                        }
                    }

                    #[inline]
                    pub const fn into_inner(self) -> u32 {
                        self.0.get()
                    }

                    /// A dense index starting at zero, usable for slot tables
                    #[inline]
                    pub const fn index(self) -> usize {
                        self.0.get() as usize - 1
                    }
                }

                impl Debug for $name {
                    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        Display::fmt(self, f)
                    }
                }

                impl Display for $name {
                    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        write!(f, concat!($prefix, "{}"), self.0.get())
                    }
                }

                #[doc = "A generator for [`" $name "`]s"]
                #[derive(Clone)]
                pub struct [<$name Gen>] {
                    id: Cell<u32>,
                }

                #[automatically_derived]
                #[allow(dead_code)]
                impl [<$name Gen>] {
                    #[doc = "Creates a new `" [<$name Gen>] "` to generate [`" $name "`]s"]
                    #[inline]
                    pub const fn new() -> Self {
                        Self { id: Cell::new(1) }
                    }

                    #[doc = "Creates a generator whose ids all come after `id`"]
                    #[inline]
                    pub fn after(id: $name) -> Self {
                        Self {
                            id: Cell::new(match id.into_inner().checked_add(1) {
                                Some(id) => id,
                                None => id_generator_overflow(stringify!($name)),
                            }),
                        }
                    }

                    #[doc = "Generates the next [`" $name "`]\n\n## Panics\n\nPanics if more than `2³²-1` ids are created"]
                    #[inline]
                    pub fn next(&self) -> $name {
                        let id = self.id.get();
                        self.id.set(match id.checked_add(1) {
                            Some(id) => id,
                            None => id_generator_overflow(stringify!($name)),
                        });
                        $name::new(id)
                    }

                    /// The number of ids handed out so far
                    #[inline]
                    pub fn count(&self) -> usize {
                        self.id.get() as usize - 1
                    }
                }

                impl Default for [<$name Gen>] {
                    fn default() -> Self {
                        Self::new()
                    }
                }

                impl Debug for [<$name Gen>] {
                    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        f.debug_struct(stringify!([<$name Gen>]))
                            .field("next", &self.id.get())
                            .finish()
                    }
                }
            )*
        }

        #[cold]
        #[inline(never)]
        fn id_generator_overflow(id: &'static str) -> ! {
            panic!("created more than {} {id}s", u32::MAX - 1)
        }

        #[cold]
        #[inline(never)]
        fn zero_id(id: &'static str) -> ! {
            panic!("created a {id} from an id of zero")
        }
    };
}

create_ids! {
    ValueId = "v",
    BlockId = "bb",
}
