use std::{
    fmt::{Debug, Display},
    hash::Hash,
    marker::PhantomData,
    str::FromStr,
};

pub trait Prefix: 'static {
    const PREFIX: &'static str;
}

pub struct PrefixedUlid<T: Prefix> {
    ulid: ulid::Ulid,
    phantom_data: PhantomData<fn(T) -> T>,
}

impl<T: Prefix> PrefixedUlid<T> {
    #[must_use]
    pub const fn from_parts(timestamp_ms: u64, random: u128) -> Self {
        Self {
            ulid: ulid::Ulid::from_parts(timestamp_ms, random),
            phantom_data: PhantomData,
        }
    }

    #[must_use]
    pub fn generate() -> Self {
        Self {
            ulid: ulid::Ulid::new(),
            phantom_data: PhantomData,
        }
    }

    #[must_use]
    pub fn prefix() -> &'static str {
        T::PREFIX
    }

    #[must_use]
    pub fn timestamp_part(&self) -> u64 {
        self.ulid.timestamp_ms()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrefixedUlidParseError {
    #[error("wrong prefix in `{input}`, expected prefix `{expected}`")]
    WrongPrefix { input: String, expected: &'static str },
    #[error("cannot parse ULID suffix from `{input}`")]
    CannotParseUlid { input: String },
}

mod impls {
    use super::{Debug, Display, Hash, PhantomData, Prefix, PrefixedUlid, PrefixedUlidParseError};
    use super::FromStr;

    impl<T: Prefix> FromStr for PrefixedUlid<T> {
        type Err = PrefixedUlidParseError;

        fn from_str(input: &str) -> Result<Self, Self::Err> {
            let Some(suffix) = input
                .strip_prefix(T::PREFIX)
                .and_then(|rest| rest.strip_prefix('_'))
            else {
                return Err(PrefixedUlidParseError::WrongPrefix {
                    input: input.to_string(),
                    expected: T::PREFIX,
                });
            };
            let ulid = ulid::Ulid::from_string(suffix).map_err(|_| {
                PrefixedUlidParseError::CannotParseUlid {
                    input: input.to_string(),
                }
            })?;
            Ok(Self {
                ulid,
                phantom_data: PhantomData,
            })
        }
    }

    impl<T: Prefix> Display for PrefixedUlid<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}_{}", T::PREFIX, self.ulid)
        }
    }

    impl<T: Prefix> Debug for PrefixedUlid<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            Display::fmt(&self, f)
        }
    }

    impl<T: Prefix> Clone for PrefixedUlid<T> {
        fn clone(&self) -> Self {
            *self
        }
    }

    impl<T: Prefix> Copy for PrefixedUlid<T> {}

    impl<T: Prefix> Hash for PrefixedUlid<T> {
        fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
            Self::prefix().hash(state);
            self.ulid.hash(state);
        }
    }

    impl<T: Prefix> PartialEq for PrefixedUlid<T> {
        fn eq(&self, other: &Self) -> bool {
            self.ulid == other.ulid
        }
    }

    impl<T: Prefix> Eq for PrefixedUlid<T> {}

    impl<T: Prefix> PartialOrd for PrefixedUlid<T> {
        fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
            Some(self.cmp(other))
        }
    }

    impl<T: Prefix> Ord for PrefixedUlid<T> {
        fn cmp(&self, other: &Self) -> std::cmp::Ordering {
            self.ulid.cmp(&other.ulid)
        }
    }

    impl<T: Prefix> serde::Serialize for PrefixedUlid<T> {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_str(self)
        }
    }

    impl<'de, T: Prefix> serde::Deserialize<'de> for PrefixedUlid<T> {
        fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let input = String::deserialize(deserializer)?;
            input.parse().map_err(serde::de::Error::custom)
        }
    }
}

pub mod prefix {
    pub struct Chg;
    impl super::Prefix for Chg {
        const PREFIX: &'static str = "chg";
    }
}

pub type ChangeId = PrefixedUlid<prefix::Chg>;
