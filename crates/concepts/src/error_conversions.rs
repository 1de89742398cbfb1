use tracing::error;

use crate::{
    PathParseError,
    prefixed_ulid::PrefixedUlidParseError,
    storage::{DbErrorGeneric, DbErrorRead, DbErrorWrite},
};

impl From<DbErrorRead> for DbErrorWrite {
    fn from(value: DbErrorRead) -> DbErrorWrite {
        match value {
            DbErrorRead::NotFound => DbErrorWrite::NotFound,
            DbErrorRead::Generic(err) => DbErrorWrite::Generic(err),
        }
    }
}

impl From<PrefixedUlidParseError> for DbErrorGeneric {
    fn from(err: PrefixedUlidParseError) -> Self {
        error!("Cannot convert: {err:?}");
        DbErrorGeneric::Uncategorized(err.to_string().into())
    }
}

impl From<PathParseError> for DbErrorGeneric {
    fn from(err: PathParseError) -> Self {
        error!("Cannot convert: {err:?}");
        DbErrorGeneric::Uncategorized(err.to_string().into())
    }
}

impl From<serde_json::Error> for DbErrorGeneric {
    fn from(err: serde_json::Error) -> Self {
        error!("Cannot convert: {err:?}");
        DbErrorGeneric::Uncategorized(err.to_string().into())
    }
}

impl From<PathParseError> for DbErrorRead {
    fn from(err: PathParseError) -> Self {
        DbErrorGeneric::from(err).into()
    }
}
