use crate::{ChangeId, DocumentPath, EventId, HandlerName};
use rusqlite::{
    ToSql,
    types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef},
};
use std::str::FromStr;
use tracing::error;

fn parse_column<T: FromStr>(value: ValueRef<'_>) -> FromSqlResult<T>
where
    T::Err: std::fmt::Debug,
{
    let str = value.as_str()?;
    str.parse::<T>().map_err(|err| {
        error!(
            "Cannot convert to {} value:`{str}` - {err:?}",
            std::any::type_name::<T>()
        );
        FromSqlError::InvalidType
    })
}

impl ToSql for ChangeId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_string()))
    }
}
impl FromSql for ChangeId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        parse_column(value)
    }
}

impl ToSql for DocumentPath {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}
impl FromSql for DocumentPath {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        parse_column(value)
    }
}

impl ToSql for EventId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}
impl FromSql for EventId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(EventId::new(value.as_str()?))
    }
}

impl ToSql for HandlerName {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(&**self))
    }
}
impl FromSql for HandlerName {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(HandlerName::from(value.as_str()?))
    }
}
