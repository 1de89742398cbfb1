//! Writer tags: every write performed on behalf of a handler records who made it,
//! which lets the handler recognise its own echo.
use chrono::{DateTime, Utc};
use concepts::storage::DocumentUpdate;
use concepts::{Document, HandlerName, LAST_MODIFIED_AT, LAST_MODIFIED_BY, format_timestamp};
use serde_json::Value;

#[must_use]
pub fn tag(
    update: DocumentUpdate,
    handler_name: &HandlerName,
    at: DateTime<Utc>,
) -> DocumentUpdate {
    update
        .set(LAST_MODIFIED_BY, handler_name.to_string())
        .set(LAST_MODIFIED_AT, format_timestamp(at))
}

#[must_use]
pub fn tag_document(
    mut document: Document,
    handler_name: &HandlerName,
    at: DateTime<Utc>,
) -> Document {
    document.insert(LAST_MODIFIED_BY.to_string(), handler_name.to_string().into());
    document.insert(LAST_MODIFIED_AT.to_string(), format_timestamp(at).into());
    document
}

/// Writes coming from outside of the handlers reset the writer, otherwise a merge update
/// would inherit the tag of the previous handler write.
#[must_use]
pub fn untag(update: DocumentUpdate, at: DateTime<Utc>) -> DocumentUpdate {
    update
        .set(LAST_MODIFIED_BY, Value::Null)
        .set(LAST_MODIFIED_AT, format_timestamp(at))
}

#[must_use]
pub fn untag_document(mut document: Document, at: DateTime<Utc>) -> Document {
    document.insert(LAST_MODIFIED_BY.to_string(), Value::Null);
    document.insert(LAST_MODIFIED_AT.to_string(), format_timestamp(at).into());
    document
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_utils::document;

    fn at() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn tag_should_keep_the_payload() {
        let update = tag(
            DocumentUpdate::default().set("loginCount", 6),
            &HandlerName::from("incrementLoginCount"),
            at(),
        );
        assert_eq!(
            document(json!({
                "loginCount": 6,
                "lastModifiedBy": "incrementLoginCount",
                "lastModifiedAt": "2023-11-14T22:13:20.000Z",
            })),
            update.set
        );
    }

    #[test]
    fn tag_should_overwrite_a_forged_writer() {
        let update = tag(
            DocumentUpdate::default().set(LAST_MODIFIED_BY, "someoneElse"),
            &HandlerName::from("a"),
            at(),
        );
        assert_eq!(Some(&json!("a")), update.set.get(LAST_MODIFIED_BY));
    }

    #[test]
    fn untag_should_clear_the_writer() {
        let mut stored = tag_document(document(json!({"lastSeen": "T0"})), &HandlerName::from("a"), at());
        untag(DocumentUpdate::default().set("lastSeen", "T1"), at()).apply_to(&mut stored);
        assert_eq!(Some(&Value::Null), stored.get(LAST_MODIFIED_BY));
        assert_eq!(Some(&json!("T1")), stored.get("lastSeen"));
    }
}
