//! Reactive handlers of the tenant data model. Each one is a pure function from a
//! change notification to a list of effects, the dispatcher performs the writes.
use concepts::{Document, DocumentPath, StrVariant};
use guard::handler::{Handler, HandlerDeclError, HandlerError};
use std::sync::Arc;

pub mod activation_tracker;
pub mod activity_logger;
pub mod login_count;
pub mod member_count;

pub use activation_tracker::TrackActivation;
pub use activity_logger::LogProfileActivity;
pub use login_count::IncrementLoginCount;
pub use member_count::AggregateMemberCount;

/// Every handler shipped with tripwire.
pub fn all() -> Result<Vec<Arc<dyn Handler>>, HandlerDeclError> {
    Ok(vec![
        Arc::new(IncrementLoginCount::new()?),
        Arc::new(LogProfileActivity::new()?),
        Arc::new(TrackActivation::new()?),
        Arc::new(AggregateMemberCount::new()?),
    ])
}

/// `tenants/{tenantId}` owning the document.
pub(crate) fn tenant_of(path: &DocumentPath) -> Result<DocumentPath, HandlerError> {
    let mut segments = path.segments();
    match (segments.next(), segments.next()) {
        (Some("tenants"), Some(tenant_id)) => Ok(format!("tenants/{tenant_id}").parse()?),
        _ => Err(HandlerError::InvalidDocument(StrVariant::from(format!(
            "`{path}` is not a tenant document"
        )))),
    }
}

pub(crate) fn required_after(after: Option<&Document>) -> Result<&Document, HandlerError> {
    after.ok_or(HandlerError::InvalidDocument(StrVariant::Static(
        "document state after the change is missing",
    )))
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::DateTime;
    use concepts::{ChangeId, ChangeNotification, ChangeRecord, Document};
    use guard::field_change::any_changed;
    use guard::handler::{Handler, HandlerContext};
    use std::sync::Arc;

    pub(crate) fn context(
        handler: &dyn Handler,
        path: &str,
        before: Option<Document>,
        after: Option<Document>,
    ) -> HandlerContext {
        let decl = handler.decl();
        let changed_fields = after
            .as_ref()
            .map(|after| any_changed(before.as_ref(), after, &decl.watched_fields).changed_fields)
            .unwrap_or_default();
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let change = ChangeRecord {
            change_id: ChangeId::generate(),
            document_path: path.parse().unwrap(),
            before: before.map(Arc::new),
            after: after.map(Arc::new),
            committed_at: now,
        };
        HandlerContext {
            notification: ChangeNotification::new(&change, &decl.name, now),
            changed_fields,
            now,
        }
    }
}
