use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concepts::storage::DocumentUpdate;
use concepts::{
    ChangeKind, ChangeNotification, CollectionPattern, Document, DocumentPath, FieldPath,
    HandlerName, PathParseError, StrVariant,
};
use serde::Serialize;

/// Registration of a reactive handler: which documents it reacts to and which fields it watches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerDecl {
    pub name: HandlerName,
    pub pattern: CollectionPattern,
    pub watched_fields: Vec<FieldPath>,
    pub change_kinds: Vec<ChangeKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerDeclError {
    #[error("handler name must not be empty")]
    EmptyName,
    #[error("handler `{0}` must react to at least one change kind")]
    NoChangeKinds(HandlerName),
    #[error("handler `{0}` reacts to creates or updates but watches no fields")]
    EmptyWatchList(HandlerName),
    #[error("handler `{0}` must not watch the writer tag field `{1}`")]
    WatchesWriterTag(HandlerName, FieldPath),
    #[error(transparent)]
    InvalidPath(#[from] PathParseError),
}

impl HandlerDecl {
    pub fn new(
        name: &str,
        pattern: &str,
        watched_fields: &[&str],
        change_kinds: &[ChangeKind],
    ) -> Result<Self, HandlerDeclError> {
        let decl = Self {
            name: HandlerName::from(name),
            pattern: pattern.parse()?,
            watched_fields: watched_fields
                .iter()
                .map(|field| field.parse::<FieldPath>())
                .collect::<Result<Vec<_>, _>>()?,
            change_kinds: change_kinds.to_vec(),
        };
        decl.validate()?;
        Ok(decl)
    }

    pub fn validate(&self) -> Result<(), HandlerDeclError> {
        if self.name.is_empty() {
            return Err(HandlerDeclError::EmptyName);
        }
        if self.change_kinds.is_empty() {
            return Err(HandlerDeclError::NoChangeKinds(self.name.clone()));
        }
        if self.watched_fields.is_empty()
            && self
                .change_kinds
                .iter()
                .any(|kind| matches!(kind, ChangeKind::Create | ChangeKind::Update))
        {
            return Err(HandlerDeclError::EmptyWatchList(self.name.clone()));
        }
        if let Some(field) = self.watched_fields.iter().find(|field| field.is_writer_tag()) {
            return Err(HandlerDeclError::WatchesWriterTag(
                self.name.clone(),
                field.clone(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn subscribes_to(&self, path: &DocumentPath, kind: ChangeKind) -> bool {
        self.change_kinds.contains(&kind) && self.pattern.matches(path)
    }
}

/// Input of a single handler invocation.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub notification: ChangeNotification,
    pub changed_fields: Vec<FieldPath>,
    pub now: DateTime<Utc>,
}

impl HandlerContext {
    #[must_use]
    pub fn before(&self) -> Option<&Document> {
        self.notification.before.as_deref()
    }

    #[must_use]
    pub fn after(&self) -> Option<&Document> {
        self.notification.after.as_deref()
    }

    #[must_use]
    pub fn kind(&self) -> ChangeKind {
        self.notification.kind()
    }
}

/// A write requested by a handler. The dispatcher tags and applies it.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Update {
        path: DocumentPath,
        update: DocumentUpdate,
    },
    /// Replaying a create whose document already exists is a no-op.
    Create {
        path: DocumentPath,
        document: Document,
    },
    Delete {
        path: DocumentPath,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("unexpected document shape: {0}")]
    InvalidDocument(StrVariant),
    #[error(transparent)]
    InvalidPath(#[from] PathParseError),
    #[error("{0}")]
    Uncategorized(StrVariant),
}

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    fn decl(&self) -> &HandlerDecl;

    /// Must not perform I/O: everything the handler wants to change is returned as effects.
    async fn handle(&self, ctx: &HandlerContext) -> Result<Vec<Effect>, HandlerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn valid_declaration() {
        let decl = HandlerDecl::new(
            "incrementLoginCount",
            "tenants/*/users/*",
            &["lastSeen"],
            &[ChangeKind::Update],
        )
        .unwrap();
        assert!(decl.subscribes_to(&"tenants/t/users/u".parse().unwrap(), ChangeKind::Update));
        assert!(!decl.subscribes_to(&"tenants/t/users/u".parse().unwrap(), ChangeKind::Create));
        assert!(!decl.subscribes_to(&"tenants/t/teams/u".parse().unwrap(), ChangeKind::Update));
    }

    #[test]
    fn writer_tag_cannot_be_watched() {
        assert_matches!(
            HandlerDecl::new("h", "users/*", &["lastModifiedBy"], &[ChangeKind::Update]),
            Err(HandlerDeclError::WatchesWriterTag(_, field)) if field.as_str() == "lastModifiedBy"
        );
    }

    #[test]
    fn watch_list_is_required_unless_only_deletes_are_handled() {
        assert_matches!(
            HandlerDecl::new("h", "users/*", &[], &[ChangeKind::Create, ChangeKind::Delete]),
            Err(HandlerDeclError::EmptyWatchList(_))
        );
        HandlerDecl::new("h", "users/*", &[], &[ChangeKind::Delete]).unwrap();
    }

    #[test]
    fn invalid_declarations() {
        assert_matches!(
            HandlerDecl::new("", "users/*", &["a"], &[ChangeKind::Update]),
            Err(HandlerDeclError::EmptyName)
        );
        assert_matches!(
            HandlerDecl::new("h", "users/*", &["a"], &[]),
            Err(HandlerDeclError::NoChangeKinds(_))
        );
        assert_matches!(
            HandlerDecl::new("h", "*/u", &["a"], &[ChangeKind::Update]),
            Err(HandlerDeclError::InvalidPath(PathParseError::MisplacedWildcard))
        );
        assert_matches!(
            HandlerDecl::new("h", "users/*", &["a..b"], &[ChangeKind::Update]),
            Err(HandlerDeclError::InvalidPath(PathParseError::EmptySegment(1)))
        );
    }
}
