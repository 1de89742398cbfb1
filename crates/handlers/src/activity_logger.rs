use crate::tenant_of;
use async_trait::async_trait;
use concepts::{ChangeKind, Document, format_timestamp};
use guard::handler::{Effect, Handler, HandlerContext, HandlerDecl, HandlerDeclError, HandlerError};
use serde_json::Value;

pub const NAME: &str = "logProfileActivity";
pub const ACTIVITY_LOG: &str = "activityLog";

/// Appends an entry to the tenant's activity log whenever a profile field changes.
/// The entry id is the event id, so a replayed create is a no-op.
pub struct LogProfileActivity {
    decl: HandlerDecl,
}

impl LogProfileActivity {
    pub fn new() -> Result<Self, HandlerDeclError> {
        Ok(Self {
            decl: HandlerDecl::new(
                NAME,
                "tenants/*/users/*",
                &["displayName", "email", "photoUrl", "role"],
                &[ChangeKind::Create, ChangeKind::Update, ChangeKind::Delete],
            )?,
        })
    }
}

#[async_trait]
impl Handler for LogProfileActivity {
    fn decl(&self) -> &HandlerDecl {
        &self.decl
    }

    async fn handle(&self, ctx: &HandlerContext) -> Result<Vec<Effect>, HandlerError> {
        let user_path = &ctx.notification.document_path;
        let action = match ctx.kind() {
            ChangeKind::Create => "profile.created",
            ChangeKind::Update => "profile.updated",
            ChangeKind::Delete => "profile.deleted",
        };
        let mut entry = Document::new();
        entry.insert("actor".to_string(), user_path.id().into());
        entry.insert("subject".to_string(), user_path.to_string().into());
        entry.insert("action".to_string(), action.into());
        entry.insert(
            "changedFields".to_string(),
            Value::Array(
                ctx.changed_fields
                    .iter()
                    .map(|field| field.as_str().into())
                    .collect(),
            ),
        );
        entry.insert("timestamp".to_string(), format_timestamp(ctx.now).into());
        Ok(vec![Effect::Create {
            path: tenant_of(user_path)?.child(ACTIVITY_LOG, ctx.notification.event_id.as_str())?,
            document: entry,
        }])
    }
}
