use crate::{required_after, tenant_of};
use async_trait::async_trait;
use concepts::storage::DocumentUpdate;
use concepts::{ChangeKind, Document, format_timestamp};
use guard::handler::{Effect, Handler, HandlerContext, HandlerDecl, HandlerDeclError, HandlerError};
use tracing::debug;

pub const NAME: &str = "trackActivation";
pub const ACTIVE_USER_COUNT: &str = "activeUserCount";

fn is_active(document: Option<&Document>) -> bool {
    document
        .and_then(|document| document.get("status"))
        .and_then(serde_json::Value::as_str)
        == Some("active")
}

/// Stamps activation and deactivation times on users and keeps the tenant's
/// `activeUserCount` in sync.
pub struct TrackActivation {
    decl: HandlerDecl,
}

impl TrackActivation {
    pub fn new() -> Result<Self, HandlerDeclError> {
        Ok(Self {
            decl: HandlerDecl::new(
                NAME,
                "tenants/*/users/*",
                &["status"],
                &[ChangeKind::Create, ChangeKind::Update],
            )?,
        })
    }
}

#[async_trait]
impl Handler for TrackActivation {
    fn decl(&self) -> &HandlerDecl {
        &self.decl
    }

    async fn handle(&self, ctx: &HandlerContext) -> Result<Vec<Effect>, HandlerError> {
        let was_active = is_active(ctx.before());
        let now_active = is_active(Some(required_after(ctx.after())?));
        let (stamp, delta) = match (was_active, now_active) {
            (false, true) => ("activatedAt", 1),
            (true, false) => ("deactivatedAt", -1),
            _ => return Ok(Vec::new()),
        };
        let user_path = &ctx.notification.document_path;
        debug!(%user_path, was_active, now_active, "Activation status changed");
        Ok(vec![
            Effect::Update {
                path: user_path.clone(),
                update: DocumentUpdate::default().set(stamp, format_timestamp(ctx.now)),
            },
            Effect::Update {
                path: tenant_of(user_path)?,
                update: DocumentUpdate::default().increment(ACTIVE_USER_COUNT, delta),
            },
        ])
    }
}
