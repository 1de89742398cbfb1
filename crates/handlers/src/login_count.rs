use crate::required_after;
use async_trait::async_trait;
use concepts::ChangeKind;
use concepts::storage::DocumentUpdate;
use guard::handler::{Effect, Handler, HandlerContext, HandlerDecl, HandlerDeclError, HandlerError};

pub const NAME: &str = "incrementLoginCount";
const LOGIN_COUNT: &str = "loginCount";

/// Counts logins: every change of `lastSeen` bumps `loginCount` on the same user.
pub struct IncrementLoginCount {
    decl: HandlerDecl,
}

impl IncrementLoginCount {
    pub fn new() -> Result<Self, HandlerDeclError> {
        Ok(Self {
            decl: HandlerDecl::new(
                NAME,
                "tenants/*/users/*",
                &["lastSeen"],
                &[ChangeKind::Update],
            )?,
        })
    }
}

#[async_trait]
impl Handler for IncrementLoginCount {
    fn decl(&self) -> &HandlerDecl {
        &self.decl
    }

    async fn handle(&self, ctx: &HandlerContext) -> Result<Vec<Effect>, HandlerError> {
        let after = required_after(ctx.after())?;
        let current = after
            .get(LOGIN_COUNT)
            .and_then(serde_json::Value::as_i64)
            .unwrap_or_default();
        Ok(vec![Effect::Update {
            path: ctx.notification.document_path.clone(),
            update: DocumentUpdate::default().set(LOGIN_COUNT, current.saturating_add(1)),
        }])
    }
}
