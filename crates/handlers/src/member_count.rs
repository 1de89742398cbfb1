use async_trait::async_trait;
use concepts::ChangeKind;
use concepts::StrVariant;
use concepts::storage::DocumentUpdate;
use guard::handler::{Effect, Handler, HandlerContext, HandlerDecl, HandlerDeclError, HandlerError};

pub const NAME: &str = "aggregateMemberCount";
pub const MEMBER_COUNT: &str = "memberCount";

/// Maintains `memberCount` on a team as members are added and removed.
pub struct AggregateMemberCount {
    decl: HandlerDecl,
}

impl AggregateMemberCount {
    pub fn new() -> Result<Self, HandlerDeclError> {
        Ok(Self {
            decl: HandlerDecl::new(
                NAME,
                "tenants/*/teams/*/members/*",
                &["uid"],
                &[ChangeKind::Create, ChangeKind::Delete],
            )?,
        })
    }
}

#[async_trait]
impl Handler for AggregateMemberCount {
    fn decl(&self) -> &HandlerDecl {
        &self.decl
    }

    async fn handle(&self, ctx: &HandlerContext) -> Result<Vec<Effect>, HandlerError> {
        let delta = match ctx.kind() {
            ChangeKind::Create => 1,
            ChangeKind::Delete => -1,
            ChangeKind::Update => return Ok(Vec::new()),
        };
        let team = ctx.notification.document_path.parent_document().ok_or(
            HandlerError::InvalidDocument(StrVariant::Static("member must belong to a team")),
        )?;
        Ok(vec![Effect::Update {
            path: team,
            update: DocumentUpdate::default().increment(MEMBER_COUNT, delta),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context;
    use serde_json::json;
    use test_utils::document;

    #[tokio::test]
    async fn member_added_and_removed() {
        let handler = AggregateMemberCount::new().unwrap();
        let path = "tenants/t1/teams/a/members/b";
        let team_update = |delta| Effect::Update {
            path: "tenants/t1/teams/a".parse().unwrap(),
            update: DocumentUpdate::default().increment("memberCount", delta),
        };

        let created = context(&handler, path, None, Some(document(json!({"uid": "b"}))));
        assert_eq!(vec![team_update(1)], handler.handle(&created).await.unwrap());

        let deleted = context(&handler, path, Some(document(json!({"uid": "b"}))), None);
        assert_eq!(vec![team_update(-1)], handler.handle(&deleted).await.unwrap());
    }
}
