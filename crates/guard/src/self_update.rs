use concepts::{Document, HandlerName, LAST_MODIFIED_BY};

/// True when the handler's own write produced this snapshot.
///
/// Only direct echoes are recognised. Two handlers writing each other's watched fields
/// are not detected here, the invocation monitor is the backstop for such cycles.
#[must_use]
pub fn is_self_echo(after: &Document, handler_name: &HandlerName) -> bool {
    after
        .get(LAST_MODIFIED_BY)
        .and_then(serde_json::Value::as_str)
        .is_some_and(|writer| writer == &**handler_name)
}
