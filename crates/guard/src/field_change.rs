use concepts::{Document, FieldPath};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldChanges {
    pub changed: bool,
    /// Subset of the watched fields whose value differs, in the order they were watched.
    pub changed_fields: Vec<FieldPath>,
}

/// Compare the watched fields of two document snapshots.
///
/// Values are compared by JSON equality. A field present on one side only counts as
/// changed, a field missing on both sides does not. Without a `before` snapshot
/// (a creation) every watched field present in `after` counts as changed.
#[must_use]
pub fn any_changed(
    before: Option<&Document>,
    after: &Document,
    watched_fields: &[FieldPath],
) -> FieldChanges {
    let changed_fields: Vec<_> = watched_fields
        .iter()
        .filter(|field| {
            let new_value = field.lookup(after);
            match before {
                Some(before) => field.lookup(before) != new_value,
                None => new_value.is_some(),
            }
        })
        .cloned()
        .collect();
    FieldChanges {
        changed: !changed_fields.is_empty(),
        changed_fields,
    }
}
