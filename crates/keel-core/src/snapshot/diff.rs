use std::collections::BTreeMap;

use serde::Serialize;

use super::Snapshot;
use crate::model::{Identity, Row, Value};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub old: Value,
    pub new: Value,
}

/// Changed columns of one entity, ordered by column name
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDiff {
    identity: Identity,
    changes: BTreeMap<String, FieldChange>,
}

impl FieldDiff {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Names of the changed columns
    pub fn fields(&self) -> Vec<&str> {
        self.changes.keys().map(String::as_str).collect()
    }

    pub fn change(&self, column: &str) -> Option<&FieldChange> {
        self.changes.get(column)
    }

    pub fn changes(&self) -> &BTreeMap<String, FieldChange> {
        &self.changes
    }

    /// New values of the changed columns
    pub(crate) fn to_row(&self) -> Row {
        self.changes
            .iter()
            .map(|(column, change)| (column.clone(), change.new.clone()))
            .collect()
    }
}

/// Columns whose current value differs from the baseline
///
/// A column missing from the baseline counts as previously NULL.
pub fn compute_diff(identity: &Identity, baseline: &Snapshot, current: &Snapshot) -> FieldDiff {
    let changes = current
        .values()
        .iter()
        .filter_map(|(column, new)| {
            let old = baseline.value(column).cloned().unwrap_or(Value::Null);
            (old != *new).then(|| {
                (
                    column.clone(),
                    FieldChange {
                        old,
                        new: new.clone(),
                    },
                )
            })
        })
        .collect();

    FieldDiff {
        identity: identity.clone(),
        changes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(pairs: &[(&str, Value)]) -> Snapshot {
        let mut snapshot = Snapshot::default();
        for (column, value) in pairs {
            snapshot.values.insert(column.to_string(), value.clone());
        }
        snapshot
    }

    #[test]
    fn test_diff_lists_only_changed_columns() {
        let identity = Identity::new("Pirate", 1);
        let before = snapshot(&[("name", "Jack".into()), ("bounty", Value::Int(10_000))]);
        let after = snapshot(&[("name", "Jack".into()), ("bounty", Value::Int(25_000))]);

        let diff = compute_diff(&identity, &before, &after);
        assert_eq!(diff.fields(), vec!["bounty"]);
        assert_eq!(
            diff.change("bounty"),
            Some(&FieldChange {
                old: Value::Int(10_000),
                new: Value::Int(25_000)
            })
        );
    }

    #[test]
    fn test_identical_snapshots_produce_empty_diff() {
        let identity = Identity::new("Pirate", 1);
        let state = snapshot(&[("name", "Anne".into())]);
        assert!(compute_diff(&identity, &state, &state.clone()).is_empty());
    }

    #[test]
    fn test_missing_baseline_column_counts_as_null() {
        let identity = Identity::new("Pirate", 1);
        let before = Snapshot::default();
        let after = snapshot(&[("nickname", Value::Null), ("name", "Mary".into())]);

        let diff = compute_diff(&identity, &before, &after);
        assert_eq!(diff.fields(), vec!["name"]);
    }
}
