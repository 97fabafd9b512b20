use vg_core::types::{FilterCombinator, FilterField, FilterNode, FilterOperator};
use vg_pipeline::IngestedEvent;

/// Evaluate a rule's scope filter tree against an event.
///
/// A rule with a filter that does not match never triggers, regardless of
/// counts. An empty group is vacuously true for `and`, false for `or`.
pub fn matches(node: &FilterNode, event: &IngestedEvent) -> bool {
    match node {
        FilterNode::Group { op, conditions } => match op {
            FilterCombinator::And => conditions.iter().all(|c| matches(c, event)),
            FilterCombinator::Or => conditions.iter().any(|c| matches(c, event)),
        },
        FilterNode::Leaf {
            field,
            operator,
            value,
        } => {
            let actual = field_value(*field, event);
            leaf_matches(actual.as_deref(), *operator, value)
        }
    }
}

fn field_value(field: FilterField, event: &IngestedEvent) -> Option<String> {
    match field {
        FilterField::Environment => Some(event.environment.clone()),
        FilterField::Severity => Some(event.severity.as_str().to_string()),
        FilterField::UserSegment => event.user_segment.clone(),
        FilterField::File => event.source_file.clone(),
        FilterField::Fingerprint => Some(event.fingerprint.clone()),
    }
}

fn leaf_matches(actual: Option<&str>, operator: FilterOperator, value: &serde_json::Value) -> bool {
    let Some(actual) = actual else {
        // An absent field only satisfies a negative comparison.
        return matches!(operator, FilterOperator::Not);
    };
    match operator {
        FilterOperator::Equals => value.as_str() == Some(actual),
        FilterOperator::Not => value.as_str() != Some(actual),
        FilterOperator::Contains => value
            .as_str()
            .map(|needle| actual.contains(needle))
            .unwrap_or(false),
        FilterOperator::StartsWith => value
            .as_str()
            .map(|prefix| actual.starts_with(prefix))
            .unwrap_or(false),
        FilterOperator::In => value
            .as_array()
            .map(|options| options.iter().any(|v| v.as_str() == Some(actual)))
            .unwrap_or(false),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
