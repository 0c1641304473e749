//! Reconciles discovered tool/prompt/resource definitions against
//! declarative configuration overrides, by name, in a single pass.

use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    #[default]
    Merge,
    Override,
}

/// A declarative override for one discovered item, keyed by its name.
#[derive(Debug, Clone, Default)]
pub struct ItemOverride {
    pub disable: bool,
    pub merge_strategy: MergeStrategy,
    pub description: Option<String>,
    pub title: Option<String>,
    pub schema: Option<Value>,
    pub tags: Vec<String>,
    pub hints: Vec<String>,
}

/// A discovered item as reported by the upstream, prior to reconciliation.
#[derive(Debug, Clone)]
pub struct DiscoveredItem {
    pub name: String,
    pub description: Option<String>,
    pub title: Option<String>,
    pub schema: Option<Value>,
}

/// The reconciled item, ready for proxy-handle registration.
#[derive(Debug, Clone)]
pub struct ReconciledItem {
    pub name: String,
    pub description: Option<String>,
    pub title: Option<String>,
    pub schema: Option<Value>,
    pub tags: Vec<String>,
    pub hints: Vec<String>,
}

/// Apply `overrides` to `discovered`, dropping disabled items. Items with
/// no matching override pass through unchanged (tags/hints empty).
pub fn reconcile(
    discovered: Vec<DiscoveredItem>,
    overrides: &std::collections::HashMap<String, ItemOverride>,
) -> Vec<ReconciledItem> {
    discovered
        .into_iter()
        .filter_map(|item| {
            let Some(over) = overrides.get(&item.name) else {
                return Some(ReconciledItem {
                    name: item.name,
                    description: item.description,
                    title: item.title,
                    schema: item.schema,
                    tags: vec![],
                    hints: vec![],
                });
            };
            if over.disable {
                return None;
            }
            Some(apply_override(item, over))
        })
        .collect()
}

fn apply_override(item: DiscoveredItem, over: &ItemOverride) -> ReconciledItem {
    match over.merge_strategy {
        MergeStrategy::Merge => ReconciledItem {
            name: item.name,
            description: non_empty(over.description.clone()).or(item.description),
            title: non_empty(over.title.clone()).or(item.title),
            schema: merge_schema(item.schema, over.schema.clone()),
            tags: over.tags.clone(),
            hints: over.hints.clone(),
        },
        MergeStrategy::Override => ReconciledItem {
            name: item.name,
            description: over.description.clone().or(item.description),
            title: over.title.clone().or(item.title),
            schema: over.schema.clone().or(item.schema),
            tags: over.tags.clone(),
            hints: over.hints.clone(),
        },
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

/// MERGE strategy schema combination: the override's top-level fields
/// replace matching keys recursively; other discovered keys are preserved.
fn merge_schema(base: Option<Value>, override_schema: Option<Value>) -> Option<Value> {
    match (base, override_schema) {
        (Some(Value::Object(base_obj)), Some(Value::Object(over_obj))) => {
            Some(Value::Object(merge_objects(base_obj, over_obj)))
        }
        (base, None) => base,
        (None, over) => over,
        (_, over) => over,
    }
}

fn merge_objects(mut base: Map<String, Value>, over: Map<String, Value>) -> Map<String, Value> {
    for (key, value) in over {
        match (base.get(&key).cloned(), &value) {
            (Some(Value::Object(base_nested)), Value::Object(over_nested)) => {
                base.insert(
                    key,
                    Value::Object(merge_objects(base_nested, over_nested.clone())),
                );
            }
            _ => {
                base.insert(key, value);
            }
        }
    }
    base
}
