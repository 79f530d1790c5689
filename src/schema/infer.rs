use anyhow::{Result, bail};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};

use super::{PropertyType, SchemaModel, ValueKind};
use crate::pipeline::FeatureSink;
use crate::sinks::Feature;

/// First-pass reduction over every feature: geometry type set plus the set
/// of value kinds seen per property key, keys kept in first-seen order.
#[derive(Debug, Default)]
pub struct SchemaCollector {
    geometry_types: BTreeSet<String>,
    properties: IndexMap<String, BTreeSet<ValueKind>>,
    observed: u64,
}

impl SchemaCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, feature: &Feature) {
        self.observed += 1;
        if let Some(geom_type) = feature
            .geometry
            .as_ref()
            .and_then(|geometry| geometry.get("type"))
            .and_then(Value::as_str)
        {
            if !self.geometry_types.contains(geom_type) {
                self.geometry_types.insert(geom_type.to_string());
            }
        }

        for (key, value) in &feature.properties {
            let kind = ValueKind::of(value);
            match self.properties.get_mut(key) {
                Some(kinds) => {
                    kinds.insert(kind);
                }
                None => {
                    self.properties.insert(key.clone(), BTreeSet::from([kind]));
                }
            }
        }
    }

    /// Unifies the collected types into a schema. Fails when no geometry was seen.
    pub fn finish(self) -> Result<SchemaModel> {
        if self.geometry_types.is_empty() {
            bail!(
                "Schema: No geometry types found in {} features",
                self.observed
            );
        }

        let renames = resolve_collisions(self.properties.keys().map(String::as_str));
        for (original, renamed) in &renames {
            tracing::info!("Renaming property {:?} to {:?} (case-insensitive collision)", original, renamed);
        }

        let properties = self
            .properties
            .iter()
            .map(|(key, kinds)| {
                let name = renames.get(key).unwrap_or(key).clone();
                (name, unify(kinds))
            })
            .collect();

        Ok(SchemaModel {
            geometry: self.geometry_types,
            properties,
            renames,
        })
    }
}

impl FeatureSink for SchemaCollector {
    fn write(&mut self, feature: Feature) -> Result<()> {
        self.observe(&feature);
        Ok(())
    }

    fn size(&self) -> u64 {
        0
    }
}

/// Collapses the value kinds observed for one property into its column type.
///
/// Int widens to float when both appear; null next to exactly one other kind
/// is dropped; a lone null, or any remaining mix, becomes `str`.
pub fn unify(kinds: &BTreeSet<ValueKind>) -> PropertyType {
    let mut kinds = kinds.clone();
    if kinds.contains(&ValueKind::Int) && kinds.contains(&ValueKind::Float) {
        kinds.remove(&ValueKind::Int);
    }
    if kinds.len() == 2 && kinds.contains(&ValueKind::Null) {
        kinds.remove(&ValueKind::Null);
    }
    match kinds.iter().next() {
        Some(kind) if kinds.len() == 1 => kind.as_property_type(),
        _ => PropertyType::Str,
    }
}

/// Picks a distinct name for every key that collides case-insensitively
/// with an earlier one, probing `key_2`, `key_3`, ...
///
/// The first key of each lowercase group keeps its name. Returns only the
/// keys that had to move, in first-seen order.
pub fn resolve_collisions<'a, I>(keys: I) -> IndexMap<String, String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut taken: HashSet<String> = HashSet::new();
    let mut followers = Vec::new();
    for key in keys {
        if !taken.insert(key.to_lowercase()) {
            followers.push(key);
        }
    }

    let mut renames = IndexMap::new();
    for key in followers {
        let mut suffix = 2u32;
        let renamed = loop {
            let candidate = format!("{key}_{suffix}");
            if taken.insert(candidate.to_lowercase()) {
                break candidate;
            }
            suffix += 1;
        };
        renames.insert(key.to_string(), renamed);
    }
    renames
}
