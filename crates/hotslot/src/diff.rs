//! Descriptor diff engine
//!
//! Classifies ids between two descriptor sets. Only the module path decides
//! whether an entry changed; `name` and `version` edits alone do not cause a
//! reload.

use std::collections::HashMap;

use crate::descriptor::PluginDescriptor;

/// Result of comparing two descriptor sets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorDiff {
    /// In `latest` only, in `latest` order
    pub added: Vec<PluginDescriptor>,
    /// In both with a different `file`, the `latest` descriptor, in `latest` order
    pub changed: Vec<PluginDescriptor>,
    /// In `current` only, in `current` order
    pub removed: Vec<PluginDescriptor>,
}

impl DescriptorDiff {
    /// Nothing to do
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Compare `current` against `latest`
pub fn diff(current: &[PluginDescriptor], latest: &[PluginDescriptor]) -> DescriptorDiff {
    let current_by_id: HashMap<&str, &PluginDescriptor> =
        current.iter().map(|d| (d.id.as_str(), d)).collect();
    let latest_by_id: HashMap<&str, &PluginDescriptor> =
        latest.iter().map(|d| (d.id.as_str(), d)).collect();

    let mut result = DescriptorDiff::default();

    for item in latest {
        match current_by_id.get(item.id.as_str()) {
            Some(existing) if existing.file != item.file => result.changed.push(item.clone()),
            Some(_) => {}
            None => result.added.push(item.clone()),
        }
    }

    result.removed = current
        .iter()
        .filter(|d| !latest_by_id.contains_key(d.id.as_str()))
        .cloned()
        .collect();

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn d(id: &str, file: &str) -> PluginDescriptor {
        PluginDescriptor::new(id, file, "Add")
    }

    fn ids(descriptors: &[PluginDescriptor]) -> HashSet<String> {
        descriptors.iter().map(|d| d.id.clone()).collect()
    }

    #[test]
    fn test_classification() {
        let current = vec![d("a", "a.so"), d("b", "b.so"), d("c", "c.so")];
        let latest = vec![d("d", "d.so"), d("c", "c2.so"), d("a", "a.so")];

        let result = diff(&current, &latest);
        assert_eq!(result.added, vec![d("d", "d.so")]);
        assert_eq!(result.changed, vec![d("c", "c2.so")]);
        assert_eq!(result.removed, vec![d("b", "b.so")]);
    }

    #[test]
    fn test_name_and_version_do_not_count_as_change() {
        let current = vec![d("a", "a.so")];
        let latest = vec![
            PluginDescriptor::new("a", "a.so", "Sub").with_version("9.9.9"),
        ];

        assert!(diff(&current, &latest).is_empty());
    }

    #[test]
    fn test_order_follows_inputs() {
        let current = vec![d("r1", "x"), d("keep", "k"), d("r2", "y")];
        let latest = vec![d("n2", "n2"), d("keep", "k2"), d("n1", "n1")];

        let result = diff(&current, &latest);
        let added: Vec<_> = result.added.iter().map(|d| d.id.as_str()).collect();
        let removed: Vec<_> = result.removed.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(added, vec!["n2", "n1"]);
        assert_eq!(removed, vec!["r1", "r2"]);
    }

    #[test]
    fn test_empty_sides() {
        let set = vec![d("a", "a.so"), d("b", "b.so")];

        let from_empty = diff(&[], &set);
        assert_eq!(ids(&from_empty.added), ids(&set));
        assert!(from_empty.changed.is_empty() && from_empty.removed.is_empty());

        let to_empty = diff(&set, &[]);
        assert_eq!(ids(&to_empty.removed), ids(&set));
        assert!(to_empty.added.is_empty() && to_empty.changed.is_empty());

        assert!(diff(&set, &set).is_empty());
    }

    #[test]
    fn test_every_id_lands_in_exactly_one_category() {
        let pool = ["a", "b", "c", "d", "e"];
        let files = ["x.so", "y.so"];

        // Walk every assignment of {absent, x.so, y.so} to each id on both sides.
        for mask in 0..3_u32.pow(pool.len() as u32 * 2) {
            let mut m = mask;
            let mut current = Vec::new();
            let mut latest = Vec::new();
            for id in pool {
                for side in [&mut current, &mut latest] {
                    let pick = m % 3;
                    m /= 3;
                    if pick > 0 {
                        side.push(d(id, files[pick as usize - 1]));
                    }
                }
            }

            let result = diff(&current, &latest);
            let added = ids(&result.added);
            let changed = ids(&result.changed);
            let removed = ids(&result.removed);
            let current_ids = ids(&current);
            let latest_ids = ids(&latest);
            let unchanged: HashSet<String> = current
                .iter()
                .filter(|c| latest.iter().any(|l| l.id == c.id && l.file == c.file))
                .map(|c| c.id.clone())
                .collect();

            assert!(added.is_disjoint(&changed));
            assert!(added.is_disjoint(&removed));
            assert!(changed.is_disjoint(&removed));
            assert!(unchanged.is_disjoint(&changed));

            let mut latest_side = added.clone();
            latest_side.extend(changed.iter().cloned());
            latest_side.extend(unchanged.iter().cloned());
            assert_eq!(latest_side, latest_ids);

            let mut current_side = removed.clone();
            current_side.extend(changed.iter().cloned());
            current_side.extend(unchanged.iter().cloned());
            assert_eq!(current_side, current_ids);
        }
    }
}
