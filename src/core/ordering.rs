//! Group orderings over parameter blocks.
//!
//! A [`ParameterBlockOrdering`] assigns each parameter block to a non-negative integer group.
//! Groups are processed in ascending id order, so group 0 is eliminated (Schur solvers) or
//! updated (inner iterations) first. An element belongs to at most one group: adding it to a
//! new group moves it.
//!
//! # Example
//!
//! ```
//! use apex_preprocessor::core::ordering::ParameterBlockOrdering;
//! use apex_preprocessor::core::problem::ParameterBlockId;
//!
//! let (a, b, c) = (ParameterBlockId(0), ParameterBlockId(1), ParameterBlockId(2));
//!
//! let mut ordering = ParameterBlockOrdering::new();
//! ordering.add_element_to_group(a, 0);
//! ordering.add_element_to_group(c, 0);
//! ordering.add_element_to_group(b, 1);
//!
//! assert_eq!(ordering.num_groups(), 2);
//! assert_eq!(ordering.group_id(b), Some(1));
//! assert_eq!(ordering.group_size(0), 2);
//! assert!(ordering.is_consecutive_from_zero());
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::core::problem::ParameterBlockId;

/// Partition of parameter blocks into ordered groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterBlockOrdering {
    group_to_elements: BTreeMap<usize, BTreeSet<ParameterBlockId>>,
    element_to_group: HashMap<ParameterBlockId, usize>,
}

impl ParameterBlockOrdering {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an ordering from explicit groups; `groups[i]` becomes group `i`.
    pub fn from_groups<I, G>(groups: I) -> Self
    where
        I: IntoIterator<Item = G>,
        G: IntoIterator<Item = ParameterBlockId>,
    {
        let mut ordering = Self::new();
        for (group, elements) in groups.into_iter().enumerate() {
            for element in elements {
                ordering.add_element_to_group(element, group);
            }
        }
        ordering
    }

    /// Add `element` to `group`, moving it out of any group it was in.
    pub fn add_element_to_group(&mut self, element: ParameterBlockId, group: usize) {
        if let Some(previous) = self.element_to_group.insert(element, group) {
            if previous == group {
                return;
            }
            self.remove_from_group(element, previous);
        }
        self.group_to_elements
            .entry(group)
            .or_default()
            .insert(element);
    }

    /// Remove `element` from the ordering. Returns true if it was present.
    ///
    /// Groups left empty are dropped.
    pub fn remove(&mut self, element: ParameterBlockId) -> bool {
        match self.element_to_group.remove(&element) {
            Some(group) => {
                self.remove_from_group(element, group);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.group_to_elements.clear();
        self.element_to_group.clear();
    }

    pub fn group_id(&self, element: ParameterBlockId) -> Option<usize> {
        self.element_to_group.get(&element).copied()
    }

    pub fn is_member(&self, element: ParameterBlockId) -> bool {
        self.element_to_group.contains_key(&element)
    }

    /// Number of non-empty groups.
    pub fn num_groups(&self) -> usize {
        self.group_to_elements.len()
    }

    pub fn num_elements(&self) -> usize {
        self.element_to_group.len()
    }

    pub fn is_empty(&self) -> bool {
        self.element_to_group.is_empty()
    }

    /// Number of elements in `group` (zero for missing groups).
    pub fn group_size(&self, group: usize) -> usize {
        self.group_to_elements.get(&group).map_or(0, BTreeSet::len)
    }

    pub fn group(&self, group: usize) -> Option<&BTreeSet<ParameterBlockId>> {
        self.group_to_elements.get(&group)
    }

    /// Non-empty groups in ascending id order.
    pub fn groups(&self) -> impl Iterator<Item = (usize, &BTreeSet<ParameterBlockId>)> {
        self.group_to_elements.iter().map(|(&id, set)| (id, set))
    }

    /// Smallest group id in use.
    pub fn min_group_id(&self) -> Option<usize> {
        self.group_to_elements.keys().next().copied()
    }

    /// The lowest-numbered non-empty group.
    pub fn first_group(&self) -> Option<&BTreeSet<ParameterBlockId>> {
        self.group_to_elements.values().next()
    }

    /// True if the group ids in use are exactly `0..num_groups()`.
    pub fn is_consecutive_from_zero(&self) -> bool {
        self.group_to_elements
            .keys()
            .enumerate()
            .all(|(expected, &actual)| expected == actual)
    }

    /// Elements in processing order: group by group, ascending ids within a group.
    pub fn flattened(&self) -> Vec<ParameterBlockId> {
        self.group_to_elements
            .values()
            .flat_map(|set| set.iter().copied())
            .collect()
    }

    /// Sizes of the non-empty groups in processing order.
    pub fn group_sizes(&self) -> Vec<usize> {
        self.group_to_elements.values().map(BTreeSet::len).collect()
    }

    /// Renumber the groups as `0..num_groups()` preserving their relative order.
    pub fn compact(&mut self) {
        if self.is_consecutive_from_zero() {
            return;
        }
        let groups = std::mem::take(&mut self.group_to_elements);
        self.element_to_group.clear();
        for (new_id, (_, elements)) in groups.into_iter().enumerate() {
            for element in elements {
                self.add_element_to_group(element, new_id);
            }
        }
    }

    fn remove_from_group(&mut self, element: ParameterBlockId, group: usize) {
        if let Some(set) = self.group_to_elements.get_mut(&group) {
            set.remove(&element);
            if set.is_empty() {
                self.group_to_elements.remove(&group);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(i: usize) -> ParameterBlockId {
        ParameterBlockId(i)
    }

    #[test]
    fn test_re_adding_moves_element() {
        let mut ordering = ParameterBlockOrdering::new();
        ordering.add_element_to_group(id(0), 0);
        ordering.add_element_to_group(id(0), 3);

        assert_eq!(ordering.num_elements(), 1);
        assert_eq!(ordering.num_groups(), 1);
        assert_eq!(ordering.group_id(id(0)), Some(3));
        assert_eq!(ordering.group_size(0), 0);
    }

    #[test]
    fn test_remove_drops_empty_groups() {
        let mut ordering = ParameterBlockOrdering::from_groups([vec![id(0)], vec![id(1), id(2)]]);
        assert!(ordering.remove(id(0)));
        assert!(!ordering.remove(id(0)));
        assert_eq!(ordering.num_groups(), 1);
        assert_eq!(ordering.min_group_id(), Some(1));
        assert!(!ordering.is_consecutive_from_zero());
    }

    #[test]
    fn test_flattened_follows_group_order() {
        let mut ordering = ParameterBlockOrdering::new();
        ordering.add_element_to_group(id(5), 2);
        ordering.add_element_to_group(id(1), 0);
        ordering.add_element_to_group(id(3), 0);
        ordering.add_element_to_group(id(0), 2);

        assert_eq!(ordering.flattened(), vec![id(1), id(3), id(0), id(5)]);
        assert_eq!(ordering.group_sizes(), vec![2, 2]);
    }

    #[test]
    fn test_compact_renumbers_groups() {
        let mut ordering = ParameterBlockOrdering::new();
        ordering.add_element_to_group(id(0), 4);
        ordering.add_element_to_group(id(1), 7);
        ordering.compact();

        assert!(ordering.is_consecutive_from_zero());
        assert_eq!(ordering.group_id(id(0)), Some(0));
        assert_eq!(ordering.group_id(id(1)), Some(1));
    }

    #[test]
    fn test_empty_ordering() {
        let ordering = ParameterBlockOrdering::new();
        assert!(ordering.is_empty());
        assert!(ordering.is_consecutive_from_zero());
        assert_eq!(ordering.first_group(), None);
        assert_eq!(ordering.min_group_id(), None);
    }
}
