//! Ordered bins: application-mandated draw order
//!
//! An ordered group's children are drawn one after another in child order
//! (or in the order of a custom child-index table). Each child owns a
//! complete bin domain, so state sorting still happens inside a child but
//! never across children.

use crate::render::bins::{Domain, DomainId};
use crate::scene::OrderedGroupId;

/// Bins of one ordered group
#[derive(Debug)]
pub struct OrderedBin {
    /// Scene-graph group
    pub group: OrderedGroupId,
    /// Domain the group hangs in
    pub parent: DomainId,
    /// Still on the parent's pending list
    pub pending: bool,
    /// One domain per child index
    pub collections: Vec<Domain>,
    /// Custom draw order of child indices
    pub child_order: Option<Vec<usize>>,
}

impl OrderedBin {
    /// Empty ordered bin
    pub fn new(group: OrderedGroupId, parent: DomainId, child_order: Option<Vec<usize>>) -> Self {
        Self {
            group,
            parent,
            pending: true,
            collections: Vec::new(),
            child_order,
        }
    }

    /// Domain of child `index`, created on demand
    pub fn collection_mut(&mut self, index: usize) -> &mut Domain {
        if self.collections.len() <= index {
            self.collections.resize_with(index + 1, Domain::default);
        }
        &mut self.collections[index]
    }

    /// Child indices in draw order
    ///
    /// Table entries past the last child are skipped; children the table
    /// does not mention are not drawn.
    pub fn draw_order(&self) -> Vec<usize> {
        match &self.child_order {
            Some(order) => order.iter().copied().filter(|&i| i < self.collections.len()).collect(),
            None => (0..self.collections.len()).collect(),
        }
    }

    /// No child holds any bins
    pub fn is_empty(&self) -> bool {
        self.collections.iter().all(Domain::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_draw_order_defaults_to_child_order() {
        let mut bin = OrderedBin::new(OrderedGroupId(1), DomainId::Scene, None);
        bin.collection_mut(2);
        assert_eq!(bin.draw_order(), vec![0, 1, 2]);
        assert!(bin.is_empty());
    }

    #[test]
    fn test_custom_child_order() {
        let mut bin = OrderedBin::new(OrderedGroupId(1), DomainId::Scene, Some(vec![2, 0, 7, 1]));
        bin.collection_mut(2);
        assert_eq!(bin.draw_order(), vec![2, 0, 1]);
    }
}
