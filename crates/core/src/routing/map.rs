use super::matching::match_route_for_target;
use anonroute_common::CircuitId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// One destination binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub target: String,
    pub circuit_id: CircuitId,
}

impl RouteEntry {
    pub fn new(target: impl Into<String>, circuit_id: CircuitId) -> Self {
        Self {
            target: target.into(),
            circuit_id,
        }
    }
}

/// Destination to circuit map, in insertion order
///
/// Cloning shares the underlying map. Every operation takes the lock
/// once, so readers never observe a half-applied write.
#[derive(Debug, Clone, Default)]
pub struct RoutingMap {
    inner: Arc<RwLock<Vec<RouteEntry>>>,
}

impl RoutingMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `target`, returning the circuit it was bound to before
    pub async fn insert(&self, target: &str, circuit_id: CircuitId) -> Option<CircuitId> {
        let mut entries = self.inner.write().await;
        match entries.iter().position(|e| e.target == target) {
            Some(idx) => Some(std::mem::replace(&mut entries[idx].circuit_id, circuit_id)),
            None => {
                entries.push(RouteEntry::new(target, circuit_id));
                None
            }
        }
    }

    pub async fn get(&self, target: &str) -> Option<CircuitId> {
        self.inner
            .read()
            .await
            .iter()
            .find(|e| e.target == target)
            .map(|e| e.circuit_id)
    }

    /// Remove `target` only while it still maps to `expected`
    pub async fn remove_if(&self, target: &str, expected: CircuitId) -> bool {
        let mut entries = self.inner.write().await;
        match entries
            .iter()
            .position(|e| e.target == target && e.circuit_id == expected)
        {
            Some(idx) => {
                entries.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Compare-and-swap: bind `target` to `new` only if its current
    /// binding equals `expected` (`None` meaning unbound)
    pub async fn replace_if(
        &self,
        target: &str,
        expected: Option<CircuitId>,
        new: CircuitId,
    ) -> bool {
        let mut entries = self.inner.write().await;
        let position = entries.iter().position(|e| e.target == target);

        match (position, expected) {
            (Some(idx), Some(expected)) if entries[idx].circuit_id == expected => {
                entries[idx].circuit_id = new;
                true
            }
            (None, None) => {
                entries.push(RouteEntry::new(target, new));
                true
            }
            _ => false,
        }
    }

    /// Reverse lookup
    pub async fn target_for_circuit(&self, circuit_id: CircuitId) -> Option<String> {
        self.inner
            .read()
            .await
            .iter()
            .find(|e| e.circuit_id == circuit_id)
            .map(|e| e.target.clone())
    }

    /// First entry whose key matches `target_address`
    pub async fn match_target(&self, target_address: &str) -> Option<RouteEntry> {
        let entries = self.inner.read().await;
        match_route_for_target(target_address, &entries).cloned()
    }

    /// Ordered snapshot
    pub async fn entries(&self) -> Vec<RouteEntry> {
        self.inner.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_keeps_order_and_position() {
        let map = RoutingMap::new();
        assert_eq!(map.insert("a.com", CircuitId(1)).await, None);
        assert_eq!(map.insert("b.com", CircuitId(2)).await, None);
        assert_eq!(map.insert("a.com", CircuitId(3)).await, Some(CircuitId(1)));

        let targets: Vec<_> = map.entries().await.into_iter().map(|e| e.target).collect();
        assert_eq!(targets, vec!["a.com", "b.com"]);
        assert_eq!(map.get("a.com").await, Some(CircuitId(3)));
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let map = RoutingMap::new();
        map.insert("a.com", CircuitId(7)).await;

        assert!(!map.remove_if("a.com", CircuitId(8)).await);
        assert_eq!(map.get("a.com").await, Some(CircuitId(7)));

        assert!(map.remove_if("a.com", CircuitId(7)).await);
        assert!(map.is_empty().await);
        assert!(!map.remove_if("a.com", CircuitId(7)).await);
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let map = RoutingMap::new();

        assert!(map.replace_if("a.com", None, CircuitId(1)).await);
        assert!(!map.replace_if("a.com", None, CircuitId(2)).await);
        assert!(!map.replace_if("a.com", Some(CircuitId(9)), CircuitId(2)).await);
        assert!(map.replace_if("a.com", Some(CircuitId(1)), CircuitId(2)).await);
        assert_eq!(map.get("a.com").await, Some(CircuitId(2)));

        assert!(!map.replace_if("b.com", Some(CircuitId(2)), CircuitId(3)).await);
        assert_eq!(map.len().await, 1);
    }

    #[tokio::test]
    async fn test_reverse_lookup_and_clear() {
        let map = RoutingMap::new();
        map.insert("a.com", CircuitId(1)).await;
        map.insert("b.com", CircuitId(2)).await;

        assert_eq!(map.target_for_circuit(CircuitId(2)).await.as_deref(), Some("b.com"));
        assert_eq!(map.target_for_circuit(CircuitId(5)).await, None);

        let shared = map.clone();
        shared.clear().await;
        assert!(map.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_rebinds_never_duplicate() {
        let map = RoutingMap::new();
        map.insert("a.com", CircuitId(1)).await;

        let handles: Vec<_> = (2..10u64)
            .map(|id| {
                let map = map.clone();
                tokio::spawn(async move { map.replace_if("a.com", Some(CircuitId(1)), CircuitId(id)).await })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(map.len().await, 1);
    }
}
