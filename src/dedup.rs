//! Canonical order list.
//!
//! Orders reach the terminal from several origins (local entry, remote
//! push, external ordering platforms) and the same logical order can exist
//! under different identities. Records sharing any identity key are
//! grouped with a union-find pass, and one winner per group is chosen
//! deterministically. The view is a projection of the local store and is
//! always safe to rebuild.

use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::models::{Order, OrderStatus, SyncStatus};

/// Channels that belong to this system itself.
const INTERNAL_CHANNELS: &[&str] = &[
    "pos",
    "in-store",
    "in_store",
    "instore",
    "terminal",
    "web",
    "website",
    "mobile",
    "mobile-app",
    "app",
    "kiosk",
];

/// Ordering platforms whose orders wait for explicit acceptance.
const KNOWN_EXTERNAL_PLATFORMS: &[&str] = &[
    "wolt",
    "efood",
    "box",
    "glovo",
    "deliveroo",
    "uber_eats",
    "ubereats",
    "foodpanda",
    "just_eat",
    "justeat",
    "lieferando",
    "thuisbezorgd",
    "doordash",
    "grubhub",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupView {
    /// Every logical order once, oldest first.
    pub orders: Vec<Order>,
    /// External-platform orders awaiting acceptance, oldest first.
    pub pending_external: Vec<Order>,
}

impl DedupView {
    /// Canonical orders without the ones still awaiting acceptance.
    pub fn visible(&self) -> Vec<&Order> {
        let waiting: HashSet<&str> = self.pending_external.iter().map(|o| o.id.as_str()).collect();
        self.orders
            .iter()
            .filter(|o| !waiting.contains(o.id.as_str()))
            .collect()
    }
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Smaller index stays root so grouping is order-stable.
            let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[child] = root;
        }
    }
}

/// Identity keys in priority order. Local and remote ids share one
/// namespace since either may be what another origin knows the order by.
fn identity_keys(order: &Order) -> Vec<String> {
    let mut keys = Vec::with_capacity(4);
    if let Some((platform, external_id)) = order.external_identity() {
        keys.push(format!("ext:{platform}:{external_id}"));
    }
    if let Some(number) = order.order_number.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        keys.push(format!("num:{number}"));
    }
    if let Some(remote_id) = order.remote_id.as_deref().filter(|r| !r.is_empty()) {
        keys.push(format!("id:{remote_id}"));
    }
    keys.push(format!("id:{}", order.id));
    keys
}

/// Whether `candidate` (later in input order) replaces `current`.
fn prefer(candidate: &Order, current: &Order) -> bool {
    let candidate_pending = candidate.sync_status == SyncStatus::Pending;
    let current_pending = current.sync_status == SyncStatus::Pending;
    if candidate_pending != current_pending {
        return candidate_pending;
    }
    (candidate.updated_at, candidate.created_at) >= (current.updated_at, current.created_at)
}

#[derive(Debug, Clone)]
pub struct DedupAndQueueSplitter {
    internal_channels: Vec<String>,
    external_platforms: Vec<String>,
}

impl Default for DedupAndQueueSplitter {
    fn default() -> Self {
        Self {
            internal_channels: INTERNAL_CHANNELS.iter().map(|c| c.to_string()).collect(),
            external_platforms: KNOWN_EXTERNAL_PLATFORMS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl DedupAndQueueSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the recognized external platform tags.
    pub fn with_external_platforms<I, S>(mut self, platforms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.external_platforms = platforms
            .into_iter()
            .map(|p| p.as_ref().trim().to_lowercase())
            .collect();
        self
    }

    pub fn is_pending_external(&self, order: &Order) -> bool {
        if order.status != OrderStatus::Pending {
            return false;
        }
        let Some((platform, _)) = order.external_identity() else {
            return false;
        };
        !self.internal_channels.contains(&platform) && self.external_platforms.contains(&platform)
    }

    /// Collapse `orders` (earlier entries are older knowledge, later ones
    /// incoming) into one record per logical order.
    pub fn dedupe(&self, orders: Vec<Order>) -> Vec<Order> {
        let mut sets = DisjointSet::new(orders.len());
        let mut owner: HashMap<String, usize> = HashMap::new();
        for (index, order) in orders.iter().enumerate() {
            for key in identity_keys(order) {
                match owner.get(&key) {
                    Some(&first) => sets.union(first, index),
                    None => {
                        owner.insert(key, index);
                    }
                }
            }
        }

        let mut winners: HashMap<usize, usize> = HashMap::new();
        for index in 0..orders.len() {
            let root = sets.find(index);
            match winners.get(&root) {
                Some(&current) if !prefer(&orders[index], &orders[current]) => {}
                _ => {
                    winners.insert(root, index);
                }
            }
        }

        let chosen: HashSet<usize> = winners.into_values().collect();
        let mut result: Vec<Order> = orders
            .into_iter()
            .enumerate()
            .filter(|(index, order)| chosen.contains(index) && order.deleted_at.is_none())
            .map(|(_, order)| order)
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        result
    }

    pub fn split(&self, orders: Vec<Order>) -> DedupView {
        let orders = self.dedupe(orders);
        let pending_external = orders
            .iter()
            .filter(|o| self.is_pending_external(o))
            .cloned()
            .collect();
        DedupView {
            orders,
            pending_external,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn order(id: &str, minute: i64) -> Order {
        let base = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        let mut o = Order::new_local(id, "term-1", base + Duration::minutes(minute));
        o.sync_status = SyncStatus::Synced;
        o
    }

    fn external(id: &str, platform: &str, ext: &str, minute: i64) -> Order {
        let mut o = order(id, minute);
        o.platform = Some(platform.into());
        o.external_platform_order_id = Some(ext.into());
        o
    }

    #[test]
    fn external_pair_collapses_to_one_record_deterministically() {
        let a = external("a", "wolt", "W-1", 0);
        let mut b = external("b", "wolt", "W-1", 0);
        b.updated_at = a.updated_at + Duration::seconds(30);
        let input = vec![a.clone(), b.clone()];

        let splitter = DedupAndQueueSplitter::new();
        let first = splitter.dedupe(input.clone());
        let second = splitter.dedupe(input);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, "b");
        assert_eq!(first, second);
    }

    #[test]
    fn pending_record_beats_newer_synced_copy() {
        let mut local = order("local-1", 0);
        local.order_number = Some("ORD-7".into());
        local.sync_status = SyncStatus::Pending;
        let mut remote = order("remote-1", 0);
        remote.order_number = Some("ORD-7".into());
        remote.updated_at = local.updated_at + Duration::minutes(10);

        let out = DedupAndQueueSplitter::new().dedupe(vec![local, remote]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "local-1");
    }

    #[test]
    fn equal_timestamps_keep_the_incoming_record() {
        let mut a = order("a", 0);
        a.order_number = Some("ORD-1".into());
        let mut b = order("b", 0);
        b.order_number = Some("ORD-1".into());
        let out = DedupAndQueueSplitter::new().dedupe(vec![a, b]);
        assert_eq!(out[0].id, "b");
    }

    #[test]
    fn keys_chain_transitively() {
        // a~b by order number, b~c by remote id.
        let mut a = order("a", 0);
        a.order_number = Some("ORD-9".into());
        let mut b = order("b", 1);
        b.order_number = Some("ORD-9".into());
        b.remote_id = Some("r-9".into());
        let c = order("r-9", 2);
        let d = order("d", 3);

        let out = DedupAndQueueSplitter::new().dedupe(vec![a, b, c, d]);
        let ids: Vec<&str> = out.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["r-9", "d"]);
    }

    #[test]
    fn pending_external_queue_is_fifo_and_excludes_internal_channels() {
        let newer = external("w-2", "wolt", "W-2", 5);
        let older = external("e-1", "efood", "E-1", 1);
        let kiosk = external("k-1", "kiosk", "K-1", 0);
        let unknown = external("x-1", "mystery", "X-1", 0);
        let mut accepted = external("w-3", "wolt", "W-3", 0);
        accepted.status = OrderStatus::Confirmed;
        let plain = order("p-1", 2);

        let view =
            DedupAndQueueSplitter::new().split(vec![newer, older, kiosk, unknown, accepted, plain]);
        let queue: Vec<&str> = view.pending_external.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(queue, vec!["e-1", "w-2"]);
        assert_eq!(view.orders.len(), 6);
        assert_eq!(view.visible().len(), 4);
    }

    #[test]
    fn custom_platform_list_is_honored() {
        let o = external("m-1", "Mystery", "M-1", 0);
        let splitter = DedupAndQueueSplitter::new().with_external_platforms(["mystery"]);
        assert!(splitter.is_pending_external(&o));
        assert!(!DedupAndQueueSplitter::new().is_pending_external(&o));
    }
}
