//! Per-user visibility over (device, port) pairs.
//!
//! A non-admin user sees an SMS row when its port is in the union of the
//! user's allocated ports, and a hangup row when both its device and its
//! port are allocated. Empty allocation sets short-circuit to an empty
//! result, never an error.

use std::collections::BTreeSet;

use anyhow::Result;

use crate::store::{allocations, normalize, Db};

/// The normalized allow-sets computed from a user's allocations.
#[derive(Debug, Clone, Default)]
pub struct AllowedSets {
    /// Distinct normalized device ids.
    pub device_ids: Vec<String>,
    /// Union of normalized ports across all allocations.
    pub com_ports: Vec<String>,
}

impl AllowedSets {
    /// Whether the user can see anything at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.device_ids.is_empty() || self.com_ports.is_empty()
    }
}

/// Build the allow-sets for `user_id` from their non-deleted allocations.
pub async fn allowed_sets(db: &Db, user_id: i64) -> Result<AllowedSets> {
    let allocations = allocations::for_user(db, user_id).await?;

    let mut device_ids = BTreeSet::new();
    let mut com_ports = BTreeSet::new();
    for allocation in &allocations {
        let device = normalize(&allocation.device_id);
        if !device.is_empty() {
            device_ids.insert(device);
        }
        for port in &allocation.com_ports {
            let port = normalize(port);
            if !port.is_empty() {
                com_ports.insert(port);
            }
        }
    }

    Ok(AllowedSets {
        device_ids: device_ids.into_iter().collect(),
        com_ports: com_ports.into_iter().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::users::{self, ROLE_USER};

    #[tokio::test]
    async fn test_allowed_sets_normalize_and_union() {
        let db = Db::connect_in_memory().await.unwrap();
        let alice = users::insert(&db, "alice", ROLE_USER).await.unwrap();
        allocations::insert(&db, alice, " d1 ", &["com3", " COM5"]).await.unwrap();
        allocations::insert(&db, alice, "D2", &["COM7", "COM3"]).await.unwrap();

        let sets = allowed_sets(&db, alice).await.unwrap();
        assert_eq!(sets.device_ids, vec!["D1", "D2"]);
        assert_eq!(sets.com_ports, vec!["COM3", "COM5", "COM7"]);
        assert!(!sets.is_empty());
    }

    #[tokio::test]
    async fn test_no_allocations_is_empty() {
        let db = Db::connect_in_memory().await.unwrap();
        let sets = allowed_sets(&db, 42).await.unwrap();
        assert!(sets.is_empty());
    }
}
