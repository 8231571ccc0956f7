//! Property tests for snapshot validation and publication ordering.

use proptest::prelude::*;
use sgw_topology::{
    BucketTopology, DataServer, Server, Topology, TopologyError, TopologyPublisher,
    TopologyVersion, Versioned,
};
use std::sync::Arc;

fn servers(n: usize) -> Vec<Arc<Server>> {
    (0..n)
        .map(|i| Arc::new(Server::new(format!("h{}", i), format!("n{}", i), "g").with_kv()))
        .collect()
}

// Strategy: partition count plus an owner index per partition
fn arb_assignment() -> impl Strategy<Value = (usize, Vec<usize>)> {
    (1usize..5).prop_flat_map(|nodes| {
        (
            Just(nodes),
            prop::collection::vec(0..nodes, 1..64),
        )
    })
}

fn build(nodes: usize, owners: &[usize]) -> Result<BucketTopology, TopologyError> {
    let servers = servers(nodes);
    let data_servers = servers
        .iter()
        .enumerate()
        .map(|(idx, s)| {
            let vbuckets = owners
                .iter()
                .enumerate()
                .filter(|(_, owner)| **owner == idx)
                .map(|(vb, _)| vb as u32)
                .collect();
            DataServer::new(s.clone(), vbuckets, vec![-1; owners.len()])
        })
        .collect();
    BucketTopology::new(0, 0, owners.len() as u32, servers, data_servers)
}

proptest! {
    #[test]
    fn prop_complete_assignment_is_accepted((nodes, owners) in arb_assignment()) {
        let bucket = build(nodes, &owners).unwrap();

        let mut covered: Vec<u32> = bucket
            .data_servers()
            .iter()
            .flat_map(|ds| ds.vbuckets.iter().copied())
            .collect();
        covered.sort_unstable();
        let expected: Vec<u32> = (0..owners.len() as u32).collect();
        prop_assert_eq!(covered, expected);

        for (vb, owner) in owners.iter().enumerate() {
            prop_assert_eq!(
                &bucket.primary_for(vb as u32).unwrap().node_id,
                &format!("n{}", owner)
            );
        }
    }

    #[test]
    fn prop_dropping_a_partition_is_rejected(
        (nodes, owners) in arb_assignment(),
        pick in any::<prop::sample::Index>(),
    ) {
        let servers = servers(nodes);
        let missing = pick.index(owners.len()) as u32;
        let data_servers = servers
            .iter()
            .enumerate()
            .map(|(idx, s)| {
                let vbuckets = owners
                    .iter()
                    .enumerate()
                    .filter(|(vb, owner)| **owner == idx && *vb as u32 != missing)
                    .map(|(vb, _)| vb as u32)
                    .collect();
                DataServer::new(s.clone(), vbuckets, vec![-1; owners.len()])
            })
            .collect();
        let result = BucketTopology::new(0, 0, owners.len() as u32, servers, data_servers);
        prop_assert!(matches!(result, Err(TopologyError::Malformed(_))));
    }

    #[test]
    fn prop_duplicating_a_partition_is_rejected(
        (nodes, owners) in arb_assignment(),
        pick in any::<prop::sample::Index>(),
    ) {
        prop_assume!(nodes > 1);
        let servers = servers(nodes);
        let dup = pick.index(owners.len());
        let second_owner = (owners[dup] + 1) % nodes;
        let data_servers = servers
            .iter()
            .enumerate()
            .map(|(idx, s)| {
                let mut vbuckets: Vec<u32> = owners
                    .iter()
                    .enumerate()
                    .filter(|(_, owner)| **owner == idx)
                    .map(|(vb, _)| vb as u32)
                    .collect();
                if idx == second_owner {
                    vbuckets.push(dup as u32);
                }
                DataServer::new(s.clone(), vbuckets, vec![-1; owners.len()])
            })
            .collect();
        let result = BucketTopology::new(0, 0, owners.len() as u32, servers, data_servers);
        prop_assert!(matches!(result, Err(TopologyError::Malformed(_))));
    }

    #[test]
    fn prop_published_versions_strictly_increase(
        attempts in prop::collection::vec((0u64..4, 0u64..6), 1..40),
    ) {
        let publisher = TopologyPublisher::new(Topology::new(0, 0, servers(1)).unwrap());
        let mut accepted = vec![publisher.current().version()];

        for (epoch, rev) in attempts {
            let before = publisher.current().version();
            let attempted = TopologyVersion::new(epoch, rev);
            match publisher.publish(Topology::new(epoch, rev, servers(1)).unwrap()) {
                Ok(snapshot) => {
                    prop_assert!(attempted > before);
                    accepted.push(snapshot.version());
                }
                Err(TopologyError::OutOfOrder { current, .. }) => {
                    prop_assert!(attempted <= before);
                    prop_assert_eq!(current, before);
                    prop_assert_eq!(publisher.current().version(), before);
                }
                Err(other) => prop_assert!(false, "unexpected error {:?}", other),
            }
        }

        prop_assert!(accepted.windows(2).all(|w| w[0] < w[1]));
    }
}
