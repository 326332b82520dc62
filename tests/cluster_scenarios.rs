//! Cluster integration tests over the in-memory network
//!
//! Each test runs a full cluster in-process on a paused clock: consensus,
//! the apply loop, and clients retrying through `Clerk`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use raftkv::core::config::{ClientConfig, KvConfig};
use raftkv::kv::server::KvError;
use raftkv::state_machine::StudentRecord;
use raftkv::testing::{fast_raft_config, Cluster};
use raftkv::transport::inmemory::NetworkConditions;

fn student(name: &str, grand: i64) -> StudentRecord {
    StudentRecord {
        grand,
        class: "CS-2".to_string(),
        major: "Computer Science".to_string(),
        name: name.to_string(),
        course_count: 6,
        total_credits: 22.5,
    }
}

const ELECTION_WAIT: Duration = Duration::from_secs(5);

#[tokio::test(start_paused = true)]
async fn test_exactly_one_leader_elected() {
    let cluster = Cluster::new(3);

    let leader = cluster.wait_for_leader(ELECTION_WAIT).await;
    assert!(leader.is_some(), "cluster should elect a leader");

    // Let the election settle, then check the claim is unique
    tokio::time::sleep(Duration::from_secs(1)).await;
    let leaders = cluster.leaders().await;
    assert_eq!(leaders.len(), 1, "expected one leader, got {:?}", leaders);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_put_then_get_on_leader() {
    let cluster = Cluster::new(3);
    let leader = cluster.wait_for_leader(ELECTION_WAIT).await.unwrap();
    let clerk = cluster.clerk();

    clerk.put("alice", student("Alice", 2)).await.unwrap();

    let record = cluster.kv(leader).unwrap().get("alice", 1, 1).await.unwrap();
    assert_eq!(record, student("Alice", 2));
    assert_eq!(clerk.get("alice").await.unwrap().grand, 2);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_committed_record_survives_leader_crash() {
    let mut cluster = Cluster::new(3);
    let old_leader = cluster.wait_for_leader(ELECTION_WAIT).await.unwrap();
    let clerk = cluster.clerk();
    clerk.put("alice", student("Alice", 2)).await.unwrap();
    // Followers learn the commit index on the next heartbeat
    tokio::time::sleep(Duration::from_millis(300)).await;

    cluster.crash(old_leader).await;

    let new_leader = cluster.wait_for_leader(ELECTION_WAIT).await.unwrap();
    assert_ne!(new_leader, old_leader);
    let record = cluster.kv(new_leader).unwrap().get("alice", 1, 1).await.unwrap();
    assert_eq!(record.name, "Alice");

    // The survivors still accept writes
    clerk.put("bob", student("Bob", 3)).await.unwrap();
    assert_eq!(clerk.get("bob").await.unwrap().name, "Bob");

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_retransmitted_put_applies_once() {
    let cluster = Cluster::new(3);
    let leader = cluster.wait_for_leader(ELECTION_WAIT).await.unwrap();
    let kv = cluster.kv(leader).unwrap();

    kv.put("bob", student("Bob v1", 1), 7, 1).await.unwrap();
    // Someone else updates the record before client 7's retry arrives
    kv.put("bob", student("Bob v2", 1), 8, 1).await.unwrap();
    // Client 7 never saw its reply and resends the identical request
    kv.put("bob", student("Bob v1", 1), 7, 1).await.unwrap();

    assert_eq!(kv.get("bob", 9, 1).await.unwrap().name, "Bob v2");

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_puts_through_shared_clerk_all_land() {
    let cluster = Cluster::new(3);
    let leader = cluster.wait_for_leader(ELECTION_WAIT).await.unwrap();
    let clerk = Arc::new(cluster.clerk());

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let clerk = clerk.clone();
            tokio::spawn(async move {
                let key = format!("s{}", i);
                clerk.put(&key, student(&key, i)).await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let keys = cluster.kv(leader).unwrap().list_keys().await.unwrap();
    assert_eq!(keys.len(), 8, "acknowledged puts missing: {:?}", keys);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_lost_replies_do_not_duplicate_writes() {
    let conditions = NetworkConditions {
        request_loss: 0.0,
        reply_loss: 0.3,
        max_delay: Duration::from_millis(5),
    };
    let cluster = Cluster::with_config(3, fast_raft_config(), KvConfig::default(), conditions);
    cluster.wait_for_leader(ELECTION_WAIT).await.unwrap();
    let clerk = cluster.clerk_with(ClientConfig::default().with_max_attempts(50));

    for version in 1..=15 {
        clerk
            .put("counter", student(&format!("v{}", version), version))
            .await
            .unwrap();
    }

    // A late retransmission of an earlier version must not have won
    cluster.network().set_conditions(NetworkConditions::reliable());
    // Reads are local; give followers a heartbeat to learn the last commit
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(clerk.get("counter").await.unwrap().grand, 15);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_partitioned_node_catches_up_after_heal() {
    let cluster = Cluster::new(3);
    let old_leader = cluster.wait_for_leader(ELECTION_WAIT).await.unwrap();
    let majority: Vec<u64> = cluster.ids().iter().copied().filter(|&id| id != old_leader).collect();

    cluster.partition(&majority, &[old_leader]);

    // The isolated leader can still append but never commit
    let isolated = cluster.kv(old_leader).unwrap();
    let stranded = isolated.put("ghost", student("Ghost", 9), 99, 1).await;
    assert_eq!(stranded, Err(KvError::Timeout));

    // The majority elects a new leader and commits
    let clerk = cluster.clerk();
    clerk.put("carol", student("Carol", 4)).await.unwrap();
    let status = isolated.status().await;
    assert!(
        isolated.list_keys().await.unwrap().is_empty(),
        "isolated node applied entries while cut off: {:?}",
        status
    );

    cluster.heal();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(isolated.get("carol", 1, 1).await.unwrap().name, "Carol");
    assert_eq!(isolated.get("ghost", 1, 2).await, Err(KvError::NoKey));
    cluster.check_applied_agreement().unwrap();

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_minority_cannot_elect_itself() {
    let cluster = Cluster::new(3);
    let leader = cluster.wait_for_leader(ELECTION_WAIT).await.unwrap();
    let follower = cluster.ids().iter().copied().find(|&id| id != leader).unwrap();
    let rest: Vec<u64> = cluster.ids().iter().copied().filter(|&id| id != follower).collect();

    cluster.partition(&rest, &[follower]);

    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let leaders = cluster.leaders().await;
        assert!(
            leaders.iter().all(|&(id, _)| id != follower),
            "isolated node {} became leader",
            follower
        );
    }
    let status = cluster.kv(follower).unwrap().status().await;
    assert!(status.raft.term > 1, "isolated node should keep campaigning");

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_election_safety_under_message_loss() {
    let cluster = Cluster::with_config(
        5,
        fast_raft_config(),
        KvConfig::default(),
        NetworkConditions::unreliable(),
    );
    let mut leader_of_term: HashMap<u64, u64> = HashMap::new();

    for round in 0..100 {
        // Periodically cut a node off to force new elections
        if round % 20 == 10 {
            let victim = 1 + (round as u64 / 20) % 5;
            cluster.disconnect(victim);
        }
        if round % 20 == 19 {
            cluster.network().heal();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        for (id, term) in cluster.leaders().await {
            let previous = *leader_of_term.entry(term).or_insert(id);
            assert_eq!(previous, id, "two leaders in term {}", term);
        }
    }

    assert!(!leader_of_term.is_empty(), "no leader was ever elected");
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_applied_entries_agree_under_churn() {
    let mut cluster = Cluster::with_config(
        3,
        fast_raft_config(),
        KvConfig::default().with_snapshot_threshold(20),
        NetworkConditions::unreliable(),
    );
    cluster.wait_for_leader(ELECTION_WAIT).await.unwrap();
    let clerk = cluster.clerk_with(ClientConfig::default().with_max_attempts(50));

    let mut written = 0;
    for round in 0..6u64 {
        for i in 0..10 {
            let key = format!("s{}", i);
            if clerk.put(&key, student(&key, (round * 10 + i) as i64)).await.is_ok() {
                written += 1;
            }
        }
        let victim = 1 + round % 3;
        cluster.crash(victim).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        cluster.restart(victim).await;
    }
    assert!(written > 0, "no write ever succeeded");

    cluster.network().set_conditions(NetworkConditions::reliable());
    tokio::time::sleep(Duration::from_secs(3)).await;
    cluster.check_applied_agreement().unwrap();

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_full_restart_recovers_from_durable_state() {
    let mut cluster = Cluster::new(3);
    cluster.wait_for_leader(ELECTION_WAIT).await.unwrap();
    let clerk = cluster.clerk();
    for i in 0..5 {
        clerk.put(&format!("s{}", i), student("Before", i)).await.unwrap();
    }

    for id in cluster.ids().to_vec() {
        cluster.crash(id).await;
    }
    for id in cluster.ids().to_vec() {
        cluster.restart(id).await;
    }

    let leader = cluster.wait_for_leader(ELECTION_WAIT).await.unwrap();
    let last_index = cluster.kv(leader).unwrap().status().await.raft.last_log_index;
    assert!(cluster.wait_for_applied(leader, last_index, ELECTION_WAIT).await);

    let kv = cluster.kv(leader).unwrap();
    assert_eq!(kv.list_keys().await.unwrap().len(), 5);
    assert_eq!(kv.get("s3", 1, 1).await.unwrap().grand, 3);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_lagging_follower_receives_snapshot() {
    let cluster = Cluster::with_config(
        3,
        fast_raft_config(),
        KvConfig::default().with_snapshot_threshold(10),
        NetworkConditions::reliable(),
    );
    let leader = cluster.wait_for_leader(ELECTION_WAIT).await.unwrap();
    let laggard = cluster.ids().iter().copied().find(|&id| id != leader).unwrap();
    cluster.disconnect(laggard);

    let clerk = cluster.clerk();
    for i in 0..40 {
        clerk.put(&format!("s{}", i), student("Bulk", i)).await.unwrap();
    }
    let leader_status = cluster.kv(leader).unwrap().status().await;
    assert!(leader_status.raft.snapshot_last_index > 0, "leader never compacted");

    cluster.reconnect(laggard);
    tokio::time::sleep(Duration::from_secs(2)).await;

    let kv = cluster.kv(laggard).unwrap();
    let status = kv.status().await;
    assert!(status.raft.snapshot_last_index > 0, "laggard never installed a snapshot");
    assert_eq!(kv.list_keys().await.unwrap().len(), 40);
    assert_eq!(kv.get("s39", 1, 1).await.unwrap().grand, 39);

    cluster.shutdown().await;
}
