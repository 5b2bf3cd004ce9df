mod common;

use std::time::Duration;

use common::{grind, mine_blocks, mine_branch, open_chain, regtest, Behavior, FakeNode};
use schilling_chainstate::BlockSource;
use schilling_net::{PeerGroup, PeerGroupConfig, PeerGroupError};
use schilling_primitives::Block;
use tokio::time::timeout;

fn test_config() -> PeerGroupConfig {
    PeerGroupConfig {
        max_connections: 1,
        handshake_timeout_secs: 2,
        block_timeout_secs: 5,
        headers_timeout_secs: 5,
        job_size: 8,
        maintenance_interval_secs: 1,
        use_dns_seeds: false,
        ..PeerGroupConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn downloads_the_chain_from_a_peer() {
    let params = regtest();
    let blocks = mine_blocks(&params, 30);
    let node = FakeNode::spawn(&params, Behavior::serving(blocks.clone())).await;
    let chain = open_chain(&params);
    let group = PeerGroup::new(params.clone(), chain.clone(), test_config());
    group.add_address(node.addr);
    group.start().expect("start");

    let state = timeout(Duration::from_secs(20), group.download_block_chain())
        .await
        .expect("sync in time")
        .expect("synced");
    assert_eq!(state.chain_height, 30);
    assert_eq!(state.peers, 1);
    assert_eq!(chain.best_height(), 30);
    assert_eq!(chain.chain_head().hash, blocks[29].hash());
    assert!(node.commands().iter().any(|command| command == "getdata"));
    assert!(group.net_totals().bytes_recv > 0);

    group.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn old_blocks_are_taken_as_headers_only() {
    let params = regtest();
    let blocks = mine_blocks(&params, 12);
    let node = FakeNode::spawn(&params, Behavior::serving(blocks.clone())).await;
    let chain = open_chain(&params);
    let config = PeerGroupConfig {
        fast_catchup_time: u64::MAX,
        ..test_config()
    };
    let group = PeerGroup::new(params.clone(), chain.clone(), config);
    group.add_address(node.addr);
    group.start().expect("start");

    timeout(Duration::from_secs(20), group.wait_for_sync())
        .await
        .expect("sync in time")
        .expect("synced");
    assert_eq!(chain.best_height(), 12);
    assert!(!node.commands().iter().any(|command| command == "getdata"));

    group.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn heavier_fork_below_a_full_header_batch_is_adopted() {
    let params = regtest();
    let chain = open_chain(&params);
    for block in mine_branch(&params, 1, 2001) {
        chain
            .add(Block::header_only(block.header), BlockSource::Local)
            .expect("local branch");
    }
    assert_eq!(chain.best_height(), 2001);

    let remote = mine_branch(&params, 2, 2005);
    let node = FakeNode::spawn(&params, Behavior::serving(remote.clone())).await;
    let config = PeerGroupConfig {
        fast_catchup_time: u64::MAX,
        ..test_config()
    };
    let group = PeerGroup::new(params.clone(), chain.clone(), config);
    group.add_address(node.addr);
    group.start().expect("start");

    let state = timeout(Duration::from_secs(60), group.wait_for_sync())
        .await
        .expect("sync in time")
        .expect("synced");
    assert_eq!(state.chain_height, 2005);
    assert_eq!(chain.chain_head().hash, remote[2004].hash());
    let header_requests = node
        .commands()
        .iter()
        .filter(|command| *command == "getheaders")
        .count();
    assert!(header_requests >= 2);

    group.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_jobs_move_to_another_peer() {
    let params = regtest();
    let blocks = mine_blocks(&params, 30);
    let stalling = FakeNode::spawn(
        &params,
        Behavior {
            serve_blocks: false,
            ..Behavior::serving(blocks.clone())
        },
    )
    .await;
    let serving = FakeNode::spawn(&params, Behavior::serving(blocks.clone())).await;
    let chain = open_chain(&params);
    let config = PeerGroupConfig {
        max_connections: 2,
        block_timeout_secs: 1,
        ..test_config()
    };
    let group = PeerGroup::new(params.clone(), chain.clone(), config);
    group.add_address(stalling.addr);
    group.start().expect("start");

    // Only the stalling node is known until it has been handed blocks to fetch.
    timeout(Duration::from_secs(10), async {
        while !stalling.commands().iter().any(|command| command == "getdata") {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("stalling node asked for blocks");
    group.add_address(serving.addr);

    let mut updates = group.subscribe_sync();
    timeout(
        Duration::from_secs(30),
        updates.wait_for(|state| state.chain_height == 30),
    )
    .await
    .expect("sync in time")
    .expect("sync channel open");
    assert_eq!(chain.chain_head().hash, blocks[29].hash());
    assert!(serving.commands().iter().any(|command| command == "getdata"));

    group.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_serving_an_invalid_block_is_banned() {
    let params = regtest();
    let mut blocks = mine_blocks(&params, 10);
    let mut bad = blocks[9].clone();
    grind(&params, &mut bad.header, false);
    blocks[9] = bad;
    let node = FakeNode::spawn(&params, Behavior::serving(blocks.clone())).await;
    let chain = open_chain(&params);
    let group = PeerGroup::new(params.clone(), chain.clone(), test_config());
    group.add_address(node.addr);
    group.start().expect("start");

    timeout(Duration::from_secs(20), async {
        while !group
            .banned_peers()
            .iter()
            .any(|banned| banned.addr == node.addr)
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("peer banned in time");
    assert_eq!(chain.best_height(), 9);
    assert_eq!(chain.chain_head().hash, blocks[8].hash());

    let mut updates = group.subscribe_sync();
    timeout(Duration::from_secs(5), updates.wait_for(|state| state.peers == 0))
        .await
        .expect("banned peer dropped")
        .expect("sync channel open");

    group.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lost_peer_is_dropped_from_the_count() {
    let params = regtest();
    let node = FakeNode::spawn(&params, Behavior::serving(Vec::new())).await;
    let group = PeerGroup::new(params.clone(), open_chain(&params), test_config());
    group.add_address(node.addr);
    group.start().expect("start");

    let connected = timeout(Duration::from_secs(10), group.wait_for_peers(1))
        .await
        .expect("peer in time")
        .expect("peer");
    assert_eq!(connected, 1);
    assert_eq!(group.peer_count(), 1);

    node.shutdown();
    let mut updates = group.subscribe_sync();
    timeout(Duration::from_secs(10), updates.wait_for(|state| state.peers == 0))
        .await
        .expect("drop noticed in time")
        .expect("sync channel open");
    assert_eq!(group.peer_count(), 0);

    group.stop().await;
}

#[tokio::test]
async fn stop_releases_waiters() {
    let params = regtest();
    let group = std::sync::Arc::new(PeerGroup::new(
        params.clone(),
        open_chain(&params),
        test_config(),
    ));
    assert_eq!(
        group.download_block_chain().await.unwrap_err(),
        PeerGroupError::NotStarted
    );
    group.start().expect("start");
    assert_eq!(group.start().unwrap_err(), PeerGroupError::AlreadyStarted);

    let waiter = {
        let group = group.clone();
        tokio::spawn(async move { group.wait_for_sync().await })
    };
    let peers_waiter = {
        let group = group.clone();
        tokio::spawn(async move { group.wait_for_peers(1).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    group.stop().await;

    let result = timeout(Duration::from_secs(5), waiter)
        .await
        .expect("released")
        .expect("join");
    assert_eq!(result.unwrap_err(), PeerGroupError::Stopped);
    let result = timeout(Duration::from_secs(5), peers_waiter)
        .await
        .expect("released")
        .expect("join");
    assert_eq!(result.unwrap_err(), PeerGroupError::Stopped);

    group.stop().await;
    assert!(group.sync_state().stopped);
    assert_eq!(group.start().unwrap_err(), PeerGroupError::Stopped);
}
