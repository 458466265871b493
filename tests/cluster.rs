//! Integration tests spanning several instances: cross-instance emission,
//! eviction through the bus, consistency reporting and lock exclusivity.

mod common;

use common::{TestCluster, drain, eventually, expect_closed, expect_event, test_config};
use serde_json::json;
use slchatd::config::ServiceConfig;
use slchatd::network::Transport;
use slchatd::{ChatError, CommandOptions, ServerEvent};
use slchatd::session::OpType;
use slchatd::state::Store;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn room_messages_cross_instances() {
    let cluster = TestCluster::new(2, test_config());
    let (a, b) = (cluster.instance(0), cluster.instance(1));
    let _alice = a.connect("alice", "a1").await;
    let mut bob = b.connect("bob", "b1").await;

    a.cmd("a1", "roomCreate", vec![json!("lobby"), json!(false)])
        .await
        .unwrap();
    a.cmd("a1", "roomJoin", vec![json!("lobby")]).await.unwrap();
    assert_eq!(b.cmd("b1", "roomJoin", vec![json!("lobby")]).await, Ok(vec![json!(1)]));

    a.cmd("a1", "roomMessage", vec![json!("lobby"), json!({ "textMessage": "hello" })])
        .await
        .unwrap();
    let event = expect_event(&mut bob, "roomMessage").await;
    assert_eq!(event.args[1]["textMessage"], json!("hello"));
    assert_eq!(event.args[1]["author"], json!("alice"));
}

#[tokio::test]
async fn echoes_reach_sockets_on_other_instances() {
    let cluster = TestCluster::new(2, test_config());
    let (a, b) = (cluster.instance(0), cluster.instance(1));
    let mut on_a = a.connect("alice", "a1").await;
    let _on_b = b.connect("alice", "b1").await;

    let event = expect_event(&mut on_a, "socketConnectEcho").await;
    assert_eq!(event.args, vec![json!("b1"), json!(2)]);
}

#[tokio::test]
async fn room_delete_removes_members_on_every_instance() {
    let cluster = TestCluster::new(2, test_config());
    let (a, b) = (cluster.instance(0), cluster.instance(1));
    let _alice = a.connect("alice", "a1").await;
    let mut bob = b.connect("bob", "b1").await;
    let mut carol = a.connect("carol", "c1").await;

    a.cmd("a1", "roomCreate", vec![json!("lobby"), json!(false)])
        .await
        .unwrap();
    b.cmd("b1", "roomJoin", vec![json!("lobby")]).await.unwrap();
    a.cmd("c1", "roomJoin", vec![json!("lobby")]).await.unwrap();
    drain(&mut carol);

    a.cmd("a1", "roomDelete", vec![json!("lobby")]).await.unwrap();

    assert_eq!(cluster.store.room_meta("lobby").await.unwrap(), None);
    for user in ["bob", "carol"] {
        let rooms = cluster.store.user_sockets_to_rooms(user).await.unwrap();
        assert!(rooms.values().all(|joined| joined.is_empty()), "{user} still joined");
    }
    assert!(!b.transport.is_joined("b1", "lobby"));
    assert!(!a.transport.is_joined("c1", "lobby"));

    expect_event(&mut carol, "roomAccessRemoved").await;
    let removed = expect_event(&mut bob, "roomAccessRemoved").await;
    assert_eq!(removed.args, vec![json!("lobby")]);
}

#[tokio::test]
async fn silent_instance_is_reported() {
    let cluster = TestCluster::new(1, test_config());
    let a = cluster.instance(0);
    let mut events = a.server.subscribe();
    let _alice = a.connect("alice", "a1").await;

    // An attached instance that never acknowledges.
    let (_silent_bus, _silent_inbox) = cluster.hub.attach("silent", 64);
    let store = &cluster.store;
    store.add_socket("z1", "bob", "silent").await.unwrap();
    store.user_add_socket("bob", "z1", "silent").await.unwrap();

    a.cmd("a1", "roomCreate", vec![json!("lobby"), json!(false)])
        .await
        .unwrap();
    store.socket_join_room("bob", "z1", "lobby").await.unwrap();
    store.room_add_user("lobby", "bob", 1).await.unwrap();

    a.cmd("a1", "roomAddToList", vec![json!("lobby"), json!("blacklist"), json!(["bob"])])
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("consistency event")
        .unwrap();
    assert!(matches!(event, ServerEvent::TransportConsistencyFailure { .. }));
    assert_eq!(event.info().user_name, "bob");
    assert_eq!(event.info().op_type, OpType::TransportChannel);
    assert_eq!(event.info().room_name.as_deref(), Some("lobby"));
    // Store side of the eviction still completed.
    assert!(cluster.store.room_users("lobby").await.unwrap().is_empty());
}

#[tokio::test]
async fn failing_transport_on_leave_is_reported() {
    let cluster = TestCluster::single();
    let node = cluster.instance(0);
    let mut events = node.server.subscribe();
    let _rx = node.connect("alice", "s1").await;
    node.cmd("s1", "roomCreate", vec![json!("lobby"), json!(false)])
        .await
        .unwrap();
    node.cmd("s1", "roomJoin", vec![json!("lobby")]).await.unwrap();

    node.transport.set_failing(true);
    assert_eq!(node.cmd("s1", "roomLeave", vec![json!("lobby")]).await, Ok(vec![json!(0)]));

    let event = events.try_recv().expect("consistency event");
    assert_eq!(event.name(), "transportConsistencyFailure");
    assert_eq!(event.info().op, "roomLeave");
    assert_eq!(event.info().socket_id.as_deref(), Some("s1"));
    assert!(cluster.store.room_users("lobby").await.unwrap().is_empty());
}

#[tokio::test]
async fn lock_expiry_mid_command_is_reported() {
    let config = ServiceConfig {
        lock_ttl_ms: 25,
        ..test_config()
    };
    let cluster = TestCluster::new(1, config);
    let node = cluster.instance(0);
    let _rx = node.connect("alice", "s1").await;
    node.cmd("s1", "roomCreate", vec![json!("lobby"), json!(false)])
        .await
        .unwrap();
    let mut events = node.server.subscribe();

    // The join outlives the lock TTL while holding it.
    cluster.store.delay_room_joins(Duration::from_millis(80));
    assert_eq!(node.cmd("s1", "roomJoin", vec![json!("lobby")]).await, Ok(vec![json!(1)]));

    let event = events.try_recv().expect("consistency event");
    assert!(matches!(event, ServerEvent::StoreConsistencyFailure { .. }));
    assert_eq!(event.error(), &ChatError::LockLost("alice".into()));
    assert_eq!(event.info().op, "userLock");
    assert_eq!(event.info().user_name, "alice");
    assert!(node.transport.is_joined("s1", "lobby"));
    assert_eq!(cluster.store.room_users("lobby").await.unwrap(), vec!["alice".to_string()]);
}

#[tokio::test]
async fn contended_socket_removal_is_reported_and_retried() {
    let config = ServiceConfig {
        lock_acquire_timeout_ms: 50,
        ..test_config()
    };
    let cluster = TestCluster::new(1, config);
    let node = cluster.instance(0);
    let mut events = node.server.subscribe();
    let _rx = node.connect("alice", "s1").await;

    let store = &cluster.store;
    assert!(store.lock_acquire("alice", "foreign", Duration::from_secs(5)).await.unwrap());
    assert_eq!(
        node.server.socket_closed("s1").await,
        Err(ChatError::LockTimeout("alice".into()))
    );

    let event = events.try_recv().expect("consistency event");
    assert_eq!(event.name(), "storeConsistencyFailure");
    assert_eq!(event.info().op, "removeSocket");
    assert_eq!(event.info().socket_id.as_deref(), Some("s1"));
    assert_eq!(event.error(), &ChatError::LockTimeout("alice".into()));
    // Still bound and recorded, so the next close can finish the job.
    assert_eq!(node.server.bindings().user_of("s1").as_deref(), Some("alice"));
    assert_eq!(store.user_sockets("alice").await.unwrap().len(), 1);

    assert!(store.lock_release("alice", "foreign").await.unwrap());
    node.server.socket_closed("s1").await.unwrap();
    assert!(node.server.bindings().user_of("s1").is_none());
    assert!(store.is_quiescent());
}

#[tokio::test]
async fn user_lock_is_exclusive() {
    let cluster = Arc::new(TestCluster::new(2, test_config()));
    cluster
        .instance(0)
        .server
        .exec_user_command(
            "alice",
            "roomCreate",
            &CommandOptions::bypass(),
            vec![json!("lobby"), json!(false)],
        )
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..4 {
        let cluster = cluster.clone();
        tasks.push(tokio::spawn(async move {
            let node = cluster.instance(i % 2);
            let socket = format!("s{i}");
            // Registrations race each other and the other sockets' joins.
            let rx = node.connect("alice", &socket).await;
            for _ in 0..5 {
                node.cmd(&socket, "roomJoin", vec![json!("lobby")]).await.unwrap();
                node.cmd(&socket, "roomLeave", vec![json!("lobby")]).await.unwrap();
            }
            rx
        }));
    }
    let mut receivers = Vec::new();
    for task in tasks {
        receivers.push(task.await.unwrap());
    }

    assert_eq!(cluster.store.lock_overlaps(), 0);
    assert!(cluster.store.lock_acquisitions() >= 4 * 11);
    assert_eq!(cluster.store.user_sockets("alice").await.unwrap().len(), 4);
    assert!(cluster.store.room_users("lobby").await.unwrap().is_empty());
    for i in 0..4 {
        let node = cluster.instance(i % 2);
        assert!(!node.transport.is_joined(&format!("s{i}"), "lobby"));
    }
}

#[tokio::test]
async fn disconnect_user_sockets_everywhere() {
    let cluster = TestCluster::new(2, test_config());
    let (a, b) = (cluster.instance(0), cluster.instance(1));
    let mut on_a = a.connect("alice", "a1").await;
    let mut on_b = b.connect("alice", "b1").await;

    a.server.disconnect_user_sockets("alice").await.unwrap();

    expect_closed(&mut on_a).await;
    expect_closed(&mut on_b).await;
    let store = cluster.store.clone();
    assert!(
        eventually(|| {
            let store = store.clone();
            async move { store.user_sockets("alice").await.unwrap().is_empty() }
        })
        .await
    );
    assert!(
        eventually(|| {
            let store = store.clone();
            async move { store.is_quiescent() }
        })
        .await
    );
}

#[tokio::test]
async fn disconnect_socket_on_another_instance() {
    let cluster = TestCluster::new(2, test_config());
    let (a, b) = (cluster.instance(0), cluster.instance(1));
    let _keep = a.connect("alice", "a1").await;
    let mut remote = b.connect("alice", "b1").await;

    a.server.disconnect_socket("b1").await.unwrap();

    expect_closed(&mut remote).await;
    let store = cluster.store.clone();
    assert!(
        eventually(|| {
            let store = store.clone();
            async move { store.socket_owner("b1").await.unwrap().is_none() }
        })
        .await
    );
    assert_eq!(cluster.store.user_sockets("alice").await.unwrap().len(), 1);
}

#[tokio::test]
async fn close_disconnects_local_sockets() {
    let cluster = TestCluster::new(2, test_config());
    let (a, b) = (cluster.instance(0), cluster.instance(1));
    let mut on_a = a.connect("alice", "a1").await;
    let _on_b = b.connect("alice", "b1").await;

    a.server.close().await;

    expect_closed(&mut on_a).await;
    let sockets = cluster.store.user_sockets("alice").await.unwrap();
    assert_eq!(sockets.len(), 1);
    assert_eq!(sockets[0].socket_id, "b1");
    assert!(b.transport.connection_exists("b1"));
}
