//! 集成测试：两台设备通过模拟网格聊天
//!
//! 主机发布 room1，客户端发现后发送 CONNECT_REQUEST，双方建立承载网络后互发消息。
//! 另外覆盖一个主机多个客户端、承载网络失败、静默断线和停止后重启。

use std::sync::Arc;
use std::time::Duration;

use aware::{
    BearerPolicy, ChatSession, ConnectionState, KeepAliveConfig, MemoryMesh, MemoryMessageStore,
    MemoryTransport, SessionConfig,
};

fn session(device: &MemoryTransport, config: SessionConfig) -> ChatSession {
    ChatSession::new(
        Arc::new(device.clone()),
        config,
        Arc::new(MemoryMessageStore::new()),
    )
}

async fn wait_for(session: &ChatSession, expected: ConnectionState) {
    let mut rx = session.connection_state();
    tokio::time::timeout(Duration::from_secs(120), rx.wait_for(|s| *s == expected))
        .await
        .unwrap()
        .unwrap();
}

fn room1() -> ConnectionState {
    ConnectionState::Connected("room1".to_string())
}

#[tokio::test(start_paused = true)]
async fn host_and_client_exchange_messages() {
    let mesh = MemoryMesh::new();
    let host_device = mesh.device("host");
    let client_device = mesh.device("client");
    let host = session(&host_device, SessionConfig::default());
    let client = session(&client_device, SessionConfig::default());

    host.start_hosting("room1").await.unwrap();
    client.start_discovering().await.unwrap();
    wait_for(&host, room1()).await;
    wait_for(&client, room1()).await;

    assert_eq!(host.coordinator().peer_count().await, 1);
    assert_eq!(client.coordinator().peer_count().await, 1);
    assert_eq!(client.current_room(), Some("room1".to_string()));

    let host_key = host_device.session_handles()[0].key().to_string();
    assert_eq!(client_device.bearer_request_count(&host_key), 1);

    let mut host_messages = host.subscribe_messages();
    let sent = client.send_message("alice", "Alice", "hi").await.unwrap();
    assert!(sent.is_local);

    let payloads = client_device.sent_payloads_to(&host_key);
    assert!(payloads.iter().any(|p| p.as_slice() == b"alice|Alice|hi"));

    let received = tokio::time::timeout(Duration::from_secs(5), host_messages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.sender_id, "alice");
    assert_eq!(received.sender_name, "Alice");
    assert_eq!(received.content, "hi");
    assert!(!received.is_local);

    let mut client_messages = client.subscribe_messages();
    host.send_message("bob", "Bob", "a|b|c").await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), client_messages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.sender_id, "bob");
    assert_eq!(reply.content, "a|b|c");

    let host_history = host.history().await.unwrap();
    assert_eq!(host_history.len(), 2);
    assert_eq!(client.history().await.unwrap().len(), 2);

    host.stop().await;
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn host_fans_out_to_two_clients() {
    let mesh = MemoryMesh::new();
    let host = session(&mesh.device("host"), SessionConfig::default());
    let first_device = mesh.device("first");
    let first = session(&first_device, SessionConfig::default());
    let second = session(&mesh.device("second"), SessionConfig::default());

    host.start_hosting("room1").await.unwrap();
    first.start_discovering().await.unwrap();
    second.start_discovering().await.unwrap();
    wait_for(&first, room1()).await;
    wait_for(&second, room1()).await;
    wait_for(&host, room1()).await;

    // 两个承载网络都建立后才广播
    for _ in 0..100 {
        if host.coordinator().peer_count().await == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(host.coordinator().peer_count().await, 2);

    let mut first_messages = first.subscribe_messages();
    let mut second_messages = second.subscribe_messages();
    host.send_message("bob", "Bob", "hello all").await.unwrap();

    for messages in [&mut first_messages, &mut second_messages] {
        let received = tokio::time::timeout(Duration::from_secs(5), messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.content, "hello all");
        assert!(!received.is_local);
    }

    // 丢失一个客户端，主机还有对端，保持 Connected
    first_device.drop_bearers();
    wait_for(&first, ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(host.coordinator().peer_count().await, 1);
    assert_eq!(host.current_state(), room1());

    host.send_message("bob", "Bob", "still here").await.unwrap();
    let received = tokio::time::timeout(Duration::from_secs(5), second_messages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.content, "still here");

    host.stop().await;
    first.stop().await;
    second.stop().await;
}

#[tokio::test(start_paused = true)]
async fn bearer_timeout_reports_error_and_registers_nobody() {
    let mesh = MemoryMesh::new();
    let client_device = mesh.device("client");
    client_device.set_bearer_policy(BearerPolicy::Hang);

    let host = session(&mesh.device("host"), SessionConfig::default());
    let client = session(&client_device, SessionConfig::default());

    host.start_hosting("room1").await.unwrap();
    client.start_discovering().await.unwrap();

    let mut rx = client.connection_state();
    let state = tokio::time::timeout(
        Duration::from_secs(120),
        rx.wait_for(|s| matches!(s, ConnectionState::Error(_))),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();

    assert!(matches!(state, ConnectionState::Error(_)));
    assert_eq!(client.coordinator().peer_count().await, 0);
    assert!(client.send_message("alice", "Alice", "hi").await.is_err());
}

#[tokio::test(start_paused = true)]
async fn silent_link_is_evicted_and_degrades() {
    let mesh = MemoryMesh::new();
    let host_device = mesh.device("host");
    let client_device = mesh.device("client");
    let config = SessionConfig::default().with_keep_alive(KeepAliveConfig::new(
        Duration::from_secs(15),
        Duration::from_secs(30),
    ));
    let host = session(&host_device, config.clone());
    let client = session(&client_device, config);

    host.start_hosting("room1").await.unwrap();
    client.start_discovering().await.unwrap();
    wait_for(&client, room1()).await;

    // 心跳维持链路
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(client.coordinator().peer_count().await, 1);
    assert_eq!(client.current_state(), room1());

    host_device.set_partitioned(true);
    client_device.set_partitioned(true);

    wait_for(&client, ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(client.coordinator().peer_count().await, 0);
    assert_eq!(host.coordinator().peer_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn stop_then_host_again() {
    let mesh = MemoryMesh::new();
    let host_device = mesh.device("host");
    let host = session(&host_device, SessionConfig::default());
    let client = session(&mesh.device("client"), SessionConfig::default());

    host.start_hosting("room1").await.unwrap();
    client.start_discovering().await.unwrap();
    wait_for(&host, room1()).await;
    client.stop().await;

    host.stop().await;
    host.stop().await;
    assert_eq!(host.current_state(), ConnectionState::Disconnected);
    assert_eq!(host.coordinator().peer_count().await, 0);
    assert!(host_device.session_ids().is_empty());

    host.start_hosting("room2").await.unwrap();
    assert_eq!(host.current_state(), ConnectionState::Hosting("room2".to_string()));
    assert_eq!(host_device.session_ids().len(), 1);

    host.stop().await;
}
