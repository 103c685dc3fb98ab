use std::{net::SocketAddr, time::Duration};

use super::*;
use server_api::ApiContext;
use storage::Storage;
use tokio_tungstenite::{tungstenite, MaybeTlsStream, WebSocketStream};

fn typing_event(sender: i64) -> ServerEvent {
    ServerEvent::UserTyping {
        sender_id: UserId(sender),
        is_typing: true,
    }
}

#[tokio::test]
async fn broadcast_reaches_only_room_members() {
    let manager = ChannelManager::new();
    let (a, mut rx_a) = manager.register().await;
    let (b, mut rx_b) = manager.register().await;
    let (c, mut rx_c) = manager.register().await;

    let room_ab = RoomId::for_pair(UserId(1), UserId(2));
    let room_cd = RoomId::for_pair(UserId(3), UserId(4));
    manager.join(a, room_ab.clone()).await;
    manager.join(b, room_ab.clone()).await;
    manager.join(c, room_cd.clone()).await;

    manager.broadcast(&room_ab, &typing_event(1)).await;

    assert!(rx_a.try_recv().is_ok());
    assert!(rx_b.try_recv().is_ok());
    assert!(rx_c.try_recv().is_err());
}

#[tokio::test]
async fn broadcast_except_skips_the_sender() {
    let manager = ChannelManager::new();
    let (a, mut rx_a) = manager.register().await;
    let (b, mut rx_b) = manager.register().await;

    let room = RoomId::for_pair(UserId(1), UserId(2));
    manager.join(a, room.clone()).await;
    manager.join(b, room.clone()).await;

    manager.broadcast_except(&room, a, &typing_event(1)).await;

    assert!(rx_a.try_recv().is_err());
    assert!(rx_b.try_recv().is_ok());
}

#[tokio::test]
async fn joining_a_second_room_leaves_the_first() {
    let manager = ChannelManager::new();
    let (a, mut rx_a) = manager.register().await;

    let first = RoomId::for_pair(UserId(1), UserId(2));
    let second = RoomId::for_pair(UserId(1), UserId(3));
    manager.join(a, first.clone()).await;
    manager.join(a, second.clone()).await;

    assert!(!manager.has_room(&first).await, "empty room must be dropped");

    manager.broadcast(&first, &typing_event(2)).await;
    assert!(rx_a.try_recv().is_err());

    manager.broadcast(&second, &typing_event(3)).await;
    assert!(rx_a.try_recv().is_ok());
}

#[tokio::test]
async fn rejoining_the_same_room_is_not_a_leave() {
    let manager = ChannelManager::new();
    let (a, mut rx_a) = manager.register().await;

    let room = RoomId::for_pair(UserId(1), UserId(2));
    manager.join(a, room.clone()).await;
    manager.join(a, room.clone()).await;

    manager.broadcast(&room, &typing_event(2)).await;
    assert!(rx_a.try_recv().is_ok());
    assert!(rx_a.try_recv().is_err(), "membership must not duplicate");
}

#[tokio::test]
async fn disconnect_cleans_up_membership() {
    let manager = ChannelManager::new();
    let (a, mut rx_a) = manager.register().await;

    let room = RoomId::for_pair(UserId(1), UserId(2));
    manager.join(a, room.clone()).await;
    manager.disconnect(a).await;

    assert!(!manager.has_room(&room).await);

    manager.broadcast(&room, &typing_event(2)).await;
    manager.send_to(a, typing_event(2)).await;
    assert!(rx_a.try_recv().is_err());
}

#[tokio::test]
async fn rooms_are_destroyed_when_the_last_member_leaves() {
    let manager = ChannelManager::new();
    let (a, _rx_a) = manager.register().await;
    let (b, _rx_b) = manager.register().await;

    let room = RoomId::for_pair(UserId(1), UserId(2));
    manager.join(a, room.clone()).await;
    manager.join(b, room.clone()).await;

    manager.leave(a, &room).await;
    assert!(manager.has_room(&room).await);
    manager.leave(b, &room).await;
    assert!(!manager.has_room(&room).await);
}

// Live-channel tests below run the real router on a loopback listener and
// speak the wire protocol through tokio-tungstenite clients.

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn spawn_server() -> (SocketAddr, Arc<AppState>) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let state = Arc::new(AppState {
        api: ApiContext { storage },
        channels: Arc::new(ChannelManager::new()),
    });
    let app = crate::build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, state)
}

async fn connect_client(addr: SocketAddr, user_id: i64) -> WsStream {
    let (stream, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?user_id={user_id}"))
        .await
        .expect("connect");
    stream
}

async fn send_event(ws: &mut WsStream, event: &ClientEvent) {
    let text = serde_json::to_string(event).expect("encode");
    ws.send(tungstenite::Message::Text(text))
        .await
        .expect("send");
}

async fn next_event(ws: &mut WsStream) -> ServerEvent {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("event within deadline")
            .expect("stream open")
            .expect("frame");
        if let tungstenite::Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("decode");
        }
    }
}

async fn expect_silence(ws: &mut WsStream) {
    let outcome = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    assert!(outcome.is_err(), "expected no event, got {outcome:?}");
}

async fn join_room(ws: &mut WsStream, room: &RoomId) {
    send_event(
        ws,
        &ClientEvent::JoinRoom {
            room_id: room.clone(),
        },
    )
    .await;
    match next_event(ws).await {
        ServerEvent::RoomJoined { room_id, .. } => assert_eq!(&room_id, room),
        other => panic!("expected roomJoined, got {other:?}"),
    }
}

fn text_send(sender: i64, receiver: i64, body: &str) -> ClientEvent {
    ClientEvent::SendMessage {
        sender_id: UserId(sender),
        receiver_id: UserId(receiver),
        message: body.to_string(),
        message_type: MessageKind::Text,
        location_data: None,
    }
}

#[tokio::test]
async fn send_is_persisted_broadcast_and_acknowledged() {
    let (addr, state) = spawn_server().await;
    let room = RoomId::for_pair(UserId(10), UserId(20));
    let mut customer = connect_client(addr, 10).await;
    let mut technician = connect_client(addr, 20).await;
    join_room(&mut customer, &room).await;
    join_room(&mut technician, &room).await;

    send_event(&mut customer, &text_send(10, 20, "hi")).await;

    // The sender gets its own broadcast plus the private ack, in either order.
    let mut broadcast_id = None;
    let mut ack_id = None;
    for _ in 0..2 {
        match next_event(&mut customer).await {
            ServerEvent::ReceiveMessage(message) => {
                assert_eq!(message.message, "hi");
                assert_eq!(message.sender_id, UserId(10));
                assert!(!message.is_read);
                broadcast_id = Some(message.id);
            }
            ServerEvent::MessageSent {
                success,
                message_id,
                ..
            } => {
                assert!(success);
                ack_id = Some(message_id);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    let broadcast_id = broadcast_id.expect("sender sees its own broadcast");
    assert_eq!(Some(broadcast_id), ack_id);

    match next_event(&mut technician).await {
        ServerEvent::ReceiveMessage(message) => assert_eq!(message.id, broadcast_id),
        other => panic!("expected receiveMessage, got {other:?}"),
    }

    assert_eq!(
        server_api::unread_count(&state.api, UserId(20))
            .await
            .expect("count"),
        1
    );
    assert_eq!(
        server_api::mark_conversation_read(&state.api, UserId(20), UserId(10))
            .await
            .expect("mark"),
        1
    );
    assert_eq!(
        server_api::unread_count(&state.api, UserId(20))
            .await
            .expect("count"),
        0
    );
}

#[tokio::test]
async fn broadcast_never_crosses_rooms() {
    let (addr, _state) = spawn_server().await;
    let chat_room = RoomId::for_pair(UserId(10), UserId(20));
    let other_room = RoomId::for_pair(UserId(30), UserId(40));

    let mut customer = connect_client(addr, 10).await;
    let mut technician = connect_client(addr, 20).await;
    let mut bystander = connect_client(addr, 30).await;
    join_room(&mut customer, &chat_room).await;
    join_room(&mut technician, &chat_room).await;
    join_room(&mut bystander, &other_room).await;

    send_event(&mut customer, &text_send(10, 20, "private")).await;
    match next_event(&mut technician).await {
        ServerEvent::ReceiveMessage(message) => assert_eq!(message.message, "private"),
        other => panic!("expected receiveMessage, got {other:?}"),
    }
    expect_silence(&mut bystander).await;

    // The bystander's own room still works.
    send_event(&mut bystander, &text_send(30, 40, "elsewhere")).await;
    let mut saw_own_broadcast = false;
    for _ in 0..2 {
        if let ServerEvent::ReceiveMessage(message) = next_event(&mut bystander).await {
            assert_eq!(message.message, "elsewhere");
            saw_own_broadcast = true;
        }
    }
    assert!(saw_own_broadcast);
}

#[tokio::test]
async fn concurrent_sends_persist_with_distinct_increasing_ids() {
    let (addr, _state) = spawn_server().await;
    let room = RoomId::for_pair(UserId(10), UserId(20));
    let mut customer = connect_client(addr, 10).await;
    let mut technician = connect_client(addr, 20).await;
    join_room(&mut customer, &room).await;
    join_room(&mut technician, &room).await;

    let customer_send = text_send(10, 20, "from customer");
    let technician_send = text_send(20, 10, "from technician");
    tokio::join!(
        send_event(&mut customer, &customer_send),
        send_event(&mut technician, &technician_send),
    );

    // Each side sees two broadcasts and one ack; delivery order between the
    // two messages is unspecified.
    let mut customer_ids = Vec::new();
    let mut technician_ids = Vec::new();
    for _ in 0..3 {
        if let ServerEvent::ReceiveMessage(message) = next_event(&mut customer).await {
            customer_ids.push(message.id);
        }
    }
    for _ in 0..3 {
        if let ServerEvent::ReceiveMessage(message) = next_event(&mut technician).await {
            technician_ids.push(message.id);
        }
    }

    assert_eq!(customer_ids.len(), 2);
    assert_eq!(technician_ids.len(), 2);
    assert_ne!(customer_ids[0], customer_ids[1]);
    customer_ids.sort();
    technician_ids.sort();
    assert_eq!(customer_ids, technician_ids);

    // Exactly once: nothing further arrives on either connection.
    expect_silence(&mut customer).await;
    expect_silence(&mut technician).await;
}

#[tokio::test]
async fn typing_reaches_the_room_excluding_the_sender() {
    let (addr, _state) = spawn_server().await;
    let room = RoomId::for_pair(UserId(10), UserId(20));
    let mut customer = connect_client(addr, 10).await;
    let mut technician = connect_client(addr, 20).await;
    join_room(&mut customer, &room).await;
    join_room(&mut technician, &room).await;

    send_event(
        &mut customer,
        &ClientEvent::Typing {
            sender_id: UserId(10),
            receiver_id: UserId(20),
            is_typing: true,
        },
    )
    .await;

    match next_event(&mut technician).await {
        ServerEvent::UserTyping {
            sender_id,
            is_typing,
        } => {
            assert_eq!(sender_id, UserId(10));
            assert!(is_typing);
        }
        other => panic!("expected userTyping, got {other:?}"),
    }
    expect_silence(&mut customer).await;
}

#[tokio::test]
async fn invalid_send_errors_only_to_the_sender() {
    let (addr, state) = spawn_server().await;
    let room = RoomId::for_pair(UserId(10), UserId(20));
    let mut customer = connect_client(addr, 10).await;
    let mut technician = connect_client(addr, 20).await;
    join_room(&mut customer, &room).await;
    join_room(&mut technician, &room).await;

    send_event(
        &mut customer,
        &ClientEvent::SendMessage {
            sender_id: UserId(10),
            receiver_id: UserId(20),
            message: "my location".to_string(),
            message_type: MessageKind::Location,
            location_data: None,
        },
    )
    .await;

    match next_event(&mut customer).await {
        ServerEvent::MessageError { error, .. } => assert_eq!(error, "Invalid location data"),
        other => panic!("expected messageError, got {other:?}"),
    }
    expect_silence(&mut technician).await;

    // Nothing was persisted and the connection stays usable.
    let history = server_api::conversation_history(&state.api, UserId(10), UserId(20))
        .await
        .expect("history");
    assert!(history.is_empty());

    send_event(&mut customer, &text_send(10, 20, "still works")).await;
    match next_event(&mut technician).await {
        ServerEvent::ReceiveMessage(message) => assert_eq!(message.message, "still works"),
        other => panic!("expected receiveMessage, got {other:?}"),
    }
}
