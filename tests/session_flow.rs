//! End-to-end session scenarios against a scripted fake server.
//!
//! The fake server sits on the far end of an in-process duplex pipe, decodes
//! the client's requests with the same codec and serializer, and replies
//! according to each scenario's script.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use boardlink::{
    BincodeSerializer,
    ConnectionError,
    ConnectionManager,
    DispatchRegistry,
    LoginReply,
    Opcode,
    ProtocolMessage,
    ReplyStatus,
    Serializer,
    SessionController,
    SessionError,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

struct FakeServer {
    framed: Framed<DuplexStream, LengthDelimitedCodec>,
}

impl FakeServer {
    async fn recv(&mut self) -> ProtocolMessage {
        let frame = self
            .framed
            .next()
            .await
            .expect("client frame")
            .expect("valid frame");
        let (message, _) = BincodeSerializer
            .deserialize(&frame)
            .expect("decode client message");
        message
    }

    async fn send(&mut self, message: &ProtocolMessage) {
        let bytes = BincodeSerializer.serialize(message).expect("encode reply");
        self.framed
            .send(Bytes::from(bytes))
            .await
            .expect("send reply");
    }
}

fn harness() -> (SessionController, Arc<DispatchRegistry>, FakeServer) {
    init_tracing();
    let registry = Arc::new(DispatchRegistry::new());
    let connection = Arc::new(ConnectionManager::detached(Arc::clone(&registry)));
    let (local, remote) = tokio::io::duplex(4096);
    connection.attach(local);
    let controller = SessionController::new(connection);
    let server = FakeServer {
        framed: Framed::new(remote, LengthDelimitedCodec::new()),
    };
    (controller, registry, server)
}

fn login_ok_reply(timestamp: i64, id: u64, username: &str, nickname: &str) -> ProtocolMessage {
    ProtocolMessage::new(
        Opcode::Login,
        timestamp,
        vec![
            "0".to_owned(),
            id.to_string(),
            username.to_owned(),
            nickname.to_owned(),
        ],
    )
}

async fn authenticate(controller: &SessionController, server: &mut FakeServer) {
    let pending = controller.login(1, "alice", "secret").expect("send login");
    let request = server.recv().await;
    assert_eq!(request.opcode(), Opcode::Login);
    server.send(&login_ok_reply(2, 42, "alice", "Ally")).await;
    pending.recv().await.expect("login reply");
}

#[tokio::test]
async fn successful_login_populates_the_session() {
    let (controller, registry, mut server) = harness();

    let pending = controller.login(7, "alice", "secret").expect("send login");
    let request = server.recv().await;
    assert_eq!(request.opcode(), Opcode::Login);
    assert_eq!(request.timestamp(), 7);
    assert_eq!(request.payload(), ["alice", "secret"]);

    server.send(&login_ok_reply(8, 42, "alice", "Ally")).await;
    let reply = pending.recv().await.expect("login reply");
    let parsed = LoginReply::parse(&reply).expect("parse reply");
    assert!(parsed.status.is_ok());

    let session = controller.session().expect("session established");
    assert_eq!(session.profile.id, 42);
    assert_eq!(session.profile.nickname, "Ally");
    assert!(registry.is_empty(), "one-shot observer must be gone");
}

#[tokio::test]
async fn failed_login_is_forwarded_without_a_session() {
    let (controller, _registry, mut server) = harness();

    let pending = controller.login(1, "alice", "wrong").expect("send login");
    server.recv().await;
    server
        .send(&ProtocolMessage::new(Opcode::Login, 2, vec!["3".to_owned()]))
        .await;

    let reply = pending.recv().await.expect("reply is ordinary data");
    let parsed = LoginReply::parse(&reply).expect("parse reply");
    assert_eq!(parsed.status, ReplyStatus::Failed(3));
    assert!(controller.session().is_none());
}

#[tokio::test]
async fn push_does_not_disturb_an_outstanding_register() {
    let (controller, registry, mut server) = harness();
    let mut expiry = controller
        .subscribe_session_expiry()
        .await
        .expect("subscribe expiry");

    let pending = controller
        .register(1, "bob", "hunter2", "Bobby")
        .expect("send register");
    let request = server.recv().await;
    assert_eq!(request.opcode(), Opcode::Register);
    assert_eq!(request.payload(), ["bob", "hunter2", "Bobby"]);

    // The push arrives before the register reply.
    server
        .send(&ProtocolMessage::new(Opcode::LoginTimeoutPush, 2, vec![]))
        .await;
    let push = expiry.recv().await.expect("push delivered");
    assert_eq!(push.opcode(), Opcode::LoginTimeoutPush);
    assert_eq!(registry.len(), 2, "register observer must be untouched");

    server
        .send(&ProtocolMessage::new(
            Opcode::Register,
            3,
            vec!["0".to_owned()],
        ))
        .await;
    let reply = pending.recv().await.expect("register reply still arrives");
    assert_eq!(reply.opcode(), Opcode::Register);
}

#[tokio::test]
async fn resubscribing_replaces_the_expiry_observer() {
    let (controller, registry, mut server) = harness();

    let mut first = controller
        .subscribe_session_expiry()
        .await
        .expect("first subscription");
    let mut second = controller
        .subscribe_session_expiry()
        .await
        .expect("second subscription");
    assert_eq!(registry.len(), 1, "exactly one expiry observer is live");

    server
        .send(&ProtocolMessage::new(Opcode::LoginTimeoutPush, 1, vec![]))
        .await;

    assert!(second.recv().await.is_some(), "new stream receives the push");
    assert!(first.recv().await.is_none(), "old stream has ended");
}

#[tokio::test]
async fn expiry_push_clears_the_session_but_keeps_the_credential() {
    let (controller, _registry, mut server) = harness();
    authenticate(&controller, &mut server).await;
    assert!(controller.session().is_some());

    let mut expiry = controller
        .subscribe_session_expiry()
        .await
        .expect("subscribe expiry");
    server
        .send(&ProtocolMessage::new(Opcode::LoginTimeoutPush, 9, vec![]))
        .await;
    expiry.recv().await.expect("push delivered");

    assert!(controller.session().is_none(), "session cleared on expiry");
    let credential = controller
        .remembered_credential()
        .expect("credential survives for relogin");
    assert_eq!(credential.username, "alice");

    // Auto re-login from the remembered credential.
    let pending = controller.relogin(10).expect("send relogin");
    let request = server.recv().await;
    assert_eq!(request.payload(), ["alice", "secret"]);
    server.send(&login_ok_reply(11, 42, "alice", "Ally")).await;
    pending.recv().await.expect("relogin reply");
    assert!(controller.session().is_some());
}

#[tokio::test]
async fn second_login_supersedes_the_first() {
    let (controller, registry, mut server) = harness();

    let first = controller.login(1, "alice", "secret").expect("first login");
    let second = controller.login(2, "alice", "secret").expect("second login");
    assert_eq!(registry.len(), 1, "stale observer must be removed");

    // Both requests reached the wire; the server answers once.
    server.recv().await;
    server.recv().await;
    server.send(&login_ok_reply(3, 42, "alice", "Ally")).await;

    assert!(matches!(
        first.recv().await,
        Err(SessionError::Cancelled)
    ));
    second.recv().await.expect("reply routed to the live request");
    assert!(controller.session().is_some());
}

#[tokio::test]
async fn successful_edit_updates_the_session_in_place() {
    let (controller, _registry, mut server) = harness();
    authenticate(&controller, &mut server).await;

    let pending = controller
        .edit_profile(5, "alice2", "hunter2", "Al")
        .expect("send edit");
    let request = server.recv().await;
    assert_eq!(request.opcode(), Opcode::EditInfo);
    assert_eq!(request.payload(), ["42", "alice2", "hunter2", "Al"]);

    server
        .send(&ProtocolMessage::new(
            Opcode::EditInfo,
            6,
            vec!["0".to_owned()],
        ))
        .await;
    pending.recv().await.expect("edit reply");

    let session = controller.session().expect("session still active");
    assert_eq!(session.profile.username, "alice2");
    assert_eq!(session.profile.nickname, "Al");
    let credential = controller.remembered_credential().expect("credential kept");
    assert_eq!(credential.password, "hunter2");
}

#[tokio::test]
async fn failed_edit_leaves_the_session_untouched() {
    let (controller, _registry, mut server) = harness();
    authenticate(&controller, &mut server).await;

    let pending = controller
        .edit_profile(5, "alice2", "hunter2", "Al")
        .expect("send edit");
    server.recv().await;
    server
        .send(&ProtocolMessage::new(
            Opcode::EditInfo,
            6,
            vec!["2".to_owned()],
        ))
        .await;
    pending.recv().await.expect("edit reply");

    let session = controller.session().expect("session still active");
    assert_eq!(session.profile.username, "alice");
    assert_eq!(session.profile.nickname, "Ally");
}

#[tokio::test(start_paused = true)]
async fn reply_deadline_removes_the_observer() {
    let (controller, registry, mut server) = harness();

    let pending = controller.login(1, "alice", "secret").expect("send login");
    server.recv().await;

    let err = pending
        .recv_timeout(Duration::from_secs(5))
        .await
        .expect_err("no reply is coming");
    assert!(matches!(err, SessionError::Timeout));
    assert!(registry.is_empty(), "timed-out observer must be removed");

    // A late reply is now unroutable and silently dropped.
    server.send(&login_ok_reply(2, 42, "alice", "Ally")).await;
    tokio::task::yield_now().await;
    assert!(controller.session().is_none());
}

#[tokio::test]
async fn backpressure_failure_leaves_no_observer_behind() {
    init_tracing();
    let registry = Arc::new(DispatchRegistry::new());
    let connection = Arc::new(ConnectionManager::detached(Arc::clone(&registry)));
    // A one-byte pipe nobody reads: the writer task stalls on its first
    // frame and the bounded outbound queue eventually fills. The far end
    // must stay alive or the stall would become a disconnect instead.
    let (local, _remote) = tokio::io::duplex(1);
    connection.attach(local);
    let controller = SessionController::new(connection);

    let mut backpressure = None;
    for attempt in 0..64 {
        match controller.login(attempt, "alice", "secret") {
            Ok(pending) => pending.cancel(),
            Err(err) => {
                backpressure = Some(err);
                break;
            }
        }
    }

    let err = backpressure.expect("queue must fill within the attempt budget");
    assert!(matches!(
        err,
        SessionError::Connection(ConnectionError::QueueFull)
    ));
    assert!(
        registry.is_empty(),
        "failed request must deregister its observer"
    );
}

#[tokio::test]
async fn cancelled_request_receives_nothing() {
    let (controller, registry, mut server) = harness();

    let pending = controller.login(1, "alice", "secret").expect("send login");
    server.recv().await;
    pending.cancel();
    assert!(registry.is_empty());

    server.send(&login_ok_reply(2, 42, "alice", "Ally")).await;
    tokio::task::yield_now().await;
    assert!(controller.session().is_none());
}
