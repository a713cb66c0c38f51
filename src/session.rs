//! Session controller correlating account requests with their replies.
//!
//! Each operation sends one protocol request and registers a one-shot
//! observer for the matching reply code; the caller receives a
//! [`PendingReply`] and awaits the reply on it. A persistent observer handles
//! the server's session-expiry push. The controller owns the current
//! [`Session`] and remembers the last credential so the application can
//! re-authenticate after an expiry.
//!
//! Issuing a second request of a kind while the first is still outstanding
//! supersedes the first: its observer is deregistered and its pending reply
//! resolves to [`SessionError::Cancelled`]. Exactly one observer per request
//! kind is ever live.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    connection::{ConnectionError, ConnectionManager},
    dispatch::{DispatchRegistry, Observer, ObserverId},
    protocol::{AckReply, LoginReply, Opcode, ProtocolMessage, UserProfile},
    serializer::{BincodeSerializer, Serializer},
};

/// Errors surfaced by [`SessionController`] operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The operation requires an authenticated session and none exists.
    #[error("no active session")]
    NoActiveSession,
    /// `relogin` was called with no remembered credential.
    #[error("no remembered credential")]
    NoCredential,
    /// The request could not be handed to the connection; no reply will come.
    #[error("failed to send request: {0}")]
    Connection(#[from] ConnectionError),
    /// The request was superseded, cancelled, or the controller shut down
    /// before a reply arrived.
    #[error("request cancelled before a reply arrived")]
    Cancelled,
    /// The reply deadline elapsed; the observer has been removed.
    #[error("timed out waiting for reply")]
    Timeout,
    /// Registry invariant violation while installing an observer.
    #[error(transparent)]
    Registry(#[from] crate::dispatch::RegistryError),
}

/// Credential remembered for re-authentication after session expiry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

/// The authenticated user's identity. Owned by the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub profile: UserProfile,
}

/// Which reply a [`PendingReply`] is waiting for, with the data needed to
/// fold a successful reply back into the session state.
#[derive(Clone, Debug)]
enum RequestKind {
    Login,
    Register,
    EditInfo {
        username: String,
        password: String,
        nickname: String,
    },
}

impl RequestKind {
    fn slot(&self) -> usize {
        match self {
            Self::Login => 0,
            Self::Register => 1,
            Self::EditInfo { .. } => 2,
        }
    }
}

/// One observer id per request kind plus the expiry push observer.
#[derive(Debug, Default)]
struct PendingSlots {
    requests: [Option<ObserverId>; 3],
    expiry: Option<ObserverId>,
}

/// State shared between the controller, pending replies, and the expiry
/// event stream. Only these ever write it.
#[derive(Debug, Default)]
struct SharedState {
    session: Mutex<Option<Session>>,
    credential: Mutex<Option<Credential>>,
    pending: Mutex<PendingSlots>,
}

impl SharedState {
    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn credential(&self) -> MutexGuard<'_, Option<Credential>> {
        self.credential
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, PendingSlots> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clear a request slot, but only if it still belongs to `id`; a newer
    /// request may have claimed the slot since.
    fn release_slot(&self, kind: &RequestKind, id: ObserverId) {
        let mut pending = self.pending();
        let slot = &mut pending.requests[kind.slot()];
        if *slot == Some(id) {
            *slot = None;
        }
    }
}

/// Issues account requests and routes each reply back to its caller.
///
/// Explicitly constructed and shared by the application's composition root;
/// call [`shutdown`](Self::shutdown) to tear it down deterministically.
pub struct SessionController<S = BincodeSerializer> {
    connection: Arc<ConnectionManager<S>>,
    registry: Arc<DispatchRegistry>,
    shared: Arc<SharedState>,
}

impl<S> SessionController<S>
where
    S: Serializer + Clone + Send + Sync + 'static,
{
    /// Create a controller over an existing connection manager.
    #[must_use]
    pub fn new(connection: Arc<ConnectionManager<S>>) -> Self {
        let registry = Arc::clone(connection.registry());
        Self {
            connection,
            registry,
            shared: Arc::new(SharedState::default()),
        }
    }

    /// The current authenticated session, if any.
    #[must_use]
    pub fn session(&self) -> Option<Session> { self.shared.session().clone() }

    /// The credential remembered for [`relogin`](Self::relogin).
    #[must_use]
    pub fn remembered_credential(&self) -> Option<Credential> {
        self.shared.credential().clone()
    }

    /// Drop the current session (logout lifecycle hook). The remembered
    /// credential survives.
    pub fn clear_session(&self) { *self.shared.session() = None; }

    /// Authenticate with the server.
    ///
    /// Remembers the credential for later re-authentication, supersedes any
    /// outstanding login request, and sends `LOGIN = [username, password]`.
    /// On a successful reply the session is populated from the reply payload
    /// when the caller consumes it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Connection`] when the request could not be
    /// transmitted; no observer is left behind on that path. Whether the
    /// operation itself succeeded is only visible in the awaited reply.
    pub fn login(
        &self,
        timestamp: i64,
        username: &str,
        password: &str,
    ) -> Result<PendingReply, SessionError> {
        *self.shared.credential() = Some(Credential {
            username: username.to_owned(),
            password: password.to_owned(),
        });
        self.issue(
            RequestKind::Login,
            Opcode::Login,
            ProtocolMessage::login(timestamp, username, password),
        )
    }

    /// Re-issue `LOGIN` from the remembered credential.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoCredential`] when nothing is remembered,
    /// otherwise the same errors as [`login`](Self::login).
    pub fn relogin(&self, timestamp: i64) -> Result<PendingReply, SessionError> {
        let credential = self
            .shared
            .credential()
            .clone()
            .ok_or(SessionError::NoCredential)?;
        self.issue(
            RequestKind::Login,
            Opcode::Login,
            ProtocolMessage::login(timestamp, &credential.username, &credential.password),
        )
    }

    /// Create a new account.
    ///
    /// Remembers the credential and sends
    /// `REGISTER = [username, password, nickname]`. The session is not
    /// touched by the reply; the caller authenticates separately.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Connection`] when the request could not be
    /// transmitted.
    pub fn register(
        &self,
        timestamp: i64,
        username: &str,
        password: &str,
        nickname: &str,
    ) -> Result<PendingReply, SessionError> {
        *self.shared.credential() = Some(Credential {
            username: username.to_owned(),
            password: password.to_owned(),
        });
        self.issue(
            RequestKind::Register,
            Opcode::Register,
            ProtocolMessage::register(timestamp, username, password, nickname),
        )
    }

    /// Update the authenticated account's profile.
    ///
    /// Sends `EDIT_INFO = [user_id, username, password, nickname]` using the
    /// current session's user id. On a successful reply the session's
    /// profile and the remembered password are updated in place when the
    /// caller consumes it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoActiveSession`] when not authenticated;
    /// nothing is sent and the registry is unchanged. Returns
    /// [`SessionError::Connection`] when transmission fails.
    pub fn edit_profile(
        &self,
        timestamp: i64,
        username: &str,
        password: &str,
        nickname: &str,
    ) -> Result<PendingReply, SessionError> {
        let user_id = self
            .shared
            .session()
            .as_ref()
            .map(|s| s.profile.id)
            .ok_or(SessionError::NoActiveSession)?;
        self.issue(
            RequestKind::EditInfo {
                username: username.to_owned(),
                password: password.to_owned(),
                nickname: nickname.to_owned(),
            },
            Opcode::EditInfo,
            ProtocolMessage::edit_info(timestamp, user_id, username, password, nickname),
        )
    }

    /// Install the persistent session-expiry observer and return its event
    /// stream.
    ///
    /// Ensures the connection is open first. Calling this again atomically
    /// replaces the previous observer, so exactly one expiry observer is
    /// ever live; the superseded stream simply ends. Consuming an event
    /// clears the current session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Connection`] when the connection could not be
    /// established.
    pub async fn subscribe_session_expiry(&self) -> Result<SessionExpiryEvents, SessionError> {
        self.connection.connect().await?;
        let (observer, rx) = Observer::persistent(Opcode::LoginTimeoutPush);
        let id = observer.id();
        {
            let mut pending = self.shared.pending();
            if let Some(old) = pending.expiry.replace(id) {
                self.registry.deregister(old);
                debug!(old = %old, new = %id, "replacing session-expiry observer");
            }
            self.registry.register(observer)?;
        }
        Ok(SessionExpiryEvents {
            rx,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Tear the controller down: remove every observer, close the
    /// connection, and forget session state.
    pub fn shutdown(&self) {
        self.registry.clear();
        self.connection.close();
        *self.shared.pending() = PendingSlots::default();
        *self.shared.session() = None;
        *self.shared.credential() = None;
    }

    /// Common request template: supersede the outstanding observer of this
    /// kind, register a fresh one-shot observer, then send.
    fn issue(
        &self,
        kind: RequestKind,
        reply_opcode: Opcode,
        message: ProtocolMessage,
    ) -> Result<PendingReply, SessionError> {
        let (observer, rx) = Observer::one_shot(reply_opcode);
        let id = observer.id();
        {
            let mut pending = self.shared.pending();
            if let Some(old) = pending.requests[kind.slot()].replace(id) {
                // Dropping the old entry closes its channel; the superseded
                // caller observes `Cancelled`.
                self.registry.deregister(old);
                warn!(opcode = %reply_opcode, old = %old, "superseding outstanding request");
            }
            self.registry.register(observer)?;
        }

        if let Err(e) = self.connection.send(message) {
            self.registry.deregister(id);
            self.shared.release_slot(&kind, id);
            return Err(e.into());
        }

        Ok(PendingReply {
            rx,
            observer: id,
            kind,
            registry: Arc::clone(&self.registry),
            shared: Arc::clone(&self.shared),
        })
    }
}

/// A request awaiting its correlated reply.
///
/// Dropping a `PendingReply` without consuming it leaves the one-shot
/// observer registered; the registry prunes it on the next matching dispatch.
/// Prefer [`cancel`](Self::cancel) for prompt removal.
#[derive(Debug)]
pub struct PendingReply {
    rx: mpsc::UnboundedReceiver<ProtocolMessage>,
    observer: ObserverId,
    kind: RequestKind,
    registry: Arc<DispatchRegistry>,
    shared: Arc<SharedState>,
}

impl PendingReply {
    /// Wait for the correlated reply.
    ///
    /// Folds a successful reply into the session state before returning it.
    /// Application-level failure embedded in the payload is returned as
    /// ordinary data.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Cancelled`] when the request was superseded
    /// or the controller shut down.
    pub async fn recv(mut self) -> Result<ProtocolMessage, SessionError> {
        match self.rx.recv().await {
            Some(message) => {
                self.settle(&message);
                Ok(message)
            }
            None => Err(SessionError::Cancelled),
        }
    }

    /// Wait for the correlated reply with a deadline.
    ///
    /// On expiry the observer is removed from the registry so the late reply,
    /// if it ever arrives, is dropped as unroutable.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Timeout`] on expiry, or
    /// [`SessionError::Cancelled`] as for [`recv`](Self::recv).
    pub async fn recv_timeout(
        mut self,
        deadline: std::time::Duration,
    ) -> Result<ProtocolMessage, SessionError> {
        match tokio::time::timeout(deadline, self.rx.recv()).await {
            Ok(Some(message)) => {
                self.settle(&message);
                Ok(message)
            }
            Ok(None) => Err(SessionError::Cancelled),
            Err(_) => {
                self.abandon();
                Err(SessionError::Timeout)
            }
        }
    }

    /// Abandon the request, removing its observer. No reply will be
    /// delivered.
    pub fn cancel(self) { self.abandon(); }

    fn abandon(&self) {
        self.registry.deregister(self.observer);
        self.shared.release_slot(&self.kind, self.observer);
    }

    /// The reply arrived: free the slot and fold the outcome into the
    /// session state.
    fn settle(&self, message: &ProtocolMessage) {
        self.shared.release_slot(&self.kind, self.observer);
        match &self.kind {
            RequestKind::Login => match LoginReply::parse(message) {
                Ok(reply) => {
                    if let Some(profile) = reply.profile {
                        debug!(user = profile.id, "session established");
                        *self.shared.session() = Some(Session { profile });
                    }
                }
                Err(e) => warn!(error = %e, "malformed login reply; session unchanged"),
            },
            RequestKind::Register => {
                if let Err(e) = AckReply::parse(message, Opcode::Register) {
                    warn!(error = %e, "malformed register reply");
                }
            }
            RequestKind::EditInfo {
                username,
                password,
                nickname,
            } => match AckReply::parse(message, Opcode::EditInfo) {
                Ok(reply) if reply.status.is_ok() => {
                    if let Some(session) = self.shared.session().as_mut() {
                        session.profile.username = username.clone();
                        session.profile.nickname = nickname.clone();
                    }
                    if let Some(credential) = self.shared.credential().as_mut() {
                        credential.username = username.clone();
                        credential.password = password.clone();
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "malformed edit-info reply; session unchanged"),
            },
        }
    }
}

/// Stream of session-expiry pushes from the server.
///
/// Consuming an event clears the controller's session; the remembered
/// credential is kept so the application can
/// [`relogin`](SessionController::relogin).
pub struct SessionExpiryEvents {
    rx: mpsc::UnboundedReceiver<ProtocolMessage>,
    shared: Arc<SharedState>,
}

impl SessionExpiryEvents {
    /// Wait for the next expiry push.
    ///
    /// Returns `None` when the observer has been replaced or the controller
    /// shut down.
    pub async fn recv(&mut self) -> Option<ProtocolMessage> {
        let message = self.rx.recv().await?;
        debug!("session expired; clearing session");
        *self.shared.session() = None;
        Some(message)
    }
}
