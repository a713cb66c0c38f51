//! Protocol messages exchanged with the board service.
//!
//! A [`ProtocolMessage`] is a closed [`Opcode`] tag, a caller-supplied send
//! timestamp, and a positional payload of string fields. The field order is
//! operation-specific and shared with the server; builders for the outbound
//! shapes and typed parsers for the reply shapes live here so the rest of the
//! crate never touches raw payload indices.

use bincode::{Decode, Encode};

/// Operation codes shared by client and server.
///
/// The enumeration is closed: an unknown code on the wire is a decode error,
/// not an extensible variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Encode, Decode)]
pub enum Opcode {
    /// Authenticate an existing account.
    Login,
    /// Create a new account.
    Register,
    /// Update the authenticated account's profile.
    EditInfo,
    /// Server-initiated notification that the session has expired.
    LoginTimeoutPush,
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Login => "LOGIN",
            Self::Register => "REGISTER",
            Self::EditInfo => "EDIT_INFO",
            Self::LoginTimeoutPush => "LOGIN_TIMEOUT_PUSH",
        };
        f.write_str(name)
    }
}

/// One message on the wire. Immutable once constructed.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct ProtocolMessage {
    opcode: Opcode,
    timestamp: i64,
    payload: Vec<String>,
}

impl ProtocolMessage {
    /// Construct a message from its parts.
    #[must_use]
    pub fn new(opcode: Opcode, timestamp: i64, payload: Vec<String>) -> Self {
        Self {
            opcode,
            timestamp,
            payload,
        }
    }

    /// Operation code identifying the semantic kind of this message.
    #[must_use]
    pub fn opcode(&self) -> Opcode { self.opcode }

    /// Caller-supplied send time in milliseconds.
    #[must_use]
    pub fn timestamp(&self) -> i64 { self.timestamp }

    /// Positional payload fields.
    #[must_use]
    pub fn payload(&self) -> &[String] { &self.payload }

    /// Build a `LOGIN` request: `[username, password]`.
    #[must_use]
    pub fn login(timestamp: i64, username: &str, password: &str) -> Self {
        Self::new(
            Opcode::Login,
            timestamp,
            vec![username.to_owned(), password.to_owned()],
        )
    }

    /// Build a `REGISTER` request: `[username, password, nickname]`.
    #[must_use]
    pub fn register(timestamp: i64, username: &str, password: &str, nickname: &str) -> Self {
        Self::new(
            Opcode::Register,
            timestamp,
            vec![username.to_owned(), password.to_owned(), nickname.to_owned()],
        )
    }

    /// Build an `EDIT_INFO` request: `[user_id, username, password, nickname]`.
    #[must_use]
    pub fn edit_info(
        timestamp: i64,
        user_id: u64,
        username: &str,
        password: &str,
        nickname: &str,
    ) -> Self {
        Self::new(
            Opcode::EditInfo,
            timestamp,
            vec![
                user_id.to_string(),
                username.to_owned(),
                password.to_owned(),
                nickname.to_owned(),
            ],
        )
    }
}

/// Identity fields carried by a successful `LOGIN` reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserProfile {
    pub id: u64,
    pub username: String,
    pub nickname: String,
}

/// Application-level outcome embedded in a reply payload.
///
/// The first payload field of every reply is a numeric status; `0` means
/// success and any other value is a server-defined failure code. Failure is
/// ordinary data, not a dispatch error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Failed(u32),
}

impl ReplyStatus {
    #[must_use]
    pub fn is_ok(self) -> bool { matches!(self, Self::Ok) }
}

/// A reply payload that could not be interpreted.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReplyParseError {
    #[error("reply for {expected} carried opcode {actual}")]
    WrongOpcode { expected: Opcode, actual: Opcode },
    #[error("reply payload is missing field {0}")]
    MissingField(usize),
    #[error("reply field {index} is not numeric: {value:?}")]
    BadNumber { index: usize, value: String },
}

fn parse_status(payload: &[String]) -> Result<ReplyStatus, ReplyParseError> {
    let raw = payload.first().ok_or(ReplyParseError::MissingField(0))?;
    let code: u32 = raw.parse().map_err(|_| ReplyParseError::BadNumber {
        index: 0,
        value: raw.clone(),
    })?;
    Ok(if code == 0 {
        ReplyStatus::Ok
    } else {
        ReplyStatus::Failed(code)
    })
}

fn expect_opcode(message: &ProtocolMessage, expected: Opcode) -> Result<(), ReplyParseError> {
    if message.opcode() == expected {
        Ok(())
    } else {
        Err(ReplyParseError::WrongOpcode {
            expected,
            actual: message.opcode(),
        })
    }
}

/// Decoded `LOGIN` reply: `[status]` on failure, `[status, user_id, username,
/// nickname]` on success.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoginReply {
    pub status: ReplyStatus,
    pub profile: Option<UserProfile>,
}

impl LoginReply {
    /// Parse a `LOGIN` reply message.
    ///
    /// # Errors
    ///
    /// Returns [`ReplyParseError`] when the opcode is not `LOGIN` or the
    /// payload does not follow the reply shape.
    pub fn parse(message: &ProtocolMessage) -> Result<Self, ReplyParseError> {
        expect_opcode(message, Opcode::Login)?;
        let payload = message.payload();
        let status = parse_status(payload)?;
        if !status.is_ok() {
            return Ok(Self {
                status,
                profile: None,
            });
        }
        let field = |index: usize| {
            payload
                .get(index)
                .cloned()
                .ok_or(ReplyParseError::MissingField(index))
        };
        let raw_id = field(1)?;
        let id: u64 = raw_id.parse().map_err(|_| ReplyParseError::BadNumber {
            index: 1,
            value: raw_id.clone(),
        })?;
        Ok(Self {
            status,
            profile: Some(UserProfile {
                id,
                username: field(2)?,
                nickname: field(3)?,
            }),
        })
    }
}

/// Decoded status-only reply (`REGISTER`, `EDIT_INFO`): `[status]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckReply {
    pub status: ReplyStatus,
}

impl AckReply {
    /// Parse a status-only reply message of the given kind.
    ///
    /// # Errors
    ///
    /// Returns [`ReplyParseError`] when the opcode does not match or the
    /// status field is absent or non-numeric.
    pub fn parse(message: &ProtocolMessage, expected: Opcode) -> Result<Self, ReplyParseError> {
        expect_opcode(message, expected)?;
        let status = parse_status(message.payload())?;
        Ok(Self { status })
    }
}
