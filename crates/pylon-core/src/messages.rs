//! Wire frame, command, result, and notification types.
//!
//! Frames are JSON text messages, externally tagged by `type`. Command and
//! notification payloads sit under a `payload` key; result tags carry their
//! fields inline. The `token` on a command frame is a client-chosen opaque
//! string the server echoes verbatim on the matching result frame.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Frames
// ─────────────────────────────────────────────────────────────────────────────

/// A single wire frame, in either direction.
///
/// Clients send `Command` frames; the server answers with `CommandResult`
/// frames (echoing the token) and pushes uncorrelated `Notify` frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Client-initiated request expecting exactly one correlated result.
    Command {
        /// Correlation token chosen by the client.
        token: String,
        /// The command being issued.
        command: Command,
    },
    /// Server response correlated to a previously sent command.
    ///
    /// A `null` token denotes a server-side error not attributable to any
    /// specific request.
    CommandResult {
        /// Token of the originating command, or `None` for general errors.
        token: Option<String>,
        /// Outcome of the command.
        result: CommandResult,
    },
    /// Server-initiated, uncorrelated push event.
    Notify {
        /// The notification body.
        notify: Notify,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

/// A client command together with its payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Command {
    /// Open a logical session on the freshly established connection.
    SessionInitialize(SessionInitialize),
    /// Attach client/host metadata to the initialized session.
    SessionInitializeAgent(SessionInitializeAgent),
    /// Report the client's locale and coarse geo information.
    SessionUpdateLocale(SessionUpdateLocale),
    /// Query information about an invite link.
    InviteQueryInfo(InviteQueryInfo),
    /// Log a click action on an invite link.
    InviteLogAction(InviteLogAction),
    /// Create (or reuse) an invite link.
    InviteCreate(InviteCreate),
}

/// Payload for [`Command::SessionInitialize`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionInitialize {
    /// Whether the server should anonymize the client's IP address.
    pub anonymize_ip: bool,
}

/// Payload for [`Command::SessionInitializeAgent`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionInitializeAgent {
    /// Kind of client opening the session.
    pub session_type: SessionType,
    /// Operating system family, if known.
    pub platform: Option<String>,
    /// Operating system version, if known.
    pub platform_version: Option<String>,
    /// CPU architecture, if known.
    pub architecture: Option<String>,
    /// Version of the client binary.
    pub client_version: Option<String>,
    /// Version of the UI bundle.
    pub ui_version: Option<String>,
}

/// Payload for [`Command::SessionUpdateLocale`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionUpdateLocale {
    /// Lowercased ISO country code resolved from the client's IP, if any.
    pub ip_country: Option<String>,
    /// URL of the locale bundle the user selected, if any.
    pub selected_locale: Option<String>,
    /// Client wall-clock time in milliseconds since the Unix epoch.
    pub local_timestamp: i64,
}

/// Payload for [`Command::InviteQueryInfo`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InviteQueryInfo {
    /// Identifier of the invite link to query.
    pub link_id: String,
    /// Whether this query counts as a view of the link.
    pub register_view: bool,
}

/// Payload for [`Command::InviteLogAction`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InviteLogAction {
    /// Kind of click being logged.
    pub click_type: i32,
}

/// Payload for [`Command::InviteCreate`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InviteCreate {
    /// Force creation of a new link instead of reusing an equivalent one.
    pub new_link: bool,
    /// Connect parameters embedded into the link.
    pub properties_connect: HashMap<String, String>,
    /// Informational properties shown on the landing page.
    pub properties_info: HashMap<String, String>,
}

/// Kind of client opening a session. Serialized as an integer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SessionType {
    /// Browser-based client.
    WebClient,
    /// Native desktop client.
    TeaClient,
    /// Invite landing page session.
    InviteWebSite,
}

impl From<SessionType> for u8 {
    fn from(value: SessionType) -> Self {
        match value {
            SessionType::WebClient => 0,
            SessionType::TeaClient => 1,
            SessionType::InviteWebSite => 16,
        }
    }
}

impl TryFrom<u8> for SessionType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SessionType::WebClient),
            1 => Ok(SessionType::TeaClient),
            16 => Ok(SessionType::InviteWebSite),
            other => Err(format!("unknown session type: {other}")),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command results
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of a command.
///
/// The connection layer interprets only the transport-level tags
/// (`ConnectionClosed`, `ConnectionTimeout`, `GenericError`) and the
/// retryable trio (`ServerInternalError`, `CommandEnqueueError`,
/// `ClientSessionUninitialized`); every other tag passes through to the
/// caller unchanged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CommandResult {
    /// The command was accepted and executed.
    Success,
    /// Catch-all client-side failure (e.g. the frame could not be written).
    GenericError {
        /// Human-readable description.
        error: String,
    },
    /// No result arrived within the per-command timeout.
    ConnectionTimeout,
    /// The connection was not open, or closed while the command was pending.
    ConnectionClosed,
    /// The session has not been initialized yet. Retryable.
    ClientSessionUninitialized,
    /// The server failed internally. Retryable.
    ServerInternalError,
    /// A command parameter failed validation.
    ParameterInvalid {
        /// Name of the offending parameter.
        parameter: String,
    },
    /// The server could not parse the command.
    CommandParseError {
        /// Parser diagnostic.
        error: String,
    },
    /// The server could not enqueue the command. Retryable.
    CommandEnqueueError {
        /// Affected fields.
        fields: String,
    },
    /// The command is not known to the server.
    CommandNotFound,
    /// The command is known but not implemented.
    CommandNotImplemented,
    /// The session has already been initialized.
    SessionAlreadyInitialized,
    /// The session agent has already been initialized.
    SessionAgentAlreadyInitialized,
    /// The session must be initialized first.
    SessionNotInitialized,
    /// The session agent must be initialized first.
    SessionAgentNotInitialized,
    /// The session type does not permit this command.
    SessionInvalidType,
    /// The invite session must be initialized first.
    InviteSessionNotInitialized,
    /// The invite session has already been initialized.
    InviteSessionAlreadyInitialized,
    /// The invite key failed validation.
    InviteKeyInvalid {
        /// Affected fields.
        fields: String,
    },
    /// The invite key does not exist.
    InviteKeyNotFound,
}

impl CommandResult {
    /// Whether the command succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, CommandResult::Success)
    }

    /// Whether the result indicates a transient server condition worth
    /// retrying the same command for.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CommandResult::ServerInternalError
                | CommandResult::CommandEnqueueError { .. }
                | CommandResult::ClientSessionUninitialized
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Notifications
// ─────────────────────────────────────────────────────────────────────────────

/// A server push notification together with its payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Notify {
    /// Periodic online user counters.
    #[serde(rename = "NotifyClientsOnline")]
    ClientsOnline(ClientsOnline),
    /// An invite link was created for this session.
    #[serde(rename = "NotifyInviteCreated")]
    InviteCreated(InviteCreated),
    /// Details about a queried invite link.
    #[serde(rename = "NotifyInviteInfo")]
    InviteInfo(InviteInfo),
}

impl Notify {
    /// Dispatch key of this notification.
    pub fn kind(&self) -> NotifyKind {
        match self {
            Notify::ClientsOnline(_) => NotifyKind::ClientsOnline,
            Notify::InviteCreated(_) => NotifyKind::InviteCreated,
            Notify::InviteInfo(_) => NotifyKind::InviteInfo,
        }
    }
}

/// Dispatch key for notification handlers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NotifyKind {
    /// [`Notify::ClientsOnline`]
    ClientsOnline,
    /// [`Notify::InviteCreated`]
    InviteCreated,
    /// [`Notify::InviteInfo`]
    InviteInfo,
}

/// Payload of [`Notify::ClientsOnline`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientsOnline {
    /// Online users keyed by session type.
    pub users_online: HashMap<u8, u64>,
    /// Unique online users keyed by session type.
    pub unique_users_online: HashMap<u8, u64>,
    /// Total online users across all session types.
    pub total_users_online: u64,
    /// Total unique online users across all session types.
    pub total_unique_users_online: u64,
}

/// Payload of [`Notify::InviteCreated`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InviteCreated {
    /// Identifier of the created link.
    pub link_id: String,
    /// Administration token, present when a new link was created.
    pub admin_token: Option<String>,
}

/// Payload of [`Notify::InviteInfo`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InviteInfo {
    /// Identifier of the link.
    pub link_id: String,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp_created: i64,
    /// Scheduled deletion time in milliseconds since the Unix epoch.
    pub timestamp_deleted: i64,
    /// How often the link has been viewed.
    pub amount_viewed: u64,
    /// How often the link has been clicked.
    pub amount_clicked: u64,
    /// Connect parameters embedded into the link.
    pub properties_connect: HashMap<String, String>,
    /// Informational properties shown on the landing page.
    pub properties_info: HashMap<String, String>,
}
