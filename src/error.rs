use thiserror::Error;

// ---------------------------------------------------------------------------
// SignalingError -- every failure the RPC surface or the client driver reports
// ---------------------------------------------------------------------------

/// Structured error for the signaling service and its client driver.
///
/// Server-side variants cross the wire as the JSON-RPC `error` string, so the
/// messages stay short and human-readable. The client maps a non-null `error`
/// field back into [`SignalingError::Remote`] and anything that went wrong on
/// the connection itself into [`SignalingError::Transport`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    /// A required request field is missing.
    #[error("must set {0}")]
    InvalidRequest(&'static str),

    /// No room registered under that name.
    #[error("room not found: {0}")]
    RoomNotFound(String),

    /// `CreateRoom` for an existing name with a different owner or secret.
    #[error("room name duplicated: {0}")]
    DuplicateRoom(String),

    /// The presented preshared secret does not match the room's.
    #[error("preshared mismatch")]
    PresharedMismatch,

    /// Owner-only operation attempted by a non-owner.
    #[error("no permission: {0}")]
    PermissionDenied(String),

    /// Caller is not a member of the room.
    #[error("not a member: {0}")]
    NotAMember(String),

    /// Join attempted while the room is locked.
    #[error("room is locked: {0}")]
    RoomLocked(String),

    /// Dial / read / write failure on the client transport.
    #[error("transport: {0}")]
    Transport(String),

    /// Error string returned by the remote service.
    #[error("{0}")]
    Remote(String),
}

impl SignalingError {
    /// Wrap any transport-layer failure, preserving its message.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
