//! Error taxonomy shared by every subsystem, plus the HRESULT codes the
//! bridge reports to the host. Mirrors the shape of `vinit::InitError` /
//! `vcontrol::error::Error`: one typed enum carrying the failure class,
//! wrapping an `anyhow::Error` for the underlying cause.

use thiserror::Error;

/// HRESULT constants returned to the host in every response envelope.
pub mod hresult {
    pub const NOT_IMPL: i32 = 0x80004001u32 as i32;
    pub const FAIL: i32 = 0x80004005u32 as i32;
    pub const NOT_FOUND: i32 = 0x80070490u32 as i32;
    pub const INVALID_ARG: i32 = 0x80070057u32 as i32;
    pub const TIMEOUT: i32 = 0xC0370109u32 as i32;
    pub const INVALID_JSON: i32 = 0xC037010Du32 as i32;
    pub const NOT_FOUND_SYSTEM: i32 = 0xC037010Eu32 as i32;
    pub const ALREADY_EXISTS: i32 = 0xC037010Fu32 as i32;
    pub const BAD_PROTOCOL_VERSION: i32 = 0xC037010Cu32 as i32;
    pub const UNKNOWN_MESSAGE: i32 = 0xC037010Bu32 as i32;
    pub const INVALID_STATE: i32 = 0x80370105u32 as i32;
    pub const ALREADY_STOPPED: i32 = 0x80370110u32 as i32;
}

/// The failure class for an error raised anywhere in GCS. Each variant maps
/// to a fixed HRESULT via [`ErrorKind::hresult`]; the wrapped source is
/// preserved for logging ("unwrapping walks the error chain").
#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("protocol error: {0}")]
    Protocol(#[source] anyhow::Error),

    #[error("not found: {0}")]
    NotFound(#[source] anyhow::Error),

    #[error("container not registered: {0}")]
    NotFoundSystem(#[source] anyhow::Error),

    #[error("already exists: {0}")]
    AlreadyExists(#[source] anyhow::Error),

    #[error("invalid argument: {0}")]
    InvalidArg(#[source] anyhow::Error),

    #[error("invalid state: {0}")]
    InvalidState(#[source] anyhow::Error),

    #[error("already stopped: {0}")]
    AlreadyStopped(#[source] anyhow::Error),

    #[error("unsupported protocol version: {0}")]
    BadProtocolVersion(#[source] anyhow::Error),

    #[error("unknown message type: {0}")]
    UnknownMessage(#[source] anyhow::Error),

    #[error("policy denied: {0}")]
    Policy(#[source] anyhow::Error),

    #[error("runtime error: {0}")]
    Runtime(#[source] anyhow::Error),

    #[error("timed out: {0}")]
    Timeout(#[source] anyhow::Error),

    #[error("not implemented: {0}")]
    NotImplemented(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ErrorKind {
    /// The HRESULT reported to the host for this failure class.
    pub fn hresult(&self) -> i32 {
        use hresult::*;
        match self {
            ErrorKind::Protocol(_) => INVALID_JSON,
            ErrorKind::NotFound(_) => NOT_FOUND,
            ErrorKind::NotFoundSystem(_) => NOT_FOUND_SYSTEM,
            ErrorKind::AlreadyExists(_) => ALREADY_EXISTS,
            ErrorKind::InvalidArg(_) => INVALID_ARG,
            ErrorKind::InvalidState(_) => INVALID_STATE,
            ErrorKind::AlreadyStopped(_) => ALREADY_STOPPED,
            ErrorKind::BadProtocolVersion(_) => BAD_PROTOCOL_VERSION,
            ErrorKind::UnknownMessage(_) => UNKNOWN_MESSAGE,
            // policy denials surface as the generic failure code to the host
            ErrorKind::Policy(_) => FAIL,
            ErrorKind::Runtime(_) => FAIL,
            ErrorKind::Timeout(_) => TIMEOUT,
            ErrorKind::NotImplemented(_) => NOT_IMPL,
            ErrorKind::Other(_) => FAIL,
        }
    }

    pub fn not_found(e: impl Into<anyhow::Error>) -> Self {
        ErrorKind::NotFound(e.into())
    }

    pub fn not_found_system(e: impl Into<anyhow::Error>) -> Self {
        ErrorKind::NotFoundSystem(e.into())
    }

    pub fn already_exists(e: impl Into<anyhow::Error>) -> Self {
        ErrorKind::AlreadyExists(e.into())
    }

    pub fn invalid_arg(e: impl Into<anyhow::Error>) -> Self {
        ErrorKind::InvalidArg(e.into())
    }

    pub fn invalid_state(e: impl Into<anyhow::Error>) -> Self {
        ErrorKind::InvalidState(e.into())
    }

    pub fn already_stopped(e: impl Into<anyhow::Error>) -> Self {
        ErrorKind::AlreadyStopped(e.into())
    }

    pub fn policy(reason: impl Into<String>) -> Self {
        ErrorKind::Policy(anyhow::anyhow!(reason.into()))
    }

    pub fn timeout(e: impl Into<anyhow::Error>) -> Self {
        ErrorKind::Timeout(e.into())
    }

    pub fn runtime(e: impl Into<anyhow::Error>) -> Self {
        ErrorKind::Runtime(e.into())
    }
}

pub type GcsResult<T> = Result<T, ErrorKind>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hresult_table_matches_spec() {
        assert_eq!(ErrorKind::NotImplemented(anyhow::anyhow!("x")).hresult(), 0x80004001u32 as i32);
        assert_eq!(ErrorKind::Other(anyhow::anyhow!("x")).hresult(), 0x80004005u32 as i32);
        assert_eq!(ErrorKind::not_found(anyhow::anyhow!("x")).hresult(), 0x80070490u32 as i32);
        assert_eq!(ErrorKind::invalid_arg(anyhow::anyhow!("x")).hresult(), 0x80070057u32 as i32);
        assert_eq!(ErrorKind::timeout(anyhow::anyhow!("x")).hresult(), 0xC0370109u32 as i32);
        assert_eq!(ErrorKind::Protocol(anyhow::anyhow!("x")).hresult(), 0xC037010Du32 as i32);
        assert_eq!(ErrorKind::not_found_system(anyhow::anyhow!("x")).hresult(), 0xC037010Eu32 as i32);
        assert_eq!(ErrorKind::already_exists(anyhow::anyhow!("x")).hresult(), 0xC037010Fu32 as i32);
        assert_eq!(ErrorKind::BadProtocolVersion(anyhow::anyhow!("x")).hresult(), 0xC037010Cu32 as i32);
        assert_eq!(ErrorKind::UnknownMessage(anyhow::anyhow!("x")).hresult(), 0xC037010Bu32 as i32);
        assert_eq!(ErrorKind::invalid_state(anyhow::anyhow!("x")).hresult(), 0x80370105u32 as i32);
        assert_eq!(ErrorKind::already_stopped(anyhow::anyhow!("x")).hresult(), 0x80370110u32 as i32);
    }

    #[test]
    fn policy_denial_surfaces_generic_failure() {
        let err = ErrorKind::policy("denied by rule 12");
        assert_eq!(err.hresult(), 0x80004005u32 as i32);
    }
}
