//! Compatibility check performed before any call is trusted.
//!
//! The host launches a plugin with the magic cookie and protocol version in
//! its environment. The plugin refuses to run without the cookie, then opens
//! the conversation with a [`Frame::Hello`] that the host verifies against
//! its own [`HandshakeConfig`].

use std::time::Duration;

use thiserror::Error;

use crate::wire::Frame;

pub const MAGIC_COOKIE_KEY: &str = "MARQUEE_PLUGIN_MAGIC_COOKIE";
pub const MAGIC_COOKIE_VALUE: &str = "6d61727175656521-plugin-bridge";
pub const PROTOCOL_VERSION_KEY: &str = "MARQUEE_PLUGIN_PROTOCOL_VERSION";
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("magic cookie mismatch; the binary is not a compatible marquee plugin")]
    CookieMismatch,
    #[error("protocol version mismatch: host speaks {expected}, plugin speaks {actual}")]
    VersionMismatch { expected: u32, actual: u32 },
    #[error("expected a hello frame, received `{0}`")]
    UnexpectedFrame(&'static str),
    #[error(
        "this binary is a marquee plugin and must be launched by the marquee host \
         ({MAGIC_COOKIE_KEY} is not set)"
    )]
    NotLaunchedByHost,
    #[error("no hello within {0:?}")]
    Timeout(Duration),
    #[error("plugin closed the connection during the handshake")]
    Closed,
    #[error("handshake transport failed: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    pub magic_cookie: String,
    pub protocol_version: u32,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            magic_cookie: MAGIC_COOKIE_VALUE.to_string(),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl HandshakeConfig {
    /// Environment the host passes to a launched plugin.
    pub fn env(&self) -> [(&'static str, String); 2] {
        [
            (MAGIC_COOKIE_KEY, self.magic_cookie.clone()),
            (PROTOCOL_VERSION_KEY, self.protocol_version.to_string()),
        ]
    }

    /// Plugin side: confirms the process was started by a compatible host.
    pub fn check_env(&self) -> Result<(), HandshakeError> {
        let cookie = std::env::var(MAGIC_COOKIE_KEY).map_err(|_| HandshakeError::NotLaunchedByHost)?;
        self.check_cookie(&cookie)
    }

    pub fn hello(&self) -> Frame {
        Frame::Hello {
            magic_cookie: self.magic_cookie.clone(),
            protocol_version: self.protocol_version,
        }
    }

    /// Host side: validates the first frame a plugin wrote.
    pub fn verify(&self, frame: &Frame) -> Result<(), HandshakeError> {
        let Frame::Hello {
            magic_cookie,
            protocol_version,
        } = frame
        else {
            return Err(HandshakeError::UnexpectedFrame(frame.kind()));
        };
        self.check_cookie(magic_cookie)?;
        if *protocol_version != self.protocol_version {
            return Err(HandshakeError::VersionMismatch {
                expected: self.protocol_version,
                actual: *protocol_version,
            });
        }
        Ok(())
    }

    fn check_cookie(&self, cookie: &str) -> Result<(), HandshakeError> {
        if cookie == self.magic_cookie {
            Ok(())
        } else {
            Err(HandshakeError::CookieMismatch)
        }
    }
}
