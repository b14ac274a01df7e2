//! Connection handshake: version exchange and bearer-token authentication.
//!
//! Sequence: client sends `Hello`, server answers `ServerHello`, client
//! sends `Auth`, server answers `AuthOk` or `AuthFail` and closes on
//! failure. Session traffic starts only after `AuthOk`.

use courier_core::messages::{
    AuthOkPayload, AuthPayload, Envelope, HelloPayload, MsgType, Payload, ReasonPayload,
    ServerHelloPayload,
};
use courier_core::{verify_token, CourierError, CourierResult, PROTOCOL_VERSION};
use std::time::Duration;

/// The whole handshake must finish within this window.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Reject clients speaking a different protocol version.
pub fn check_version(hello: &HelloPayload) -> CourierResult<()> {
    if hello.version != PROTOCOL_VERSION {
        return Err(CourierError::Auth(format!(
            "protocol version mismatch: client {}, server {}",
            hello.version, PROTOCOL_VERSION
        )));
    }
    Ok(())
}

/// Verify the bearer token against the identity it claims.
pub fn verify_auth(secret: &[u8], auth: &AuthPayload) -> CourierResult<()> {
    verify_token(secret, &auth.identity, &auth.token)
}

pub fn build_server_hello() -> Envelope {
    Envelope {
        msg_type: MsgType::ServerHello,
        payload: Payload::ServerHello(ServerHelloPayload {
            version: PROTOCOL_VERSION.to_string(),
        }),
    }
}

pub fn build_auth_ok(identity: &str, connection_id: &str) -> Envelope {
    Envelope {
        msg_type: MsgType::AuthOk,
        payload: Payload::AuthOk(AuthOkPayload {
            identity: identity.to_string(),
            connection_id: connection_id.to_string(),
        }),
    }
}

pub fn build_auth_fail(reason: &str) -> Envelope {
    Envelope {
        msg_type: MsgType::AuthFail,
        payload: Payload::Reason(ReasonPayload {
            reason: reason.to_string(),
        }),
    }
}

/// Fresh random connection id, 16 bytes as hex.
pub fn generate_connection_id() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}
