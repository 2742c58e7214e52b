//! Authentication metadata and the method-policy seam.
//!
//! The protocol core negotiates *which* method runs and shuttles the
//! opaque round payloads; the method bodies themselves live behind
//! [`AuthPolicy`]. Negotiated metadata is reference-counted because
//! in-flight auth steps may outlive the transition that superseded them.

use crate::error::ProtoError;
use bytes::{BufMut, Bytes, BytesMut};

/// Method id a client sends when it has no preference
pub const METHOD_NEGOTIATE: u32 = 0;
/// Unauthenticated method, accepted inside trusted deployments
pub const METHOD_OPEN: u32 = 1;
/// Challenge/response over a preshared secret
pub const METHOD_PRESHARED: u32 = 2;

/// Negotiated auth state for one connection attempt.
///
/// Created fresh per attempt and replaced wholesale when an existing
/// connection is reused.
#[derive(Debug, Clone)]
pub struct AuthMeta {
    /// Method that completed
    pub method: u32,
    /// Session key material derived by the method, if any
    pub session_key: Option<Bytes>,
}

impl AuthMeta {
    /// Metadata for a connection that has not finished auth
    pub fn unauthenticated() -> Self {
        Self {
            method: METHOD_NEGOTIATE,
            session_key: None,
        }
    }
}

/// One server-side auth round outcome
#[derive(Debug)]
pub enum ServerStep {
    /// Auth finished; reply body goes back in AUTH_DONE
    Done {
        /// Derived session key, if the method produces one
        session_key: Option<Bytes>,
        /// Method-specific completion body
        reply: Bytes,
    },
    /// Another round is needed; body goes back in AUTH_REPLY_MORE
    Challenge {
        /// Method-specific challenge body
        payload: Bytes,
    },
    /// The request failed the method's checks
    Reject {
        /// Human-readable reason, logged and surfaced to the fault funnel
        reason: String,
    },
}

/// Method bodies for the auth sub-protocol.
///
/// Implementations must be deterministic per round: the protocol core may
/// retry a superseded attempt from scratch on a fresh socket.
pub trait AuthPolicy: Send + Sync + 'static {
    /// Methods the accepting side allows, in preference order
    fn accepted_methods(&self) -> Vec<u32>;

    /// Methods the dialing side can attempt, in preference order
    fn client_methods(&self) -> Vec<u32>;

    /// Initial request body for `method`
    fn client_start(&self, method: u32) -> Bytes;

    /// Answer a server challenge
    fn client_continue(&self, method: u32, challenge: &[u8]) -> Result<Bytes, ProtoError>;

    /// Validate the server's completion body and derive the session key
    fn client_finish(&self, method: u32, done: &[u8]) -> Result<AuthMeta, ProtoError>;

    /// Run one server-side round; `round` starts at zero
    fn server_round(&self, method: u32, payload: &[u8], round: u32)
        -> Result<ServerStep, ProtoError>;
}

/// Accept-anything policy for trusted deployments
#[derive(Debug, Default)]
pub struct OpenPolicy;

impl AuthPolicy for OpenPolicy {
    fn accepted_methods(&self) -> Vec<u32> {
        vec![METHOD_OPEN]
    }

    fn client_methods(&self) -> Vec<u32> {
        vec![METHOD_OPEN]
    }

    fn client_start(&self, _method: u32) -> Bytes {
        Bytes::new()
    }

    fn client_continue(&self, _method: u32, _challenge: &[u8]) -> Result<Bytes, ProtoError> {
        Ok(Bytes::new())
    }

    fn client_finish(&self, method: u32, _done: &[u8]) -> Result<AuthMeta, ProtoError> {
        Ok(AuthMeta {
            method,
            session_key: None,
        })
    }

    fn server_round(
        &self,
        _method: u32,
        _payload: &[u8],
        _round: u32,
    ) -> Result<ServerStep, ProtoError> {
        Ok(ServerStep::Done {
            session_key: None,
            reply: Bytes::new(),
        })
    }
}

/// Challenge/response over a preshared secret.
///
/// The proof is a crc digest of secret and nonce; a stand-in for a real
/// authenticator, kept for demos and tests.
#[derive(Debug, Clone)]
pub struct PresharedPolicy {
    secret: Bytes,
}

impl PresharedPolicy {
    /// Policy over the given shared secret
    pub fn new(secret: impl Into<Bytes>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn proof(&self, nonce: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.secret);
        hasher.update(nonce);
        hasher.finalize()
    }

    fn session_key(&self, nonce: &[u8]) -> Bytes {
        let digest = self.proof(nonce) ^ 0xA5A5_A5A5;
        Bytes::copy_from_slice(&digest.to_be_bytes())
    }
}

const NONCE_LEN: usize = 16;

impl AuthPolicy for PresharedPolicy {
    fn accepted_methods(&self) -> Vec<u32> {
        vec![METHOD_PRESHARED]
    }

    fn client_methods(&self) -> Vec<u32> {
        vec![METHOD_PRESHARED]
    }

    fn client_start(&self, _method: u32) -> Bytes {
        Bytes::new()
    }

    fn client_continue(&self, method: u32, challenge: &[u8]) -> Result<Bytes, ProtoError> {
        if method != METHOD_PRESHARED || challenge.len() != NONCE_LEN {
            return Err(ProtoError::AuthRejected("malformed challenge".into()));
        }
        let mut response = BytesMut::with_capacity(NONCE_LEN + 4);
        response.put_slice(challenge);
        response.put_u32(self.proof(challenge));
        Ok(response.freeze())
    }

    fn client_finish(&self, method: u32, done: &[u8]) -> Result<AuthMeta, ProtoError> {
        if done.len() != NONCE_LEN {
            return Err(ProtoError::AuthRejected("malformed completion".into()));
        }
        Ok(AuthMeta {
            method,
            session_key: Some(self.session_key(done)),
        })
    }

    fn server_round(
        &self,
        method: u32,
        payload: &[u8],
        round: u32,
    ) -> Result<ServerStep, ProtoError> {
        if method != METHOD_PRESHARED {
            return Ok(ServerStep::Reject {
                reason: format!("method {} not preshared", method),
            });
        }
        match round {
            0 => {
                let nonce: [u8; NONCE_LEN] = rand::random();
                Ok(ServerStep::Challenge {
                    payload: Bytes::copy_from_slice(&nonce),
                })
            }
            1 => {
                if payload.len() != NONCE_LEN + 4 {
                    return Ok(ServerStep::Reject {
                        reason: "malformed proof".into(),
                    });
                }
                let (nonce, proof) = payload.split_at(NONCE_LEN);
                let expected = self.proof(nonce);
                let got = u32::from_be_bytes([proof[0], proof[1], proof[2], proof[3]]);
                if got != expected {
                    return Ok(ServerStep::Reject {
                        reason: "bad proof".into(),
                    });
                }
                Ok(ServerStep::Done {
                    session_key: Some(self.session_key(nonce)),
                    // Completion body lets the client derive the same key.
                    reply: Bytes::copy_from_slice(nonce),
                })
            }
            _ => Ok(ServerStep::Reject {
                reason: "too many rounds".into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preshared_round_trip() {
        let server = PresharedPolicy::new(&b"cluster-secret"[..]);
        let client = PresharedPolicy::new(&b"cluster-secret"[..]);

        let start = client.client_start(METHOD_PRESHARED);
        let challenge = match server.server_round(METHOD_PRESHARED, &start, 0).unwrap() {
            ServerStep::Challenge { payload } => payload,
            other => panic!("expected challenge, got {:?}", other),
        };

        let response = client.client_continue(METHOD_PRESHARED, &challenge).unwrap();
        let (key, reply) = match server.server_round(METHOD_PRESHARED, &response, 1).unwrap() {
            ServerStep::Done { session_key, reply } => (session_key.unwrap(), reply),
            other => panic!("expected done, got {:?}", other),
        };

        let meta = client.client_finish(METHOD_PRESHARED, &reply).unwrap();
        assert_eq!(meta.session_key.unwrap(), key);
    }

    #[test]
    fn test_preshared_rejects_bad_proof() {
        let server = PresharedPolicy::new(&b"right"[..]);
        let client = PresharedPolicy::new(&b"wrong"[..]);

        let challenge = match server.server_round(METHOD_PRESHARED, &[], 0).unwrap() {
            ServerStep::Challenge { payload } => payload,
            other => panic!("expected challenge, got {:?}", other),
        };
        let response = client.client_continue(METHOD_PRESHARED, &challenge).unwrap();
        assert!(matches!(
            server.server_round(METHOD_PRESHARED, &response, 1).unwrap(),
            ServerStep::Reject { .. }
        ));
    }

    #[test]
    fn test_open_policy_completes_in_one_round() {
        let policy = OpenPolicy;
        assert!(matches!(
            policy.server_round(METHOD_OPEN, &[], 0).unwrap(),
            ServerStep::Done { .. }
        ));
    }
}
