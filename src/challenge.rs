//! Challenge-response handshake over an established stream.
//!
//! The handshake runs before any application data flows. Frames are tiny:
//! a little-endian u16 total length (including the two prefix bytes)
//! followed by a UTF-8 JSON payload of at most [`MAX_PAYLOAD`] bytes. Each
//! exchange is correlated by a random hex identifier so a stray or replayed
//! frame cannot complete someone else's handshake.
//!
//! The issuing side sends a request, waits for the peer's response, compares
//! it to the expected value and, only on a match, confirms with a
//! `ChallengeSuccessful` frame. The responding side does the mirror image
//! and treats a missing confirmation as failure.

use crate::error::{Error, Result};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Largest JSON payload a handshake frame may carry.
pub const MAX_PAYLOAD: usize = 1024;
/// Largest complete frame: payload plus the two-byte length prefix.
pub const MAX_FRAME: usize = MAX_PAYLOAD + 2;
/// Handshake deadline applied when the configuration does not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengeType {
    ChallengeRequested,
    ChallengeSuccessful,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChallengeRequest {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "ChallengeType")]
    pub challenge_type: ChallengeType,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChallengeResponse {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Challenge")]
    pub challenge: String,
}

/// Serialize a handshake message into a length-prefixed frame.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::FrameTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD,
        });
    }
    let total = (payload.len() + 2) as u16;
    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.extend_from_slice(&total.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Read one handshake frame and decode its payload.
///
/// Handshake frames are small enough to arrive in a single segment, and both
/// sides stop-and-wait, so a frame is expected to be delivered by one read.
/// A read that does not cover exactly the declared length is a protocol
/// violation, not something to reassemble.
pub async fn read_frame_once<S, T>(stream: &mut S) -> Result<T>
where
    S: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut buf = [0u8; MAX_FRAME];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed during handshake",
        )));
    }
    if n < 2 {
        return Err(Error::FrameLengthMismatch {
            declared: 0,
            actual: n,
        });
    }
    let declared = u16::from_le_bytes([buf[0], buf[1]]) as usize;
    if declared != n {
        return Err(Error::FrameLengthMismatch {
            declared,
            actual: n,
        });
    }
    Ok(serde_json::from_slice(&buf[2..n])?)
}

/// A fresh correlation identifier for one handshake exchange.
pub fn correlation_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Run the issuing side of the handshake.
///
/// Returns `Ok(true)` when the peer produced the expected value (the
/// confirmation frame has then been sent), `Ok(false)` on a well-formed but
/// wrong response (no confirmation is sent). Malformed frames and transport
/// failures surface as errors; an expired deadline is
/// [`Error::ChallengeTimeout`].
pub async fn issue_challenge<S>(stream: &mut S, expected: &str, deadline: Duration) -> Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = correlation_id();
    let request = ChallengeRequest {
        id: id.clone(),
        challenge_type: ChallengeType::ChallengeRequested,
    };
    stream.write_all(&encode_frame(&request)?).await?;
    stream.flush().await?;

    let response: ChallengeResponse = timeout(deadline, read_frame_once(stream))
        .await
        .map_err(|_| Error::ChallengeTimeout)??;

    if response.id != id || response.challenge != expected {
        return Ok(false);
    }

    let confirm = ChallengeRequest {
        id,
        challenge_type: ChallengeType::ChallengeSuccessful,
    };
    stream.write_all(&encode_frame(&confirm)?).await?;
    stream.flush().await?;
    Ok(true)
}

/// Run the responding side of the handshake: wait for the request, answer
/// with `value` and require the confirmation frame.
///
/// `echo_request` reproduces a quirk of older deployments that answered by
/// echoing the request frame instead of sending a response; such an answer
/// can never satisfy the issuing side, so the flag exists only for wire
/// compatibility testing.
pub async fn respond_to_challenge<S>(
    stream: &mut S,
    value: &str,
    deadline: Duration,
    echo_request: bool,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request: ChallengeRequest = timeout(deadline, read_frame_once(stream))
        .await
        .map_err(|_| Error::ChallengeTimeout)??;
    if request.challenge_type != ChallengeType::ChallengeRequested {
        return Err(Error::ChallengeFailed);
    }

    let frame = if echo_request {
        encode_frame(&request)?
    } else {
        encode_frame(&ChallengeResponse {
            id: request.id.clone(),
            challenge: value.to_string(),
        })?
    };
    stream.write_all(&frame).await?;
    stream.flush().await?;

    let confirm: ChallengeRequest = timeout(deadline, read_frame_once(stream))
        .await
        .map_err(|_| Error::ChallengeTimeout)??;
    if confirm.id != request.id || confirm.challenge_type != ChallengeType::ChallengeSuccessful {
        return Err(Error::ChallengeFailed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_length_field_covers_prefix_and_payload() {
        let frame = encode_frame(&ChallengeResponse {
            id: "abc".to_string(),
            challenge: "bob".to_string(),
        })
        .unwrap();
        let declared = u16::from_le_bytes([frame[0], frame[1]]) as usize;
        assert_eq!(declared, frame.len());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let err = encode_frame(&ChallengeResponse {
            id: "x".repeat(2048),
            challenge: String::new(),
        })
        .unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let request = ChallengeRequest {
            id: correlation_id(),
            challenge_type: ChallengeType::ChallengeRequested,
        };
        a.write_all(&encode_frame(&request).unwrap()).await.unwrap();
        let decoded: ChallengeRequest = read_frame_once(&mut b).await.unwrap();
        assert_eq!(decoded.id, request.id);
        assert_eq!(decoded.challenge_type, ChallengeType::ChallengeRequested);
    }

    #[tokio::test]
    async fn matching_response_completes_both_sides() {
        let (mut server, mut client) = tokio::io::duplex(4096);
        let responder = tokio::spawn(async move {
            respond_to_challenge(&mut client, "bob", DEFAULT_TIMEOUT, false).await
        });
        let matched = issue_challenge(&mut server, "bob", DEFAULT_TIMEOUT)
            .await
            .unwrap();
        assert!(matched);
        responder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wrong_value_fails_both_sides() {
        let (mut server, mut client) = tokio::io::duplex(4096);
        let responder = tokio::spawn(async move {
            respond_to_challenge(&mut client, "alice", Duration::from_secs(2), false).await
        });
        let matched = issue_challenge(&mut server, "bob", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(!matched);
        // No confirmation arrives, so the responder times out or errors.
        assert!(responder.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn echoed_request_never_satisfies_the_issuer() {
        let (mut server, mut client) = tokio::io::duplex(4096);
        let responder = tokio::spawn(async move {
            respond_to_challenge(&mut client, "bob", Duration::from_secs(2), true).await
        });
        // The echoed frame decodes as a response with no challenge value, or
        // fails decoding; either way the issuer must not report a match.
        let outcome = issue_challenge(&mut server, "bob", Duration::from_secs(2)).await;
        assert!(!matches!(outcome, Ok(true)));
        assert!(responder.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (mut server, _client) = tokio::io::duplex(4096);
        let err = issue_challenge(&mut server, "bob", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChallengeTimeout));
    }

    #[test]
    fn correlation_ids_are_unique_and_hex() {
        let a = correlation_id();
        let b = correlation_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
    }
}
