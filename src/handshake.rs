//! Handshake messages. A handshake establishes both sides' connection ids and proves that each
//!  side holds the private key for the public key it presents.
//!
//! *HANDSHAKE_REQUEST*
//!
//! Sent by the initiator (repeatedly, until accepted or timed out). The signature covers a fixed
//!  tag and the initiator's freshly generated connection id.
//!
//! ```ascii
//!  0: initiator connection id (u32)
//!  4: initiator public key (32 bytes)
//! 36: signature over "hs-req" || initiator id (64 bytes)
//! ```
//!
//! *HANDSHAKE_ACCEPT*
//!
//! Sent in reply to a request. The signature covers the acceptor's id *and* the initiator's id,
//!  binding the acceptance to this particular request so that it can not be replayed for a
//!  different connection attempt.
//!
//! ```ascii
//!  0: acceptor connection id (u32)
//!  4: acceptor public key (32 bytes)
//! 36: signature over "hs-acc" || acceptor id || initiator id (64 bytes)
//! ```

use bytes::{Buf, BufMut, BytesMut};
use crate::identity::{Identity, PublicKey, Signature};
use crate::packet::ConnectionId;

const REQUEST_TAG: &[u8] = b"hs-req";
const ACCEPT_TAG: &[u8] = b"hs-acc";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HandshakeRequest {
    pub initiator_id: ConnectionId,
    pub public_key: PublicKey,
    pub signature: Signature,
}

impl HandshakeRequest {
    pub const SERIALIZED_LEN: usize = size_of::<u32>() + PublicKey::LEN + Signature::LEN;

    pub fn new(identity: &Identity, initiator_id: ConnectionId) -> HandshakeRequest {
        HandshakeRequest {
            initiator_id,
            public_key: identity.public_key(),
            signature: identity.sign(&Self::signed_content(initiator_id)),
        }
    }

    fn signed_content(initiator_id: ConnectionId) -> Vec<u8> {
        let mut content = REQUEST_TAG.to_vec();
        content.extend_from_slice(&initiator_id.to_raw().to_be_bytes());
        content
    }

    /// checks that the request was signed with the private key matching its public key
    #[must_use]
    pub fn is_authentic(&self) -> bool {
        self.public_key.verify(&Self::signed_content(self.initiator_id), &self.signature)
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.initiator_id.to_raw());
        buf.put_slice(self.public_key.as_bytes());
        buf.put_slice(&self.signature.0);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<HandshakeRequest> {
        let initiator_id = ConnectionId::from_raw(buf.try_get_u32()?);
        let public_key = try_get_public_key(buf)?;
        let signature = try_get_signature(buf)?;
        Ok(HandshakeRequest { initiator_id, public_key, signature })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HandshakeAccept {
    pub acceptor_id: ConnectionId,
    pub public_key: PublicKey,
    pub signature: Signature,
}

impl HandshakeAccept {
    pub const SERIALIZED_LEN: usize = size_of::<u32>() + PublicKey::LEN + Signature::LEN;

    pub fn new(identity: &Identity, acceptor_id: ConnectionId, initiator_id: ConnectionId) -> HandshakeAccept {
        HandshakeAccept {
            acceptor_id,
            public_key: identity.public_key(),
            signature: identity.sign(&Self::signed_content(acceptor_id, initiator_id)),
        }
    }

    fn signed_content(acceptor_id: ConnectionId, initiator_id: ConnectionId) -> Vec<u8> {
        let mut content = ACCEPT_TAG.to_vec();
        content.extend_from_slice(&acceptor_id.to_raw().to_be_bytes());
        content.extend_from_slice(&initiator_id.to_raw().to_be_bytes());
        content
    }

    /// checks the signature, which must be for the request with `initiator_id`
    #[must_use]
    pub fn is_authentic(&self, initiator_id: ConnectionId) -> bool {
        self.public_key.verify(&Self::signed_content(self.acceptor_id, initiator_id), &self.signature)
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.acceptor_id.to_raw());
        buf.put_slice(self.public_key.as_bytes());
        buf.put_slice(&self.signature.0);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<HandshakeAccept> {
        let acceptor_id = ConnectionId::from_raw(buf.try_get_u32()?);
        let public_key = try_get_public_key(buf)?;
        let signature = try_get_signature(buf)?;
        Ok(HandshakeAccept { acceptor_id, public_key, signature })
    }
}

fn try_get_public_key(buf: &mut impl Buf) -> anyhow::Result<PublicKey> {
    let mut raw = [0u8; PublicKey::LEN];
    buf.try_copy_to_slice(&mut raw)?;
    Ok(PublicKey(raw))
}

fn try_get_signature(buf: &mut impl Buf) -> anyhow::Result<Signature> {
    let mut raw = [0u8; Signature::LEN];
    buf.try_copy_to_slice(&mut raw)?;
    Ok(Signature(raw))
}
