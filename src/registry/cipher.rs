//! At-rest protection for stored tickets.
//!
//! With a [`TicketCipher`] configured, the registry never hands a readable
//! ticket to its store: ids become SHA-512 digests, and the ticket itself is
//! serialized and sealed with ChaCha20-Poly1305 into an
//! [`EncodedTicket`]. The digested id is the associated data, so a sealed
//! payload copied under another key does not open.

use anyhow::{Context, anyhow};
use base64::{Engine, engine::general_purpose::STANDARD};
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::{RngCore, rngs::OsRng};
use secrecy::{ExposeSecret, SecretSlice};
use sha2::{Digest, Sha512};
use std::fmt;
use std::sync::Arc;

use super::store::StoreError;
use crate::ticket::{EncodedTicket, Ticket};

pub const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;

#[derive(Clone)]
pub struct TicketCipher {
    key: Arc<SecretSlice<u8>>,
}

impl fmt::Debug for TicketCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketCipher").finish_non_exhaustive()
    }
}

impl TicketCipher {
    /// # Errors
    ///
    /// Returns an error unless `key` is exactly [`KEY_LENGTH`] bytes.
    pub fn new(key: &[u8]) -> anyhow::Result<Self> {
        if key.len() != KEY_LENGTH {
            return Err(anyhow!(
                "ticket registry key must be {KEY_LENGTH} bytes, got {}",
                key.len()
            ));
        }
        Ok(Self {
            key: Arc::new(SecretSlice::from(key.to_vec())),
        })
    }

    /// Key given as standard base64, the form it takes in configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid base64 or a key of the wrong length.
    pub fn from_base64(encoded: &str) -> anyhow::Result<Self> {
        let key = STANDARD
            .decode(encoded.trim())
            .context("ticket registry key is not valid base64")?;
        Self::new(&key)
    }

    /// Storage id for a ticket id: lowercase hex SHA-512.
    #[must_use]
    pub fn digest_id(&self, id: &str) -> String {
        hex::encode(Sha512::digest(id.as_bytes()))
    }

    /// Seal `ticket` for storage.
    ///
    /// # Errors
    ///
    /// `Corrupt` when the ticket cannot be serialized, `Permanent` when
    /// encryption fails.
    pub fn encode(&self, ticket: &Ticket) -> Result<Ticket, StoreError> {
        let id = self.digest_id(ticket.id());
        let plaintext = serde_json::to_vec(ticket)?;
        let sealed = self.seal(&plaintext, id.as_bytes())?;
        let parent = ticket.parent_id().map(|parent| self.digest_id(parent));
        Ok(Ticket::Encoded(EncodedTicket::seal(
            ticket,
            id,
            parent,
            STANDARD.encode(sealed),
        )))
    }

    /// Open a stored ticket. The version comes from the stored record, which
    /// is the one compare-and-swap checks.
    ///
    /// # Errors
    ///
    /// `Permanent` for a ticket that is not sealed or does not open under
    /// this key, `Corrupt` when the opened payload is not a ticket.
    pub fn decode(&self, stored: &Ticket) -> Result<Ticket, StoreError> {
        let Some(encoded) = stored.as_encoded() else {
            return Err(StoreError::Permanent(anyhow!(
                "stored ticket {} is not encrypted",
                stored.id()
            )));
        };
        let sealed = STANDARD
            .decode(encoded.payload())
            .map_err(|err| StoreError::Permanent(anyhow::Error::new(err).context("sealed ticket is not base64")))?;
        let plaintext = self.open(&sealed, stored.id().as_bytes())?;
        let mut ticket: Ticket = serde_json::from_slice(&plaintext)?;
        ticket.state_mut().set_version(stored.version());
        Ok(ticket)
    }

    /// Returns `nonce (12 bytes) || ciphertext`.
    #[allow(deprecated)]
    fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, StoreError> {
        let cipher = ChaCha20Poly1305::new_from_slice(self.key.expose_secret())
            .map_err(|err| StoreError::Permanent(anyhow!("invalid ticket key: {err}")))?;

        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        OsRng
            .try_fill_bytes(&mut nonce_bytes)
            .map_err(|err| StoreError::Permanent(anyhow!("failed to generate nonce: {err}")))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, Payload { msg: plaintext, aad })
            .map_err(|err| StoreError::Permanent(anyhow!("ticket encryption failed: {err}")))?;

        let mut sealed = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    #[allow(deprecated)]
    fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, StoreError> {
        if sealed.len() < NONCE_LENGTH {
            return Err(StoreError::Permanent(anyhow!("sealed ticket is truncated")));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LENGTH);
        let cipher = ChaCha20Poly1305::new_from_slice(self.key.expose_secret())
            .map_err(|err| StoreError::Permanent(anyhow!("invalid ticket key: {err}")))?;
        cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|err| StoreError::Permanent(anyhow!("ticket decryption failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::{ExpirationPolicy, Service, ServiceTicket, TicketKind, TicketState};
    use chrono::Utc;
    use std::time::Duration;

    fn st() -> Ticket {
        Ticket::Service(ServiceTicket::new(
            TicketState::new(
                "ST-1-abc",
                ExpirationPolicy::multi_use(1, Duration::from_secs(10)),
                Utc::now(),
            ),
            "TGT-1-abc",
            Service::new("https://app.example.org"),
            true,
        ))
    }

    fn cipher(byte: u8) -> TicketCipher {
        let Ok(cipher) = TicketCipher::new(&[byte; KEY_LENGTH]) else {
            panic!("valid key rejected");
        };
        cipher
    }

    #[test]
    fn key_length_is_enforced() {
        assert!(TicketCipher::new(&[0; 16]).is_err());
        assert!(TicketCipher::from_base64("not base64!").is_err());
        let encoded = STANDARD.encode([7_u8; KEY_LENGTH]);
        assert!(TicketCipher::from_base64(&encoded).is_ok());
    }

    #[test]
    fn encoded_ticket_hides_ids_and_content() {
        let cipher = cipher(1);
        let ticket = st();
        let Ok(encoded) = cipher.encode(&ticket) else {
            panic!("encode failed");
        };

        assert_eq!(encoded.id(), cipher.digest_id("ST-1-abc"));
        assert_eq!(encoded.id().len(), 128);
        assert_eq!(encoded.parent_id(), Some(cipher.digest_id("TGT-1-abc").as_str()));
        assert_eq!(encoded.kind(), TicketKind::Service);
        assert_eq!(encoded.expires_at(), ticket.expires_at());

        let json = serde_json::to_string(&encoded).unwrap_or_default();
        assert!(json.contains("\"kind\":\"encoded\""));
        assert!(!json.contains("app.example.org"));
        assert!(!json.contains("TGT-1-abc"));

        assert_eq!(cipher.decode(&encoded).ok(), Some(ticket));
    }

    #[test]
    fn decode_takes_version_from_stored_record() {
        let cipher = cipher(1);
        let Ok(mut encoded) = cipher.encode(&st()) else {
            panic!("encode failed");
        };
        encoded.state_mut().set_version(9);
        assert!(cipher.decode(&encoded).is_ok_and(|t| t.version() == 9));
    }

    #[test]
    fn wrong_key_or_moved_payload_does_not_open() {
        let Ok(encoded) = cipher(1).encode(&st()) else {
            panic!("encode failed");
        };
        assert!(matches!(cipher(2).decode(&encoded), Err(StoreError::Permanent(_))));

        let Some(sealed) = encoded.as_encoded() else {
            panic!("not encoded");
        };
        let moved = Ticket::Encoded(EncodedTicket::seal(
            &st(),
            cipher(1).digest_id("ST-2-other"),
            None,
            sealed.payload().to_string(),
        ));
        assert!(matches!(cipher(1).decode(&moved), Err(StoreError::Permanent(_))));
    }

    #[test]
    fn plain_ticket_is_refused() {
        assert!(matches!(cipher(1).decode(&st()), Err(StoreError::Permanent(_))));
    }
}
