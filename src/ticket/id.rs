use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{RngCore, rngs::OsRng};
use std::sync::atomic::{AtomicU64, Ordering};

use super::TicketKind;
use crate::error::CreationError;

pub const DEFAULT_RANDOM_LENGTH: usize = 40;
pub const MIN_RANDOM_LENGTH: usize = 16;

/// Generates ticket ids of the form `PREFIX-counter-random[-suffix]`.
///
/// The random part uses `[A-Za-z0-9_.]`, so splitting on `-` always yields
/// the same fields.
///
/// The random part is drawn from the OS CSPRNG and is what makes ids
/// unguessable; the counter only helps when reading logs. The optional suffix
/// identifies the issuing node.
#[derive(Debug)]
pub struct TicketIdGenerator {
    random_length: usize,
    suffix: Option<String>,
    counter: AtomicU64,
}

impl Default for TicketIdGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_RANDOM_LENGTH)
    }
}

impl TicketIdGenerator {
    /// Lengths below [`MIN_RANDOM_LENGTH`] are raised to it.
    #[must_use]
    pub fn new(random_length: usize) -> Self {
        Self {
            random_length: random_length.max(MIN_RANDOM_LENGTH),
            suffix: None,
            counter: AtomicU64::new(0),
        }
    }

    /// Append a node suffix. Characters outside `[A-Za-z0-9.]` are dropped.
    #[must_use]
    pub fn with_suffix(mut self, suffix: &str) -> Self {
        let cleaned: String = suffix
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '.')
            .collect();
        self.suffix = (!cleaned.is_empty()).then_some(cleaned);
        self
    }

    #[must_use]
    pub fn random_length(&self) -> usize {
        self.random_length
    }

    /// # Errors
    ///
    /// Returns `CreationError::IdGeneration` when the OS random source fails.
    pub fn generate(&self, kind: TicketKind) -> Result<String, CreationError> {
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed) + 1;

        let mut bytes = vec![0_u8; self.random_length.div_ceil(4) * 3];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|err| CreationError::IdGeneration(err.to_string()))?;
        // `-` separates id fields, so it cannot appear in the random part.
        let mut random = URL_SAFE_NO_PAD.encode(&bytes).replace('-', ".");
        random.truncate(self.random_length);

        let mut id = format!("{}-{sequence}-{random}", kind.prefix());
        if let Some(suffix) = &self.suffix {
            id.push('-');
            id.push_str(suffix);
        }
        Ok(id)
    }
}
