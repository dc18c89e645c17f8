// Identity allocation and validation

use crate::hub::error::HubError;
use crate::hub::registry::{Identity, Registry};

type CandidateSource = Box<dyn Fn() -> Identity + Send + Sync>;

/// Parse a raw identity parameter.
///
/// `None` and the empty string both mean the parameter was not supplied.
pub fn parse_identity(raw: Option<&str>) -> Result<Identity, HubError> {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty());
    let raw = raw.ok_or(HubError::MissingIdentity)?;

    raw.parse::<Identity>()
        .map_err(|e| HubError::InvalidIdentity {
            raw: raw.to_string(),
            reason: e.to_string(),
        })
}

/// Hands out identities, either requested by the caller or generated
pub struct IdentityAllocator {
    max_attempts: usize,
    candidates: CandidateSource,
}

impl IdentityAllocator {
    /// Allocator drawing uniformly random 64-bit candidates
    pub fn new(max_attempts: usize) -> Self {
        Self::with_source(max_attempts, || rand::random::<Identity>())
    }

    /// Allocator drawing candidates from `source`
    pub fn with_source<F>(max_attempts: usize, source: F) -> Self
    where
        F: Fn() -> Identity + Send + Sync + 'static,
    {
        Self {
            max_attempts: max_attempts.max(1),
            candidates: Box::new(source),
        }
    }

    /// Register the requested identity, or a fresh one if none was given
    pub async fn register(
        &self,
        registry: &Registry,
        requested: Option<&str>,
    ) -> Result<Identity, HubError> {
        match requested.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => {
                let identity = parse_identity(Some(raw))?;
                registry.insert(identity).await?;
                Ok(identity)
            }
            None => self.register_random(registry).await,
        }
    }

    async fn register_random(&self, registry: &Registry) -> Result<Identity, HubError> {
        for attempt in 1..=self.max_attempts {
            let candidate = (self.candidates)();
            match registry.insert(candidate).await {
                Ok(()) => return Ok(candidate),
                Err(HubError::IdentityInUse(_)) => {
                    tracing::debug!(
                        "Candidate identity {} collided (attempt {}/{})",
                        candidate,
                        attempt,
                        self.max_attempts
                    );
                }
                Err(e) => return Err(e),
            }
        }

        tracing::error!(
            "No free identity after {} attempts, registry may be corrupt",
            self.max_attempts
        );
        Err(HubError::AllocationExhausted {
            attempts: self.max_attempts,
        })
    }

    /// Confirm an identity is registered and echo it back
    pub async fn identify(
        &self,
        registry: &Registry,
        raw: Option<&str>,
    ) -> Result<Identity, HubError> {
        let identity = parse_identity(raw)?;
        if registry.contains(identity).await {
            Ok(identity)
        } else {
            Err(HubError::NotRegistered(identity))
        }
    }
}
