// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent-token and job-token factory.
//!
//! Agent tokens (`tmat_` prefix) are opaque random secrets handed out
//! once at creation; only a SHA-256 digest is persisted. Job tokens
//! (`tmjt_` prefix) are stateless: the job spec string signed with
//! HMAC-SHA256 under a process-wide secret, so resolving a valid token
//! always yields the spec it was minted for.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::job::JobSpec;
use crate::pool::PoolId;

type HmacSha256 = Hmac<Sha256>;

/// Identifier of an agent token.
pub type TokenId = Uuid;

/// Prefix of agent token secrets.
pub const AGENT_TOKEN_PREFIX: &str = "tmat_";

/// Prefix of job tokens.
pub const JOB_TOKEN_PREFIX: &str = "tmjt_";

/// Metadata of an agent token. The secret itself is never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentToken {
    /// Unique token identifier.
    pub id: TokenId,
    /// Human-readable description of what the token is for.
    pub description: String,
    /// Pool agents registering with this token join.
    pub agent_pool_id: PoolId,
    /// When the token was created.
    pub created_at: DateTime<Utc>,
}

/// Options for creating an agent token.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateAgentTokenOptions {
    /// Human-readable description of what the token is for.
    pub description: String,
}

/// Mints and validates agent tokens and per-job tokens.
#[derive(Clone)]
pub struct TokenFactory {
    job_token_secret: Vec<u8>,
}

impl std::fmt::Debug for TokenFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenFactory").finish_non_exhaustive()
    }
}

impl TokenFactory {
    /// Create a factory signing job tokens with the given secret.
    pub fn new(job_token_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            job_token_secret: job_token_secret.into(),
        }
    }

    /// Mint a new agent token for a pool. Returns the token metadata and
    /// the plaintext secret, which is shown exactly once.
    pub fn new_agent_token(
        &self,
        pool_id: PoolId,
        opts: CreateAgentTokenOptions,
    ) -> Result<(AgentToken, String)> {
        if opts.description.trim().is_empty() {
            return Err(CoreError::InvalidArgument {
                field: "description",
                message: "token description must not be empty".to_string(),
            });
        }
        let mut secret = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut secret);
        let plaintext = format!("{}{}", AGENT_TOKEN_PREFIX, URL_SAFE_NO_PAD.encode(secret));
        let token = AgentToken {
            id: Uuid::new_v4(),
            description: opts.description,
            agent_pool_id: pool_id,
            created_at: Utc::now(),
        };
        Ok((token, plaintext))
    }

    /// Mint a job token authorizing the given job to report its outcome
    /// and stream logs.
    pub fn mint_job_token(&self, spec: &JobSpec) -> Result<String> {
        let payload = spec.to_string();
        let mut mac = HmacSha256::new_from_slice(&self.job_token_secret)
            .map_err(|_| CoreError::InvalidToken)?;
        mac.update(payload.as_bytes());
        let tag = mac.finalize().into_bytes();
        Ok(format!(
            "{}{}.{}",
            JOB_TOKEN_PREFIX,
            URL_SAFE_NO_PAD.encode(payload.as_bytes()),
            URL_SAFE_NO_PAD.encode(tag),
        ))
    }

    /// Validate a job token and return the spec it was minted for.
    pub fn resolve_job_token(&self, token: &str) -> Result<JobSpec> {
        let rest = token
            .strip_prefix(JOB_TOKEN_PREFIX)
            .ok_or(CoreError::InvalidToken)?;
        let (payload, tag) = rest.split_once('.').ok_or(CoreError::InvalidToken)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| CoreError::InvalidToken)?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag)
            .map_err(|_| CoreError::InvalidToken)?;
        let mut mac = HmacSha256::new_from_slice(&self.job_token_secret)
            .map_err(|_| CoreError::InvalidToken)?;
        mac.update(&payload);
        mac.verify_slice(&tag).map_err(|_| CoreError::InvalidToken)?;
        let payload = String::from_utf8(payload).map_err(|_| CoreError::InvalidToken)?;
        payload.parse().map_err(|_| CoreError::InvalidToken)
    }
}

/// Digest of an agent token secret as persisted in the store.
pub fn hash_secret(secret: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(secret.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::Phase;

    fn factory() -> TokenFactory {
        TokenFactory::new("test-signing-secret")
    }

    fn spec() -> JobSpec {
        JobSpec {
            run_id: Uuid::new_v4(),
            phase: Phase::Plan,
        }
    }

    #[test]
    fn job_token_round_trip() {
        let factory = factory();
        let spec = spec();
        let token = factory.mint_job_token(&spec).unwrap();
        assert!(token.starts_with(JOB_TOKEN_PREFIX));
        assert_eq!(factory.resolve_job_token(&token).unwrap(), spec);
    }

    #[test]
    fn tampered_job_token_is_rejected() {
        let factory = factory();
        let token = factory.mint_job_token(&spec()).unwrap();

        let mut forged = token.clone();
        forged.truncate(forged.len() - 2);
        assert!(factory.resolve_job_token(&forged).is_err());

        // re-signing with a different secret must not validate
        let other = TokenFactory::new("other-secret");
        let foreign = other.mint_job_token(&spec()).unwrap();
        assert!(factory.resolve_job_token(&foreign).is_err());

        assert!(factory.resolve_job_token("tmjt_garbage").is_err());
        assert!(factory.resolve_job_token("tmat_not-a-job-token").is_err());
    }

    #[test]
    fn agent_token_secret_is_prefixed_and_unique() {
        let factory = factory();
        let pool_id = Uuid::new_v4();
        let opts = CreateAgentTokenOptions {
            description: "ci".to_string(),
        };
        let (token, secret) = factory.new_agent_token(pool_id, opts.clone()).unwrap();
        assert!(secret.starts_with(AGENT_TOKEN_PREFIX));
        assert_eq!(token.agent_pool_id, pool_id);

        let (_, other) = factory.new_agent_token(pool_id, opts).unwrap();
        assert_ne!(secret, other);
        assert_ne!(hash_secret(&secret), hash_secret(&other));
    }

    #[test]
    fn agent_token_requires_description() {
        let err = factory().new_agent_token(
            Uuid::new_v4(),
            CreateAgentTokenOptions {
                description: " ".to_string(),
            },
        );
        assert!(err.is_err());
    }

    #[test]
    fn secret_hash_is_stable() {
        assert_eq!(hash_secret("abc"), hash_secret("abc"));
        assert_ne!(hash_secret("abc"), hash_secret("abd"));
    }
}
