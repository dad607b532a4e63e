//! Agent authentication and pairing
//!
//! An agent presents a single credential string on `Register`. It is tried
//! first as a durable token, then as a pairing code; anything else is
//! rejected. A successful pairing mints a new identity and pushes its token
//! back to the agent on the same connection.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sha2::{Digest, Sha256};

use rr_core::api::PairingCodeInfo;
use rr_core::time::unix_timestamp;
use rr_core::UserId;
use rr_protocol::{AgentInfo, Message};

use crate::registry::{ConnectionRegistry, TransportHandle};
use crate::store::{AgentRecord, BrokerStore, NewAgent, Redemption, StoreError};

/// Characters used in pairing codes (no 0/O/1/I)
const PAIRING_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of a pairing code
const PAIRING_CODE_LEN: usize = 6;

/// Attempts at finding an unused pairing code before giving up
const PAIRING_CODE_ATTEMPTS: usize = 8;

/// SHA-256 hex digest of a credential token, as stored
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Fresh credential token: 32 random bytes, hex encoded
pub fn generate_token() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Fresh pairing code
pub fn generate_pairing_code() -> String {
    let mut rng = rand::thread_rng();
    (0..PAIRING_CODE_LEN)
        .map(|_| PAIRING_ALPHABET[rng.gen_range(0..PAIRING_ALPHABET.len())] as char)
        .collect()
}

/// Canonical form of a code typed by a person
fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Why a registration was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Neither a known token nor a pairing code
    UnknownCredential,
    /// A pairing code that had expired (and is now gone)
    ExpiredPairingCode,
    /// The store could not be consulted
    StoreUnavailable,
}

/// Result of `register_agent`
#[derive(Debug)]
pub enum RegistrationOutcome {
    /// Known token: connected as an existing identity
    Authenticated(AgentRecord),
    /// Pairing code redeemed: a new identity was minted and its token pushed
    Paired(AgentRecord),
    /// Refused; the connection has been closed
    Rejected(RejectReason),
}

/// Errors from pairing-code generation
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("device limit reached ({limit} devices per user)")]
    LimitReached { limit: u32 },

    #[error("could not allocate an unused pairing code")]
    Exhausted,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Registration and pairing logic over the store and registry
pub struct IdentityService {
    store: BrokerStore,
    registry: Arc<ConnectionRegistry>,
    pairing_code_ttl: Duration,
    max_agents_per_user: u32,
}

impl IdentityService {
    pub fn new(
        store: BrokerStore,
        registry: Arc<ConnectionRegistry>,
        pairing_code_ttl: Duration,
        max_agents_per_user: u32,
    ) -> Self {
        Self {
            store,
            registry,
            pairing_code_ttl,
            max_agents_per_user,
        }
    }

    /// Authenticate or pair the agent on `handle`
    ///
    /// On success the agent is in the registry under its identity. On
    /// rejection the connection is closed and nothing is sent to the peer.
    pub async fn register_agent(
        &self,
        credential: &str,
        info: AgentInfo,
        handle: &TransportHandle,
    ) -> RegistrationOutcome {
        let outcome = match self.resolve_credential(credential, &info, handle).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Registration on {} failed: {}", handle.id(), e);
                RegistrationOutcome::Rejected(RejectReason::StoreUnavailable)
            }
        };

        if let RegistrationOutcome::Rejected(reason) = &outcome {
            tracing::warn!("Rejected registration on {}: {:?}", handle.id(), reason);
            handle.close();
        }
        outcome
    }

    async fn resolve_credential(
        &self,
        credential: &str,
        info: &AgentInfo,
        handle: &TransportHandle,
    ) -> Result<RegistrationOutcome, StoreError> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Ok(RegistrationOutcome::Rejected(RejectReason::UnknownCredential));
        }

        // 1. Durable token
        if let Some(record) = self
            .store
            .find_agent_by_token_hash(&hash_token(credential))
            .await?
        {
            tracing::info!(
                "Agent {} ({}) authenticated",
                record.agent_id,
                record.display_name()
            );
            self.registry
                .set_connected(record.id(), handle.clone(), info.clone(), Some(record.owner()));
            return Ok(RegistrationOutcome::Authenticated(record));
        }

        // 2. Pairing code
        let token = generate_token();
        let new_agent = NewAgent {
            agent_id: uuid::Uuid::new_v4().simple().to_string(),
            token_hash: hash_token(&token),
            machine_name: info.machine_name.clone(),
            friendly_name: info.friendly_name.clone(),
        };

        let redemption = self
            .store
            .redeem_pairing_ticket(&normalize_code(credential), &new_agent, unix_timestamp())
            .await?;

        match redemption {
            Redemption::Redeemed(record) => {
                tracing::info!(
                    "Paired new agent {} ({}) for user {}",
                    record.agent_id,
                    record.display_name(),
                    record.owner_user_id
                );
                self.registry
                    .set_connected(record.id(), handle.clone(), info.clone(), Some(record.owner()));

                let push = Message::PushCredential {
                    agent_id: record.agent_id.clone(),
                    token,
                };
                if let Err(e) = handle.send(push).await {
                    // The identity exists; the agent will have to pair again
                    tracing::warn!("Could not push credential to {}: {}", record.agent_id, e);
                }
                Ok(RegistrationOutcome::Paired(record))
            }
            Redemption::Expired => Ok(RegistrationOutcome::Rejected(
                RejectReason::ExpiredPairingCode,
            )),
            // 3. Neither
            Redemption::Unknown => Ok(RegistrationOutcome::Rejected(
                RejectReason::UnknownCredential,
            )),
        }
    }

    /// Issue a pairing code for `owner`
    ///
    /// Refused once the user owns `max_agents_per_user` agents.
    pub async fn create_pairing_code(&self, owner: UserId) -> Result<PairingCodeInfo, PairingError> {
        let owned = self.store.count_agents_for_owner(owner).await?;
        if owned >= i64::from(self.max_agents_per_user) {
            return Err(PairingError::LimitReached {
                limit: self.max_agents_per_user,
            });
        }

        let expires_at = unix_timestamp() + self.pairing_code_ttl.as_secs() as i64;

        for _ in 0..PAIRING_CODE_ATTEMPTS {
            let code = generate_pairing_code();
            match self.store.create_pairing_ticket(&code, owner, expires_at).await {
                Ok(ticket) => {
                    tracing::info!("Issued pairing code for user {}", owner);
                    return Ok(PairingCodeInfo {
                        code: ticket.code,
                        expires_at: ticket.expires_at,
                    });
                }
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(PairingError::Exhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::test_handle;

    async fn service() -> (IdentityService, BrokerStore, Arc<ConnectionRegistry>) {
        let store = BrokerStore::open_in_memory().await.unwrap();
        let registry = Arc::new(ConnectionRegistry::new());
        let service = IdentityService::new(
            store.clone(),
            registry.clone(),
            Duration::from_secs(600),
            10,
        );
        (service, store, registry)
    }

    #[test]
    fn test_pairing_code_shape() {
        for _ in 0..100 {
            let code = generate_pairing_code();
            assert_eq!(code.len(), 6);
            assert!(code.bytes().all(|b| PAIRING_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn test_token_hash_is_stable_hex() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert_eq!(hash_token(&token), hash_token(&token));
        assert_ne!(hash_token(&token), token);
        assert_eq!(hash_token(&token).len(), 64);
    }

    #[tokio::test]
    async fn test_pairing_then_token_reconnect() {
        let (service, store, registry) = service().await;
        let user = UserId::new(7);
        let code = service.create_pairing_code(user).await.unwrap();

        let (handle, mut rx) = test_handle();
        let outcome = service
            .register_agent(&code.code.to_lowercase(), AgentInfo::new("OFFICE-PC"), &handle)
            .await;
        let record = match outcome {
            RegistrationOutcome::Paired(record) => record,
            other => panic!("expected pairing, got {:?}", other),
        };
        assert_eq!(record.owner(), user);
        assert!(store.get_pairing_ticket(&code.code).await.unwrap().is_none());

        let token = match rx.recv().await {
            Some(Message::PushCredential { agent_id, token }) => {
                assert_eq!(agent_id, record.agent_id);
                token
            }
            other => panic!("expected PushCredential, got {:?}", other),
        };
        assert!(registry.get_agent(&record.id()).unwrap().is_online);

        // Reconnect with the pushed token
        let (second, _rx2) = test_handle();
        let outcome = service
            .register_agent(&token, AgentInfo::new("OFFICE-PC"), &second)
            .await;
        assert!(matches!(outcome, RegistrationOutcome::Authenticated(ref r) if r.agent_id == record.agent_id));
        assert_eq!(registry.len(), 1);
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_unknown_credential_is_rejected_and_closed() {
        let (service, store, registry) = service().await;
        let (handle, mut rx) = test_handle();

        let outcome = service
            .register_agent("not-a-token", AgentInfo::new("pc"), &handle)
            .await;
        assert!(matches!(
            outcome,
            RegistrationOutcome::Rejected(RejectReason::UnknownCredential)
        ));
        assert!(handle.is_closed());
        assert!(rx.try_recv().is_err());
        assert!(registry.is_empty());
        assert_eq!(store.count_agents_for_owner(UserId::new(1)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_code_is_rejected_and_consumed() {
        let (service, store, _registry) = service().await;
        store
            .create_pairing_ticket("ABC234", UserId::new(1), unix_timestamp() - 1)
            .await
            .unwrap();

        let (handle, _rx) = test_handle();
        let outcome = service
            .register_agent("ABC234", AgentInfo::new("pc"), &handle)
            .await;
        assert!(matches!(
            outcome,
            RegistrationOutcome::Rejected(RejectReason::ExpiredPairingCode)
        ));
        assert!(store.get_pairing_ticket("ABC234").await.unwrap().is_none());
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_concurrent_redemption_has_one_winner() {
        let (service, store, registry) = service().await;
        let service = Arc::new(service);
        let code = service.create_pairing_code(UserId::new(3)).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..2 {
            let service = service.clone();
            let code = code.code.clone();
            tasks.push(tokio::spawn(async move {
                let (handle, _rx) = test_handle();
                service
                    .register_agent(&code, AgentInfo::new(format!("pc-{}", i)), &handle)
                    .await
            }));
        }

        let mut paired = 0;
        let mut rejected = 0;
        for task in tasks {
            match task.await.unwrap() {
                RegistrationOutcome::Paired(_) => paired += 1,
                RegistrationOutcome::Rejected(RejectReason::UnknownCredential) => rejected += 1,
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!((paired, rejected), (1, 1));
        assert_eq!(store.count_agents_for_owner(UserId::new(3)).await.unwrap(), 1);
        assert!(store.get_pairing_ticket(&code.code).await.unwrap().is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_pairing_cap() {
        let store = BrokerStore::open_in_memory().await.unwrap();
        let registry = Arc::new(ConnectionRegistry::new());
        let service = IdentityService::new(store.clone(), registry, Duration::from_secs(600), 1);
        let user = UserId::new(9);

        store
            .insert_agent(
                &NewAgent {
                    agent_id: "agent-1".to_string(),
                    token_hash: hash_token("t1"),
                    machine_name: "pc".to_string(),
                    friendly_name: None,
                },
                user,
            )
            .await
            .unwrap();

        assert!(matches!(
            service.create_pairing_code(user).await,
            Err(PairingError::LimitReached { limit: 1 })
        ));
        assert!(service.create_pairing_code(UserId::new(10)).await.is_ok());
    }
}
