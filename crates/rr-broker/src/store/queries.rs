//! Database queries for the broker

use rr_core::time::unix_timestamp;
use rr_core::UserId;

use super::db::{BrokerStore, StoreError};
use super::models::{AgentRecord, DeviceSelection, NewAgent, PairingTicket, Redemption};

impl BrokerStore {
    // =========================================================================
    // Agent queries
    // =========================================================================

    /// Look up an identity by the digest of its credential token.
    pub async fn find_agent_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<AgentRecord>, StoreError> {
        let record = sqlx::query_as::<_, AgentRecord>("SELECT * FROM agents WHERE token_hash = ?")
            .bind(token_hash)
            .fetch_optional(self.pool())
            .await?;
        Ok(record)
    }

    /// Get an identity by agent ID.
    pub async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>, StoreError> {
        let record = sqlx::query_as::<_, AgentRecord>("SELECT * FROM agents WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(record)
    }

    /// List a user's agents, oldest first.
    pub async fn list_agents_for_owner(&self, owner: UserId) -> Result<Vec<AgentRecord>, StoreError> {
        let records = sqlx::query_as::<_, AgentRecord>(
            "SELECT * FROM agents WHERE owner_user_id = ? ORDER BY registered_at, agent_id",
        )
        .bind(owner.as_i64())
        .fetch_all(self.pool())
        .await?;
        Ok(records)
    }

    /// Count a user's agents.
    pub async fn count_agents_for_owner(&self, owner: UserId) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM agents WHERE owner_user_id = ?")
            .bind(owner.as_i64())
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }

    /// Insert an identity directly, bypassing pairing (provisioning and tests).
    pub async fn insert_agent(
        &self,
        agent: &NewAgent,
        owner: UserId,
    ) -> Result<AgentRecord, StoreError> {
        let now = unix_timestamp();

        sqlx::query(
            "INSERT INTO agents (agent_id, token_hash, owner_user_id, machine_name, friendly_name, registered_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&agent.agent_id)
        .bind(&agent.token_hash)
        .bind(owner.as_i64())
        .bind(&agent.machine_name)
        .bind(&agent.friendly_name)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(record_from(agent, owner.as_i64(), now))
    }

    /// Change an agent's display name. Returns false if the agent is unknown.
    pub async fn set_friendly_name(
        &self,
        agent_id: &str,
        friendly_name: Option<&str>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE agents SET friendly_name = ? WHERE agent_id = ?")
            .bind(friendly_name)
            .bind(agent_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Pairing ticket queries
    // =========================================================================

    /// Store a new pairing ticket. Fails with `Conflict` if the code is taken.
    pub async fn create_pairing_ticket(
        &self,
        code: &str,
        owner: UserId,
        expires_at: i64,
    ) -> Result<PairingTicket, StoreError> {
        sqlx::query("INSERT INTO pairing_tickets (code, owner_user_id, expires_at) VALUES (?, ?, ?)")
            .bind(code)
            .bind(owner.as_i64())
            .bind(expires_at)
            .execute(self.pool())
            .await?;

        Ok(PairingTicket {
            code: code.to_string(),
            owner_user_id: owner.as_i64(),
            expires_at,
        })
    }

    /// Get a pairing ticket without consuming it.
    pub async fn get_pairing_ticket(&self, code: &str) -> Result<Option<PairingTicket>, StoreError> {
        let ticket =
            sqlx::query_as::<_, PairingTicket>("SELECT * FROM pairing_tickets WHERE code = ?")
                .bind(code)
                .fetch_optional(self.pool())
                .await?;
        Ok(ticket)
    }

    /// Consume a pairing ticket and mint the identity it authorizes.
    ///
    /// The ticket is deleted by the first statement of the transaction, so of
    /// any number of concurrent callers presenting the same code exactly one
    /// sees the row. An expired ticket is deleted as well. The new identity is
    /// committed together with the deletion.
    pub async fn redeem_pairing_ticket(
        &self,
        code: &str,
        agent: &NewAgent,
        now: i64,
    ) -> Result<Redemption, StoreError> {
        let mut tx = self.pool().begin().await?;

        let ticket: Option<(i64, i64)> = sqlx::query_as(
            "DELETE FROM pairing_tickets WHERE code = ? RETURNING owner_user_id, expires_at",
        )
        .bind(code)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((owner_user_id, expires_at)) = ticket else {
            tx.rollback().await?;
            return Ok(Redemption::Unknown);
        };

        if expires_at <= now {
            tx.commit().await?;
            return Ok(Redemption::Expired);
        }

        sqlx::query(
            "INSERT INTO agents (agent_id, token_hash, owner_user_id, machine_name, friendly_name, registered_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&agent.agent_id)
        .bind(&agent.token_hash)
        .bind(owner_user_id)
        .bind(&agent.machine_name)
        .bind(&agent.friendly_name)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Redemption::Redeemed(record_from(agent, owner_user_id, now)))
    }

    /// Delete every ticket that expired at or before `now`.
    pub async fn prune_expired_tickets(&self, now: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM pairing_tickets WHERE expires_at <= ?")
            .bind(now)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Device selection queries
    // =========================================================================

    /// Get the device a user last selected.
    pub async fn get_selection(&self, user: UserId) -> Result<Option<DeviceSelection>, StoreError> {
        let selection = sqlx::query_as::<_, DeviceSelection>(
            "SELECT * FROM device_selections WHERE user_id = ?",
        )
        .bind(user.as_i64())
        .fetch_optional(self.pool())
        .await?;
        Ok(selection)
    }

    /// Record a user's device choice, replacing any earlier one.
    pub async fn upsert_selection(&self, user: UserId, agent_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO device_selections (user_id, agent_id, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(user_id) DO UPDATE SET agent_id = excluded.agent_id, updated_at = excluded.updated_at",
        )
        .bind(user.as_i64())
        .bind(agent_id)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

fn record_from(agent: &NewAgent, owner_user_id: i64, registered_at: i64) -> AgentRecord {
    AgentRecord {
        agent_id: agent.agent_id.clone(),
        token_hash: agent.token_hash.clone(),
        owner_user_id,
        machine_name: agent.machine_name.clone(),
        friendly_name: agent.friendly_name.clone(),
        registered_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn new_agent(id: &str) -> NewAgent {
        NewAgent {
            agent_id: id.to_string(),
            token_hash: format!("hash-{}", id),
            machine_name: format!("host-{}", id),
            friendly_name: None,
        }
    }

    #[tokio::test]
    async fn test_redeem_live_ticket() {
        let store = BrokerStore::open_in_memory().await.unwrap();
        let now = unix_timestamp();
        store
            .create_pairing_ticket("ABC234", UserId::new(7), now + 600)
            .await
            .unwrap();

        let outcome = store
            .redeem_pairing_ticket("ABC234", &new_agent("a1"), now)
            .await
            .unwrap();

        match outcome {
            Redemption::Redeemed(record) => {
                assert_eq!(record.owner(), UserId::new(7));
                assert_eq!(record.agent_id, "a1");
            }
            other => panic!("expected redemption, got {:?}", other),
        }
        assert!(store.get_pairing_ticket("ABC234").await.unwrap().is_none());
        assert!(store.find_agent_by_token_hash("hash-a1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_ticket_is_deleted_on_use() {
        let store = BrokerStore::open_in_memory().await.unwrap();
        let now = unix_timestamp();
        store
            .create_pairing_ticket("OLD234", UserId::new(7), now - 1)
            .await
            .unwrap();

        let outcome = store
            .redeem_pairing_ticket("OLD234", &new_agent("a1"), now)
            .await
            .unwrap();

        assert_eq!(outcome, Redemption::Expired);
        assert!(store.get_pairing_ticket("OLD234").await.unwrap().is_none());
        assert!(store.get_agent("a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_code() {
        let store = BrokerStore::open_in_memory().await.unwrap();
        let outcome = store
            .redeem_pairing_ticket("NOPE23", &new_agent("a1"), unix_timestamp())
            .await
            .unwrap();
        assert_eq!(outcome, Redemption::Unknown);
    }

    #[tokio::test]
    async fn test_concurrent_redemption_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = BrokerStore::open(&dir.path().join("broker.db")).await.unwrap();
        let now = unix_timestamp();
        store
            .create_pairing_ticket("RACE23", UserId::new(1), now + 600)
            .await
            .unwrap();

        let store = Arc::new(store);
        let mut tasks = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store
                    .redeem_pairing_ticket("RACE23", &new_agent(&format!("a{}", i)), now)
                    .await
            }));
        }

        let mut redeemed = 0;
        for task in tasks {
            if let Ok(Redemption::Redeemed(_)) = task.await.unwrap() {
                redeemed += 1;
            }
        }

        assert_eq!(redeemed, 1);
        assert_eq!(store.count_agents_for_owner(UserId::new(1)).await.unwrap(), 1);
        assert!(store.get_pairing_ticket("RACE23").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_code_conflicts() {
        let store = BrokerStore::open_in_memory().await.unwrap();
        let expires = unix_timestamp() + 600;
        store
            .create_pairing_ticket("DUP234", UserId::new(1), expires)
            .await
            .unwrap();

        let second = store
            .create_pairing_ticket("DUP234", UserId::new(2), expires)
            .await;
        assert!(matches!(second, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_selection_is_last_write_wins() {
        let store = BrokerStore::open_in_memory().await.unwrap();
        let user = UserId::new(3);

        assert!(store.get_selection(user).await.unwrap().is_none());

        store.upsert_selection(user, "a1").await.unwrap();
        store.upsert_selection(user, "a2").await.unwrap();

        let selection = store.get_selection(user).await.unwrap().unwrap();
        assert_eq!(selection.agent_id, "a2");
    }

    #[tokio::test]
    async fn test_prune_and_rename() {
        let store = BrokerStore::open_in_memory().await.unwrap();
        let now = unix_timestamp();
        store.create_pairing_ticket("OLD234", UserId::new(1), now - 5).await.unwrap();
        store.create_pairing_ticket("NEW234", UserId::new(1), now + 600).await.unwrap();

        assert_eq!(store.prune_expired_tickets(now).await.unwrap(), 1);
        assert!(store.get_pairing_ticket("NEW234").await.unwrap().is_some());

        let record = store.insert_agent(&new_agent("a1"), UserId::new(1)).await.unwrap();
        assert_eq!(record.display_name(), "host-a1");
        assert!(store.set_friendly_name("a1", Some("Office PC")).await.unwrap());
        assert!(!store.set_friendly_name("missing", Some("x")).await.unwrap());

        let record = store.get_agent("a1").await.unwrap().unwrap();
        assert_eq!(record.display_name(), "Office PC");
    }
}
