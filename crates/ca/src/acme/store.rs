//! Durable resource store
//!
//! Typed access to accounts, orders, authorizations, validation tasks,
//! issued certificates and EAB keys on top of a [`Storage`] backend.
//!
//! Key layout:
//!
//! ```text
//! acme/accounts/<account>
//! acme/account-thumbprints/<thumbprint>      -> account id
//! acme/orders/<account>/<order>
//! acme/authorizations/<account>/<authz>
//! acme/validation-queue/<authz>-<challenge-type>
//! acme/certs/<serial>
//! acme/eab/<key-id>
//! ```

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use sentinel_ca_common::{AccountId, AuthorizationId, CertificateSerial, OrderId};

use super::resources::{
    Account, Authorization, CertificateRecord, EabKey, Order, ValidationTask,
};
use crate::storage::{Storage, StorageError};

pub const ACCOUNT_PREFIX: &str = "acme/accounts/";
pub const THUMBPRINT_PREFIX: &str = "acme/account-thumbprints/";
pub const ORDER_PREFIX: &str = "acme/orders/";
pub const AUTHORIZATION_PREFIX: &str = "acme/authorizations/";
pub const VALIDATION_QUEUE_PREFIX: &str = "acme/validation-queue/";
pub const CERT_PREFIX: &str = "acme/certs/";
pub const EAB_PREFIX: &str = "acme/eab/";

/// Thumbprint index entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThumbprintEntry {
    account_id: AccountId,
}

/// Typed ACME resource access
#[derive(Debug, Clone)]
pub struct ResourceStore {
    storage: Arc<dyn Storage>,
}

impl ResourceStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.storage.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(value)?;
        self.storage.put(key, bytes).await
    }

    /// Load every record under `prefix`, skipping entries that vanished
    /// between list and get
    async fn load_all<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, StorageError> {
        let mut out = Vec::new();
        for key in self.storage.list(prefix).await? {
            match self.get_json(&key).await {
                Ok(Some(value)) => out.push(value),
                Ok(None) => {}
                Err(StorageError::Serialization(e)) => {
                    warn!(key = %key, error = %e, "Skipping unreadable record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    pub async fn get_account(&self, id: &AccountId) -> Result<Option<Account>, StorageError> {
        self.get_json(&format!("{}{}", ACCOUNT_PREFIX, id)).await
    }

    pub async fn put_account(&self, account: &Account) -> Result<(), StorageError> {
        self.put_json(&format!("{}{}", ACCOUNT_PREFIX, account.id), account)
            .await
    }

    pub async fn delete_account(&self, id: &AccountId) -> Result<(), StorageError> {
        self.storage
            .delete(&format!("{}{}", ACCOUNT_PREFIX, id))
            .await
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>, StorageError> {
        self.load_all(ACCOUNT_PREFIX).await
    }

    /// Write the thumbprint index entry. Must happen before the account
    /// record is written.
    pub async fn put_thumbprint(
        &self,
        thumbprint: &str,
        account_id: &AccountId,
    ) -> Result<(), StorageError> {
        let entry = ThumbprintEntry {
            account_id: account_id.clone(),
        };
        self.put_json(&format!("{}{}", THUMBPRINT_PREFIX, thumbprint), &entry)
            .await
    }

    pub async fn delete_thumbprint(&self, thumbprint: &str) -> Result<(), StorageError> {
        self.storage
            .delete(&format!("{}{}", THUMBPRINT_PREFIX, thumbprint))
            .await
    }

    /// Resolve an account by key thumbprint.
    ///
    /// An index entry pointing at a missing account is the residue of an
    /// interrupted account creation and resolves to `None`.
    pub async fn account_by_thumbprint(
        &self,
        thumbprint: &str,
    ) -> Result<Option<Account>, StorageError> {
        let entry: Option<ThumbprintEntry> = self
            .get_json(&format!("{}{}", THUMBPRINT_PREFIX, thumbprint))
            .await?;
        let Some(entry) = entry else {
            return Ok(None);
        };

        let account = self.get_account(&entry.account_id).await?;
        if account.is_none() {
            debug!(
                account_id = %entry.account_id,
                "Thumbprint index points at a missing account; treating as absent"
            );
        }
        Ok(account)
    }

    // =========================================================================
    // Orders
    // =========================================================================

    fn order_key(account: &AccountId, order: &OrderId) -> String {
        format!("{}{}/{}", ORDER_PREFIX, account, order)
    }

    pub async fn get_order(
        &self,
        account: &AccountId,
        order: &OrderId,
    ) -> Result<Option<Order>, StorageError> {
        self.get_json(&Self::order_key(account, order)).await
    }

    pub async fn put_order(&self, order: &Order) -> Result<(), StorageError> {
        self.put_json(&Self::order_key(&order.account_id, &order.id), order)
            .await
    }

    pub async fn delete_order(&self, order: &Order) -> Result<(), StorageError> {
        self.storage
            .delete(&Self::order_key(&order.account_id, &order.id))
            .await
    }

    pub async fn list_orders(&self, account: &AccountId) -> Result<Vec<Order>, StorageError> {
        self.load_all(&format!("{}{}/", ORDER_PREFIX, account)).await
    }

    pub async fn list_all_orders(&self) -> Result<Vec<Order>, StorageError> {
        self.load_all(ORDER_PREFIX).await
    }

    /// Account owning an order, found by scanning every account's orders
    pub async fn order_owner(&self, order: &OrderId) -> Result<Option<AccountId>, StorageError> {
        self.find_owner(ORDER_PREFIX, order.as_str()).await
    }

    // =========================================================================
    // Authorizations
    // =========================================================================

    fn authorization_key(account: &AccountId, authz: &AuthorizationId) -> String {
        format!("{}{}/{}", AUTHORIZATION_PREFIX, account, authz)
    }

    pub async fn get_authorization(
        &self,
        account: &AccountId,
        authz: &AuthorizationId,
    ) -> Result<Option<Authorization>, StorageError> {
        self.get_json(&Self::authorization_key(account, authz)).await
    }

    pub async fn put_authorization(&self, authz: &Authorization) -> Result<(), StorageError> {
        self.put_json(&Self::authorization_key(&authz.account_id, &authz.id), authz)
            .await
    }

    pub async fn delete_authorization(&self, authz: &Authorization) -> Result<(), StorageError> {
        self.storage
            .delete(&Self::authorization_key(&authz.account_id, &authz.id))
            .await
    }

    pub async fn list_authorizations(
        &self,
        account: &AccountId,
    ) -> Result<Vec<Authorization>, StorageError> {
        self.load_all(&format!("{}{}/", AUTHORIZATION_PREFIX, account))
            .await
    }

    pub async fn list_all_authorizations(&self) -> Result<Vec<Authorization>, StorageError> {
        self.load_all(AUTHORIZATION_PREFIX).await
    }

    /// Account owning an authorization, found by scanning
    pub async fn authorization_owner(
        &self,
        authz: &AuthorizationId,
    ) -> Result<Option<AccountId>, StorageError> {
        self.find_owner(AUTHORIZATION_PREFIX, authz.as_str()).await
    }

    async fn find_owner(&self, prefix: &str, id: &str) -> Result<Option<AccountId>, StorageError> {
        for key in self.storage.list(prefix).await? {
            let rest = key.strip_prefix(prefix).unwrap_or(&key);
            if let Some((account, resource)) = rest.split_once('/') {
                if resource == id {
                    return Ok(Some(AccountId::new(account)));
                }
            }
        }
        Ok(None)
    }

    // =========================================================================
    // Validation Tasks
    // =========================================================================

    pub async fn get_task(&self, task_id: &str) -> Result<Option<ValidationTask>, StorageError> {
        self.get_json(&format!("{}{}", VALIDATION_QUEUE_PREFIX, task_id))
            .await
    }

    pub async fn put_task(&self, task: &ValidationTask) -> Result<(), StorageError> {
        self.put_json(&format!("{}{}", VALIDATION_QUEUE_PREFIX, task.id()), task)
            .await
    }

    pub async fn delete_task(&self, task_id: &str) -> Result<(), StorageError> {
        self.storage
            .delete(&format!("{}{}", VALIDATION_QUEUE_PREFIX, task_id))
            .await
    }

    /// Ids of every persisted validation task
    pub async fn list_task_ids(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .storage
            .list(VALIDATION_QUEUE_PREFIX)
            .await?
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix(VALIDATION_QUEUE_PREFIX)
                    .map(str::to_string)
            })
            .collect())
    }

    /// Drop every task belonging to an authorization
    pub async fn delete_tasks_for(&self, authz: &Authorization) -> Result<usize, StorageError> {
        let mut removed = 0;
        for challenge in &authz.challenges {
            let task_id = ValidationTask::task_id(&authz.id, challenge.challenge_type);
            if self.get_task(&task_id).await?.is_some() {
                self.delete_task(&task_id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    // =========================================================================
    // Certificates
    // =========================================================================

    pub async fn get_certificate(
        &self,
        serial: &CertificateSerial,
    ) -> Result<Option<CertificateRecord>, StorageError> {
        self.get_json(&format!("{}{}", CERT_PREFIX, serial)).await
    }

    pub async fn put_certificate(&self, record: &CertificateRecord) -> Result<(), StorageError> {
        self.put_json(&format!("{}{}", CERT_PREFIX, record.serial), record)
            .await
    }

    // =========================================================================
    // EAB Keys
    // =========================================================================

    pub async fn get_eab_key(&self, key_id: &str) -> Result<Option<EabKey>, StorageError> {
        self.get_json(&format!("{}{}", EAB_PREFIX, key_id)).await
    }

    pub async fn put_eab_key(&self, key: &EabKey) -> Result<(), StorageError> {
        self.put_json(&format!("{}{}", EAB_PREFIX, key.key_id), key)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::resources::{AccountStatus, AuthorizationStatus, Challenge};
    use crate::storage::MemoryStorage;
    use chrono::Utc;
    use sentinel_ca_common::{ChallengeType, Identifier};

    fn account(id: &str) -> Account {
        let now = Utc::now();
        Account {
            id: AccountId::new(id),
            status: AccountStatus::Valid,
            contacts: vec![],
            terms_of_service_agreed: true,
            key_thumbprint: format!("thumb-{}", id),
            public_key: vec![1, 2, 3],
            external_account_binding: None,
            created_at: now,
            last_access_at: now,
            max_issued_cert_expiry: None,
            revoked_at: None,
        }
    }

    fn authorization(account: &str) -> Authorization {
        Authorization {
            id: AuthorizationId::generate(),
            account_id: AccountId::new(account),
            identifier: Identifier::dns("example.com"),
            status: AuthorizationStatus::Pending,
            expires: Utc::now(),
            challenges: vec![
                Challenge::new(ChallengeType::Http01),
                Challenge::new(ChallengeType::Dns01),
            ],
            wildcard: false,
        }
    }

    #[tokio::test]
    async fn test_thumbprint_lookup() {
        let store = ResourceStore::new(Arc::new(MemoryStorage::new()));
        let acct = account("a1");

        store.put_thumbprint(&acct.key_thumbprint, &acct.id).await.unwrap();
        store.put_account(&acct).await.unwrap();

        let found = store.account_by_thumbprint("thumb-a1").await.unwrap();
        assert_eq!(found, Some(acct));
        assert_eq!(store.account_by_thumbprint("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dangling_thumbprint_is_absent() {
        let store = ResourceStore::new(Arc::new(MemoryStorage::new()));
        store
            .put_thumbprint("thumb-ghost", &AccountId::new("ghost"))
            .await
            .unwrap();

        assert_eq!(store.account_by_thumbprint("thumb-ghost").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_owner_lookup() {
        let store = ResourceStore::new(Arc::new(MemoryStorage::new()));
        let authz = authorization("owner");
        store.put_authorization(&authz).await.unwrap();

        assert_eq!(
            store.authorization_owner(&authz.id).await.unwrap(),
            Some(AccountId::new("owner"))
        );
        assert_eq!(
            store
                .authorization_owner(&AuthorizationId::new("nope"))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_task_ids_and_cleanup_for_authorization() {
        let store = ResourceStore::new(Arc::new(MemoryStorage::new()));
        let authz = authorization("a1");

        let now = Utc::now();
        for challenge in &authz.challenges {
            store
                .put_task(&ValidationTask {
                    account_id: authz.account_id.clone(),
                    authorization_id: authz.id.clone(),
                    challenge_type: challenge.challenge_type,
                    token: challenge.token.clone(),
                    key_thumbprint: "thumb".into(),
                    initiated_at: now,
                    first_validation_at: None,
                    retry_count: 0,
                    last_retry_at: None,
                    retry_after: None,
                })
                .await
                .unwrap();
        }

        let mut ids = store.list_task_ids().await.unwrap();
        ids.sort();
        assert_eq!(
            ids,
            vec![
                format!("{}-dns-01", authz.id),
                format!("{}-http-01", authz.id)
            ]
        );

        assert_eq!(store.delete_tasks_for(&authz).await.unwrap(), 2);
        assert!(store.list_task_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_all_skips_corrupt_records() {
        let storage = Arc::new(MemoryStorage::new());
        let store = ResourceStore::new(storage.clone());

        store.put_account(&account("good")).await.unwrap();
        storage
            .put("acme/accounts/bad", b"not json".to_vec())
            .await
            .unwrap();

        let accounts = store.list_accounts().await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id.as_str(), "good");
    }
}
