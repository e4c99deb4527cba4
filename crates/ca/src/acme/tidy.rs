//! Periodic cleanup of ACME state
//!
//! One [`run`] pass sweeps expired nonces, expires and then deletes stale
//! authorizations and orders, revokes and later deletes inactive accounts,
//! and drops validation tasks whose authorization is gone. Individual record
//! failures are logged and counted; only failures to enumerate a record
//! family abort the pass.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use sentinel_ca_config::TidyConfig;

use super::clock::Clock;
use super::metrics::AcmeMetrics;
use super::nonce::NonceRegistry;
use super::resources::{Account, AccountStatus};
use super::store::ResourceStore;
use crate::storage::StorageError;

/// Counts from one tidy pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TidyReport {
    pub nonces_removed: usize,
    pub authorizations_expired: usize,
    pub authorizations_deleted: usize,
    pub orders_invalidated: usize,
    pub orders_deleted: usize,
    pub accounts_revoked: usize,
    pub accounts_deleted: usize,
    pub tasks_deleted: usize,
    /// Records that could not be updated or removed
    pub errors: usize,
}

impl TidyReport {
    /// Total records changed
    pub fn total(&self) -> usize {
        self.nonces_removed
            + self.authorizations_expired
            + self.authorizations_deleted
            + self.orders_invalidated
            + self.orders_deleted
            + self.accounts_revoked
            + self.accounts_deleted
            + self.tasks_deleted
    }
}

/// Run one tidy pass
pub async fn run(
    store: &ResourceStore,
    nonces: &NonceRegistry,
    config: &TidyConfig,
    clock: &Arc<dyn Clock>,
    metrics: Option<&AcmeMetrics>,
) -> Result<TidyReport, StorageError> {
    let now = clock.now();
    let buffer = to_chrono(config.buffer());
    let mut report = TidyReport {
        nonces_removed: nonces.tidy(),
        ..TidyReport::default()
    };

    tidy_authorizations(store, now, buffer, &mut report).await?;
    tidy_orders(store, now, buffer, &mut report).await?;
    tidy_accounts(store, config, now, buffer, &mut report).await?;
    tidy_orphaned_tasks(store, &mut report).await?;

    if let Some(metrics) = metrics {
        metrics.record_tidied("nonce", "deleted", report.nonces_removed);
        metrics.record_tidied("authorization", "expired", report.authorizations_expired);
        metrics.record_tidied("authorization", "deleted", report.authorizations_deleted);
        metrics.record_tidied("order", "invalidated", report.orders_invalidated);
        metrics.record_tidied("order", "deleted", report.orders_deleted);
        metrics.record_tidied("account", "revoked", report.accounts_revoked);
        metrics.record_tidied("account", "deleted", report.accounts_deleted);
        metrics.record_tidied("task", "deleted", report.tasks_deleted);
    }

    info!(
        total = report.total(),
        nonces = report.nonces_removed,
        authorizations_deleted = report.authorizations_deleted,
        orders_deleted = report.orders_deleted,
        accounts_revoked = report.accounts_revoked,
        accounts_deleted = report.accounts_deleted,
        tasks = report.tasks_deleted,
        errors = report.errors,
        "Tidy pass complete"
    );

    Ok(report)
}

async fn tidy_authorizations(
    store: &ResourceStore,
    now: DateTime<Utc>,
    buffer: Option<chrono::Duration>,
    report: &mut TidyReport,
) -> Result<(), StorageError> {
    for mut authz in store.list_all_authorizations().await? {
        if is_past(now, authz.expires, buffer) {
            let tasks = match store.delete_tasks_for(&authz).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(
                        authorization_id = %authz.id,
                        error = %e,
                        "Failed to drop authorization tasks"
                    );
                    report.errors += 1;
                    continue;
                }
            };
            report.tasks_deleted += tasks;

            match store.delete_authorization(&authz).await {
                Ok(()) => {
                    debug!(
                        authorization_id = %authz.id,
                        status = %authz.status,
                        "Deleted authorization"
                    );
                    report.authorizations_deleted += 1;
                }
                Err(e) => {
                    warn!(
                        authorization_id = %authz.id,
                        error = %e,
                        "Failed to delete authorization"
                    );
                    report.errors += 1;
                }
            }
            continue;
        }

        if authz.expire_if_due(now) {
            match store.put_authorization(&authz).await {
                Ok(()) => {
                    debug!(authorization_id = %authz.id, "Authorization expired");
                    report.authorizations_expired += 1;
                }
                Err(e) => {
                    warn!(
                        authorization_id = %authz.id,
                        error = %e,
                        "Failed to expire authorization"
                    );
                    report.errors += 1;
                }
            }
        }
    }
    Ok(())
}

async fn tidy_orders(
    store: &ResourceStore,
    now: DateTime<Utc>,
    buffer: Option<chrono::Duration>,
    report: &mut TidyReport,
) -> Result<(), StorageError> {
    for mut order in store.list_all_orders().await? {
        if is_past(now, order.expires, buffer) {
            match store.delete_order(&order).await {
                Ok(()) => {
                    debug!(order_id = %order.id, status = %order.status, "Deleted order");
                    report.orders_deleted += 1;
                }
                Err(e) => {
                    warn!(order_id = %order.id, error = %e, "Failed to delete order");
                    report.errors += 1;
                }
            }
            continue;
        }

        // authorizations may already be gone; past expiry the order
        // invalidates on its own
        if now > order.expires && order.refresh_status(&[], now) {
            match store.put_order(&order).await {
                Ok(()) => report.orders_invalidated += 1,
                Err(e) => {
                    warn!(order_id = %order.id, error = %e, "Failed to invalidate order");
                    report.errors += 1;
                }
            }
        }
    }
    Ok(())
}

async fn tidy_accounts(
    store: &ResourceStore,
    config: &TidyConfig,
    now: DateTime<Utc>,
    buffer: Option<chrono::Duration>,
    report: &mut TidyReport,
) -> Result<(), StorageError> {
    let revoke_after = to_chrono(config.account_revoke_after());
    let grace = to_chrono(config.account_delete_grace());

    for mut account in store.list_accounts().await? {
        match account.status {
            AccountStatus::Valid => {
                if !is_past(now, account.last_access_at, revoke_after) {
                    continue;
                }
                account.revoke(now);
                match store.put_account(&account).await {
                    Ok(()) => {
                        info!(
                            account_id = %account.id,
                            last_access_at = %account.last_access_at,
                            "Revoked inactive account"
                        );
                        report.accounts_revoked += 1;
                    }
                    Err(e) => {
                        warn!(account_id = %account.id, error = %e, "Failed to revoke account");
                        report.errors += 1;
                    }
                }
            }
            AccountStatus::Revoked | AccountStatus::Deactivated => {
                if !deletion_due(&account, now, grace, buffer) {
                    continue;
                }
                if delete_account(store, &account, report).await {
                    report.accounts_deleted += 1;
                } else {
                    report.errors += 1;
                }
            }
        }
    }
    Ok(())
}

/// An account is deleted once its grace period has passed and every
/// certificate issued to it has expired
fn deletion_due(
    account: &Account,
    now: DateTime<Utc>,
    grace: Option<chrono::Duration>,
    buffer: Option<chrono::Duration>,
) -> bool {
    let Some(revoked_at) = account.revoked_at else {
        warn!(
            account_id = %account.id,
            status = %account.status,
            "Inactive account has no revokedAt"
        );
        return false;
    };
    let certs_expired = account
        .max_issued_cert_expiry
        .map_or(true, |expiry| is_past(now, expiry, buffer));
    is_past(now, revoked_at, grace) && certs_expired
}

/// Best-effort removal of an account, its remaining orders and
/// authorizations, and its thumbprint index entry. Returns false if the
/// account record itself could not be deleted.
async fn delete_account(store: &ResourceStore, account: &Account, report: &mut TidyReport) -> bool {
    match store.list_authorizations(&account.id).await {
        Ok(authorizations) => {
            for authz in authorizations {
                if let Ok(n) = store.delete_tasks_for(&authz).await {
                    report.tasks_deleted += n;
                }
                match store.delete_authorization(&authz).await {
                    Ok(()) => report.authorizations_deleted += 1,
                    Err(e) => warn!(
                        account_id = %account.id,
                        authorization_id = %authz.id,
                        error = %e,
                        "Failed to delete authorization of deleted account"
                    ),
                }
            }
        }
        Err(e) => warn!(
            account_id = %account.id,
            error = %e,
            "Failed to list account authorizations"
        ),
    }

    match store.list_orders(&account.id).await {
        Ok(orders) => {
            for order in orders {
                match store.delete_order(&order).await {
                    Ok(()) => report.orders_deleted += 1,
                    Err(e) => warn!(
                        account_id = %account.id,
                        order_id = %order.id,
                        error = %e,
                        "Failed to delete order of deleted account"
                    ),
                }
            }
        }
        Err(e) => warn!(account_id = %account.id, error = %e, "Failed to list account orders"),
    }

    match store.account_by_thumbprint(&account.key_thumbprint).await {
        Ok(Some(indexed)) if indexed.id != account.id => {
            warn!(
                account_id = %account.id,
                indexed_account = %indexed.id,
                "Thumbprint index points at another account, leaving it"
            );
        }
        Ok(_) => {
            if let Err(e) = store.delete_thumbprint(&account.key_thumbprint).await {
                warn!(account_id = %account.id, error = %e, "Failed to delete thumbprint index");
            }
        }
        Err(e) => warn!(account_id = %account.id, error = %e, "Failed to read thumbprint index"),
    }

    match store.delete_account(&account.id).await {
        Ok(()) => {
            info!(account_id = %account.id, status = %account.status, "Deleted account");
            true
        }
        Err(e) => {
            warn!(account_id = %account.id, error = %e, "Failed to delete account");
            false
        }
    }
}

async fn tidy_orphaned_tasks(
    store: &ResourceStore,
    report: &mut TidyReport,
) -> Result<(), StorageError> {
    for task_id in store.list_task_ids().await? {
        let task = match store.get_task(&task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => continue,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Unreadable validation task");
                report.errors += 1;
                continue;
            }
        };

        let authz = store
            .get_authorization(&task.account_id, &task.authorization_id)
            .await?;
        if authz.is_some() {
            continue;
        }

        match store.delete_task(&task_id).await {
            Ok(()) => {
                debug!(task_id = %task_id, "Deleted orphaned validation task");
                report.tasks_deleted += 1;
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Failed to delete orphaned task");
                report.errors += 1;
            }
        }
    }
    Ok(())
}

/// Whether `now` is later than `at + after`; a sum past the representable
/// range is never reached
fn is_past(now: DateTime<Utc>, at: DateTime<Utc>, after: Option<chrono::Duration>) -> bool {
    after
        .and_then(|after| at.checked_add_signed(after))
        .is_some_and(|due| now > due)
}

fn to_chrono(d: std::time::Duration) -> Option<chrono::Duration> {
    chrono::Duration::from_std(d).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::clock::SystemClock;
    use crate::acme::resources::{
        Authorization, AuthorizationStatus, Challenge, Order, OrderStatus, ValidationTask,
    };
    use crate::storage::MemoryStorage;
    use sentinel_ca_common::{AccountId, AuthorizationId, ChallengeType, Identifier, OrderId};
    use std::time::Duration;

    fn fixture() -> (ResourceStore, NonceRegistry, Arc<dyn Clock>) {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = ResourceStore::new(Arc::new(MemoryStorage::new()));
        let nonces = NonceRegistry::new(Duration::from_secs(900), clock.clone());
        (store, nonces, clock)
    }

    fn config() -> TidyConfig {
        TidyConfig {
            enabled: true,
            interval_secs: 3600,
            account_revoke_after_days: 90,
            account_delete_grace_days: 30,
            buffer_hours: 24,
        }
    }

    fn account(id: &str, last_access_at: DateTime<Utc>) -> Account {
        Account {
            id: AccountId::new(id),
            status: AccountStatus::Valid,
            contacts: Vec::new(),
            terms_of_service_agreed: true,
            key_thumbprint: format!("thumb-{}", id),
            public_key: vec![1, 2, 3],
            external_account_binding: None,
            created_at: last_access_at,
            last_access_at,
            max_issued_cert_expiry: None,
            revoked_at: None,
        }
    }

    fn authz(account: &str, status: AuthorizationStatus, expires: DateTime<Utc>) -> Authorization {
        Authorization {
            id: AuthorizationId::generate(),
            account_id: AccountId::new(account),
            identifier: Identifier::dns("example.com"),
            status,
            expires,
            challenges: vec![Challenge::new(ChallengeType::Http01)],
            wildcard: false,
        }
    }

    fn task_for(authz: &Authorization) -> ValidationTask {
        ValidationTask {
            account_id: authz.account_id.clone(),
            authorization_id: authz.id.clone(),
            challenge_type: ChallengeType::Http01,
            token: authz.challenges[0].token.clone(),
            key_thumbprint: "thumb".to_string(),
            initiated_at: Utc::now(),
            first_validation_at: None,
            retry_count: 0,
            last_retry_at: None,
            retry_after: None,
        }
    }

    #[tokio::test]
    async fn test_authorizations_expire_then_delete() {
        let (store, nonces, clock) = fixture();
        let now = Utc::now();

        let stale = authz("acct", AuthorizationStatus::Pending, now - chrono::Duration::hours(1));
        let gone = authz("acct", AuthorizationStatus::Valid, now - chrono::Duration::hours(48));
        let fresh = authz("acct", AuthorizationStatus::Pending, now + chrono::Duration::hours(1));
        for a in [&stale, &gone, &fresh] {
            store.put_authorization(a).await.unwrap();
        }
        store.put_task(&task_for(&gone)).await.unwrap();

        let report = run(&store, &nonces, &config(), &clock, None).await.unwrap();
        assert_eq!(report.authorizations_expired, 1);
        assert_eq!(report.authorizations_deleted, 1);
        assert_eq!(report.tasks_deleted, 1);

        let stale = store
            .get_authorization(&stale.account_id, &stale.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stale.status, AuthorizationStatus::Expired);
        assert!(store
            .get_authorization(&gone.account_id, &gone.id)
            .await
            .unwrap()
            .is_none());
        let fresh = store
            .get_authorization(&fresh.account_id, &fresh.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fresh.status, AuthorizationStatus::Pending);
        assert!(store.list_task_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_orders_invalidate_then_delete() {
        let (store, nonces, clock) = fixture();
        let now = Utc::now();
        let order = |expires: DateTime<Utc>| Order {
            id: OrderId::generate(),
            account_id: AccountId::new("acct"),
            status: OrderStatus::Pending,
            identifiers: vec![Identifier::dns("example.com")],
            authorization_ids: vec![AuthorizationId::generate()],
            not_before: None,
            not_after: None,
            expires,
            created_at: now - chrono::Duration::days(3),
            certificate_serial: None,
            error: None,
        };

        let expired = order(now - chrono::Duration::hours(1));
        let old = order(now - chrono::Duration::hours(25));
        store.put_order(&expired).await.unwrap();
        store.put_order(&old).await.unwrap();

        let report = run(&store, &nonces, &config(), &clock, None).await.unwrap();
        assert_eq!(report.orders_invalidated, 1);
        assert_eq!(report.orders_deleted, 1);

        let expired = store
            .get_order(&expired.account_id, &expired.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(expired.status, OrderStatus::Invalid);
        assert!(store.get_order(&old.account_id, &old.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_inactive_account_is_revoked() {
        let (store, nonces, clock) = fixture();
        let now = Utc::now();
        let idle = account("idle", now - chrono::Duration::days(91));
        let busy = account("busy", now - chrono::Duration::days(1));
        store.put_account(&idle).await.unwrap();
        store.put_account(&busy).await.unwrap();

        let report = run(&store, &nonces, &config(), &clock, None).await.unwrap();
        assert_eq!(report.accounts_revoked, 1);

        let idle = store.get_account(&idle.id).await.unwrap().unwrap();
        assert_eq!(idle.status, AccountStatus::Revoked);
        assert!(idle.revoked_at.is_some());
        let busy = store.get_account(&busy.id).await.unwrap().unwrap();
        assert_eq!(busy.status, AccountStatus::Valid);
    }

    #[tokio::test]
    async fn test_revoked_account_deleted_after_grace() {
        let (store, nonces, clock) = fixture();
        let now = Utc::now();

        let mut old = account("old", now - chrono::Duration::days(200));
        old.revoke(now - chrono::Duration::days(31));
        store.put_thumbprint(&old.key_thumbprint, &old.id).await.unwrap();
        store.put_account(&old).await.unwrap();
        let leftover = authz("old", AuthorizationStatus::Pending, now + chrono::Duration::hours(1));
        store.put_authorization(&leftover).await.unwrap();

        let mut recent = account("recent", now - chrono::Duration::days(200));
        recent.deactivate(now - chrono::Duration::days(5));
        store.put_account(&recent).await.unwrap();

        let mut certified = account("certified", now - chrono::Duration::days(200));
        certified.revoke(now - chrono::Duration::days(40));
        certified.note_issued(now + chrono::Duration::days(10));
        store.put_account(&certified).await.unwrap();

        let report = run(&store, &nonces, &config(), &clock, None).await.unwrap();
        assert_eq!(report.accounts_deleted, 1);
        assert_eq!(report.errors, 0);

        assert!(store.get_account(&old.id).await.unwrap().is_none());
        assert!(store
            .account_by_thumbprint(&old.key_thumbprint)
            .await
            .unwrap()
            .is_none());
        assert!(store.list_authorizations(&old.id).await.unwrap().is_empty());
        assert!(store.get_account(&recent.id).await.unwrap().is_some());
        assert!(store.get_account(&certified.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_out_of_range_periods_are_never_due() {
        let (store, nonces, clock) = fixture();
        let now = Utc::now();
        let config = TidyConfig {
            account_revoke_after_days: u32::MAX,
            account_delete_grace_days: u32::MAX,
            buffer_hours: u64::MAX,
            ..config()
        };

        let idle = account("idle", now - chrono::Duration::days(1000));
        let mut revoked = account("revoked", now - chrono::Duration::days(1000));
        revoked.revoke(now - chrono::Duration::days(900));
        store.put_account(&idle).await.unwrap();
        store.put_account(&revoked).await.unwrap();
        let old = authz("idle", AuthorizationStatus::Pending, now - chrono::Duration::days(900));
        store.put_authorization(&old).await.unwrap();

        let report = run(&store, &nonces, &config, &clock, None).await.unwrap();
        assert_eq!(report.accounts_revoked, 0);
        assert_eq!(report.accounts_deleted, 0);
        assert_eq!(report.authorizations_deleted, 0);
        // plain expiry needs no buffer
        assert_eq!(report.authorizations_expired, 1);
        assert_eq!(
            store.get_account(&idle.id).await.unwrap().unwrap().status,
            AccountStatus::Valid
        );
    }

    #[tokio::test]
    async fn test_orphaned_tasks_are_dropped() {
        let (store, nonces, clock) = fixture();
        let now = Utc::now();
        let live = authz("acct", AuthorizationStatus::Pending, now + chrono::Duration::hours(1));
        let missing = authz("acct", AuthorizationStatus::Pending, now + chrono::Duration::hours(1));
        store.put_authorization(&live).await.unwrap();
        store.put_task(&task_for(&live)).await.unwrap();
        store.put_task(&task_for(&missing)).await.unwrap();

        let report = run(&store, &nonces, &config(), &clock, None).await.unwrap();
        assert_eq!(report.tasks_deleted, 1);
        assert_eq!(
            store.list_task_ids().await.unwrap(),
            vec![task_for(&live).id()]
        );
    }

    #[tokio::test]
    async fn test_records_metrics() {
        let (store, nonces, clock) = fixture();
        let metrics = AcmeMetrics::new().unwrap();
        let now = Utc::now();
        store
            .put_account(&account("idle", now - chrono::Duration::days(100)))
            .await
            .unwrap();

        run(&store, &nonces, &config(), &clock, Some(&metrics))
            .await
            .unwrap();
        let text = metrics.export().unwrap();
        assert!(text.contains("sentinel_ca_tidy_records_total"));
        assert!(text.contains("revoked"));
    }
}
