//! Orders, finalization, certificate retrieval and revocation

mod common;

use chrono::Utc;
use http::StatusCode;
use rcgen::PublicKeyData;
use x509_parser::prelude::*;

use common::{b64url, csr_for, last_segment, Harness, TestAccount};

use sentinel_ca::acme::{
    AcmeError, AuthorizationStatus, FinalizeRequest, NewOrderRequest, Order, OrderStatus,
    RevokeRequest, Signer,
};
use sentinel_ca_common::{AuthorizationId, CertificateSerial, ChallengeType, Identifier, OrderId};

/// Validate every authorization of a fresh order for `names`
async fn ready_order(harness: &Harness, account: &TestAccount, names: &[&str]) -> Order {
    let (order, authorizations) = harness.new_order(account, names).await;
    for authz in &authorizations {
        let challenge_type = if authz.wildcard {
            ChallengeType::Dns01
        } else {
            ChallengeType::Http01
        };
        harness
            .service
            .accept_challenge(&account.id, &authz.id, challenge_type)
            .await
            .unwrap();
        harness
            .wait_for_authorization(account, &authz.id, |a| {
                a.status == AuthorizationStatus::Valid
            })
            .await;
    }

    let response = harness
        .service
        .get_order(&account.id, &order.id)
        .await
        .unwrap();
    assert_eq!(response.body.status, OrderStatus::Ready);
    harness
        .store
        .get_order(&account.id, &order.id)
        .await
        .unwrap()
        .unwrap()
}

/// Finalize with a CSR for `names`, returning the certificate DER and its key
async fn issue(
    harness: &Harness,
    account: &TestAccount,
    order: &Order,
    names: &[&str],
) -> (Vec<u8>, rcgen::KeyPair) {
    let (csr, key) = csr_for(names);
    let finalized = harness
        .service
        .finalize_order(&account.id, &order.id, FinalizeRequest { csr: b64url(&csr) })
        .await
        .unwrap();
    assert_eq!(finalized.body.status, OrderStatus::Valid);

    let url = finalized.body.certificate.expect("certificate url");
    let serial = CertificateSerial::from_hex(last_segment(&url));
    let der = harness
        .service
        .get_certificate(&account.id, &serial)
        .await
        .unwrap()
        .body;
    (der, key)
}

// ============================================================================
// New Order
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_new_order_normalizes_and_deduplicates() {
    let harness = Harness::start().await;
    let account = harness.new_account().await;

    let response = harness
        .service
        .new_order(
            &account.id,
            NewOrderRequest {
                identifiers: vec![
                    Identifier::dns("Example.COM."),
                    Identifier::dns("example.com"),
                    Identifier::ip("192.0.2.10"),
                ],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(
        response.body.identifiers,
        vec![Identifier::dns("example.com"), Identifier::ip("192.0.2.10")]
    );
    assert_eq!(response.body.authorizations.len(), 2);
    assert!(response.body.expires > harness.clock.now());

    let listed = harness
        .service
        .list_orders(&account.id, &account.id)
        .await
        .unwrap();
    assert_eq!(listed.body.orders, vec![response.location.unwrap()]);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_new_order_rejections() {
    let mut config = common::test_config();
    config.orders.max_identifiers = 2;
    let mut harness = Harness::stopped(
        config,
        sentinel_ca::MemoryStorage::new(),
        common::MockValidator::passing(),
    );
    harness.run_engine();
    let account = harness.new_account().await;
    let order = |identifiers: Vec<Identifier>| NewOrderRequest {
        identifiers,
        ..Default::default()
    };

    let err = harness
        .service
        .new_order(&account.id, order(vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, AcmeError::Malformed(_)));

    let err = harness
        .service
        .new_order(
            &account.id,
            order(vec![
                Identifier::dns("a.example.com"),
                Identifier::dns("b.example.com"),
                Identifier::dns("c.example.com"),
            ]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AcmeError::RejectedIdentifier(_)));

    let err = harness
        .service
        .new_order(&account.id, order(vec![Identifier::dns("bad..name")]))
        .await
        .unwrap_err();
    assert!(matches!(err, AcmeError::RejectedIdentifier(_)));

    let err = harness
        .service
        .new_order(
            &account.id,
            NewOrderRequest {
                identifiers: vec![Identifier::dns("example.com")],
                not_after: Some(Utc::now() + chrono::Duration::days(365)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AcmeError::Malformed(_)));

    assert!(harness.store.list_orders(&account.id).await.unwrap().is_empty());
    harness.shutdown().await;
}

// ============================================================================
// Finalization
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_finalize_issues_certificate() {
    let harness = Harness::start().await;
    let account = harness.new_account().await;
    let order = ready_order(&harness, &account, &["example.com", "www.example.com"]).await;

    let (der, key) = issue(&harness, &account, &order, &["www.example.com", "example.com"]).await;

    let (_, cert) = X509Certificate::from_der(&der).unwrap();
    assert_eq!(cert.public_key().raw, key.subject_public_key_info().as_slice());
    let san = cert.subject_alternative_name().unwrap().unwrap();
    let mut names: Vec<String> = san
        .value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns) => Some(dns.to_string()),
            _ => None,
        })
        .collect();
    names.sort();
    assert_eq!(names, vec!["example.com", "www.example.com"]);

    let stored = harness
        .store
        .get_order(&account.id, &order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, OrderStatus::Valid);
    let serial = stored.certificate_serial.unwrap();
    let record = harness.store.get_certificate(&serial).await.unwrap().unwrap();
    assert_eq!(record.der, der);
    assert_eq!(record.account_id, account.id);

    let stored_account = harness.store.get_account(&account.id).await.unwrap().unwrap();
    assert_eq!(stored_account.max_issued_cert_expiry, Some(record.not_after));

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_finalize_requires_ready_order() {
    let harness = Harness::start().await;
    let account = harness.new_account().await;
    let (order, _) = harness.new_order(&account, &["example.com"]).await;
    let (csr, _) = csr_for(&["example.com"]);

    let err = harness
        .service
        .finalize_order(&account.id, &order.id, FinalizeRequest { csr: b64url(&csr) })
        .await
        .unwrap_err();
    assert!(matches!(err, AcmeError::OrderNotReady(_)));

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_finalize_rejects_mismatched_csr() {
    let harness = Harness::start().await;
    let account = harness.new_account().await;
    let order = ready_order(&harness, &account, &["example.com"]).await;

    for names in [&["example.com", "extra.example.com"][..], &["other.example.com"][..]] {
        let (csr, _) = csr_for(names);
        let err = harness
            .service
            .finalize_order(&account.id, &order.id, FinalizeRequest { csr: b64url(&csr) })
            .await
            .unwrap_err();
        assert!(matches!(err, AcmeError::BadCsr(_)), "{:?}", names);
    }

    let err = harness
        .service
        .finalize_order(
            &account.id,
            &order.id,
            FinalizeRequest {
                csr: "!!not base64!!".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AcmeError::BadCsr(_)));

    // still finalizable after rejected attempts
    let stored = harness
        .store
        .get_order(&account.id, &order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, OrderStatus::Ready);

    harness.shutdown().await;
}

// ============================================================================
// Revocation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_revoke_by_issuing_account() {
    let harness = Harness::start().await;
    let account = harness.new_account().await;
    let order = ready_order(&harness, &account, &["example.com"]).await;
    let (der, _) = issue(&harness, &account, &order, &["example.com"]).await;

    let request = || RevokeRequest {
        certificate: b64url(&der),
        reason: Some(4),
    };
    let response = harness
        .service
        .revoke_certificate(&account.signer(), request())
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);

    let serial = order_serial(&harness, &account, &order.id).await;
    let record = harness.store.get_certificate(&serial).await.unwrap().unwrap();
    assert!(record.revoked_at.is_some());
    assert_eq!(record.revocation_reason, Some(4));

    let err = harness
        .service
        .revoke_certificate(&account.signer(), request())
        .await
        .unwrap_err();
    assert!(matches!(err, AcmeError::AlreadyRevoked));

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_revoke_by_certificate_key() {
    let harness = Harness::start().await;
    let account = harness.new_account().await;
    let order = ready_order(&harness, &account, &["example.com"]).await;
    let (der, cert_key) = issue(&harness, &account, &order, &["example.com"]).await;
    let request = || RevokeRequest {
        certificate: b64url(&der),
        reason: None,
    };

    // some other key
    let err = harness
        .service
        .revoke_certificate(
            &Signer::Jwk {
                thumbprint: "stranger".to_string(),
                public_key: rcgen::KeyPair::generate().unwrap().subject_public_key_info(),
            },
            request(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AcmeError::Unauthorized(_)));

    harness
        .service
        .revoke_certificate(
            &Signer::Jwk {
                thumbprint: "cert-key".to_string(),
                public_key: cert_key.subject_public_key_info(),
            },
            request(),
        )
        .await
        .unwrap();

    let serial = order_serial(&harness, &account, &order.id).await;
    let record = harness.store.get_certificate(&serial).await.unwrap().unwrap();
    assert!(record.revoked_at.is_some());

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_revoke_rejections() {
    let harness = Harness::start().await;
    let owner = harness.new_account().await;
    let other = harness.new_account().await;
    let order = ready_order(&harness, &owner, &["example.com"]).await;
    let (der, _) = issue(&harness, &owner, &order, &["example.com"]).await;

    let err = harness
        .service
        .revoke_certificate(
            &other.signer(),
            RevokeRequest {
                certificate: b64url(&der),
                reason: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AcmeError::Unauthorized(_)));

    let err = harness
        .service
        .revoke_certificate(
            &owner.signer(),
            RevokeRequest {
                certificate: b64url(&der),
                reason: Some(7),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AcmeError::Malformed(_)));

    // a certificate this CA never issued
    let foreign = {
        let key = rcgen::KeyPair::generate().unwrap();
        rcgen::CertificateParams::new(vec!["example.com".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap()
            .der()
            .to_vec()
    };
    let err = harness
        .service
        .revoke_certificate(
            &owner.signer(),
            RevokeRequest {
                certificate: b64url(&foreign),
                reason: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AcmeError::NotFound(_)));

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_revoke_expired_certificate_is_rejected() {
    let harness = Harness::start().await;
    let account = harness.new_account().await;
    let order = ready_order(&harness, &account, &["example.com"]).await;
    let (der, _) = issue(&harness, &account, &order, &["example.com"]).await;

    tokio::time::advance(std::time::Duration::from_secs(91 * 86_400)).await;

    let err = harness
        .service
        .revoke_certificate(
            &account.signer(),
            RevokeRequest {
                certificate: b64url(&der),
                reason: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AcmeError::Malformed(_)));

    harness.shutdown().await;
}

async fn order_serial(harness: &Harness, account: &TestAccount, id: &OrderId) -> CertificateSerial {
    harness
        .store
        .get_order(&account.id, id)
        .await
        .unwrap()
        .unwrap()
        .certificate_serial
        .unwrap()
}

// ============================================================================
// Cross-Account Access
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_other_accounts_resources_are_unauthorized() {
    let harness = Harness::start().await;
    let alice = harness.new_account().await;
    let bob = harness.new_account().await;
    let (order, authorizations) = harness.new_order(&alice, &["example.com"]).await;
    let authz = &authorizations[0];

    let err = harness.service.get_order(&bob.id, &order.id).await.unwrap_err();
    assert!(matches!(err, AcmeError::Unauthorized(_)));

    let err = harness
        .service
        .get_authorization(&bob.id, &authz.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AcmeError::Unauthorized(_)));

    let err = harness
        .service
        .get_challenge(&bob.id, &authz.id, ChallengeType::Http01)
        .await
        .unwrap_err();
    assert!(matches!(err, AcmeError::Unauthorized(_)));

    let err = harness
        .service
        .accept_challenge(&bob.id, &authz.id, ChallengeType::Http01)
        .await
        .unwrap_err();
    assert!(matches!(err, AcmeError::Unauthorized(_)));
    assert!(harness.store.list_task_ids().await.unwrap().is_empty());

    let err = harness
        .service
        .list_orders(&bob.id, &alice.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AcmeError::Unauthorized(_)));

    // unknown ids are simply not found
    let err = harness
        .service
        .get_order(&bob.id, &OrderId::generate())
        .await
        .unwrap_err();
    assert!(matches!(err, AcmeError::NotFound(_)));
    let err = harness
        .service
        .get_authorization(&bob.id, &AuthorizationId::generate())
        .await
        .unwrap_err();
    assert!(matches!(err, AcmeError::NotFound(_)));

    harness.shutdown().await;
}
