//! Local certificate issuer
//!
//! A [`CertificateIssuer`] that signs with an in-process CA key generated at
//! startup. Certificates chain to a root that exists only for the lifetime
//! of the process, so this is meant for development and tests; production
//! deployments plug in their own issuer.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SerialNumber,
};
use tracing::{debug, info};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use sentinel_ca_common::CertificateSerial;

use super::clock::Clock;
use super::error::AcmeError;
use super::policy::{CertificateIssuer, IssuedCertificate};
use super::resources::Order;

/// Serial length in bytes; the high bit of the first byte stays clear
const SERIAL_BYTES: usize = 16;

/// Issuer backed by an ephemeral self-signed CA
pub struct LocalIssuer {
    issuer: Issuer<'static, KeyPair>,
    ca_pem: String,
    lifetime: Duration,
    clock: Arc<dyn Clock>,
}

impl LocalIssuer {
    /// Generate a fresh CA key and self-signed root named `common_name`
    pub fn generate(
        common_name: &str,
        lifetime: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AcmeError> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;

        let key = KeyPair::generate().map_err(internal)?;
        let root = params.self_signed(&key).map_err(internal)?;
        let ca_pem = root.pem();

        info!(common_name = %common_name, "Generated local issuing CA");

        Ok(Self {
            issuer: Issuer::new(params, key),
            ca_pem,
            lifetime,
            clock,
        })
    }

    /// PEM of the root certificate, for clients that need to trust it
    pub fn ca_certificate_pem(&self) -> &str {
        &self.ca_pem
    }
}

#[async_trait]
impl CertificateIssuer for LocalIssuer {
    async fn issue(&self, order: &Order, csr_der: &[u8]) -> Result<IssuedCertificate, AcmeError> {
        let csr_pem = ::pem::encode(&::pem::Pem::new("CERTIFICATE REQUEST", csr_der.to_vec()));
        let csr = CertificateSigningRequestParams::from_pem(&csr_pem)
            .map_err(|e| AcmeError::BadCsr(format!("unable to load CSR: {}", e)))?;

        let names: Vec<String> = order.identifiers.iter().map(|i| i.value.clone()).collect();
        let mut params = CertificateParams::new(names).map_err(internal)?;
        let mut dn = DistinguishedName::new();
        if let Some(first) = order.identifiers.first() {
            dn.push(DnType::CommonName, first.value.as_str());
        }
        params.distinguished_name = dn;

        let now = self.clock.now();
        let lifetime = chrono::Duration::from_std(self.lifetime).map_err(internal)?;
        params.not_before = to_offset(order.not_before.unwrap_or(now))?;
        params.not_after = to_offset(order.not_after.unwrap_or(now + lifetime))?;
        params.serial_number = Some(SerialNumber::from_slice(&random_serial()));
        params.is_ca = IsCa::NoCa;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;

        let certificate = params
            .signed_by(&csr.public_key, &self.issuer)
            .map_err(internal)?;
        let der = certificate.der().to_vec();

        // read back what was actually encoded
        let (_, parsed) = X509Certificate::from_der(&der).map_err(internal)?;
        let serial = CertificateSerial::from_bytes(parsed.raw_serial());
        let not_after = DateTime::<Utc>::from_timestamp(parsed.validity().not_after.timestamp(), 0)
            .ok_or_else(|| AcmeError::ServerInternal("issued notAfter out of range".to_string()))?;

        debug!(
            order_id = %order.id,
            serial = %serial,
            not_after = %not_after,
            "Signed certificate"
        );

        Ok(IssuedCertificate {
            serial,
            der,
            not_after,
        })
    }
}

impl fmt::Debug for LocalIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIssuer")
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

fn random_serial() -> [u8; SERIAL_BYTES] {
    let mut serial = [0u8; SERIAL_BYTES];
    rand::thread_rng().fill_bytes(&mut serial);
    serial[0] = (serial[0] & 0x7f) | 0x01;
    serial
}

fn to_offset(at: DateTime<Utc>) -> Result<::time::OffsetDateTime, AcmeError> {
    ::time::OffsetDateTime::from_unix_timestamp(at.timestamp()).map_err(internal)
}

fn internal(e: impl fmt::Display) -> AcmeError {
    AcmeError::ServerInternal(format!("certificate issuance failed: {}", e))
}
