//! Challenge validators
//!
//! The network proofs behind HTTP-01 (RFC 8555 §8.3) and DNS-01 (§8.4).
//! Validators hold no locks and never touch the resource store; engine
//! workers call them and interpret the result.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::{Resolver, TokioResolver};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, trace};

use sentinel_ca_common::{ChallengeType, Identifier, IdentifierType};
use sentinel_ca_config::{Dns01Config, Http01Config};

use super::error::Problem;

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// DNS-01 record label
pub const DNS01_LABEL: &str = "_acme-challenge";

/// Why a validation attempt failed. Always carries a description.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("connection to {target} failed: {message}")]
    Connection { target: String, message: String },

    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("incorrect response: {0}")]
    IncorrectResponse(String),

    #[error("malformed key authorization: {0}")]
    MalformedKeyAuthorization(String),

    #[error("DNS lookup for {name} failed: {message}")]
    Dns { name: String, message: String },

    /// Challenge type cannot be validated for this identifier; never retried
    #[error("unsupported challenge: {0}")]
    Unsupported(String),
}

impl ValidationError {
    /// Whether retrying could change the outcome
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ValidationError::Unsupported(_))
    }

    /// Problem document recorded on the failed challenge
    pub fn problem(&self) -> Problem {
        let kind = match self {
            ValidationError::Connection { .. } => "connection",
            ValidationError::Dns { .. } => "dns",
            ValidationError::Unsupported(_) => "unsupportedIdentifier",
            ValidationError::BodyTooLarge { .. }
            | ValidationError::IncorrectResponse(_)
            | ValidationError::MalformedKeyAuthorization(_) => "incorrectResponse",
        };
        Problem::new(kind, self.to_string(), http::StatusCode::BAD_REQUEST)
    }
}

// ============================================================================
// Key Authorization
// ============================================================================

/// Expected challenge response: `{token}.{thumbprint}`
pub fn key_authorization(token: &str, thumbprint: &str) -> String {
    format!("{}.{}", token, thumbprint)
}

/// DNS-01 TXT record value: base64url(SHA-256(key authorization))
pub fn dns01_digest(key_authorization: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(key_authorization.as_bytes()))
}

/// Check a presented key authorization against the token and thumbprint.
///
/// The value must have exactly two non-empty `.`-separated parts, token
/// first. Every failure is an error describing the mismatch.
pub fn validate_key_authorization(
    presented: &str,
    token: &str,
    thumbprint: &str,
) -> Result<(), ValidationError> {
    let parts: Vec<&str> = presented.split('.').collect();
    if parts.len() != 2 {
        return Err(ValidationError::MalformedKeyAuthorization(format!(
            "expected 2 '.'-separated parts, got {}",
            parts.len()
        )));
    }

    let (presented_token, presented_thumbprint) = (parts[0], parts[1]);
    if presented_token.is_empty() || presented_thumbprint.is_empty() {
        return Err(ValidationError::MalformedKeyAuthorization(
            "token and thumbprint must both be non-empty".to_string(),
        ));
    }
    if presented_token != token {
        return Err(ValidationError::IncorrectResponse(
            "token in key authorization does not match the challenge".to_string(),
        ));
    }
    if presented_thumbprint != thumbprint {
        return Err(ValidationError::IncorrectResponse(
            "thumbprint in key authorization does not match the account key".to_string(),
        ));
    }
    Ok(())
}

/// Whether a challenge type can prove control of an identifier.
///
/// HTTP-01 and TLS-ALPN-01 cannot authorize wildcards; DNS-01 needs a DNS
/// name.
pub fn supports(challenge_type: ChallengeType, identifier: &Identifier, wildcard: bool) -> bool {
    match challenge_type {
        ChallengeType::Http01 | ChallengeType::TlsAlpn01 => !wildcard,
        ChallengeType::Dns01 => identifier.kind == IdentifierType::Dns,
    }
}

// ============================================================================
// Validator Trait
// ============================================================================

/// Performs the out-of-band proof for a challenge
#[async_trait]
pub trait ChallengeValidator: Send + Sync {
    /// `Ok(())` when the identifier presents the expected key authorization
    async fn validate(
        &self,
        challenge_type: ChallengeType,
        identifier: &Identifier,
        token: &str,
        thumbprint: &str,
    ) -> Result<(), ValidationError>;
}

// ============================================================================
// HTTP-01
// ============================================================================

/// HTTP-01 validator
#[derive(Debug, Clone)]
pub struct Http01Validator {
    config: Http01Config,
}

impl Http01Validator {
    pub fn new(config: Http01Config) -> Self {
        Self { config }
    }

    /// Challenge URL for an identifier
    pub fn challenge_url(&self, identifier: &Identifier, token: &str) -> String {
        let host = match identifier.value.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{}]", v6),
            _ => identifier.value.clone(),
        };
        if self.config.port == 80 {
            format!("http://{}{}{}", host, ACME_CHALLENGE_PREFIX, token)
        } else {
            format!(
                "http://{}:{}{}{}",
                host, self.config.port, ACME_CHALLENGE_PREFIX, token
            )
        }
    }

    /// Short-lived client: no connection reuse, bounded redirects
    fn client(&self) -> Result<reqwest::Client, ValidationError> {
        let max_redirects = self.config.max_redirects;
        let max_url_len = self.config.max_redirect_url_len;
        let policy = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() > max_redirects {
                attempt.error(format!("stopped after {} redirects", max_redirects))
            } else if attempt.url().as_str().len() > max_url_len {
                attempt.error(format!(
                    "redirect URL longer than {} characters",
                    max_url_len
                ))
            } else {
                attempt.follow()
            }
        });

        reqwest::Client::builder()
            .connect_timeout(self.config.timeout())
            .timeout(self.config.timeout())
            .pool_max_idle_per_host(0)
            .redirect(policy)
            .user_agent(concat!("sentinel-ca/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ValidationError::Connection {
                target: "http client".to_string(),
                message: e.to_string(),
            })
    }

    pub async fn validate(
        &self,
        identifier: &Identifier,
        token: &str,
        thumbprint: &str,
    ) -> Result<(), ValidationError> {
        let url = self.challenge_url(identifier, token);
        debug!(url = %url, "Fetching HTTP-01 challenge response");

        let connection_error = |e: reqwest::Error| ValidationError::Connection {
            target: url.clone(),
            message: e.to_string(),
        };

        let mut response = self
            .client()?
            .get(&url)
            .send()
            .await
            .map_err(connection_error)?;

        if !response.status().is_success() {
            return Err(ValidationError::IncorrectResponse(format!(
                "{} returned HTTP {}",
                url,
                response.status()
            )));
        }

        let limit = self.config.max_body_bytes;
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(connection_error)? {
            if body.len() + chunk.len() > limit {
                return Err(ValidationError::BodyTooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        let min_len = token.len() + 1 + thumbprint.len();
        if body.len() < min_len {
            return Err(ValidationError::IncorrectResponse(format!(
                "response is {} bytes, expected at least {}",
                body.len(),
                min_len
            )));
        }

        let text = std::str::from_utf8(&body).map_err(|_| {
            ValidationError::IncorrectResponse("response is not valid UTF-8".to_string())
        })?;

        // RFC 8555 §8.3: trailing whitespace is ignored
        validate_key_authorization(text.trim_end(), token, thumbprint)
    }
}

// ============================================================================
// DNS-01
// ============================================================================

/// DNS-01 validator
#[derive(Debug)]
pub struct Dns01Validator {
    resolver: TokioResolver,
}

impl Dns01Validator {
    pub fn new(config: &Dns01Config) -> Self {
        let resolver_config = if config.nameservers.is_empty() {
            ResolverConfig::default()
        } else {
            let mut resolver_config = ResolverConfig::new();
            for ip in &config.nameservers {
                resolver_config.add_name_server(NameServerConfig::new(
                    SocketAddr::new(*ip, 53),
                    Protocol::Udp,
                ));
            }
            resolver_config
        };

        let mut opts = ResolverOpts::default();
        opts.timeout = config.timeout();
        opts.attempts = 2;
        opts.cache_size = 0; // Every attempt must observe the current record

        let resolver =
            Resolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
                .with_options(opts)
                .build();

        Self { resolver }
    }

    /// Fully-qualified TXT record name for an identifier
    pub fn record_name(identifier: &Identifier) -> String {
        format!(
            "{}.{}.",
            DNS01_LABEL,
            identifier.value.trim_end_matches('.')
        )
    }

    pub async fn validate(
        &self,
        identifier: &Identifier,
        token: &str,
        thumbprint: &str,
    ) -> Result<(), ValidationError> {
        let name = Self::record_name(identifier);
        let expected = dns01_digest(&key_authorization(token, thumbprint));
        debug!(record = %name, "Looking up DNS-01 TXT record");

        let lookup = self
            .resolver
            .txt_lookup(name.as_str())
            .await
            .map_err(|e| ValidationError::Dns {
                name: name.clone(),
                message: e.to_string(),
            })?;

        for record in lookup.iter() {
            // TXT records can have multiple strings, join them
            let value: String = record
                .txt_data()
                .iter()
                .map(|data| String::from_utf8_lossy(data))
                .collect();

            trace!(record = %name, found_value = %value, "Checking TXT record");

            if value == expected {
                return Ok(());
            }
        }

        Err(ValidationError::IncorrectResponse(format!(
            "no TXT record at {} matches the expected digest",
            name
        )))
    }
}

// ============================================================================
// Network Validator
// ============================================================================

/// Production validator dispatching on challenge type
#[derive(Debug)]
pub struct NetworkValidator {
    http01: Http01Validator,
    dns01: Dns01Validator,
}

impl NetworkValidator {
    pub fn new(http01: &Http01Config, dns01: &Dns01Config) -> Self {
        Self {
            http01: Http01Validator::new(http01.clone()),
            dns01: Dns01Validator::new(dns01),
        }
    }
}

#[async_trait]
impl ChallengeValidator for NetworkValidator {
    async fn validate(
        &self,
        challenge_type: ChallengeType,
        identifier: &Identifier,
        token: &str,
        thumbprint: &str,
    ) -> Result<(), ValidationError> {
        match challenge_type {
            ChallengeType::Http01 => self.http01.validate(identifier, token, thumbprint).await,
            ChallengeType::Dns01 => self.dns01.validate(identifier, token, thumbprint).await,
            ChallengeType::TlsAlpn01 => Err(ValidationError::Unsupported(
                "tls-alpn-01 validation is not implemented".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TOKEN: &str = "evaGxfADs6pSRb2LAv9IZf17Dt3juxGJ-PCt92wr-oA";
    const THUMBPRINT: &str = "9jg46WB3rR_AHD-EBXdN7cBkH1WOu0tA3M9fm21mqTI";

    #[test]
    fn test_key_authorization_accepts_exact_match() {
        let presented = key_authorization(TOKEN, THUMBPRINT);
        assert_eq!(validate_key_authorization(&presented, TOKEN, THUMBPRINT), Ok(()));
    }

    #[test]
    fn test_key_authorization_rejects_bad_shapes() {
        for presented in ["", ".", "a.", ".b", "a.b.c"] {
            let err = validate_key_authorization(presented, "a", "b").unwrap_err();
            assert!(!err.to_string().is_empty(), "no description for {:?}", presented);
        }
        assert!(validate_key_authorization("a.b", "a", "b").is_ok());
    }

    #[test]
    fn test_key_authorization_rejects_swapped_order() {
        let swapped = format!("{}.{}", THUMBPRINT, TOKEN);
        assert!(matches!(
            validate_key_authorization(&swapped, TOKEN, THUMBPRINT),
            Err(ValidationError::IncorrectResponse(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_only_exact_key_authorization_validates(
            token in "[A-Za-z0-9_-]{1,16}",
            thumb in "[A-Za-z0-9_-]{1,16}",
            presented in "[A-Za-z0-9_.-]{0,34}",
        ) {
            let ok = validate_key_authorization(&presented, &token, &thumb).is_ok();
            prop_assert_eq!(ok, presented == format!("{}.{}", token, thumb));
        }
    }

    #[test]
    fn test_dns01_digest_rfc_example() {
        // RFC 8555 §8.4 shape: 43 characters of base64url
        let digest = dns01_digest(&key_authorization(TOKEN, THUMBPRINT));
        assert_eq!(digest.len(), 43);
        assert!(!digest.contains('='));
        assert_eq!(
            digest,
            URL_SAFE_NO_PAD.encode(Sha256::digest(format!("{}.{}", TOKEN, THUMBPRINT)))
        );
    }

    #[test]
    fn test_supports_matrix() {
        let dns = Identifier::dns("example.com");
        let ip = Identifier::ip("192.0.2.1");

        assert!(supports(ChallengeType::Http01, &dns, false));
        assert!(!supports(ChallengeType::Http01, &dns, true));
        assert!(supports(ChallengeType::Dns01, &dns, true));
        assert!(!supports(ChallengeType::Dns01, &ip, false));
        assert!(supports(ChallengeType::Http01, &ip, false));
    }

    #[test]
    fn test_challenge_url() {
        let validator = Http01Validator::new(Http01Config::default());
        assert_eq!(
            validator.challenge_url(&Identifier::dns("example.com"), "tok"),
            "http://example.com/.well-known/acme-challenge/tok"
        );
        assert_eq!(
            validator.challenge_url(&Identifier::ip("2001:db8::1"), "tok"),
            "http://[2001:db8::1]/.well-known/acme-challenge/tok"
        );

        let validator = Http01Validator::new(Http01Config {
            port: 5002,
            ..Http01Config::default()
        });
        assert_eq!(
            validator.challenge_url(&Identifier::ip("127.0.0.1"), "tok"),
            "http://127.0.0.1:5002/.well-known/acme-challenge/tok"
        );
    }

    #[test]
    fn test_dns01_record_name() {
        assert_eq!(
            Dns01Validator::record_name(&Identifier::dns("example.com")),
            "_acme-challenge.example.com."
        );
    }

    #[test]
    fn test_problem_kinds() {
        let err = ValidationError::Connection {
            target: "http://x".into(),
            message: "refused".into(),
        };
        assert_eq!(err.problem().kind(), "connection");
        assert!(err.is_retryable());

        let err = ValidationError::Unsupported("tls-alpn-01".into());
        assert!(!err.is_retryable());
    }

    async fn mock_validator(server: &MockServer) -> Http01Validator {
        Http01Validator::new(Http01Config {
            port: server.address().port(),
            timeout_secs: 2,
            ..Http01Config::default()
        })
    }

    fn challenge_path() -> String {
        format!("{}{}", ACME_CHALLENGE_PREFIX, TOKEN)
    }

    #[tokio::test]
    async fn test_http01_success_with_trailing_whitespace() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(challenge_path()))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(format!("{}\r\n  \n", key_authorization(TOKEN, THUMBPRINT))),
            )
            .expect(1)
            .mount(&server)
            .await;

        let validator = mock_validator(&server).await;
        let result = validator
            .validate(&Identifier::ip("127.0.0.1"), TOKEN, THUMBPRINT)
            .await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn test_http01_wrong_thumbprint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(challenge_path()))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(key_authorization(TOKEN, &"x".repeat(THUMBPRINT.len()))),
            )
            .mount(&server)
            .await;

        let validator = mock_validator(&server).await;
        let err = validator
            .validate(&Identifier::ip("127.0.0.1"), TOKEN, THUMBPRINT)
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::IncorrectResponse(_)));
    }

    #[tokio::test]
    async fn test_http01_body_too_large() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(challenge_path()))
            .respond_with(ResponseTemplate::new(200).set_body_string("a".repeat(4096)))
            .mount(&server)
            .await;

        let validator = mock_validator(&server).await;
        let err = validator
            .validate(&Identifier::ip("127.0.0.1"), TOKEN, THUMBPRINT)
            .await
            .unwrap_err();
        assert_eq!(err, ValidationError::BodyTooLarge { limit: 512 });
    }

    #[tokio::test]
    async fn test_http01_short_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(challenge_path()))
            .respond_with(ResponseTemplate::new(200).set_body_string(TOKEN))
            .mount(&server)
            .await;

        let validator = mock_validator(&server).await;
        let err = validator
            .validate(&Identifier::ip("127.0.0.1"), TOKEN, THUMBPRINT)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expected at least"));
    }

    #[tokio::test]
    async fn test_http01_not_found() {
        let server = MockServer::start().await;
        let validator = mock_validator(&server).await;

        let err = validator
            .validate(&Identifier::ip("127.0.0.1"), TOKEN, THUMBPRINT)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_http01_redirect_loop_is_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(challenge_path()))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", challenge_path()))
            .mount(&server)
            .await;

        let validator = mock_validator(&server).await;
        let err = validator
            .validate(&Identifier::ip("127.0.0.1"), TOKEN, THUMBPRINT)
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_http01_connection_refused() {
        // Bind then drop a listener to get a port nobody is serving
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let validator = Http01Validator::new(Http01Config {
            port,
            timeout_secs: 2,
            ..Http01Config::default()
        });

        let err = validator
            .validate(&Identifier::ip("127.0.0.1"), TOKEN, THUMBPRINT)
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::Connection { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_network_validator_rejects_tls_alpn() {
        let validator = NetworkValidator::new(&Http01Config::default(), &Dns01Config::default());
        let err = validator
            .validate(
                ChallengeType::TlsAlpn01,
                &Identifier::dns("example.com"),
                TOKEN,
                THUMBPRINT,
            )
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
