use std::collections::HashMap;
use std::sync::RwLock;

use actix_web::HttpRequest;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::JwtConfig;
use crate::error::{AppError, AppResult};

/// The authenticated (or anonymous) caller attached to every request once it
/// passes the auth stage. Policy evaluation and ownership checks read this,
/// never the raw token.
#[derive(Debug, Clone)]
pub struct Principal {
    pub authenticated: bool,
    pub user_id: Option<String>,
    pub role: String,
    pub tenant_id: Option<String>,
    pub claims: HashMap<String, Value>,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self {
            authenticated: false,
            user_id: None,
            role: "anonymous".to_string(),
            tenant_id: None,
            claims: HashMap::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims(HashMap<String, Value>);

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: Option<String>,
    kty: String,
    n: Option<String>,
    e: Option<String>,
    x: Option<String>,
    y: Option<String>,
    crv: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

/// Keys fetched from `jwt.jwks_url`, refreshed on `jwks_refresh_interval_secs`
/// by a background task spawned in `main`. Lookups key on the token's `kid`.
#[derive(Default)]
pub struct JwksCache {
    keys: RwLock<HashMap<String, DecodingKey>>,
}

impl JwksCache {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }

    pub async fn refresh(&self, jwks_url: &str) -> AppResult<usize> {
        let body = reqwest::get(jwks_url)
            .await
            .map_err(|e| AppError::Auth(format!("jwks fetch failed: {e}")))?
            .json::<JwkSet>()
            .await
            .map_err(|e| AppError::Auth(format!("jwks response malformed: {e}")))?;

        let mut decoded = HashMap::new();
        for jwk in body.keys {
            let Some(kid) = jwk.kid.clone() else { continue };
            if let Some(key) = decode_jwk(&jwk) {
                decoded.insert(kid, key);
            }
        }

        let count = decoded.len();
        let mut guard = self
            .keys
            .write()
            .map_err(|_| AppError::Auth("jwks cache poisoned".to_string()))?;
        *guard = decoded;
        Ok(count)
    }

    fn get(&self, kid: &str) -> Option<DecodingKey> {
        self.keys.read().ok()?.get(kid).cloned()
    }
}

fn decode_jwk(jwk: &Jwk) -> Option<DecodingKey> {
    match jwk.kty.as_str() {
        "RSA" => {
            let n = jwk.n.as_ref()?;
            let e = jwk.e.as_ref()?;
            DecodingKey::from_rsa_components(n, e).ok()
        }
        "EC" => {
            let x = jwk.x.as_ref()?;
            let y = jwk.y.as_ref()?;
            DecodingKey::from_ec_components(x, y).ok()
        }
        _ => None,
    }
}

/// Verifies bearer tokens against the configured allow-list of algorithms,
/// resolving signing keys either from the static HMAC secret (`HS*`) or the
/// JWKS cache by `kid` (`RS*`/`ES*`), and builds a [`Principal`] from the
/// configured role claim.
pub struct AuthVerifier {
    config: JwtConfig,
    jwks: JwksCache,
}

impl AuthVerifier {
    pub fn new(config: JwtConfig) -> Self {
        Self {
            config,
            jwks: JwksCache::new(),
        }
    }

    pub async fn refresh_jwks(&self) -> AppResult<usize> {
        match &self.config.jwks_url {
            Some(url) => self.jwks.refresh(url).await,
            None => Ok(0),
        }
    }

    pub fn refresh_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.jwks_refresh_interval_secs)
    }

    /// Resolve a [`Principal`] for an incoming request. Absent any token this
    /// returns the anonymous principal rather than an error; it is the
    /// policy engine's job to decide whether anonymous access is permitted.
    pub fn authenticate(&self, req: &HttpRequest) -> AppResult<Principal> {
        if !self.config.enabled {
            return Ok(Principal::anonymous());
        }

        match extract_token(req) {
            Some(token) => self.verify(&token),
            None => Ok(Principal::anonymous()),
        }
    }

    fn verify(&self, token: &str) -> AppResult<Principal> {
        let header = decode_header(token)?;
        let algorithm = header.alg;

        if !self.algorithm_allowed(algorithm) {
            return Err(AppError::Auth(format!(
                "algorithm not permitted: {algorithm:?}"
            )));
        }

        let key = self.resolve_key(algorithm, header.kid.as_deref())?;

        let mut validation = Validation::new(algorithm);
        validation.leeway = 60;
        if let Some(iss) = &self.config.issuer {
            validation.set_issuer(&[iss]);
        }
        if let Some(aud) = &self.config.audience {
            validation.set_audience(&[aud]);
        } else {
            validation.validate_aud = false;
        }

        let data = decode::<Claims>(token, &key, &validation)?;
        Ok(self.principal_from_claims(data.claims.0))
    }

    fn algorithm_allowed(&self, algorithm: Algorithm) -> bool {
        let name = format!("{algorithm:?}");
        self.config
            .algorithm_allow_list
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&name))
    }

    fn resolve_key(&self, algorithm: Algorithm, kid: Option<&str>) -> AppResult<DecodingKey> {
        match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                let secret = self
                    .config
                    .secret
                    .as_deref()
                    .ok_or_else(|| AppError::Auth("no HMAC secret configured".to_string()))?;
                Ok(DecodingKey::from_secret(secret.as_bytes()))
            }
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::ES256
            | Algorithm::ES384 => {
                let kid = kid.ok_or_else(|| AppError::Auth("token missing kid".to_string()))?;
                self.jwks
                    .get(kid)
                    .ok_or_else(|| AppError::Auth(format!("unknown signing key: {kid}")))
            }
            other => Err(AppError::Auth(format!("unsupported algorithm: {other:?}"))),
        }
    }

    fn principal_from_claims(&self, claims: HashMap<String, Value>) -> Principal {
        let role = claims
            .get(&self.config.role_claim)
            .and_then(Value::as_str)
            .unwrap_or("authenticated")
            .to_string();

        let user_id = claims
            .get("sub")
            .and_then(Value::as_str)
            .map(str::to_string);

        let tenant_id = claims
            .get("tenant_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        Principal {
            authenticated: true,
            user_id,
            role,
            tenant_id,
            claims,
        }
    }
}

/// Token location precedence: `Authorization: Bearer`, then `?token=`, then
/// the `jwt_token` cookie.
fn extract_token(req: &HttpRequest) -> Option<String> {
    if let Some(header) = req.headers().get(actix_web::http::header::AUTHORIZATION) {
        if let Ok(value) = header.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }

    if let Some(token) = req.query_string().split('&').find_map(|pair| {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next()?;
        let value = parts.next()?;
        if key == "token" {
            Some(value.to_string())
        } else {
            None
        }
    }) {
        return Some(token);
    }

    req.cookie("jwt_token").map(|c| c.value().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn hmac_config(secret: &str) -> JwtConfig {
        JwtConfig {
            enabled: true,
            algorithm_allow_list: vec!["HS256".to_string()],
            secret: Some(secret.to_string()),
            jwks_url: None,
            issuer: None,
            audience: None,
            role_claim: "role".to_string(),
            jwks_refresh_interval_secs: 300,
        }
    }

    fn make_token(secret: &str, claims: &serde_json::Map<String, Value>) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &Claims(claims.clone().into_iter().collect()),
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn disabled_auth_returns_anonymous() {
        let mut config = hmac_config("s3cr3t");
        config.enabled = false;
        let verifier = AuthVerifier::new(config);
        let req = TestRequest::default().to_http_request();
        let principal = verifier.authenticate(&req).unwrap();
        assert!(!principal.authenticated);
        assert_eq!(principal.role, "anonymous");
    }

    #[test]
    fn missing_token_is_anonymous_when_enabled() {
        let verifier = AuthVerifier::new(hmac_config("s3cr3t"));
        let req = TestRequest::default().to_http_request();
        let principal = verifier.authenticate(&req).unwrap();
        assert!(!principal.authenticated);
    }

    #[test]
    fn valid_bearer_token_resolves_role_and_subject() {
        let now = 2_000_000_000i64;
        let mut claims = serde_json::Map::new();
        claims.insert("sub".to_string(), json!("user-1"));
        claims.insert("role".to_string(), json!("editor"));
        claims.insert("exp".to_string(), json!(now + 3600));
        let token = make_token("s3cr3t", &claims);

        let verifier = AuthVerifier::new(hmac_config("s3cr3t"));
        let req = TestRequest::default()
            .insert_header(("Authorization", format!("Bearer {token}")))
            .to_http_request();

        let principal = verifier.authenticate(&req).unwrap();
        assert!(principal.authenticated);
        assert_eq!(principal.role, "editor");
        assert_eq!(principal.user_id.as_deref(), Some("user-1"));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let now = 2_000_000_000i64;
        let mut claims = serde_json::Map::new();
        claims.insert("sub".to_string(), json!("user-1"));
        claims.insert("exp".to_string(), json!(now + 3600));
        let token = make_token("other-secret", &claims);

        let verifier = AuthVerifier::new(hmac_config("s3cr3t"));
        let req = TestRequest::default()
            .insert_header(("Authorization", format!("Bearer {token}")))
            .to_http_request();

        assert!(verifier.authenticate(&req).is_err());
    }

    #[test]
    fn disallowed_algorithm_is_rejected() {
        let now = 2_000_000_000i64;
        let mut claims = serde_json::Map::new();
        claims.insert("sub".to_string(), json!("user-1"));
        claims.insert("exp".to_string(), json!(now + 3600));
        let token = make_token("s3cr3t", &claims);

        let mut config = hmac_config("s3cr3t");
        config.algorithm_allow_list = vec!["RS256".to_string()];
        let verifier = AuthVerifier::new(config);
        let req = TestRequest::default()
            .insert_header(("Authorization", format!("Bearer {token}")))
            .to_http_request();

        assert!(verifier.authenticate(&req).is_err());
    }

    #[test]
    fn token_extracted_from_query_string() {
        let now = 2_000_000_000i64;
        let mut claims = serde_json::Map::new();
        claims.insert("sub".to_string(), json!("user-1"));
        claims.insert("exp".to_string(), json!(now + 3600));
        let token = make_token("s3cr3t", &claims);

        let verifier = AuthVerifier::new(hmac_config("s3cr3t"));
        let req = TestRequest::default()
            .uri(&format!("/widgets?token={token}"))
            .to_http_request();

        let principal = verifier.authenticate(&req).unwrap();
        assert!(principal.authenticated);
    }
}
