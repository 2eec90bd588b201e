/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::fetch::{read_body_limited, MAX_REMOTE_DOC_BYTES};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use http::{request::Parts, HeaderMap, Method, Uri};
use httpdate::parse_http_date;
use rsa::{
    pkcs1v15::{SigningKey, VerifyingKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    signature::{RandomizedSigner, SignatureEncoding, Verifier},
    RsaPrivateKey, RsaPublicKey,
};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::debug;

pub const ACTIVITY_ACCEPT: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

const KEY_CACHE_TTL: Duration = Duration::from_secs(300);

/// Who signed a request, once the signature checked out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSignature {
    pub key_id: String,
    pub actor_url: String,
}

#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    async fn verify(&self, parts: &Parts, body: &[u8]) -> Result<VerifiedSignature>;
}

/// Draft-cavage HTTP Signatures with RSA-SHA256, the dialect Mastodon speaks.
pub struct HttpSignatureVerifier {
    keys: KeyResolver,
    max_date_skew: Duration,
}

impl HttpSignatureVerifier {
    pub fn new(keys: KeyResolver, max_date_skew: Duration) -> Self {
        Self { keys, max_date_skew }
    }
}

#[async_trait]
impl SignatureVerifier for HttpSignatureVerifier {
    async fn verify(&self, parts: &Parts, body: &[u8]) -> Result<VerifiedSignature> {
        let header = parts
            .headers
            .get("Signature")
            .ok_or_else(|| anyhow!("missing Signature header"))?
            .to_str()
            .context("Signature header not utf8")?;
        verify_date(&parts.headers, self.max_date_skew)?;
        if !body.is_empty() {
            require_digest(&parts.headers, body)?;
        }

        let sig = parse_signature_header(header)?;
        require_covered(&sig.headers, !body.is_empty())?;
        let signing_string = build_signing_string(&parts.method, &parts.uri, &parts.headers, &sig.headers)?;
        let key = self.keys.resolve(&sig.key_id).await?;
        verify_signature_rsa_sha256(&key.public_key_pem, &signing_string, &sig.signature)?;
        debug!(key_id = %sig.key_id, actor = %key.owner, "signature ok");
        Ok(VerifiedSignature {
            key_id: sig.key_id,
            actor_url: key.owner,
        })
    }
}

#[derive(Clone)]
pub struct KeyResolver {
    client: reqwest::Client,
    cache: Arc<RwLock<HashMap<String, CachedKey>>>,
}

#[derive(Clone)]
struct CachedKey {
    key: PublicKeyInfo,
    expires_at: std::time::Instant,
}

#[derive(Debug, Clone)]
pub struct PublicKeyInfo {
    pub key_id: String,
    pub owner: String,
    pub public_key_pem: String,
}

impl KeyResolver {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn resolve(&self, key_id: &str) -> Result<PublicKeyInfo> {
        let actor_url = key_id.split_once('#').map(|(a, _)| a).unwrap_or(key_id).to_string();

        if let Some(hit) = self.cached(&actor_url).await {
            if hit.key_id == key_id || !key_id.contains('#') {
                return Ok(hit);
            }
        }

        let resp = self
            .client
            .get(&actor_url)
            .header("Accept", ACTIVITY_ACCEPT)
            .send()
            .await
            .with_context(|| format!("fetch actor: {actor_url}"))?
            .error_for_status()
            .with_context(|| format!("actor not ok: {actor_url}"))?;
        let bytes = read_body_limited(resp, MAX_REMOTE_DOC_BYTES).await?;
        let doc: KeyOwnerDoc =
            serde_json::from_slice(&bytes).with_context(|| format!("parse actor json from {actor_url}"))?;
        let pk = doc.public_key.ok_or_else(|| anyhow!("actor missing publicKey"))?;
        let info = PublicKeyInfo {
            key_id: pk.id,
            owner: pk.owner.or(doc.id).unwrap_or_else(|| actor_url.clone()),
            public_key_pem: pk.public_key_pem,
        };

        let mut cache = self.cache.write().await;
        cache.insert(
            actor_url,
            CachedKey {
                key: info.clone(),
                expires_at: std::time::Instant::now() + KEY_CACHE_TTL,
            },
        );
        Ok(info)
    }

    async fn cached(&self, actor_url: &str) -> Option<PublicKeyInfo> {
        let mut cache = self.cache.write().await;
        let now = std::time::Instant::now();
        match cache.get(actor_url) {
            Some(v) if v.expires_at > now => Some(v.key.clone()),
            Some(_) => {
                cache.remove(actor_url);
                None
            }
            None => None,
        }
    }
}

#[derive(Debug)]
pub struct SignatureParams {
    pub key_id: String,
    pub headers: Vec<String>,
    pub signature: Vec<u8>,
}

pub fn parse_signature_header(value: &str) -> Result<SignatureParams> {
    // keyId="...",algorithm="rsa-sha256",headers="(request-target) host date",signature="..."
    let mut map = HashMap::<&str, &str>::new();
    for part in value.split(',') {
        let Some((k, v)) = part.trim().split_once('=') else { continue };
        map.insert(k.trim(), v.trim().trim_matches('"'));
    }

    let key_id = map.get("keyId").ok_or_else(|| anyhow!("Signature missing keyId"))?;
    let headers = map.get("headers").copied().unwrap_or("date");
    let signature_b64 = map
        .get("signature")
        .ok_or_else(|| anyhow!("Signature missing signature"))?;
    let signature = B64.decode(signature_b64.as_bytes()).context("decode signature")?;

    Ok(SignatureParams {
        key_id: key_id.to_string(),
        headers: headers.split_whitespace().map(str::to_ascii_lowercase).collect(),
        signature,
    })
}

pub fn build_signing_string(method: &Method, uri: &Uri, headers: &HeaderMap, signed_headers: &[String]) -> Result<String> {
    let mut lines = Vec::with_capacity(signed_headers.len());
    for name in signed_headers {
        if name == "(request-target)" {
            let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or_else(|| uri.path());
            lines.push(format!("(request-target): {} {target}", method.as_str().to_ascii_lowercase()));
            continue;
        }
        let header_name = http::header::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("bad signed header name: {name}"))?;
        let value = headers
            .get(&header_name)
            .ok_or_else(|| anyhow!("missing signed header: {name}"))?
            .to_str()
            .with_context(|| format!("invalid header value for {name}"))?;
        lines.push(format!("{name}: {}", value.trim()));
    }
    Ok(lines.join("\n"))
}

/// Headers a signature has to cover before it authenticates anything:
/// the target and date always, plus host and digest when there is a body.
pub fn require_covered(signed_headers: &[String], has_body: bool) -> Result<()> {
    let mut required = vec!["(request-target)", "date"];
    if has_body {
        required.extend(["host", "digest"]);
    }
    for name in required {
        if !signed_headers.iter().any(|h| h == name) {
            return Err(anyhow!("signature does not cover {name}"));
        }
    }
    Ok(())
}

/// Bodies must carry a `Digest` that matches; signing a request without one
/// would leave the payload unauthenticated.
pub fn require_digest(headers: &HeaderMap, body: &[u8]) -> Result<()> {
    if !headers.contains_key("Digest") {
        return Err(anyhow!("missing Digest header"));
    }
    verify_digest_if_present(headers, body)
}

pub fn verify_digest_if_present(headers: &HeaderMap, body: &[u8]) -> Result<()> {
    let Some(digest) = headers.get("Digest") else {
        return Ok(());
    };
    let digest = digest.to_str().context("Digest header not utf8")?;
    // Digest: SHA-256=base64
    let Some((alg, value)) = digest.split_once('=') else {
        return Err(anyhow!("invalid Digest header"));
    };
    if !alg.trim().eq_ignore_ascii_case("SHA-256") {
        return Err(anyhow!("unsupported digest alg: {alg}"));
    }
    let expected = B64.decode(value.trim().as_bytes()).context("decode digest")?;
    if expected.as_slice() != Sha256::digest(body).as_slice() {
        return Err(anyhow!("digest mismatch"));
    }
    Ok(())
}

pub fn verify_date(headers: &HeaderMap, max_skew: Duration) -> Result<()> {
    let date = headers
        .get("Date")
        .ok_or_else(|| anyhow!("missing Date header"))?
        .to_str()
        .context("Date header not utf8")?;
    let ts = parse_http_date(date).context("parse Date header")?;
    let now = std::time::SystemTime::now();
    let diff = now
        .duration_since(ts)
        .or_else(|_| ts.duration_since(now))
        .unwrap_or_default();
    if diff > max_skew {
        return Err(anyhow!("Date skew too large: {}s", diff.as_secs()));
    }
    Ok(())
}

pub fn verify_signature_rsa_sha256(public_key_pem: &str, signing_string: &str, signature: &[u8]) -> Result<()> {
    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem).context("parse public key pem")?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let sig = rsa::pkcs1v15::Signature::try_from(signature).context("invalid rsa signature bytes")?;
    verifying_key
        .verify(signing_string.as_bytes(), &sig)
        .context("signature verify failed")?;
    Ok(())
}

/// Signs an outbound request in place (adds `Date`, `Host`, `Digest` when
/// needed, then `Signature`).
pub fn sign_request_rsa_sha256(
    private_key_pem: &str,
    key_id: &str,
    method: &Method,
    uri: &Uri,
    headers: &mut HeaderMap,
    body: &[u8],
    signed_headers: &[&str],
) -> Result<()> {
    if !headers.contains_key("Date") {
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());
        headers.insert("Date", date.parse().context("set Date")?);
    }
    if !body.is_empty() && !headers.contains_key("Digest") {
        let digest_b64 = B64.encode(Sha256::digest(body));
        headers.insert("Digest", format!("SHA-256={digest_b64}").parse().context("set Digest")?);
    }
    if !headers.contains_key("Host") {
        if let Some(auth) = uri.authority() {
            headers.insert("Host", auth.as_str().parse().context("set Host")?);
        }
    }

    let signed: Vec<String> = signed_headers.iter().map(|s| s.to_ascii_lowercase()).collect();
    let signing_string = build_signing_string(method, uri, headers, &signed)?;

    let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem).context("parse private key pem")?;
    let signing_key = SigningKey::<Sha256>::new(private_key);
    let signature = signing_key.sign_with_rng(&mut rand::rngs::OsRng, signing_string.as_bytes());
    let sig_b64 = B64.encode(signature.to_bytes());

    let sig_header = format!(
        "keyId=\"{key_id}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{sig_b64}\"",
        signed.join(" ")
    );
    headers.insert("Signature", sig_header.parse().context("set Signature")?);
    Ok(())
}

#[derive(Debug, Deserialize)]
struct KeyOwnerDoc {
    id: Option<String>,
    #[serde(rename = "publicKey")]
    public_key: Option<KeyOwnerPublicKey>,
}

#[derive(Debug, Deserialize)]
struct KeyOwnerPublicKey {
    id: String,
    owner: Option<String>,
    #[serde(rename = "publicKeyPem")]
    public_key_pem: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};

    fn keypair() -> (String, String) {
        let key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 1024).unwrap();
        let private_pem = key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string();
        let public_pem = RsaPublicKey::from(&key).to_public_key_pem(LineEnding::LF).unwrap();
        (private_pem, public_pem)
    }

    #[test]
    fn parses_signature_header_fields() {
        let sig = parse_signature_header(
            r#"keyId="https://r.example/users/bob#main-key",algorithm="rsa-sha256",headers="(request-target) Host date",signature="AAEC""#,
        )
        .unwrap();
        assert_eq!(sig.key_id, "https://r.example/users/bob#main-key");
        assert_eq!(sig.headers, vec!["(request-target)", "host", "date"]);
        assert_eq!(sig.signature, vec![0, 1, 2]);
    }

    fn verifier_trusting(key_id: &str, public_pem: &str) -> HttpSignatureVerifier {
        let resolver = KeyResolver::new(reqwest::Client::new());
        let actor = key_id.split_once('#').map(|(a, _)| a).unwrap_or(key_id).to_string();
        resolver.cache.try_write().unwrap().insert(
            actor.clone(),
            CachedKey {
                key: PublicKeyInfo {
                    key_id: key_id.to_string(),
                    owner: actor,
                    public_key_pem: public_pem.to_string(),
                },
                expires_at: std::time::Instant::now() + KEY_CACHE_TTL,
            },
        );
        HttpSignatureVerifier::new(resolver, Duration::from_secs(3600))
    }

    fn signed_post(private_pem: &str, key_id: &str, body: &[u8], covered: &[&str]) -> Parts {
        let uri: Uri = "https://l.example/users/1/inbox".parse().unwrap();
        let mut headers = HeaderMap::new();
        sign_request_rsa_sha256(private_pem, key_id, &Method::POST, &uri, &mut headers, body, covered).unwrap();
        let (mut parts, ()) = http::Request::builder().method(Method::POST).uri(uri).body(()).unwrap().into_parts();
        parts.headers = headers;
        parts
    }

    #[tokio::test]
    async fn body_swapped_under_a_digest_less_signature_is_refused() {
        let (private_pem, public_pem) = keypair();
        let key_id = "https://r.example/users/bob#main-key";
        let verifier = verifier_trusting(key_id, &public_pem);

        let like = br#"{"type":"Like"}"#;
        let delete = br#"{"type":"Delete"}"#;
        let mut parts = signed_post(&private_pem, key_id, like, &["(request-target)", "host", "date"]);
        let digest = B64.encode(Sha256::digest(delete));
        parts
            .headers
            .insert("Digest", format!("SHA-256={digest}").parse().unwrap());
        assert!(verifier.verify(&parts, delete).await.is_err());

        let full = ["(request-target)", "host", "date", "digest"];
        let mut parts = signed_post(&private_pem, key_id, like, &full);
        assert_eq!(
            verifier.verify(&parts, like).await.unwrap().actor_url,
            "https://r.example/users/bob"
        );
        parts
            .headers
            .insert("Digest", format!("SHA-256={digest}").parse().unwrap());
        assert!(verifier.verify(&parts, delete).await.is_err());
    }

    #[test]
    fn coverage_depends_on_the_body() {
        let names = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert!(require_covered(&names(&["(request-target)", "host", "date"]), false).is_ok());
        assert!(require_covered(&names(&["host", "date"]), false).is_err());
        assert!(require_covered(&names(&["(request-target)", "host", "date"]), true).is_err());
        assert!(require_covered(&names(&["(request-target)", "host", "date", "digest"]), true).is_ok());
        assert!(require_covered(&names(&["date"]), false).is_err());
    }

    #[test]
    fn signature_header_without_key_id_fails() {
        assert!(parse_signature_header(r#"signature="AAEC""#).is_err());
    }

    #[test]
    fn signing_string_includes_query() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "l.example".parse().unwrap());
        let uri: Uri = "https://l.example/users/1/inbox?x=1".parse().unwrap();
        let s = build_signing_string(
            &Method::POST,
            &uri,
            &headers,
            &["(request-target)".to_string(), "host".to_string()],
        )
        .unwrap();
        assert_eq!(s, "(request-target): post /users/1/inbox?x=1\nhost: l.example");
    }

    #[test]
    fn digest_mismatch_is_rejected() {
        let mut headers = HeaderMap::new();
        let digest = B64.encode(Sha256::digest(b"original"));
        headers.insert("Digest", format!("SHA-256={digest}").parse().unwrap());
        assert!(verify_digest_if_present(&headers, b"original").is_ok());
        assert!(verify_digest_if_present(&headers, b"tampered").is_err());
        assert!(require_digest(&HeaderMap::new(), b"body").is_err());
    }

    #[test]
    fn stale_date_is_rejected() {
        let mut headers = HeaderMap::new();
        let old = std::time::SystemTime::now() - Duration::from_secs(7200);
        headers.insert("Date", httpdate::fmt_http_date(old).parse().unwrap());
        assert!(verify_date(&headers, Duration::from_secs(3600)).is_err());
        assert!(verify_date(&headers, Duration::from_secs(10_000)).is_ok());
    }

    #[test]
    fn signed_request_verifies_and_detects_tampering() {
        let (private_pem, public_pem) = keypair();
        let uri: Uri = "https://l.example/inbox".parse().unwrap();
        let mut headers = HeaderMap::new();
        sign_request_rsa_sha256(
            &private_pem,
            "https://r.example/users/bob#main-key",
            &Method::POST,
            &uri,
            &mut headers,
            b"{}",
            &["(request-target)", "host", "date", "digest"],
        )
        .unwrap();

        let sig = parse_signature_header(headers.get("Signature").unwrap().to_str().unwrap()).unwrap();
        let signing = build_signing_string(&Method::POST, &uri, &headers, &sig.headers).unwrap();
        assert!(verify_signature_rsa_sha256(&public_pem, &signing, &sig.signature).is_ok());

        let other: Uri = "https://l.example/users/2/inbox".parse().unwrap();
        let forged = build_signing_string(&Method::POST, &other, &headers, &sig.headers).unwrap();
        assert!(verify_signature_rsa_sha256(&public_pem, &forged, &sig.signature).is_err());
    }
}
