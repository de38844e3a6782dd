//! Kite identity, salts and request signatures.
//!
//! A signature is HMAC-SHA256 keyed by the kite's shared secret over the
//! canonical kite name and the salts, hex encoded and truncated. Secrets
//! never leave this module in any formatted form.

use std::fmt;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};
use crate::request::ParsedKiteRequest;

type HmacSha256 = Hmac<Sha256>;

/// Random bytes in a salt, before hex encoding.
pub const SALT_BYTES: usize = 18;

/// Signature length used for outbound kite requests.
pub const SIGNATURE_LENGTH: usize = 36;

/// Shortest signature accepted on verification.
pub const MIN_SIGNATURE_LENGTH: usize = 16;

/// Longest signature, the full hex digest.
pub const MAX_SIGNATURE_LENGTH: usize = 64;

/// A configured tunneled service.
#[derive(Clone, PartialEq, Eq)]
pub struct Kite {
    pub protocol: String,
    pub public_domain: String,
    /// 0 means the protocol's default port.
    pub public_port: u16,
    pub local_domain: String,
    pub local_port: u16,
    auth_secret: String,
}

impl Kite {
    pub fn new(
        protocol: impl Into<String>,
        public_domain: impl Into<String>,
        public_port: u16,
        local_domain: impl Into<String>,
        local_port: u16,
        auth_secret: impl Into<String>,
    ) -> Self {
        Self {
            protocol: protocol.into(),
            public_domain: public_domain.into(),
            public_port,
            local_domain: local_domain.into(),
            local_port,
            auth_secret: auth_secret.into(),
        }
    }

    /// Canonical name, `proto:domain` or `proto-port:domain`.
    pub fn name(&self) -> String {
        kite_name(&self.protocol, self.public_port, &self.public_domain)
    }

    pub(crate) fn secret(&self) -> &str {
        &self.auth_secret
    }

    /// Verifies a signed request against this kite's secret.
    pub fn verify(&self, request: &ParsedKiteRequest) -> bool {
        let Some(signature) = request.signature.as_deref() else {
            return false;
        };
        if request.kite_name() != self.name() {
            return false;
        }
        let mut salts = vec![request.bsalt.as_str()];
        if let Some(fsalt) = request.fsalt.as_deref() {
            salts.push(fsalt);
        }
        verify_signature(&self.auth_secret, &self.name(), &salts, signature)
    }
}

impl fmt::Debug for Kite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kite")
            .field("protocol", &self.protocol)
            .field("public_domain", &self.public_domain)
            .field("public_port", &self.public_port)
            .field("local_domain", &self.local_domain)
            .field("local_port", &self.local_port)
            .field("auth_secret", &"<redacted>")
            .finish()
    }
}

pub fn kite_name(protocol: &str, port: u16, domain: &str) -> String {
    if port == 0 {
        format!("{}:{}", protocol, domain)
    } else {
        format!("{}-{}:{}", protocol, port, domain)
    }
}

/// Resolution of a kite request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KiteStatus {
    #[default]
    Unknown,
    Flying,
    Rejected,
}

/// One attempt to bring a kite up.
#[derive(Debug, Clone)]
pub struct KiteRequest {
    pub kite: Arc<Kite>,
    pub bsalt: Option<String>,
    pub fsalt: Option<String>,
    pub signature: Option<String>,
    pub status: KiteStatus,
}

impl KiteRequest {
    pub fn new(kite: Arc<Kite>) -> Self {
        Self {
            kite,
            bsalt: None,
            fsalt: None,
            signature: None,
            status: KiteStatus::Unknown,
        }
    }

    /// True if `other` names the same kite and echoes our backend salt.
    pub fn matches(&self, other: &ParsedKiteRequest) -> bool {
        other.kite_name() == self.kite.name() && self.bsalt.as_deref() == Some(other.bsalt.as_str())
    }

    /// Takes the frontend salt from a sign-this challenge addressed to us.
    pub fn apply_challenge(&mut self, challenge: &ParsedKiteRequest) -> bool {
        if !self.matches(challenge) {
            return false;
        }
        match &challenge.fsalt {
            Some(fsalt) => {
                self.fsalt = Some(fsalt.clone());
                self.signature = None;
                true
            }
            None => false,
        }
    }

    /// Wire form of this request, as carried in `X-PageKite:`.
    pub fn encode(&self) -> Result<String> {
        let bsalt = self.bsalt.clone().ok_or(Error::MissingSalt)?;
        Ok(ParsedKiteRequest {
            protocol: self.kite.protocol.clone(),
            public_port: self.kite.public_port,
            public_domain: self.kite.public_domain.clone(),
            bsalt,
            fsalt: self.fsalt.clone(),
            signature: self.signature.clone(),
        }
        .encode())
    }
}

/// Hex-encoded random salt from the OS entropy source.
pub fn random_salt() -> Result<String> {
    let mut buf = [0u8; SALT_BYTES];
    getrandom::getrandom(&mut buf).map_err(|e| Error::Entropy(e.to_string()))?;
    Ok(hex::encode(buf))
}

/// Fills in a fresh backend salt. The request is untouched on failure.
pub fn make_bsalt(request: &mut KiteRequest) -> Result<()> {
    request.bsalt = Some(random_salt()?);
    Ok(())
}

/// Keyed digest of `kite_name` and `salts`, hex encoded, `max_length` chars.
pub fn sign(secret: &str, kite_name: &str, salts: &[&str], max_length: usize) -> Result<String> {
    if !(MIN_SIGNATURE_LENGTH..=MAX_SIGNATURE_LENGTH).contains(&max_length) {
        return Err(Error::Capacity(format!(
            "signature length {} outside {}..={}",
            max_length, MIN_SIGNATURE_LENGTH, MAX_SIGNATURE_LENGTH
        )));
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Capacity(e.to_string()))?;
    mac.update(kite_name.as_bytes());
    for salt in salts {
        mac.update(b":");
        mac.update(salt.as_bytes());
    }

    let mut signature = hex::encode(mac.finalize().into_bytes());
    signature.truncate(max_length);
    Ok(signature)
}

/// Recomputes the signature and compares in constant time.
pub fn verify_signature(secret: &str, kite_name: &str, salts: &[&str], signature: &str) -> bool {
    let Ok(expected) = sign(secret, kite_name, salts, signature.len()) else {
        return false;
    };
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}

/// Signs `request` with its salts and returns the `X-PageKite:` value.
pub fn sign_kite_request(request: &mut KiteRequest, max_length: usize) -> Result<String> {
    let bsalt = request.bsalt.as_deref().ok_or(Error::MissingSalt)?;
    let mut salts = vec![bsalt];
    if let Some(fsalt) = request.fsalt.as_deref() {
        salts.push(fsalt);
    }

    let signature = sign(request.kite.secret(), &request.kite.name(), &salts, max_length)?;
    request.signature = Some(signature);
    request.encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::parse_kite_request;

    fn kite() -> Arc<Kite> {
        Arc::new(Kite::new("http", "kite.example.com", 0, "localhost", 8080, "s3cret"))
    }

    #[test]
    fn test_kite_name() {
        assert_eq!(kite().name(), "http:kite.example.com");
        let k = Kite::new("raw", "ssh.example.com", 22, "localhost", 22, "x");
        assert_eq!(k.name(), "raw-22:ssh.example.com");
    }

    #[test]
    fn test_secret_not_in_debug() {
        let out = format!("{:?}", kite());
        assert!(!out.contains("s3cret"));
        assert!(out.contains("kite.example.com"));
    }

    #[test]
    fn test_make_bsalt() {
        let mut req = KiteRequest::new(kite());
        make_bsalt(&mut req).unwrap();
        let salt = req.bsalt.clone().unwrap();
        assert_eq!(salt.len(), SALT_BYTES * 2);
        assert!(salt.bytes().all(|b| b.is_ascii_hexdigit()));

        make_bsalt(&mut req).unwrap();
        assert_ne!(req.bsalt.unwrap(), salt);
    }

    #[test]
    fn test_sign_is_deterministic() {
        let a = sign("secret", "http:a.example", &["0011", "2233"], 36).unwrap();
        let b = sign("secret", "http:a.example", &["0011", "2233"], 36).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 36);

        assert_ne!(a, sign("secreT", "http:a.example", &["0011", "2233"], 36).unwrap());
        assert_ne!(a, sign("secret", "http:b.example", &["0011", "2233"], 36).unwrap());
        assert_ne!(a, sign("secret", "http:a.example", &["0012", "2233"], 36).unwrap());
        assert_ne!(a, sign("secret", "http:a.example", &["0011", "2234"], 36).unwrap());
        assert_ne!(a, sign("secret", "http:a.example", &["0011"], 36).unwrap());
    }

    #[test]
    fn test_sign_length_bounds() {
        assert!(sign("s", "k", &[], MIN_SIGNATURE_LENGTH - 1).is_err());
        assert!(sign("s", "k", &[], MAX_SIGNATURE_LENGTH + 1).is_err());
        assert_eq!(sign("s", "k", &[], MAX_SIGNATURE_LENGTH).unwrap().len(), 64);
    }

    #[test]
    fn test_verify_signature() {
        let sig = sign("secret", "http:a.example", &["aa", "bb"], 40).unwrap();
        assert!(verify_signature("secret", "http:a.example", &["aa", "bb"], &sig));
        assert!(!verify_signature("wrong", "http:a.example", &["aa", "bb"], &sig));
        assert!(!verify_signature("secret", "http:a.example", &["aa"], &sig));

        let mut tampered = sig.clone().into_bytes();
        tampered[39] = if tampered[39] == b'0' { b'1' } else { b'0' };
        let tampered = String::from_utf8(tampered).unwrap();
        assert!(!verify_signature("secret", "http:a.example", &["aa", "bb"], &tampered));

        // A short prefix of a valid signature is not enough.
        assert!(!verify_signature("secret", "http:a.example", &["aa", "bb"], &sig[..8]));
        assert!(!verify_signature("secret", "http:a.example", &["aa", "bb"], ""));
    }

    #[test]
    fn test_verify_rejects_first_or_last_digit_change() {
        let sig = sign("secret", "http:a.example", &["aa"], 32).unwrap();
        let flip = |i: usize| {
            let mut bytes = sig.clone().into_bytes();
            bytes[i] = if bytes[i] == b'0' { b'1' } else { b'0' };
            String::from_utf8(bytes).unwrap()
        };
        assert!(verify_signature("secret", "http:a.example", &["aa"], &sig));
        assert!(!verify_signature("secret", "http:a.example", &["aa"], &flip(0)));
        assert!(!verify_signature("secret", "http:a.example", &["aa"], &flip(31)));
    }

    #[test]
    fn test_sign_kite_request_requires_salt() {
        let mut req = KiteRequest::new(kite());
        assert!(matches!(
            sign_kite_request(&mut req, SIGNATURE_LENGTH),
            Err(Error::MissingSalt)
        ));
        assert!(req.signature.is_none());
    }

    #[test]
    fn test_signed_request_verifies() {
        let k = kite();
        let mut req = KiteRequest::new(k.clone());
        req.bsalt = Some("00aa".into());
        let value = sign_kite_request(&mut req, SIGNATURE_LENGTH).unwrap();
        assert!(!value.contains("s3cret"));

        let parsed = parse_kite_request(&value).unwrap();
        assert!(k.verify(&parsed));

        req.fsalt = Some("ff01".into());
        let value = sign_kite_request(&mut req, SIGNATURE_LENGTH).unwrap();
        let parsed = parse_kite_request(&value).unwrap();
        assert_eq!(parsed.fsalt.as_deref(), Some("ff01"));
        assert!(k.verify(&parsed));

        let other = Kite::new("http", "kite.example.com", 0, "localhost", 8080, "nope");
        assert!(!other.verify(&parsed));
    }

    #[test]
    fn test_apply_challenge() {
        let mut req = KiteRequest::new(kite());
        req.bsalt = Some("00aa".into());
        req.signature = Some("deadbeef".into());

        let stranger = parse_kite_request("http:kite.example.com:00ab:ff01").unwrap();
        assert!(!req.apply_challenge(&stranger));
        assert_eq!(req.fsalt, None);

        let challenge = parse_kite_request("http:kite.example.com:00aa:ff01").unwrap();
        assert!(req.apply_challenge(&challenge));
        assert_eq!(req.fsalt.as_deref(), Some("ff01"));
        assert_eq!(req.signature, None);
    }
}
