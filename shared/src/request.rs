//! `X-PageKite:` value encoding.
//!
//! ```text
//! proto[-port]:domain:bsalt[:fsalt[:signature]]
//! ```
//!
//! The fsalt field may be empty when a signature follows without a
//! frontend challenge.

use crate::error::{Error, Result};
use crate::kite::{kite_name, MAX_SIGNATURE_LENGTH};

pub const MAX_PROTO_LENGTH: usize = 32;
pub const MAX_DOMAIN_LENGTH: usize = 255;
pub const MAX_SALT_LENGTH: usize = 64;

/// A kite request as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKiteRequest {
    pub protocol: String,
    /// 0 when the name carries no port.
    pub public_port: u16,
    pub public_domain: String,
    pub bsalt: String,
    pub fsalt: Option<String>,
    pub signature: Option<String>,
}

impl ParsedKiteRequest {
    pub fn kite_name(&self) -> String {
        kite_name(&self.protocol, self.public_port, &self.public_domain)
    }

    pub fn encode(&self) -> String {
        let mut out = format!("{}:{}", self.kite_name(), self.bsalt);
        if self.fsalt.is_some() || self.signature.is_some() {
            out.push(':');
            out.push_str(self.fsalt.as_deref().unwrap_or(""));
        }
        if let Some(signature) = &self.signature {
            out.push(':');
            out.push_str(signature);
        }
        out
    }
}

/// Parses an `X-PageKite:` value. Either everything validates or nothing
/// is returned.
pub fn parse_kite_request(value: &str) -> Result<ParsedKiteRequest> {
    let fields: Vec<&str> = value.trim().split(':').collect();
    if fields.len() < 3 {
        return Err(invalid("missing fields"));
    }
    if fields.len() > 5 {
        return Err(invalid("too many fields"));
    }

    let (protocol, public_port) = parse_proto(fields[0])?;
    let public_domain = parse_domain(fields[1])?;
    let bsalt = parse_hex(fields[2], MAX_SALT_LENGTH, "bsalt")?;

    let signature = match fields.get(4) {
        Some(sig) => Some(parse_hex(sig, MAX_SIGNATURE_LENGTH, "signature")?),
        None => None,
    };
    let fsalt = match fields.get(3) {
        Some(fsalt) if fsalt.is_empty() && signature.is_some() => None,
        Some(fsalt) => Some(parse_hex(fsalt, MAX_SALT_LENGTH, "fsalt")?),
        None => None,
    };

    Ok(ParsedKiteRequest {
        protocol: protocol.to_string(),
        public_port,
        public_domain: public_domain.to_string(),
        bsalt: bsalt.to_string(),
        fsalt: fsalt.map(String::from),
        signature: signature.map(String::from),
    })
}

fn parse_proto(field: &str) -> Result<(&str, u16)> {
    let (protocol, port) = match field.rsplit_once('-') {
        Some((protocol, port)) => {
            let valid = !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit());
            match port.parse::<u16>() {
                Ok(port) if valid && port != 0 => (protocol, port),
                _ => return Err(invalid("non-numeric port")),
            }
        }
        None => (field, 0),
    };

    if protocol.is_empty() {
        return Err(invalid("empty protocol"));
    }
    if protocol.len() > MAX_PROTO_LENGTH {
        return Err(invalid("protocol too long"));
    }
    if !protocol.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(invalid("bad protocol"));
    }
    Ok((protocol, port))
}

fn parse_domain(field: &str) -> Result<&str> {
    if field.is_empty() {
        return Err(invalid("empty domain"));
    }
    if field.len() > MAX_DOMAIN_LENGTH {
        return Err(invalid("domain too long"));
    }
    if !field
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-' || b == b'_' || b == b'*')
    {
        return Err(invalid("bad domain"));
    }
    Ok(field)
}

fn parse_hex<'a>(field: &'a str, max: usize, what: &str) -> Result<&'a str> {
    if field.is_empty() {
        return Err(invalid(&format!("empty {}", what)));
    }
    if field.len() > max {
        return Err(invalid(&format!("{} too long", what)));
    }
    if !field.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid(&format!("{} is not hex", what)));
    }
    Ok(field)
}

fn invalid(reason: &str) -> Error {
    Error::InvalidRequest(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let req = parse_kite_request("http:kite.example.com:0a1b").unwrap();
        assert_eq!(req.protocol, "http");
        assert_eq!(req.public_port, 0);
        assert_eq!(req.public_domain, "kite.example.com");
        assert_eq!(req.bsalt, "0a1b");
        assert_eq!(req.fsalt, None);
        assert_eq!(req.signature, None);
    }

    #[test]
    fn test_parse_full() {
        let req = parse_kite_request(" raw-22:ssh.example.com:0a1b:ff00:abcdef0123456789 ").unwrap();
        assert_eq!(req.protocol, "raw");
        assert_eq!(req.public_port, 22);
        assert_eq!(req.fsalt.as_deref(), Some("ff00"));
        assert_eq!(req.signature.as_deref(), Some("abcdef0123456789"));
        assert_eq!(req.kite_name(), "raw-22:ssh.example.com");
    }

    #[test]
    fn test_parse_signature_without_fsalt() {
        let req = parse_kite_request("http:a.example:0a1b::abcdef").unwrap();
        assert_eq!(req.fsalt, None);
        assert_eq!(req.signature.as_deref(), Some("abcdef"));
    }

    #[test]
    fn test_parse_errors() {
        let long_domain = format!("http:{}:00", "a".repeat(MAX_DOMAIN_LENGTH + 1));
        let long_salt = format!("http:a.example:{}", "0".repeat(MAX_SALT_LENGTH + 1));
        let cases = [
            "http:a.example",
            "http:a.example:00:11:22:33",
            ":a.example:00",
            "http::00",
            "http:a.example:",
            "http-:a.example:00",
            "http-eighty:a.example:00",
            "http-99999:a.example:00",
            "http-0:a.example:00",
            "ht tp:a.example:00",
            "http:a example:00",
            "http:a.example:xyz",
            "http:a.example:00:",
            "http:a.example:00:11:",
            "http:a.example:00:zz:11",
            long_domain.as_str(),
            long_salt.as_str(),
        ];
        for case in cases {
            assert!(
                matches!(parse_kite_request(case), Err(Error::InvalidRequest(_))),
                "{:?} should not parse",
                case
            );
        }
    }

    #[test]
    fn test_encode_inverts_parse() {
        let inputs = [
            "http:kite.example.com:0a1b",
            "http:kite.example.com:0a1b:ff00",
            "http:kite.example.com:0a1b::abcdef",
            "https-8443:kite.example.com:0a1b:ff00:abcdef",
        ];
        for input in inputs {
            let req = parse_kite_request(input).unwrap();
            assert_eq!(req.encode(), input);
            assert_eq!(parse_kite_request(&req.encode()).unwrap(), req);
        }
    }
}
