//! TLS passthrough routing
//!
//! The relay never terminates TLS for `https` kites. It peeks at the
//! ClientHello, takes the requested server name, and forwards the
//! encrypted bytes untouched to whichever backend flies that name.

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Length of the TLS record header: type, version, length.
const RECORD_HEADER_LEN: usize = 5;

pub fn looks_like_tls(data: &[u8]) -> bool {
    data.first() == Some(&CONTENT_TYPE_HANDSHAKE)
}

/// Total size of the first record, once its header has arrived.
pub fn record_len(data: &[u8]) -> Option<usize> {
    if data.len() < RECORD_HEADER_LEN {
        return None;
    }
    Some(RECORD_HEADER_LEN + u16::from_be_bytes([data[3], data[4]]) as usize)
}

/// Bounds-checked big-endian reader over a byte slice.
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if n > self.data.len() {
            return None;
        }
        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    /// A vector with a one-byte length prefix.
    fn vec8(&mut self) -> Option<&'a [u8]> {
        let len = self.u8()? as usize;
        self.take(len)
    }

    /// A vector with a two-byte length prefix.
    fn vec16(&mut self) -> Option<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }
}

/// Extracts the host name from the server_name extension of a ClientHello.
///
/// `data` must hold the complete first record. Returns the name lowercased,
/// or `None` for anything that is not a well-formed ClientHello carrying a
/// host name.
pub fn extract_sni(data: &[u8]) -> Option<String> {
    let mut record = Reader::new(data);
    if record.u8()? != CONTENT_TYPE_HANDSHAKE {
        return None;
    }
    record.take(2)?;
    let mut handshake = Reader::new(record.vec16()?);

    if handshake.u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    // u24 body length, then client version and random.
    handshake.take(3 + 2 + 32)?;
    handshake.vec8()?; // session id
    handshake.vec16()?; // cipher suites
    handshake.vec8()?; // compression methods

    let mut extensions = Reader::new(handshake.vec16()?);
    while !extensions.is_empty() {
        let kind = extensions.u16()?;
        let body = extensions.vec16()?;
        if kind != EXTENSION_SERVER_NAME {
            continue;
        }

        let mut names = Reader::new(Reader::new(body).vec16()?);
        while !names.is_empty() {
            let name_type = names.u8()?;
            let name = names.vec16()?;
            if name_type == NAME_TYPE_HOST_NAME {
                return std::str::from_utf8(name).ok().map(str::to_ascii_lowercase);
            }
        }
        return None;
    }

    None
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn vec16(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    /// Minimal ClientHello record, optionally carrying a server name.
    pub(crate) fn client_hello(server_name: Option<&str>) -> Vec<u8> {
        let mut extensions = Vec::new();
        // An unrelated extension first: supported_versions.
        extensions.extend_from_slice(&[0x00, 0x2b]);
        extensions.extend_from_slice(&vec16(&[0x02, 0x03, 0x04]));
        if let Some(name) = server_name {
            let mut entry = vec![NAME_TYPE_HOST_NAME];
            entry.extend_from_slice(&vec16(name.as_bytes()));
            extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
            extensions.extend_from_slice(&vec16(&vec16(&entry)));
        }

        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0xAA; 32]);
        body.push(0); // session id
        body.extend_from_slice(&vec16(&[0x13, 0x01]));
        body.extend_from_slice(&[0x01, 0x00]);
        body.extend_from_slice(&vec16(&extensions));

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&vec16(&handshake));
        record
    }

    #[test]
    fn test_extract_sni() {
        let hello = client_hello(Some("Secure.Example.com"));
        assert!(looks_like_tls(&hello));
        assert_eq!(record_len(&hello), Some(hello.len()));
        assert_eq!(extract_sni(&hello).as_deref(), Some("secure.example.com"));
    }

    #[test]
    fn test_no_sni() {
        assert_eq!(extract_sni(&client_hello(None)), None);
    }

    #[test]
    fn test_truncated_or_foreign_input() {
        let hello = client_hello(Some("secure.example.com"));
        for cut in [0, 1, 5, 10, 43, hello.len() - 1] {
            assert_eq!(extract_sni(&hello[..cut]), None, "cut at {}", cut);
        }
        assert!(!looks_like_tls(b"GET / HTTP/1.1\r\n"));
        assert_eq!(extract_sni(b"GET / HTTP/1.1\r\n\r\n"), None);
        assert_eq!(record_len(&[0x16, 0x03]), None);
    }
}
