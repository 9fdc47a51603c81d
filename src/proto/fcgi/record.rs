//! FastCGI/1 record layer.

/// Number of bytes in a record header.
pub(crate) const HEADER_LEN: usize = 8;

pub(crate) const VERSION_1: u8 = 1;

// Record types.
pub(crate) const BEGIN_REQUEST: u8 = 1;
pub(crate) const ABORT_REQUEST: u8 = 2;
pub(crate) const END_REQUEST: u8 = 3;
pub(crate) const PARAMS: u8 = 4;
pub(crate) const STDIN: u8 = 5;
pub(crate) const STDOUT: u8 = 6;

// BEGIN_REQUEST roles.
pub(crate) const ROLE_RESPONDER: u16 = 1;

// BEGIN_REQUEST flags.
pub(crate) const KEEP_CONN: u8 = 1;

// END_REQUEST protocol statuses.
pub(crate) const REQUEST_COMPLETE: u8 = 0;

/// Output records are padded to an 8-byte boundary.
const ALIGNMENT: u16 = 8;

pub(crate) fn align(len: u16) -> u16 {
    len.wrapping_add(ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// One parsed record header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordHead {
    pub(crate) version: u8,
    pub(crate) kind: u8,
    pub(crate) request_id: u16,
    pub(crate) content_len: u16,
    pub(crate) padding: u8,
}

impl RecordHead {
    pub(crate) fn parse(buf: &[u8; HEADER_LEN]) -> RecordHead {
        RecordHead {
            version: buf[0],
            kind: buf[1],
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_len: u16::from_be_bytes([buf[4], buf[5]]),
            padding: buf[6],
        }
    }

    /// Total wire size of the record including header and padding.
    pub(crate) fn total_len(&self) -> usize {
        HEADER_LEN + self.content_len as usize + self.padding as usize
    }

    pub(crate) fn encode(
        kind: u8,
        request_id: u16,
        content_len: u16,
        padding: u8,
    ) -> [u8; HEADER_LEN] {
        let id = request_id.to_be_bytes();
        let len = content_len.to_be_bytes();
        [VERSION_1, kind, id[0], id[1], len[0], len[1], padding, 0]
    }
}

/// The 8-byte BEGIN_REQUEST body.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BeginRequest {
    pub(crate) role: u16,
    pub(crate) keep_conn: bool,
}

impl BeginRequest {
    pub(crate) fn parse(body: &[u8]) -> Option<BeginRequest> {
        if body.len() < 8 {
            return None;
        }
        Some(BeginRequest {
            role: u16::from_be_bytes([body[0], body[1]]),
            keep_conn: body[2] & KEEP_CONN != 0,
        })
    }
}

/// The END_REQUEST record for a completed request: appStatus 0,
/// protocolStatus REQUEST_COMPLETE.
pub(crate) fn end_request(request_id: u16) -> [u8; HEADER_LEN + 8] {
    let mut out = [0u8; HEADER_LEN + 8];
    out[..HEADER_LEN].copy_from_slice(&RecordHead::encode(END_REQUEST, request_id, 8, 0));
    // appStatus (4 bytes, zero) then protocolStatus.
    out[HEADER_LEN + 4] = REQUEST_COMPLETE;
    out
}

/// Iterates the name/value pairs of a PARAMS record payload.
///
/// Lengths are 1 octet, or 4 octets with the high bit set (and masked
/// off) for the wide form.
pub(crate) struct Params<'a> {
    buf: &'a [u8],
}

impl<'a> Params<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Params<'a> {
        Params { buf }
    }

    fn take_len(&mut self) -> Option<u32> {
        let first = *self.buf.first()?;
        if first > 127 {
            if self.buf.len() < 4 {
                return None;
            }
            let len =
                u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                    ^ 0x8000_0000;
            self.buf = &self.buf[4..];
            Some(len)
        } else {
            self.buf = &self.buf[1..];
            Some(u32::from(first))
        }
    }
}

impl<'a> Iterator for Params<'a> {
    /// `(name, value)` slices, or `Err(())` once on malformed input.
    type Item = Result<(&'a [u8], &'a [u8]), ()>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        let Some(key_len) = self.take_len() else {
            return Some(Err(()));
        };
        let Some(val_len) = self.take_len() else {
            return Some(Err(()));
        };
        let key_len = key_len as usize;
        let val_len = val_len as usize;
        if key_len > 0xffff || val_len > 0xffff || self.buf.len() < key_len + val_len {
            return Some(Err(()));
        }
        let key = &self.buf[..key_len];
        let value = &self.buf[key_len..key_len + val_len];
        self.buf = &self.buf[key_len + val_len..];
        Some(Ok((key, value)))
    }
}

/// Appends one name/value pair in wire form; used by tests and by the
/// CGI variable writer.
pub(crate) fn push_param(out: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    for len in [key.len(), value.len()] {
        if len > 127 {
            out.extend_from_slice(&((len as u32) | 0x8000_0000).to_be_bytes());
        } else {
            out.push(len as u8);
        }
    }
    out.extend_from_slice(key);
    out.extend_from_slice(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_head_round_trip() {
        let bytes = RecordHead::encode(STDOUT, 7, 512, 3);
        let head = RecordHead::parse(&bytes);
        assert_eq!(head.version, VERSION_1);
        assert_eq!(head.kind, STDOUT);
        assert_eq!(head.request_id, 7);
        assert_eq!(head.content_len, 512);
        assert_eq!(head.padding, 3);
        assert_eq!(head.total_len(), 8 + 512 + 3);
    }

    #[test]
    fn alignment() {
        assert_eq!(align(0), 0);
        assert_eq!(align(1), 8);
        assert_eq!(align(8), 8);
        assert_eq!(align(9), 16);
        assert_eq!(align(0xfff8), 0xfff8);
    }

    #[test]
    fn begin_request_flags() {
        let body = [0, 1, KEEP_CONN, 0, 0, 0, 0, 0];
        let begin = BeginRequest::parse(&body).unwrap();
        assert_eq!(begin.role, ROLE_RESPONDER);
        assert!(begin.keep_conn);

        let body = [0, 1, 0, 0, 0, 0, 0, 0];
        assert!(!BeginRequest::parse(&body).unwrap().keep_conn);
    }

    #[test]
    fn end_request_layout() {
        let rec = end_request(0x0102);
        assert_eq!(rec[0], VERSION_1);
        assert_eq!(rec[1], END_REQUEST);
        assert_eq!(&rec[2..4], &[0x01, 0x02]);
        assert_eq!(&rec[4..6], &[0x00, 0x08]);
        assert_eq!(rec[12], REQUEST_COMPLETE);
    }

    #[test]
    fn params_short_and_wide_lengths() {
        let mut buf = Vec::new();
        push_param(&mut buf, b"REQUEST_METHOD", b"POST");
        let long_value = "v".repeat(300);
        push_param(&mut buf, b"HTTP_X_LONG", long_value.as_bytes());

        let mut params = Params::new(&buf);
        let (k, v) = params.next().unwrap().unwrap();
        assert_eq!((k, v), (&b"REQUEST_METHOD"[..], &b"POST"[..]));
        let (k, v) = params.next().unwrap().unwrap();
        assert_eq!(k, b"HTTP_X_LONG");
        assert_eq!(v, long_value.as_bytes());
        assert!(params.next().is_none());
    }

    #[test]
    fn params_truncation_is_an_error() {
        let mut buf = Vec::new();
        push_param(&mut buf, b"NAME", b"value");
        buf.truncate(buf.len() - 1);
        let mut params = Params::new(&buf);
        assert!(params.next().unwrap().is_err());
    }
}
