use super::decoder::encode_string;
use super::encode_int;
use crate::headers::Headers;

/// Response-side HPACK encoder.
///
/// Responses use the static table for common status codes and plain
/// literals without indexing for everything else, so the peer's decoder
/// never depends on our dynamic table state.
#[derive(Debug, Default)]
pub(crate) struct Encoder;

impl Encoder {
    pub(crate) fn new() -> Encoder {
        Encoder
    }

    pub(crate) fn encode_status(&self, dst: &mut Vec<u8>, status: u16) {
        match status {
            200 => dst.push(0x88),
            204 => dst.push(0x89),
            206 => dst.push(0x8a),
            304 => dst.push(0x8b),
            400 => dst.push(0x8c),
            404 => dst.push(0x8d),
            500 => dst.push(0x8e),
            other => {
                // Literal without indexing, name from static index 8.
                encode_int(dst, 8, 4, 0);
                encode_string(dst, itoa::Buffer::new().format(other).as_bytes());
            }
        }
    }

    pub(crate) fn encode_header(&self, dst: &mut Vec<u8>, name: &str, value: &str) {
        encode_int(dst, 0, 4, 0);
        encode_string(dst, name.as_bytes());
        encode_string(dst, value.as_bytes());
    }

    /// Encodes a full response block: the status pseudo-header followed
    /// by every header, names lowered from the internal form.
    pub(crate) fn encode_response(
        &self,
        dst: &mut Vec<u8>,
        status: u16,
        headers: &Headers,
    ) {
        self.encode_status(dst, status);
        for (key, value) in headers {
            let name: String = key
                .chars()
                .map(|c| match c {
                    '_' => '-',
                    c => c.to_ascii_lowercase(),
                })
                .collect();
            self.encode_header(dst, &name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::decoder::Decoder;
    use super::super::table::STATIC_TABLE;
    use super::*;

    #[test]
    fn common_status_is_a_single_octet() {
        let enc = Encoder::new();
        let mut buf = Vec::new();
        enc.encode_status(&mut buf, 200);
        assert_eq!(buf, [0x88]);
        assert_eq!(STATIC_TABLE[8], (":status", "200"));
    }

    #[test]
    fn uncommon_status_is_a_literal() {
        let enc = Encoder::new();
        let mut buf = Vec::new();
        enc.encode_status(&mut buf, 418);
        assert_eq!(buf[0], 0x08);
        assert_eq!(&buf[1..], [0x03, b'4', b'1', b'8']);
    }

    #[test]
    fn response_block_decodes_back() {
        let enc = Encoder::new();
        let mut headers = Headers::new();
        headers.push("Content-Type", "text/plain");
        headers.push("X-Custom", "abc");
        let mut buf = Vec::new();
        enc.encode_response(&mut buf, 200, &headers);

        // A decoder sees :status plus the literals; pseudo response
        // fields are not request pseudo-headers, so decode the literals
        // by hand: skip the one-octet status first.
        let mut dec = Decoder::new(4096);
        let mut block = super::super::HeaderBlock::new();
        block.method = "GET".into();
        block.scheme = "https".into();
        block.path = "/".into();
        dec.decode(&buf[1..], &mut block).unwrap();
        assert_eq!(block.headers.get("content-type"), Some("text/plain"));
        assert_eq!(block.headers.get("x-custom"), Some("abc"));
    }
}
