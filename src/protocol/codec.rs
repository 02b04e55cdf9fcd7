//! Wire framing for requests and responses
//!
//! ## Frame format
//! ```text
//! request:  METHOD TXN_ID SEQ_NO CONTENT_LENGTH\r\n\r\n\r\n<payload>
//! response: METHOD TXN_ID SEQ_NO ERROR_CODE CONTENT_LENGTH\r\n\r\n\r\n<payload>
//! ```
//! Header fields are ASCII and separated by single spaces. The payload is the
//! file name for NEW_TXN and READ, the fragment bytes for WRITE, the error
//! message for ERROR, and the file contents for a READ reply. A transaction id
//! of `-1` means "no transaction".

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{DfsError, ErrorCode, Result};
use crate::txn::TxnId;
use super::message::{Method, Request, Response};

pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n\r\n";

/// Longest header accepted before the terminator must appear
pub const MAX_HEADER_LEN: usize = 256;

/// Largest payload accepted in one frame
pub const MAX_CONTENT_LEN: usize = 64 << 20;

/// Highest sequence number a WRITE or COMMIT may carry
pub const MAX_FRAGMENTS: u64 = 1 << 16;

/// Decode one request from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. A complete but malformed
/// frame is consumed and reported as a protocol error so the connection can
/// continue with the next frame. A header that never terminates, or a content
/// length over the limit, discards the whole buffer.
pub fn decode_request(buf: &mut BytesMut) -> Result<Option<Request>> {
    let Some((fields, header_len)) = split_header(buf)? else {
        return Ok(None);
    };

    if fields.len() != 4 {
        buf.advance(header_len);
        return Err(DfsError::Protocol(format!(
            "expected 4 header fields, got {}",
            fields.len()
        )));
    }

    let content_len = match parse_content_len(&fields[3]) {
        Ok(len) => len,
        Err(e) => {
            buf.clear();
            return Err(e);
        }
    };
    if buf.len() < header_len + content_len {
        return Ok(None);
    }

    buf.advance(header_len);
    let payload = buf.split_to(content_len).to_vec();
    build_request(&fields, payload).map(Some)
}

/// Decode one response from the front of `buf` (client side)
pub fn decode_response(buf: &mut BytesMut) -> Result<Option<Response>> {
    let Some((fields, header_len)) = split_header(buf)? else {
        return Ok(None);
    };

    if fields.len() != 5 {
        buf.advance(header_len);
        return Err(DfsError::Protocol(format!(
            "expected 5 response header fields, got {}",
            fields.len()
        )));
    }

    let content_len = match parse_content_len(&fields[4]) {
        Ok(len) => len,
        Err(e) => {
            buf.clear();
            return Err(e);
        }
    };
    if buf.len() < header_len + content_len {
        return Ok(None);
    }

    buf.advance(header_len);
    let payload = buf.split_to(content_len).to_vec();
    build_response(&fields, payload).map(Some)
}

pub fn encode_response(response: &Response, out: &mut BytesMut) {
    match response {
        Response::Ack { txn_id, seq } | Response::AskResend { txn_id, seq } => {
            put_header(out, response.method(), &txn_id.to_string(), *seq, Some(0), 0);
        }
        Response::Error { txn_id, code, message } => {
            put_header(out, Method::Error, &txn_id.to_string(), 0, Some(code.code()), message.len());
            out.put_slice(message.as_bytes());
        }
        Response::ReadReply { data } => {
            put_header(out, Method::Read, "-1", 0, Some(0), data.len());
            out.put_slice(data);
        }
    }
}

/// Encode a request (client side)
pub fn encode_request(request: &Request, out: &mut BytesMut) {
    match request {
        Request::NewTxn { file_name } | Request::Read { file_name } => {
            put_header(out, request.method(), "-1", 0, None, file_name.len());
            out.put_slice(file_name.as_bytes());
        }
        Request::Write { txn_id, seq, data } => {
            put_header(out, Method::Write, &txn_id.to_string(), *seq, None, data.len());
            out.put_slice(data);
        }
        Request::Commit { txn_id, seq } => {
            put_header(out, Method::Commit, &txn_id.to_string(), *seq, None, 0);
        }
        Request::Abort { txn_id } => {
            put_header(out, Method::Abort, &txn_id.to_string(), 0, None, 0);
        }
    }
}

fn put_header(out: &mut BytesMut, method: Method, txn: &str, seq: u64, code: Option<u16>, len: usize) {
    let header = match code {
        Some(code) => format!("{} {} {} {} {}", method, txn, seq, code, len),
        None => format!("{} {} {} {}", method, txn, seq, len),
    };
    out.reserve(header.len() + HEADER_TERMINATOR.len() + len);
    out.put_slice(header.as_bytes());
    out.put_slice(HEADER_TERMINATOR);
}

/// Find a complete header and split it into fields.
/// Returns the fields and the header length including its terminator.
fn split_header(buf: &mut BytesMut) -> Result<Option<(Vec<String>, usize)>> {
    let search_len = buf.len().min(MAX_HEADER_LEN + HEADER_TERMINATOR.len());
    let found = buf[..search_len]
        .windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR);

    let Some(end) = found else {
        if buf.len() > MAX_HEADER_LEN {
            buf.clear();
            return Err(DfsError::Protocol("header too long".into()));
        }
        return Ok(None);
    };

    let header_len = end + HEADER_TERMINATOR.len();
    let fields = match std::str::from_utf8(&buf[..end]) {
        Ok(header) => header.split_whitespace().map(str::to_string).collect(),
        Err(_) => {
            buf.advance(header_len);
            return Err(DfsError::Protocol("header is not valid UTF-8".into()));
        }
    };
    Ok(Some((fields, header_len)))
}

fn parse_content_len(field: &str) -> Result<usize> {
    let len: usize = field
        .parse()
        .map_err(|_| DfsError::Protocol(format!("invalid content length '{}'", field)))?;
    if len > MAX_CONTENT_LEN {
        return Err(DfsError::Protocol(format!(
            "content length {} exceeds limit of {} bytes",
            len, MAX_CONTENT_LEN
        )));
    }
    Ok(len)
}

fn parse_u64(field: &str, what: &str) -> Result<u64> {
    field
        .parse()
        .map_err(|_| DfsError::Protocol(format!("invalid {} '{}'", what, field)))
}

/// `-1` stands for "no transaction"
fn parse_txn_id(field: &str) -> Result<Option<TxnId>> {
    if field == "-1" {
        return Ok(None);
    }
    parse_u64(field, "transaction id").map(Some)
}

fn require_txn_id(field: &str, method: Method) -> Result<TxnId> {
    parse_txn_id(field)?
        .ok_or_else(|| DfsError::Protocol(format!("{} requires a transaction id", method)))
}

fn payload_string(payload: Vec<u8>, method: Method) -> Result<String> {
    let s = String::from_utf8(payload)
        .map_err(|_| DfsError::Protocol(format!("{} file name is not valid UTF-8", method)))?;
    if s.is_empty() {
        return Err(DfsError::Protocol(format!("{} requires a file name", method)));
    }
    Ok(s)
}

fn build_request(fields: &[String], payload: Vec<u8>) -> Result<Request> {
    let method = Method::parse(&fields[0])
        .ok_or_else(|| DfsError::Protocol(format!("unknown method '{}'", fields[0])))?;
    let seq = parse_u64(&fields[2], "sequence number")?;

    match method {
        Method::NewTxn => Ok(Request::NewTxn {
            file_name: payload_string(payload, method)?,
        }),
        Method::Read => Ok(Request::Read {
            file_name: payload_string(payload, method)?,
        }),
        Method::Write => Ok(Request::Write {
            txn_id: require_txn_id(&fields[1], method)?,
            seq,
            data: payload,
        }),
        Method::Commit => Ok(Request::Commit {
            txn_id: require_txn_id(&fields[1], method)?,
            seq,
        }),
        Method::Abort => Ok(Request::Abort {
            txn_id: require_txn_id(&fields[1], method)?,
        }),
        Method::Ack | Method::AskResend | Method::Error => Err(DfsError::Protocol(format!(
            "{} is not a request method",
            method
        ))),
    }
}

fn build_response(fields: &[String], payload: Vec<u8>) -> Result<Response> {
    let method = Method::parse(&fields[0])
        .ok_or_else(|| DfsError::Protocol(format!("unknown method '{}'", fields[0])))?;
    let txn_id = parse_txn_id(&fields[1])?.unwrap_or(0);
    let seq = parse_u64(&fields[2], "sequence number")?;

    match method {
        Method::Ack => Ok(Response::Ack { txn_id, seq }),
        Method::AskResend => Ok(Response::AskResend { txn_id, seq }),
        Method::Error => {
            let raw = parse_u64(&fields[3], "error code")?;
            let code = u16::try_from(raw)
                .ok()
                .and_then(ErrorCode::from_code)
                .ok_or_else(|| DfsError::Protocol(format!("unknown error code {}", raw)))?;
            Ok(Response::Error {
                txn_id,
                code,
                message: String::from_utf8_lossy(&payload).into_owned(),
            })
        }
        Method::Read => Ok(Response::ReadReply { data: payload }),
        _ => Err(DfsError::Protocol(format!("{} is not a response method", method))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_write_request() {
        let mut buf = BytesMut::from(&b"WRITE 12 3 5\r\n\r\n\r\nhello"[..]);
        let request = decode_request(&mut buf).unwrap().unwrap();
        assert_eq!(
            request,
            Request::Write {
                txn_id: 12,
                seq: 3,
                data: b"hello".to_vec()
            }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_new_txn_with_no_transaction_marker() {
        let mut buf = BytesMut::from(&b"NEW_TXN -1 0 9\r\n\r\n\r\nnotes.txt"[..]);
        let request = decode_request(&mut buf).unwrap().unwrap();
        assert_eq!(request, Request::NewTxn { file_name: "notes.txt".into() });
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let mut buf = BytesMut::from(&b"WRITE 1 1 10\r\n\r\n"[..]);
        assert!(decode_request(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"\r\n01234");
        assert!(decode_request(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"56789COMMIT 1 1 0\r\n\r\n\r\n");
        let first = decode_request(&mut buf).unwrap().unwrap();
        assert_eq!(first.method(), Method::Write);
        let second = decode_request(&mut buf).unwrap().unwrap();
        assert_eq!(second, Request::Commit { txn_id: 1, seq: 1 });
        assert!(decode_request(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_malformed_frame_is_consumed() {
        let mut buf = BytesMut::from(&b"FROB 1 1 0\r\n\r\n\r\nABORT 2 0 0\r\n\r\n\r\n"[..]);
        let err = decode_request(&mut buf).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::WrongMessageFormat);

        let next = decode_request(&mut buf).unwrap().unwrap();
        assert_eq!(next, Request::Abort { txn_id: 2 });
    }

    #[test]
    fn test_commit_requires_transaction_id() {
        let mut buf = BytesMut::from(&b"COMMIT -1 3 0\r\n\r\n\r\n"[..]);
        assert!(decode_request(&mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_wrong_field_count() {
        let mut buf = BytesMut::from(&b"COMMIT 1 3\r\n\r\n\r\n"[..]);
        assert!(decode_request(&mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_header_discards_buffer() {
        let mut buf = BytesMut::from(vec![b'A'; MAX_HEADER_LEN + 10].as_slice());
        assert!(decode_request(&mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_content_length_rejected() {
        let header = format!("WRITE 1 1 {}\r\n\r\n\r\n", MAX_CONTENT_LEN + 1);
        let mut buf = BytesMut::from(header.as_bytes());
        assert!(decode_request(&mut buf).is_err());
    }

    #[test]
    fn test_encode_responses() {
        let mut out = BytesMut::new();
        encode_response(&Response::Ack { txn_id: 7, seq: 3 }, &mut out);
        assert_eq!(&out[..], b"ACK 7 3 0 0\r\n\r\n\r\n");

        out.clear();
        encode_response(&Response::AskResend { txn_id: 7, seq: 2 }, &mut out);
        assert_eq!(&out[..], b"ASK_RESEND 7 2 0 0\r\n\r\n\r\n");

        out.clear();
        encode_response(&Response::error(7, ErrorCode::InvalidOperation, "aborted"), &mut out);
        assert_eq!(&out[..], b"ERROR 7 0 202 7\r\n\r\n\r\naborted");
    }

    #[test]
    fn test_client_side_decoding() {
        let mut out = BytesMut::new();
        encode_response(&Response::ReadReply { data: b"abc".to_vec() }, &mut out);
        encode_response(&Response::error(4, ErrorCode::FileNotFound, "missing"), &mut out);

        assert_eq!(
            decode_response(&mut out).unwrap().unwrap(),
            Response::ReadReply { data: b"abc".to_vec() }
        );
        assert_eq!(
            decode_response(&mut out).unwrap().unwrap(),
            Response::error(4, ErrorCode::FileNotFound, "missing")
        );
    }

    #[test]
    fn test_encoded_request_decodes() {
        let mut out = BytesMut::new();
        encode_request(&Request::Read { file_name: "a/b.txt".into() }, &mut out);
        encode_request(&Request::Write { txn_id: 2, seq: 1, data: vec![0, 1, 2] }, &mut out);

        assert_eq!(
            decode_request(&mut out).unwrap().unwrap(),
            Request::Read { file_name: "a/b.txt".into() }
        );
        assert_eq!(
            decode_request(&mut out).unwrap().unwrap(),
            Request::Write { txn_id: 2, seq: 1, data: vec![0, 1, 2] }
        );
    }
}
