use std::io;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::{Error, Message};

/// Content-Length framed JSON-RPC codec.
///
/// One or more header lines terminated by `\r\n`, a blank line, then a UTF-8
/// JSON body of exactly the declared byte length. Only `Content-Length` is
/// interpreted; other headers are skipped.
#[derive(Debug, Default)]
pub struct LspCodec {
    /// Body length parsed from the current header block, when the body has
    /// not fully arrived yet.
    body_len: Option<usize>,
}

impl LspCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

const MAX_HEADER_BLOCK_IN_BYTES: usize = 8 * 1024;
const MAX_RESERVE_CHUNK_IN_BYTES: usize = 8 * 1024; // 8 kiB

impl Decoder for LspCodec {
    type Item = Message;

    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if let Some(length) = self.body_len {
                if src.len() < length {
                    // Body still incomplete; grow the buffer ahead of the
                    // remaining reads.
                    let additional = core::cmp::min(MAX_RESERVE_CHUNK_IN_BYTES, length - src.len());
                    src.reserve(additional);
                    return Ok(None);
                }

                self.body_len = None;

                // Consuming via `split_to` keeps the buffer compact across
                // long runs of messages.
                let body = src.split_to(length).freeze();

                let value: serde_json::Value =
                    serde_json::from_slice(&body).map_err(|e| invalid_data(Error::InvalidBody(e)))?;
                let message = Message::from_value(value).map_err(invalid_data)?;

                return Ok(Some(message));
            }

            let Some(header_end) = find_subsequence(src, b"\r\n\r\n") else {
                if src.len() > MAX_HEADER_BLOCK_IN_BYTES {
                    return Err(invalid_data(Error::HeaderBlockOversized {
                        size: src.len(),
                        max: MAX_HEADER_BLOCK_IN_BYTES,
                    }));
                }
                // Header block incomplete; wait for more bytes.
                return Ok(None);
            };

            let header_block = src.split_to(header_end + 4);
            let length = parse_content_length(&header_block[..header_end]).map_err(invalid_data)?;
            self.body_len = Some(length);
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() && self.body_len.is_none() => Ok(None),
            None => {
                let missing = self.body_len.map_or(0, |length| length.saturating_sub(src.len()));
                Err(invalid_data(Error::TruncatedMessage { missing }))
            }
        }
    }
}

impl Encoder<Message> for LspCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(&item.into_value())?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        dst.reserve(header.len() + body.len());
        dst.extend_from_slice(header.as_bytes());
        dst.extend_from_slice(&body);
        Ok(())
    }
}

fn invalid_data(error: Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, error)
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Scans a header block for `Content-Length`.
///
/// The header name is matched case-insensitively; the value must parse as a
/// non-negative integer.
fn parse_content_length(block: &[u8]) -> Result<usize, Error> {
    for line in block.split(|&byte| byte == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        let Some(colon) = line.iter().position(|&byte| byte == b':') else {
            continue;
        };
        let (name, rest) = line.split_at(colon);

        if !name.trim_ascii().eq_ignore_ascii_case(b"Content-Length") {
            continue;
        }

        let value = String::from_utf8_lossy(&rest[1..]);
        let value = value.trim();

        return value
            .parse::<usize>()
            .map_err(|_| Error::InvalidContentLength { value: value.to_owned() });
    }

    Err(Error::MissingContentLength)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;
    use crate::{MessageId, Request};
    use futures_util::StreamExt as _;
    use serde_json::json;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, ReadBuf};
    use tokio_util::codec::FramedRead;

    /// Hands bytes out in fixed-size chunks, to exercise partial reads.
    struct MockAsyncReader {
        raw: Vec<u8>,
        chunk: usize,
    }

    impl AsyncRead for MockAsyncReader {
        fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            if self.raw.is_empty() {
                return Poll::Ready(Ok(()));
            }
            let amount = buf.remaining().min(self.raw.len()).min(self.chunk);
            buf.put_slice(&self.raw[..amount]);
            self.raw.drain(..amount);
            Poll::Ready(Ok(()))
        }
    }

    fn frame(body: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{body}", body.len()).into_bytes()
    }

    #[tokio::test]
    async fn decode_single_message() {
        let raw = frame(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#);
        let reader = MockAsyncReader { raw, chunk: usize::MAX };

        let mut framed = FramedRead::new(reader, LspCodec::new());
        let message = framed.next().await.unwrap().unwrap();

        let Message::Request(request) = message else {
            panic!("expected a request");
        };
        assert_eq!(request.method(), "initialize");
        assert_eq!(request.id(), MessageId::Int(1));
    }

    #[tokio::test]
    async fn decode_across_chunk_boundaries() {
        let mut raw = frame(r#"{"jsonrpc":"2.0","method":"a"}"#);
        raw.extend_from_slice(&frame(r#"{"jsonrpc":"2.0","method":"b"}"#));
        let reader = MockAsyncReader { raw, chunk: 3 };

        let mut framed = FramedRead::new(reader, LspCodec::new());
        let first = framed.next().await.unwrap().unwrap();
        let second = framed.next().await.unwrap().unwrap();

        assert_eq!(first.method(), Some("a"));
        assert_eq!(second.method(), Some("b"));
        assert!(framed.next().await.is_none());
    }

    #[tokio::test]
    async fn extra_headers_are_ignored() {
        let body = r#"{"jsonrpc":"2.0","method":"x"}"#;
        let raw = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\ncontent-length: {}\r\n\r\n{body}",
            body.len()
        )
        .into_bytes();
        let reader = MockAsyncReader { raw, chunk: usize::MAX };

        let mut framed = FramedRead::new(reader, LspCodec::new());
        let message = framed.next().await.unwrap().unwrap();
        assert_eq!(message.method(), Some("x"));
    }

    #[tokio::test]
    async fn missing_content_length_is_an_error() {
        let raw = b"Content-Type: application/json\r\n\r\n{}".to_vec();
        let reader = MockAsyncReader { raw, chunk: usize::MAX };

        let mut framed = FramedRead::new(reader, LspCodec::new());
        let error = framed.next().await.unwrap().unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn bad_content_length_is_an_error() {
        let raw = b"Content-Length: twelve\r\n\r\n{}".to_vec();
        let reader = MockAsyncReader { raw, chunk: usize::MAX };

        let mut framed = FramedRead::new(reader, LspCodec::new());
        let error = framed.next().await.unwrap().unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn eof_mid_body_is_an_error() {
        let mut raw = frame(r#"{"jsonrpc":"2.0","method":"x"}"#);
        raw.truncate(raw.len() - 5);
        let reader = MockAsyncReader { raw, chunk: usize::MAX };

        let mut framed = FramedRead::new(reader, LspCodec::new());
        let error = framed.next().await.unwrap().unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn content_length_counts_bytes_not_chars() {
        let message = Message::Notification(crate::Notification::new(
            "window/showMessage",
            Some(json!({"message": "héllo"})),
        ));

        let mut dst = BytesMut::new();
        LspCodec::new().encode(message, &mut dst).unwrap();

        let text = String::from_utf8(dst.to_vec()).unwrap();
        let (header, body) = text.split_once("\r\n\r\n").unwrap();
        let declared: usize = header.trim_start_matches("Content-Length: ").parse().unwrap();
        assert_eq!(declared, body.len());
        assert!(declared > body.chars().count());
    }

    proptest::proptest! {
        /// Decoding an encoding yields the original message.
        #[test]
        fn encode_decode_round_trip(
            id in proptest::prelude::any::<i64>(),
            method in "[a-z]{1,10}(/[a-zA-Z]{1,14})?",
            key in "[a-z]{1,8}",
            value in "[ -~]{0,40}",
        ) {
            let original = Message::Request(Request::new(
                MessageId::Int(id),
                &method,
                Some(json!({ key.clone(): value })),
            ));

            let mut dst = BytesMut::new();
            LspCodec::new().encode(original.clone(), &mut dst).unwrap();
            let decoded = LspCodec::new().decode(&mut dst).unwrap().unwrap();

            proptest::prop_assert_eq!(original, decoded);
            proptest::prop_assert!(dst.is_empty());
        }
    }
}
