//! Incremental HTTP/1.1 message parsers.
//!
//! Bytes accumulate until a complete head is available (parsed with
//! `httparse`), then the body is framed by `Content-Length`,
//! `Transfer-Encoding: chunked`, or — for responses — read until the
//! peer closes. Configured limits are enforced while accumulating, so
//! an oversized message fails before it is buffered whole.

use httparse::Status;

use streamwarp_core::error::Error;

use crate::message::{header_has_token, HttpRequest, HttpResponse};

const MAX_HEADERS: usize = 64;

/// How the message body is delimited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BodyFraming {
    None,
    Length(usize),
    Chunked,
    UntilClose,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChunkPhase {
    Size,
    Data(usize),
    DataEnd,
    Trailer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParsePhase {
    Head,
    Body(usize),
    Chunked(ChunkPhase),
    UntilClose,
}

/// Head parsing, implemented by the two message types.
pub(crate) trait ParsedMessage: Sized {
    /// Parses a complete head from `buf`. Returns the message, the
    /// head length in bytes and the body framing, or `None` when more
    /// bytes are needed.
    fn parse_head(buf: &[u8]) -> Result<Option<(Self, usize, BodyFraming)>, Error>;

    fn body_mut(&mut self) -> &mut Vec<u8>;
}

fn framing_from_headers(
    headers: &[(String, String)],
    allow_until_close: bool,
) -> Result<BodyFraming, Error> {
    let mut framing = if allow_until_close { BodyFraming::UntilClose } else { BodyFraming::None };
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("transfer-encoding") && header_has_token(value, "chunked") {
            return Ok(BodyFraming::Chunked);
        }
        if name.eq_ignore_ascii_case("content-length") {
            let length: usize = value
                .trim()
                .parse()
                .map_err(|_| Error::HttpProtocol(format!("invalid Content-Length: {value:?}")))?;
            framing = if length == 0 { BodyFraming::None } else { BodyFraming::Length(length) };
        }
    }
    Ok(framing)
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Result<Vec<(String, String)>, Error> {
    raw.iter()
        .map(|h| {
            let value = std::str::from_utf8(h.value)
                .map_err(|_| Error::HttpProtocol(format!("non-UTF-8 value for header {}", h.name)))?;
            Ok((h.name.to_owned(), value.to_owned()))
        })
        .collect()
}

impl ParsedMessage for HttpRequest {
    fn parse_head(buf: &[u8]) -> Result<Option<(Self, usize, BodyFraming)>, Error> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        let head_len = match parsed.parse(buf) {
            Ok(Status::Complete(len)) => len,
            Ok(Status::Partial) => return Ok(None),
            Err(e) => return Err(Error::HttpProtocol(e.to_string())),
        };
        let mut request = HttpRequest::new();
        request.set_head(
            parsed.method.unwrap_or(""),
            parsed.path.unwrap_or(""),
            parsed.version.unwrap_or(1),
        );
        for (name, value) in collect_headers(parsed.headers)? {
            request.set_header(&name, &value);
        }
        let framing = framing_from_headers(request.headers(), false)?;
        Ok(Some((request, head_len, framing)))
    }

    fn body_mut(&mut self) -> &mut Vec<u8> {
        HttpRequest::body_mut(self)
    }
}

impl ParsedMessage for HttpResponse {
    fn parse_head(buf: &[u8]) -> Result<Option<(Self, usize, BodyFraming)>, Error> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut headers);
        let head_len = match parsed.parse(buf) {
            Ok(Status::Complete(len)) => len,
            Ok(Status::Partial) => return Ok(None),
            Err(e) => return Err(Error::HttpProtocol(e.to_string())),
        };
        let status = parsed.code.unwrap_or(0);
        let mut response = HttpResponse::new();
        response.set_head(status, parsed.reason.unwrap_or(""), parsed.version.unwrap_or(1));
        for (name, value) in collect_headers(parsed.headers)? {
            response.set_header(&name, &value);
        }
        // 1xx, 204, 304 and a successful upgrade carry no body.
        let framing = if (100..200).contains(&status) || status == 204 || status == 304 {
            BodyFraming::None
        } else {
            framing_from_headers(response.headers(), true)?
        };
        Ok(Some((response, head_len, framing)))
    }

    fn body_mut(&mut self) -> &mut Vec<u8> {
        HttpResponse::body_mut(self)
    }
}

/// Incremental parser over a stream of bytes, yielding complete
/// messages in arrival order.
pub(crate) struct MessageParser<M: ParsedMessage> {
    buf: Vec<u8>,
    phase: ParsePhase,
    current: Option<M>,
    max_header_size: usize,
    max_body_size: usize,
}

macro_rules! parser_wrapper {
    ($(#[$docs:meta])* $name:ident, $message:ident) => {
        $(#[$docs])*
        pub struct $name {
            inner: MessageParser<$message>,
        }

        impl $name {
            /// Creates a parser enforcing the given limits
            /// (0 = unbounded body).
            pub fn new(max_header_size: usize, max_body_size: usize) -> Self {
                Self { inner: MessageParser::new(max_header_size, max_body_size) }
            }

            /// Feeds bytes and returns every message completed by them.
            pub fn advance(&mut self, data: &[u8]) -> Result<Vec<$message>, Error> {
                self.inner.advance(data)
            }

            /// Signals end-of-stream; completes a read-until-close
            /// message.
            pub fn finish_eof(&mut self) -> Option<$message> {
                self.inner.finish_eof()
            }

            /// Takes bytes buffered past the last complete message
            /// (for protocol upgrades that switch framing mid-stream).
            /// Only meaningful between messages.
            pub fn take_buffered(&mut self) -> Vec<u8> {
                self.inner.take_buffered()
            }
        }
    };
}

parser_wrapper!(
    /// Incremental HTTP request parser.
    RequestParser,
    HttpRequest
);
parser_wrapper!(
    /// Incremental HTTP response parser.
    ResponseParser,
    HttpResponse
);

impl<M: ParsedMessage> MessageParser<M> {
    /// Creates a parser enforcing the given limits (0 = unbounded body).
    pub fn new(max_header_size: usize, max_body_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            phase: ParsePhase::Head,
            current: None,
            max_header_size,
            max_body_size,
        }
    }

    /// Feeds bytes and returns every message completed by them.
    pub fn advance(&mut self, data: &[u8]) -> Result<Vec<M>, Error> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        loop {
            match self.phase {
                ParsePhase::Head => {
                    if self.buf.is_empty() {
                        break;
                    }
                    match M::parse_head(&self.buf)? {
                        None => {
                            if self.max_header_size > 0 && self.buf.len() > self.max_header_size {
                                return Err(Error::HttpLimitExceeded(format!(
                                    "header block exceeds {} bytes",
                                    self.max_header_size
                                )));
                            }
                            break;
                        }
                        Some((message, head_len, framing)) => {
                            self.buf.drain(..head_len);
                            self.current = Some(message);
                            match framing {
                                BodyFraming::None => self.finish(&mut out),
                                BodyFraming::Length(length) => {
                                    self.check_body_size(length)?;
                                    self.phase = ParsePhase::Body(length);
                                }
                                BodyFraming::Chunked => {
                                    self.phase = ParsePhase::Chunked(ChunkPhase::Size);
                                }
                                BodyFraming::UntilClose => {
                                    self.phase = ParsePhase::UntilClose;
                                }
                            }
                        }
                    }
                }
                ParsePhase::Body(remaining) => {
                    if self.buf.is_empty() {
                        break;
                    }
                    let take = remaining.min(self.buf.len());
                    let message = self.current.as_mut().expect("body phase without message");
                    message.body_mut().extend_from_slice(&self.buf[..take]);
                    self.buf.drain(..take);
                    if take == remaining {
                        self.finish(&mut out);
                    } else {
                        self.phase = ParsePhase::Body(remaining - take);
                        break;
                    }
                }
                ParsePhase::Chunked(chunk_phase) => {
                    if !self.advance_chunked(chunk_phase, &mut out)? {
                        break;
                    }
                }
                ParsePhase::UntilClose => {
                    let message = self.current.as_mut().expect("body phase without message");
                    message.body_mut().extend_from_slice(&self.buf);
                    let total = message.body_mut().len();
                    self.buf.clear();
                    self.check_body_size(total)?;
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Signals end-of-stream; completes a read-until-close message.
    pub fn finish_eof(&mut self) -> Option<M> {
        if matches!(self.phase, ParsePhase::UntilClose) {
            self.phase = ParsePhase::Head;
            self.current.take()
        } else {
            None
        }
    }

    /// Takes bytes buffered past the last complete message (for
    /// protocol upgrades that switch framing mid-stream). Only
    /// meaningful between messages.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// Processes one step of chunked decoding; false = need more bytes.
    fn advance_chunked(&mut self, chunk_phase: ChunkPhase, out: &mut Vec<M>) -> Result<bool, Error> {
        match chunk_phase {
            ChunkPhase::Size => {
                let Some(line_end) = find_crlf(&self.buf) else {
                    if self.buf.len() > 128 {
                        return Err(Error::HttpProtocol("chunk size line too long".into()));
                    }
                    return Ok(false);
                };
                let line = &self.buf[..line_end];
                let size_text = std::str::from_utf8(line)
                    .map_err(|_| Error::HttpProtocol("non-UTF-8 chunk size".into()))?;
                let size_text = size_text.split(';').next().unwrap_or("").trim();
                let size = usize::from_str_radix(size_text, 16)
                    .map_err(|_| Error::HttpProtocol(format!("invalid chunk size: {size_text:?}")))?;
                self.buf.drain(..line_end + 2);
                if size == 0 {
                    self.phase = ParsePhase::Chunked(ChunkPhase::Trailer);
                } else {
                    let body_len =
                        self.current.as_mut().map(|m| m.body_mut().len()).unwrap_or(0);
                    self.check_body_size(body_len + size)?;
                    self.phase = ParsePhase::Chunked(ChunkPhase::Data(size));
                }
                Ok(true)
            }
            ChunkPhase::Data(remaining) => {
                if self.buf.is_empty() {
                    return Ok(false);
                }
                let take = remaining.min(self.buf.len());
                let message = self.current.as_mut().expect("chunk data without message");
                message.body_mut().extend_from_slice(&self.buf[..take]);
                self.buf.drain(..take);
                if take == remaining {
                    self.phase = ParsePhase::Chunked(ChunkPhase::DataEnd);
                } else {
                    self.phase = ParsePhase::Chunked(ChunkPhase::Data(remaining - take));
                }
                Ok(true)
            }
            ChunkPhase::DataEnd => {
                if self.buf.len() < 2 {
                    return Ok(false);
                }
                if &self.buf[..2] != b"\r\n" {
                    return Err(Error::HttpProtocol("chunk data not followed by CRLF".into()));
                }
                self.buf.drain(..2);
                self.phase = ParsePhase::Chunked(ChunkPhase::Size);
                Ok(true)
            }
            ChunkPhase::Trailer => {
                // Trailer fields end at an empty line; fields themselves
                // are consumed and ignored.
                let Some(line_end) = find_crlf(&self.buf) else {
                    return Ok(false);
                };
                let empty = line_end == 0;
                self.buf.drain(..line_end + 2);
                if empty {
                    self.finish(out);
                } else {
                    self.phase = ParsePhase::Chunked(ChunkPhase::Trailer);
                }
                Ok(true)
            }
        }
    }

    fn finish(&mut self, out: &mut Vec<M>) {
        self.phase = ParsePhase::Head;
        if let Some(message) = self.current.take() {
            out.push(message);
        }
    }

    fn check_body_size(&self, size: usize) -> Result<(), Error> {
        if self.max_body_size > 0 && size > self.max_body_size {
            return Err(Error::HttpLimitExceeded(format!(
                "body of {} bytes exceeds {} bytes",
                size, self.max_body_size
            )));
        }
        Ok(())
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}
