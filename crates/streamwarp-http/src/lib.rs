#![warn(missing_docs)]

//! streamwarp-http: HTTP/1.1 messages and endpoints.
//!
//! This crate provides:
//! - [`HttpRequest`] / [`HttpResponse`]: message builders with ordered,
//!   case-preserving headers and byte-stable serialization
//! - [`RequestParser`] / [`ResponseParser`]: incremental RFC 7230
//!   parsers (content-length, chunked and read-until-close framing)
//! - [`HttpServer`] / [`HttpSession`] / [`HttpClient`]: HTTP endpoints
//!   composed over the TCP layer
//!
//! The parsers enforce `http_max_header_size` and `http_max_body_size`
//! from the endpoint configuration; overruns surface as
//! `Error::HttpLimitExceeded` and disconnect the session.

mod client;
mod message;
mod parser;
mod server;

pub use client::{HttpClient, HttpClientHandler};
pub use message::{HttpRequest, HttpResponse};
pub use parser::{RequestParser, ResponseParser};
pub use server::{HttpServer, HttpServerHandler, HttpSession, HttpSessionHandler};
