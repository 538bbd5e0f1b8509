//! WebSocket upgrade handshake.
//!
//! The accept key is `base64(sha1(key_b64 + GUID))` over the fixed RFC
//! 6455 GUID. Requests and responses are ordinary HTTP/1.1 messages
//! built and parsed by the HTTP layer.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};

use streamwarp_http::{HttpRequest, HttpResponse};

/// RFC 6455 accept-hash GUID.
pub const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// WebSocket protocol version this implementation speaks.
pub const VERSION: &str = "13";

/// Generates a new `Sec-WebSocket-Key`: 16 random bytes, Base64.
pub fn new_sec_key() -> String {
    let nonce: [u8; 16] = rand::random();
    STANDARD.encode(nonce)
}

/// Derives `Sec-WebSocket-Accept` from a `Sec-WebSocket-Key` value.
pub fn derive_accept_key(sec_key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(sec_key.as_bytes());
    sha1.update(GUID);
    STANDARD.encode(sha1.finalize())
}

/// Builds the client upgrade request for `target` on `host`.
pub fn make_upgrade_request(host: &str, target: &str, sec_key: &str) -> HttpRequest {
    let mut request = HttpRequest::make_get_request(target);
    request.set_header("Host", host);
    request.set_header("Upgrade", "websocket");
    request.set_header("Connection", "Upgrade");
    request.set_header("Sec-WebSocket-Key", sec_key);
    request.set_header("Sec-WebSocket-Version", VERSION);
    request
}

/// Checks an inbound request for a well-formed upgrade and returns its
/// `Sec-WebSocket-Key`.
pub fn validate_upgrade_request(request: &HttpRequest) -> Result<String, String> {
    if !request.method().eq_ignore_ascii_case("GET") {
        return Err(format!("unexpected method {:?}", request.method()));
    }
    let upgrade = request.header("Upgrade").unwrap_or("");
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(format!("unexpected Upgrade header {upgrade:?}"));
    }
    let connection = request.header("Connection").unwrap_or("");
    if !connection_has_upgrade(connection) {
        return Err(format!("Connection header {connection:?} lacks the upgrade token"));
    }
    match request.header("Sec-WebSocket-Version") {
        Some(VERSION) => {}
        other => return Err(format!("unsupported Sec-WebSocket-Version {other:?}")),
    }
    match request.header("Sec-WebSocket-Key") {
        Some(key) if !key.is_empty() => Ok(key.to_owned()),
        _ => Err("missing Sec-WebSocket-Key".to_owned()),
    }
}

/// Builds the `101 Switching Protocols` reply for a validated upgrade
/// request, echoing the first offered subprotocol.
pub fn make_upgrade_response(request: &HttpRequest, sec_key: &str) -> HttpResponse {
    let mut response = HttpResponse::new();
    response.set_begin(101, None);
    response.set_header("Upgrade", "websocket");
    response.set_header("Connection", "Upgrade");
    response.set_header("Sec-WebSocket-Accept", &derive_accept_key(sec_key));
    if let Some(protocols) = request.header("Sec-WebSocket-Protocol") {
        if let Some(first) = protocols.split(',').map(str::trim).find(|p| !p.is_empty()) {
            response.set_header("Sec-WebSocket-Protocol", first);
        }
    }
    response
}

/// Checks the server's reply against the key the client sent.
pub fn validate_upgrade_response(response: &HttpResponse, sec_key: &str) -> Result<(), String> {
    if response.status() != 101 {
        return Err(format!("unexpected status {}", response.status()));
    }
    let upgrade = response.header("Upgrade").unwrap_or("");
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(format!("unexpected Upgrade header {upgrade:?}"));
    }
    let connection = response.header("Connection").unwrap_or("");
    if !connection_has_upgrade(connection) {
        return Err(format!("Connection header {connection:?} lacks the upgrade token"));
    }
    let expected = derive_accept_key(sec_key);
    match response.header("Sec-WebSocket-Accept") {
        Some(accept) if accept == expected => Ok(()),
        other => Err(format!("Sec-WebSocket-Accept mismatch: {other:?}")),
    }
}

fn connection_has_upgrade(value: &str) -> bool {
    value.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_the_rfc_sample_accept_key() {
        assert_eq!(
            derive_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn sec_keys_are_base64_of_16_bytes() {
        let key = new_sec_key();
        assert_eq!(key.len(), 24);
        assert_eq!(STANDARD.decode(&key).unwrap().len(), 16);
        assert_ne!(new_sec_key(), key);
    }

    #[test]
    fn upgrade_round_trip_validates() {
        let key = new_sec_key();
        let request = make_upgrade_request("localhost:8081", "/chat", &key);
        let parsed_key = validate_upgrade_request(&request).unwrap();
        assert_eq!(parsed_key, key);
        let response = make_upgrade_response(&request, &parsed_key);
        assert!(validate_upgrade_response(&response, &key).is_ok());
    }

    #[test]
    fn subprotocol_echoes_first_offer() {
        let key = new_sec_key();
        let mut request = make_upgrade_request("localhost", "/", &key);
        request.set_header("Sec-WebSocket-Protocol", "chat, superchat");
        let response = make_upgrade_response(&request, &key);
        assert_eq!(response.header("Sec-WebSocket-Protocol"), Some("chat"));
    }

    #[test]
    fn rejects_wrong_version_and_missing_key() {
        let mut wrong_version = HttpRequest::make_get_request("/");
        wrong_version.set_header("Upgrade", "websocket");
        wrong_version.set_header("Connection", "Upgrade");
        wrong_version.set_header("Sec-WebSocket-Key", &new_sec_key());
        wrong_version.set_header("Sec-WebSocket-Version", "12");
        assert!(validate_upgrade_request(&wrong_version).is_err());

        let mut keyless = HttpRequest::make_get_request("/");
        keyless.set_header("Upgrade", "websocket");
        keyless.set_header("Connection", "Upgrade");
        keyless.set_header("Sec-WebSocket-Version", VERSION);
        assert!(validate_upgrade_request(&keyless).is_err());
    }

    #[test]
    fn rejects_tampered_accept() {
        let key = new_sec_key();
        let mut response = HttpResponse::new();
        response.set_begin(101, None);
        response.set_header("Upgrade", "websocket");
        response.set_header("Connection", "Upgrade");
        response.set_header("Sec-WebSocket-Accept", "bm90IHRoZSByaWdodCBrZXk=");
        assert!(validate_upgrade_response(&response, &key).is_err());
    }
}
