//! WebSocket opening handshake (RFC 6455 §4).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};

use crate::errors::{Error, ErrorKind, Result};
use crate::http::headers::HeaderMap;
use crate::http::request::{write_head, BodyShape, RequestParts};
use crate::http::response::ResponseHead;
use crate::http::types::{header_value_has_token, Method};
use crate::http::url::Url;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A fresh `Sec-WebSocket-Key`: 16 random bytes, base64.
pub(crate) fn handshake_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64.encode(nonce)
}

/// The `Sec-WebSocket-Accept` value the server must answer `key` with.
pub(crate) fn accept_for(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WS_GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

/// Serializes the upgrade request head.
pub(crate) fn build_handshake(
    url: &Url,
    extra_headers: &HeaderMap,
    key: &str,
    subprotocols: &[String],
) -> Result<Vec<u8>> {
    let mut headers = extra_headers.clone();
    headers.set("Upgrade", "websocket")?;
    headers.set("Connection", "Upgrade")?;
    headers.set("Sec-WebSocket-Key", key)?;
    headers.set("Sec-WebSocket-Version", "13")?;
    if !subprotocols.is_empty() {
        headers.set("Sec-WebSocket-Protocol", subprotocols.join(", "))?;
    }

    let parts = RequestParts {
        method: Method::Get,
        url: url.clone(),
        headers,
    };

    let mut out = Vec::with_capacity(256);
    // No compression offer: frames are not content-coded.
    write_head(&parts, BodyShape::Empty, false, &mut out)?;
    Ok(out)
}

/// Validates the server's `101` answer; returns the negotiated
/// subprotocol, if any.
pub(crate) fn verify_upgrade(
    head: &ResponseHead,
    key: &str,
    offered: &[String],
) -> Result<Option<String>> {
    let fail = |detail: String| Error::new(ErrorKind::WebSocket).with_detail(detail);

    if head.status != 101 {
        return Err(fail(format!(
            "handshake refused with status {}",
            head.status
        )));
    }

    let upgrade_ok = head
        .headers
        .get("upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !upgrade_ok {
        return Err(fail("missing Upgrade: websocket".to_owned()));
    }

    let connection_ok = head
        .headers
        .get("connection")
        .map(|v| header_value_has_token(v, "upgrade"))
        .unwrap_or(false);
    if !connection_ok {
        return Err(fail("missing Connection: Upgrade".to_owned()));
    }

    let expected = accept_for(key);
    match head.headers.get("sec-websocket-accept") {
        Some(accept) if accept == expected => {}
        Some(accept) => {
            return Err(fail(format!(
                "Sec-WebSocket-Accept mismatch (got {accept:?})"
            )))
        }
        None => return Err(fail("missing Sec-WebSocket-Accept".to_owned())),
    }

    match head.headers.get("sec-websocket-protocol") {
        Some(protocol) => {
            if offered.iter().any(|p| p == protocol) {
                Ok(Some(protocol.to_owned()))
            } else {
                Err(fail(format!("server picked unoffered protocol {protocol:?}")))
            }
        }
        None => Ok(None),
    }
}
