//! RFC 8484 wire-format DoH.

use super::{HEADER_ACCEPT, MIME_DNS_MESSAGE};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dnsteer_domain::ForwardError;
use hickory_proto::op::Message;

/// Conservative bound on a GET request line most intermediaries accept.
const MAX_GET_URL_LEN: usize = 2048;

pub async fn exchange(
    http: &reqwest::Client,
    url: &str,
    req: &Message,
) -> Result<Message, ForwardError> {
    let original_id = req.id();

    // DoH clients SHOULD use an id of 0 in every request to maximize HTTP
    // cache friendliness (RFC 8484 §4.1).
    let mut wire_req = req.clone();
    wire_req.set_id(0);
    let req_bytes = crate::request::serialize_message(&wire_req)?;

    let get_url = format!(
        "{}?ct={}&dns={}",
        url,
        MIME_DNS_MESSAGE,
        URL_SAFE_NO_PAD.encode(&req_bytes)
    );

    let request = if get_url.len() < MAX_GET_URL_LEN {
        http.get(&get_url)
    } else {
        // POST bodies are the unencoded message (RFC 8484 §6).
        http.post(url)
            .header(reqwest::header::CONTENT_TYPE, MIME_DNS_MESSAGE)
            .body(req_bytes)
    };

    let response = request
        .header(reqwest::header::ACCEPT, HEADER_ACCEPT)
        .send()
        .await
        .map_err(|e| ForwardError::transport(url, e))?;

    let status = response.status();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string())
        .unwrap_or_default();

    if !status.is_success() && content_type != MIME_DNS_MESSAGE {
        return Err(ForwardError::UpstreamStatus {
            server: url.to_string(),
            status: status.as_u16(),
            content_type,
        });
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| ForwardError::transport(url, e))?;

    let mut reply = Message::from_vec(&body).map_err(|e| ForwardError::Proto(e.to_string()))?;
    if reply.id() == 0 {
        // Restore the id we zeroed out on the way in.
        reply.set_id(original_id);
    }
    Ok(reply)
}
