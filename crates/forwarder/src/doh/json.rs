//! JSON-flavor DoH (`application/dns-json`).

use super::{MIME_DNS_JSON, MIME_JSON};
use dnsteer_domain::ForwardError;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use serde::Deserialize;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Deserialize)]
pub struct JsonResponse {
    #[serde(rename = "Status")]
    pub status: u16,
    #[serde(rename = "TC", default)]
    pub tc: bool,
    #[serde(rename = "RD", default)]
    pub rd: bool,
    #[serde(rename = "RA", default)]
    pub ra: bool,
    #[serde(rename = "AD", default)]
    pub ad: bool,
    #[serde(rename = "CD", default)]
    pub cd: bool,
    #[serde(rename = "Question", default)]
    pub question: Vec<JsonQuestion>,
    #[serde(rename = "Answer", default)]
    pub answer: Vec<JsonRecord>,
    #[serde(rename = "Authority", default)]
    pub authority: Vec<JsonRecord>,
    #[serde(rename = "Comment", default)]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct JsonQuestion {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub rtype: u16,
}

#[derive(Debug, Deserialize)]
pub struct JsonRecord {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub rtype: u16,
    #[serde(rename = "TTL", default)]
    pub ttl: u32,
    #[serde(default)]
    pub data: String,
}

pub async fn exchange(
    http: &reqwest::Client,
    url: &str,
    req: &Message,
) -> Result<Message, ForwardError> {
    if req.message_type() != MessageType::Query {
        return Err(ForwardError::Proto("received a response packet".into()));
    }
    if req.queries().len() != 1 {
        return Err(ForwardError::Proto(format!(
            "JSON DoH supports exactly one question per query, got {}",
            req.queries().len()
        )));
    }
    let question = &req.queries()[0];
    if question.query_class() != hickory_proto::rr::DNSClass::IN {
        return Err(ForwardError::Proto(format!(
            "only the IN question class is supported, got {:?}",
            question.query_class()
        )));
    }

    let qname = question.name().to_string();
    let qtype = u16::from(question.query_type());

    let mut query_params: Vec<(&str, String)> = vec![
        ("ct", MIME_DNS_JSON.to_string()),
        ("name", qname),
        ("type", qtype.to_string()),
    ];
    if req.checking_disabled() {
        // Ask the upstream to skip DNSSEC validation.
        query_params.push(("cd", "1".into()));
    }
    if req
        .extensions()
        .as_ref()
        .map(|edns| edns.flags().dnssec_ok)
        .unwrap_or(false)
    {
        query_params.push(("do", "1".into()));
    }

    let response = http
        .get(url)
        .query(&query_params)
        .header(
            reqwest::header::ACCEPT,
            format!("{}, {}", MIME_DNS_JSON, MIME_JSON),
        )
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

    if content_type != MIME_DNS_JSON && content_type != MIME_JSON {
        return Err(ForwardError::UpstreamStatus {
            server: url.to_string(),
            status: status.as_u16(),
            content_type,
        });
    }
    if !status.is_success() && content_type != MIME_DNS_JSON {
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
    let parsed: JsonResponse =
        serde_json::from_slice(&body).map_err(|e| ForwardError::Proto(e.to_string()))?;

    if parsed.status != 0 {
        if let Some(comment) = parsed.comment.as_deref().filter(|c| !c.is_empty()) {
            warn!(url, status = parsed.status, comment, "json doh upstream reported an error");
        }
    }

    Ok(build_reply(req, &parsed))
}

/// Assembles a wire reply from the parsed JSON body, carrying over the
/// request id and question.
fn build_reply(req: &Message, json: &JsonResponse) -> Message {
    let mut reply = Message::new();
    reply.set_id(req.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(req.op_code());
    reply.set_response_code(ResponseCode::from(0, json.status as u8));
    reply.set_truncated(json.tc);
    reply.set_recursion_desired(json.rd);
    reply.set_recursion_available(json.ra);
    reply.set_authentic_data(json.ad);
    reply.set_checking_disabled(json.cd);
    for query in req.queries() {
        reply.add_query(query.clone());
    }

    for record in &json.answer {
        if let Some(rr) = json_record_to_rr(record) {
            reply.add_answer(rr);
        }
    }
    for record in &json.authority {
        if let Some(rr) = json_record_to_rr(record) {
            reply.add_name_server(rr);
        }
    }
    reply
}

fn json_record_to_rr(record: &JsonRecord) -> Option<Record> {
    // Some providers leave the owner name blank on HINFO/SOA rewrites;
    // normalize it to the root.
    let name_str = if record.name.is_empty() {
        "."
    } else {
        &record.name
    };
    let name = match Name::from_str(name_str) {
        Ok(name) => name,
        Err(e) => {
            warn!(name = %record.name, error = %e, "skipping answer with bad owner name");
            return None;
        }
    };

    let rtype = RecordType::from(record.rtype);
    let rdata = match parse_rdata(rtype, &record.data) {
        Ok(rdata) => rdata,
        Err(reason) => {
            warn!(%rtype, data = %record.data, reason, "skipping unmappable answer");
            return None;
        }
    };

    Some(Record::from_rdata(name, record.ttl, rdata))
}

fn parse_rdata(rtype: RecordType, data: &str) -> Result<RData, &'static str> {
    match rtype {
        RecordType::A => data
            .parse::<std::net::Ipv4Addr>()
            .map(|ip| RData::A(ip.into()))
            .map_err(|_| "bad IPv4 address"),
        RecordType::AAAA => data
            .parse::<std::net::Ipv6Addr>()
            .map(|ip| RData::AAAA(ip.into()))
            .map_err(|_| "bad IPv6 address"),
        RecordType::CNAME => Name::from_str(data)
            .map(|n| RData::CNAME(rdata::CNAME(n)))
            .map_err(|_| "bad CNAME target"),
        RecordType::NS => Name::from_str(data)
            .map(|n| RData::NS(rdata::NS(n)))
            .map_err(|_| "bad NS target"),
        RecordType::PTR => Name::from_str(data)
            .map(|n| RData::PTR(rdata::PTR(n)))
            .map_err(|_| "bad PTR target"),
        RecordType::TXT => {
            let text = data.trim_matches('"').to_string();
            Ok(RData::TXT(rdata::TXT::new(vec![text])))
        }
        RecordType::MX => {
            let (pref, exchange) = data.split_once(' ').ok_or("bad MX data")?;
            let preference = pref.parse::<u16>().map_err(|_| "bad MX preference")?;
            let exchange = Name::from_str(exchange.trim()).map_err(|_| "bad MX exchange")?;
            Ok(RData::MX(rdata::MX::new(preference, exchange)))
        }
        RecordType::SOA => {
            let fields: Vec<&str> = data.split_whitespace().collect();
            if fields.len() != 7 {
                return Err("bad SOA field count");
            }
            let mname = Name::from_str(fields[0]).map_err(|_| "bad SOA mname")?;
            let rname = Name::from_str(fields[1]).map_err(|_| "bad SOA rname")?;
            let nums: Vec<u32> = fields[2..]
                .iter()
                .map(|f| f.parse::<u32>())
                .collect::<Result<_, _>>()
                .map_err(|_| "bad SOA counter")?;
            Ok(RData::SOA(rdata::SOA::new(
                mname,
                rname,
                nums[0],
                nums[1] as i32,
                nums[2] as i32,
                nums[3] as i32,
                nums[4],
            )))
        }
        _ => Err("unsupported record type for json answers"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{OpCode, Query};
    use hickory_proto::rr::DNSClass;

    fn request(name: &str, rtype: RecordType) -> Message {
        let mut q = Query::new();
        q.set_name(Name::from_str(name).unwrap());
        q.set_query_type(rtype);
        q.set_query_class(DNSClass::IN);
        let mut msg = Message::new();
        msg.set_id(0x1234);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.add_query(q);
        msg
    }

    #[test]
    fn reply_carries_request_id_and_answers() {
        let json: JsonResponse = serde_json::from_str(
            r#"{
                "Status": 0, "TC": false, "RD": true, "RA": true,
                "Question": [{"name": "example.com.", "type": 1}],
                "Answer": [
                    {"name": "example.com.", "type": 1, "TTL": 300, "data": "93.184.216.34"}
                ]
            }"#,
        )
        .unwrap();

        let req = request("example.com.", RecordType::A);
        let reply = build_reply(&req, &json);
        assert_eq!(reply.id(), 0x1234);
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert_eq!(reply.answers().len(), 1);
        assert_eq!(reply.queries().len(), 1);
    }

    #[test]
    fn blank_owner_names_become_root() {
        let record = JsonRecord {
            name: String::new(),
            rtype: 6,
            ttl: 60,
            data: "ns. mbox. 1 2 3 4 5".into(),
        };
        let rr = json_record_to_rr(&record).unwrap();
        assert_eq!(rr.name(), &Name::root());
    }

    #[test]
    fn unknown_types_are_skipped() {
        let record = JsonRecord {
            name: "example.com.".into(),
            rtype: 65280,
            ttl: 60,
            data: "whatever".into(),
        };
        assert!(json_record_to_rr(&record).is_none());
    }

    #[test]
    fn nxdomain_status_maps_to_rcode() {
        let json: JsonResponse =
            serde_json::from_str(r#"{"Status": 3, "Question": [], "Answer": []}"#).unwrap();
        let req = request("nope.example.", RecordType::A);
        let reply = build_reply(&req, &json);
        assert_eq!(reply.response_code(), ResponseCode::NXDomain);
    }
}
