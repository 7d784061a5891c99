//! DNS request processor
//!
//! A queries get a fake address with TTL 0. AAAA queries get an empty
//! NOERROR answer (NODATA) so resolvers fall back to A. Everything else gets
//! an empty answer.

use hickory_proto::op::{Header, Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};
use tracing::{debug, trace, warn};

use super::resolver::FakeIpResolver;

/// TTL of every synthesized answer
pub const FAKE_TTL: u32 = 0;

/// Build the response to `req`
pub fn handle_dns_request(req: &Message, resolver: &FakeIpResolver) -> Message {
    let mut rsp = Message::new();
    rsp.set_header(Header::response_from_request(req.header()));

    if req.op_code() != OpCode::Query || req.message_type() != MessageType::Query {
        rsp.set_response_code(ResponseCode::NotImp);
        return rsp;
    }

    for query in req.queries() {
        rsp.add_query(query.clone());

        if query.query_class() != DNSClass::IN {
            warn!(
                "FakeDNS unsupported DNS class: {:?} for query: {:?}",
                query.query_class(),
                query
            );
            continue;
        }

        let domain = query.name().to_string();
        match query.query_type() {
            RecordType::A => {
                let ip = resolver.resolve_domain(&domain);
                let mut record =
                    Record::from_rdata(query.name().clone(), FAKE_TTL, RData::A(A(ip)));
                record.set_dns_class(query.query_class());
                rsp.add_answer(record);
            }
            RecordType::AAAA => {
                debug!("FakeDNS AAAA for {} answered with no data", domain);
            }
            other => {
                debug!("FakeDNS unsupported query type: {} for {}", other, domain);
            }
        }
    }

    trace!("FakeDNS request: {:?} -> response: {:?}", req, rsp);
    rsp
}
