//! Fake-IP integration tests
//!
//! The responder is queried over real UDP and its answers are mapped back
//! to domains the way the interceptor does it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use rust_procproxy::fakedns::{FakeDns, FakeDnsConfig, FakeIpResolver};
use rust_procproxy::tunnel::TargetAddr;

fn resolver(pool: &str, max_entries: u64) -> FakeIpResolver {
    FakeIpResolver::new(
        &FakeDnsConfig::new()
            .with_ipv4_pool(pool.parse().unwrap())
            .with_max_entries(max_entries),
    )
}

async fn ask(client: &UdpSocket, server: SocketAddr, id: u16, name: &str, kind: RecordType) -> Message {
    let mut req = Message::new();
    req.set_id(id);
    req.set_message_type(MessageType::Query);
    req.set_op_code(OpCode::Query);
    req.set_recursion_desired(true);
    req.add_query(Query::query(Name::from_str(name).unwrap(), kind));
    client.send_to(&req.to_vec().unwrap(), server).await.unwrap();

    let mut buf = [0u8; 512];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    Message::from_vec(&buf[..n]).unwrap()
}

fn answer_ip(rsp: &Message) -> Ipv4Addr {
    match rsp.answers()[0].data() {
        Some(RData::A(a)) => a.0,
        other => panic!("Expected A record, got {other:?}"),
    }
}

#[tokio::test]
async fn test_responder_answers_are_reversible() {
    let dns = FakeDns::builder("127.0.0.1:0".parse().unwrap())
        .config(FakeDnsConfig::default())
        .build()
        .await
        .unwrap();
    let server = dns.local_addr().unwrap();
    let resolver = dns.resolver().clone();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(dns.run(cancel.clone()));

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let first = ask(&client, server, 1, "a.example.", RecordType::A).await;
    let again = ask(&client, server, 2, "a.example.", RecordType::A).await;
    let other = ask(&client, server, 3, "b.example.", RecordType::A).await;

    let ip = answer_ip(&first);
    assert_eq!(again.id(), 2);
    assert_eq!(answer_ip(&again), ip);
    assert_ne!(answer_ip(&other), ip);
    assert_eq!(first.answers()[0].ttl(), 0);
    assert!(resolver.is_fake_ip(IpAddr::V4(ip)));

    // a connection to the fake address is tunnelled by name
    let target = TargetAddr::from_original(SocketAddr::from((ip, 443)), Some(&resolver));
    assert_eq!(target, TargetAddr::Domain("a.example".into(), 443));

    let aaaa = ask(&client, server, 4, "a.example.", RecordType::AAAA).await;
    assert_eq!(aaaa.response_code(), ResponseCode::NoError);
    assert!(aaaa.answers().is_empty());

    cancel.cancel();
    task.await.unwrap();
}

#[test]
fn test_evicted_domain_reported_missing_once() {
    let resolver = resolver("198.18.0.0/24", 100);
    let ip = resolver.resolve_domain("a.example.");
    assert_eq!(resolver.resolve_domain("a.example."), ip);
    assert_eq!(resolver.get_by_ip(IpAddr::V4(ip)).as_deref(), Some("a.example."));

    resolver.forget("a.example.");
    assert_eq!(resolver.cache().reverse_len(), 1);
    assert_eq!(resolver.get_by_ip(IpAddr::V4(ip)), None);
    assert_eq!(resolver.cache().reverse_len(), 0);
    assert_eq!(resolver.get_by_ip(IpAddr::V4(ip)), None);
    assert_eq!(resolver.cache().stats().snapshot().stale_repairs, 1);

    // an address outside the block falls back to the IP itself
    let real = SocketAddr::from(([93, 184, 216, 34], 80));
    assert_eq!(TargetAddr::from_original(real, Some(&resolver)), TargetAddr::Ip(real));
}

#[test]
fn test_exhausted_pool_recycles() {
    let resolver = resolver("198.18.0.0/30", 100);
    let domains: Vec<String> = (0..6).map(|i| format!("d{i}.example.")).collect();
    let ips: Vec<Ipv4Addr> = domains.iter().map(|d| resolver.resolve_domain(d)).collect();

    for ip in &ips {
        assert!(resolver.is_fake_ip(IpAddr::V4(*ip)));
    }
    // the reverse map never outgrows the block
    assert!(resolver.cache().reverse_len() as u64 <= resolver.pool().size());
    assert!(resolver.cache().stats().snapshot().recycled > 0);

    // the newest owner of each address wins
    let last = domains.last().unwrap();
    let last_ip = *ips.last().unwrap();
    assert_eq!(resolver.get_by_ip(IpAddr::V4(last_ip)).as_deref(), Some(last.as_str()));
    let first_ip = ips[0];
    let owner = resolver.get_by_ip(IpAddr::V4(first_ip));
    assert_ne!(owner.as_deref(), Some(domains[0].as_str()));
}
