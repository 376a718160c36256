//! Connection lifecycle tests: expiration, reclamation, control-plane
//! changes under live traffic, concurrency and shutdown.


use std::sync::Arc;
use std::time::Duration;

use flowgate_dataplane::conn::sweep::spawn_sweeper;
use flowgate_dataplane::{Context, FlowKey, NextHop, ServiceFile, Tunables, Verdict};
use flowgate_packet::{IpProto, TcpFlags};
use flowgate_testing::{addr, tcp, tcp_syn};
use harness::{web_key, TestPlane, CLIENT, D1, D2, VIP};

#[test]
fn test_idle_connection_is_reclaimed_after_timeout() {
    let plane = TestPlane::new().with_web_service();
    plane.process(&mut tcp_syn(CLIENT, VIP));

    // SYN_RECV times out after 60 seconds.
    plane.clock.set_ms(59_999);
    assert_eq!(plane.ctx.sweep().reaped, 0);
    assert_eq!(plane.ctx.conns().len(), 1);

    plane.clock.set_ms(60_000);
    assert_eq!(plane.ctx.sweep().reaped, 1);
    assert!(plane.ctx.conns().is_empty());

    let svc = plane.ctx.services().get(&web_key()).unwrap();
    let d1 = svc.find_destination(addr(D1)).unwrap();
    assert_eq!((d1.active_conns(), d1.inactive_conns()), (0, 0));
    assert_eq!(plane.ctx.stats_snapshot().conns_reaped, 1);
}

#[test]
fn test_traffic_refreshes_idle_timer() {
    let plane = TestPlane::new().with_web_service();
    plane.process(&mut tcp_syn(CLIENT, VIP));

    plane.clock.set_ms(30_000);
    plane.process(&mut tcp(CLIENT, VIP, TcpFlags::ACK));

    plane.clock.set_ms(60_000);
    assert_eq!(plane.ctx.sweep().reaped, 0);
    let conns = plane.ctx.connections();
    assert_eq!(conns[0].state, "ESTABLISHED");
    assert_eq!(conns[0].deadline_ms, 30_000 + 900_000);
}

#[test]
fn test_referenced_connection_survives_sweep() {
    let plane = TestPlane::new().with_web_service();
    plane.process(&mut tcp_syn(CLIENT, VIP));

    let key = FlowKey::new(IpProto::TCP, addr(CLIENT), addr(VIP));
    let (held, _) = plane.ctx.conns().lookup(&key).expect("connection should exist");
    assert!(held.force_expire());

    let stats = plane.ctx.sweep();
    assert_eq!((stats.reaped, stats.busy), (0, 1));
    assert!(plane.ctx.conns().lookup(&key).is_none(), "expired connections are not returned");

    drop(held);
    assert_eq!(plane.ctx.sweep().reaped, 1);
    assert!(plane.ctx.conns().is_empty());
}

#[test]
fn test_reverse_tuple_lookup_finds_connection() {
    let plane = TestPlane::new().with_web_service();
    plane.process(&mut tcp_syn(CLIENT, VIP));

    let reverse = FlowKey::new(IpProto::TCP, addr(D1), addr(CLIENT));
    let (conn, direction) = plane.ctx.conns().lookup(&reverse).expect("reverse entry");
    assert!(!direction.is_forward());
    assert_eq!(conn.real(), addr(D1));
    assert_eq!(conn.forward_key(), FlowKey::new(IpProto::TCP, addr(CLIENT), addr(VIP)));
}

#[test]
fn test_removed_destination_stops_carrying_traffic() {
    let plane = TestPlane::new().with_web_service();
    plane.process(&mut tcp_syn(CLIENT, VIP));

    plane.ctx.remove_destination(&web_key(), addr(D1)).unwrap();
    assert!(plane.ctx.connections().is_empty());

    // Mid-flow segments no longer match and are not balanced.
    plane.clock.set_ms(1_000);
    let mut ack = tcp(CLIENT, VIP, TcpFlags::ACK);
    let original = ack.clone();
    assert_eq!(plane.process(&mut ack), Verdict::Accept);
    assert_eq!(ack, original);

    assert_eq!(plane.ctx.sweep().reaped, 1, "reclaimed before its idle timeout");

    // A new connection from the same client lands on the remaining backend.
    plane.process(&mut tcp_syn(CLIENT, VIP));
    assert_eq!(plane.tx.last_hop(), Some(NextHop::Backend(addr(D2))));
}

#[test]
fn test_removed_service_expires_its_connections() {
    let plane = TestPlane::new().with_web_service();
    plane.process(&mut tcp_syn("192.168.1.5:40001", VIP));
    plane.process(&mut tcp_syn("192.168.1.5:40002", VIP));
    assert_eq!(plane.ctx.connections().len(), 2);

    plane.ctx.remove_service(&web_key()).unwrap();
    assert!(plane.ctx.connections().is_empty());
    assert_eq!(plane.ctx.sweep().reaped, 2);

    let mut syn = tcp_syn(CLIENT, VIP);
    assert_eq!(plane.process(&mut syn), Verdict::Accept);
    assert!(plane.ctx.conns().is_empty(), "no service, nothing scheduled");
}

#[test]
fn test_table_full_drops_new_flows() {
    let plane = TestPlane::with_tunables(Tunables {
        max_connections: 1,
        ..harness::small_tunables()
    })
    .with_web_service();

    assert_eq!(plane.process(&mut tcp_syn("192.168.1.5:40001", VIP)), Verdict::Accept);
    assert_eq!(plane.process(&mut tcp_syn("192.168.1.5:40002", VIP)), Verdict::Drop);

    let stats = plane.ctx.stats_snapshot();
    assert_eq!(stats.alloc_failures, 1);
    assert_eq!(stats.sched_unreach, 0);
    assert_eq!(plane.ctx.conns().len(), 1);

    // Existing flows keep working.
    assert_eq!(
        plane.process(&mut tcp("192.168.1.5:40001", VIP, TcpFlags::ACK)),
        Verdict::Accept
    );
}

#[test]
fn test_concurrent_syns_share_one_connection() {
    let plane = TestPlane::new().with_web_service();
    let syn = tcp_syn(CLIENT, VIP);

    let verdicts: Vec<Verdict> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mut buf = syn.clone();
                let plane = &plane;
                s.spawn(move || plane.process(&mut buf))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(verdicts.iter().all(|v| *v == Verdict::Accept));
    assert_eq!(plane.ctx.conns().len(), 1);

    let svc = plane.ctx.services().get(&web_key()).unwrap();
    let bound: u32 = svc
        .destinations()
        .iter()
        .map(|d| d.active_conns() + d.inactive_conns())
        .sum();
    assert_eq!(bound, 1);
    assert_eq!(plane.ctx.connections()[0].in_pkts, 8);
}

#[test]
fn test_concurrent_clients_each_get_a_connection() {
    let plane = TestPlane::new().with_web_service();

    std::thread::scope(|s| {
        for worker in 0..4u16 {
            let plane = &plane;
            s.spawn(move || {
                for i in 0..50u16 {
                    let client = format!("192.168.{}.{}:{}", worker, i + 1, 1024 + i);
                    assert_eq!(plane.process(&mut tcp_syn(&client, VIP)), Verdict::Accept);
                }
            });
        }
    });

    assert_eq!(plane.ctx.conns().len(), 200);
    let svc = plane.ctx.services().get(&web_key()).unwrap();
    let per_dest: Vec<u32> = svc
        .destinations()
        .iter()
        .map(|d| d.inactive_conns())
        .collect();
    assert_eq!(per_dest, vec![100, 100], "round robin splits evenly");
}

#[test]
fn test_shutdown_flushes_and_is_idempotent() {
    let plane = TestPlane::new().with_web_service();
    plane.process(&mut tcp_syn(CLIENT, VIP));

    plane.ctx.shutdown();
    assert!(plane.ctx.is_shut_down());
    assert!(plane.ctx.conns().is_empty());
    assert!(plane.ctx.services().is_empty());
    assert_eq!(plane.ctx.stats_snapshot().conns_reaped, 1);

    plane.ctx.shutdown();
    assert_eq!(plane.ctx.stats_snapshot().conns_reaped, 1);

    // With no handlers registered everything passes untouched.
    let mut syn = tcp_syn(CLIENT, VIP);
    let original = syn.clone();
    assert_eq!(plane.process(&mut syn), Verdict::Accept);
    assert_eq!(syn, original);
}

#[test]
fn test_service_file_drives_context() {
    let file = ServiceFile::from_toml(
        r#"
[tunables]
conn_tab_bits = 10

[[services]]
protocol = "udp"
vaddr = "10.0.0.1:53"
one_packet = true

[[services.destinations]]
addr = "10.0.0.11"
port = 53

[[services.destinations]]
addr = "10.0.0.12"
port = 53
weight = 0
"#,
    )
    .unwrap();

    let ctx = Context::init(file.tunables.clone()).unwrap();
    for entry in &file.services {
        ctx.apply_service(&entry.to_config().unwrap(), &entry.destinations)
            .unwrap();
    }

    let services = ctx.services().services();
    assert_eq!(services.len(), 1);
    let snap = services[0].snapshot();
    assert_eq!(snap.key, "UDP 10.0.0.1:53");
    assert_eq!(snap.destinations.len(), 2);
    assert_eq!(ctx.tunables().conn_tab_bits, 10);
}

#[tokio::test]
async fn test_sweeper_reclaims_in_background() {
    let plane = TestPlane::new().with_web_service();
    plane.process(&mut tcp_syn(CLIENT, VIP));
    plane.clock.advance(Duration::from_secs(120));

    let sweeper = spawn_sweeper(Arc::clone(&plane.ctx), Duration::from_millis(10));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !plane.ctx.conns().is_empty() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "sweeper did not reclaim the connection"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    plane.ctx.shutdown();
    tokio::time::timeout(Duration::from_secs(2), sweeper)
        .await
        .expect("sweeper should stop after shutdown")
        .expect("sweeper task should not panic");
}
