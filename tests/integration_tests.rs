//! Integration tests for meshlink
//!
//! Every test drives full link layers through their public surface: staged
//! packets go in, the mock radio records dispatches, the test plays the
//! radio's completions and hands frames between nodes.

use meshlink_core::anti_replay::{self, SEQNO_ASSIGNED};
use meshlink_core::link_stats::{EWMA_ALPHA, EWMA_BOOTSTRAP_ALPHA, ETX_DIVISOR, ETX_INIT, EWMA_SCALE};
use meshlink_core::liveness::{UPDATE_CHECK_INTERVAL, UPDATE_CHECK_JITTER, UPDATEACK_WAITING_PERIOD};
use meshlink_core::packetbuf::{FRAME_TYPE_CMD, PACKET_TYPE_ACK};
use meshlink_core::stack::{CMD_UPDATE, CMD_UPDATEACK, DEFAULT_SECURITY_LEVEL};
use meshlink_core::{
    AntiReplayInfo, Command, InputVerdict, LinkAddr, LinkConfig, LivenessState, NeighborTable,
    PacketAddr, PacketAttr, QueueState, SecuredNeighbor, SendError, SendReport, Timestamp,
    TxStatus,
};
use meshlink_integration_tests::test_helpers::{Node, deliver, seeded_config};
use std::time::Duration;

fn suppressed_config(seed: u64) -> LinkConfig {
    let mut config = seeded_config(seed);
    config.anti_replay.with_suppression = true;
    config
}

fn ewma(old: u16, new: u16, alpha: u16) -> u16 {
    let v = (u32::from(old) * u32::from(EWMA_SCALE - alpha) + u32::from(new) * u32::from(alpha))
        / u32::from(EWMA_SCALE);
    u16::try_from(v).unwrap()
}

// ============================================================================
// Scheduler
// ============================================================================

#[test]
fn test_ack_overtakes_queued_data() {
    let mut node = Node::new(1);
    let dest = LinkAddr::from_short(2);

    node.stage(b"P1");
    node.link.send(dest, None).unwrap();
    node.stage(b"P2");
    node.link.send(dest, None).unwrap();
    node.stage(b"P3");
    node.link
        .packetbuf_mut()
        .set_attr(PacketAttr::PacketType, PACKET_TYPE_ACK);
    node.link.send(dest, None).unwrap();
    assert_eq!(node.link.queued_packets(dest), 3);

    for _ in 0..3 {
        node.link.poll();
        node.complete_last(TxStatus::Ok, 1);
    }

    let order: Vec<&[u8]> = node.dispatched().iter().map(|d| d.bytes()).collect();
    assert_eq!(order, vec![&b"P3"[..], &b"P1"[..], &b"P2"[..]]);
    assert_eq!(node.link.drain_reports().count(), 3);
    assert_eq!(node.link.neighbor_queue_count(), 0);
}

#[test]
fn test_whole_queue_offered_to_rdc() {
    let mut node = Node::new(1);
    let dest = LinkAddr::from_short(2);
    for body in [b"a", b"b", b"c"] {
        node.stage(body);
        node.link.send(dest, None).unwrap();
    }
    node.link.poll();
    assert_eq!(node.last_dispatch().burst, 3);
    assert_eq!(node.last_dispatch().dest(), dest);
}

#[test]
fn test_noack_finalizes_after_max_transmissions() {
    let mut node = Node::new(1);
    let dest = LinkAddr::from_short(2);
    node.stage(b"lost");
    let ticket = node.link.send(dest, Some(3)).unwrap();

    let mut attempts = 0;
    loop {
        node.run_next();
        if node.dispatched().len() == attempts {
            continue;
        }
        attempts = node.dispatched().len();
        node.complete_last(TxStatus::NoAck, 1);
        if let Some(report) = node.link.poll_report() {
            assert_eq!(
                report,
                SendReport {
                    ticket,
                    dest,
                    status: TxStatus::NoAck,
                    transmissions: 3
                }
            );
            break;
        }
    }
    assert_eq!(attempts, 3);
    assert_eq!(node.link.csma_stats().noack, 1);
    assert!(node.link.queue_state(dest).is_none());
}

#[test]
fn test_collision_backoff_stays_in_window() {
    let period = Duration::from_micros(320);
    for seed in 0..16 {
        let mut node = Node::with_config(1, seeded_config(seed));
        let dest = LinkAddr::from_short(2);
        node.stage(b"contended");
        node.link.send(dest, Some(100)).unwrap();

        // Empty window on the first attempt
        assert_eq!(node.link.next_deadline(), Some(node.link.now()));
        node.link.poll();

        for k in 1..=5u32 {
            node.complete_last(TxStatus::Collision, 1);
            let now = node.link.now();
            let deadline = node.link.next_deadline().unwrap();
            let window = period * ((1u32 << k.min(4)) - 1);
            assert!(deadline.saturating_duration_since(now) < window, "k={k} seed={seed}");
            node.link.advance_to(deadline);
            assert_eq!(node.link.queue_state(dest), Some(QueueState::Transmitting));
        }
        assert!(node.link.poll_report().is_none());
    }
}

#[test]
fn test_backoff_period_follows_channel_check_interval() {
    let mut node = Node::new(1);
    node.link.rdc_mut().check_interval = Some(Duration::from_millis(125));
    let dest = LinkAddr::from_short(2);
    node.stage(b"x");
    node.link.send(dest, Some(10)).unwrap();
    node.link.poll();

    let mut longest = Duration::ZERO;
    for _ in 0..4 {
        node.complete_last(TxStatus::Collision, 1);
        let now = node.link.now();
        let deadline = node.link.next_deadline().unwrap();
        longest = longest.max(deadline.saturating_duration_since(now));
        node.link.advance_to(deadline);
    }
    // Four collisions open a 15 slot window; 320us slots would stay under 5ms
    assert!(longest > Duration::from_millis(5));
    assert!(longest < Duration::from_millis(125) * 15);
    assert_eq!(node.dispatched().len(), 5);
}

#[test]
fn test_neighbor_pool_exhaustion_leaves_queues_untouched() {
    let mut node = Node::new(1);
    let max = node.link.config().csma.max_neighbor_queues;
    for id in 0..max {
        node.stage(b"x");
        node.link.send(LinkAddr::from_short(10 + id as u16), None).unwrap();
    }
    let before: Vec<_> = (0..max)
        .map(|id| node.link.queued_packets(LinkAddr::from_short(10 + id as u16)))
        .collect();

    node.stage(b"x");
    let err = node.link.send(LinkAddr::from_short(99), None).unwrap_err();
    assert_eq!(err, SendError::NeighborPoolExhausted);
    assert!(err.is_transient());

    let after: Vec<_> = (0..max)
        .map(|id| node.link.queued_packets(LinkAddr::from_short(10 + id as u16)))
        .collect();
    assert_eq!(before, after);
    assert_eq!(node.link.neighbor_queue_count(), max);

    // Rejected sends never report
    node.link.poll();
    for dispatch in node.dispatched().to_vec() {
        node.link.rdc_completed(dispatch.queue, TxStatus::Ok, 1);
    }
    assert_eq!(node.link.drain_reports().count(), max);
    assert_eq!(node.link.neighbor_queue_count(), 0);
}

#[test]
fn test_rejected_secured_send_consumes_nothing() {
    let mut node = Node::new(1);
    for id in [10, 11] {
        node.stage(b"x");
        node.link.send_secured(LinkAddr::from_short(id), None).unwrap();
    }
    assert_eq!(node.link.anti_replay().broadcast_counter(), 2);

    node.stage(b"x");
    let err = node.link.send_secured(LinkAddr::from_short(99), None).unwrap_err();
    assert_eq!(err, SendError::NeighborPoolExhausted);
    assert_eq!(node.link.anti_replay().broadcast_counter(), 2);
    assert_eq!(node.link.packetbuf().attr(PacketAttr::MacSeqno), 0);
    assert_eq!(node.link.csma_stats().dropped, 1);

    // The next accepted send picks up exactly where the last one left off
    node.stage(b"y");
    node.link.send_secured(LinkAddr::from_short(10), None).unwrap();
    assert_eq!(anti_replay::get_counter(node.link.packetbuf()), 3);
    assert_eq!(node.link.packetbuf().attr(PacketAttr::MacSeqno), 3);
}

#[test]
fn test_packet_pool_exhaustion() {
    let mut node = Node::new(1);
    let dest = LinkAddr::from_short(2);
    let limit = node.link.config().csma.max_packet_per_neighbor;
    for _ in 0..limit {
        node.stage(b"x");
        node.link.send(dest, None).unwrap();
    }
    node.stage(b"x");
    let err = node.link.send(dest, None).unwrap_err();
    assert!(err.is_resource_exhaustion());
    assert_eq!(node.link.queued_packets(dest), limit);
}

#[test]
fn test_fatal_error_finalizes_immediately() {
    let mut node = Node::new(1);
    let dest = LinkAddr::from_short(2);
    node.stage(b"x");
    node.link.send(dest, None).unwrap();
    node.link.poll();
    node.complete_last(TxStatus::ErrFatal, 0);

    let report = node.link.poll_report().unwrap();
    assert_eq!(report.status, TxStatus::ErrFatal);
    assert_eq!(report.transmissions, 0);
    assert_eq!(node.dispatched().len(), 1);
}

// ============================================================================
// Link statistics
// ============================================================================

#[test]
fn test_etx_bootstrap_then_steady_alpha() {
    let mut node = Node::new(1);
    let dest = LinkAddr::from_short(2);
    let mut expected = ETX_INIT * ETX_DIVISOR;

    for i in 1..=6u16 {
        node.stage(b"x");
        node.link.send(dest, None).unwrap();
        node.link.poll();
        node.complete_last(TxStatus::Ok, 1);

        // Freshness counts transmissions; four make the estimate fresh
        let alpha = if i >= 4 { EWMA_ALPHA } else { EWMA_BOOTSTRAP_ALPHA };
        expected = ewma(expected, ETX_DIVISOR, alpha);
        let stats = node.link.link_stats_from_addr(&dest).unwrap();
        assert_eq!(stats.etx, expected, "after {i} transmissions");
    }
    assert_eq!(ewma(ETX_INIT * ETX_DIVISOR, ETX_DIVISOR, EWMA_BOOTSTRAP_ALPHA), 217);
    assert!(node.link.link_stats_is_fresh(&dest));
}

#[test]
fn test_freshness_expires_with_time() {
    let mut node = Node::new(1);
    let dest = LinkAddr::from_short(2);
    node.stage(b"x");
    node.link.send(dest, Some(20)).unwrap();
    node.link.poll();
    node.complete_last(TxStatus::Ok, 16);
    assert_eq!(node.link.link_stats_from_addr(&dest).unwrap().freshness, 16);
    assert!(node.link.link_stats_is_fresh(&dest));

    node.advance(Duration::from_secs(10 * 60));
    assert!(!node.link.link_stats_is_fresh(&dest));
}

#[test]
fn test_collisions_do_not_touch_etx() {
    let mut node = Node::new(1);
    let dest = LinkAddr::from_short(2);
    node.stage(b"x");
    node.link.send(dest, None).unwrap();
    node.link.poll();
    node.complete_last(TxStatus::Ok, 1);
    let etx = node.link.link_stats_from_addr(&dest).unwrap().etx;

    node.stage(b"y");
    node.link.send(dest, Some(3)).unwrap();
    node.link.poll();
    node.complete_last(TxStatus::Collision, 1);
    assert_eq!(node.link.link_stats_from_addr(&dest).unwrap().etx, etx);
}

#[test]
fn test_rssi_tracked_on_input() {
    let mut tx = Node::new(1);
    let mut rx = Node::new(2);
    tx.stage(b"hello");
    tx.link.send(rx.addr, None).unwrap();
    tx.link.poll();
    let frame = tx.last_dispatch();

    deliver(&frame, tx.addr, &mut rx, -70, false);
    assert_eq!(rx.link.input(), InputVerdict::Accepted);
    assert_eq!(rx.link.link_stats_from_addr(&tx.addr).unwrap().rssi, -70);

    deliver(&frame, tx.addr, &mut rx, -90, false);
    rx.link.input();
    // 0.85 * -70 + 0.15 * -90
    assert_eq!(rx.link.link_stats_from_addr(&tx.addr).unwrap().rssi, -73);
}

#[test]
fn test_aging_halves_freshness() {
    let mut node = Node::new(1);
    let dest = LinkAddr::from_short(2);
    node.stage(b"x");
    node.link.send(dest, Some(10)).unwrap();
    node.link.poll();
    node.complete_last(TxStatus::NoAck, 8);
    assert_eq!(node.link.link_stats_from_addr(&dest).unwrap().freshness, 8);

    node.link.advance_to(Timestamp::from_secs(15 * 60));
    assert_eq!(node.link.link_stats_from_addr(&dest).unwrap().freshness, 4);
    node.link.advance_to(Timestamp::from_secs(30 * 60));
    assert_eq!(node.link.link_stats_from_addr(&dest).unwrap().freshness, 2);
}

// ============================================================================
// Anti-replay
// ============================================================================

fn secured_frame_to(node: &mut Node, from: LinkAddr, counter: u32) -> InputVerdict {
    let to = node.addr;
    let pb = node.link.packetbuf_mut();
    pb.copy_in(b"secured");
    pb.set_addr(PacketAddr::Sender, from);
    pb.set_addr(PacketAddr::Receiver, to);
    pb.set_attr(PacketAttr::SecurityLevel, DEFAULT_SECURITY_LEVEL);
    anti_replay::parse_counter(pb, counter.to_le_bytes());
    node.link.input()
}

#[test]
fn test_replay_window_per_traffic_class() {
    let mut node = Node::new(1);
    let peer = LinkAddr::from_short(2);
    let mut neighbor = SecuredNeighbor::permanent(Timestamp::from_secs(3600));
    neighbor.anti_replay = AntiReplayInfo {
        last_unicast_counter: 5,
        ..AntiReplayInfo::default()
    };
    node.link.neighbors_mut().insert(peer, neighbor).unwrap();

    for old in [0, 1, 5] {
        assert_eq!(secured_frame_to(&mut node, peer, old), InputVerdict::Replayed);
    }
    for fresh in [6, 7, 8] {
        assert_eq!(secured_frame_to(&mut node, peer, fresh), InputVerdict::Accepted);
    }
    assert_eq!(secured_frame_to(&mut node, peer, 4), InputVerdict::Replayed);
    assert_eq!(
        node.link.neighbors().get(&peer).unwrap().anti_replay.last_unicast_counter,
        8
    );
}

#[test]
fn test_suppressed_counter_wraps_low_byte() {
    let mut tx = Node::with_config(1, suppressed_config(1));
    let mut rx = Node::with_config(2, suppressed_config(2));

    let mut toward_rx = SecuredNeighbor::permanent(Timestamp::from_secs(3600));
    toward_rx.anti_replay.my_unicast_counter = 0x1FE;
    tx.link.neighbors_mut().insert(rx.addr, toward_rx).unwrap();

    let mut from_tx = SecuredNeighbor::permanent(Timestamp::from_secs(3600));
    from_tx.anti_replay.last_unicast_counter = 0x1FE;
    rx.link.neighbors_mut().insert(tx.addr, from_tx).unwrap();

    for expected in [0x1FFu32, 0x200] {
        tx.stage(b"data");
        tx.link.send_secured(rx.addr, None).unwrap();
        tx.link.poll();
        let frame = tx.last_dispatch();
        assert_eq!(
            frame.frame.attr(PacketAttr::MacSeqno),
            SEQNO_ASSIGNED | (expected & 0xFF) as u16
        );
        tx.complete_last(TxStatus::Ok, 1);

        deliver(&frame, tx.addr, &mut rx, -60, true);
        assert_eq!(rx.link.input(), InputVerdict::Accepted);
        assert_eq!(anti_replay::get_counter(rx.link.packetbuf()), expected);
    }
    assert_eq!(
        rx.link.neighbors().get(&tx.addr).unwrap().anti_replay.last_unicast_counter,
        0x200
    );
}

#[test]
fn test_secured_frame_from_tentative_neighbor_rejected() {
    let mut node = Node::new(1);
    let peer = LinkAddr::from_short(2);
    node.link
        .neighbors_mut()
        .insert(peer, SecuredNeighbor::tentative(Timestamp::from_secs(60)))
        .unwrap();
    assert_eq!(secured_frame_to(&mut node, peer, 1), InputVerdict::UnknownNeighbor);
}

#[test]
fn test_init_anti_replay_from_first_frame() {
    let mut node = Node::new(1);
    let peer = LinkAddr::from_short(2);
    node.link
        .neighbors_mut()
        .insert(peer, SecuredNeighbor::permanent(Timestamp::from_secs(60)))
        .unwrap();

    let pb = node.link.packetbuf_mut();
    pb.clear();
    anti_replay::parse_counter(pb, 40u32.to_le_bytes());
    assert!(node.link.init_anti_replay(&peer));
    assert!(!node.link.init_anti_replay(&LinkAddr::from_short(3)));

    assert_eq!(secured_frame_to(&mut node, peer, 40), InputVerdict::Replayed);
    assert_eq!(secured_frame_to(&mut node, peer, 41), InputVerdict::Accepted);
}

// ============================================================================
// Liveness
// ============================================================================

fn start_sweep(node: &mut Node) {
    node.link
        .advance_to(Timestamp::ZERO + UPDATE_CHECK_INTERVAL + UPDATE_CHECK_JITTER);
}

#[test]
fn test_unresponsive_neighbor_deleted() {
    let mut node = Node::new(1);
    let peer = LinkAddr::from_short(2);
    node.link
        .neighbors_mut()
        .insert(peer, SecuredNeighbor::permanent(Timestamp::from_secs(1)))
        .unwrap();

    start_sweep(&mut node);
    assert_eq!(node.dispatched().len(), 1);
    let update = node.last_dispatch();
    assert_eq!(update.dest(), peer);
    assert_eq!(update.bytes(), &[CMD_UPDATE]);
    assert_eq!(update.frame.attr(PacketAttr::FrameType), FRAME_TYPE_CMD);

    node.complete_last(TxStatus::Ok, 1);
    assert_eq!(node.link.liveness_state(), LivenessState::WaitingAck(peer));

    node.advance(UPDATEACK_WAITING_PERIOD - Duration::from_secs(1));
    assert!(node.link.neighbors().get(&peer).is_some());
    node.advance(Duration::from_secs(1));
    assert!(node.link.neighbors().get(&peer).is_none());

    assert_eq!(node.dispatched().len(), 1);
    assert_eq!(node.link.liveness_stats().deleted, 1);
    assert_eq!(node.link.liveness_state(), LivenessState::Idle);
}

#[test]
fn test_refreshed_neighbor_survives() {
    let mut a = Node::new(1);
    let mut b = Node::new(2);
    a.link
        .neighbors_mut()
        .insert(b.addr, SecuredNeighbor::permanent(Timestamp::from_secs(1)))
        .unwrap();
    b.link
        .neighbors_mut()
        .insert(a.addr, SecuredNeighbor::permanent(Timestamp::from_secs(100_000)))
        .unwrap();

    start_sweep(&mut a);
    let update = a.last_dispatch();
    a.complete_last(TxStatus::Ok, 1);

    deliver(&update, a.addr, &mut b, -65, false);
    assert_eq!(b.link.input(), InputVerdict::Command(Command::Update));
    b.link.poll();
    let ack = b.last_dispatch();
    assert_eq!(ack.bytes(), &[CMD_UPDATEACK]);
    assert_eq!(ack.dest(), a.addr);

    a.advance(Duration::from_secs(3));
    deliver(&ack, b.addr, &mut a, -65, false);
    assert_eq!(a.link.input(), InputVerdict::Command(Command::UpdateAck));

    a.advance(UPDATEACK_WAITING_PERIOD);
    let neighbor = a.link.neighbors().get(&b.addr).copied().unwrap();
    assert!(!neighbor.is_expired(a.link.now()));
    assert_eq!(a.link.liveness_stats().refreshed, 1);
    assert_eq!(a.link.liveness_stats().deleted, 0);
}

#[test]
fn test_failed_update_leaves_neighbor_for_next_sweep() {
    let mut node = Node::new(1);
    let peer = LinkAddr::from_short(2);
    node.link
        .neighbors_mut()
        .insert(peer, SecuredNeighbor::permanent(Timestamp::from_secs(1)))
        .unwrap();

    start_sweep(&mut node);
    // Radio error: the UPDATE never went on air
    node.complete_last(TxStatus::Err, 1);
    assert_eq!(node.link.liveness_state(), LivenessState::Idle);
    assert!(node.link.neighbors().get(&peer).is_some());
    assert_eq!(node.link.liveness_stats().updates_failed, 1);

    // Next sweep challenges it again
    node.advance(UPDATE_CHECK_INTERVAL + UPDATE_CHECK_JITTER);
    assert_eq!(node.dispatched().len(), 2);
    assert_eq!(node.link.liveness_state(), LivenessState::WaitingSend(peer));
}

#[test]
fn test_powered_off_neighbor_deleted_after_noack() {
    let mut node = Node::new(1);
    let peer = LinkAddr::from_short(2);
    node.link
        .neighbors_mut()
        .insert(peer, SecuredNeighbor::permanent(Timestamp::from_secs(1)))
        .unwrap();

    start_sweep(&mut node);
    // UPDATE limit is MAX_RETRANSMISSIONS + 1 attempts, none acknowledged
    node.complete_last(TxStatus::NoAck, 3);
    assert_eq!(node.link.liveness_state(), LivenessState::WaitingAck(peer));

    node.advance(UPDATEACK_WAITING_PERIOD);
    assert!(node.link.neighbors().get(&peer).is_none());
    assert_eq!(node.dispatched().len(), 1);

    let stats = node.link.liveness_stats();
    assert_eq!(stats.updates_sent, 1);
    assert_eq!(stats.updates_failed, 0);
    assert_eq!(stats.deleted, 1);
    assert_eq!(node.link.liveness_state(), LivenessState::Idle);
}

#[test]
fn test_sweep_skips_fresh_and_tentative_neighbors() {
    let mut node = Node::new(1);
    node.link
        .neighbors_mut()
        .insert(
            LinkAddr::from_short(2),
            SecuredNeighbor::permanent(Timestamp::from_secs(100_000)),
        )
        .unwrap();
    node.link
        .neighbors_mut()
        .insert(LinkAddr::from_short(3), SecuredNeighbor::tentative(Timestamp::ZERO))
        .unwrap();

    start_sweep(&mut node);
    assert!(node.dispatched().is_empty());
    assert_eq!(node.link.liveness_stats().sweeps, 1);
    assert_eq!(node.link.liveness_state(), LivenessState::Idle);
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_config_file_drives_stack() {
    let config = LinkConfig::from_toml_str(
        r#"
        neighbor_table_size = 4
        rng_seed = 3

        [csma]
        max_neighbor_queues = 1
        "#,
    )
    .unwrap();
    let mut node = Node::with_config(1, config);
    node.stage(b"x");
    node.link.send(LinkAddr::from_short(2), None).unwrap();
    node.stage(b"x");
    assert_eq!(
        node.link.send(LinkAddr::from_short(3), None),
        Err(SendError::NeighborPoolExhausted)
    );
}
