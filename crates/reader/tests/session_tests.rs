//! Session manager integration tests
//!
//! Drive the connection state machine against an in-memory USB host.
//!
//! # Test Scenarios
//! - Opening a pre-approved reader and streaming its packets
//! - Topology rejection
//! - Permission prompts, denials and stale answers
//! - Detach, reset, reader loss and shutdown teardown
//! - Rescan of already attached devices
//! - A reader outliving the teardown grace period
//! - Random event sequences keeping one live link at most
//! - The session manager thread behind the channel bridge
//!
//! Run with: `cargo test -p reader --test session_tests`

mod support;

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, create_card_reader, create_device, create_endpoint,
    create_interrupt_in, create_other_device, wait_until, with_timeout,
};
use common::{DeviceLocation, SessionEvent, TransferKind, UiEvent, create_session_bridge};
use proptest::prelude::*;
use reader::session::{ConnectionState, SessionManager, SessionStatus, spawn_session_manager};
use reader::usb::DeviceLink;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use support::{CARD_READER_PID, CARD_READER_VID, Harness, MockHost, ScriptedBroker, WAIT};

fn session_id(h: &Harness) -> common::SessionId {
    match h.manager.state() {
        ConnectionState::Connected(session) => session.id(),
        _ => panic!("manager is not connected"),
    }
}

// ============================================================================
// Connecting
// ============================================================================

#[test]
fn test_pre_granted_attach_connects() {
    let mut h = Harness::new(true);
    let device = create_card_reader(1, 4);

    assert!(h.manager.handle_event(SessionEvent::Attached {
        device: device.clone()
    }));

    assert_eq!(h.manager.status(), SessionStatus::Connected);
    assert_eq!(h.manager.current_device(), Some(&device));
    assert_eq!(h.drain_ui(), vec![UiEvent::Connected { device }]);
    assert!(h.broker.requests().is_empty());

    let opened = h.host.opened();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].0, DeviceLocation::new(1, 4));
    assert_eq!(opened[0].1.address, 0x81);
    assert_eq!(opened[0].1.max_packet_size, 8);

    h.manager.shutdown();
}

#[test]
fn test_packets_reach_ui_decoded() {
    let mut h = Harness::new(true);
    h.manager.device_attached(create_card_reader(1, 4));
    h.drain_ui();

    let link = h.host.last_link();
    link.push_packet(&[0x3b, 0x31, 0xff]);
    link.push_packet(&[0x7f, 0x80]);

    assert_eq!(
        h.next_ui(),
        Some(UiEvent::DataAppended {
            text: "59 49 -1".into()
        })
    );
    assert_eq!(
        h.next_ui(),
        Some(UiEvent::DataAppended {
            text: "127 -128".into()
        })
    );

    h.manager.shutdown();
}

#[test]
fn test_non_target_device_is_ignored() {
    let mut h = Harness::new(true);

    h.manager.device_attached(create_other_device(1, 2));

    assert_eq!(h.manager.status(), SessionStatus::Disconnected);
    assert_eq!(h.host.open_count(), 0);
    assert!(h.drain_ui().is_empty());
}

#[test]
fn test_wrong_topology_is_rejected_before_permission() {
    let mut h = Harness::new(false);
    let two_endpoints = create_device(
        CARD_READER_VID,
        CARD_READER_PID,
        (1, 4),
        vec![vec![
            create_interrupt_in(8),
            create_endpoint(0x02, TransferKind::Interrupt, 8),
        ]],
    );

    h.manager.device_attached(two_endpoints);

    assert_eq!(h.manager.status(), SessionStatus::Disconnected);
    assert!(h.broker.requests().is_empty());
    assert_eq!(h.host.open_count(), 0);
    assert!(h.drain_ui().is_empty());
}

#[test]
fn test_bulk_endpoint_is_rejected() {
    let mut h = Harness::new(true);
    let bulk = create_device(
        CARD_READER_VID,
        CARD_READER_PID,
        (1, 4),
        vec![vec![create_endpoint(0x81, TransferKind::Bulk, 64)]],
    );

    h.manager.device_attached(bulk);

    assert_eq!(h.manager.status(), SessionStatus::Disconnected);
    assert_eq!(h.host.open_count(), 0);
}

#[test]
fn test_at_most_one_session() {
    let mut h = Harness::new(true);
    h.manager.device_attached(create_card_reader(1, 4));
    h.manager.device_attached(create_card_reader(1, 4));
    h.manager.device_attached(create_card_reader(2, 7));
    h.manager.rescan();

    assert_eq!(h.host.open_count(), 1);
    assert_eq!(h.manager.current_device().unwrap().location, DeviceLocation::new(1, 4));

    h.manager.shutdown();
}

#[test]
fn test_open_failure_reports_disconnected() {
    let mut h = Harness::new(true);
    h.host.fail_open(rusb::Error::Busy);

    h.manager.device_attached(create_card_reader(1, 4));

    assert_eq!(h.manager.status(), SessionStatus::Disconnected);
    assert_eq!(h.drain_ui(), vec![UiEvent::Disconnected]);
    assert!(h.manager.running_flag().is_none());
}

// ============================================================================
// Permission
// ============================================================================

#[test]
fn test_permission_prompt_then_grant() {
    let mut h = Harness::new(false);
    let device = create_card_reader(1, 4);

    h.manager.device_attached(device.clone());

    assert_eq!(h.manager.status(), SessionStatus::AwaitingPermission);
    assert_eq!(h.broker.requests(), vec![device.clone()]);
    assert_eq!(h.host.open_count(), 0);

    // Repeated attach for the same pending device does not ask twice
    h.manager.device_attached(device.clone());
    assert_eq!(h.broker.requests().len(), 1);

    h.manager.permission_result(device.clone(), true);

    assert_eq!(h.manager.status(), SessionStatus::Connected);
    assert_eq!(h.drain_ui(), vec![UiEvent::Connected { device }]);

    h.manager.shutdown();
}

#[test]
fn test_permission_denied() {
    let mut h = Harness::new(false);
    let device = create_card_reader(1, 4);

    h.manager.device_attached(device.clone());
    h.manager.permission_result(device.clone(), false);

    assert_eq!(h.manager.status(), SessionStatus::Disconnected);
    assert_eq!(h.host.open_count(), 0);
    assert_eq!(h.drain_ui(), vec![UiEvent::PermissionDenied { device }]);
}

#[test]
fn test_stale_permission_results_are_ignored() {
    let mut h = Harness::new(false);
    let pending = create_card_reader(1, 4);
    let other = create_card_reader(1, 5);

    // Nothing pending
    h.manager.permission_result(pending.clone(), true);
    assert_eq!(h.manager.status(), SessionStatus::Disconnected);
    assert_eq!(h.host.open_count(), 0);

    // Pending for a different location
    h.manager.device_attached(pending.clone());
    h.manager.permission_result(other.clone(), true);
    h.manager.permission_result(other, false);

    assert_eq!(h.manager.status(), SessionStatus::AwaitingPermission);
    assert_eq!(h.manager.current_device(), Some(&pending));
    assert_eq!(h.host.open_count(), 0);
    assert!(h.drain_ui().is_empty());
}

#[test]
fn test_detach_while_awaiting_drops_request() {
    let mut h = Harness::new(false);
    let device = create_card_reader(1, 4);

    h.manager.device_attached(device.clone());
    h.manager.device_detached(device.location);

    assert_eq!(h.manager.status(), SessionStatus::Disconnected);
    assert_eq!(h.drain_ui(), vec![UiEvent::Disconnected]);

    // The answer arrives after the device is gone
    h.manager.permission_result(device, true);
    assert_eq!(h.manager.status(), SessionStatus::Disconnected);
    assert_eq!(h.host.open_count(), 0);
}

#[test]
fn test_grant_is_remembered_until_detach() {
    let mut h = Harness::new(false);
    let device = create_card_reader(1, 4);
    h.host.set_devices(vec![device.clone()]);

    h.manager.device_attached(device.clone());
    h.manager.permission_result(device.clone(), true);
    h.manager.reset();
    assert_eq!(h.manager.status(), SessionStatus::Disconnected);

    // Same device, no second prompt
    h.manager.rescan();
    assert_eq!(h.manager.status(), SessionStatus::Connected);
    assert_eq!(h.broker.requests().len(), 1);

    // Unplugging forgets the grant
    h.manager.device_detached(device.location);
    h.manager.device_attached(device.clone());
    assert_eq!(h.manager.status(), SessionStatus::AwaitingPermission);
    assert_eq!(h.broker.requests().len(), 2);
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn test_detach_tears_down_session() {
    let mut h = Harness::new(true);
    let device = create_card_reader(1, 4);
    h.manager.device_attached(device.clone());
    h.drain_ui();

    let running = h.manager.running_flag().unwrap();
    let link = h.host.last_link();

    h.manager.device_detached(device.location);

    assert_eq!(h.manager.status(), SessionStatus::Disconnected);
    assert!(!running.load(Ordering::Acquire));
    assert!(link.is_released());

    // The reader has been joined; nothing reaches the UI after Disconnected
    link.push_packet(&[1, 2, 3]);
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert_eq!(h.drain_ui(), vec![UiEvent::Disconnected]);
    assert_eq!(link.pending_packets(), 1);
    assert!(h.event_rx.try_recv().is_err());
}

#[test]
fn test_unrelated_detach_is_ignored() {
    let mut h = Harness::new(true);
    h.manager.device_attached(create_card_reader(1, 4));
    h.drain_ui();

    h.manager.device_detached(DeviceLocation::new(3, 9));

    assert_eq!(h.manager.status(), SessionStatus::Connected);
    assert!(h.drain_ui().is_empty());

    h.manager.shutdown();
}

#[test]
fn test_reset() {
    let mut h = Harness::new(true);

    // Nothing open: no-op, no notification
    h.manager.reset();
    assert!(h.drain_ui().is_empty());

    h.manager.device_attached(create_card_reader(1, 4));
    h.drain_ui();
    let running = h.manager.running_flag().unwrap();

    assert!(h.manager.handle_event(SessionEvent::Reset));

    assert_eq!(h.manager.status(), SessionStatus::Disconnected);
    assert!(!running.load(Ordering::Acquire));
    assert_eq!(h.drain_ui(), vec![UiEvent::Disconnected]);
}

#[test]
fn test_reader_loss_tears_down() {
    let mut h = Harness::new(true);
    h.manager.device_attached(create_card_reader(1, 4));
    h.drain_ui();
    let id = session_id(&h);

    h.host.last_link().vanish();

    let event = h.next_event().expect("reader did not report loss");
    match &event {
        SessionEvent::ReaderLost { session } => assert_eq!(*session, id),
        other => panic!("unexpected event {:?}", other),
    }

    h.manager.handle_event(event);
    assert_eq!(h.manager.status(), SessionStatus::Disconnected);
    assert_eq!(h.drain_ui(), vec![UiEvent::Disconnected]);
}

#[test]
fn test_loss_of_old_session_is_ignored() {
    let mut h = Harness::new(true);
    h.host.set_devices(vec![create_card_reader(1, 4)]);
    h.manager.rescan();
    let first = session_id(&h);
    h.manager.reset();
    h.manager.rescan();
    assert_ne!(session_id(&h), first);

    h.manager.reader_lost(first);

    assert_eq!(h.manager.status(), SessionStatus::Connected);
    h.manager.shutdown();
}

#[test]
fn test_shutdown_stops_processing() {
    let mut h = Harness::new(true);
    h.manager.device_attached(create_card_reader(1, 4));
    let running = h.manager.running_flag().unwrap();

    assert!(!h.manager.handle_event(SessionEvent::Shutdown));

    assert_eq!(h.manager.status(), SessionStatus::Disconnected);
    assert!(!running.load(Ordering::Acquire));
}

#[test]
fn test_lingering_reader_blocks_next_open() {
    let mut settings = support::fast_settings();
    settings.shutdown_grace = Duration::from_millis(50);
    let mut h = Harness::with_settings(true, settings);
    let device = create_card_reader(1, 4);
    h.host.set_devices(vec![device.clone()]);
    h.host.set_read_stall(Some(Duration::from_millis(300)));

    h.manager.rescan();
    assert_eq!(h.manager.status(), SessionStatus::Connected);
    let stuck = h.host.last_link();
    assert!(wait_until(WAIT, || stuck.reads() > 0));

    // The reader sits in its read well past the grace period
    h.manager.reset();
    assert_eq!(h.manager.status(), SessionStatus::Disconnected);
    assert!(stuck.is_released());

    h.manager.rescan();
    assert_eq!(h.manager.status(), SessionStatus::Disconnected);
    assert_eq!(h.host.open_count(), 1);
    assert_eq!(
        h.drain_ui(),
        vec![
            UiEvent::Connected {
                device: device.clone()
            },
            UiEvent::Disconnected,
            UiEvent::Disconnected,
        ]
    );

    // Once the old reader has let go of its link, opening works again
    h.host.set_read_stall(None);
    assert!(wait_until(WAIT, || Arc::strong_count(&stuck) == 2));

    h.manager.rescan();
    assert_eq!(h.manager.status(), SessionStatus::Connected);
    assert_eq!(h.host.open_count(), 2);
    assert_eq!(h.drain_ui(), vec![UiEvent::Connected { device }]);

    h.manager.shutdown();
}

// ============================================================================
// Rescan
// ============================================================================

#[test]
fn test_rescan_finds_attached_reader() {
    let mut h = Harness::new(true);
    h.host
        .set_devices(vec![create_other_device(1, 2), create_card_reader(1, 4)]);

    h.manager.handle_event(SessionEvent::Rescan);

    assert_eq!(h.manager.status(), SessionStatus::Connected);
    assert_eq!(h.host.opened()[0].0, DeviceLocation::new(1, 4));

    h.manager.shutdown();
}

#[test]
fn test_rescan_without_reader() {
    let mut h = Harness::new(true);
    h.host.set_devices(vec![create_other_device(1, 2)]);

    h.manager.rescan();

    assert_eq!(h.manager.status(), SessionStatus::Disconnected);
    assert!(h.drain_ui().is_empty());
}

#[test]
fn test_rescan_while_awaiting_does_not_ask_again() {
    let mut h = Harness::new(false);
    h.host.set_devices(vec![create_card_reader(1, 4)]);

    h.manager.rescan();
    h.manager.rescan();

    assert_eq!(h.manager.status(), SessionStatus::AwaitingPermission);
    assert_eq!(h.broker.requests().len(), 1);
}

// ============================================================================
// Session manager thread
// ============================================================================

#[tokio::test]
async fn test_session_thread_end_to_end() {
    let (bridge, worker) = create_session_bridge();
    let host = MockHost::new();
    let broker = ScriptedBroker::new(false);
    let manager = SessionManager::new(
        host.clone(),
        broker.clone(),
        support::fast_settings(),
        worker.ui_tx.clone(),
        worker.event_tx.clone(),
    );
    let handle = spawn_session_manager(manager, worker).unwrap();

    let device = create_card_reader(1, 4);
    bridge
        .send_event(SessionEvent::Attached {
            device: device.clone(),
        })
        .await
        .unwrap();

    // The broker asked; answer the way the UI would
    assert!(wait_until(WAIT, || broker.requests().len() == 1));
    assert_eq!(host.open_count(), 0);
    bridge
        .send_event(SessionEvent::PermissionResult {
            device: device.clone(),
            granted: true,
        })
        .await
        .unwrap();

    let event = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_ui_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        UiEvent::Connected {
            device: device.clone()
        }
    );

    host.last_link().push_packet(&[0xff]);
    let event = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_ui_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, UiEvent::DataAppended { text: "-1".into() });

    bridge.send_event(SessionEvent::Shutdown).await.unwrap();
    let event = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_ui_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, UiEvent::Disconnected);

    tokio::task::spawn_blocking(move || handle.join())
        .await
        .unwrap()
        .expect("session thread panicked");
}

// ============================================================================
// Event sequences
// ============================================================================

#[derive(Debug, Clone)]
enum Step {
    Attach(u8),
    Detach(u8),
    Answer(u8, bool),
    Reset,
    Rescan,
}

fn address() -> impl Strategy<Value = u8> {
    prop_oneof![Just(4u8), Just(5u8)]
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        address().prop_map(Step::Attach),
        address().prop_map(Step::Detach),
        (address(), any::<bool>()).prop_map(|(a, granted)| Step::Answer(a, granted)),
        Just(Step::Reset),
        Just(Step::Rescan),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Property: Connected exactly when the newest link is live, and older links are released
    #[test]
    fn prop_event_sequences_keep_one_live_link(
        pre_granted in any::<bool>(),
        steps in proptest::collection::vec(step_strategy(), 1..20),
    ) {
        let mut h = Harness::new(pre_granted);
        let mut attached: Vec<u8> = Vec::new();

        for step in steps {
            let event = match step {
                Step::Attach(a) => {
                    if !attached.contains(&a) {
                        attached.push(a);
                    }
                    SessionEvent::Attached { device: create_card_reader(1, a) }
                }
                Step::Detach(a) => {
                    attached.retain(|x| *x != a);
                    SessionEvent::Detached { location: DeviceLocation::new(1, a) }
                }
                Step::Answer(a, granted) => SessionEvent::PermissionResult {
                    device: create_card_reader(1, a),
                    granted,
                },
                Step::Reset => SessionEvent::Reset,
                Step::Rescan => SessionEvent::Rescan,
            };
            h.host.set_devices(attached.iter().map(|a| create_card_reader(1, *a)).collect());

            prop_assert!(h.manager.handle_event(event));

            let connected = h.manager.status() == SessionStatus::Connected;
            let links = h.host.links();
            match links.split_last() {
                Some((last, earlier)) => {
                    prop_assert_eq!(connected, !last.is_released());
                    for link in earlier {
                        prop_assert!(link.is_released());
                    }
                }
                None => prop_assert!(!connected),
            }
        }

        h.manager.shutdown();
        prop_assert_eq!(h.manager.status(), SessionStatus::Disconnected);
        prop_assert!(h.host.links().iter().all(|link| link.is_released()));
    }
}
