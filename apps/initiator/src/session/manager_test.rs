//! Lifecycle scenarios for `SessionManager`, run against the in-memory backend.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use super::*;
use crate::backend::{InMemoryBackend, InMemoryDevice};
use crate::device::{DeviceHandle, StorageId};

const STORAGE: StorageId = StorageId(0x10001);

/// Records prompts without answering them.
#[derive(Default)]
struct RecordingPrompt {
    prompted: Mutex<Vec<String>>,
}

impl RecordingPrompt {
    fn count(&self) -> usize {
        self.prompted.lock().unwrap().len()
    }
}

impl PermissionPrompt for RecordingPrompt {
    fn prompt(&self, device: &DeviceHandle) {
        self.prompted.lock().unwrap().push(device.id.clone());
    }
}

struct Harness {
    manager: SessionManager<InMemoryBackend>,
    backend: InMemoryBackend,
    prompt: Arc<RecordingPrompt>,
    feed: EventFeed,
    queue: EventQueue,
    events: UnboundedReceiver<SessionEvent>,
}

impl Harness {
    fn new(options: ManagerOptions) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let backend = InMemoryBackend::new();
        let prompt = Arc::new(RecordingPrompt::default());
        let (sink, events) = ChannelSink::new();
        let (feed, queue) = event_feed();
        let manager = SessionManager::new(backend.clone(), prompt.clone(), Arc::new(sink), feed.clone())
            .with_options(options);
        Self {
            manager,
            backend,
            prompt,
            feed,
            queue,
            events,
        }
    }

    fn manual() -> Self {
        Self::new(ManagerOptions {
            auto_open: false,
            ..ManagerOptions::default()
        })
    }

    fn plug(&self, location_id: u64) -> DeviceHandle {
        let device = DeviceHandle::new(location_id, 0x18d1, 0x4ee1).with_product("Pixel 8");
        self.backend.add_device(InMemoryDevice::new(&device));
        device
    }

    /// Feeds one event, then drains everything the manager queued in response.
    async fn send(&mut self, event: DeviceEvent) {
        self.manager.handle_event(event).await;
        while let Some(next) = self.queue.try_next() {
            self.manager.handle_event(next).await;
        }
    }

    async fn attach(&mut self, device: &DeviceHandle) {
        self.send(DeviceEvent::DeviceAttached(device.clone())).await;
    }

    async fn answer(&mut self, device: &DeviceHandle, granted: bool) {
        self.send(DeviceEvent::PermissionResult {
            device_id: device.id.clone(),
            granted,
        })
        .await;
    }

    /// Attach, grant and open.
    async fn open(&mut self, device: &DeviceHandle) {
        self.attach(device).await;
        self.answer(device, true).await;
        self.manager.open_session().await.unwrap();
        assert_eq!(self.manager.state(), SessionState::Open);
    }

    fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

fn event_types(events: &[SessionEvent]) -> Vec<String> {
    events
        .iter()
        .map(|e| serde_json::to_value(e).unwrap()["type"].as_str().unwrap().to_string())
        .collect()
}

// ========================================================================
// Attach and permission
// ========================================================================

#[tokio::test]
async fn test_attach_requests_permission_automatically() {
    let mut h = Harness::manual();
    let device = h.plug(1);

    h.attach(&device).await;

    assert_eq!(h.manager.state(), SessionState::PermissionPending);
    assert_eq!(h.prompt.count(), 1);
    assert_eq!(h.manager.current_device(), Some(&device));
    assert_eq!(
        event_types(&h.drain_events()),
        vec!["attached", "permissionRequested"]
    );
}

#[tokio::test]
async fn test_attach_without_auto_request_waits_in_attached() {
    let mut h = Harness::new(ManagerOptions {
        auto_request_permission: false,
        auto_open: false,
        ..ManagerOptions::default()
    });
    let device = h.plug(1);

    h.attach(&device).await;
    assert_eq!(h.manager.state(), SessionState::Attached);
    assert_eq!(h.prompt.count(), 0);

    h.manager.request_permission().unwrap();
    assert_eq!(h.manager.state(), SessionState::PermissionPending);
    assert_eq!(h.prompt.count(), 1);
}

#[tokio::test]
async fn test_grant_moves_to_authorized() {
    let mut h = Harness::manual();
    let device = h.plug(1);
    h.attach(&device).await;

    h.answer(&device, true).await;

    assert_eq!(h.manager.state(), SessionState::Authorized);
    assert_eq!(h.manager.permission_state(), PermissionState::Granted);
    assert_eq!(
        h.drain_events().last(),
        Some(&SessionEvent::PermissionGranted {
            device_id: device.id.clone()
        })
    );
}

#[tokio::test]
async fn test_denial_returns_to_attached_without_permission() {
    let mut h = Harness::manual();
    let device = h.plug(1);
    h.attach(&device).await;

    h.answer(&device, false).await;

    assert_eq!(h.manager.state(), SessionState::Attached);
    assert_eq!(h.manager.permission_state(), PermissionState::Denied);
    assert!(
        h.drain_events().contains(&SessionEvent::PermissionDenied {
            device_id: device.id.clone()
        })
    );
    // Denial is not retried automatically
    assert_eq!(h.prompt.count(), 1);
}

#[tokio::test]
async fn test_explicit_request_after_denial_prompts_again() {
    let mut h = Harness::manual();
    let device = h.plug(1);
    h.attach(&device).await;
    h.answer(&device, false).await;

    h.manager.request_permission().unwrap();

    assert_eq!(h.manager.state(), SessionState::PermissionPending);
    assert_eq!(h.prompt.count(), 2);
}

#[tokio::test]
async fn test_repeated_requests_do_not_prompt_twice() {
    let mut h = Harness::manual();
    let device = h.plug(1);
    h.attach(&device).await;

    h.manager.request_permission().unwrap();
    h.manager.request_permission().unwrap();
    assert_eq!(h.prompt.count(), 1);

    h.answer(&device, true).await;
    h.manager.request_permission().unwrap();
    assert_eq!(h.prompt.count(), 1);
    assert_eq!(h.manager.state(), SessionState::Authorized);
}

#[tokio::test]
async fn test_result_outside_pending_is_ignored() {
    let mut h = Harness::new(ManagerOptions {
        auto_request_permission: false,
        auto_open: false,
        ..ManagerOptions::default()
    });
    let device = h.plug(1);
    h.attach(&device).await;

    // Nothing was requested
    h.answer(&device, true).await;
    assert_eq!(h.manager.state(), SessionState::Attached);
    assert_eq!(h.manager.permission_state(), PermissionState::Unrequested);

    // Duplicate answer after the first one
    h.manager.request_permission().unwrap();
    h.answer(&device, false).await;
    h.answer(&device, true).await;
    assert_eq!(h.manager.state(), SessionState::Attached);
    assert_eq!(h.manager.permission_state(), PermissionState::Denied);
}

#[tokio::test]
async fn test_duplicate_and_second_device_attach_are_ignored() {
    let mut h = Harness::manual();
    let first = h.plug(1);
    let second = h.plug(2);
    h.attach(&first).await;
    h.drain_events();

    h.attach(&first).await;
    h.attach(&second).await;

    assert_eq!(h.manager.current_device(), Some(&first));
    assert_eq!(h.manager.state(), SessionState::PermissionPending);
    assert_eq!(h.prompt.count(), 1);
    assert!(h.drain_events().is_empty());
}

// ========================================================================
// Open
// ========================================================================

#[tokio::test]
async fn test_open_requires_permission() {
    let mut h = Harness::manual();
    let device = h.plug(1);
    h.attach(&device).await;

    let err = h.manager.open_session().await.unwrap_err();
    assert_eq!(
        err,
        SessionError::PermissionDenied {
            device_id: device.id.clone()
        }
    );
    assert_eq!(h.manager.state(), SessionState::PermissionPending);
    assert_eq!(h.backend.channels_opened(), 0);

    h.answer(&device, false).await;
    assert!(h.manager.open_session().await.is_err());
    assert_eq!(h.backend.channels_opened(), 0);
}

#[tokio::test]
async fn test_open_without_device() {
    let mut h = Harness::manual();
    assert_eq!(h.manager.open_session().await.unwrap_err(), SessionError::NoDevice);
    assert_eq!(h.manager.object_store().err(), Some(SessionError::NoDevice));
}

#[tokio::test]
async fn test_open_enumerates_storages() {
    let mut h = Harness::manual();
    let device = h.plug(1);
    h.attach(&device).await;
    h.answer(&device, true).await;
    h.drain_events();

    let storages = h.manager.open_session().await.unwrap();

    assert_eq!(storages.len(), 1);
    assert_eq!(storages[0].id, STORAGE);
    assert_eq!(h.manager.state(), SessionState::Open);
    assert!(h.manager.slot().current().is_some());
    match h.drain_events().as_slice() {
        [SessionEvent::SessionOpened { device_id, storages, .. }] => {
            assert_eq!(device_id, &device.id);
            assert_eq!(storages.len(), 1);
        }
        other => panic!("unexpected events: {:?}", other),
    }
}

#[tokio::test]
async fn test_grant_opens_automatically() {
    let mut h = Harness::new(ManagerOptions::default());
    let device = h.plug(1);

    h.attach(&device).await;
    h.answer(&device, true).await;

    assert_eq!(h.manager.state(), SessionState::Open);
    assert_eq!(
        event_types(&h.drain_events()),
        vec![
            "attached",
            "permissionRequested",
            "permissionGranted",
            "sessionOpened"
        ]
    );
}

#[tokio::test]
async fn test_open_is_idempotent() {
    let mut h = Harness::manual();
    let device = h.plug(1);
    h.open(&device).await;

    let storages = h.manager.open_session().await.unwrap();
    assert_eq!(storages.len(), 1);
    assert_eq!(h.backend.sessions_opened(), 1);
}

#[tokio::test]
async fn test_open_failure_stages_stay_authorized() {
    let mut h = Harness::manual();
    let device = h.plug(1);
    h.attach(&device).await;
    h.answer(&device, true).await;
    h.drain_events();

    let cases = [
        (OpenStage::Channel, "channelOpenFailed"),
        (OpenStage::Protocol, "sessionOpenFailed"),
        (OpenStage::Storage, "sessionOpenFailed"),
    ];
    for (stage, error_type) in cases {
        h.backend.fail_channel_open(&device.id, stage == OpenStage::Channel);
        h.backend.fail_session_open(&device.id, stage == OpenStage::Protocol);
        h.backend.fail_storage_enumeration(&device.id, stage == OpenStage::Storage);

        let err = h.manager.open_session().await.unwrap_err();
        assert!(err.is_retryable(), "{:?}", err);
        assert_eq!(h.manager.state(), SessionState::Authorized);
        assert!(h.manager.slot().current().is_none());

        match h.drain_events().as_slice() {
            [SessionEvent::SessionOpenFailed { stage: got, error, .. }] => {
                assert_eq!(*got, stage);
                assert_eq!(serde_json::to_value(error).unwrap()["type"], error_type);
            }
            other => panic!("unexpected events for {:?}: {:?}", stage, other),
        }
    }

    // Protocol and storage failures each released what they had acquired
    assert_eq!(h.backend.releases(), 2);

    // A later retry succeeds
    h.backend.fail_storage_enumeration(&device.id, false);
    h.manager.open_session().await.unwrap();
    assert_eq!(h.manager.state(), SessionState::Open);
}

#[tokio::test]
async fn test_open_reports_device_info() {
    let mut h = Harness::manual();
    let device = DeviceHandle::new(2, 0x18d1, 0x4ee1);
    h.backend.add_device(InMemoryDevice::new(&device).with_info("Google", "Pixel 8", "1A2B3C"));
    h.attach(&device).await;
    h.answer(&device, true).await;
    h.drain_events();

    h.manager.open_session().await.unwrap();

    let current = h.manager.current_device().unwrap();
    assert_eq!(current.display_name(), "Pixel 8");
    assert_eq!(current.manufacturer.as_deref(), Some("Google"));
    assert_eq!(current.serial_number.as_deref(), Some("1A2B3C"));
    match h.drain_events().as_slice() {
        [SessionEvent::SessionOpened { device_info, .. }] => {
            assert_eq!(device_info.model.as_deref(), Some("Pixel 8"));
            assert_eq!(device_info.manufacturer.as_deref(), Some("Google"));
        }
        other => panic!("unexpected events: {:?}", other),
    }
}

fn short_timeouts() -> ManagerOptions {
    ManagerOptions {
        auto_open: false,
        open_timeout: Duration::from_millis(50),
        transfer_timeout: Duration::from_millis(50),
        ..ManagerOptions::default()
    }
}

#[tokio::test]
async fn test_hung_channel_open_times_out() {
    let mut h = Harness::new(short_timeouts());
    let device = h.plug(1);
    h.attach(&device).await;
    h.answer(&device, true).await;
    h.drain_events();
    h.backend.hang_channel_open(&device.id, true);

    let err = h.manager.open_session().await.unwrap_err();

    assert!(matches!(err, SessionError::ChannelOpenFailed { .. }), "{:?}", err);
    assert!(err.is_retryable());
    assert_eq!(h.manager.state(), SessionState::Authorized);
    assert!(h.manager.slot().current().is_none());
    match h.drain_events().as_slice() {
        [SessionEvent::SessionOpenFailed { stage, .. }] => assert_eq!(*stage, OpenStage::Channel),
        other => panic!("unexpected events: {:?}", other),
    }
    assert_eq!(h.backend.channels_opened(), 0);

    h.backend.hang_channel_open(&device.id, false);
    h.manager.open_session().await.unwrap();
    assert_eq!(h.manager.state(), SessionState::Open);
}

#[tokio::test]
async fn test_hung_close_after_storage_failure_still_fails_open() {
    let mut h = Harness::new(short_timeouts());
    let device = h.plug(1);
    h.attach(&device).await;
    h.answer(&device, true).await;
    h.drain_events();
    h.backend.fail_storage_enumeration(&device.id, true);
    h.backend.hang_close(&device.id, true);

    let err = h.manager.open_session().await.unwrap_err();

    assert!(matches!(err, SessionError::SessionOpenFailed { .. }), "{:?}", err);
    assert_eq!(h.manager.state(), SessionState::Authorized);
    match h.drain_events().as_slice() {
        [SessionEvent::SessionOpenFailed { stage, .. }] => assert_eq!(*stage, OpenStage::Storage),
        other => panic!("unexpected events: {:?}", other),
    }
    // Abandoning the close dropped the session, which released it
    assert_eq!(h.backend.releases(), 1);
}

#[tokio::test]
async fn test_open_with_no_storage_reports_no_storage_on_use() {
    let mut h = Harness::manual();
    let device = DeviceHandle::new(1, 0x18d1, 0x4ee1);
    h.backend.add_device(InMemoryDevice::new(&device).without_storage());
    h.open(&device).await;

    let store = h.manager.object_store().unwrap();
    assert!(store.storages().is_empty());
    assert!(matches!(store.default_storage(), Err(SessionError::NoStorage { .. })));
}

// ========================================================================
// Transfers
// ========================================================================

#[tokio::test]
async fn test_write_then_read_round_trip() {
    let mut h = Harness::manual();
    let device = h.plug(1);
    h.open(&device).await;

    let store = h.manager.object_store().unwrap();
    let storage = store.default_storage().unwrap().id;
    let object = store
        .write_object(storage, "mtp-initiator-test.txt", b"This test content.", None)
        .await
        .unwrap();

    let listed = store
        .list_objects(storage, Some("MTP-INITIATOR"))
        .collect()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].object_ref(), object);

    assert_eq!(store.read_object(object).await.unwrap(), b"This test content.");
}

#[tokio::test]
async fn test_transfers_rejected_unless_open() {
    let mut h = Harness::manual();
    let device = h.plug(1);
    h.attach(&device).await;
    h.answer(&device, true).await;

    assert_eq!(
        h.manager.object_store().err(),
        Some(SessionError::NotOpen {
            device_id: device.id.clone()
        })
    );
}

#[tokio::test]
async fn test_write_rejection_keeps_session_open() {
    let mut h = Harness::manual();
    let device = h.plug(1);
    h.open(&device).await;
    h.backend.reject_writes(&device.id, true);

    let store = h.manager.object_store().unwrap();
    let err = store.write_object(STORAGE, "a.txt", b"a", None).await.unwrap_err();

    assert!(matches!(err, SessionError::WriteRejected { .. }));
    assert_eq!(h.manager.state(), SessionState::Open);
    assert!(store.is_open().await);
}

#[tokio::test]
async fn test_hung_transfer_times_out_and_stays_open() {
    let mut h = Harness::new(short_timeouts());
    let device = h.plug(1);
    h.open(&device).await;
    h.drain_events();
    h.backend.hang_transfers(&device.id, true);

    let store = h.manager.object_store().unwrap();
    let err = store.write_object(STORAGE, "a.txt", b"a", None).await.unwrap_err();

    assert_eq!(
        err,
        SessionError::Timeout {
            device_id: device.id.clone()
        }
    );
    assert_eq!(event_types(&h.drain_events()), vec!["transferFailed"]);
    assert_eq!(h.queue.try_next(), None);
    assert_eq!(h.manager.state(), SessionState::Open);
    assert!(store.is_open().await);
}

// ========================================================================
// Close and detach
// ========================================================================

#[tokio::test]
async fn test_close_releases_and_is_terminal() {
    let mut h = Harness::manual();
    let device = h.plug(1);
    h.open(&device).await;
    let store = h.manager.object_store().unwrap();
    let object = store.write_object(STORAGE, "a.txt", b"a", None).await.unwrap();
    h.drain_events();

    h.send(DeviceEvent::CloseRequested(device.id.clone())).await;

    assert_eq!(h.manager.state(), SessionState::Closed);
    assert_eq!(h.backend.releases(), 1);
    assert_eq!(
        h.drain_events(),
        vec![SessionEvent::SessionClosed {
            device_id: device.id.clone()
        }]
    );

    // Handles from the closed session are stale
    assert!(matches!(
        store.read_object(object).await,
        Err(SessionError::ObjectNotFound { .. })
    ));
    // Reopening needs a fresh attach
    assert!(h.manager.open_session().await.is_err());
    assert!(h.manager.close_session().await.is_err());
    assert_eq!(h.backend.sessions_opened(), 1);
}

#[tokio::test]
async fn test_detach_from_every_state_releases_once() {
    let steps: [(&str, usize); 5] = [
        ("attached", 0),
        ("pending", 0),
        ("authorized", 0),
        ("open", 1),
        ("closed", 1),
    ];
    for (stop_at, expected_releases) in steps {
        let mut h = Harness::new(ManagerOptions {
            auto_request_permission: stop_at != "attached",
            auto_open: false,
            ..ManagerOptions::default()
        });
        let device = h.plug(1);
        h.attach(&device).await;
        if stop_at != "attached" && stop_at != "pending" {
            h.answer(&device, true).await;
        }
        if stop_at == "open" || stop_at == "closed" {
            h.manager.open_session().await.unwrap();
        }
        if stop_at == "closed" {
            h.manager.close_session().await.unwrap();
        }
        h.drain_events();

        h.send(DeviceEvent::DeviceDetached(device.id.clone())).await;
        h.send(DeviceEvent::DeviceDetached(device.id.clone())).await;

        assert_eq!(h.manager.state(), SessionState::Detached, "from {}", stop_at);
        assert_eq!(h.manager.current_device(), None);
        assert_eq!(h.backend.releases(), expected_releases, "from {}", stop_at);
        assert_eq!(
            h.drain_events(),
            vec![SessionEvent::Detached {
                device_id: device.id.clone(),
                reason: DetachReason::Unplugged
            }],
            "from {}",
            stop_at
        );
    }
}

#[tokio::test]
async fn test_permission_does_not_survive_reattach() {
    let mut h = Harness::manual();
    let device = h.plug(1);
    h.attach(&device).await;
    h.answer(&device, true).await;

    h.send(DeviceEvent::DeviceDetached(device.id.clone())).await;
    h.attach(&device).await;

    assert_eq!(h.manager.state(), SessionState::PermissionPending);
    assert_eq!(h.manager.permission_state(), PermissionState::Pending);
    assert_eq!(h.prompt.count(), 2);
}

#[tokio::test]
async fn test_detach_of_other_device_is_ignored() {
    let mut h = Harness::manual();
    let device = h.plug(1);
    h.open(&device).await;

    h.send(DeviceEvent::DeviceDetached("mtp-999".to_string())).await;

    assert_eq!(h.manager.state(), SessionState::Open);
    assert_eq!(h.backend.releases(), 0);
}

#[tokio::test]
async fn test_channel_lost_during_transfer_detaches() {
    let mut h = Harness::manual();
    let device = h.plug(1);
    h.open(&device).await;
    let store = h.manager.object_store().unwrap();
    h.drain_events();

    h.backend.remove_device(&device.id);
    let err = store.write_object(STORAGE, "a.txt", b"a", None).await.unwrap_err();
    assert!(matches!(err, SessionError::Disconnected { .. }));

    // The store queued ChannelLost; let the manager see it
    while let Some(event) = h.queue.try_next() {
        h.manager.handle_event(event).await;
    }

    assert_eq!(h.manager.state(), SessionState::Detached);
    assert_eq!(h.backend.releases(), 1);
    let events = h.drain_events();
    assert_eq!(
        event_types(&events),
        vec!["transferFailed", "detached"]
    );
    assert_eq!(
        events[1],
        SessionEvent::Detached {
            device_id: device.id.clone(),
            reason: DetachReason::ChannelLost
        }
    );

    // The OS detach that follows is a no-op
    h.send(DeviceEvent::DeviceDetached(device.id.clone())).await;
    assert_eq!(h.backend.releases(), 1);
}

#[tokio::test]
async fn test_channel_lost_outside_open_is_ignored() {
    let mut h = Harness::manual();
    let device = h.plug(1);
    h.attach(&device).await;

    h.send(DeviceEvent::ChannelLost(device.id.clone())).await;

    assert_eq!(h.manager.state(), SessionState::PermissionPending);
}

// ========================================================================
// Run loop
// ========================================================================

#[tokio::test]
async fn test_run_processes_queue_in_order() {
    let mut h = Harness::new(ManagerOptions::default());
    let device = h.plug(1);

    h.feed.attached(device.clone());
    h.feed.permission_result(&device.id, true);

    // The manager holds a feed itself, so the queue never ends on its own
    let _ = tokio::time::timeout(Duration::from_millis(200), h.manager.run(&mut h.queue)).await;
    assert_eq!(h.manager.state(), SessionState::Open);

    h.manager.shutdown().await;
    assert_eq!(h.manager.state(), SessionState::Detached);
    assert_eq!(h.backend.releases(), 1);
    assert!(h.manager.slot().current().is_none());
}
