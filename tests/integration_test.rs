//! Integration tests for the full connection flow over the simulated radio.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use bluechat::bluetooth::constants::SERVICE_UUID;
use bluechat::bluetooth::{Authorization, Radio, RadioSocket, SimNetwork, SimRadio};
use bluechat::{
    Config, ConnectionOutcome, ConnectionStatus, Controller, ControllerError, ControllerState,
    Message, Peer,
};

const PHONE_A: &str = "AA:BB:CC:DD:EE:01";
const PHONE_B: &str = "AA:BB:CC:DD:EE:02";

async fn controller_on(radio: &Arc<SimRadio>, config: Config) -> Controller {
    Controller::new(Arc::clone(radio) as Arc<dyn Radio>, config).await
}

async fn wait_until(controller: &Controller, check: impl FnMut(&ControllerState) -> bool) {
    let mut rx = controller.subscribe();
    tokio::time::timeout(Duration::from_secs(60), rx.wait_for(check))
        .await
        .expect("state condition not reached")
        .unwrap();
}

async fn wait_listening(radio: &SimRadio) {
    for _ in 0..100 {
        if radio.is_listening(SERVICE_UUID) {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("listener never registered");
}

async fn next_error(errors: &mut broadcast::Receiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(60), errors.recv())
        .await
        .expect("no error emitted")
        .unwrap()
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_connect_to_unreachable_device_fails_once() {
    let network = SimNetwork::new();
    let radio = network.create_radio("Phone-A", PHONE_A);
    let controller = controller_on(&radio, Config::default()).await;
    let mut errors = controller.errors();

    let attempt = controller
        .connect_to_device(&Peer::new(None, "AA:BB:CC:DD:EE:99"))
        .await;
    let outcomes: Vec<ConnectionOutcome> = attempt.into_stream().collect().await;

    assert_eq!(outcomes, vec![ConnectionOutcome::Failed]);
    assert_eq!(
        next_error(&mut errors).await,
        ControllerError::ConnectFailed.to_string()
    );
    let state = controller.state();
    assert!(!state.connected);
    assert_eq!(state.status, ConnectionStatus::Disconnected);
    assert!(!controller.has_open_endpoints());
}

#[tokio::test]
async fn test_server_receives_message_from_peer() {
    let network = SimNetwork::new();
    let server_radio = network.create_radio("Phone-A", PHONE_A);
    let client_radio = network.create_radio("Phone-B", PHONE_B);
    let server = controller_on(&server_radio, Config::default()).await;

    let mut serving = server.start_bluetooth_server().await;
    wait_listening(&server_radio).await;
    assert_eq!(server.state().status, ConnectionStatus::Listening);

    let socket = client_radio.dial(PHONE_A, SERVICE_UUID).await.unwrap();
    socket.write(b"Phone-B^hi there").await.unwrap();

    assert_eq!(serving.next().await, Some(ConnectionOutcome::Established));
    assert_eq!(
        serving.next().await,
        Some(ConnectionOutcome::MessageReceived(Message::new(
            "Phone-B", "hi there", false
        )))
    );

    let state = server.state();
    assert!(state.connected);
    assert_eq!(state.status, ConnectionStatus::Connected);
    assert_eq!(state.session_peer.as_ref().map(Peer::address), Some(PHONE_B));
    assert_eq!(state.messages.len(), 1);
    // The listening endpoint is closed once a peer is accepted.
    assert!(!server_radio.is_listening(SERVICE_UUID));
}

#[tokio::test]
async fn test_discovery_with_radio_disabled_changes_nothing() {
    let network = SimNetwork::new();
    let radio = network.create_radio("Phone-A", PHONE_A);
    network.create_radio("Phone-B", PHONE_B);
    radio.set_enabled(false);

    let controller = controller_on(&radio, Config::default()).await;
    let before = controller.state();
    let mut errors = controller.errors();

    controller.start_device_discovery().await;

    assert_eq!(
        errors.try_recv().unwrap(),
        ControllerError::RadioDisabled.to_string()
    );
    assert!(matches!(
        errors.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    assert_eq!(controller.state(), before);
    assert_eq!(radio.discovery_starts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_discovery_countdown_and_cancel() {
    let network = SimNetwork::new();
    let radio = network.create_radio("Phone-A", PHONE_A);
    let controller = controller_on(&radio, Config::default()).await;

    controller.start_device_discovery().await;
    assert_eq!(controller.state().discovery_remaining_secs, Some(12));
    assert!(radio.is_discovering());

    tokio::time::advance(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(controller.state().discovery_remaining_secs, Some(11));

    controller.stop_device_discovery().await;
    assert_eq!(controller.state().discovery_remaining_secs, None);
    assert!(!radio.is_discovering());

    tokio::time::advance(Duration::from_secs(5)).await;
    settle().await;
    assert_eq!(controller.state().discovery_remaining_secs, None);
    assert_eq!(controller.state().status, ConnectionStatus::Idle);

    // Stopping again is harmless.
    controller.stop_device_discovery().await;
    assert_eq!(controller.state().discovery_remaining_secs, None);
}

#[tokio::test]
async fn test_discovered_peers_are_deduplicated() {
    let network = SimNetwork::new();
    let radio = network.create_radio("Phone-A", PHONE_A);
    network.create_radio("Phone-B", PHONE_B);
    let controller = controller_on(&radio, Config::default()).await;

    controller.start_device_discovery().await;
    wait_until(&controller, |state| !state.discovered_peers().is_empty()).await;

    radio.announce(Peer::named("Renamed", PHONE_B));
    radio.announce(Peer::new(None, "aa:bb:cc:dd:ee:02"));
    radio.announce(Peer::named("Phone-C", "AA:BB:CC:DD:EE:03"));
    wait_until(&controller, |state| state.discovered_peers().len() == 2).await;
    settle().await;

    let discovered = controller.discovered_peers();
    assert_eq!(discovered.len(), 2);
    assert_eq!(discovered[0].name(), Some("Phone-B"));
    assert_eq!(discovered[1].address(), "AA:BB:CC:DD:EE:03");
}

#[tokio::test]
async fn test_new_discovery_cycle_clears_discovered_and_refreshes_bonded() {
    let network = SimNetwork::new();
    let radio = network.create_radio("Phone-A", PHONE_A);
    let controller = controller_on(&radio, Config::default()).await;

    radio.announce(Peer::named("Phone-C", "AA:BB:CC:DD:EE:03"));
    wait_until(&controller, |state| state.discovered_peers().len() == 1).await;

    radio.set_bonded(vec![Peer::named("Phone-B", PHONE_B)]);
    controller.start_device_discovery().await;

    let state = controller.state();
    assert!(state.discovered_peers().is_empty());
    assert_eq!(state.bonded_peers(), &[Peer::named("Phone-B", PHONE_B)]);
}

#[tokio::test]
async fn test_server_start_tears_down_active_client() {
    let network = SimNetwork::new();
    let radio_a = network.create_radio("Phone-A", PHONE_A);
    let radio_b = network.create_radio("Phone-B", PHONE_B);
    let phone_a = controller_on(&radio_a, Config::default()).await;
    let phone_b = controller_on(&radio_b, Config::default()).await;

    let mut serving = phone_b.start_bluetooth_server().await;
    wait_listening(&radio_b).await;
    let mut dialing = phone_a.connect_to_device(radio_b.identity()).await;
    assert_eq!(dialing.next().await, Some(ConnectionOutcome::Established));
    assert_eq!(serving.next().await, Some(ConnectionOutcome::Established));
    assert!(phone_a.state().connected);

    let _listening = phone_a.start_bluetooth_server().await;

    // The previous client transport is gone before the new listen starts.
    assert_eq!(dialing.next().await, None);
    assert_eq!(serving.next().await, Some(ConnectionOutcome::Failed));
    wait_listening(&radio_a).await;

    let state = phone_a.state();
    assert!(!state.connected);
    assert!(state.session_peer.is_none());
    assert_eq!(state.status, ConnectionStatus::Listening);
}

#[tokio::test]
async fn test_disconnect_clears_connection() {
    let network = SimNetwork::new();
    let radio_a = network.create_radio("Phone-A", PHONE_A);
    let radio_b = network.create_radio("Phone-B", PHONE_B);
    let phone_a = controller_on(&radio_a, Config::default()).await;
    let phone_b = controller_on(&radio_b, Config::default()).await;

    let mut serving = phone_a.start_bluetooth_server().await;
    wait_listening(&radio_a).await;
    let dialing = phone_b.connect_to_device(radio_a.identity()).await;
    assert_eq!(serving.next().await, Some(ConnectionOutcome::Established));

    phone_a.disconnect_from_device().await;

    let state = phone_a.state();
    assert!(!state.connected);
    assert!(state.messages.is_empty());
    assert_eq!(state.status, ConnectionStatus::Disconnected);
    assert!(!phone_a.has_open_endpoints());

    // Dropping the handle on the other side tears it down too.
    drop(dialing);
    wait_until(&phone_b, |state| !state.connected).await;
    settle().await;
    assert!(!phone_b.has_open_endpoints());
}

#[tokio::test]
async fn test_cancelled_listen_closes_endpoint() {
    let network = SimNetwork::new();
    let radio = network.create_radio("Phone-A", PHONE_A);
    let controller = controller_on(&radio, Config::default()).await;

    let serving = controller.start_bluetooth_server().await;
    wait_listening(&radio).await;
    assert!(controller.has_open_endpoints());

    serving.cancel().await;

    assert!(!controller.has_open_endpoints());
    assert!(!radio.is_listening(SERVICE_UUID));
    assert_eq!(controller.state().status, ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_two_controllers_chat() {
    let network = SimNetwork::new();
    let radio_a = network.create_radio("Phone-A", PHONE_A);
    let radio_b = network.create_radio("Phone-B", PHONE_B);
    let phone_a = controller_on(&radio_a, Config::default()).await;
    let phone_b = controller_on(&radio_b, Config::default()).await;

    let mut serving = phone_a.start_bluetooth_server().await;
    wait_listening(&radio_a).await;
    let mut dialing = phone_b.connect_to_device(radio_a.identity()).await;
    assert_eq!(serving.next().await, Some(ConnectionOutcome::Established));
    assert_eq!(dialing.next().await, Some(ConnectionOutcome::Established));

    phone_b.send_message("ping").await.unwrap();
    assert_eq!(
        serving.next().await,
        Some(ConnectionOutcome::MessageReceived(Message::new(
            "Phone-B", "ping", false
        )))
    );

    phone_a.send_message("pong").await.unwrap();
    assert_eq!(
        dialing.next().await,
        Some(ConnectionOutcome::MessageReceived(Message::new(
            "Phone-A", "pong", false
        )))
    );

    let transcript = phone_a.state().messages;
    assert_eq!(transcript.len(), 2);
    assert!(!transcript[0].is_from_current_user);
    assert!(transcript[1].is_from_current_user);
}

#[tokio::test]
async fn test_text_with_separator_is_refused_and_session_survives() {
    let network = SimNetwork::new();
    let radio_a = network.create_radio("Phone-A", PHONE_A);
    let radio_b = network.create_radio("Phone-B", PHONE_B);
    let phone_a = controller_on(&radio_a, Config::default()).await;
    let phone_b = controller_on(&radio_b, Config::default()).await;
    let mut errors = phone_b.errors();

    let mut serving = phone_a.start_bluetooth_server().await;
    wait_listening(&radio_a).await;
    let mut dialing = phone_b.connect_to_device(radio_a.identity()).await;
    assert_eq!(serving.next().await, Some(ConnectionOutcome::Established));
    assert_eq!(dialing.next().await, Some(ConnectionOutcome::Established));

    assert!(phone_b.send_message("2^3 = 8").await.is_none());
    assert_eq!(
        next_error(&mut errors).await,
        ControllerError::SendFailed.to_string()
    );
    assert!(phone_b.state().connected);
    assert!(phone_b.state().messages.is_empty());

    phone_b.send_message("eight").await.unwrap();
    assert_eq!(
        serving.next().await,
        Some(ConnectionOutcome::MessageReceived(Message::new(
            "Phone-B", "eight", false
        )))
    );
    assert!(phone_a.state().connected);
}

#[tokio::test]
async fn test_send_to_vanished_peer_reports_failure() {
    let network = SimNetwork::new();
    let server_radio = network.create_radio("Phone-A", PHONE_A);
    let client_radio = network.create_radio("Phone-B", PHONE_B);
    let server = controller_on(&server_radio, Config::default()).await;
    let mut errors = server.errors();

    let mut serving = server.start_bluetooth_server().await;
    wait_listening(&server_radio).await;
    let socket = client_radio.dial(PHONE_A, SERVICE_UUID).await.unwrap();
    assert_eq!(serving.next().await, Some(ConnectionOutcome::Established));

    // The write happens before the session reader notices the peer is gone.
    drop(socket);
    assert!(server.send_message("anyone there?").await.is_none());

    assert_eq!(
        next_error(&mut errors).await,
        ControllerError::SendFailed.to_string()
    );
    assert!(server.state().messages.is_empty());
}

#[tokio::test]
async fn test_malformed_frame_ends_session() {
    let network = SimNetwork::new();
    let server_radio = network.create_radio("Phone-A", PHONE_A);
    let client_radio = network.create_radio("Phone-B", PHONE_B);
    let server = controller_on(&server_radio, Config::default()).await;
    let mut errors = server.errors();

    let serving = server.start_bluetooth_server().await;
    wait_listening(&server_radio).await;
    let socket = client_radio.dial(PHONE_A, SERVICE_UUID).await.unwrap();
    socket.write(b"no separator here").await.unwrap();

    let outcomes: Vec<ConnectionOutcome> = serving.into_stream().collect().await;
    assert_eq!(
        outcomes,
        vec![ConnectionOutcome::Established, ConnectionOutcome::Failed]
    );
    assert_eq!(
        next_error(&mut errors).await,
        ControllerError::MalformedFrame.to_string()
    );
    assert!(!server.state().connected);
}

#[tokio::test(start_paused = true)]
async fn test_accept_timeout_fails_attempt() {
    let network = SimNetwork::new();
    let radio = network.create_radio("Phone-A", PHONE_A);
    let mut config = Config::default();
    config.bluetooth.accept_timeout_secs = 5;
    let controller = controller_on(&radio, config).await;
    let mut errors = controller.errors();

    let serving = controller.start_bluetooth_server().await;
    let outcomes: Vec<ConnectionOutcome> = serving.into_stream().collect().await;

    assert_eq!(outcomes, vec![ConnectionOutcome::Failed]);
    assert_eq!(
        next_error(&mut errors).await,
        ControllerError::AcceptTimeout.to_string()
    );
    assert!(!radio.is_listening(SERVICE_UUID));
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_fails_attempt() {
    let network = SimNetwork::new();
    let radio_a = network.create_radio("Phone-A", PHONE_A);
    network.create_radio("Phone-B", PHONE_B);
    radio_a.set_dial_latency(Duration::from_secs(120));
    let controller = controller_on(&radio_a, Config::default()).await;
    let mut errors = controller.errors();

    let attempt = controller
        .connect_to_device(&Peer::named("Phone-B", PHONE_B))
        .await;
    let outcomes: Vec<ConnectionOutcome> = attempt.into_stream().collect().await;

    assert_eq!(outcomes, vec![ConnectionOutcome::Failed]);
    assert_eq!(
        next_error(&mut errors).await,
        ControllerError::ConnectTimeout.to_string()
    );
}

#[tokio::test]
async fn test_connect_without_authorization_is_a_no_op() {
    let network = SimNetwork::new();
    let radio = network.create_radio("Phone-A", PHONE_A);
    radio.set_authorized(Authorization::Connect, false);
    let controller = controller_on(&radio, Config::default()).await;
    let mut errors = controller.errors();

    let mut attempt = controller.start_bluetooth_server().await;

    assert_eq!(attempt.next().await, None);
    assert_eq!(
        errors.try_recv().unwrap(),
        ControllerError::Unauthorized.to_string()
    );
    assert!(!radio.is_listening(SERVICE_UUID));
    assert_eq!(controller.state().status, ConnectionStatus::Idle);
}

#[tokio::test]
async fn test_release_stops_everything() {
    let network = SimNetwork::new();
    let radio_a = network.create_radio("Phone-A", PHONE_A);
    let radio_b = network.create_radio("Phone-B", PHONE_B);
    let phone_a = controller_on(&radio_a, Config::default()).await;
    let phone_b = controller_on(&radio_b, Config::default()).await;

    phone_a.start_device_discovery().await;
    let _serving = phone_b.start_bluetooth_server().await;
    wait_listening(&radio_b).await;
    let _dialing = phone_a.connect_to_device(radio_b.identity()).await;
    wait_until(&phone_a, |state| state.connected).await;

    phone_a.release().await;

    let state = phone_a.state();
    assert!(!state.connected);
    assert!(state.discovery_remaining_secs.is_none());
    assert!(!phone_a.has_open_endpoints());
    assert!(!radio_a.is_discovering());

    // Subscriptions are cancelled: new events are not recorded.
    radio_a.announce(Peer::named("Phone-C", "AA:BB:CC:DD:EE:03"));
    settle().await;
    assert!(phone_a
        .discovered_peers()
        .iter()
        .all(|peer| peer.address() != "AA:BB:CC:DD:EE:03"));

    assert!(phone_a.send_message("after release").await.is_none());
}
