mod common;

use std::sync::Arc;
use std::time::Duration;

use ble_central_lib::config::{ConnectionConfig, GattConfig, ScanConfig};
use ble_central_lib::core::bluetooth::att::{AttPdu, GroupEntry};
use ble_central_lib::core::bluetooth::constants::{att_errors, opcodes};
use ble_central_lib::core::bluetooth::types::uuid_from_u16;
use ble_central_lib::core::bluetooth::{
    AdvertisementScanner, AttError, BluetoothScanner, Characteristic, CharacteristicProperties,
    ConnectError, ConnectionManager, Connector, ControllerError, GattClient, GattPeer, Host,
    NotificationCallback, Phy, Service,
};
use common::{AttributeDb, FakeController, HANDLE, host_pair, peer};
use tokio::sync::mpsc;
use tokio::time::Instant;

fn heart_rate_measurement(properties: u8) -> Characteristic {
    Characteristic {
        uuid: uuid_from_u16(0x2A37),
        declaration_handle: 0x0002,
        value_handle: 0x0003,
        end_handle: 0x0004,
        properties: CharacteristicProperties::from_bits(properties),
    }
}

fn collecting_handler() -> (NotificationCallback, mpsc::UnboundedReceiver<Vec<u8>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: NotificationCallback = Arc::new(move |payload: &[u8]| {
        let _ = tx.send(payload.to_vec());
    });
    (handler, rx)
}

fn connection_manager(host: &Host) -> ConnectionManager {
    ConnectionManager::new(host.clone(), ConnectionConfig::default(), GattConfig::default())
        .unwrap()
}

async fn connected_client(host: &Host, controller: &mut FakeController) -> GattClient {
    let manager = connection_manager(host);
    let (client, opcode) = tokio::join!(
        manager.connect_peer(peer(), Duration::from_secs(5)),
        controller.accept_connection(HANDLE, peer())
    );
    assert_eq!(opcode, opcodes::LE_CREATE_CONNECTION);
    client.unwrap()
}

#[tokio::test]
async fn power_on_resets_and_sets_event_masks() {
    let (host, mut controller) = host_pair();

    let (result, seen) = tokio::join!(host.power_on(), async {
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(controller.answer_command().await.0);
        }
        seen
    });

    result.unwrap();
    assert_eq!(
        seen,
        vec![opcodes::RESET, opcodes::SET_EVENT_MASK, opcodes::LE_SET_EVENT_MASK]
    );
}

#[tokio::test]
async fn failed_command_reports_its_status() {
    let (host, mut controller) = host_pair();

    let (result, _) = tokio::join!(host.power_on(), controller.answer_command_with(0x0C));

    assert_eq!(
        result,
        Err(ControllerError::CommandFailed {
            opcode: opcodes::RESET,
            status: 0x0C
        })
    );
}

#[tokio::test]
async fn scanner_reports_each_address_once_per_session() {
    let (host, mut controller) = host_pair();
    let (sink, mut records) = mpsc::unbounded_channel();
    let mut scanner = BluetoothScanner::new(host.clone(), sink);
    let other = "11:22:33:44:55:66/R".parse().unwrap();

    let (started, commands) = tokio::join!(scanner.start(), async {
        let parameters = controller.answer_command().await;
        let enable = controller.answer_command().await;
        (parameters, enable)
    });
    started.unwrap();
    assert!(scanner.is_scanning());
    assert_eq!(commands.0.0, opcodes::LE_SET_EXTENDED_SCAN_PARAMETERS);
    assert_eq!(commands.1.0, opcodes::LE_SET_EXTENDED_SCAN_ENABLE);
    assert_eq!(commands.1.1[0], 0x01);

    let name = [0x05, 0x09, b'H', b'R', b'M', b'1'];
    controller.advertise(peer(), &name, -60).await;
    controller.advertise(peer(), &[], -58).await;
    controller.advertise(other, &[], -80).await;

    let (stopped, (opcode, params)) =
        tokio::join!(scanner.stop(), controller.answer_command());
    stopped.unwrap();
    assert_eq!(opcode, opcodes::LE_SET_EXTENDED_SCAN_ENABLE);
    assert_eq!(params[0], 0x00);
    assert!(!scanner.is_scanning());

    let first = records.try_recv().unwrap();
    assert_eq!(first.address, peer());
    assert_eq!(first.local_name(), Some("HRM1"));
    assert!(first.connectable);
    let second = records.try_recv().unwrap();
    assert_eq!(second.address, other);
    assert!(records.try_recv().is_err());

    let discovered = scanner.discovered();
    assert_eq!(discovered.len(), 2);
    assert_eq!(discovered[0].rssi, -58);
    assert_eq!(discovered[0].local_name(), Some("HRM1"));
}

#[tokio::test(start_paused = true)]
async fn scanner_stays_stopped_when_enable_fails() {
    let (host, mut controller) = host_pair();
    let (sink, _records) = mpsc::unbounded_channel();
    let mut scanner = BluetoothScanner::new(host.clone(), sink);

    let (started, _) = tokio::join!(scanner.start(), controller.answer_command_with(0x0C));

    assert_eq!(
        started,
        Err(ControllerError::CommandFailed {
            opcode: opcodes::LE_SET_EXTENDED_SCAN_PARAMETERS,
            status: 0x0C
        })
    );
    assert!(!scanner.is_scanning());
    assert_eq!(scanner.stop().await, Ok(()));
    assert!(controller.is_quiet(Duration::from_secs(1)).await);
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_cancels_the_attempt() {
    let (host, mut controller) = host_pair();
    let manager = connection_manager(&host);
    let started = Instant::now();

    let (result, cancel) = tokio::join!(manager.connect(peer(), Duration::from_secs(2)), async {
        let (opcode, _) = controller.answer_command().await;
        assert_eq!(opcode, opcodes::LE_CREATE_CONNECTION);
        controller.answer_command().await.0
    });

    assert_eq!(result.err(), Some(ConnectError::Timeout));
    assert_eq!(cancel, opcodes::LE_CREATE_CONNECTION_CANCEL);
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(manager.pending(), None);
}

#[tokio::test(start_paused = true)]
async fn connection_that_beats_the_cancel_is_dropped() {
    let (host, mut controller) = host_pair();
    let manager = connection_manager(&host);

    let (result, disconnect) = tokio::join!(manager.connect(peer(), Duration::from_secs(2)), async {
        controller.answer_command().await;
        let (opcode, _) = controller.answer_command_with(0x0C).await;
        assert_eq!(opcode, opcodes::LE_CREATE_CONNECTION_CANCEL);
        controller.connection_complete(0x00, HANDLE, peer()).await;
        controller.answer_command().await
    });

    assert_eq!(result.err(), Some(ConnectError::Timeout));
    assert_eq!(disconnect.0, opcodes::DISCONNECT);
    assert_eq!(disconnect.1[..2], HANDLE.to_le_bytes());
    assert_eq!(manager.pending(), None);
}

async fn start_scanning(scanner: &mut BluetoothScanner, controller: &mut FakeController) {
    let (started, _) = tokio::join!(scanner.start(), async {
        controller.answer_command().await;
        controller.answer_command().await;
    });
    started.unwrap();
}

#[tokio::test]
async fn extended_scan_leads_to_extended_connect() {
    let (host, mut controller) = host_pair();
    let (sink, _records) = mpsc::unbounded_channel();
    let mut scanner = BluetoothScanner::new(host.clone(), sink);
    start_scanning(&mut scanner, &mut controller).await;
    let manager = connection_manager(&host);

    let (connection, (opcode, params)) = tokio::join!(
        manager.connect(peer(), Duration::from_secs(5)),
        async {
            let command = controller.answer_command().await;
            controller
                .enhanced_connection_complete(0x00, HANDLE, peer())
                .await;
            command
        }
    );

    assert_eq!(opcode, opcodes::LE_EXTENDED_CREATE_CONNECTION);
    // 1M and Coded, each with its own parameter block
    assert_eq!(params[9], 0x05);
    assert_eq!(params.len(), 10 + 2 * 16);
    assert_eq!(params[3..9], peer().to_le_bytes());
    let connection = connection.unwrap();
    assert_eq!(connection.handle(), HANDLE);
    assert_eq!(connection.peer(), peer());
}

#[tokio::test]
async fn legacy_scan_leads_to_legacy_connect() {
    let (host, mut controller) = host_pair();
    let (sink, _records) = mpsc::unbounded_channel();
    let mut scanner = BluetoothScanner::new(host.clone(), sink);
    scanner
        .configure(ScanConfig {
            phy: Some(Phy::Le1M),
            ..ScanConfig::default()
        })
        .unwrap();
    start_scanning(&mut scanner, &mut controller).await;
    let manager = connection_manager(&host);

    let (connection, opcode) = tokio::join!(
        manager.connect(peer(), Duration::from_secs(5)),
        controller.accept_connection(HANDLE, peer())
    );

    assert_eq!(opcode, opcodes::LE_CREATE_CONNECTION);
    assert!(connection.unwrap().is_connected());
}

#[tokio::test]
async fn only_one_connection_attempt_at_a_time() {
    let (host, mut controller) = host_pair();
    let manager = connection_manager(&host);
    let other = "11:22:33:44:55:66".parse().unwrap();

    let (first, second, _) = tokio::join!(
        manager.connect(peer(), Duration::from_secs(5)),
        manager.connect(other, Duration::from_secs(5)),
        controller.accept_connection(HANDLE, peer())
    );

    assert_eq!(second.err(), Some(ConnectError::AlreadyPending));
    let connection = first.unwrap();
    assert_eq!(connection.handle(), HANDLE);
    assert_eq!(connection.peer(), peer());
    assert!(connection.is_connected());
    assert_eq!(connection.parameters().supervision_timeout, 400);
    assert_eq!(manager.pending(), None);
}

#[tokio::test]
async fn failed_connection_is_rejected_with_its_status() {
    let (host, mut controller) = host_pair();
    let manager = connection_manager(&host);

    let (result, ()) = tokio::join!(manager.connect(peer(), Duration::from_secs(5)), async {
        controller.answer_command().await;
        controller.connection_complete(0x3E, 0x0000, peer()).await;
    });

    assert_eq!(result.err(), Some(ConnectError::Rejected(0x3E)));
}

#[tokio::test]
async fn discovers_services_across_several_responses() {
    let (host, mut controller) = host_pair();
    let client = connected_client(&host, &mut controller).await;
    let db = AttributeDb::default()
        .service(1, 5, 0x1800)
        .service(6, 10, 0x1801)
        .service(11, 20, 0x180D);

    let (services, ()) = tokio::join!(client.discover_services(), async {
        for _ in 0..4 {
            controller.serve_att(&db).await;
        }
    });

    let ranges: Vec<_> = services
        .unwrap()
        .iter()
        .map(|s| (s.uuid, s.start_handle, s.end_handle))
        .collect();
    assert_eq!(
        ranges,
        vec![
            (uuid_from_u16(0x1800), 1, 5),
            (uuid_from_u16(0x1801), 6, 10),
            (uuid_from_u16(0x180D), 11, 20),
        ]
    );
}

#[tokio::test]
async fn empty_database_has_no_services() {
    let (host, mut controller) = host_pair();
    let client = connected_client(&host, &mut controller).await;
    let db = AttributeDb::default();

    let (services, request) = tokio::join!(
        client.discover_services(),
        controller.serve_att(&db)
    );

    assert!(matches!(request, AttPdu::ReadByGroupTypeRequest { start: 0x0001, .. }));
    assert_eq!(services, Ok(Vec::new()));
}

#[tokio::test(start_paused = true)]
async fn undecodable_response_fails_the_request() {
    let (host, mut controller) = host_pair();
    let client = connected_client(&host, &mut controller).await;
    let started = Instant::now();

    let (result, ()) = tokio::join!(client.discover_services(), async {
        let (handle, _) = controller.expect_att().await;
        // entry length 6 but only five bytes follow
        controller
            .send_raw_att(handle, &[0x11, 0x06, 0x01, 0x00, 0x04, 0x00, 0x0D])
            .await;
    });

    assert!(matches!(result, Err(AttError::Malformed(_))));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn discovers_and_subscribes_to_heart_rate() {
    let (host, mut controller) = host_pair();
    let client = connected_client(&host, &mut controller).await;
    let db = AttributeDb::heart_rate();
    let (handler, mut payloads) = collecting_handler();

    let (explored, written) = tokio::join!(
        async {
            let mtu = client.exchange_mtu(247).await?;
            let services = client.discover_services().await?;
            let characteristics = client.discover_characteristics(&services[0]).await?;
            let subscription = client.subscribe(&characteristics[0], handler).await?;
            Ok::<_, AttError>((mtu, services, characteristics, subscription))
        },
        controller.serve_until_write(&db)
    );
    let (mtu, services, characteristics, subscription) = explored.unwrap();

    assert_eq!(mtu, 185);
    assert_eq!(client.mtu(), 185);
    assert_eq!(
        services,
        vec![Service {
            uuid: uuid_from_u16(0x180D),
            start_handle: 0x0001,
            end_handle: 0x0004,
        }]
    );
    assert_eq!(characteristics, vec![heart_rate_measurement(0x10)]);
    assert_eq!(written, (0x0004, vec![0x01, 0x00]));
    assert_eq!(subscription.cccd_handle, 0x0004);
    assert!(subscription.is_active());

    let notification = AttPdu::HandleValueNotification {
        handle: 0x0003,
        value: vec![0x06, 0x48],
    };
    controller.send_att(HANDLE, &notification).await;
    assert_eq!(payloads.recv().await, Some(vec![0x06, 0x48]));
}

#[tokio::test]
async fn service_ranges_must_ascend() {
    let (host, mut controller) = host_pair();
    let client = connected_client(&host, &mut controller).await;

    let (result, ()) = tokio::join!(client.discover_services(), async {
        let (handle, _) = controller.expect_att().await;
        let response = AttPdu::ReadByGroupTypeResponse(vec![GroupEntry {
            handle: 0x0005,
            end_handle: 0x0002,
            value: 0x180Du16.to_le_bytes().to_vec(),
        }]);
        controller.send_att(handle, &response).await;
    });

    assert!(matches!(result, Err(AttError::Malformed(_))));
}

#[tokio::test(start_paused = true)]
async fn subscribing_needs_notify_or_indicate() {
    let (host, mut controller) = host_pair();
    let client = connected_client(&host, &mut controller).await;
    let (handler, _payloads) = collecting_handler();

    let result = client.subscribe(&heart_rate_measurement(0x02), handler).await;

    assert_eq!(result.err(), Some(AttError::NotNotifiable));
    assert!(controller.is_quiet(Duration::from_secs(1)).await);
}

#[tokio::test(start_paused = true)]
async fn disconnect_ends_delivery_and_requests() {
    let (host, mut controller) = host_pair();
    let client = connected_client(&host, &mut controller).await;
    let db = AttributeDb::heart_rate();
    let (handler, mut payloads) = collecting_handler();

    let characteristic = heart_rate_measurement(0x10);
    let (subscription, _) = tokio::join!(
        client.subscribe(&characteristic, handler),
        controller.serve_until_write(&db)
    );
    let subscription = subscription.unwrap();

    controller.disconnection(HANDLE, 0x13).await;
    assert_eq!(client.disconnected().await, 0x13);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let notification = AttPdu::HandleValueNotification {
        handle: 0x0003,
        value: vec![0x01],
    };
    controller.send_att(HANDLE, &notification).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(payloads.try_recv().is_err());
    assert!(!subscription.is_active());
    assert!(!client.connection().is_connected());
    assert_eq!(client.write(0x0004, &[0x00, 0x00]).await, Err(AttError::NotConnected));
    assert_eq!(client.discover_services().await.err(), Some(AttError::NotConnected));
}

#[tokio::test]
async fn disconnect_fails_the_request_in_flight() {
    let (host, mut controller) = host_pair();
    let client = connected_client(&host, &mut controller).await;

    let characteristic = heart_rate_measurement(0x12);
    let (result, ()) = tokio::join!(client.read(&characteristic), async {
        let (_, request) = controller.expect_att().await;
        assert_eq!(request, AttPdu::ReadRequest(0x0003));
        controller.disconnection(HANDLE, 0x08).await;
    });

    assert_eq!(result, Err(AttError::NotConnected));
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out() {
    let (host, mut controller) = host_pair();
    let client = connected_client(&host, &mut controller).await;
    let started = Instant::now();

    let characteristic = heart_rate_measurement(0x12);
    let (result, _) = tokio::join!(
        client.read(&characteristic),
        controller.expect_att()
    );

    assert_eq!(result, Err(AttError::Timeout));
    assert!(started.elapsed() >= Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn no_requests_after_a_timeout() {
    let (host, mut controller) = host_pair();
    let client = connected_client(&host, &mut controller).await;

    let characteristic = heart_rate_measurement(0x12);
    let (first, _) = tokio::join!(
        client.read(&characteristic),
        controller.expect_att()
    );
    assert_eq!(first, Err(AttError::Timeout));

    // The late answer must not be taken for the next request's response
    controller
        .send_att(HANDLE, &AttPdu::ReadResponse(vec![0x2A]))
        .await;
    let second = client.read(&heart_rate_measurement(0x12)).await;

    assert_eq!(second, Err(AttError::Timeout));
    assert!(controller.is_quiet(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn indications_are_confirmed() {
    let (host, mut controller) = host_pair();
    let client = connected_client(&host, &mut controller).await;
    let db = AttributeDb::default()
        .service(0x0001, 0x0004, 0x1809)
        .characteristic(0x0002, 0x20, 0x2A1C)
        .cccd(0x0004);
    let characteristic = Characteristic {
        uuid: uuid_from_u16(0x2A1C),
        properties: CharacteristicProperties::from_bits(0x20),
        ..heart_rate_measurement(0x20)
    };
    let (handler, mut payloads) = collecting_handler();

    let (subscription, written) = tokio::join!(
        client.subscribe(&characteristic, handler),
        controller.serve_until_write(&db)
    );
    subscription.unwrap();
    assert_eq!(written, (0x0004, vec![0x02, 0x00]));

    let indication = AttPdu::HandleValueIndication {
        handle: 0x0003,
        value: vec![0x24, 0x01],
    };
    controller.send_att(HANDLE, &indication).await;

    assert_eq!(payloads.recv().await, Some(vec![0x24, 0x01]));
    assert_eq!(
        controller.expect_att().await,
        (HANDLE, AttPdu::HandleValueConfirmation)
    );
}

#[tokio::test]
async fn peer_requests_are_not_supported() {
    let (host, mut controller) = host_pair();
    let _client = connected_client(&host, &mut controller).await;

    controller.send_att(HANDLE, &AttPdu::ReadRequest(0x0001)).await;

    assert_eq!(
        controller.expect_att().await,
        (
            HANDLE,
            AttPdu::ErrorResponse {
                request_opcode: 0x0A,
                handle: 0x0000,
                code: att_errors::REQUEST_NOT_SUPPORTED,
            }
        )
    );
}

#[tokio::test]
async fn unsubscribe_clears_the_cccd() {
    let (host, mut controller) = host_pair();
    let client = connected_client(&host, &mut controller).await;
    let db = AttributeDb::heart_rate();
    let (handler, _payloads) = collecting_handler();

    let characteristic = heart_rate_measurement(0x10);
    let (subscription, _) = tokio::join!(
        client.subscribe(&characteristic, handler),
        controller.serve_until_write(&db)
    );
    let subscription = subscription.unwrap();

    let (result, written) = tokio::join!(
        client.unsubscribe(&subscription),
        controller.serve_until_write(&db)
    );

    result.unwrap();
    assert_eq!(written, (0x0004, vec![0x00, 0x00]));
    assert!(!subscription.is_active());
}
