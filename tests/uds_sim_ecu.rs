mod common;

use std::sync::{Arc, Mutex};

use common::{init_logging, lock, uds_link, UdsEcu, UDS_REQUEST_ID};
use ecu_bridge::{
    channel::CanFrame,
    config::{ConnectionConfig, EcuConfig},
    dtc::DtcStatusFlags,
    hardware::simulation::SimulationCanChannel,
    protocol::{EcuProtocol, ProtocolError, ProtocolKind, ProtocolState},
    uds::UdsProtocol,
};

fn setup(ecu: UdsEcu) -> (Arc<Mutex<UdsEcu>>, SimulationCanChannel, UdsProtocol) {
    init_logging();
    let cfg = EcuConfig::default_for(ProtocolKind::Uds, "vcan0");
    let ConnectionConfig::CanBus(can) = &cfg.connection else {
        panic!("UDS defaults to CAN");
    };
    let ecu = Arc::new(Mutex::new(ecu));
    let bus = uds_link(ecu.clone());
    let protocol = UdsProtocol::new(Box::new(bus.clone()), can, &cfg);
    (ecu, bus, protocol)
}

fn tester_frames(bus: &SimulationCanChannel) -> Vec<Vec<u8>> {
    bus.tx_log()
        .iter()
        .inspect(|f| assert_eq!(f.id(), UDS_REQUEST_ID))
        .map(|f| f.data().to_vec())
        .collect()
}

#[test]
fn connect_requests_extended_session() {
    let (ecu, bus, mut uds) = setup(UdsEcu::default());
    uds.connect().unwrap();
    assert_eq!(uds.state(), ProtocolState::Connected);
    assert_eq!(lock(&ecu).session, 0x03);
    assert_eq!(tester_frames(&bus)[0], vec![0x02, 0x10, 0x03]);
}

#[test]
fn read_did_and_truncate() {
    let (_ecu, _bus, mut uds) = setup(UdsEcu::default());
    uds.connect().unwrap();
    assert_eq!(uds.read_memory(0xF187, 0).unwrap(), b"5WP4 4862".to_vec());
    assert_eq!(uds.read_memory(0xF187, 3).unwrap(), b"5WP".to_vec());
}

#[test]
fn non_did_addresses_are_rejected_before_sending() {
    let (_ecu, bus, mut uds) = setup(UdsEcu::default());
    uds.connect().unwrap();
    bus.clear_tx_log();
    assert!(matches!(
        uds.read_memory(0x0001_F187, 4),
        Err(ProtocolError::InvalidAddress { address: 0x0001_F187, length: 4 })
    ));
    assert!(matches!(
        uds.write_memory(0x1_0000, &[1]),
        Err(ProtocolError::InvalidAddress { .. })
    ));
    assert!(bus.tx_log().is_empty());
}

#[test]
fn seven_byte_payload_is_a_single_frame() {
    let (ecu, bus, mut uds) = setup(UdsEcu::default());
    uds.connect().unwrap();
    bus.clear_tx_log();
    uds.write_memory(0x0100, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
    assert_eq!(
        tester_frames(&bus),
        vec![vec![0x07, 0x2E, 0x01, 0x00, 0xDE, 0xAD, 0xBE, 0xEF]]
    );
    assert_eq!(lock(&ecu).dids[&0x0100], vec![0xDE, 0xAD, 0xBE, 0xEF]);
}

#[test]
fn segmented_write_cycles_sequence_numbers() {
    let (ecu, bus, mut uds) = setup(UdsEcu::default());
    uds.connect().unwrap();
    bus.clear_tx_log();
    let data: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
    uds.write_memory(0x0200, &data).unwrap();

    // 203 byte request: one first frame and ceil((203 - 6) / 7) consecutive frames
    let frames = tester_frames(&bus);
    assert_eq!(frames.len(), 1 + 29);
    assert_eq!(&frames[0][..5], &[0x10, 0xCB, 0x2E, 0x02, 0x00]);
    let seqs: Vec<u8> = frames[1..].iter().map(|f| f[0]).collect();
    let expected: Vec<u8> = (1..=29u32).map(|i| 0x20 | (i % 16) as u8).collect();
    assert_eq!(seqs, expected);
    assert_eq!(lock(&ecu).dids[&0x0200], data);
}

#[test]
fn segmented_write_honours_block_size() {
    let (ecu, _bus, mut uds) = setup(UdsEcu {
        block_size: 4,
        ..Default::default()
    });
    uds.connect().unwrap();
    let data = vec![0x5A; 64];
    uds.write_memory(0x0300, &data).unwrap();
    assert_eq!(lock(&ecu).dids[&0x0300], data);
}

#[test]
fn multi_frame_response_is_reassembled() {
    let mut ecu = UdsEcu::default();
    let record: Vec<u8> = (0..100u8).collect();
    ecu.dids.insert(0x1234, record.clone());
    let (_ecu, bus, mut uds) = setup(ecu);
    uds.connect().unwrap();
    bus.clear_tx_log();
    assert_eq!(uds.read_memory(0x1234, 0).unwrap(), record);
    // Request, then our flow control
    assert_eq!(
        tester_frames(&bus),
        vec![vec![0x03, 0x22, 0x12, 0x34], vec![0x30, 0x00, 0x00]]
    );
}

#[test]
fn out_of_sequence_frame_fails_reassembly() {
    let mut ecu = UdsEcu::default();
    ecu.dids.insert(0x1234, vec![0x11; 40]);
    let (ecu, _bus, mut uds) = setup(ecu);
    uds.connect().unwrap();
    lock(&ecu).skip_sequence = true;
    assert!(matches!(uds.read_memory(0x1234, 0), Err(ProtocolError::ReassemblyError(_))));
}

#[test]
fn pending_responses_and_foreign_frames_are_skipped() {
    let (_ecu, _bus, mut uds) = setup(UdsEcu {
        pending_before_response: 3,
        chatter: true,
        ..Default::default()
    });
    uds.connect().unwrap();
    assert_eq!(uds.read_memory(0xF186, 0).unwrap(), vec![0x01]);
}

#[test]
fn unknown_did_is_a_negative_response() {
    let (_ecu, _bus, mut uds) = setup(UdsEcu::default());
    uds.connect().unwrap();
    match uds.read_memory(0xBEEF, 0) {
        Err(ProtocolError::MemoryAccessError { code: 0x31, def }) => {
            assert_eq!(def.as_deref(), Some("RequestOutOfRange"))
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn identify_skips_missing_identifiers() {
    let mut ecu = UdsEcu::default();
    ecu.dids.remove(&0xF189);
    let (_ecu, _bus, mut uds) = setup(ecu);
    uds.connect().unwrap();
    let info = uds.identify().unwrap();
    assert_eq!(info.field("active_session"), Some("01"));
    assert_eq!(info.field("part_number"), Some("5WP4 4862"));
    assert_eq!(info.field("software_version"), None);
}

#[test]
fn dtcs_are_read_with_status_and_cleared() {
    let (ecu, bus, mut uds) = setup(UdsEcu {
        dtcs: vec![(0x23_1387, 0x09), (0xC1_0000, 0x88), (0x00_0000, 0x08)],
        ..Default::default()
    });
    uds.connect().unwrap();
    let dtcs = uds.read_dtcs().unwrap();
    assert_eq!(dtcs.len(), 2);
    assert_eq!(dtcs[0].to_string(), "P2313-87");
    assert_eq!(
        dtcs[0].status,
        DtcStatusFlags::TEST_FAILED | DtcStatusFlags::CONFIRMED
    );
    assert!(dtcs[1].mil_on());

    bus.clear_tx_log();
    uds.clear_dtcs().unwrap();
    assert_eq!(tester_frames(&bus), vec![vec![0x04, 0x14, 0xFF, 0xFF, 0xFF]]);
    assert!(lock(&ecu).dtcs.is_empty());
}

#[test]
fn disconnect_returns_to_default_session() {
    let (ecu, bus, mut uds) = setup(UdsEcu::default());
    uds.connect().unwrap();
    bus.clear_tx_log();
    uds.disconnect().unwrap();
    assert_eq!(tester_frames(&bus), vec![vec![0x02, 0x10, 0x01]]);
    assert_eq!(lock(&ecu).session, 0x01);
    assert!(matches!(uds.read_dtcs(), Err(ProtocolError::NotConnected)));
}

#[test]
fn silent_ecu_fails_the_handshake() {
    let (_ecu, bus, mut uds) = setup(UdsEcu {
        silent: true,
        ..Default::default()
    });
    assert!(matches!(uds.connect(), Err(ProtocolError::ConnectError(_))));
    assert_eq!(uds.state(), ProtocolState::Error);
    // Late frames from the bus do not revive the protocol
    bus.inject(CanFrame::new(0x7E8, &[0x02, 0x50, 0x03], false));
    assert!(matches!(uds.read_dtcs(), Err(ProtocolError::NotConnected)));
}
