mod common;

use std::sync::atomic::Ordering;

use common::{FixtureBackend, Report, Rig, ota_ylink, peripheral_of};
use ylinkcore::codec::message::opcode;
use ylinkcore::events::{OtaEvent, WriteProgress};
use ylinkcore::model::MacAddress;
use ylinkcore::operation::OtaStatus;
use ylinkcore::{UpdateEvent, UpdateMode, UpdaterConfig};

const LOBBY: MacAddress = MacAddress::new([0x0A, 0x1B, 0x2C, 0x3D, 0x4E, 0x01]);
const SUITE: MacAddress = MacAddress::new([0x0A, 0x1B, 0x2C, 0x3D, 0x4E, 0x02]);

fn binary(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn is_ota(event: &UpdateEvent, address: MacAddress, f: impl Fn(&OtaEvent) -> bool) -> bool {
    let UpdateEvent::Ota(event) = event else {
        return false;
    };
    let snapshot = match event {
        OtaEvent::WriteComplete(op)
        | OtaEvent::UpdateConfirmed(op)
        | OtaEvent::Removed(op)
        | OtaEvent::Discovered(op)
        | OtaEvent::Validating(op)
        | OtaEvent::UpdateStarted(op) => op,
        OtaEvent::WriteProgress { operation, .. } => operation,
        _ => return false,
    };
    snapshot.address == address && f(event)
}

fn write_progress(events: &[UpdateEvent], address: MacAddress) -> Vec<WriteProgress> {
    events
        .iter()
        .filter_map(|event| match event {
            UpdateEvent::Ota(OtaEvent::WriteProgress {
                operation,
                progress,
            }) if operation.address == address => Some(*progress),
            _ => None,
        })
        .collect()
}

/// Runs one yLink from its first sighting to removal, returning every
/// event seen on the way.
async fn run_to_removal(rig: &mut Rig, address: MacAddress) -> Vec<UpdateEvent> {
    rig.sight(address).await;
    let mut events = rig
        .wait_for("write complete", |e| {
            is_ota(e, address, |e| matches!(e, OtaEvent::WriteComplete(_)))
        })
        .await;
    rig.sight(address).await;
    events.extend(
        rig.wait_for("removal", |e| {
            is_ota(e, address, |e| matches!(e, OtaEvent::Removed(_)))
        })
        .await,
    );
    events
}

#[tokio::test(start_paused = true)]
async fn firmware_reaches_the_lock_intact_and_is_confirmed() {
    let image = binary(29_976);
    let backend = FixtureBackend {
        ota: vec![ota_ylink(LOBBY, "101")],
        binary: image.clone(),
        ..FixtureBackend::default()
    };
    let mut rig = Rig::launch(backend, UpdaterConfig::default(), 0);
    rig.handle.start().await.unwrap();

    let events = run_to_removal(&mut rig, LOBBY).await;
    let peripheral = peripheral_of(LOBBY);

    {
        let state = rig.lock.state.lock().unwrap();
        assert_eq!(state.images[&peripheral], image);

        let packets = state.packets_for(&peripheral);
        assert_eq!(packets.len(), 2_142);
        assert!(packets[..2_141].iter().all(|(_, len)| *len == 14));
        assert_eq!(packets.last(), Some(&(29_974, 2)));

        let opcodes: Vec<u8> = state
            .frames_for(&peripheral)
            .iter()
            .map(|frame| frame[0])
            .collect();
        assert_eq!(
            opcodes,
            vec![
                opcode::FIRMWARE_UPDATE_REQUEST,
                opcode::FIRMWARE_UPLOAD_COMPLETE,
                opcode::FIRMWARE_UPDATE_REQUEST,
                opcode::FIRMWARE_UPDATE_COMPLETE_ACK,
            ]
        );
        assert_eq!(
            state.frames_for(&peripheral)[0],
            vec![0x7A, 0x01, 0x79, 0x01, 0x02, 0x03, 0x04, 0x05]
        );
    }

    let progress = write_progress(&events, LOBBY);
    assert_eq!(progress.len(), 2_142);
    assert_eq!(
        progress.last(),
        Some(&WriteProgress {
            bytes_written: 2,
            total_bytes_written: 29_974,
            total_bytes_expected: 29_976,
        })
    );

    // Upload confirmed, then the reboot: never an unknown disconnect.
    assert!(events.iter().all(|event| !matches!(
        event,
        UpdateEvent::Ota(OtaEvent::Disconnected(op)) if op.status == OtaStatus::UnknownDisconnect
    )));
    assert!(
        events
            .iter()
            .any(|e| is_ota(e, LOBBY, |e| matches!(e, OtaEvent::Validating(_))))
    );
    let confirmed = events
        .iter()
        .filter(|e| is_ota(e, LOBBY, |e| matches!(e, OtaEvent::UpdateConfirmed(_))))
        .count();
    assert_eq!(confirmed, 1);

    let reports = rig.backend.reports();
    assert_eq!(reports[0], Report::FirmwareStatus(LOBBY, 0x0B));
    let Report::FirmwareComplete(address, hex) = &reports[1] else {
        panic!("expected a completion report, got {reports:?}");
    };
    assert_eq!(*address, LOBBY);
    assert!(hex.starts_with("7d01"));

    let snapshot = rig.handle.snapshot().await.unwrap();
    assert!(snapshot.ota.is_empty());
}

#[tokio::test(start_paused = true)]
async fn upload_resumes_from_the_offset_the_lock_asks_for() {
    let image = binary(29_976);
    let backend = FixtureBackend {
        ota: vec![ota_ylink(LOBBY, "101")],
        binary: image.clone(),
        ..FixtureBackend::default()
    };
    let mut rig = Rig::launch(backend, UpdaterConfig::default(), 14_000);
    rig.handle.start().await.unwrap();
    rig.sight(LOBBY).await;
    let events = rig
        .wait_for("write complete", |e| {
            is_ota(e, LOBBY, |e| matches!(e, OtaEvent::WriteComplete(_)))
        })
        .await;

    let peripheral = peripheral_of(LOBBY);
    let state = rig.lock.state.lock().unwrap();
    let packets = state.packets_for(&peripheral);
    assert_eq!(packets.first(), Some(&(14_000, 14)));
    assert_eq!(packets.len(), 1_142);
    assert_eq!(&state.images[&peripheral][14_000..], &image[14_000..]);

    let progress = write_progress(&events, LOBBY);
    assert_eq!(progress[0].total_bytes_written, 14_000);
}

#[tokio::test(start_paused = true)]
async fn concurrency_cap_holds_the_second_lock_back() {
    let backend = FixtureBackend {
        ota: vec![ota_ylink(LOBBY, "101"), ota_ylink(SUITE, "102")],
        binary: binary(700),
        ..FixtureBackend::default()
    };
    let config = UpdaterConfig {
        mode: UpdateMode::Automatic,
        max_concurrent_updates: 1,
        ..UpdaterConfig::default()
    };
    let mut rig = Rig::launch(backend, config, 0);
    rig.handle.start().await.unwrap();

    rig.sight(LOBBY).await;
    rig.sight(SUITE).await;
    rig.wait_for("lobby written", |e| {
        is_ota(e, LOBBY, |e| matches!(e, OtaEvent::WriteComplete(_)))
    })
    .await;

    let snapshot = rig.handle.snapshot().await.unwrap();
    let suite = snapshot
        .ota
        .iter()
        .find(|op| op.address == SUITE)
        .unwrap();
    assert_eq!(suite.status, OtaStatus::Discovered);
    assert!(rig.lock.state.lock().unwrap().packets_for(&peripheral_of(SUITE)).is_empty());

    rig.sight(LOBBY).await;
    rig.wait_for("lobby removed", |e| {
        is_ota(e, LOBBY, |e| matches!(e, OtaEvent::Removed(_)))
    })
    .await;

    // A slot is free again; the next sighting starts the suite.
    run_to_removal(&mut rig, SUITE).await;
    assert_eq!(
        rig.lock.state.lock().unwrap().images[&peripheral_of(SUITE)],
        binary(700)
    );
    assert_eq!(rig.backend.downloads.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn shared_firmware_is_downloaded_once() {
    let backend = FixtureBackend {
        ota: vec![ota_ylink(LOBBY, "101"), ota_ylink(SUITE, "102")],
        binary: binary(300),
        ..FixtureBackend::default()
    };
    let mut rig = Rig::launch(backend, UpdaterConfig::default(), 0);
    rig.handle.start().await.unwrap();

    rig.sight(LOBBY).await;
    rig.sight(SUITE).await;
    let mut written = 0;
    rig.wait_for("both written", |e| {
        if let UpdateEvent::Ota(OtaEvent::WriteComplete(_)) = e {
            written += 1;
        }
        written == 2
    })
    .await;

    assert_eq!(rig.backend.downloads.load(Ordering::SeqCst), 1);
    let state = rig.lock.state.lock().unwrap();
    assert_eq!(state.images[&peripheral_of(LOBBY)], binary(300));
    assert_eq!(state.images[&peripheral_of(SUITE)], binary(300));
}
