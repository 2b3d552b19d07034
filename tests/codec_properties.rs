//! Properties of the frame codec over arbitrary inputs.

use proptest::collection::vec;
use proptest::prelude::*;
use ylinkcore::codec::message::opcode;
use ylinkcore::codec::{
    Chunk, Disconnect, FirmwarePacket, FirmwareUpdateRequest, Message, Sealed,
    StartFirmwareUpload,
};

fn sealed() -> impl Strategy<Value = Sealed> {
    (any::<u8>(), any::<[u8; 16]>(), vec(any::<u8>(), 0..64)).prop_map(|(version, iv, payload)| {
        Sealed {
            version,
            iv,
            payload,
        }
    })
}

fn chunk() -> impl Strategy<Value = Chunk> {
    vec(any::<u8>(), 0..=255).prop_map(|data| Chunk::new(data).unwrap())
}

fn message() -> impl Strategy<Value = Message> {
    prop_oneof![
        sealed().prop_map(Message::SealedFirmwareUpdateRequest),
        vec(any::<u8>(), 0..64)
            .prop_map(|sealed| Message::FirmwareUpdateRequest(FirmwareUpdateRequest::new(sealed))),
        (any::<u8>(), any::<u32>()).prop_map(|(version, starting_offset)| {
            Message::StartFirmwareUpload(StartFirmwareUpload {
                version,
                starting_offset,
            })
        }),
        (any::<u32>(), vec(any::<u8>(), 0..=255)).prop_map(|(offset, packet)| {
            Message::FirmwarePacket(FirmwarePacket::new(offset, packet).unwrap())
        }),
        sealed().prop_map(Message::FirmwareUpdateComplete),
        Just(Message::FirmwareUploadComplete),
        Just(Message::FirmwareUpdateCompleteAck),
        (any::<u8>(), any::<u8>())
            .prop_map(|(version, reason)| Message::Disconnect(Disconnect { version, reason })),
        sealed().prop_map(Message::SealedControlDataUpdateRequest),
        Just(Message::Ack),
        chunk().prop_map(Message::CardKeyGroups),
        Just(Message::CardKeyGroupsUploadComplete),
        chunk().prop_map(Message::CancelledStaffCards),
        Just(Message::CancelledStaffCardsUploadComplete),
        sealed().prop_map(Message::ControlDataUpdateComplete),
        Just(Message::ControlDataUpdateCompleteAck),
    ]
}

proptest! {
    /// The leading byte is the opcode and the frame reads back as the same
    /// message.
    #[test]
    fn frames_lead_with_their_opcode_and_read_back(message in message()) {
        let frame = message.encode();
        prop_assert_eq!(frame[0], message.opcode());
        prop_assert_eq!(Message::decode(&frame), Ok(message));
    }

    /// Garbage never panics the decoder.
    #[test]
    fn arbitrary_bytes_decode_or_fail_cleanly(bytes in vec(any::<u8>(), 0..300)) {
        let _ = Message::decode(&bytes);
    }

    /// Splitting a blob into size-prefixed chunk frames and reading them
    /// back reproduces it exactly.
    #[test]
    fn chunked_blobs_reassemble(
        blob in vec(any::<u8>(), 0..2_000),
        chunk_size in 1usize..=255,
    ) {
        let frames: Vec<Vec<u8>> = blob
            .chunks(chunk_size)
            .map(|part| Message::CardKeyGroups(Chunk::new(part.to_vec()).unwrap()).encode())
            .collect();

        let mut reassembled = Vec::new();
        for frame in &frames {
            prop_assert_eq!(frame[0], opcode::CARD_KEY_GROUPS);
            prop_assert!(frame.len() <= chunk_size + 2);
            let Ok(Message::CardKeyGroups(chunk)) = Message::decode(frame) else {
                panic!("chunk frame did not read back");
            };
            reassembled.extend_from_slice(chunk.data());
        }
        prop_assert_eq!(reassembled, blob);
    }

    /// Firmware packets carry contiguous offsets covering the image.
    #[test]
    fn firmware_packets_cover_the_image(
        image in vec(any::<u8>(), 1..3_000),
        packet_size in 1usize..=64,
        start in 0usize..3_000,
    ) {
        let start = start % image.len();
        let mut expected_offset = start as u32;
        let mut received = image[..start].to_vec();
        for (i, part) in image[start..].chunks(packet_size).enumerate() {
            let offset = (start + i * packet_size) as u32;
            let frame = Message::FirmwarePacket(FirmwarePacket::new(offset, part.to_vec()).unwrap())
                .encode();
            let Ok(Message::FirmwarePacket(packet)) = Message::decode(&frame) else {
                panic!("packet frame did not read back");
            };
            prop_assert_eq!(packet.byte_offset(), expected_offset);
            expected_offset += packet.packet().len() as u32;
            received.extend_from_slice(packet.packet());
        }
        prop_assert_eq!(expected_offset as usize, image.len());
        prop_assert_eq!(received, image);
    }
}

