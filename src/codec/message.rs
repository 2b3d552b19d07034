use super::{CodecError, Field, FieldReader, FieldWriter, OPCODE};

pub mod opcode {
    pub const DISCONNECT: u8 = 0x6B;
    pub const SEALED_FIRMWARE_UPDATE_REQUEST: u8 = 0x79;
    pub const FIRMWARE_UPDATE_REQUEST: u8 = 0x7A;
    pub const START_FIRMWARE_UPLOAD: u8 = 0x7B;
    pub const FIRMWARE_PACKET: u8 = 0x7C;
    pub const FIRMWARE_UPDATE_COMPLETE: u8 = 0x7D;
    pub const FIRMWARE_UPLOAD_COMPLETE: u8 = 0x7E;
    pub const FIRMWARE_UPDATE_COMPLETE_ACK: u8 = 0x7F;
    pub const SEALED_CONTROL_DATA_UPDATE_REQUEST: u8 = 0x80;
    pub const ACK: u8 = 0x81;
    pub const CARD_KEY_GROUPS: u8 = 0x82;
    pub const CARD_KEY_GROUPS_UPLOAD_COMPLETE: u8 = 0x83;
    pub const CANCELLED_STAFF_CARDS: u8 = 0x84;
    pub const CANCELLED_STAFF_CARDS_UPLOAD_COMPLETE: u8 = 0x85;
    pub const CONTROL_DATA_UPDATE_COMPLETE: u8 = 0x86;
    pub const CONTROL_DATA_UPDATE_COMPLETE_ACK: u8 = 0x87;
}

/// Interface version sent in phone-originated requests.
pub const BLE_INTERFACE_VERSION: u8 = 0x01;

/// Largest payload a 1-byte size field can announce.
pub const MAX_CHUNK_SIZE: usize = u8::MAX as usize;

const VERSION: Field = Field::u8("version", 1);

/// Encrypted envelope produced by the server or by the lock for the server.
/// The phone only relays it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub version: u8,
    pub iv: [u8; 16],
    pub payload: Vec<u8>,
}

impl Sealed {
    const IV: Field = Field::bytes("iv", 2, 16);
    const PAYLOAD: Field = Field::rest("payload", 18);
    pub const LAYOUT: &'static [Field] = &[OPCODE, VERSION, Self::IV, Self::PAYLOAD];

    fn decode(buf: &[u8], opcode: u8) -> Result<Self, CodecError> {
        let reader = FieldReader::new(buf, opcode)?;
        Ok(Sealed {
            version: reader.u8(&VERSION)?,
            iv: reader.array(&Self::IV)?,
            payload: reader.rest(&Self::PAYLOAD)?.to_vec(),
        })
    }

    fn encode(&self, opcode: u8) -> Vec<u8> {
        let mut writer = FieldWriter::new(opcode);
        writer
            .put_u8(&VERSION, self.version)
            .put_slice(&Self::IV, &self.iv)
            .put_slice(&Self::PAYLOAD, &self.payload);
        writer.finish()
    }
}

/// Phone to lock: asks the lock to accept a firmware image, wrapping the
/// server's sealed request unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareUpdateRequest {
    pub version: u8,
    pub sealed_request: Vec<u8>,
}

impl FirmwareUpdateRequest {
    const SEALED_REQUEST: Field = Field::rest("sealed_request", 2);
    pub const LAYOUT: &'static [Field] = &[OPCODE, VERSION, Self::SEALED_REQUEST];

    pub fn new(sealed_request: Vec<u8>) -> Self {
        FirmwareUpdateRequest {
            version: BLE_INTERFACE_VERSION,
            sealed_request,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartFirmwareUpload {
    pub version: u8,
    pub starting_offset: u32,
}

impl StartFirmwareUpload {
    const STARTING_OFFSET: Field = Field::u32("starting_offset", 2);
    pub const LAYOUT: &'static [Field] = &[OPCODE, VERSION, Self::STARTING_OFFSET];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnect {
    pub version: u8,
    pub reason: u8,
}

impl Disconnect {
    const REASON: Field = Field::u8("reason", 2);
    pub const LAYOUT: &'static [Field] = &[OPCODE, VERSION, Self::REASON];
}

/// One slice of the firmware image, tagged with where it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwarePacket {
    byte_offset: u32,
    packet: Vec<u8>,
}

impl FirmwarePacket {
    const BYTE_OFFSET: Field = Field::u32("byte_offset", 1);
    const SIZE: Field = Field::u8("size", 5);
    const PACKET: Field = Field::rest("packet", 6);
    pub const LAYOUT: &'static [Field] = &[OPCODE, Self::BYTE_OFFSET, Self::SIZE, Self::PACKET];

    pub fn new(byte_offset: u32, packet: Vec<u8>) -> Result<Self, CodecError> {
        if packet.len() > MAX_CHUNK_SIZE {
            return Err(CodecError::PayloadTooLarge(packet.len()));
        }
        Ok(FirmwarePacket {
            byte_offset,
            packet,
        })
    }

    pub fn byte_offset(&self) -> u32 {
        self.byte_offset
    }

    pub fn packet(&self) -> &[u8] {
        &self.packet
    }
}

/// A size-prefixed control-data slice (card key groups or cancelled cards).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    data: Vec<u8>,
}

impl Chunk {
    const SIZE: Field = Field::u8("size", 1);
    const DATA: Field = Field::rest("data", 2);
    pub const LAYOUT: &'static [Field] = &[OPCODE, Self::SIZE, Self::DATA];

    pub fn new(data: Vec<u8>) -> Result<Self, CodecError> {
        if data.len() > MAX_CHUNK_SIZE {
            return Err(CodecError::PayloadTooLarge(data.len()));
        }
        Ok(Chunk { data })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn decode(buf: &[u8], opcode: u8) -> Result<Self, CodecError> {
        let reader = FieldReader::new(buf, opcode)?;
        let size = reader.u8(&Self::SIZE)? as usize;
        Ok(Chunk {
            data: reader.sized(&Self::DATA, size)?.to_vec(),
        })
    }

    fn encode(&self, opcode: u8) -> Vec<u8> {
        let mut writer = FieldWriter::new(opcode);
        writer
            .put_u8(&Self::SIZE, self.data.len() as u8)
            .put_slice(&Self::DATA, &self.data);
        writer.finish()
    }
}

/// Every frame of the update protocols, keyed by opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    SealedFirmwareUpdateRequest(Sealed),
    FirmwareUpdateRequest(FirmwareUpdateRequest),
    StartFirmwareUpload(StartFirmwareUpload),
    FirmwarePacket(FirmwarePacket),
    FirmwareUpdateComplete(Sealed),
    FirmwareUploadComplete,
    FirmwareUpdateCompleteAck,
    Disconnect(Disconnect),
    SealedControlDataUpdateRequest(Sealed),
    Ack,
    CardKeyGroups(Chunk),
    CardKeyGroupsUploadComplete,
    CancelledStaffCards(Chunk),
    CancelledStaffCardsUploadComplete,
    ControlDataUpdateComplete(Sealed),
    ControlDataUpdateCompleteAck,
}

impl Message {
    pub fn opcode(&self) -> u8 {
        match self {
            Message::SealedFirmwareUpdateRequest(_) => opcode::SEALED_FIRMWARE_UPDATE_REQUEST,
            Message::FirmwareUpdateRequest(_) => opcode::FIRMWARE_UPDATE_REQUEST,
            Message::StartFirmwareUpload(_) => opcode::START_FIRMWARE_UPLOAD,
            Message::FirmwarePacket(_) => opcode::FIRMWARE_PACKET,
            Message::FirmwareUpdateComplete(_) => opcode::FIRMWARE_UPDATE_COMPLETE,
            Message::FirmwareUploadComplete => opcode::FIRMWARE_UPLOAD_COMPLETE,
            Message::FirmwareUpdateCompleteAck => opcode::FIRMWARE_UPDATE_COMPLETE_ACK,
            Message::Disconnect(_) => opcode::DISCONNECT,
            Message::SealedControlDataUpdateRequest(_) => {
                opcode::SEALED_CONTROL_DATA_UPDATE_REQUEST
            }
            Message::Ack => opcode::ACK,
            Message::CardKeyGroups(_) => opcode::CARD_KEY_GROUPS,
            Message::CardKeyGroupsUploadComplete => opcode::CARD_KEY_GROUPS_UPLOAD_COMPLETE,
            Message::CancelledStaffCards(_) => opcode::CANCELLED_STAFF_CARDS,
            Message::CancelledStaffCardsUploadComplete => {
                opcode::CANCELLED_STAFF_CARDS_UPLOAD_COMPLETE
            }
            Message::ControlDataUpdateComplete(_) => opcode::CONTROL_DATA_UPDATE_COMPLETE,
            Message::ControlDataUpdateCompleteAck => opcode::CONTROL_DATA_UPDATE_COMPLETE_ACK,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let opcode = self.opcode();
        match self {
            Message::SealedFirmwareUpdateRequest(sealed)
            | Message::FirmwareUpdateComplete(sealed)
            | Message::SealedControlDataUpdateRequest(sealed)
            | Message::ControlDataUpdateComplete(sealed) => sealed.encode(opcode),
            Message::FirmwareUpdateRequest(request) => {
                let mut writer = FieldWriter::new(opcode);
                writer.put_u8(&VERSION, request.version).put_slice(
                    &FirmwareUpdateRequest::SEALED_REQUEST,
                    &request.sealed_request,
                );
                writer.finish()
            }
            Message::StartFirmwareUpload(start) => {
                let mut writer = FieldWriter::new(opcode);
                writer
                    .put_u8(&VERSION, start.version)
                    .put_u32(&StartFirmwareUpload::STARTING_OFFSET, start.starting_offset);
                writer.finish()
            }
            Message::FirmwarePacket(packet) => {
                let mut writer = FieldWriter::new(opcode);
                writer
                    .put_u32(&FirmwarePacket::BYTE_OFFSET, packet.byte_offset)
                    .put_u8(&FirmwarePacket::SIZE, packet.packet.len() as u8)
                    .put_slice(&FirmwarePacket::PACKET, &packet.packet);
                writer.finish()
            }
            Message::Disconnect(disconnect) => {
                let mut writer = FieldWriter::new(opcode);
                writer
                    .put_u8(&VERSION, disconnect.version)
                    .put_u8(&Disconnect::REASON, disconnect.reason);
                writer.finish()
            }
            Message::CardKeyGroups(chunk) | Message::CancelledStaffCards(chunk) => {
                chunk.encode(opcode)
            }
            Message::FirmwareUploadComplete
            | Message::FirmwareUpdateCompleteAck
            | Message::Ack
            | Message::CardKeyGroupsUploadComplete
            | Message::CancelledStaffCardsUploadComplete
            | Message::ControlDataUpdateCompleteAck => FieldWriter::new(opcode).finish(),
        }
    }

    /// Selects the message type from the leading opcode byte and reads its
    /// fields. Bytes past the declared layout of fixed-size messages are
    /// ignored.
    pub fn decode(buf: &[u8]) -> Result<Message, CodecError> {
        let Some(&op) = buf.first() else {
            return Err(CodecError::Empty);
        };
        let message = match op {
            opcode::SEALED_FIRMWARE_UPDATE_REQUEST => {
                Message::SealedFirmwareUpdateRequest(Sealed::decode(buf, op)?)
            }
            opcode::FIRMWARE_UPDATE_REQUEST => {
                let reader = FieldReader::new(buf, op)?;
                Message::FirmwareUpdateRequest(FirmwareUpdateRequest {
                    version: reader.u8(&VERSION)?,
                    sealed_request: reader
                        .rest(&FirmwareUpdateRequest::SEALED_REQUEST)?
                        .to_vec(),
                })
            }
            opcode::START_FIRMWARE_UPLOAD => {
                let reader = FieldReader::new(buf, op)?;
                Message::StartFirmwareUpload(StartFirmwareUpload {
                    version: reader.u8(&VERSION)?,
                    starting_offset: reader.u32(&StartFirmwareUpload::STARTING_OFFSET)?,
                })
            }
            opcode::FIRMWARE_PACKET => {
                let reader = FieldReader::new(buf, op)?;
                let size = reader.u8(&FirmwarePacket::SIZE)? as usize;
                Message::FirmwarePacket(FirmwarePacket {
                    byte_offset: reader.u32(&FirmwarePacket::BYTE_OFFSET)?,
                    packet: reader.sized(&FirmwarePacket::PACKET, size)?.to_vec(),
                })
            }
            opcode::FIRMWARE_UPDATE_COMPLETE => {
                Message::FirmwareUpdateComplete(Sealed::decode(buf, op)?)
            }
            opcode::FIRMWARE_UPLOAD_COMPLETE => Message::FirmwareUploadComplete,
            opcode::FIRMWARE_UPDATE_COMPLETE_ACK => Message::FirmwareUpdateCompleteAck,
            opcode::DISCONNECT => {
                let reader = FieldReader::new(buf, op)?;
                Message::Disconnect(Disconnect {
                    version: reader.u8(&VERSION)?,
                    reason: reader.u8(&Disconnect::REASON)?,
                })
            }
            opcode::SEALED_CONTROL_DATA_UPDATE_REQUEST => {
                Message::SealedControlDataUpdateRequest(Sealed::decode(buf, op)?)
            }
            opcode::ACK => Message::Ack,
            opcode::CARD_KEY_GROUPS => Message::CardKeyGroups(Chunk::decode(buf, op)?),
            opcode::CARD_KEY_GROUPS_UPLOAD_COMPLETE => Message::CardKeyGroupsUploadComplete,
            opcode::CANCELLED_STAFF_CARDS => {
                Message::CancelledStaffCards(Chunk::decode(buf, op)?)
            }
            opcode::CANCELLED_STAFF_CARDS_UPLOAD_COMPLETE => {
                Message::CancelledStaffCardsUploadComplete
            }
            opcode::CONTROL_DATA_UPDATE_COMPLETE => {
                Message::ControlDataUpdateComplete(Sealed::decode(buf, op)?)
            }
            opcode::CONTROL_DATA_UPDATE_COMPLETE_ACK => Message::ControlDataUpdateCompleteAck,
            other => return Err(CodecError::UnknownOpcode(other)),
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_firmware_upload_reads_resume_offset() {
        let frame = [0x7B, 0x01, 0x10, 0x27, 0x00, 0x00];
        assert_eq!(
            Message::decode(&frame),
            Ok(Message::StartFirmwareUpload(StartFirmwareUpload {
                version: 1,
                starting_offset: 10_000,
            }))
        );
    }

    #[test]
    fn firmware_packet_layout() {
        let packet = FirmwarePacket::new(28, vec![0xDE, 0xAD, 0xBE]).unwrap();
        let frame = Message::FirmwarePacket(packet).encode();
        assert_eq!(frame, vec![0x7C, 28, 0, 0, 0, 3, 0xDE, 0xAD, 0xBE]);
    }

    #[test]
    fn firmware_packet_shorter_than_announced_is_truncated() {
        let frame = [0x7C, 0, 0, 0, 0, 4, 0xDE, 0xAD];
        assert!(matches!(
            Message::decode(&frame),
            Err(CodecError::Truncated { field: "packet", .. })
        ));
    }

    #[test]
    fn sealed_envelope_splits_iv_and_payload() {
        let mut frame = vec![0x86, 0x02];
        frame.extend(0u8..16);
        frame.extend([0xCA, 0xFE]);
        let Ok(Message::ControlDataUpdateComplete(sealed)) = Message::decode(&frame) else {
            panic!("expected control data update complete");
        };
        assert_eq!(sealed.version, 2);
        assert_eq!(sealed.iv[15], 15);
        assert_eq!(sealed.payload, vec![0xCA, 0xFE]);
    }

    #[test]
    fn sealed_envelope_without_full_iv_is_truncated() {
        assert!(matches!(
            Message::decode(&[0x7D, 0x01, 0x00]),
            Err(CodecError::Truncated { field: "iv", .. })
        ));
    }

    #[test]
    fn disconnect_reason() {
        assert_eq!(
            Message::decode(&[0x6B, 0x01, 0x0B]),
            Ok(Message::Disconnect(Disconnect {
                version: 1,
                reason: 0x0B
            }))
        );
    }

    #[test]
    fn unknown_opcode() {
        assert_eq!(
            Message::decode(&[0x01]),
            Err(CodecError::UnknownOpcode(0x01))
        );
    }

    #[test]
    fn oversized_chunk_is_rejected() {
        assert_eq!(
            Chunk::new(vec![0; 256]),
            Err(CodecError::PayloadTooLarge(256))
        );
        assert!(Chunk::new(vec![0; 255]).is_ok());
    }

    #[test]
    fn layouts_are_contiguous() {
        let layouts = [
            Sealed::LAYOUT,
            FirmwareUpdateRequest::LAYOUT,
            StartFirmwareUpload::LAYOUT,
            FirmwarePacket::LAYOUT,
            Disconnect::LAYOUT,
            Chunk::LAYOUT,
        ];
        for layout in layouts {
            for pair in layout.windows(2) {
                assert_eq!(pair[0].end(), pair[1].offset, "{:?}", pair);
            }
        }
    }
}
