use uuid::Uuid;

#[derive(Debug, Ord, Eq, PartialEq, PartialOrd, Clone)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub service: Uuid,
    pub properties: Vec<CharacteristicProperty>,
}

impl Characteristic {
    pub fn new(uuid: Uuid, service: Uuid, properties: Vec<CharacteristicProperty>) -> Self {
        Characteristic {
            uuid,
            service,
            properties,
        }
    }

    pub fn has(&self, property: CharacteristicProperty) -> bool {
        self.properties.contains(&property)
    }

    /// Acknowledged writes when the characteristic supports them, otherwise
    /// unacknowledged ones. `None` when it is not writable at all.
    pub fn preferred_write_type(&self) -> Option<CharacteristicWriteType> {
        if self.has(CharacteristicProperty::Write) {
            Some(CharacteristicWriteType::WriteWithResponse)
        } else if self.has(CharacteristicProperty::WriteWithoutResponse) {
            Some(CharacteristicWriteType::WriteWithoutResponse)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialOrd, Ord, Eq, PartialEq)]
pub enum CharacteristicProperty {
    Broadcast,
    Read,
    WriteWithoutResponse,
    Write,
    AuthenticatedSignedWrites,
    Notify,
    Indicate,
    ExtendedProperties,
}

#[derive(Debug, Clone, Copy, PartialOrd, Ord, Eq, PartialEq)]
pub enum CharacteristicWriteType {
    WriteWithoutResponse,
    WriteWithResponse,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_type_follows_properties() {
        let both = Characteristic::new(
            Uuid::nil(),
            Uuid::nil(),
            vec![
                CharacteristicProperty::WriteWithoutResponse,
                CharacteristicProperty::Write,
            ],
        );
        assert_eq!(
            both.preferred_write_type(),
            Some(CharacteristicWriteType::WriteWithResponse)
        );

        let unacked = Characteristic::new(
            Uuid::nil(),
            Uuid::nil(),
            vec![CharacteristicProperty::WriteWithoutResponse],
        );
        assert_eq!(
            unacked.preferred_write_type(),
            Some(CharacteristicWriteType::WriteWithoutResponse)
        );

        let read_only =
            Characteristic::new(Uuid::nil(), Uuid::nil(), vec![CharacteristicProperty::Read]);
        assert_eq!(read_only.preferred_write_type(), None);
    }
}
