//! MPEG-TS packet parsing.
//!
//! 188-byte transport packets are the delivery unit of the software
//! source. Only the header fields needed for section reassembly are
//! decoded; adaptation fields are skipped, not interpreted.

/// TS packet size in bytes.
pub const TS_PACKET_SIZE: usize = 188;

/// TS sync byte (0x47).
pub const SYNC_BYTE: u8 = 0x47;

/// Parsed TS packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsHeader {
    /// Transport error indicator.
    pub transport_error: bool,
    /// Payload unit start indicator.
    pub payload_unit_start: bool,
    /// Packet Identifier (13 bits).
    pub pid: u16,
    /// Transport scrambling control (2 bits).
    pub scrambling_control: u8,
    /// Adaptation field control (2 bits).
    pub adaptation_field_control: u8,
    /// Continuity counter (4 bits).
    pub continuity_counter: u8,
}

impl TsHeader {
    /// Check if the packet carries an adaptation field.
    pub fn has_adaptation_field(&self) -> bool {
        self.adaptation_field_control & 0x02 != 0
    }

    /// Check if the packet carries payload bytes.
    pub fn has_payload(&self) -> bool {
        self.adaptation_field_control & 0x01 != 0
    }

    /// Check if the packet payload is scrambled at transport level.
    pub fn is_scrambled(&self) -> bool {
        self.scrambling_control != 0
    }
}

/// A parsed TS packet with its payload slice.
#[derive(Debug, Clone)]
pub struct TsPacket<'a> {
    /// Packet header.
    pub header: TsHeader,
    /// Payload data (empty when the adaptation field fills the packet).
    pub payload: &'a [u8],
}

impl<'a> TsPacket<'a> {
    /// Parse a TS packet from raw bytes.
    ///
    /// `data` must hold at least one full packet starting at the sync
    /// byte.
    pub fn parse(data: &'a [u8]) -> Result<Self, &'static str> {
        if data.len() < TS_PACKET_SIZE {
            return Err("packet too short");
        }
        if data[0] != SYNC_BYTE {
            return Err("invalid sync byte");
        }

        let header = TsHeader {
            transport_error: data[1] & 0x80 != 0,
            payload_unit_start: data[1] & 0x40 != 0,
            pid: ((data[1] as u16 & 0x1F) << 8) | data[2] as u16,
            scrambling_control: (data[3] >> 6) & 0x03,
            adaptation_field_control: (data[3] >> 4) & 0x03,
            continuity_counter: data[3] & 0x0F,
        };

        let mut offset = 4;
        if header.has_adaptation_field() {
            // adaptation_field_length byte plus the field itself
            offset = 5 + data[4] as usize;
        }

        let payload = if header.has_payload() && offset < TS_PACKET_SIZE {
            &data[offset..TS_PACKET_SIZE]
        } else {
            &[]
        };

        Ok(TsPacket { header, payload })
    }
}

/// Iterator over TS packets in a byte buffer, resynchronizing on lost
/// sync bytes.
pub struct TsPacketIterator<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> TsPacketIterator<'a> {
    /// Create a new iterator, skipping leading garbage up to the first
    /// sync byte.
    pub fn new(data: &'a [u8]) -> Self {
        let mut offset = 0;
        while offset < data.len() && data[offset] != SYNC_BYTE {
            offset += 1;
        }
        Self { data, offset }
    }

    /// Number of bytes consumed so far.
    pub fn consumed(&self) -> usize {
        self.offset
    }

    fn resync(&mut self) {
        self.offset += 1;
        while self.offset < self.data.len() && self.data[self.offset] != SYNC_BYTE {
            self.offset += 1;
        }
    }
}

impl<'a> Iterator for TsPacketIterator<'a> {
    type Item = TsPacket<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.offset + TS_PACKET_SIZE <= self.data.len() {
            if self.data[self.offset] != SYNC_BYTE {
                self.resync();
                continue;
            }
            match TsPacket::parse(&self.data[self.offset..]) {
                Ok(packet) => {
                    self.offset += TS_PACKET_SIZE;
                    return Some(packet);
                }
                Err(_) => self.resync(),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header_fields() {
        let mut packet = [0u8; TS_PACKET_SIZE];
        packet[0] = SYNC_BYTE;
        packet[1] = 0x40; // payload_unit_start, PID high = 0
        packet[2] = 0x20; // PID low = 0x20
        packet[3] = 0x15; // has payload, cc = 5

        let parsed = TsPacket::parse(&packet).unwrap();
        assert_eq!(parsed.header.pid, 0x0020);
        assert!(parsed.header.payload_unit_start);
        assert!(!parsed.header.transport_error);
        assert_eq!(parsed.header.continuity_counter, 5);
        assert_eq!(parsed.payload.len(), TS_PACKET_SIZE - 4);
    }

    #[test]
    fn test_adaptation_field_skip() {
        let mut packet = [0u8; TS_PACKET_SIZE];
        packet[0] = SYNC_BYTE;
        packet[1] = 0x00;
        packet[2] = 0x21;
        packet[3] = 0x30; // adaptation field + payload
        packet[4] = 10; // adaptation_field_length

        let parsed = TsPacket::parse(&packet).unwrap();
        assert_eq!(parsed.payload.len(), TS_PACKET_SIZE - 4 - 1 - 10);
    }

    #[test]
    fn test_invalid_sync_byte() {
        let packet = [0u8; TS_PACKET_SIZE];
        assert!(TsPacket::parse(&packet).is_err());
    }

    #[test]
    fn test_iterator_resync() {
        let mut buf = vec![0xFFu8; 3]; // leading garbage
        let mut packet = [0u8; TS_PACKET_SIZE];
        packet[0] = SYNC_BYTE;
        packet[1] = 0x1F;
        packet[2] = 0xFF; // null PID
        packet[3] = 0x10;
        buf.extend_from_slice(&packet);
        buf.extend_from_slice(&packet);

        let packets: Vec<_> = TsPacketIterator::new(&buf).collect();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].header.pid, 0x1FFF);
    }
}
