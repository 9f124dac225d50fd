use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Largest value representable by the 4-byte remaining length field.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),
    #[error("Invalid flags {flags:#06b} for {packet_type:?}")]
    InvalidFlags { packet_type: PacketType, flags: u8 },
    #[error("Invalid remaining length")]
    InvalidRemainingLength,
    #[error("Packet of {size} bytes exceeds limit of {max} bytes")]
    PacketTooLarge { size: usize, max: usize },
    #[error("Incomplete packet")]
    IncompletePacket,
    #[error("Invalid UTF-8 string")]
    InvalidUtf8,
    #[error("Invalid QoS: {0}")]
    InvalidQoS(u8),
    #[error("Malformed packet: {0}")]
    Malformed(&'static str),
    #[error("Unexpected {0:?} packet")]
    Unexpected(PacketType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::ConnAck),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::PubAck),
            5 => Ok(PacketType::PubRec),
            6 => Ok(PacketType::PubRel),
            7 => Ok(PacketType::PubComp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::SubAck),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::UnsubAck),
            12 => Ok(PacketType::PingReq),
            13 => Ok(PacketType::PingResp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(PacketError::InvalidPacketType(value)),
        }
    }
}

impl PacketType {
    /// Fixed header flags every packet except PUBLISH must carry.
    fn required_flags(self) -> u8 {
        match self {
            PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => 0x02,
            _ => 0x00,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(PacketError::InvalidQoS(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(ConnectPacket),
    ConnAck(ConnAckPacket),
    Publish(PublishPacket),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(SubscribePacket),
    SubAck(SubAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectPacket {
    pub protocol_name: String,
    pub protocol_level: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnAckPacket {
    pub session_present: bool,
    pub return_code: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishPacket {
    pub topic: String,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub topic_filters: Vec<(String, QoS)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubAckPacket {
    pub packet_id: u16,
    pub return_codes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub topic_filters: Vec<String>,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// Decodes one complete packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched when more bytes are
    /// needed, so it is safe to call again after every read. A
    /// `max_packet_size` of 0 disables the size check.
    pub fn decode(buf: &mut BytesMut, max_packet_size: usize) -> Result<Option<Packet>, PacketError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let (remaining_length, length_bytes) = match decode_remaining_length(&buf[1..])? {
            Some(decoded) => decoded,
            None => return Ok(None),
        };

        let total = 1 + length_bytes + remaining_length;
        if max_packet_size > 0 && total > max_packet_size {
            return Err(PacketError::PacketTooLarge {
                size: total,
                max: max_packet_size,
            });
        }
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        let first_byte = buf[0];
        let mut body = buf.split_to(total).freeze();
        body.advance(1 + length_bytes);

        let packet_type = PacketType::try_from(first_byte >> 4)?;
        let flags = first_byte & 0x0F;
        if packet_type != PacketType::Publish && flags != packet_type.required_flags() {
            return Err(PacketError::InvalidFlags { packet_type, flags });
        }

        let packet = match packet_type {
            PacketType::Connect => Packet::Connect(decode_connect(&mut body)?),
            PacketType::ConnAck => Packet::ConnAck(decode_connack(&mut body)?),
            PacketType::Publish => Packet::Publish(decode_publish(&mut body, flags)?),
            PacketType::PubAck => Packet::PubAck(decode_packet_id(&mut body)?),
            PacketType::PubRec => Packet::PubRec(decode_packet_id(&mut body)?),
            PacketType::PubRel => Packet::PubRel(decode_packet_id(&mut body)?),
            PacketType::PubComp => Packet::PubComp(decode_packet_id(&mut body)?),
            PacketType::Subscribe => Packet::Subscribe(decode_subscribe(&mut body)?),
            PacketType::SubAck => Packet::SubAck(decode_suback(&mut body)?),
            PacketType::Unsubscribe => Packet::Unsubscribe(decode_unsubscribe(&mut body)?),
            PacketType::UnsubAck => Packet::UnsubAck(decode_packet_id(&mut body)?),
            PacketType::PingReq => Packet::PingReq,
            PacketType::PingResp => Packet::PingResp,
            PacketType::Disconnect => Packet::Disconnect,
        };

        if body.has_remaining() {
            return Err(PacketError::Malformed("trailing bytes after packet body"));
        }

        Ok(Some(packet))
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Packet::Connect(packet) => encode_connect(packet, buf),
            Packet::ConnAck(packet) => encode_connack(packet, buf),
            Packet::Publish(packet) => encode_publish(packet, buf),
            Packet::PubAck(packet_id) => encode_packet_id(0x40, *packet_id, buf),
            Packet::PubRec(packet_id) => encode_packet_id(0x50, *packet_id, buf),
            Packet::PubRel(packet_id) => encode_packet_id(0x62, *packet_id, buf),
            Packet::PubComp(packet_id) => encode_packet_id(0x70, *packet_id, buf),
            Packet::Subscribe(packet) => encode_subscribe(packet, buf),
            Packet::SubAck(packet) => encode_suback(packet, buf),
            Packet::Unsubscribe(packet) => encode_unsubscribe(packet, buf),
            Packet::UnsubAck(packet_id) => encode_packet_id(0xB0, *packet_id, buf),
            Packet::PingReq => encode_empty(0xC0, buf),
            Packet::PingResp => encode_empty(0xD0, buf),
            Packet::Disconnect => encode_empty(0xE0, buf),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Returns `(value, bytes consumed)`, or `None` if the field is truncated.
fn decode_remaining_length(bytes: &[u8]) -> Result<Option<(usize, usize)>, PacketError> {
    let mut multiplier = 1usize;
    let mut value = 0usize;

    for (index, byte) in bytes.iter().enumerate() {
        if index >= 4 {
            return Err(PacketError::InvalidRemainingLength);
        }

        value += (byte & 0x7F) as usize * multiplier;
        if (byte & 0x80) == 0 {
            return Ok(Some((value, index + 1)));
        }

        multiplier *= 128;
    }

    if bytes.len() >= 4 {
        return Err(PacketError::InvalidRemainingLength);
    }
    Ok(None)
}

fn encode_remaining_length(length: usize, buf: &mut BytesMut) {
    let mut remaining = length;
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if remaining == 0 {
            break;
        }
    }
}

fn read_u8(body: &mut Bytes) -> Result<u8, PacketError> {
    if body.remaining() < 1 {
        return Err(PacketError::IncompletePacket);
    }
    Ok(body.get_u8())
}

fn read_u16(body: &mut Bytes) -> Result<u16, PacketError> {
    if body.remaining() < 2 {
        return Err(PacketError::IncompletePacket);
    }
    Ok(body.get_u16())
}

fn read_binary(body: &mut Bytes) -> Result<Bytes, PacketError> {
    let len = read_u16(body)? as usize;
    if body.remaining() < len {
        return Err(PacketError::IncompletePacket);
    }
    Ok(body.split_to(len))
}

fn read_string(body: &mut Bytes) -> Result<String, PacketError> {
    let bytes = read_binary(body)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| PacketError::InvalidUtf8)
}

fn encode_string(s: &str, buf: &mut BytesMut) {
    encode_binary(s.as_bytes(), buf);
}

fn encode_binary(bytes: &[u8], buf: &mut BytesMut) {
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

fn decode_packet_id(body: &mut Bytes) -> Result<u16, PacketError> {
    let packet_id = read_u16(body)?;
    if packet_id == 0 {
        return Err(PacketError::Malformed("packet identifier must be non-zero"));
    }
    Ok(packet_id)
}

fn decode_connect(body: &mut Bytes) -> Result<ConnectPacket, PacketError> {
    let protocol_name = read_string(body)?;
    let protocol_level = read_u8(body)?;
    let connect_flags = read_u8(body)?;
    let keep_alive = read_u16(body)?;

    if connect_flags & 0x01 != 0 {
        return Err(PacketError::Malformed("reserved connect flag is set"));
    }

    let will_flag = connect_flags & 0x04 != 0;
    let will_qos = (connect_flags >> 3) & 0x03;
    let will_retain = connect_flags & 0x20 != 0;
    let password_flag = connect_flags & 0x40 != 0;
    let username_flag = connect_flags & 0x80 != 0;

    if !will_flag && (will_qos != 0 || will_retain) {
        return Err(PacketError::Malformed("will flags set without will"));
    }
    if password_flag && !username_flag {
        return Err(PacketError::Malformed("password without username"));
    }

    let client_id = read_string(body)?;

    let will = if will_flag {
        let topic = read_string(body)?;
        let payload = read_binary(body)?;
        Some(LastWill {
            topic,
            payload,
            qos: QoS::try_from(will_qos)?,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        Some(read_string(body)?)
    } else {
        None
    };
    let password = if password_flag {
        Some(read_binary(body)?)
    } else {
        None
    };

    Ok(ConnectPacket {
        protocol_name,
        protocol_level,
        clean_session: (connect_flags & 0x02) != 0,
        keep_alive,
        client_id,
        will,
        username,
        password,
    })
}

fn decode_connack(body: &mut Bytes) -> Result<ConnAckPacket, PacketError> {
    let ack_flags = read_u8(body)?;
    let return_code = read_u8(body)?;
    Ok(ConnAckPacket {
        session_present: ack_flags & 0x01 != 0,
        return_code,
    })
}

fn decode_publish(body: &mut Bytes, flags: u8) -> Result<PublishPacket, PacketError> {
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let dup = (flags & 0x08) != 0;
    if qos == QoS::AtMostOnce && dup {
        return Err(PacketError::Malformed("DUP flag set on QoS 0 publish"));
    }

    let topic = read_string(body)?;
    let packet_id = if qos == QoS::AtMostOnce {
        None
    } else {
        Some(decode_packet_id(body)?)
    };

    let payload = body.split_to(body.remaining());

    Ok(PublishPacket {
        topic,
        packet_id,
        payload,
        qos,
        retain: (flags & 0x01) != 0,
        dup,
    })
}

fn decode_subscribe(body: &mut Bytes) -> Result<SubscribePacket, PacketError> {
    let packet_id = decode_packet_id(body)?;
    let mut topic_filters = Vec::new();

    while body.has_remaining() {
        let filter = read_string(body)?;
        let options = read_u8(body)?;
        if options & 0xFC != 0 {
            return Err(PacketError::Malformed("reserved subscription option bits set"));
        }
        topic_filters.push((filter, QoS::try_from(options)?));
    }

    if topic_filters.is_empty() {
        return Err(PacketError::Malformed("SUBSCRIBE without topic filters"));
    }

    Ok(SubscribePacket {
        packet_id,
        topic_filters,
    })
}

fn decode_suback(body: &mut Bytes) -> Result<SubAckPacket, PacketError> {
    let packet_id = decode_packet_id(body)?;
    let return_codes = body.split_to(body.remaining()).to_vec();
    Ok(SubAckPacket {
        packet_id,
        return_codes,
    })
}

fn decode_unsubscribe(body: &mut Bytes) -> Result<UnsubscribePacket, PacketError> {
    let packet_id = decode_packet_id(body)?;
    let mut topic_filters = Vec::new();

    while body.has_remaining() {
        topic_filters.push(read_string(body)?);
    }

    if topic_filters.is_empty() {
        return Err(PacketError::Malformed("UNSUBSCRIBE without topic filters"));
    }

    Ok(UnsubscribePacket {
        packet_id,
        topic_filters,
    })
}

fn encode_connect(packet: &ConnectPacket, buf: &mut BytesMut) {
    let mut flags = 0u8;
    if packet.clean_session {
        flags |= 0x02;
    }

    let mut remaining_length = 2 + packet.protocol_name.len() + 4 + 2 + packet.client_id.len();
    if let Some(will) = &packet.will {
        flags |= 0x04 | ((will.qos as u8) << 3);
        if will.retain {
            flags |= 0x20;
        }
        remaining_length += 2 + will.topic.len() + 2 + will.payload.len();
    }
    if let Some(username) = &packet.username {
        flags |= 0x80;
        remaining_length += 2 + username.len();
    }
    if let Some(password) = &packet.password {
        flags |= 0x40;
        remaining_length += 2 + password.len();
    }

    buf.put_u8(0x10); // CONNECT packet type
    encode_remaining_length(remaining_length, buf);
    encode_string(&packet.protocol_name, buf);
    buf.put_u8(packet.protocol_level);
    buf.put_u8(flags);
    buf.put_u16(packet.keep_alive);
    encode_string(&packet.client_id, buf);
    if let Some(will) = &packet.will {
        encode_string(&will.topic, buf);
        encode_binary(&will.payload, buf);
    }
    if let Some(username) = &packet.username {
        encode_string(username, buf);
    }
    if let Some(password) = &packet.password {
        encode_binary(password, buf);
    }
}

fn encode_connack(packet: &ConnAckPacket, buf: &mut BytesMut) {
    buf.put_u8(0x20); // CONNACK packet type
    buf.put_u8(2); // Remaining length
    buf.put_u8(if packet.session_present { 0x01 } else { 0x00 });
    buf.put_u8(packet.return_code);
}

fn encode_publish(packet: &PublishPacket, buf: &mut BytesMut) {
    let mut flags = 0x30; // PUBLISH packet type
    if packet.dup {
        flags |= 0x08;
    }
    flags |= (packet.qos as u8) << 1;
    if packet.retain {
        flags |= 0x01;
    }

    buf.put_u8(flags);

    let mut remaining_length = 2 + packet.topic.len(); // Topic length
    if packet.packet_id.is_some() {
        remaining_length += 2; // Packet ID
    }
    remaining_length += packet.payload.len(); // Payload

    encode_remaining_length(remaining_length, buf);
    encode_string(&packet.topic, buf);

    if let Some(packet_id) = packet.packet_id {
        buf.put_u16(packet_id);
    }

    buf.put_slice(&packet.payload);
}

fn encode_packet_id(first_byte: u8, packet_id: u16, buf: &mut BytesMut) {
    buf.put_u8(first_byte);
    buf.put_u8(2); // Remaining length
    buf.put_u16(packet_id);
}

fn encode_subscribe(packet: &SubscribePacket, buf: &mut BytesMut) {
    let remaining_length = 2 + packet
        .topic_filters
        .iter()
        .map(|(filter, _)| 2 + filter.len() + 1)
        .sum::<usize>();

    buf.put_u8(0x82); // SUBSCRIBE packet type with reserved flags
    encode_remaining_length(remaining_length, buf);
    buf.put_u16(packet.packet_id);
    for (filter, qos) in &packet.topic_filters {
        encode_string(filter, buf);
        buf.put_u8(*qos as u8);
    }
}

fn encode_suback(packet: &SubAckPacket, buf: &mut BytesMut) {
    buf.put_u8(0x90); // SUBACK packet type
    encode_remaining_length(2 + packet.return_codes.len(), buf);
    buf.put_u16(packet.packet_id);
    for &code in &packet.return_codes {
        buf.put_u8(code);
    }
}

fn encode_unsubscribe(packet: &UnsubscribePacket, buf: &mut BytesMut) {
    let remaining_length = 2 + packet
        .topic_filters
        .iter()
        .map(|filter| 2 + filter.len())
        .sum::<usize>();

    buf.put_u8(0xA2); // UNSUBSCRIBE packet type with reserved flags
    encode_remaining_length(remaining_length, buf);
    buf.put_u16(packet.packet_id);
    for filter in &packet.topic_filters {
        encode_string(filter, buf);
    }
}

fn encode_empty(first_byte: u8, buf: &mut BytesMut) {
    buf.put_u8(first_byte);
    buf.put_u8(0); // Remaining length
}
