pub mod packet;
pub mod v3;

pub use packet::{
    ConnAckPacket, ConnectPacket, LastWill, Packet, PacketError, PacketType, PublishPacket, QoS,
    SubAckPacket, SubscribePacket, UnsubscribePacket, MAX_REMAINING_LENGTH,
};
