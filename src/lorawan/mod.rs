//! LoRaWAN field decoding
//!
//! Only the DevAddr field and the NetID derived from it are decoded; the
//! bridge never interprets the rest of the MAC layer.

pub mod phy_payload;

pub use phy_payload::{
    extract_device_address, net_id_of, resolve_net_id, DeviceAddress, NetworkIdentifier,
    PacketError, FOREIGN_NET_ID,
};
