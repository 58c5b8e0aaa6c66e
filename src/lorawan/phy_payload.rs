//! Device address extraction and NetID resolution for LoRaWAN PHY payloads
//!
//! Pure functions only. The PHY payload layout is `MHDR (1) | DevAddr (4, LE) | ...`;
//! nothing beyond the DevAddr field is decoded here.

use std::fmt;
use thiserror::Error;

/// Offset of the first DevAddr byte inside a PHY payload (right after MHDR)
const DEV_ADDR_OFFSET: usize = 1;
/// DevAddr width in bytes
const DEV_ADDR_LEN: usize = 4;

/// NetID reserved for traffic that does not belong to the home network
pub const FOREIGN_NET_ID: NetworkIdentifier = NetworkIdentifier(0x01);

/// Errors raised while decoding PHY payload fields
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("Malformed packet: PHY payload has {len} bytes, at least 5 required")]
    MalformedPacket { len: usize },
    #[error("Invalid device address: expected 4 bytes, got {len}")]
    InvalidAddress { len: usize },
}

/// 4-byte device address in big-endian (network display) order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddress([u8; DEV_ADDR_LEN]);

impl DeviceAddress {
    pub fn as_bytes(&self) -> &[u8; DEV_ADDR_LEN] {
        &self.0
    }
}

impl TryFrom<&[u8]> for DeviceAddress {
    type Error = PacketError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let array: [u8; DEV_ADDR_LEN] = bytes
            .try_into()
            .map_err(|_| PacketError::InvalidAddress { len: bytes.len() })?;
        Ok(Self(array))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// 7-bit network identifier derived from a device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkIdentifier(pub u8);

impl NetworkIdentifier {
    pub fn value(self) -> u8 {
        self.0
    }
}

impl fmt::Display for NetworkIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.0)
    }
}

/// Extract the DevAddr from a raw PHY payload, converting it from the
/// little-endian wire order to big-endian.
pub fn extract_device_address(phy_payload: &[u8]) -> Result<DeviceAddress, PacketError> {
    let field = phy_payload
        .get(DEV_ADDR_OFFSET..DEV_ADDR_OFFSET + DEV_ADDR_LEN)
        .ok_or(PacketError::MalformedPacket {
            len: phy_payload.len(),
        })?;

    let mut address = [0u8; DEV_ADDR_LEN];
    address.copy_from_slice(field);
    address.reverse();
    Ok(DeviceAddress(address))
}

/// Resolve the NetID carried in the top 7 bits of the first address byte.
///
/// Accepts raw bytes so callers holding an unvalidated slice get
/// `InvalidAddress` instead of a panic.
pub fn resolve_net_id(address: &[u8]) -> Result<NetworkIdentifier, PacketError> {
    let address = DeviceAddress::try_from(address)?;
    Ok(net_id_of(&address))
}

/// Infallible variant for an already validated address
pub fn net_id_of(address: &DeviceAddress) -> NetworkIdentifier {
    NetworkIdentifier(address.0[0] >> 1)
}
