//! Cloud interface ID to numeric CAN channel translation

use roadcast_core::manifest::InterfaceId;

pub type CanChannelId = u32;

pub const INVALID_CAN_CHANNEL_ID: CanChannelId = CanChannelId::MAX;

/// Maps the cloud's opaque CAN interface IDs to the dense numeric channel
/// IDs used as dictionary keys. Channels are numbered in registration order.
#[derive(Debug, Default)]
pub struct CanInterfaceIdTranslator {
    interfaces: Vec<InterfaceId>,
}

impl CanInterfaceIdTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an interface, returning its channel ID. Re-registering an
    /// interface returns the existing channel.
    pub fn add(&mut self, interface_id: impl Into<InterfaceId>) -> CanChannelId {
        let interface_id = interface_id.into();
        if let Some(existing) = self.channel_numeric_id(&interface_id) {
            return existing;
        }
        self.interfaces.push(interface_id);
        (self.interfaces.len() - 1) as CanChannelId
    }

    pub fn channel_numeric_id(&self, interface_id: &str) -> Option<CanChannelId> {
        self.interfaces
            .iter()
            .position(|id| id == interface_id)
            .map(|pos| pos as CanChannelId)
    }

    pub fn interface_id(&self, channel: CanChannelId) -> Option<&InterfaceId> {
        self.interfaces.get(channel as usize)
    }
}
