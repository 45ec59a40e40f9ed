use std::time::Duration;

use anyhow::bail;

use crate::protocol::dataproto::DataProtoHeader;
use crate::protocol::packetproto::PacketProtoHeader;
use crate::protocol::scproto::PeerId;

#[derive(Debug, Clone)]
pub struct DataProtoConfig {
    /// id of this node
    pub peer_id: PeerId,
    /// maximum payload of a DataProto frame, i.e. the MTU of the local device
    pub frame_mtu: usize,

    /// egress silence after which a keepalive is sent
    pub keepalive_interval: Duration,
    /// ingress silence after which the peer is considered not to receive our packets
    pub keepalive_tolerance: Duration,

    pub relay_flow_inactivity: Duration,
    /// packets buffered per relay flow
    pub relay_flow_buffer_size: usize,
    /// packets buffered per local flow
    pub local_flow_buffer_size: usize,
}

impl Default for DataProtoConfig {
    fn default() -> Self {
        DataProtoConfig::default_config()
    }
}

impl DataProtoConfig {
    pub fn default_config() -> DataProtoConfig {
        DataProtoConfig {
            peer_id: 0,
            frame_mtu: 1500,
            keepalive_interval: Duration::from_secs(10),
            keepalive_tolerance: Duration::from_secs(20),
            relay_flow_inactivity: Duration::from_secs(30),
            relay_flow_buffer_size: 32,
            local_flow_buffer_size: 32,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.frame_mtu == 0 {
            bail!("frame MTU must be positive");
        }
        if self.packet_mtu() > PacketProtoHeader::MAX_PAYLOAD {
            bail!("frame MTU {} plus DataProto overhead exceeds the PacketProto maximum of {}", self.frame_mtu, PacketProtoHeader::MAX_PAYLOAD);
        }
        if self.keepalive_interval.is_zero() || self.keepalive_tolerance.is_zero() || self.relay_flow_inactivity.is_zero() {
            bail!("keepalive and inactivity intervals must be positive");
        }
        if self.keepalive_tolerance <= self.keepalive_interval {
            bail!("keepalive tolerance {:?} must exceed the keepalive interval {:?}", self.keepalive_tolerance, self.keepalive_interval);
        }
        if self.relay_flow_buffer_size == 0 || self.local_flow_buffer_size == 0 {
            bail!("flow buffer sizes must be positive");
        }
        Ok(())
    }

    /// MTU of an encoded frame: payload plus the largest possible header
    pub fn packet_mtu(&self) -> usize {
        self.frame_mtu + DataProtoHeader::MAX_OVERHEAD
    }

    pub(crate) fn keepalive_interval_ms(&self) -> u64 {
        self.keepalive_interval.as_millis() as u64
    }

    pub(crate) fn keepalive_tolerance_ms(&self) -> u64 {
        self.keepalive_tolerance.as_millis() as u64
    }

    pub(crate) fn relay_flow_inactivity_ms(&self) -> u64 {
        self.relay_flow_inactivity.as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        let config = DataProtoConfig::default_config();
        config.validate().unwrap();
        assert_eq!(config.packet_mtu(), 1507);
    }

    #[rstest]
    #[case::zero_mtu(|c: &mut DataProtoConfig| c.frame_mtu = 0)]
    #[case::mtu_too_large(|c: &mut DataProtoConfig| c.frame_mtu = 65535)]
    #[case::zero_interval(|c: &mut DataProtoConfig| c.keepalive_interval = Duration::ZERO)]
    #[case::tolerance_not_above_interval(|c: &mut DataProtoConfig| c.keepalive_tolerance = c.keepalive_interval)]
    #[case::zero_inactivity(|c: &mut DataProtoConfig| c.relay_flow_inactivity = Duration::ZERO)]
    #[case::zero_relay_buffer(|c: &mut DataProtoConfig| c.relay_flow_buffer_size = 0)]
    #[case::zero_local_buffer(|c: &mut DataProtoConfig| c.local_flow_buffer_size = 0)]
    fn test_invalid(#[case] modify: fn(&mut DataProtoConfig)) {
        let mut config = DataProtoConfig::default_config();
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_largest_mtu() {
        let mut config = DataProtoConfig::default_config();
        config.frame_mtu = PacketProtoHeader::MAX_PAYLOAD - DataProtoHeader::MAX_OVERHEAD;
        config.validate().unwrap();
    }
}
