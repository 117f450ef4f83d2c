use sctp::stream::ReliabilityType;

use super::{reliability_params, Config};
use crate::message::message_channel_open::ChannelType;

#[test]
fn test_reliability_mapping() {
    assert_eq!(
        reliability_params(ChannelType::Reliable),
        (false, ReliabilityType::Reliable)
    );
    assert_eq!(
        reliability_params(ChannelType::ReliableUnordered),
        (true, ReliabilityType::Reliable)
    );
    assert_eq!(
        reliability_params(ChannelType::PartialReliableRexmitUnordered),
        (true, ReliabilityType::Rexmit)
    );
    assert_eq!(
        reliability_params(ChannelType::PartialReliableTimed),
        (false, ReliabilityType::Timed)
    );
}

#[test]
fn test_config_with_reliability() {
    let config = Config::default().with_reliability(true, None, None);
    assert_eq!(config.channel_type, ChannelType::Reliable);
    assert_eq!(config.reliability_parameter, 0);

    let config = Config::default().with_reliability(false, Some(5), None);
    assert_eq!(
        config.channel_type,
        ChannelType::PartialReliableRexmitUnordered
    );
    assert_eq!(config.reliability_parameter, 5);

    let config = Config::default().with_reliability(true, None, Some(1500));
    assert_eq!(config.channel_type, ChannelType::PartialReliableTimed);
    assert_eq!(config.reliability_parameter, 1500);

    // retransmit count wins when both are given
    let config = Config::default().with_reliability(true, Some(2), Some(9));
    assert_eq!(config.channel_type, ChannelType::PartialReliableRexmit);
    assert_eq!(config.reliability_parameter, 2);
}

#[test]
fn test_channel_type_unordered_bit() {
    assert!(!ChannelType::Reliable.unordered());
    assert!(ChannelType::ReliableUnordered.unordered());
    assert!(ChannelType::PartialReliableTimedUnordered.unordered());
}
