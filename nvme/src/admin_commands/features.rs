use bit_field::BitField;
use shared_derive::U8Enum;

use crate::generic_command::CommonCommand;

use super::CommandOpcode;

/// See: NVM Express Base Spec: Figure 317: Feature Identifiers
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, U8Enum)]
#[non_exhaustive]
pub enum FeatureIdentifier {
    VolatileWriteCache = 0x6,
    NumberOfQueues = 0x7,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum SetFeatureData {
    /// Requested queue counts, 1 based
    NumberOfQueues { sub_count: u16, comp_count: u16 },
    VolatileWriteCache { enable: bool },
}

impl SetFeatureData {
    pub fn identifier(&self) -> FeatureIdentifier {
        match self {
            SetFeatureData::NumberOfQueues { .. } => FeatureIdentifier::NumberOfQueues,
            SetFeatureData::VolatileWriteCache { .. } => FeatureIdentifier::VolatileWriteCache,
        }
    }
}

/// Create the [CommonCommand] data structure for a set features command
///
/// See: NVM Express Base Spec: 5.27
pub fn create_set_features_command(feature: SetFeatureData) -> CommonCommand {
    let mut command = CommonCommand::with_opcode(CommandOpcode::SetFeatures as u8);
    command
        .dword10
        .set_bits(0..=7, feature.identifier() as u32);

    match feature {
        SetFeatureData::NumberOfQueues {
            sub_count,
            comp_count,
        } => {
            assert!(sub_count > 0 && comp_count > 0);
            // the field is 0 based
            command.dword11.set_bits(0..=15, (sub_count - 1) as u32);
            command.dword11.set_bits(16..=31, (comp_count - 1) as u32);
        }
        SetFeatureData::VolatileWriteCache { enable } => {
            command.dword11.set_bit(0, enable);
        }
    };

    command
}

/// Create the [CommonCommand] data structure for a get features command
/// returning the current value
///
/// See: NVM Express Base Spec: 5.15
pub fn create_get_features_command(feature: FeatureIdentifier) -> CommonCommand {
    let mut command = CommonCommand::with_opcode(CommandOpcode::GetFeatures as u8);
    // SEL bits 8..=10 are 0: current value
    command.dword10.set_bits(0..=7, feature as u32);
    command
}

/// The queue counts allocated by the controller
///
/// Decoded from dword 0 of a [FeatureIdentifier::NumberOfQueues] completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NumberOfQueues {
    pub submission_queues: u16,
    pub completion_queues: u16,
}

impl NumberOfQueues {
    pub fn from_completion(dword0: u32) -> Self {
        // NSQA and NCQA are 0 based
        Self {
            submission_queues: (dword0.get_bits(0..=15) as u16).saturating_add(1),
            completion_queues: (dword0.get_bits(16..=31) as u16).saturating_add(1),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn number_of_queues_is_zero_based() {
        let command = create_set_features_command(SetFeatureData::NumberOfQueues {
            sub_count: 4,
            comp_count: 2,
        });
        assert_eq!(command.opcode(), 0x9);
        assert_eq!(command.command_dwords()[0], 0x7);
        assert_eq!(command.command_dwords()[1], 0x0001_0003);

        assert_eq!(
            NumberOfQueues::from_completion(0x0001_0003),
            NumberOfQueues {
                submission_queues: 4,
                completion_queues: 2
            }
        );
    }

    #[test]
    fn volatile_write_cache() {
        let command =
            create_set_features_command(SetFeatureData::VolatileWriteCache { enable: true });
        assert_eq!(command.command_dwords()[..2], [0x6, 0x1]);

        let command = create_get_features_command(FeatureIdentifier::VolatileWriteCache);
        assert_eq!(command.opcode(), 0xa);
        assert_eq!(command.command_dwords()[0], 0x6);
    }
}
