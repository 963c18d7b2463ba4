// Global valve numbers (1-based, left to right along the bar) resolved to the
// module/output pair that drives them. Built once from the enumerated topology.

use crate::core_modules::hardware::ModuleInfo;

/// Where a global channel lives on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputAddress {
    pub module: usize,
    pub channel: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelMap {
    /// Address of global channel `n` at index `n - 1`.
    addresses: Vec<OutputAddress>,
}

impl ChannelMap {
    /// Numbers every output of every module consecutively, in bus order.
    pub fn from_topology(modules: &[ModuleInfo]) -> Self {
        let addresses = modules
            .iter()
            .enumerate()
            .flat_map(|(module, info)| {
                (0..info.output_channels).map(move |channel| OutputAddress { module, channel })
            })
            .collect();
        Self { addresses }
    }

    pub fn channel_count(&self) -> u16 {
        self.addresses.len().min(u16::MAX as usize) as u16
    }

    pub fn resolve(&self, channel: u16) -> Option<OutputAddress> {
        let index = usize::from(channel).checked_sub(1)?;
        self.addresses.get(index).copied()
    }

    pub fn contains(&self, channel: u16) -> bool {
        self.resolve(channel).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(output_channels: usize) -> ModuleInfo {
        ModuleInfo {
            name: "do".to_string(),
            output_channels,
        }
    }

    #[test]
    fn numbers_channels_across_modules() {
        let map = ChannelMap::from_topology(&[module(16), module(8), module(16)]);
        assert_eq!(map.channel_count(), 40);
        assert_eq!(map.resolve(1), Some(OutputAddress { module: 0, channel: 0 }));
        assert_eq!(map.resolve(16), Some(OutputAddress { module: 0, channel: 15 }));
        assert_eq!(map.resolve(17), Some(OutputAddress { module: 1, channel: 0 }));
        assert_eq!(map.resolve(40), Some(OutputAddress { module: 2, channel: 15 }));
    }

    #[test]
    fn zero_and_overflow_do_not_resolve() {
        let map = ChannelMap::from_topology(&[module(4)]);
        assert!(!map.contains(0));
        assert!(!map.contains(5));
        assert!(ChannelMap::from_topology(&[]).resolve(1).is_none());
    }
}
