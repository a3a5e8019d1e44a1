use crate::{Channel, NetCheck, NetGuid, MAX_CHANNELS};

/// Energy reading used until the local radio reports one.
pub const WORST_ENERGY: u8 = 255;

/// What one scan pass learned about a channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChannelInfo {
    pub controller_count: u32,
    pub channel_energy: u8,
}

impl Default for ChannelInfo {
    fn default() -> Self {
        Self {
            controller_count: 0,
            channel_energy: WORST_ENERGY,
        }
    }
}

/// Tally of one channel selection pass.
#[derive(Clone, Debug, Default)]
pub struct ChannelSurvey {
    channels: [ChannelInfo; MAX_CHANNELS as usize],
}

impl ChannelSurvey {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn info(&self, channel: Channel) -> Option<&ChannelInfo> {
        self.channels.get(usize::from(channel))
    }

    pub fn reset(&mut self, channel: Channel) {
        if let Some(info) = self.channels.get_mut(usize::from(channel)) {
            *info = ChannelInfo::default();
        }
    }

    /// Counts a check response. Our own radio answers with the private guid and reports the
    /// channel's energy; anything else is another controller occupying the channel.
    pub fn record(&mut self, check: &NetCheck) {
        let info = match self.channels.get_mut(usize::from(check.channel)) {
            Some(info) => info,
            None => {
                warn!("channel check response for invalid channel {}", check.channel);
                return;
            }
        };

        if check.guid == NetGuid::PRIVATE {
            info.channel_energy = check.energy;
        } else {
            info.controller_count += 1;
        }
    }

    /// The least occupied channel, then the quietest, then the lowest numbered.
    pub fn best(&self) -> Channel {
        let mut best = 0;
        for (channel, info) in self.channels.iter().enumerate() {
            let current = &self.channels[best];
            if (info.controller_count, info.channel_energy)
                < (current.controller_count, current.channel_energy)
            {
                best = channel;
            }
        }
        best as Channel
    }
}
