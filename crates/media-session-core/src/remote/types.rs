//! Value types exchanged with the remote graph.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Properties, properties::keys};

/// Direction of a port or of a node's media flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    #[must_use]
    pub const fn reverse(self) -> Self {
        match self {
            Self::Input => Self::Output,
            Self::Output => Self::Input,
        }
    }

    /// Numeric form used in item properties (`0` input, `1` output).
    #[must_use]
    pub const fn as_index(self) -> u32 {
        match self {
            Self::Input => 0,
            Self::Output => 1,
        }
    }

    #[must_use]
    pub const fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(Self::Input),
            1 => Some(Self::Output),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// Run state of a remote node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Error,
    Creating,
    Suspended,
    Idle,
    Running,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Error => "error",
            Self::Creating => "creating",
            Self::Suspended => "suspended",
            Self::Idle => "idle",
            Self::Running => "running",
        };
        f.write_str(name)
    }
}

/// Broadcast whenever a node changes state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStateChange {
    pub node_id: u32,
    pub old: NodeState,
    pub new: NodeState,
}

/// Commands a node accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCommand {
    Suspend,
    Pause,
    Start,
}

/// Spatial position of an audio channel.
///
/// Values follow the numeric ids of the graph's channel enumeration, so
/// they can be compared with positions reported in port properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u32)]
pub enum AudioChannel {
    Unknown = 0,
    NotApplicable = 1,
    Mono = 2,
    FrontLeft = 3,
    FrontRight = 4,
    FrontCenter = 5,
    LowFrequency = 6,
    SideLeft = 7,
    SideRight = 8,
    FrontLeftCenter = 9,
    FrontRightCenter = 10,
    RearCenter = 11,
    RearLeft = 12,
    RearRight = 13,
}

impl AudioChannel {
    const NICKS: [(Self, &'static str); 14] = [
        (Self::Unknown, "UNK"),
        (Self::NotApplicable, "NA"),
        (Self::Mono, "MONO"),
        (Self::FrontLeft, "FL"),
        (Self::FrontRight, "FR"),
        (Self::FrontCenter, "FC"),
        (Self::LowFrequency, "LFE"),
        (Self::SideLeft, "SL"),
        (Self::SideRight, "SR"),
        (Self::FrontLeftCenter, "FLC"),
        (Self::FrontRightCenter, "FRC"),
        (Self::RearCenter, "RC"),
        (Self::RearLeft, "RL"),
        (Self::RearRight, "RR"),
    ];

    /// Parse a short channel name; unrecognized names map to `Unknown`.
    #[must_use]
    pub fn from_nick(nick: &str) -> Self {
        Self::NICKS
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(nick))
            .map_or(Self::Unknown, |(c, _)| *c)
    }

    #[must_use]
    pub fn nick(self) -> &'static str {
        Self::NICKS
            .iter()
            .find(|(c, _)| *c == self)
            .map_or("UNK", |(_, n)| n)
    }

    /// Default positions for a given channel count.
    #[must_use]
    pub fn default_layout(channels: u32) -> Vec<Self> {
        const SURROUND: [AudioChannel; 6] = [
            AudioChannel::FrontLeft,
            AudioChannel::FrontRight,
            AudioChannel::FrontCenter,
            AudioChannel::LowFrequency,
            AudioChannel::RearLeft,
            AudioChannel::RearRight,
        ];
        match channels {
            1 => vec![Self::Mono],
            2 => vec![Self::FrontLeft, Self::FrontRight],
            n => (0..n as usize)
                .map(|i| SURROUND.get(i).copied().unwrap_or(Self::Unknown))
                .collect(),
        }
    }
}

impl fmt::Display for AudioChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.nick())
    }
}

/// Raw sample encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    /// 32-bit float, planar. The graph's DSP format.
    F32P,
    F32,
    S16,
    S32,
}

/// Raw audio format of a set of ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: u32,
    pub positions: Vec<AudioChannel>,
}

impl AudioFormat {
    /// Planar float format with the default layout for `channels`.
    #[must_use]
    pub fn dsp(rate: u32, channels: u32) -> Self {
        Self {
            format: SampleFormat::F32P,
            rate,
            channels,
            positions: AudioChannel::default_layout(channels),
        }
    }
}

/// How a node exposes its ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortConfigMode {
    /// One mono port per channel, in planar float.
    Dsp,
    /// Converting ports in the given format.
    Convert,
    /// The node's native ports.
    Passthrough,
    /// No ports in this direction.
    None,
}

/// Parameters that can be set on a remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    PortConfig {
        direction: Direction,
        mode: PortConfigMode,
        /// Expose a control port alongside the media ports.
        control: bool,
        /// Also expose monitor ports.
        monitor: bool,
        format: Option<AudioFormat>,
    },
    Props(Properties),
}

/// Snapshot of a port on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub id: u32,
    pub direction: Direction,
    pub properties: Properties,
}

impl PortInfo {
    /// Channel position of the port; ports without one are `Unknown`.
    #[must_use]
    pub fn channel(&self) -> AudioChannel {
        self.properties
            .get(keys::AUDIO_CHANNEL)
            .map_or(AudioChannel::Unknown, AudioChannel::from_nick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_nick_lookup() {
        assert_eq!(AudioChannel::from_nick("FL"), AudioChannel::FrontLeft);
        assert_eq!(AudioChannel::from_nick("mono"), AudioChannel::Mono);
        assert_eq!(AudioChannel::from_nick("XYZ"), AudioChannel::Unknown);
        assert_eq!(AudioChannel::RearRight.nick(), "RR");
        assert_eq!(AudioChannel::Mono as u32, 2);
    }

    #[test]
    fn test_default_layouts() {
        assert_eq!(AudioChannel::default_layout(1), vec![AudioChannel::Mono]);
        assert_eq!(
            AudioChannel::default_layout(2),
            vec![AudioChannel::FrontLeft, AudioChannel::FrontRight]
        );
        let eight = AudioChannel::default_layout(8);
        assert_eq!(eight.len(), 8);
        assert_eq!(eight[3], AudioChannel::LowFrequency);
        assert_eq!(eight[7], AudioChannel::Unknown);
    }

    #[test]
    fn test_port_without_channel_is_unknown() {
        let port = PortInfo {
            id: 1,
            direction: Direction::Output,
            properties: Properties::new(),
        };
        assert_eq!(port.channel(), AudioChannel::Unknown);
    }

    #[test]
    fn test_direction_index() {
        assert_eq!(Direction::from_index(0), Some(Direction::Input));
        assert_eq!(Direction::Output.as_index(), 1);
        assert_eq!(Direction::Output.reverse(), Direction::Input);
        assert_eq!(Direction::from_index(2), None);
    }
}
