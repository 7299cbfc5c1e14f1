//! Interfaces of items that can be linked to each other.

use std::rc::Rc;

use media_session_core::{
    Error, Properties,
    properties::keys,
    remote::{AudioChannel, AudioFormat, Direction, PortConfigMode, PortInfo},
};

use crate::Arbiter;

/// Port context selecting the ports opposite to the item's direction.
pub const CONTEXT_REVERSE: &str = "reverse";
/// Port context selecting the monitor ports of an input item.
pub const CONTEXT_MONITOR: &str = "monitor";

/// Address of one port, as used for link creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub node_id: u32,
    pub port_id: u32,
    pub channel: AudioChannel,
}

/// An item exposing ports.
pub trait Linkable {
    /// Ports selected by `context`; `None` means the item's own direction.
    ///
    /// Unknown contexts yield no ports.
    fn ports(&self, context: Option<&str>) -> Vec<PortRef>;

    /// Arbiter guarding the item, when links need exclusive access to it.
    fn acquisition(&self) -> Option<Rc<Arbiter>> {
        None
    }

    /// Format negotiation interface, for items that support it.
    fn adapter(&self) -> Option<&dyn Adapter> {
        None
    }
}

/// How an adapter's ports carry audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortMode {
    /// One planar float port per channel.
    Dsp,
    /// Converting ports in the negotiated format.
    Convert,
    /// The device's native ports.
    Passthrough,
}

impl PortMode {
    #[must_use]
    pub const fn is_dsp(self) -> bool {
        matches!(self, Self::Dsp)
    }

    /// Mode to impose on a peer so that it follows this one.
    #[must_use]
    pub const fn follower(self) -> Self {
        if self.is_dsp() { Self::Dsp } else { Self::Convert }
    }
}

impl From<PortMode> for PortConfigMode {
    fn from(mode: PortMode) -> Self {
        match mode {
            PortMode::Dsp => Self::Dsp,
            PortMode::Convert => Self::Convert,
            PortMode::Passthrough => Self::Passthrough,
        }
    }
}

/// Completion of [`Adapter::set_ports_format`].
pub type FormatCallback = Box<dyn FnOnce(Result<(), Error>)>;

/// A linkable item that can negotiate its port format.
pub trait Adapter {
    /// Current port format and mode, once one has been set.
    fn ports_format(&self) -> Option<(AudioFormat, PortMode)>;

    /// Reconfigure the ports.
    ///
    /// With no format the item picks its own, based on the node's
    /// preferences and `mode`. `callback` runs once the new ports exist.
    fn set_ports_format(&self, format: Option<AudioFormat>, mode: PortMode, callback: FormatCallback);
}

/// Whether two negotiated formats can be linked as they are.
#[must_use]
pub fn formats_compatible(a: &(AudioFormat, PortMode), b: &(AudioFormat, PortMode)) -> bool {
    a.0 == b.0 && a.1.is_dsp() == b.1.is_dsp()
}

/// Select `node_id`'s media ports for `direction`, skipping control ports
/// and keeping monitor ports only when `monitor` is set.
#[must_use]
pub fn select_ports(
    node_id: u32,
    ports: &[PortInfo],
    direction: Direction,
    monitor: bool,
) -> Vec<PortRef> {
    ports
        .iter()
        .filter(|port| port.direction == direction)
        .filter(|port| !port.properties.get_bool(keys::PORT_CONTROL))
        .filter(|port| port.properties.get_bool(keys::PORT_MONITOR) == monitor)
        .map(|port| PortRef {
            node_id,
            port_id: port.id,
            channel: port.channel(),
        })
        .collect()
}

/// Resolve a port context against an item's direction.
///
/// Returns the port direction and whether monitor ports are wanted.
#[must_use]
pub fn resolve_context(direction: Direction, context: Option<&str>) -> Option<(Direction, bool)> {
    match context {
        None => Some((direction, false)),
        Some(CONTEXT_REVERSE) => Some((direction.reverse(), false)),
        Some(CONTEXT_MONITOR) if direction == Direction::Input => Some((Direction::Output, true)),
        Some(_) => None,
    }
}

/// Whether the item declares that its streams must not be remixed.
#[must_use]
pub fn dont_remix(properties: &Properties) -> bool {
    properties.get_bool(keys::STREAM_DONT_REMIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(id: u32, direction: Direction, props: Properties) -> PortInfo {
        PortInfo {
            id,
            direction,
            properties: props,
        }
    }

    #[test]
    fn test_select_ports_skips_control_and_monitor() {
        let ports = vec![
            port(1, Direction::Input, Properties::new().with(keys::AUDIO_CHANNEL, "FL")),
            port(2, Direction::Input, Properties::new().with(keys::PORT_CONTROL, "true")),
            port(
                3,
                Direction::Output,
                Properties::new()
                    .with(keys::AUDIO_CHANNEL, "FL")
                    .with(keys::PORT_MONITOR, "true"),
            ),
        ];

        let inputs = select_ports(7, &ports, Direction::Input, false);
        assert_eq!(
            inputs,
            vec![PortRef {
                node_id: 7,
                port_id: 1,
                channel: AudioChannel::FrontLeft
            }]
        );
        assert!(select_ports(7, &ports, Direction::Output, false).is_empty());
        assert_eq!(select_ports(7, &ports, Direction::Output, true)[0].port_id, 3);
    }

    #[test]
    fn test_resolve_context() {
        assert_eq!(
            resolve_context(Direction::Input, None),
            Some((Direction::Input, false))
        );
        assert_eq!(
            resolve_context(Direction::Input, Some(CONTEXT_REVERSE)),
            Some((Direction::Output, false))
        );
        assert_eq!(
            resolve_context(Direction::Input, Some(CONTEXT_MONITOR)),
            Some((Direction::Output, true))
        );
        assert_eq!(resolve_context(Direction::Output, Some(CONTEXT_MONITOR)), None);
        assert_eq!(resolve_context(Direction::Output, Some("bogus")), None);
    }

    #[test]
    fn test_compatibility_compares_dsp_ness() {
        let format = AudioFormat::dsp(48_000, 2);
        let dsp = (format.clone(), PortMode::Dsp);
        assert!(formats_compatible(&dsp, &(format.clone(), PortMode::Dsp)));
        assert!(!formats_compatible(&dsp, &(format.clone(), PortMode::Convert)));
        assert!(formats_compatible(
            &(format.clone(), PortMode::Convert),
            &(format, PortMode::Passthrough)
        ));
        assert!(!formats_compatible(&dsp, &(AudioFormat::dsp(44_100, 2), PortMode::Dsp)));
    }
}
