//! Replaceable heuristics used while linking.

use media_session_core::{
    Properties,
    properties::keys,
    remote::{AudioChannel, Direction},
};

use crate::{PortRef, linkable::dont_remix};

/// Item factory whose items always count as the device side of a link.
pub const ENDPOINT_FACTORY: &str = "si-audio-endpoint";

/// Product-specific decisions of the link negotiation.
#[derive(Clone, Copy)]
pub struct LinkPolicy {
    /// Pair every output port with every input port.
    pub link_all: fn(&[PortRef], &[PortRef]) -> bool,
    /// Whether an item's properties describe a raw device endpoint.
    pub is_device: fn(&Properties) -> bool,
}

impl std::fmt::Debug for LinkPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkPolicy").finish_non_exhaustive()
    }
}

impl Default for LinkPolicy {
    fn default() -> Self {
        Self {
            link_all: never_link_all,
            is_device: node_type_is_device,
        }
    }
}

/// Always match ports by channel.
#[must_use]
pub const fn never_link_all(_outputs: &[PortRef], _inputs: &[PortRef]) -> bool {
    false
}

/// Fan a single unpositioned output out to every input.
#[must_use]
pub fn link_all_from_single_output(outputs: &[PortRef], inputs: &[PortRef]) -> bool {
    matches!(
        outputs,
        [PortRef {
            channel: AudioChannel::Mono | AudioChannel::Unknown,
            ..
        }]
    ) && inputs.len() > 1
}

/// `item.node.type` is `device`.
#[must_use]
pub fn node_type_is_device(properties: &Properties) -> bool {
    properties.get(keys::ITEM_NODE_TYPE) == Some("device")
}

/// Pick the side whose format wins during negotiation.
///
/// A device side wins. Otherwise the output side wins, unless only the
/// input side refuses remixing.
#[must_use]
pub fn choose_main_side(policy: &LinkPolicy, output: &Properties, input: &Properties) -> Direction {
    let mut out_device = (policy.is_device)(output);
    let mut in_device = (policy.is_device)(input);
    let is_endpoint = |props: &Properties| props.get(keys::ITEM_FACTORY_NAME) == Some(ENDPOINT_FACTORY);
    out_device |= is_endpoint(output) && !in_device;
    in_device |= is_endpoint(input) && !out_device;

    let (out_dont_remix, in_dont_remix) = (dont_remix(output), dont_remix(input));
    tracing::trace!(out_device, out_dont_remix, in_device, in_dont_remix, "choosing main side");

    match (out_device, in_device) {
        (false, true) => Direction::Input,
        (true, false) => Direction::Output,
        _ if !out_dont_remix && in_dont_remix => Direction::Input,
        _ => Direction::Output,
    }
}
