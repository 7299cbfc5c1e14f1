//! Wires a client stream to a sound card through a converter, on an
//! in-process graph.
//!
//! Run with: cargo run -p link-demo [settings.json]

use std::{rc::Rc, time::Duration};

use anyhow::{Context, Result, bail};
use media_session_core::{
    Interest, ItemFeatures, Properties, RemoteNode, RemoteObject, SessionSettings,
    properties::keys,
    remote::{AudioChannel, Direction, MemoryGraph, NodeState},
};
use media_session_items::{
    AssociatedResource, NodeSuspension, ResourceKind, SessionContext, SessionItem, SiAdapter,
    SiConvert, SiStandardLink, activate_async,
};
use tokio::task::LocalSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn load_settings() -> Result<SessionSettings> {
    match std::env::args().nth(1) {
        Some(path) => {
            let json = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            SessionSettings::from_json(&json).with_context(|| format!("parsing {path}"))
        }
        None => Ok(SessionSettings {
            suspend_timeout_ms: 500,
            ..SessionSettings::default()
        }),
    }
}

fn make_item(context: &Rc<SessionContext>, factory: &str, properties: Properties) -> Result<Rc<dyn SessionItem>> {
    let item = context
        .make_item(factory)
        .with_context(|| format!("no factory named {factory}"))?;
    item.configure(properties)
        .with_context(|| format!("configuring {factory}"))?;
    Ok(item)
}

async fn run(settings: SessionSettings) -> Result<()> {
    let graph = MemoryGraph::new();
    let stereo_in = [
        (Direction::Input, AudioChannel::FrontLeft),
        (Direction::Input, AudioChannel::FrontRight),
    ];
    let stereo_out = [
        (Direction::Output, AudioChannel::FrontLeft),
        (Direction::Output, AudioChannel::FrontRight),
    ];
    let card = graph.add_node(
        Properties::new()
            .with(keys::NODE_NAME, "alsa_output.pci-0000_00_1f.3.analog-stereo")
            .with(keys::OBJECT_PATH, "alsa:pcm:0:front:0:playback")
            .with(keys::MEDIA_CLASS, "Audio/Sink"),
        &stereo_in,
    );
    let player = graph.add_node(
        Properties::new()
            .with(keys::NODE_NAME, "music-player")
            .with(keys::MEDIA_CLASS, "Stream/Output/Audio"),
        &stereo_out,
    );

    let context = SessionContext::new(Rc::new(graph.clone()), settings);
    let suspension = NodeSuspension::new(&context, Interest::new().prefix(keys::MEDIA_CLASS, "Audio/"));
    tracing::info!(watched = suspension.scan(), "node suspension ready");

    let card_item = make_item(
        &context,
        SiAdapter::FACTORY_NAME,
        Properties::new()
            .with("node", card.bound_id().to_string())
            .with(keys::ITEM_NODE_TYPE, "device")
            .with(keys::ITEM_EXCLUSIVE, "true"),
    )?;
    activate_async(&card_item, ItemFeatures::ACTIVE).await?;

    let player_item = make_item(
        &context,
        SiAdapter::FACTORY_NAME,
        Properties::new()
            .with("node", player.bound_id().to_string())
            .with("role", "Music"),
    )?;
    activate_async(&player_item, ItemFeatures::ACTIVE).await?;

    let convert = make_item(
        &context,
        SiConvert::FACTORY_NAME,
        Properties::new()
            .with("target", card_item.base().id().to_string())
            .with("name", "playback")
            .with("direction", "output"),
    )?;
    activate_async(&convert, ItemFeatures::ACTIVE).await?;
    let Some(AssociatedResource::Node(convert_node)) = convert.associated_resource(ResourceKind::Node) else {
        bail!("converter has no node");
    };
    tracing::info!(
        node = convert_node.bound_id(),
        name = convert_node.properties().get(keys::NODE_NAME).unwrap_or_default(),
        "converter ready"
    );

    let link = make_item(
        &context,
        SiStandardLink::FACTORY_NAME,
        Properties::new()
            .with("out.item", player_item.base().id().to_string())
            .with("in.item", convert.base().id().to_string())
            .with("in.item.port.context", "reverse"),
    )?;
    activate_async(&link, ItemFeatures::ACTIVE).await?;

    // the converter links itself to the card once it runs
    let running = graph
        .node(convert_node.bound_id())
        .context("converter node vanished")?;
    running.set_state(NodeState::Running);
    card.set_state(NodeState::Running);
    tokio::time::sleep(Duration::from_millis(50)).await;

    for l in graph.links() {
        tracing::info!(
            link = l.id,
            "{}:{} -> {}:{}",
            l.output_node,
            l.output_port,
            l.input_node,
            l.input_port
        );
    }

    running.set_state(NodeState::Idle);
    card.set_state(NodeState::Idle);
    tokio::time::sleep(context.settings().suspend_timeout() + Duration::from_millis(100)).await;
    tracing::info!(
        links = graph.link_count(),
        card_state = %card.state(),
        commands = ?card.commands(),
        "after idle period"
    );
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let settings = load_settings()?;
    LocalSet::new().run_until(run(settings)).await
}
