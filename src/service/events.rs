//! Event-bus boundary of the session.
//!
//! Whatever distributes notifications in the host process (prefix updates from the mesh
//! stack, root identity from the serial side, replies from the external network) pushes
//! [`GatewayEvent`]s into a channel, and [`run_event_loop`] applies them to a
//! [`SessionController`] in order.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::protocol::correlator::CorrelationKey;
use crate::service::mote_state::MoteState;
use crate::service::session::SessionController;
use crate::transport::PacketSink;
use crate::utils::metrics::global_metrics;

/// Notifications consumed by the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// The mesh network prefix became known (8 bytes)
    NetworkPrefix(Vec<u8>),
    /// A mote announced its identity (8 bytes)
    RootIdentity { node_id: Vec<u8>, is_root: bool },
    /// Raw IPv6 packet arriving from the external network
    Inbound(Vec<u8>),
    /// Reply payload already demultiplexed by the bus
    Reply { key: CorrelationKey, data: Vec<u8> },
    /// Stop the session
    Shutdown,
}

/// Counters for a finished event loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventLoopStats {
    pub handled: u64,
    pub failed: u64,
}

/// Apply one event. Returns `false` once the session should stop.
fn handle_event<S, M>(controller: &SessionController<S, M>, event: GatewayEvent) -> Result<bool>
where
    S: PacketSink + 'static,
    M: MoteState + 'static,
{
    match event {
        GatewayEvent::NetworkPrefix(prefix) => controller.set_network_prefix(&prefix)?,
        GatewayEvent::RootIdentity { node_id, is_root } => {
            controller.set_root_identity(&node_id, is_root)?
        }
        GatewayEvent::Inbound(packet) => {
            controller.on_inbound_packet(&packet)?;
        }
        GatewayEvent::Reply { key, data } => {
            controller.deliver_reply(&key, data)?;
        }
        GatewayEvent::Shutdown => return Ok(false),
    }
    Ok(true)
}

/// Feed events into `controller` until a `Shutdown` event arrives, the event channel
/// closes, or `shutdown_rx` fires. The session is shut down on exit in every case.
///
/// A failing event is logged and counted; it does not stop the loop.
pub async fn run_event_loop<S, M>(
    controller: SessionController<S, M>,
    mut events: mpsc::Receiver<GatewayEvent>,
    mut shutdown_rx: mpsc::Receiver<()>,
) -> EventLoopStats
where
    S: PacketSink + 'static,
    M: MoteState + 'static,
{
    let mut stats = EventLoopStats::default();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received");
                break;
            }

            event = events.recv() => {
                let Some(event) = event else {
                    info!("Event channel closed");
                    break;
                };
                debug!(?event, "Handling gateway event");
                match handle_event(&controller, event) {
                    Ok(true) => stats.handled += 1,
                    Ok(false) => {
                        stats.handled += 1;
                        break;
                    }
                    Err(e) => {
                        stats.failed += 1;
                        warn!(error = %e, "Gateway event failed");
                    }
                }
            }
        }
    }

    controller.shutdown();
    global_metrics().log_metrics();
    stats
}
