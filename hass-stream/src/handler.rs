//! Seam between the receive loop and event consumers

use hass_api::Event;
use tokio::sync::mpsc;

/// Receives the unsolicited frames the receive loop does not handle itself
///
/// Both methods are called on the receive loop task, in frame arrival order.
/// They must not block: anything slow belongs on a spawned task.
pub trait FrameHandler: Send + Sync + 'static {
    /// An `event` frame arrived
    fn on_event(&self, event: Event);

    /// The connection reached `Closed`; called exactly once
    fn on_closed(&self) {}
}

/// Forward events into a channel, mostly useful for simple consumers and tests
impl FrameHandler for mpsc::UnboundedSender<Event> {
    fn on_event(&self, event: Event) {
        if self.send(event).is_err() {
            tracing::trace!("Event receiver dropped");
        }
    }
}
