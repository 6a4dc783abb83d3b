use super::protocol::{ClientMessage, Frame};
use log::debug;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

/// Sends a `ping` on an open channel every `period`, starting immediately.
///
/// `on_beat` runs just before each ping so the owner can check whether the
/// previous one was answered. Missing `pong`s never close anything; the
/// transport reports closure on its own. The timer lives exactly as long as
/// this value: dropping it stops the pings.
pub struct Heartbeat {
    task: JoinHandle<()>,
}

impl Heartbeat {
    pub fn start(
        period: Duration,
        outbound: UnboundedSender<Frame>,
        on_beat: impl Fn() + Send + 'static,
    ) -> Self {
        let task = tokio::spawn(async move {
            let Some(ping) = ClientMessage::Ping.to_frame() else {
                return;
            };
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                on_beat();
                if outbound.send(ping.clone()).is_err() {
                    debug!("Heartbeat stopping, channel writer is gone");
                    break;
                }
            }
        });
        Self { task }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.task.abort();
    }
}
