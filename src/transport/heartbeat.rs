use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::*;

use std::sync::Arc;

use crate::msg::{Message, MessageEntry, MessageEntryType};
use crate::transport::lock;
use crate::transport::stream::StreamTransport;
use crate::{Error, Result};

impl StreamTransport {
    /// Spawn the heartbeat task. It only holds a weak reference, so it never
    /// keeps a dropped connection alive and stops on the first tick after close.
    pub(crate) fn start_heartbeat(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.config.heartbeat_period;
        let task = self.handle.spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let transport = match weak.upgrade() {
                    Some(transport) => transport,
                    None => break,
                };
                if !transport.heartbeat_tick() {
                    break;
                }
            }
        });
        let mut timer = lock(&self.heartbeat_timer);
        if self.is_connected() {
            *timer = Some(task);
        } else {
            task.abort();
        }
    }

    fn heartbeat_tick(&self) -> bool {
        if self.periodic_cleanup().is_err() {
            return false;
        }
        let idle = self.last_send_time().elapsed() >= self.config.heartbeat_period;
        if self.config.send_heartbeat && idle && self.send_queue_idle() {
            trace!("Sending heartbeat");
            let ping = MessageEntry::new(MessageEntryType::ConnectionTest, "");
            self.send_detached(Message::new().with_entry(ping));
        }
        true
    }

    /// Close the connection if nothing arrived within `receive_timeout`, and
    /// expire string table proposals the peer never confirmed
    pub fn periodic_cleanup(&self) -> Result<()> {
        self.check_connection()?;
        let silent = self.last_receive_time().elapsed();
        if silent > self.config.receive_timeout {
            let err = Error::Connection(format!(
                "Connection timed out, nothing received for {:?}",
                silent
            ));
            warn!("{}", err);
            self.close_with(err.clone());
            return Err(err);
        }
        if let Some(table) = self.string_table() {
            table.expire_requests(self.config.string_table_timeout);
        }
        Ok(())
    }
}
