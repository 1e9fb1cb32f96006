use std::time::Duration;

use crate::{Error, Result};

/// Smallest permitted `max_message_size`
pub const MIN_MESSAGE_SIZE: usize = 16 * 1024;
/// Largest permitted message size, even with large transfer authorized
pub const MAX_LARGE_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Tunables of a stream transport connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTransportConfig {
    /// Period of the heartbeat timer
    pub heartbeat_period: Duration,
    /// Close the connection when nothing was received for this long
    pub receive_timeout: Duration,
    /// Send `ConnectionTest` messages while idle
    pub send_heartbeat: bool,
    /// Largest message accepted or sent before large transfer is authorized
    pub max_message_size: usize,
    /// Largest message accepted or sent once large transfer is authorized
    pub max_large_message_size: usize,
    pub stream_op_timeout: Duration,
    pub string_table_timeout: Duration,
    /// Server side bound on waiting for the client's `CreateConnection`
    pub attach_timeout: Duration,
    pub disable_message4: bool,
    pub disable_string_table: bool,
}

impl Default for StreamTransportConfig {
    fn default() -> Self {
        StreamTransportConfig {
            heartbeat_period: Duration::from_secs(5),
            receive_timeout: Duration::from_secs(600),
            send_heartbeat: true,
            max_message_size: 12 * 1024 * 1024,
            max_large_message_size: MAX_LARGE_MESSAGE_SIZE,
            stream_op_timeout: Duration::from_secs(10),
            string_table_timeout: Duration::from_secs(10),
            attach_timeout: Duration::from_secs(15),
            disable_message4: false,
            disable_string_table: false,
        }
    }
}

impl StreamTransportConfig {
    pub fn heartbeat_period(mut self, period: Duration) -> Self {
        self.heartbeat_period = period;
        self
    }

    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn send_heartbeat(mut self, send_heartbeat: bool) -> Self {
        self.send_heartbeat = send_heartbeat;
        self
    }

    /// Set the message size limit. Values outside of 16 KiB ..= 100 MiB are rejected.
    pub fn max_message_size(mut self, max_message_size: usize) -> Result<Self> {
        if !(MIN_MESSAGE_SIZE..=MAX_LARGE_MESSAGE_SIZE).contains(&max_message_size) {
            return Err(Error::InvalidArgument(format!(
                "MaxMessageSize must be between {} and {}",
                MIN_MESSAGE_SIZE, MAX_LARGE_MESSAGE_SIZE
            )));
        }
        self.max_message_size = max_message_size;
        if self.max_large_message_size < max_message_size {
            self.max_large_message_size = max_message_size;
        }
        Ok(self)
    }

    pub fn stream_op_timeout(mut self, timeout: Duration) -> Self {
        self.stream_op_timeout = timeout;
        self
    }

    pub fn string_table_timeout(mut self, timeout: Duration) -> Self {
        self.string_table_timeout = timeout;
        self
    }

    pub fn attach_timeout(mut self, timeout: Duration) -> Self {
        self.attach_timeout = timeout;
        self
    }

    pub fn disable_message4(mut self, disable: bool) -> Self {
        self.disable_message4 = disable;
        self
    }

    pub fn disable_string_table(mut self, disable: bool) -> Self {
        self.disable_string_table = disable;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_message_size_is_range_checked() {
        assert!(StreamTransportConfig::default()
            .max_message_size(1024)
            .is_err());
        assert!(StreamTransportConfig::default()
            .max_message_size(MAX_LARGE_MESSAGE_SIZE + 1)
            .is_err());
        let cfg = StreamTransportConfig::default()
            .max_message_size(MIN_MESSAGE_SIZE)
            .unwrap();
        assert_eq!(cfg.max_message_size, MIN_MESSAGE_SIZE);
    }
}
