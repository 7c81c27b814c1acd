use ::config::Config;

pub(crate) const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 0x10000;
pub(crate) const DEFAULT_SEND_BUFFER_SIZE: usize = 0x10000;
pub(crate) const DEFAULT_BUFFER_PAGE_SIZE: usize = 4096;
pub(crate) const DEFAULT_POLL_CAPACITY: usize = 256;

/// Per-connection sizing read from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// Inbound buffer capacity; also the largest frame a client may send.
    pub receive_buffer_size: usize,
    /// Initial outbound buffer capacity.
    pub send_buffer_size: usize,
    /// Growth granularity of connection buffers.
    pub buffer_page_size: usize,
    /// Maximum number of readiness events handled per poll.
    pub poll_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
            buffer_page_size: DEFAULT_BUFFER_PAGE_SIZE,
            poll_capacity: DEFAULT_POLL_CAPACITY,
        }
    }
}

impl ClientConfig {
    /// Reads the client keys, honoring the `{name}.{key}` namespace.
    ///
    /// Missing keys fall back to their defaults. A page size of zero is
    /// treated as one byte.
    pub fn from_config(config: &Config, name: &str) -> Self {
        let defaults = Self::default();
        Self {
            receive_buffer_size: get_namespaced_usize(config, name, "receive_buffer_size")
                .unwrap_or(defaults.receive_buffer_size),
            send_buffer_size: get_namespaced_usize(config, name, "send_buffer_size")
                .unwrap_or(defaults.send_buffer_size),
            buffer_page_size: get_namespaced_usize(config, name, "buffer_page_size")
                .unwrap_or(defaults.buffer_page_size)
                .max(1),
            poll_capacity: get_namespaced_usize(config, name, "poll_capacity")
                .unwrap_or(defaults.poll_capacity),
        }
    }
}

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, config::ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, config::ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}
