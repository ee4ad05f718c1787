// crates/lontalk-rs/src/log.rs
//! Namespaced logging macros that prepend a small structured context ahead of
//! the formatted message, so layer logs can be grepped by component.

use alloc::format;
use alloc::string::String;

/// Implemented by small context structs so they can be spliced into a log line.
pub trait LogMetadata {
    fn meta(&self) -> String;
}

/// Identifies which layer/component emitted a log line.
pub struct LayerContext {
    pub layer: &'static str,
    pub node_id: u8,
}

impl LogMetadata for LayerContext {
    fn meta(&self) -> String {
        format!("layer={}, node={}", self.layer, self.node_id)
    }
}

macro_rules! lon_info {
    ($ctx:expr, $fmt:literal $(, $($arg:tt)+)?) => {{
        let meta = $crate::log::LogMetadata::meta(&$ctx);
        log::info!(concat!("[{}] ", $fmt), meta $(, $($arg)+)?);
    }};
    ($fmt:literal $(, $($arg:tt)+)?) => {{
        log::info!($fmt $(, $($arg)+)?);
    }};
}

macro_rules! lon_warn {
    ($ctx:expr, $fmt:literal $(, $($arg:tt)+)?) => {{
        let meta = $crate::log::LogMetadata::meta(&$ctx);
        log::warn!(concat!("[{}] ", $fmt), meta $(, $($arg)+)?);
    }};
    ($fmt:literal $(, $($arg:tt)+)?) => {{
        log::warn!($fmt $(, $($arg)+)?);
    }};
}

macro_rules! lon_error {
    ($ctx:expr, $fmt:literal $(, $($arg:tt)+)?) => {{
        let meta = $crate::log::LogMetadata::meta(&$ctx);
        log::error!(concat!("[{}] ", $fmt), meta $(, $($arg)+)?);
    }};
    ($fmt:literal $(, $($arg:tt)+)?) => {{
        log::error!($fmt $(, $($arg)+)?);
    }};
}

macro_rules! lon_trace {
    ($ctx:expr, $fmt:literal $(, $($arg:tt)+)?) => {{
        let meta = $crate::log::LogMetadata::meta(&$ctx);
        log::trace!(concat!("[{}] ", $fmt), meta $(, $($arg)+)?);
    }};
    ($fmt:literal $(, $($arg:tt)+)?) => {{
        log::trace!($fmt $(, $($arg)+)?);
    }};
}

pub(crate) use lon_error;
pub(crate) use lon_info;
pub(crate) use lon_trace;
pub(crate) use lon_warn;
