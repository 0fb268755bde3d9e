//! Protocol constants for mindmapd network communication

/// Every frame starts with a little-endian u32 payload length
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default payload cap; anything larger is refused before allocation
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Reserved action answered by the dispatcher itself
pub const GET_CAPABILITIES: &str = "get_capabilities";

/// Capability descriptor identity
pub const SERVICE_NAME: &str = "mindmanager";
pub const SERVICE_DISPLAY_NAME: &str = "MindManager";
pub const SERVICE_DESCRIPTION: &str = "Interact with MindManager to create and modify mind maps";
pub const SERVICE_VERSION: &str = "0.1.0";
