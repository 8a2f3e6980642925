#[derive(Clone, Debug, Default)]
pub struct WorkflowConfig {
    /// Endpoint of the decrypt service. A `ws://`/`wss://` scheme selects the
    /// streaming transport; anything else falls back to single-shot HTTP.
    pub endpoint: String,
    /// Account identifier the archive belongs to.
    pub account: String,
    /// Forces the single-shot HTTP transport even for a websocket endpoint.
    pub force_sync: bool,
}
