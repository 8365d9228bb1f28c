/// Whether the client believes it can reach the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OnlineState {
    /// No connection attempt has succeeded or failed conclusively yet.
    #[default]
    Unknown,
    Online,
    /// Events raised while offline are marked as served from cache.
    Offline,
}
