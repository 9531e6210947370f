//! Server maps: per-collection key/value caching for very large shared
//! collections, without materializing every entry as a managed handle.

pub(crate) mod local_cache;
pub mod remote;
pub mod server_map;

pub use remote::RemoteServerMapManager;
pub use server_map::ServerMap;
