//! Client-side SOCKS5 proxying: wire codec and the relay pairing state
//! machine.

pub mod relay;
pub mod socks5;

pub use relay::{Advance, Relay, RelayError, RelayState};
