//! Wire codecs for the local proxy front ends
//!
//! Everything in this crate is pure and stateless: functions take byte
//! slices and return decoded values (or encoded bytes). The connection
//! handling lives in `ssh2proxy-server`.

pub mod addr;
pub mod noise;
pub mod socks5;

pub use addr::{join_host_port, split_authority, split_host_port};
pub use noise::is_network_noise;
pub use socks5::{Command, Decoded, Greeting, Reply, Request, Socks5Error, TargetAddr};
