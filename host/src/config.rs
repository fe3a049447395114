//! Compile-time configuration.
//!
//! `trouble-l2cap` has some configuration settings that are set at compile time. They are set
//! via environment variables at build time: set the variable named `TROUBLE_L2CAP_<value>`. For
//! example `TROUBLE_L2CAP_L2CAP_RX_QUEUE_SIZE=8 cargo build`. You can also set them in the `[env]`
//! section of `.cargo/config.toml`.

mod raw {
    #![allow(unused)]
    include!(concat!(env!("OUT_DIR"), "/config.rs"));
}

// ======== L2CAP parameters
//
/// L2CAP RX queue size
///
/// This is the number of received SDUs (or segments) every channel can hold until the
/// application reads them. A peer never holds more credits than a channel has room for, so the
/// initial credits of a channel are at most this many.
///
/// Default: 4.
pub const L2CAP_RX_QUEUE_SIZE: usize = raw::L2CAP_RX_QUEUE_SIZE;

/// L2CAP signalling queue size
///
/// Number of outgoing signalling packets (responses and requests) the host can queue for
/// the control task.
///
/// Default: 8.
pub const L2CAP_SIGNAL_QUEUE_SIZE: usize = raw::L2CAP_SIGNAL_QUEUE_SIZE;

/// Largest signalling packet accepted on the LE signalling channel.
///
/// Default: 64.
pub const L2CAP_SIGNAL_MTU: usize = raw::L2CAP_SIGNAL_MTU;

/// Largest ACL fragment the host reads from the transport.
///
/// Default: 251.
pub const MAX_FRAGMENT_SIZE: usize = raw::MAX_FRAGMENT_SIZE;
