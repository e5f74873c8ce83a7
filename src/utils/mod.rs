//! Socket helpers and log throttling

pub mod net;
pub mod throttle;

pub use net::{
    advertised_ipv4, bind_multicast_sender, bind_tcp_listener, bind_udp_socket, local_ipv4,
};
pub use throttle::LogThrottler;
