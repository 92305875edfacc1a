//! Connection tasks. Each one turns a socket into length-delimited frames and
//! forwards them to the server task; none of them touch scheduler state.

mod agent;
mod client;

pub use agent::serve_agents;
pub use client::{bind_client_socket, serve_clients};

use tokio_util::codec::LengthDelimitedCodec;

/// Largest frame accepted from any peer.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}
