mod error;
mod util;

pub mod address;
pub mod frame;
pub mod io;
pub mod net;
pub mod relay;
pub mod responder;
pub mod session;
pub mod transport;
pub mod tunnel;
pub mod tunnel_spec;

pub use address::{Destination, HostPort, Protocol};
pub use error::*;
pub use frame::{Frame, FrameType};
pub use relay::{RelayPump, RelayStats};
pub use responder::Responder;
pub use session::{Role, Session, SessionConfig, StreamHandle, StreamState};
pub use tunnel::{Direction, LocalTunnel, RemoteTunnel, TunnelController};
pub use tunnel_spec::TunnelSpec;

pub mod test_util {
    use crate::session::{Role, Session, SessionConfig};
    use crate::transport::MemoryTransport;

    pub fn generate_random_buffer(buffer_size: i32) -> bytes::BytesMut {
        use bytes::{BufMut, BytesMut};

        let initial_vec: Vec<u8> = vec![];
        let result = (0..buffer_size)
            .map(|_| rand::random::<u8>())
            .fold(initial_vec, |mut a, b| {
                a.put_u8(b);
                a
            });

        BytesMut::from(result.as_slice())
    }

    /// A client-role and a server-role session joined by an in-memory transport.
    pub fn session_pair(config: SessionConfig) -> (Session, Session) {
        let (client_end, server_end) = MemoryTransport::pair(1024);
        let (client_reader, client_writer) = client_end.split();
        let (server_reader, server_writer) = server_end.split();

        let client = Session::spawn(Role::Client, config.clone(), client_reader, client_writer);
        let server = Session::spawn(Role::Server, config, server_reader, server_writer);

        (client, server)
    }

    pub mod macros {
        #[macro_export]
        macro_rules! is_type {
            ($value:expr, $pattern:pat) => {
                match &$value {
                    $pattern => true,
                    _ => false,
                }
            };
        }
    }
}
