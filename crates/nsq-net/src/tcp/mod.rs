mod connector;
mod stream;

pub use connector::{PollEvent, TcpConnector};
pub use stream::{ConnState, StreamTransform, TcpStream};
