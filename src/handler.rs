use async_trait::async_trait;

use crate::args::Args;
use crate::response::ResponseWriter;
use crate::Result;

/// A command received by the server.
///
/// The arguments are read lazily from the connection; whatever the handler leaves unread is
/// discarded by the server once the handler returns.
#[derive(Debug)]
pub struct Request {
    /// The command name as sent by the client, e.g. `SET`.
    pub cmd: String,
    pub args: Args,
}

/// Serves requests for a [`Server`](crate::server::Server).
///
/// Returning an error before anything was written sends it to the client as an error reply.
/// Returning without writing anything sends a null reply.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn serve(&self, res: &mut ResponseWriter<'_>, req: &mut Request) -> Result<()>;
}
