use super::BoxedStream;
use portico_common::Result;
use tokio::net::TcpStream;

/// Connect over plain TCP.
pub async fn connect(addr: &str) -> Result<BoxedStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(Box::pin(stream))
}
