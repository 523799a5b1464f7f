pub mod multicast;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;


/// A transport moves raw datagrams to and from the multicast segment that all members share. It
///  has no knowledge of the packet format.
///
/// NB: Every datagram that is sent is also received by the sending process (multicast loopback);
///  the layers above rely on this to discover local members in other groups and must filter
///  their own packets where appropriate.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, datagram: &[u8]) -> anyhow::Result<()>;

    /// Waits for the next datagram. There is a single reader per transport, so implementations
    ///  are free to serialize concurrent calls.
    async fn recv(&self) -> anyhow::Result<Bytes>;

    fn description(&self) -> String;
}
