//! Multicast channels: join the group, send datagrams, and feed every
//! received message to the dispatch pool with a snapshot of the channel's
//! pending actions.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::sync::Arc;

use dbs_core::action::{SubscriptionSnapshot, Subscriptions};
use dbs_core::dispatch::{ChannelKind, DispatchTask};
use dbs_core::protocol::MAX_DATAGRAM_SIZE;
use dbs_core::wire::{decode_message, encode_message, DecodeError};
use dbs_core::Message;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, trace, warn};

use crate::pool::{DispatchPool, PoolError};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("cannot join {descriptor}: {reason}")]
    Join { descriptor: String, reason: String },
    #[error("send on {channel} failed: {source}")]
    Send {
        channel: ChannelKind,
        #[source]
        source: io::Error,
    },
    #[error("receive on {channel} failed: {source}")]
    Receive {
        channel: ChannelKind,
        #[source]
        source: io::Error,
    },
}

/// IPv4 multicast group and port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelAddr {
    pub group: Ipv4Addr,
    pub port: u16,
}

impl ChannelAddr {
    /// Parse and resolve an `address:port` descriptor.
    pub fn resolve(descriptor: &str) -> Result<Self, ChannelError> {
        let join_err = |reason: String| ChannelError::Join {
            descriptor: descriptor.to_string(),
            reason,
        };
        let (host, port) = descriptor
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| join_err("expected address:port".into()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| join_err(format!("invalid port {port:?}")))?;
        let group = match host.parse::<Ipv4Addr>() {
            Ok(ip) => ip,
            Err(_) => (host, port)
                .to_socket_addrs()
                .map_err(|e| join_err(e.to_string()))?
                .find_map(|a| match a {
                    SocketAddr::V4(v4) => Some(*v4.ip()),
                    SocketAddr::V6(_) => None,
                })
                .ok_or_else(|| join_err(format!("{host} has no IPv4 address")))?,
        };
        if !group.is_multicast() {
            return Err(join_err(format!("{group} is not a multicast address")));
        }
        Ok(Self { group, port })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.group, self.port))
    }
}

impl fmt::Display for ChannelAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.port)
    }
}

pub struct MulticastChannel {
    kind: ChannelKind,
    addr: ChannelAddr,
    socket: UdpSocket,
    subscriptions: Arc<Subscriptions>,
}

impl MulticastChannel {
    /// Join the group named by `descriptor`. Must be called from within a
    /// tokio runtime.
    pub fn join(kind: ChannelKind, descriptor: &str) -> Result<Self, ChannelError> {
        let addr = ChannelAddr::resolve(descriptor)?;
        let socket = open_socket(&addr)
            .and_then(UdpSocket::from_std)
            .map_err(|e| ChannelError::Join {
                descriptor: descriptor.to_string(),
                reason: e.to_string(),
            })?;
        info!(channel = %kind, %addr, "joined multicast group");
        Ok(Self {
            kind,
            addr,
            socket,
            subscriptions: Arc::new(Subscriptions::new()),
        })
    }

    /// Live list of actions waiting for replies on this channel.
    pub fn subscriptions(&self) -> &Arc<Subscriptions> {
        &self.subscriptions
    }

    pub fn snapshot(&self) -> SubscriptionSnapshot {
        self.subscriptions.snapshot()
    }

    pub async fn send(&self, bytes: &[u8]) -> Result<(), ChannelError> {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(ChannelError::Send {
                channel: self.kind,
                source: io::Error::new(io::ErrorKind::InvalidInput, "datagram too large"),
            });
        }
        self.socket
            .send_to(bytes, self.addr.socket_addr())
            .await
            .map_err(|source| ChannelError::Send {
                channel: self.kind,
                source,
            })?;
        Ok(())
    }

    pub async fn send_message(&self, message: &Message) -> Result<(), ChannelError> {
        trace!(channel = %self.kind, kind = %message.message_type(), "send");
        self.send(&encode_message(message)).await
    }

    /// Receive until the socket fails or the pool shuts down. Undecodable
    /// datagrams are logged and dropped.
    pub async fn run_receive_loop(
        self: Arc<Self>,
        pool: DispatchPool<DispatchTask>,
    ) -> Result<(), ChannelError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (n, from) = match self.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(source) => {
                    error!(channel = %self.kind, error = %source, "receive failed");
                    return Err(ChannelError::Receive {
                        channel: self.kind,
                        source,
                    });
                }
            };
            let message = match decode_message(&buf[..n]) {
                Ok(m) => m,
                Err(DecodeError::UnknownMessageType(t)) => {
                    debug!(channel = %self.kind, %from, kind = %t, "unknown message type");
                    continue;
                }
                Err(e) => {
                    debug!(channel = %self.kind, %from, error = %e, "dropping malformed datagram");
                    continue;
                }
            };
            let task = DispatchTask {
                channel: self.kind,
                message,
                snapshot: self.snapshot(),
                subscriptions: self.subscriptions.clone(),
            };
            let submitted = match pool.try_submit(task) {
                Err(PoolError::Full(task)) => {
                    warn!(channel = %self.kind, "dispatch queue full, receive loop waiting");
                    pool.submit(task).await
                }
                other => other,
            };
            if submitted.is_err() {
                debug!(channel = %self.kind, "dispatch pool closed");
                return Ok(());
            }
        }
    }
}

/// Several peers on one host share the group port, hence address reuse.
fn open_socket(addr: &ChannelAddr) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, addr.port).into())?;
    socket.join_multicast_v4(&addr.group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbs_core::identity::PeerId;
    use dbs_core::protocol::{MessageKind, PROTOCOL_VERSION};
    use std::time::Duration;

    #[test]
    fn resolve_descriptor() {
        let a = ChannelAddr::resolve("224.0.0.1:8001").unwrap();
        assert_eq!(a.group, Ipv4Addr::new(224, 0, 0, 1));
        assert_eq!(a.port, 8001);
        assert_eq!(a.to_string(), "224.0.0.1:8001");
        assert_eq!(ChannelAddr::resolve(" 239.1.2.3:1 ").unwrap().port, 1);
    }

    #[test]
    fn bad_descriptors_fail_to_join() {
        for d in ["224.0.0.1", "224.0.0.1:port", "224.0.0.1:70000", "10.0.0.1:8001", ":8001"] {
            assert!(
                matches!(ChannelAddr::resolve(d), Err(ChannelError::Join { .. })),
                "{d}"
            );
        }
    }

    #[tokio::test]
    #[ignore = "needs multicast routing on the host"]
    async fn loopback_delivers_to_pool() {
        let channel =
            Arc::new(MulticastChannel::join(ChannelKind::Control, "239.255.77.77:48101").unwrap());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let pool = DispatchPool::spawn(1, 4, move |t: DispatchTask| {
            let _ = tx.send(t.message);
        });
        tokio::spawn(channel.clone().run_receive_loop(pool));

        channel.send(b"garbage").await.unwrap();
        let msg = Message::new(
            PROTOCOL_VERSION,
            PeerId(5),
            &"ab".repeat(32),
            MessageKind::Stored { chunk_no: 3 },
        )
        .unwrap();
        channel.send_message(&msg).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, msg);
    }
}
