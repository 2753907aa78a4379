//! Remote command service: run console commands on other demo processes.
//!
//! The first process on a machine listens on the service port; later ones
//! connect to it. Every peer can send commands to any other and gets the
//! command's output echoed back. Frames carry JSON-encoded [`RemoteFrame`]s.

use std::time::Duration;

use nebula_net::{
    FrameConfig, FrameError, FramedStream, NetAddress, SocketConfig, TcpListenerHandle,
    TcpStreamHandle,
};
use serde::{Deserialize, Serialize};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteFrame {
    /// Run this console line.
    Command { command: String },
    /// One line of output from a command we sent.
    Echo { line: String },
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("no remote console at index {0}")]
    NoPeer(usize),
    #[error("failed to start remote command service on port {port}: {source}")]
    Start {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("failed to encode remote frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Something a remote console sent us.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    Connected { index: usize, address: NetAddress },
    Disconnected { address: NetAddress },
    Command { from: usize, command: String },
    Echo { from: usize, line: String },
}

struct RemotePeer {
    stream: FramedStream,
    address: NetAddress,
}

/// Hosts or joins the machine-wide remote console network.
pub struct RemoteCommandService {
    listener: Option<TcpListenerHandle>,
    peers: Vec<RemotePeer>,
    socket_config: SocketConfig,
    frame_config: FrameConfig,
}

impl RemoteCommandService {
    /// Listen on `port`, or connect to whoever already does.
    pub fn start(port: u16) -> Result<Self, RemoteError> {
        let address = NetAddress::loopback(port);
        match Self::host(address) {
            Ok(service) => Ok(service),
            Err(host_err) => {
                tracing::debug!("Remote command port taken ({host_err}), connecting instead");
                Self::connect(address)
            }
        }
    }

    /// Listen for remote consoles at `address`.
    pub fn host(address: NetAddress) -> Result<Self, RemoteError> {
        let socket_config = SocketConfig::default();
        let listener = TcpListenerHandle::listen(address, &socket_config).map_err(|source| {
            RemoteError::Start {
                port: address.port(),
                source,
            }
        })?;
        tracing::info!("Remote command service listening on {}", listener.local_address());
        Ok(Self {
            listener: Some(listener),
            peers: Vec::new(),
            socket_config,
            frame_config: FrameConfig::default(),
        })
    }

    /// Connect to the remote console host at `address`.
    pub fn connect(address: NetAddress) -> Result<Self, RemoteError> {
        let socket_config = SocketConfig::default();
        let stream = TcpStreamHandle::connect(address, CONNECT_TIMEOUT, &socket_config)
            .map_err(|source| RemoteError::Start {
                port: address.port(),
                source,
            })?;
        tracing::info!("Connected to remote command service at {address}");
        let frame_config = FrameConfig::default();
        Ok(Self {
            listener: None,
            peers: vec![RemotePeer {
                stream: FramedStream::new(stream, frame_config.clone()),
                address,
            }],
            socket_config,
            frame_config,
        })
    }

    pub fn is_host(&self) -> bool {
        self.listener.is_some()
    }

    pub fn local_address(&self) -> Option<NetAddress> {
        self.listener.as_ref().map(TcpListenerHandle::local_address)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_addresses(&self) -> impl Iterator<Item = NetAddress> + '_ {
        self.peers.iter().map(|peer| peer.address)
    }

    /// Accept new consoles and read everything that arrived.
    ///
    /// Peers that closed or sent garbage are dropped, which shifts the
    /// indices of the peers after them.
    pub fn poll(&mut self) -> Vec<RemoteEvent> {
        let mut events = Vec::new();

        if let Some(listener) = &self.listener {
            loop {
                match listener.accept(&self.socket_config) {
                    Ok(Some(stream)) => {
                        let address = stream.peer_address();
                        self.peers.push(RemotePeer {
                            stream: FramedStream::new(stream, self.frame_config.clone()),
                            address,
                        });
                        tracing::info!("Remote console connected from {address}");
                        events.push(RemoteEvent::Connected {
                            index: self.peers.len() - 1,
                            address,
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("Remote command accept failed: {e}");
                        break;
                    }
                }
            }
        }

        let mut index = 0;
        while index < self.peers.len() {
            match self.read_peer(index, &mut events) {
                Ok(()) => index += 1,
                Err(e) => {
                    let peer = self.peers.remove(index);
                    tracing::info!("Remote console {} left: {e}", peer.address);
                    events.push(RemoteEvent::Disconnected {
                        address: peer.address,
                    });
                }
            }
        }
        events
    }

    fn read_peer(&mut self, index: usize, events: &mut Vec<RemoteEvent>) -> Result<(), RemoteError> {
        let peer = &mut self.peers[index];
        for frame in peer.stream.poll_frames()? {
            match serde_json::from_slice::<RemoteFrame>(&frame)? {
                RemoteFrame::Command { command } => {
                    events.push(RemoteEvent::Command {
                        from: index,
                        command,
                    });
                }
                RemoteFrame::Echo { line } => events.push(RemoteEvent::Echo { from: index, line }),
            }
        }
        Ok(())
    }

    fn send(&mut self, index: usize, frame: &RemoteFrame) -> Result<(), RemoteError> {
        let bytes = serde_json::to_vec(frame)?;
        let peer = self.peers.get_mut(index).ok_or(RemoteError::NoPeer(index))?;
        peer.stream.send_frame(&bytes)?;
        Ok(())
    }

    /// Ask the console at `index` to run `command`.
    pub fn send_command(&mut self, index: usize, command: &str) -> Result<(), RemoteError> {
        self.send(
            index,
            &RemoteFrame::Command {
                command: command.to_string(),
            },
        )
    }

    /// Ask every connected console to run `command`. Returns how many were asked.
    pub fn broadcast_command(&mut self, command: &str) -> usize {
        let mut sent = 0;
        for index in 0..self.peers.len() {
            match self.send_command(index, command) {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!("Remote command to {index} failed: {e}"),
            }
        }
        sent
    }

    /// Send the output of a command back to the console that asked for it.
    pub fn echo(&mut self, index: usize, lines: &[String]) -> Result<(), RemoteError> {
        for line in lines {
            self.send(index, &RemoteFrame::Echo { line: line.clone() })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn poll_until(
        service: &mut RemoteCommandService,
        mut want: impl FnMut(&RemoteEvent) -> bool,
    ) -> Option<RemoteEvent> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Some(event) = service.poll().into_iter().find(|e| want(e)) {
                return Some(event);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        None
    }

    #[test]
    fn test_frame_json_shape() {
        let json = serde_json::to_string(&RemoteFrame::Command {
            command: "net_status".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"command","command":"net_status"}"#);
    }

    #[test]
    fn test_command_and_echo_round_trip() {
        let mut host = RemoteCommandService::host(NetAddress::loopback(0)).unwrap();
        let address = host.local_address().unwrap();
        let mut client = RemoteCommandService::connect(address).unwrap();
        assert!(host.is_host());
        assert!(!client.is_host());

        assert!(poll_until(&mut host, |e| matches!(e, RemoteEvent::Connected { index: 0, .. })).is_some());

        client.send_command(0, "net_sim_loss 0.1").unwrap();
        let command = poll_until(&mut host, |e| matches!(e, RemoteEvent::Command { .. }));
        assert_eq!(
            command,
            Some(RemoteEvent::Command {
                from: 0,
                command: "net_sim_loss 0.1".into()
            })
        );

        host.echo(0, &["loss set to 10%".to_string()]).unwrap();
        let echo = poll_until(&mut client, |e| matches!(e, RemoteEvent::Echo { .. }));
        assert_eq!(
            echo,
            Some(RemoteEvent::Echo {
                from: 0,
                line: "loss set to 10%".into()
            })
        );
    }

    #[test]
    fn test_closed_peer_is_dropped() {
        let mut host = RemoteCommandService::host(NetAddress::loopback(0)).unwrap();
        let client = RemoteCommandService::connect(host.local_address().unwrap()).unwrap();
        assert!(poll_until(&mut host, |e| matches!(e, RemoteEvent::Connected { .. })).is_some());

        drop(client);
        assert!(poll_until(&mut host, |e| matches!(e, RemoteEvent::Disconnected { .. })).is_some());
        assert_eq!(host.peer_count(), 0);
        assert!(matches!(
            host.send_command(0, "quit"),
            Err(RemoteError::NoPeer(0))
        ));
    }
}
