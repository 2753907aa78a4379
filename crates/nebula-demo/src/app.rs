//! The demo application: one session, its replicated ships and the console.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, unbounded};
use nebula_config::Config;
use nebula_multiplayer::{NetObjectConfig, NetObjectError, NetObjectEvent, NetObjectSystem};
use nebula_net::{
    ConditionerConfig, ConnectionConfig, ConnectionStats, MessageError, MessageOptions, NetAddress, NetError,
    NetSession, SessionConfig, SessionEvent, SocketConfig,
};
use rand::Rng;

use crate::console::{Command, HELP, parse_command};
use crate::remote::{RemoteCommandService, RemoteError, RemoteEvent};
use crate::ships::{SHIP_TYPE, Ship, ShipType, ShipWorld};

/// Message index of the chat line sent by `say`.
pub const CHAT_MESSAGE: u8 = 32;

#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    #[error(transparent)]
    Net(#[from] NetError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Object(#[from] NetObjectError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Build the session settings from the loaded config.
pub fn session_config(config: &Config) -> SessionConfig {
    let net = &config.network;
    let sim = &config.simulation;
    SessionConfig {
        max_clients: net.max_clients,
        connection_timeout: Duration::from_millis(net.connection_timeout_ms),
        join_timeout: Duration::from_millis(net.join_timeout_ms),
        join_resend_interval: Duration::from_millis(net.join_resend_ms),
        tick_rate_hz: net.tick_rate_hz,
        client_port: net.client_port,
        connection: ConnectionConfig {
            send_rate_hz: net.send_rate_hz,
            heartbeat_interval: Duration::from_millis(net.heartbeat_interval_ms),
        },
        conditioner: ConditionerConfig {
            loss_rate: sim.loss_rate,
            min_latency: Duration::from_millis(sim.latency_min_ms),
            max_latency: Duration::from_millis(sim.latency_max_ms),
        },
        conditioner_seed: sim.seed,
        socket: SocketConfig::default(),
    }
}

pub struct DemoApp {
    config: Config,
    session: NetSession,
    objects: NetObjectSystem<ShipWorld>,
    world: ShipWorld,
    chat: Receiver<String>,
    remote: Option<RemoteCommandService>,
    quit_requested: bool,
}

impl DemoApp {
    pub fn new(config: Config) -> Result<Self, DemoError> {
        let mut session = NetSession::new(session_config(&config));

        let (chat_tx, chat) = unbounded();
        session.register_message(
            CHAT_MESSAGE,
            "chat",
            MessageOptions::RELIABLE_IN_ORDER,
            0,
            move |msg, sender, _| match msg.read_string() {
                Ok(text) => {
                    let _ = chat_tx.send(format!("[{}] {}", sender.peer_id, text));
                }
                Err(e) => tracing::debug!("Bad chat message from {}: {e}", sender.address),
            },
        )?;

        let objects = NetObjectSystem::new(NetObjectConfig {
            snapshot_rate_hz: config.network.snapshot_rate_hz,
        });
        objects.attach(&mut session)?;
        let mut app = Self {
            config,
            session,
            objects,
            world: ShipWorld::default(),
            chat,
            remote: None,
            quit_requested: false,
        };
        app.objects.register_type(SHIP_TYPE, ShipType)?;
        Ok(app)
    }

    /// Join the machine's remote console network on the configured port.
    pub fn start_remote(&mut self) -> Result<(), DemoError> {
        self.remote = Some(RemoteCommandService::start(self.config.network.rcs_port)?);
        Ok(())
    }

    pub fn session(&self) -> &NetSession {
        &self.session
    }

    pub fn world(&self) -> &ShipWorld {
        &self.world
    }

    pub fn quit_requested(&self) -> bool {
        self.quit_requested
    }

    /// Parse and run one console line, returning its output.
    pub fn run_line(&mut self, line: &str) -> Vec<String> {
        match parse_command(line) {
            Ok(Some(command)) => self.execute(command),
            Ok(None) => Vec::new(),
            Err(e) => vec![e.to_string()],
        }
    }

    pub fn execute(&mut self, command: Command) -> Vec<String> {
        let player_id = self.config.network.player_id.clone();
        match command {
            Command::Host { port } => {
                let port = port.unwrap_or(self.config.network.host_port);
                match self.session.host(&player_id, port) {
                    Ok(()) => self.bound_line("hosting"),
                    Err(e) => vec![format!("host failed: {e}")],
                }
            }
            Command::Join { address } => {
                let text = address.unwrap_or_else(|| self.config.network.join_address.clone());
                let result = NetAddress::resolve(&text)
                    .map_err(|e| e.to_string())
                    .and_then(|addr| {
                        self.session
                            .join(&player_id, addr)
                            .map(|()| addr)
                            .map_err(|e| e.to_string())
                    });
                match result {
                    Ok(addr) => vec![format!("joining {addr} as {player_id}")],
                    Err(e) => vec![format!("join failed: {e}")],
                }
            }
            Command::Disconnect => {
                self.session.disconnect();
                vec!["disconnected".into()]
            }
            Command::SimLag { min, max } => {
                self.session.set_simulated_latency(min, max);
                vec![format!(
                    "simulated latency {}-{} ms",
                    min.as_millis(),
                    max.as_millis()
                )]
            }
            Command::SimLoss { rate } => {
                self.session.set_simulated_loss(rate);
                vec![format!("simulated loss {:.1}%", rate * 100.0)]
            }
            Command::SetTickRate { hz } => {
                self.session.set_tick_rate(hz);
                vec![format!("tick rate {hz} Hz")]
            }
            Command::SetSendRate { index, hz } => match self.session.set_send_rate(index, hz) {
                Ok(()) => vec![format!("connection {index} sends at {hz} Hz")],
                Err(e) => vec![e.to_string()],
            },
            Command::Status => self.status_lines(),
            Command::Ping { address, text } => {
                let result = NetAddress::resolve(&address)
                    .map_err(|e| e.to_string())
                    .and_then(|addr| self.session.send_ping(addr, &text).map_err(|e| e.to_string()));
                match result {
                    Ok(()) => Vec::new(),
                    Err(e) => vec![format!("ping failed: {e}")],
                }
            }
            Command::Say { text } => match self.say(&text) {
                Ok(_) => vec![format!("[{player_id}] {text}")],
                Err(e) => vec![format!("say failed: {e}")],
            },
            Command::Spawn => self.spawn(),
            Command::Remote { index, command } => match &mut self.remote {
                Some(remote) => match remote.send_command(index, &command) {
                    Ok(()) => Vec::new(),
                    Err(e) => vec![e.to_string()],
                },
                None => vec!["remote command service is not running".into()],
            },
            Command::RemoteAll { command } => match &mut self.remote {
                Some(remote) => {
                    let sent = remote.broadcast_command(&command);
                    vec![format!("sent to {sent} remote console(s)")]
                }
                None => vec!["remote command service is not running".into()],
            },
            Command::Help => HELP.iter().map(|line| line.to_string()).collect(),
            Command::Quit => {
                self.quit_requested = true;
                Vec::new()
            }
        }
    }

    fn bound_line(&self, what: &str) -> Vec<String> {
        match self.session.local_address() {
            Some(addr) => vec![format!("{what} on {addr}")],
            None => vec![what.to_string()],
        }
    }

    fn say(&mut self, text: &str) -> Result<usize, DemoError> {
        let mut msg = self.session.create_message("chat")?;
        msg.write_string(text)?;
        Ok(self.session.broadcast(msg)?)
    }

    fn spawn(&mut self) -> Vec<String> {
        if !self.session.is_host() {
            return vec!["only the host can spawn ships".into()];
        }
        let mut rng = rand::rng();
        let ship = Ship {
            owner: self.config.network.player_id.clone(),
            position: [rng.random_range(-50.0..50.0), rng.random_range(-50.0..50.0)],
            velocity: [rng.random_range(-20.0..20.0), rng.random_range(-20.0..20.0)],
        };
        let key = self.world.spawn(ship);
        match self
            .objects
            .sync_object(&mut self.session, &self.world, SHIP_TYPE, key)
        {
            Ok(id) => vec![format!("spawned ship {}", id.0)],
            Err(e) => {
                self.world.remove(key);
                vec![format!("spawn failed: {e}")]
            }
        }
    }

    /// One frame: network in, replication, simulation, network out.
    ///
    /// Returns console output produced along the way.
    pub fn frame(&mut self, now: Instant, dt: Duration) -> Vec<String> {
        let mut output = self.poll_remote();

        self.session.process_incoming_at(now);
        for event in self.objects.update(&mut self.session, &mut self.world, now) {
            match event {
                NetObjectEvent::Created { id, key, .. } => {
                    tracing::debug!("Replicated object {:?} created as {:?}", id, key)
                }
                NetObjectEvent::Destroyed { id, .. } => {
                    tracing::debug!("Replicated object {:?} destroyed", id)
                }
            }
        }
        self.world.tick(dt);
        self.session.process_outgoing_at(now);

        output.extend(self.chat.try_iter());
        let events: Vec<SessionEvent> = self.session.drain_events().collect();
        output.extend(events.iter().map(describe_event));
        output
    }

    fn poll_remote(&mut self) -> Vec<String> {
        let Some(remote) = &mut self.remote else {
            return Vec::new();
        };
        let mut output = Vec::new();
        for event in remote.poll() {
            match event {
                RemoteEvent::Connected { index, address } => {
                    output.push(format!("remote console {index} connected from {address}"))
                }
                RemoteEvent::Disconnected { address } => {
                    output.push(format!("remote console {address} disconnected"))
                }
                RemoteEvent::Echo { from, line } => output.push(format!("[rc {from}] {line}")),
                RemoteEvent::Command { from, command } => {
                    output.push(format!("[rc {from}] > {command}"));
                    let lines = self.run_line(&command);
                    output.extend(lines.iter().cloned());
                    if let Some(remote) = &mut self.remote
                        && let Err(e) = remote.echo(from, &lines)
                    {
                        tracing::warn!("Failed to echo to remote console {from}: {e}");
                    }
                }
            }
        }
        output
    }

    /// Connection table for `net_status`.
    pub fn status_lines(&self) -> Vec<String> {
        let session = &self.session;
        let counters = session.counters();
        let conditions = session.conditions();
        let mut lines = vec![
            format!(
                "{:?} as {} index {} on {}",
                session.state(),
                if session.local_id().is_empty() {
                    "-"
                } else {
                    session.local_id()
                },
                session
                    .my_index()
                    .map_or_else(|| "-".to_string(), |i| i.to_string()),
                session
                    .local_address()
                    .map_or_else(|| "-".to_string(), |a| a.to_string()),
            ),
            format!(
                "host time {} ms | sim {}-{} ms, {:.1}% loss | rx {} tx {} dropped {} malformed {}",
                session.current_host_time(),
                conditions.min_latency.as_millis(),
                conditions.max_latency.as_millis(),
                conditions.loss_rate * 100.0,
                counters.packets_received,
                counters.packets_sent,
                counters.packets_dropped,
                counters.packets_malformed,
            ),
            format!(
                "{:>3} {:<12} {:<21} {:<12} {:>7} {:>6} {:>6} {:>6} {:<32} {:>5}",
                "idx", "peer", "address", "state", "rtt", "loss", "sent", "recv", "ack bits", "unack"
            ),
        ];
        lines.extend(session.connection_stats().iter().map(format_stats));
        lines.push(format!(
            "{} synced, {} remote, {} ships",
            self.objects.synced_count(),
            self.objects.remote_count(),
            self.world.len()
        ));
        if let Some(remote) = &self.remote {
            let role = if remote.is_host() { "hosting" } else { "joined" };
            let peers: Vec<String> = remote
                .peer_addresses()
                .enumerate()
                .map(|(i, addr)| format!("{i}={addr}"))
                .collect();
            lines.push(format!("remote consoles ({role}): {}", peers.join(" ")));
        }
        lines
    }
}

fn format_stats(stats: &ConnectionStats) -> String {
    format!(
        "{:>3} {:<12} {:<21} {:<12} {:>5}ms {:>5.1}% {:>6} {:>6} {:032b} {:>5}",
        stats
            .index
            .map_or_else(|| "-".to_string(), |i| i.to_string()),
        if stats.is_local {
            format!("{} (me)", stats.peer_id)
        } else {
            stats.peer_id.clone()
        },
        stats.address.to_string(),
        format!("{:?}", stats.state),
        stats.link.rtt.as_millis(),
        stats.link.loss_rate * 100.0,
        stats.last_sent_ack,
        stats.last_received_ack,
        stats.received_ack_bits,
        stats.unconfirmed_reliables + stats.queued_reliables,
    )
}

fn describe_event(event: &SessionEvent) -> String {
    match event {
        SessionEvent::Hosted { address } => format!("hosting on {address}"),
        SessionEvent::JoinAccepted { index, host_id } => {
            format!("accepted by {host_id} as index {index}")
        }
        SessionEvent::Joined => "joined".into(),
        SessionEvent::JoinDenied { reason } => format!("join denied: {reason}"),
        SessionEvent::Disconnected { reason } => format!("disconnected: {reason}"),
        SessionEvent::ConnectionJoined { index, peer_id, .. } => {
            format!("{peer_id} joined as index {index}")
        }
        SessionEvent::ConnectionLeft { peer_id, .. } => format!("{peer_id} left"),
        SessionEvent::Pong { from, text, rtt } => match rtt {
            Some(rtt) => format!("pong from {from}: {text} ({} ms)", rtt.as_millis()),
            None => format!("pong from {from}: {text}"),
        },
    }
}
