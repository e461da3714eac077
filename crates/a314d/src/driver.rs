//! The daemon driver: one task that owns every piece of daemon state and
//! multiplexes the interrupt line, the client listener, and client I/O
//! events.
//!
//! Suspension points are exactly the arms of the select loop; bus commands
//! are issued inline (they are sub-millisecond), and client sockets are
//! serviced by their own reader/writer tasks which communicate with the
//! driver purely through message passing. Nothing here is shared, so
//! nothing here is locked.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{Notify, mpsc};

use a314_transport::{Bus, IrqLine};
use a314_wire::{
    CONNECT_OK, CONNECT_UNKNOWN_SERVICE, MAX_PKT_PAYLOAD, MessageHeader, MsgType, PacketReader,
    PacketType, peer_event,
};

use crate::channel::{Association, Channels};
use crate::client::{Client, ClientEvent, ClientId};
use crate::config::DaemonConfig;
use crate::ring::RingState;
use crate::service::ServiceMap;
use crate::spawn::spawn_on_demand;

/// Why the daemon stopped.
#[derive(Debug)]
pub enum DaemonError {
    /// An I/O failure the daemon does not tolerate: the bus, the listener,
    /// or an unexpected client socket error.
    Io(io::Error),
    /// The peer's protocol state no longer matches ours; there is no safe
    /// way to continue.
    PeerDesync { context: String },
}

impl std::fmt::Display for DaemonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonError::Io(e) => write!(f, "I/O error: {e}"),
            DaemonError::PeerDesync { context } => {
                write!(f, "peer protocol desynchronization: {context}")
            }
        }
    }
}

impl std::error::Error for DaemonError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DaemonError::Io(e) => Some(e),
            DaemonError::PeerDesync { .. } => None,
        }
    }
}

impl From<io::Error> for DaemonError {
    fn from(e: io::Error) -> Self {
        DaemonError::Io(e)
    }
}

/// The a314 bridge daemon.
///
/// Generic over the bus and interrupt implementations so the whole daemon
/// runs unmodified against the in-memory transport in tests.
pub struct Daemon<B: Bus, I: IrqLine> {
    bus: B,
    irq: I,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    cfg: DaemonConfig,
    shutdown: Arc<Notify>,

    ring: RingState,
    channels: Channels,
    clients: HashMap<ClientId, Client>,
    services: ServiceMap,
    next_client_id: u32,

    events_tx: mpsc::UnboundedSender<ClientEvent>,
    events_rx: mpsc::UnboundedReceiver<ClientEvent>,
}

/// Listen backlog for the client socket.
const LISTEN_BACKLOG: u32 = 16;

impl<B: Bus, I: IrqLine> Daemon<B, I> {
    /// Bind the client listener and assemble the daemon.
    pub async fn bind(bus: B, irq: I, cfg: DaemonConfig) -> io::Result<Self> {
        let socket = match cfg.listen_addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.bind(cfg.listen_addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;
        let local_addr = listener.local_addr()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            bus,
            irq,
            listener: Some(listener),
            local_addr,
            cfg,
            shutdown: Arc::new(Notify::new()),
            ring: RingState::new(),
            channels: Channels::new(),
            clients: HashMap::new(),
            services: ServiceMap::new(),
            next_client_id: 0,
            events_tx,
            events_rx,
        })
    }

    /// Address the listener actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle used to request a graceful shutdown (SIGTERM forwards here).
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until shutdown is requested, then drain and return.
    pub async fn run(mut self) -> Result<(), DaemonError> {
        tracing::info!(addr = %self.local_addr, "listening for clients");

        // A peer that signalled before we attached left the interrupt
        // level asserted; service it once up front.
        self.tick()?;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => break,

                Some(event) = self.events_rx.recv() => {
                    self.on_client_event(event)?;
                    // client work may have filled channel queues
                    self.flush()?;
                }

                result = accept_next(&self.listener) => {
                    let (stream, addr) = result.map_err(DaemonError::Io)?;
                    self.admit_tcp(stream, addr);
                }

                result = self.irq.wait() => {
                    result.map_err(DaemonError::Io)?;
                    self.tick()?;
                }
            }
        }

        self.drain().await
    }

    // ── interrupt path ────────────────────────────────────────────────────────

    /// One pass of interrupt acknowledgement, A2R ingestion, R2A emission,
    /// and event publication.
    fn tick(&mut self) -> Result<(), DaemonError> {
        let events = self.bus.ack_irq()?;
        if events == 0 {
            return Ok(());
        }
        tracing::trace!(events, "tick");

        if events & peer_event::BASE_ADDRESS != 0 || !self.ring.has_base() {
            if self.ring.has_base() && !self.channels.is_empty() {
                tracing::info!(
                    "base address changed while logical channels are open; resetting channels"
                );
            }
            self.reset_all_channels();
            self.ring.read_base_address(&mut self.bus)?;
        }
        if !self.ring.has_base() {
            return Ok(());
        }

        self.ring.read_status(&mut self.bus)?;

        if let Some(region) = self.ring.ingest_a2r(&mut self.bus)? {
            for packet in PacketReader::new(&region) {
                let packet = packet.map_err(|e| DaemonError::PeerDesync {
                    context: e.to_string(),
                })?;
                self.on_peer_packet(packet.ptype, packet.channel_id, packet.payload)?;
            }
        }

        self.ring.emit_r2a(&mut self.bus, &mut self.channels)?;
        self.ring.publish(&mut self.bus)?;
        Ok(())
    }

    /// Emit and publish outside the interrupt path. Uses the index snapshot
    /// from the last tick; the peer-owned head can only have advanced, so
    /// the free-space estimate errs on the safe side.
    fn flush(&mut self) -> Result<(), DaemonError> {
        self.ring.emit_r2a(&mut self.bus, &mut self.channels)?;
        self.ring.publish(&mut self.bus)?;
        Ok(())
    }

    // ── peer packets ──────────────────────────────────────────────────────────

    fn on_peer_packet(
        &mut self,
        ptype: u8,
        channel_id: u8,
        payload: &[u8],
    ) -> Result<(), DaemonError> {
        match PacketType::from_wire(ptype) {
            Some(PacketType::Connect) => self.on_pkt_connect(channel_id, payload)?,
            Some(PacketType::Data) => self.on_pkt_data(channel_id, payload),
            Some(PacketType::Eos) => self.on_pkt_eos(channel_id),
            Some(PacketType::Reset) => self.on_pkt_reset(channel_id),
            Some(PacketType::ConnectResponse) | None => {
                tracing::debug!(ptype, channel_id, "ignoring unexpected peer packet");
            }
        }
        self.channels.collect(channel_id);
        Ok(())
    }

    fn on_pkt_connect(&mut self, channel_id: u8, name: &[u8]) -> Result<(), DaemonError> {
        if self.channels.contains(channel_id) {
            // The peer believes this id is free; our states have diverged
            // beyond repair.
            return Err(DaemonError::PeerDesync {
                context: format!("connect on live channel {channel_id}"),
            });
        }
        self.channels.insert_new(channel_id);

        tracing::debug!(
            channel_id,
            service = %String::from_utf8_lossy(name),
            "peer connect"
        );

        if let Some(owner) = self.services.lookup(name) {
            self.associate_and_deliver(channel_id, owner, name);
            return Ok(());
        }

        if let Some(entry) = self
            .cfg
            .on_demand
            .iter()
            .find(|e| e.service_name.as_bytes() == name)
            .cloned()
        {
            let stream = spawn_on_demand(&entry)?;
            let owner = self.admit(stream);
            self.services.register(name, owner);
            self.associate_and_deliver(channel_id, owner, name);
            return Ok(());
        }

        self.channels.enqueue(
            channel_id,
            PacketType::ConnectResponse.wire(),
            vec![CONNECT_UNKNOWN_SERVICE],
        );
        Ok(())
    }

    fn associate_and_deliver(&mut self, channel_id: u8, owner: ClientId, name: &[u8]) {
        let Some(client) = self.clients.get_mut(&owner) else {
            self.channels.enqueue(
                channel_id,
                PacketType::ConnectResponse.wire(),
                vec![CONNECT_UNKNOWN_SERVICE],
            );
            return;
        };
        let stream_id = client.alloc_stream_id();
        client.channels.insert(channel_id);
        client.send_msg(MsgType::Connect.wire(), stream_id, name);
        self.channels.associate(channel_id, Association {
            client: owner,
            stream_id,
        });
    }

    fn on_pkt_data(&mut self, channel_id: u8, payload: &[u8]) {
        let Some(ch) = self.channels.get(channel_id) else {
            return;
        };
        if ch.eos_from_peer {
            return;
        }
        if let Some(assoc) = ch.association
            && let Some(client) = self.clients.get(&assoc.client)
        {
            client.send_msg(MsgType::Data.wire(), assoc.stream_id, payload);
        }
    }

    fn on_pkt_eos(&mut self, channel_id: u8) {
        let Some(ch) = self.channels.get_mut(channel_id) else {
            return;
        };
        let Some(assoc) = ch.association else {
            return;
        };
        if ch.eos_from_peer {
            return;
        }
        ch.eos_from_peer = true;
        let both_closed = ch.eos_from_client;

        if let Some(client) = self.clients.get(&assoc.client) {
            client.send_msg(MsgType::Eos.wire(), assoc.stream_id, &[]);
        }
        if both_closed {
            self.disassociate(channel_id);
        }
    }

    fn on_pkt_reset(&mut self, channel_id: u8) {
        if !self.channels.contains(channel_id) {
            return;
        }
        self.channels.clear_queue(channel_id);
        if let Some(assoc) = self.channels.get(channel_id).and_then(|ch| ch.association) {
            if let Some(client) = self.clients.get(&assoc.client) {
                client.send_msg(MsgType::Reset.wire(), assoc.stream_id, &[]);
            }
            self.disassociate(channel_id);
        }
    }

    /// Unbind a channel from its client, maintaining both directions of the
    /// association.
    fn disassociate(&mut self, channel_id: u8) {
        if let Some(assoc) = self.channels.disassociate(channel_id)
            && let Some(client) = self.clients.get_mut(&assoc.client)
        {
            client.channels.remove(&channel_id);
        }
    }

    // ── client events ─────────────────────────────────────────────────────────

    fn on_client_event(&mut self, event: ClientEvent) -> Result<(), DaemonError> {
        match event {
            ClientEvent::Message {
                client,
                header,
                payload,
            } => self.on_client_message(client, header, payload),
            ClientEvent::Disconnected { client } => {
                self.teardown_client(client);
                Ok(())
            }
            ClientEvent::Fatal { client, error } => {
                // stale events can arrive for a client already torn down
                if !self.clients.contains_key(&client) {
                    return Ok(());
                }
                tracing::error!(%client, %error, "client socket failed unexpectedly");
                Err(DaemonError::Io(error))
            }
        }
    }

    fn on_client_message(
        &mut self,
        client: ClientId,
        header: MessageHeader,
        payload: Vec<u8>,
    ) -> Result<(), DaemonError> {
        // events can race a teardown; messages from a gone client are stale
        if !self.clients.contains_key(&client) {
            return Ok(());
        }
        tracing::trace!(
            %client,
            msg_type = header.msg_type,
            stream_id = header.stream_id,
            length = header.length,
            "client message"
        );

        match MsgType::from_wire(header.msg_type) {
            Some(MsgType::RegisterReq) => {
                let ok = self.services.register(&payload, client);
                self.reply(client, MsgType::RegisterRes, ok);
                Ok(())
            }
            Some(MsgType::DeregisterReq) => {
                let ok = self.services.deregister(&payload, client);
                self.reply(client, MsgType::DeregisterRes, ok);
                Ok(())
            }
            Some(MsgType::ReadMemReq) => self.on_msg_read_mem(client, &payload),
            Some(MsgType::WriteMemReq) => self.on_msg_write_mem(client, &payload),
            Some(MsgType::Connect) => {
                // reserved: a client dialing a peer-side service
                tracing::warn!(%client, "client-initiated connect is not implemented; dropping");
                Ok(())
            }
            Some(MsgType::ConnectResponse) => {
                self.on_msg_connect_response(client, header.stream_id, payload);
                Ok(())
            }
            Some(MsgType::Data) => {
                self.on_msg_data(client, header.stream_id, payload);
                Ok(())
            }
            Some(MsgType::Eos) => {
                self.on_msg_eos(client, header.stream_id);
                Ok(())
            }
            Some(MsgType::Reset) => {
                self.on_msg_reset(client, header.stream_id);
                Ok(())
            }
            Some(
                MsgType::RegisterRes
                | MsgType::DeregisterRes
                | MsgType::ReadMemRes
                | MsgType::WriteMemRes,
            )
            | None => {
                tracing::warn!(
                    %client,
                    msg_type = header.msg_type,
                    "malformed message type from client; closing connection"
                );
                self.teardown_client(client);
                Ok(())
            }
        }
    }

    fn reply(&self, client: ClientId, msg_type: MsgType, ok: bool) {
        if let Some(cc) = self.clients.get(&client) {
            let result = if ok {
                a314_wire::MSG_SUCCESS
            } else {
                a314_wire::MSG_FAIL
            };
            cc.send_msg(msg_type.wire(), 0, &[result]);
        }
    }

    fn on_msg_read_mem(&mut self, client: ClientId, payload: &[u8]) -> Result<(), DaemonError> {
        let Some((addr, len)) = parse_addr_len(payload) else {
            tracing::warn!(%client, "malformed read-mem request; closing connection");
            self.teardown_client(client);
            return Ok(());
        };
        let mut buf = vec![0u8; len as usize];
        self.bus.read_mem(addr, &mut buf)?;
        if let Some(cc) = self.clients.get(&client) {
            cc.send_msg(MsgType::ReadMemRes.wire(), 0, &buf);
        }
        Ok(())
    }

    fn on_msg_write_mem(&mut self, client: ClientId, payload: &[u8]) -> Result<(), DaemonError> {
        let Some(addr) = read_u32_le(payload, 0) else {
            tracing::warn!(%client, "malformed write-mem request; closing connection");
            self.teardown_client(client);
            return Ok(());
        };
        self.bus.write_mem(addr, &payload[4..])?;
        if let Some(cc) = self.clients.get(&client) {
            cc.send_msg(MsgType::WriteMemRes.wire(), 0, &[]);
        }
        Ok(())
    }

    /// Find the channel bound to (client, stream_id).
    fn find_channel(&self, client: ClientId, stream_id: u32) -> Option<u8> {
        let cc = self.clients.get(&client)?;
        cc.channels.iter().copied().find(|&id| {
            self.channels
                .get(id)
                .and_then(|ch| ch.association)
                .is_some_and(|assoc| assoc.client == client && assoc.stream_id == stream_id)
        })
    }

    fn on_msg_connect_response(&mut self, client: ClientId, stream_id: u32, payload: Vec<u8>) {
        let Some(channel_id) = self.find_channel(client, stream_id) else {
            return;
        };
        let Some(&code) = payload.first() else {
            tracing::warn!(%client, "empty connect response; closing connection");
            self.teardown_client(client);
            return;
        };
        self.channels
            .enqueue(channel_id, PacketType::ConnectResponse.wire(), payload);
        if code != CONNECT_OK {
            self.disassociate(channel_id);
        }
        self.channels.collect(channel_id);
    }

    fn on_msg_data(&mut self, client: ClientId, stream_id: u32, payload: Vec<u8>) {
        let Some(channel_id) = self.find_channel(client, stream_id) else {
            return;
        };
        if payload.len() > MAX_PKT_PAYLOAD {
            tracing::warn!(
                %client,
                length = payload.len(),
                "data message exceeds ring packet capacity; closing connection"
            );
            self.teardown_client(client);
            return;
        }
        self.channels
            .enqueue(channel_id, PacketType::Data.wire(), payload);
    }

    fn on_msg_eos(&mut self, client: ClientId, stream_id: u32) {
        let Some(channel_id) = self.find_channel(client, stream_id) else {
            return;
        };
        let Some(ch) = self.channels.get_mut(channel_id) else {
            return;
        };
        if ch.eos_from_client {
            return;
        }
        ch.eos_from_client = true;
        let both_closed = ch.eos_from_peer;

        self.channels
            .enqueue(channel_id, PacketType::Eos.wire(), Vec::new());
        if both_closed {
            self.disassociate(channel_id);
        }
        self.channels.collect(channel_id);
    }

    fn on_msg_reset(&mut self, client: ClientId, stream_id: u32) {
        let Some(channel_id) = self.find_channel(client, stream_id) else {
            return;
        };
        self.disassociate(channel_id);
        self.channels.clear_queue(channel_id);
        self.channels
            .enqueue(channel_id, PacketType::Reset.wire(), Vec::new());
    }

    // ── client lifecycle ──────────────────────────────────────────────────────

    fn admit_tcp(&mut self, stream: TcpStream, addr: SocketAddr) {
        if let Err(error) = stream.set_nodelay(true) {
            tracing::warn!(%addr, %error, "failed to set NODELAY on accepted socket");
        }
        let id = self.admit(stream);
        tracing::info!(client = %id, %addr, "client connected");
    }

    fn admit<S>(&mut self, stream: S) -> ClientId
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = ClientId(self.next_client_id);
        self.next_client_id += 1;
        let client = Client::spawn(id, stream, self.events_tx.clone());
        self.clients.insert(id, client);
        id
    }

    /// Remove a client: drop its registrations and reset every channel it
    /// was associated with. The reset packets drain through the normal
    /// send path.
    fn teardown_client(&mut self, id: ClientId) {
        let Some(client) = self.clients.remove(&id) else {
            return;
        };
        client.abort_io();
        self.services.remove_owner(id);

        for channel_id in client.channels {
            self.channels.clear_queue(channel_id);
            self.channels.disassociate(channel_id);
            self.channels
                .enqueue(channel_id, PacketType::Reset.wire(), Vec::new());
        }
        tracing::info!(client = %id, "client disconnected");
    }

    /// Tear down every channel at once (peer re-initialized or daemon
    /// shutdown), notifying associated clients. Queued packets are
    /// discarded; the peer that caused this is not listening for them.
    fn reset_all_channels(&mut self) {
        for (channel_id, assoc) in self.channels.drain_all() {
            if let Some(client) = self.clients.get_mut(&assoc.client) {
                client.channels.remove(&channel_id);
                client.send_msg(MsgType::Reset.wire(), assoc.stream_id, &[]);
            }
        }
    }

    // ── shutdown ──────────────────────────────────────────────────────────────

    /// Stop accepting, reset all client streams, then keep servicing
    /// interrupts until the remaining channel queues drain or the budget
    /// runs out.
    async fn drain(mut self) -> Result<(), DaemonError> {
        tracing::info!("shutting down");
        self.listener = None;

        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        for id in ids {
            self.teardown_client(id);
        }
        self.flush()?;

        if self.channels.is_empty() {
            return Ok(());
        }
        tracing::info!(channels = self.channels.len(), "draining remaining channels");

        let deadline = tokio::time::Instant::now() + self.cfg.drain_timeout;
        while !self.channels.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(
                        channels = self.channels.len(),
                        "drain budget elapsed with channels remaining"
                    );
                    break;
                }
                result = self.irq.wait() => {
                    result.map_err(DaemonError::Io)?;
                    self.tick()?;
                }
            }
        }
        Ok(())
    }
}

/// Accept on the listener, or park forever once it has been closed.
async fn accept_next(listener: &Option<TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

fn read_u32_le(payload: &[u8], at: usize) -> Option<u32> {
    let bytes = payload.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn parse_addr_len(payload: &[u8]) -> Option<(u32, u32)> {
    Some((read_u32_le(payload, 0)?, read_u32_le(payload, 4)?))
}
