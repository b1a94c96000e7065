use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use bgp_packet::{
    encode_keepalive, AfiSafi, BgpMessage, Capability, Header, NotificationPacket, NotifyCode,
    OpenPacket, SessionConfig, HEADER_LEN, MAX_MESSAGE_LEN,
};

use crate::message::UniqueId;
use crate::peer::fsm::Event;
use crate::task::Task;

/// One parsed frame handed back from the reader task, tagged with the peer
/// it arrived from so a shared event loop can dispatch it to the right FSM.
pub struct SessionEvent {
    pub peer: UniqueId,
    pub event: Event,
}

/// Outcome of one outbound connect attempt.
pub struct ConnectResult {
    pub peer: UniqueId,
    pub stream: std::io::Result<TcpStream>,
}

/// Capabilities this side puts in its OPEN. The families list is fixed per
/// instance (one address family per process); the rest matches what the
/// codec can actually negotiate.
#[derive(Debug, Clone)]
pub struct SessionCaps {
    pub four_octet_asn: bool,
    pub route_refresh: bool,
    pub families: Vec<AfiSafi>,
}

impl Default for SessionCaps {
    fn default() -> Self {
        Self { four_octet_asn: true, route_refresh: true, families: vec![AfiSafi::IPV4_UNICAST] }
    }
}

impl SessionCaps {
    pub fn to_wire(&self, local_as: u32) -> Vec<Capability> {
        let mut caps: Vec<Capability> =
            self.families.iter().map(|fam| Capability::MultiProtocol(*fam)).collect();
        if self.route_refresh {
            caps.push(Capability::RouteRefresh);
        }
        if self.four_octet_asn {
            caps.push(Capability::FourOctetAs(local_as));
        }
        caps
    }
}

/// How the reader should parse incoming frames. Starts from the configured
/// expectation and is narrowed once the peer's OPEN arrives (a peer that
/// never advertised four-octet ASNs gets 2-octet AS_PATH parsing). Shared
/// with the reader task, which only ever locks it briefly per frame.
pub type SharedSessionConfig = Arc<Mutex<SessionConfig>>;

/// The write side of an established TCP connection: a channel into a task
/// that owns the socket half, so callers never block on a slow peer.
pub struct SessionWriter {
    packet_tx: UnboundedSender<BytesMut>,
    _writer_task: Task<()>,
}

impl SessionWriter {
    pub fn spawn(write_half: OwnedWriteHalf) -> Self {
        let (packet_tx, packet_rx) = mpsc::unbounded_channel();
        let writer_task = Task::spawn(run_writer(write_half, packet_rx));
        Self { packet_tx, _writer_task: writer_task }
    }

    pub fn send_open(&self, local_as: u32, router_id: Ipv4Addr, hold_time: u16, caps: &SessionCaps) {
        let open = OpenPacket::new(local_as, hold_time, router_id, caps.to_wire(local_as));
        let _ = self.packet_tx.send(open.encode());
    }

    pub fn send_keepalive(&self) {
        let _ = self.packet_tx.send(encode_keepalive());
    }

    pub fn send_notification(&self, code: NotifyCode, subcode: u8, data: Vec<u8>) {
        let _ = self.packet_tx.send(NotificationPacket::new(code, subcode, data).encode());
    }

    /// An already-encoded UPDATE frame; encoding happens at the RibOut
    /// flush, where the batch boundaries and the 4096 limit are decided.
    pub fn send_frame(&self, frame: BytesMut) {
        let _ = self.packet_tx.send(frame);
    }

    /// Hands the queue over for a graceful wind-down: no more messages can
    /// be submitted, but everything already queued (a final NOTIFICATION,
    /// typically) still reaches the wire before the returned task finishes.
    /// Dropping a `SessionWriter` outright instead aborts mid-queue.
    pub fn into_flush_task(self) -> Task<()> {
        let SessionWriter { packet_tx, _writer_task } = self;
        drop(packet_tx);
        _writer_task
    }
}

async fn run_writer(mut write_half: OwnedWriteHalf, mut rx: UnboundedReceiver<BytesMut>) {
    while let Some(msg) = rx.recv().await {
        if write_half.write_all(&msg).await.is_err() {
            return;
        }
    }
}

/// Reads BGP frames off `read_half` until EOF or a fatal framing error,
/// converting each into an `Event` delivered on `tx`. One `read` syscall
/// may deliver several messages or a fraction of one, hence the inner loop
/// re-checking `Header::peek_length` against what is already buffered.
pub fn spawn_reader(
    peer: UniqueId,
    tx: mpsc::Sender<SessionEvent>,
    read_half: OwnedReadHalf,
    cfg: SharedSessionConfig,
) -> Task<()> {
    Task::spawn(run_reader(peer, tx, read_half, cfg))
}

async fn run_reader(
    peer: UniqueId,
    tx: mpsc::Sender<SessionEvent>,
    mut read_half: OwnedReadHalf,
    cfg: SharedSessionConfig,
) {
    let mut buf = BytesMut::with_capacity(MAX_MESSAGE_LEN * 2);
    loop {
        match read_half.read_buf(&mut buf).await {
            Ok(0) | Err(_) => {
                let _ = tx.send(SessionEvent { peer, event: Event::TcpConnectionFails }).await;
                return;
            }
            Ok(_) => loop {
                let frame_len = Header::peek_length(&buf);
                if buf.len() >= HEADER_LEN && frame_len < HEADER_LEN {
                    // A declared length below the header size can never
                    // complete, so waiting for more bytes would hang.
                    let err = bgp_packet::CorruptMessage::header(
                        bgp_packet::header_error::BAD_MESSAGE_LENGTH,
                        (frame_len as u16).to_be_bytes().to_vec(),
                    );
                    let _ = tx.send(SessionEvent { peer, event: Event::CorruptFrame(err) }).await;
                    return;
                }
                if buf.len() < HEADER_LEN || buf.len() < frame_len {
                    break;
                }
                let frame = buf.split_to(frame_len);
                let parse_cfg = cfg.lock().expect("session config lock").clone();
                let event = match BgpMessage::decode(&frame, &parse_cfg) {
                    Ok(msg) => frame_to_event(msg),
                    Err(err) => {
                        let _ =
                            tx.send(SessionEvent { peer, event: Event::CorruptFrame(err) }).await;
                        return;
                    }
                };
                if tx.send(SessionEvent { peer, event }).await.is_err() {
                    return;
                }
            },
        }
    }
}

fn frame_to_event(msg: BgpMessage) -> Event {
    match msg {
        BgpMessage::Open(open) => Event::BgpOpen(open),
        BgpMessage::Update(update) => Event::UpdateMsg(update),
        BgpMessage::Keepalive => Event::KeepAliveMsg,
        BgpMessage::RouteRefresh(refresh) => Event::RouteRefreshMsg(refresh),
        // NotifyCode converts to its numeric form for logging.
        BgpMessage::Notification(packet) => {
            Event::NotifMsg { code: packet.code.into(), sub_code: packet.subcode }
        }
    }
}

/// Opens the outbound TCP connection for an active peer. The socket comes
/// back whole through `tx`; the event loop splits it, attaches the
/// reader/writer, and feeds the FSM a Trans-Open or Trans-Closed event.
pub fn spawn_connect(
    peer: UniqueId,
    addr: std::net::SocketAddr,
    tx: mpsc::Sender<ConnectResult>,
) -> Task<()> {
    Task::spawn(async move {
        let stream = TcpStream::connect(addr).await;
        let _ = tx.send(ConnectResult { peer, stream }).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_include_the_negotiable_set() {
        let caps = SessionCaps::default().to_wire(4_200_000_000);
        assert!(caps.iter().any(|c| matches!(c, Capability::MultiProtocol(f) if *f == AfiSafi::IPV4_UNICAST)));
        assert!(caps.contains(&Capability::RouteRefresh));
        assert!(caps.contains(&Capability::FourOctetAs(4_200_000_000)));
    }
}
