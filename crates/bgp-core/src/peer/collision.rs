use std::net::Ipv4Addr;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use bgp_packet::{
    cease, BgpMessage, Header, NotificationPacket, NotifyCode, OpenPacket, SessionConfig,
    HEADER_LEN, MAX_MESSAGE_LEN,
};

use crate::message::UniqueId;
use crate::task::Task;

/// The peer's OPEN as observed on a second, simultaneously-opened incoming
/// connection, together with the socket it arrived on. Produced by
/// [`spawn_open_reader`]; consumed at resolution time, where the socket
/// either replaces the main FSM's connection or is closed with CEASE.
pub struct AcceptOpen {
    pub peer: UniqueId,
    pub stream: TcpStream,
    pub open: Box<OpenPacket>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The accepted socket's side has the higher router ID: it wins. The
    /// main FSM's existing connection should be torn down and replaced.
    AcceptedWins,
    /// The main FSM's own connection survives; the accepted socket is
    /// closed with CEASE.
    ExistingWins,
}

/// RFC 4271 §6.8: of the two connections between the same pair of
/// speakers, the one initiated by the side with the higher router ID is
/// kept. The accepted socket was initiated by the remote, the existing one
/// by us, so the comparison is remote-ID against our own.
pub fn resolve(local_router_id: Ipv4Addr, remote_router_id: Ipv4Addr) -> Resolution {
    if remote_router_id > local_router_id {
        Resolution::AcceptedWins
    } else {
        Resolution::ExistingWins
    }
}

/// Reads frames off the held socket until the peer's OPEN arrives, without
/// ever sending one of our own: this session observes, it never competes
/// with the main FSM. Anything other than an OPEN before the OPEN (or a
/// broken frame) abandons the socket.
pub fn spawn_open_reader(
    peer: UniqueId,
    mut stream: TcpStream,
    tx: mpsc::Sender<AcceptOpen>,
) -> Task<()> {
    Task::spawn(async move {
        let mut buf = BytesMut::with_capacity(MAX_MESSAGE_LEN);
        loop {
            match stream.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            let frame_len = Header::peek_length(&buf);
            if buf.len() < HEADER_LEN || frame_len < HEADER_LEN || buf.len() < frame_len {
                continue;
            }
            let frame = buf.split_to(frame_len);
            match BgpMessage::decode(&frame, &SessionConfig::default()) {
                Ok(BgpMessage::Open(open)) => {
                    let _ = tx.send(AcceptOpen { peer, stream, open }).await;
                    return;
                }
                Ok(BgpMessage::Keepalive) => continue,
                _ => return,
            }
        }
    })
}

/// Closes the losing socket with NOTIFICATION(CEASE, collision resolution).
pub async fn reject_with_cease(mut stream: TcpStream) {
    let notification = NotificationPacket::new(
        NotifyCode::Cease,
        cease::CONNECTION_COLLISION_RESOLUTION,
        Vec::new(),
    );
    let _ = tokio::io::AsyncWriteExt::write_all(&mut stream, &notification.encode()).await;
    let _ = tokio::io::AsyncWriteExt::shutdown(&mut stream).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_remote_router_id_wins_the_accepted_socket() {
        let low: Ipv4Addr = "1.1.1.1".parse().unwrap();
        let high: Ipv4Addr = "2.2.2.2".parse().unwrap();
        assert_eq!(resolve(low, high), Resolution::AcceptedWins);
        assert_eq!(resolve(high, low), Resolution::ExistingWins);
    }
}
