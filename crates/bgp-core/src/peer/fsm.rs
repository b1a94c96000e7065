use bgp_packet::{CorruptMessage, OpenPacket, RouteRefreshPacket, UpdatePacket};

/// BGP-4 session state, extended with a `Stopped` state beyond RFC 4271's
/// six: an administrative stop has to let a queued NOTIFICATION drain on
/// the wire before the socket closes, so it cannot collapse straight to
/// `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Connect,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
    Stopped,
}

impl State {
    pub fn to_str(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Connect => "Connect",
            Self::Active => "Active",
            Self::OpenSent => "OpenSent",
            Self::OpenConfirm => "OpenConfirm",
            Self::Established => "Established",
            Self::Stopped => "Stopped",
        }
    }

    pub fn is_established(&self) -> bool {
        matches!(self, Self::Established)
    }
}

/// Inputs the FSM reacts to. Unlike the daemon this is extracted from,
/// connection/stream handling lives entirely in `peer::session`; the FSM
/// only sees parsed packets and named lifecycle events.
#[derive(Debug)]
pub enum Event {
    Start,
    ManualStop,
    AutomaticStop,
    ConnectRetryTimerExpires,
    HoldTimerExpires,
    KeepaliveTimerExpires,
    IdleHoldTimerExpires,
    DelayOpenTimerExpires,
    TcpConnectionConfirmed,
    TcpConnectionFails,
    BgpOpen(Box<OpenPacket>),
    NotifMsg { code: u8, sub_code: u8 },
    NotifMsgVerErr,
    KeepAliveMsg,
    UpdateMsg(Box<UpdatePacket>),
    RouteRefreshMsg(RouteRefreshPacket),
    /// A frame that failed wire or semantic validation; carries the
    /// NOTIFICATION the session must emit before dropping to Idle.
    CorruptFrame(CorruptMessage),
    SendQueueDrained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenRejectReason {
    BadPeerAs,
    BadBgpId,
    UnsupportedVersion,
    UnacceptableHoldTime,
}

/// DampPeerOscillations: counts FSM restarts (transitions out of
/// Established) inside `window`; crossing `threshold` sets the next
/// Idle-Hold delay to `idle_holdtime` instead of the configured default,
/// so a flapping peer backs off instead of hot-looping Connect/Active.
#[derive(Debug, Default)]
pub struct DampingState {
    restarts_in_window: u32,
    window_start: Option<std::time::Instant>,
}

impl DampingState {
    pub fn note_restart(
        &mut self,
        now: std::time::Instant,
        window: std::time::Duration,
        threshold: u32,
    ) -> bool {
        match self.window_start {
            Some(start) if now.duration_since(start) < window => {
                self.restarts_in_window += 1;
            }
            _ => {
                self.window_start = Some(now);
                self.restarts_in_window = 1;
            }
        }
        self.restarts_in_window >= threshold
    }

    /// Whether the restart count has crossed `threshold` inside the
    /// current window, the condition that stretches the Idle-Hold timer to
    /// the damping hold time.
    pub fn damped(&self, threshold: u32) -> bool {
        self.restarts_in_window >= threshold
    }

    pub fn reset(&mut self) {
        self.restarts_in_window = 0;
        self.window_start = None;
    }
}

/// Pure state-transition table: given the current state and an event,
/// returns the next state. All side effects (sending OPEN/KEEPALIVE/
/// NOTIFICATION, arming timers, starting the TCP connect task) are the
/// caller's responsibility, driven off the returned state and a comparison
/// against the one passed in — this function never touches a socket.
pub fn next_state(state: State, event: &Event) -> State {
    use State::*;
    match (state, event) {
        (_, Event::ManualStop) => Stopped,
        (_, Event::AutomaticStop) => Stopped,
        (Stopped, Event::SendQueueDrained) => Idle,

        (Idle, Event::Start) => Connect,
        (Idle, Event::IdleHoldTimerExpires) => Connect,

        (Connect, Event::TcpConnectionConfirmed) => OpenSent,
        (Connect, Event::TcpConnectionFails) => Active,
        (Connect, Event::ConnectRetryTimerExpires) => Connect,
        (Connect, Event::DelayOpenTimerExpires) => OpenSent,

        (Active, Event::TcpConnectionConfirmed) => OpenSent,
        (Active, Event::ConnectRetryTimerExpires) => Connect,
        (Active, Event::IdleHoldTimerExpires) => Connect,

        (OpenSent, Event::BgpOpen(_)) => OpenConfirm,
        (OpenSent, Event::TcpConnectionFails) => Active,
        (OpenSent, Event::NotifMsgVerErr) => Idle,
        (OpenSent, Event::HoldTimerExpires) => Idle,

        (OpenConfirm, Event::KeepAliveMsg) => Established,
        (OpenConfirm, Event::NotifMsg { .. }) => Idle,
        (OpenConfirm, Event::HoldTimerExpires) => Idle,
        (OpenConfirm, Event::TcpConnectionFails) => Idle,

        (Established, Event::KeepAliveMsg) => Established,
        (Established, Event::UpdateMsg(_)) => Established,
        (Established, Event::RouteRefreshMsg(_)) => Established,
        (Established, Event::HoldTimerExpires) => Idle,
        (Established, Event::NotifMsg { .. }) => Idle,
        (Established, Event::TcpConnectionFails) => Idle,

        (_, Event::CorruptFrame(_)) => Idle,

        (s, Event::KeepaliveTimerExpires) => s,
        (s, _) => s,
    }
}

/// Validates a received OPEN against locally configured expectations:
/// ASN match, hold-time floor (RFC 4271 §4.2: 0 or >= 3), BGP identifier
/// non-zero. The codec already rejected version mismatches and malformed
/// capability encodings before this ever sees the packet.
pub fn validate_open(configured_peer_as: u32, open: &OpenPacket) -> Result<(), OpenRejectReason> {
    if open.negotiated_as() != configured_peer_as {
        return Err(OpenRejectReason::BadPeerAs);
    }
    if open.hold_time > 0 && open.hold_time < 3 {
        return Err(OpenRejectReason::UnacceptableHoldTime);
    }
    if open.router_id.is_unspecified() {
        return Err(OpenRejectReason::BadBgpId);
    }
    Ok(())
}

impl OpenRejectReason {
    /// The OPEN-error subcode reported in the rejecting NOTIFICATION.
    pub fn subcode(&self) -> u8 {
        use bgp_packet::open_error;
        match self {
            Self::BadPeerAs => open_error::BAD_PEER_AS,
            Self::BadBgpId => open_error::BAD_BGP_IDENTIFIER,
            Self::UnsupportedVersion => open_error::UNSUPPORTED_VERSION_NUMBER,
            Self::UnacceptableHoldTime => open_error::UNACCEPTABLE_HOLD_TIME,
        }
    }
}
