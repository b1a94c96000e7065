use std::cmp::min;

use tokio::sync::mpsc::Sender;

use crate::config::TimerConfig;
use crate::message::UniqueId;
use crate::peer::fsm::{Event, State};
use crate::task::Timer;

/// Negotiated (as opposed to configured) per-session timer values, set once
/// from the peer's own `TimerConfig` and the remote's OPEN.
#[derive(Debug, Default, Clone, Copy)]
pub struct NegotiatedParams {
    pub hold_time: u16,
    pub keepalive: u16,
}

/// Live timer handles for one peer. `None` means "not currently armed";
/// `update_timers` is responsible for arming/disarming these to match
/// `state`, mirroring the per-state timer table a BGP FSM implementation
/// needs regardless of language.
#[derive(Default)]
pub struct PeerTimers {
    pub idle_hold_timer: Option<Timer>,
    pub connect_retry: Option<Timer>,
    pub hold_timer: Option<Timer>,
    pub keepalive: Option<Timer>,
}

/// One event sent from a timer firing back into the owning event loop —
/// timers never touch FSM state directly, since that state lives behind the
/// single-threaded pipeline's `RefCell`s.
pub struct TimerEvent {
    pub peer: UniqueId,
    pub event: Event,
}

fn start_timer(peer: UniqueId, tx: Sender<TimerEvent>, secs: u64, make_event: impl Fn() -> Event + Send + 'static) -> Timer {
    Timer::once(secs, move || {
        let tx = tx.clone();
        let event = make_event();
        async move {
            let _ = tx.send(TimerEvent { peer, event }).await;
        }
    })
}

fn start_repeater(peer: UniqueId, tx: Sender<TimerEvent>, secs: u64, make_event: impl Fn() -> Event + Send + 'static) -> Timer {
    Timer::repeat(secs, move || {
        let tx = tx.clone();
        let event = make_event();
        async move {
            let _ = tx.send(TimerEvent { peer, event }).await;
        }
    })
}

pub fn start_idle_hold_timer(peer: UniqueId, tx: Sender<TimerEvent>, secs: u64) -> Timer {
    start_timer(peer, tx, secs, || Event::IdleHoldTimerExpires)
}

/// Repeats rather than fires once: a Connect -> Connect retry edge leaves
/// the state unchanged, so nothing would otherwise re-arm it.
pub fn start_connect_retry_timer(peer: UniqueId, tx: Sender<TimerEvent>, config: &TimerConfig) -> Timer {
    start_repeater(peer, tx, config.connect_retry_time(), || Event::ConnectRetryTimerExpires)
}

fn start_hold_timer(peer: UniqueId, tx: Sender<TimerEvent>, hold_time: u16) -> Timer {
    start_timer(peer, tx, hold_time as u64, || Event::HoldTimerExpires)
}

fn start_keepalive_timer(peer: UniqueId, tx: Sender<TimerEvent>, keepalive: u16) -> Timer {
    start_repeater(peer, tx, keepalive as u64, || Event::KeepaliveTimerExpires)
}

pub fn refresh_hold_timer(timers: &PeerTimers) {
    if let Some(hold_timer) = timers.hold_timer.as_ref() {
        hold_timer.refresh();
    }
}

/// Negotiates hold/keepalive from a received OPEN's hold time and the
/// locally configured ceiling, then arms both timers: the smaller of the two
/// proposals wins, per RFC 4271 §4.2.
pub fn negotiate_and_arm(
    peer: UniqueId,
    tx: Sender<TimerEvent>,
    config: &TimerConfig,
    timers: &mut PeerTimers,
    remote_hold_time: u16,
) -> NegotiatedParams {
    let negotiated = if remote_hold_time == 0 {
        NegotiatedParams { hold_time: 0, keepalive: 0 }
    } else {
        let local_hold_time = config.hold_time() as u16;
        let hold_time = min(remote_hold_time, local_hold_time);
        NegotiatedParams { hold_time, keepalive: hold_time / 3 }
    };
    if negotiated.keepalive > 0 {
        timers.keepalive = Some(start_keepalive_timer(peer, tx.clone(), negotiated.keepalive));
    }
    if negotiated.hold_time > 0 {
        timers.hold_timer = Some(start_hold_timer(peer, tx, negotiated.hold_time));
    }
    negotiated
}

/// Arms/disarms timers to match a new FSM state. `passive` peers skip the
/// idle-hold timer entirely and auto-transition straight to `Active`,
/// matching the one place outside the FSM proper where state is allowed to
/// move on its own. `damping_hold` overrides the Idle-Hold duration for a
/// peer that has crossed its oscillation threshold.
pub fn update_timers(
    peer: UniqueId,
    tx: Sender<TimerEvent>,
    config: &TimerConfig,
    damping_hold: Option<u64>,
    passive: bool,
    state: &mut State,
    timers: &mut PeerTimers,
) {
    match state {
        State::Idle => {
            if passive {
                *state = State::Active;
                timers.idle_hold_timer = None;
            } else if timers.idle_hold_timer.is_none() {
                let secs = damping_hold.unwrap_or(config.idle_hold_time());
                timers.idle_hold_timer = Some(start_idle_hold_timer(peer, tx, secs));
            }
            timers.connect_retry = None;
            timers.hold_timer = None;
            timers.keepalive = None;
        }
        State::Connect | State::Active => {
            // A passive peer never dials out, so it has nothing to retry.
            if !passive && timers.connect_retry.is_none() {
                timers.connect_retry = Some(start_connect_retry_timer(peer, tx, config));
            }
            timers.idle_hold_timer = None;
            timers.hold_timer = None;
            timers.keepalive = None;
        }
        State::OpenSent | State::OpenConfirm | State::Stopped => {
            timers.idle_hold_timer = None;
            timers.connect_retry = None;
            timers.hold_timer = None;
            timers.keepalive = None;
        }
        State::Established => {
            timers.idle_hold_timer = None;
            timers.connect_retry = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_remote_hold_time_disables_both_timers() {
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let config = TimerConfig::default();
        let mut timers = PeerTimers::default();
        let negotiated = negotiate_and_arm(2, tx, &config, &mut timers, 0);
        assert_eq!(negotiated.hold_time, 0);
        assert_eq!(negotiated.keepalive, 0);
        assert!(timers.hold_timer.is_none());
        assert!(timers.keepalive.is_none());
    }

    #[tokio::test]
    async fn negotiated_hold_time_is_the_smaller_proposal() {
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let mut config = TimerConfig::default();
        config.hold_time = Some(180);
        let mut timers = PeerTimers::default();
        let negotiated = negotiate_and_arm(2, tx, &config, &mut timers, 90);
        assert_eq!(negotiated.hold_time, 90);
        assert_eq!(negotiated.keepalive, 30);
    }

    #[test]
    fn passive_peer_auto_transitions_idle_to_active() {
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let config = TimerConfig::default();
        let mut timers = PeerTimers::default();
        let mut state = State::Idle;
        update_timers(2, tx, &config, None, true, &mut state, &mut timers);
        assert_eq!(state, State::Active);
        assert!(timers.idle_hold_timer.is_none());
    }
}
