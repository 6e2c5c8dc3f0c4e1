//! Per-username rendezvous state.
//!
//! A [`Session`] collects the sharer's three sockets, then the viewer's
//! three, and starts relaying exactly once when all six are present.
//!
//! ```text
//!  Empty ──► SharerPartial ──► SharerReady ──► Relaying ──► Discarded
//!                                                 │  ▲
//!                                                 └──┘ sharer rejoin
//! ```
//!
//! Every slot records the epoch of the registration that filled it. A
//! pump captures the epochs of its two sockets when it is spawned and
//! later asks the session whether they are still current; a replaced
//! socket makes the pump stale and its disconnect is ignored.
//!
//! A sharer socket that drops while relaying opens a grace window on its
//! channel. The viewer side is kept until the window closes; a sharer
//! handshake for that channel inside the window rejoins it.
//!
//! All state sits behind one short-lived `std::sync::Mutex`; nothing
//! awaits while holding it.

pub mod link;
pub mod registry;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Rejection, TetherError};
use crate::handshake::{Channel, Role, START_SESSION};
use crate::relay::RelayPump;

pub use link::Link;
pub use registry::Registry;

/// Numeric id used on the UDP path: CRC32 of the username.
pub fn client_id_for(username: &str) -> u32 {
    crc32fast::hash(username.as_bytes())
}

// ── Public state types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Empty,
    SharerPartial,
    SharerReady,
    Relaying,
    Discarded,
}

/// Identifies the registration a pump endpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub role: Role,
    pub channel: Channel,
    pub epoch: u64,
}

/// The two sockets of one channel, ready to be pumped.
#[derive(Debug, Clone)]
pub struct ChannelPlan {
    pub channel: Channel,
    pub sharer: (Arc<Link>, Ticket),
    pub viewer: (Arc<Link>, Ticket),
}

/// Everything needed to start relaying, captured when the sixth slot
/// was filled.
#[derive(Debug)]
pub struct RelayPlan {
    pub channels: Vec<ChannelPlan>,
}

impl RelayPlan {
    fn sharer_link(&self, channel: Channel) -> Option<&Arc<Link>> {
        self.channels
            .iter()
            .find(|plan| plan.channel == channel)
            .map(|plan| &plan.sharer.0)
    }

    fn close_all(&self) {
        for plan in &self.channels {
            plan.sharer.0.close();
            plan.viewer.0.close();
        }
    }
}

#[derive(Debug)]
pub enum SharerAdmission {
    /// Some sharer channels are still missing.
    Partial,
    /// All three sharer channels are present; viewers may join.
    Ready,
    /// The session was already relaying: the socket replaced a previous
    /// one. Carries the channel to re-pump against the viewer's socket.
    Rejoined(ChannelPlan),
}

#[derive(Debug)]
pub enum ViewerAdmission {
    Waiting,
    /// This registration completed the session. The caller owns the
    /// one-shot start.
    Start(RelayPlan),
}

/// Outcome of checking a pump's end-of-stream against the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// The sharer dropped this channel recently; assume it is reconnecting.
    WithinGrace,
    /// The destination socket was superseded; the pump is obsolete.
    StaleDestination,
    /// The source socket was superseded.
    StaleSource,
    SharerLeft,
    ViewerLeft,
}

impl Disconnect {
    pub fn is_real(self) -> bool {
        matches!(self, Self::SharerLeft | Self::ViewerLeft)
    }
}

/// A UDP endpoint learned from a REGISTER datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: SocketAddr,
    pub client_id: u32,
}

// ── Internal state ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Rendezvous,
    Relaying,
    Discarded,
}

#[derive(Debug)]
struct Slot {
    link: Arc<Link>,
    epoch: u64,
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    width: u32,
    height: u32,
    sharer: [Option<Slot>; 3],
    viewer: [Option<Slot>; 3],
    next_epoch: u64,
    /// Per channel: end of the reconnection window after a sharer drop.
    grace_until: [Option<Instant>; 3],
    sharer_endpoint: Option<Endpoint>,
    viewer_endpoint: Option<Endpoint>,
}

impl Inner {
    fn slots(&self, role: Role) -> &[Option<Slot>; 3] {
        match role {
            Role::Sharer => &self.sharer,
            Role::Viewer => &self.viewer,
        }
    }

    fn slots_mut(&mut self, role: Role) -> &mut [Option<Slot>; 3] {
        match role {
            Role::Sharer => &mut self.sharer,
            Role::Viewer => &mut self.viewer,
        }
    }

    /// Fill a slot, closing whatever it held. Returns `true` on replacement.
    fn assign(&mut self, role: Role, channel: Channel, link: Arc<Link>) -> bool {
        self.next_epoch += 1;
        let slot = Slot {
            link,
            epoch: self.next_epoch,
        };
        match self.slots_mut(role)[channel.index()].replace(slot) {
            Some(old) => {
                old.link.close();
                true
            }
            None => false,
        }
    }

    fn sharer_ready(&self) -> bool {
        self.sharer.iter().all(Option::is_some)
    }

    fn complete(&self) -> bool {
        self.sharer_ready() && self.viewer.iter().all(Option::is_some)
    }

    fn ticket(&self, role: Role, channel: Channel) -> Option<(Arc<Link>, Ticket)> {
        self.slots(role)[channel.index()].as_ref().map(|slot| {
            let ticket = Ticket {
                role,
                channel,
                epoch: slot.epoch,
            };
            (slot.link.clone(), ticket)
        })
    }

    fn channel_plan(&self, channel: Channel) -> Option<ChannelPlan> {
        Some(ChannelPlan {
            channel,
            sharer: self.ticket(Role::Sharer, channel)?,
            viewer: self.ticket(Role::Viewer, channel)?,
        })
    }

    fn grace_open(&self, channel: Channel) -> bool {
        self.grace_until[channel.index()].is_some_and(|until| Instant::now() < until)
    }

    fn is_current(&self, ticket: Ticket) -> bool {
        self.slots(ticket.role)[ticket.channel.index()]
            .as_ref()
            .is_some_and(|slot| slot.epoch == ticket.epoch)
    }

    fn take_slot(&mut self, role: Role, channel: Channel) -> Option<Slot> {
        self.slots_mut(role)[channel.index()].take()
    }

    fn close_all(&mut self) {
        for slot in self.sharer.iter_mut().chain(self.viewer.iter_mut()) {
            if let Some(slot) = slot.take() {
                slot.link.close();
            }
        }
    }
}

// ── Session ──────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Session {
    username: String,
    client_id: u32,
    secret: blake3::Hash,
    grace_period: Duration,
    /// Cancelled once the session leaves rendezvous.
    rendezvous: CancellationToken,
    inner: Mutex<Inner>,
}

impl Session {
    pub fn new(
        username: impl Into<String>,
        password: &str,
        width: u32,
        height: u32,
        grace_period: Duration,
    ) -> Self {
        let username = username.into();
        Self {
            client_id: client_id_for(&username),
            username,
            secret: blake3::hash(password.as_bytes()),
            grace_period,
            rendezvous: CancellationToken::new(),
            inner: Mutex::new(Inner {
                phase: Phase::Rendezvous,
                width,
                height,
                sharer: Default::default(),
                viewer: Default::default(),
                next_epoch: 0,
                grace_until: [None; 3],
                sharer_endpoint: None,
                viewer_endpoint: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    /// Screen size declared by the most recent sharer handshake.
    pub fn dimensions(&self) -> (u32, u32) {
        let inner = self.lock();
        (inner.width, inner.height)
    }

    pub fn declare_dimensions(&self, width: u32, height: u32) {
        let mut inner = self.lock();
        inner.width = width;
        inner.height = height;
    }

    pub fn state(&self) -> SessionState {
        let inner = self.lock();
        match inner.phase {
            Phase::Relaying => SessionState::Relaying,
            Phase::Discarded => SessionState::Discarded,
            Phase::Rendezvous if inner.sharer_ready() => SessionState::SharerReady,
            Phase::Rendezvous if inner.sharer.iter().any(Option::is_some) => {
                SessionState::SharerPartial
            }
            Phase::Rendezvous => SessionState::Empty,
        }
    }

    /// `true` iff all three sharer slots are populated.
    pub fn is_sharer_ready(&self) -> bool {
        self.lock().sharer_ready()
    }

    pub fn is_relaying(&self) -> bool {
        self.lock().phase == Phase::Relaying
    }

    pub fn is_discarded(&self) -> bool {
        self.lock().phase == Phase::Discarded
    }

    /// Compare a candidate password with the stored secret.
    ///
    /// Both sides are BLAKE3 digests; `Hash` equality is constant-time.
    pub fn check_secret(&self, candidate: &str) -> bool {
        blake3::hash(candidate.as_bytes()) == self.secret
    }

    // ── Registration ─────────────────────────────────────────────

    /// Place a sharer socket in its channel slot. Last write wins: a
    /// previous socket for the channel is closed and any grace window on
    /// the channel ends.
    ///
    /// While relaying, a channel whose viewer is gone cannot be rejoined.
    pub fn register_sharer_channel(
        &self,
        channel: Channel,
        link: Arc<Link>,
    ) -> Result<SharerAdmission, TetherError> {
        let mut inner = self.lock();
        match inner.phase {
            Phase::Discarded => {
                link.close();
                return Err(TetherError::SessionClosed(self.username.clone()));
            }
            Phase::Relaying if inner.viewer[channel.index()].is_none() => {
                link.close();
                return Err(Rejection::ViewerGone.into());
            }
            _ => {}
        }

        if inner.assign(Role::Sharer, channel, link) {
            debug!(username = %self.username, %channel, "sharer socket replaced");
        }
        inner.grace_until[channel.index()] = None;

        if inner.phase == Phase::Relaying {
            if let Some(plan) = inner.channel_plan(channel) {
                return Ok(SharerAdmission::Rejoined(plan));
            }
        }
        Ok(if inner.sharer_ready() {
            SharerAdmission::Ready
        } else {
            SharerAdmission::Partial
        })
    }

    /// A pending sharer socket reached end-of-stream before pairing. Frees
    /// its slot if `link` still holds it; returns `true` when that left
    /// the session without any sharer socket, which discards it.
    pub fn on_pending_sharer_drop(&self, channel: Channel, link: &Arc<Link>) -> bool {
        let mut inner = self.lock();
        if inner.phase != Phase::Rendezvous {
            return false;
        }
        let holds = inner.sharer[channel.index()]
            .as_ref()
            .is_some_and(|slot| Arc::ptr_eq(&slot.link, link));
        if !holds {
            return false;
        }
        inner.take_slot(Role::Sharer, channel);
        link.close();
        info!(username = %self.username, %channel, "sharer left before pairing");

        if inner.sharer.iter().all(Option::is_none) {
            inner.phase = Phase::Discarded;
            inner.close_all();
            self.rendezvous.cancel();
            info!(username = %self.username, "session ended");
            return true;
        }
        false
    }

    /// Resolves once the session has started relaying or was discarded.
    pub async fn rendezvous_ended(&self) {
        self.rendezvous.cancelled().await
    }

    /// Place a viewer socket and, if that completes all six slots, flip
    /// the session to relaying within the same critical section.
    ///
    /// Once started, further viewers get [`Rejection::AlreadyStarted`]
    /// and their socket is closed.
    pub fn register_viewer_channel(
        &self,
        channel: Channel,
        link: Arc<Link>,
    ) -> Result<ViewerAdmission, Rejection> {
        let mut inner = self.lock();
        if inner.phase != Phase::Rendezvous {
            link.close();
            return Err(Rejection::AlreadyStarted);
        }

        if inner.assign(Role::Viewer, channel, link) {
            debug!(username = %self.username, %channel, "viewer socket replaced");
        }

        if !inner.complete() {
            return Ok(ViewerAdmission::Waiting);
        }

        inner.phase = Phase::Relaying;
        self.rendezvous.cancel();
        let channels = Channel::ALL
            .iter()
            .filter_map(|&c| inner.channel_plan(c))
            .collect();
        Ok(ViewerAdmission::Start(RelayPlan { channels }))
    }

    // ── Relay start ──────────────────────────────────────────────

    /// Signal the sharer and spawn the six pumps.
    ///
    /// On failure every socket in the session is closed and the session
    /// is discarded.
    pub async fn start_relay(
        self: &Arc<Self>,
        plan: RelayPlan,
        buffer_size: usize,
    ) -> Result<(), TetherError> {
        let signal = match plan.sharer_link(Channel::Control) {
            Some(control) => control.send_line(START_SESSION).await,
            None => Err(TetherError::SessionClosed(self.username.clone())),
        };
        if let Err(e) = signal {
            warn!(username = %self.username, "failed to signal sharer: {e}");
            plan.close_all();
            self.abort();
            return Err(e);
        }

        for channel in plan.channels {
            self.spawn_channel(channel, buffer_size);
        }
        info!(username = %self.username, "relay started");
        Ok(())
    }

    /// Spawn both directions of one channel.
    pub fn spawn_channel(self: &Arc<Self>, plan: ChannelPlan, buffer_size: usize) {
        let (sharer, sharer_ticket) = plan.sharer;
        let (viewer, viewer_ticket) = plan.viewer;

        RelayPump::new(sharer.clone(), viewer.clone())
            .with_buffer_size(buffer_size)
            .with_owner(self.clone(), sharer_ticket, viewer_ticket)
            .spawn();
        RelayPump::new(viewer, sharer)
            .with_buffer_size(buffer_size)
            .with_owner(self.clone(), viewer_ticket, sharer_ticket)
            .spawn();
    }

    /// Close every populated slot and retire the session.
    pub fn abort(&self) {
        let mut inner = self.lock();
        inner.phase = Phase::Discarded;
        inner.close_all();
        self.rendezvous.cancel();
        info!(username = %self.username, "session aborted");
    }

    // ── Disconnects ──────────────────────────────────────────────

    /// Decide whether a pump's end-of-stream is a real disconnect.
    pub fn classify_disconnect(&self, source: Ticket, destination: Ticket) -> Disconnect {
        let inner = self.lock();
        if inner.grace_open(source.channel) {
            return Disconnect::WithinGrace;
        }
        if !inner.is_current(destination) {
            return Disconnect::StaleDestination;
        }
        if !inner.is_current(source) {
            return Disconnect::StaleSource;
        }
        match source.role {
            Role::Sharer => Disconnect::SharerLeft,
            Role::Viewer => Disconnect::ViewerLeft,
        }
    }

    /// Open the reconnection window for a sharer socket that just dropped.
    /// Returns when the window closes, or `None` if the socket was
    /// already superseded.
    pub fn open_grace(&self, ticket: Ticket) -> Option<Instant> {
        let mut inner = self.lock();
        if !inner.is_current(ticket) {
            return None;
        }
        let until = Instant::now() + self.grace_period;
        inner.grace_until[ticket.channel.index()] = Some(until);
        debug!(
            username = %self.username,
            channel = %ticket.channel,
            grace_ms = self.grace_period.as_millis() as u64,
            "sharer dropped, holding channel"
        );
        Some(until)
    }

    /// The sharer dropped a channel: clear both sides of it. The session
    /// is discarded once no sharer channel is left.
    pub fn on_sharer_disconnect(&self, ticket: Ticket) {
        let mut inner = self.lock();
        if !inner.is_current(ticket) {
            return;
        }
        inner.take_slot(Role::Sharer, ticket.channel);
        if let Some(viewer) = inner.take_slot(Role::Viewer, ticket.channel) {
            viewer.link.close();
        }
        info!(username = %self.username, channel = %ticket.channel, "sharer disconnected");

        if inner.sharer.iter().all(Option::is_none) {
            inner.phase = Phase::Discarded;
            inner.close_all();
            info!(username = %self.username, "session ended");
        }
    }

    /// The viewer dropped a channel. The sharer's socket is left alone;
    /// the session retires once no viewer channel is left.
    pub fn on_viewer_disconnect(&self, ticket: Ticket) {
        let mut inner = self.lock();
        if !inner.is_current(ticket) {
            return;
        }
        inner.take_slot(Role::Viewer, ticket.channel);
        info!(username = %self.username, channel = %ticket.channel, "viewer disconnected");

        if inner.viewer.iter().all(Option::is_none) {
            inner.phase = Phase::Discarded;
            info!(username = %self.username, "session ended");
        }
    }

    /// Whether the socket registered under `ticket` is still the live one.
    pub fn is_current(&self, ticket: Ticket) -> bool {
        self.lock().is_current(ticket)
    }

    // ── UDP endpoints ────────────────────────────────────────────

    /// Record a REGISTER sender. The first address becomes the sharer,
    /// the second the viewer; a repeat from a known address keeps its
    /// role. Returns `None` when both roles are already taken.
    pub fn register_endpoint(&self, endpoint: Endpoint) -> Option<Role> {
        let mut inner = self.lock();
        match (inner.sharer_endpoint, inner.viewer_endpoint) {
            (Some(s), _) if s.addr == endpoint.addr => Some(Role::Sharer),
            (_, Some(v)) if v.addr == endpoint.addr => Some(Role::Viewer),
            (None, _) => {
                inner.sharer_endpoint = Some(endpoint);
                Some(Role::Sharer)
            }
            (Some(_), None) => {
                inner.viewer_endpoint = Some(endpoint);
                Some(Role::Viewer)
            }
            (Some(_), Some(_)) => None,
        }
    }

    pub fn endpoint(&self, role: Role) -> Option<Endpoint> {
        let inner = self.lock();
        match role {
            Role::Sharer => inner.sharer_endpoint,
            Role::Viewer => inner.viewer_endpoint,
        }
    }
}
