//! In-process radio channel for tests and simulations.
//!
//! A [`SimulatedChannel`] is a shared broadcast medium: every frame sent by
//! one attached [`SimRadio`] lands in the inbox of every other radio that can
//! hear it. Topology defaults to everyone-hears-everyone; calling
//! [`SimulatedChannel::connect`] switches to an explicit link list, which is
//! how tests force traffic through a repeater. A filter can drop frames to
//! model loss.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use dismissal_mesh::lora::{Radio, SimulatedChannel};
//!
//! let channel = SimulatedChannel::new();
//! let mut a = channel.attach();
//! let mut b = channel.attach();
//!
//! assert!(a.send(b"ping"));
//! assert_eq!(b.receive(Duration::from_millis(10)), Some(b"ping".to_vec()));
//! assert_eq!(a.receive(Duration::from_millis(1)), None); // no self-reception
//! ```

use super::radio::Radio;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Decides whether a frame from endpoint `from` reaches endpoint `to`.
pub type FrameFilter = Box<dyn FnMut(usize, usize, &[u8]) -> bool + Send>;

/// RSSI reported for every simulated frame.
const SIM_RSSI_DBM: i32 = -72;

#[derive(Default)]
struct ChannelState {
    inboxes: Vec<VecDeque<Vec<u8>>>,
    links: Option<HashSet<(usize, usize)>>,
    filter: Option<FrameFilter>,
    transmissions: Vec<(usize, Vec<u8>)>,
}

impl ChannelState {
    fn can_hear(&self, from: usize, to: usize) -> bool {
        from != to
            && self
                .links
                .as_ref()
                .map_or(true, |links| links.contains(&(from, to)))
    }
}

/// Shared simulated medium.
#[derive(Clone, Default)]
pub struct SimulatedChannel {
    inner: Arc<(Mutex<ChannelState>, Condvar)>,
}

impl SimulatedChannel {
    /// Create an empty channel.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.inner.0.lock().unwrap_or_else(|poisoned| {
            log::warn!("Simulated channel mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Attach a new radio. Endpoints are numbered from 0 in attach order.
    pub fn attach(&self) -> SimRadio {
        let mut state = self.state();
        state.inboxes.push(VecDeque::new());
        SimRadio {
            endpoint: state.inboxes.len() - 1,
            channel: self.clone(),
            last_rssi: None,
        }
    }

    /// Add a bidirectional link between two endpoints. The first call turns
    /// off full connectivity.
    pub fn connect(&self, a: usize, b: usize) {
        let mut state = self.state();
        let links = state.links.get_or_insert_with(HashSet::new);
        links.insert((a, b));
        links.insert((b, a));
    }

    /// Install a loss model; return `false` from the filter to drop a frame.
    pub fn set_filter(&self, filter: FrameFilter) {
        self.state().filter = Some(filter);
    }

    /// Every frame sent so far, with its sending endpoint.
    pub fn transmissions(&self) -> Vec<(usize, Vec<u8>)> {
        self.state().transmissions.clone()
    }

    fn broadcast(&self, from: usize, frame: &[u8]) {
        let mut state = self.state();
        state.transmissions.push((from, frame.to_vec()));
        let mut filter = state.filter.take();
        for to in 0..state.inboxes.len() {
            if !state.can_hear(from, to) {
                continue;
            }
            if let Some(f) = filter.as_mut() {
                if !f(from, to, frame) {
                    continue;
                }
            }
            state.inboxes[to].push_back(frame.to_vec());
        }
        state.filter = filter;
        drop(state);
        self.inner.1.notify_all();
    }

    fn take(&self, endpoint: usize, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        loop {
            if let Some(frame) = state.inboxes.get_mut(endpoint)?.pop_front() {
                return Some(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = match self.inner.1.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

/// One radio attached to a [`SimulatedChannel`].
pub struct SimRadio {
    endpoint: usize,
    channel: SimulatedChannel,
    last_rssi: Option<i32>,
}

impl SimRadio {
    /// This radio's endpoint number on the channel.
    pub fn endpoint(&self) -> usize {
        self.endpoint
    }
}

impl Radio for SimRadio {
    fn send(&mut self, frame: &[u8]) -> bool {
        self.channel.broadcast(self.endpoint, frame);
        true
    }

    fn receive(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        let frame = self.channel.take(self.endpoint, timeout)?;
        self.last_rssi = Some(SIM_RSSI_DBM);
        Some(frame)
    }

    fn last_rssi(&self) -> Option<i32> {
        self.last_rssi
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_reaches_all_others() {
        let channel = SimulatedChannel::new();
        let mut a = channel.attach();
        let mut b = channel.attach();
        let mut c = channel.attach();

        assert!(a.send(b"hello"));
        assert_eq!(b.receive(Duration::from_millis(10)), Some(b"hello".to_vec()));
        assert_eq!(c.receive(Duration::from_millis(10)), Some(b"hello".to_vec()));
        assert_eq!(a.receive(Duration::from_millis(1)), None);
        assert_eq!(b.last_rssi(), Some(SIM_RSSI_DBM));
    }

    #[test]
    fn test_explicit_topology() {
        let channel = SimulatedChannel::new();
        let mut a = channel.attach();
        let mut b = channel.attach();
        let mut c = channel.attach();
        channel.connect(0, 1);
        channel.connect(1, 2);

        a.send(b"x");
        assert!(b.receive(Duration::from_millis(10)).is_some());
        assert!(c.receive(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn test_filter_drops() {
        let channel = SimulatedChannel::new();
        let mut a = channel.attach();
        let mut b = channel.attach();
        channel.set_filter(Box::new(|_, _, frame: &[u8]| frame != b"lost"));

        a.send(b"lost");
        a.send(b"kept");
        assert_eq!(b.receive(Duration::from_millis(10)), Some(b"kept".to_vec()));
        assert_eq!(channel.transmissions().len(), 2);
    }

    #[test]
    fn test_receive_wakes_on_send() {
        let channel = SimulatedChannel::new();
        let mut a = channel.attach();
        let mut b = channel.attach();

        let handle = std::thread::spawn(move || b.receive(Duration::from_secs(2)));
        std::thread::sleep(Duration::from_millis(20));
        a.send(b"late");
        assert_eq!(handle.join().unwrap(), Some(b"late".to_vec()));
    }
}
