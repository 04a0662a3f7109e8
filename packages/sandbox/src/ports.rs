// ABOUTME: Host port allocation for sandboxes that publish a network service
// ABOUTME: Scans a range for a bindable port and holds it exclusively for a reservation window

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::TcpListener;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Inclusive range of host ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for PortRange {
    type Err = String;

    /// Parses `start-end`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| format!("expected start-end, got {}", s))?;
        let start: u16 = start.trim().parse().map_err(|e| format!("start: {}", e))?;
        let end: u16 = end.trim().parse().map_err(|e| format!("end: {}", e))?;
        if start == 0 || start > end {
            return Err(format!("invalid port range {}-{}", start, end));
        }
        Ok(Self { start, end })
    }
}

/// Tracks recently handed-out ports so two sandboxes never race for the same one
pub struct PortAllocator {
    /// Port to reservation expiry
    reserved: Mutex<HashMap<u16, Instant>>,
    reservation: Duration,
}

impl PortAllocator {
    pub fn new(reservation: Duration) -> Self {
        Self {
            reserved: Mutex::new(HashMap::new()),
            reservation,
        }
    }

    /// Reserve the first port in `range` that is neither reserved nor bound on the host.
    ///
    /// Falls back to a random port in the range when the scan finds nothing, so
    /// sandbox creation proceeds with a small collision risk instead of failing.
    pub fn find_available_port(&self, range: PortRange) -> u16 {
        let mut reserved = self
            .reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        reserved.retain(|_, expires| *expires > now);

        let found = (range.start..=range.end)
            .find(|port| !reserved.contains_key(port) && Self::is_bindable(*port));

        let port = match found {
            Some(port) => {
                debug!("Reserved port {} from range {}", port, range);
                port
            }
            None => {
                let port = rand::thread_rng().gen_range(range.start..=range.end);
                warn!(
                    "No bindable port left in range {}, falling back to {}",
                    range, port
                );
                port
            }
        };

        reserved.insert(port, now + self.reservation);
        port
    }

    /// Drop a reservation early, e.g. when sandbox creation failed
    pub fn release(&self, port: u16) {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&port);
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&port)
            .is_some_and(|expires| *expires > Instant::now())
    }

    fn is_bindable(port: u16) -> bool {
        TcpListener::bind(("0.0.0.0", port)).is_ok()
    }
}
