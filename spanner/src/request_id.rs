use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

pub const REQUEST_ID_HEADER: &str = "x-goog-spanner-request-id";

const REQUEST_ID_VERSION: u8 = 1;

static PROCESS_ID: OnceLock<u64> = OnceLock::new();
static NTH_CLIENT: AtomicU32 = AtomicU32::new(0);

/// Random value chosen once per process so that ids from different processes never collide.
pub fn process_id() -> u64 {
    *PROCESS_ID.get_or_init(rand::random::<u64>)
}

/// Issues request ids for one database client.
#[derive(Debug)]
pub struct RequestIdGenerator {
    client_id: u32,
    nth_request: AtomicU32,
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self {
            client_id: NTH_CLIENT.fetch_add(1, Ordering::Relaxed) + 1,
            nth_request: AtomicU32::new(0),
        }
    }

    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    /// Starts a new logical request on the given channel. The returned id has no attempt yet;
    /// call [`RequestId::next_attempt`] before each physical call.
    pub fn next(&self, channel_id: u32) -> RequestId {
        RequestId {
            process_id: process_id(),
            client_id: self.client_id,
            channel_id,
            nth_request: self.nth_request.fetch_add(1, Ordering::Relaxed) + 1,
            attempt: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestId {
    process_id: u64,
    client_id: u32,
    channel_id: u32,
    nth_request: u32,
    attempt: u32,
}

impl RequestId {
    pub fn next_attempt(&mut self) -> &Self {
        self.attempt += 1;
        self
    }

    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub fn nth_request(&self) -> u32 {
        self.nth_request
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:016x}.{}.{}.{}.{}",
            REQUEST_ID_VERSION, self.process_id, self.client_id, self.channel_id, self.nth_request, self.attempt
        )
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use crate::request_id::{process_id, RequestIdGenerator};

    #[test]
    fn test_format() {
        let generator = RequestIdGenerator::new();
        let mut id = generator.next(3);
        id.next_attempt();
        let text = id.to_string();
        let parts: Vec<&str> = text.split('.').collect();
        assert_eq!(parts.len(), 6);
        assert_eq!(parts[0], "1");
        assert_eq!(parts[1], format!("{:016x}", process_id()));
        assert_eq!(parts[2], generator.client_id().to_string());
        assert_eq!(parts[3], "3");
        assert_eq!(parts[4], "1");
        assert_eq!(parts[5], "1");
    }

    #[test]
    fn test_attempts_share_request() {
        let generator = RequestIdGenerator::new();
        let mut id = generator.next(1);
        let first = id.next_attempt().to_string();
        let second = id.next_attempt().to_string();
        assert_ne!(first, second);
        assert_eq!(first.rsplit_once('.').unwrap().0, second.rsplit_once('.').unwrap().0);
        assert_eq!(id.attempt(), 2);
    }

    #[test]
    fn test_clients_are_distinct() {
        let a = RequestIdGenerator::new();
        let b = RequestIdGenerator::new();
        assert_ne!(a.client_id(), b.client_id());
    }

    #[test]
    fn test_unique_under_concurrency() {
        let generator = Arc::new(RequestIdGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|channel| {
                let generator = generator.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| {
                            let mut id = generator.next(channel);
                            id.next_attempt().to_string()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 800);
    }
}
