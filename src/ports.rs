use std::collections::HashSet;
use std::net::TcpListener;
use tracing::trace;

use crate::writer::SynthError;

const MAX_ATTEMPTS: usize = 64;

/// Hands out OS-assigned free TCP ports, never repeating one it already gave
/// out or one reserved by the caller.
#[derive(Debug, Default)]
pub struct PortAllocator {
    taken: HashSet<u16>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks ports as in use; zero is ignored.
    pub fn reserve(&mut self, ports: impl IntoIterator<Item = u16>) {
        self.taken.extend(ports.into_iter().filter(|p| *p != 0));
    }

    pub fn allocate(&mut self) -> Result<u16, SynthError> {
        for _ in 0..MAX_ATTEMPTS {
            // The listener is dropped at the end of the iteration, releasing the port.
            let port = TcpListener::bind(("0.0.0.0", 0))
                .and_then(|l| l.local_addr())
                .map_err(SynthError::Io)?
                .port();
            if self.taken.insert(port) {
                return Ok(port);
            }
            trace!(port, "Port already taken in this config, retrying.");
        }
        Err(SynthError::NoFreePort)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocated_ports_are_distinct() {
        let mut allocator = PortAllocator::new();
        let ports: Vec<u16> = (0..20).map(|_| allocator.allocate().unwrap()).collect();
        assert!(crate::utils::ports_unique(&ports));
        assert!(ports.iter().all(|p| *p != 0));
    }

    #[test]
    fn test_reserved_ports_are_never_returned() {
        let mut allocator = PortAllocator::new();
        let first = allocator.allocate().unwrap();

        let mut other = PortAllocator::new();
        other.reserve([first, 0]);
        for _ in 0..10 {
            assert_ne!(other.allocate().unwrap(), first);
        }
    }
}
