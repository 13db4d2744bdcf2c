//! Conservative roots for the stub pass
//!
//! During its stack scan the collector gathers every machine word that may
//! be a code address: return addresses, saved program counters, and
//! anything else found on suspended or running frames. Any stub whose code
//! contains one of these addresses may still be executing.

/// Candidate code addresses gathered from machine frames
#[derive(Debug, Clone, Default)]
pub struct ConservativeRoots {
    addresses: Vec<usize>,
}

impl ConservativeRoots {
    /// Create an empty root set
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a root set with room for `capacity` addresses
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            addresses: Vec::with_capacity(capacity),
        }
    }

    /// Add one candidate address (null is ignored)
    pub fn add(&mut self, address: usize) {
        if address != 0 {
            self.addresses.push(address);
        }
    }

    /// Add every word of a scanned frame
    pub fn add_frame(&mut self, words: &[usize]) {
        self.addresses.extend(words.iter().copied().filter(|&w| w != 0));
    }

    /// Clear all roots (between collection cycles)
    pub fn clear(&mut self) {
        self.addresses.clear();
    }

    /// Iterate over all roots
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.addresses.iter().copied()
    }

    /// Number of roots
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

impl FromIterator<usize> for ConservativeRoots {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut roots = ConservativeRoots::new();
        for address in iter {
            roots.add(address);
        }
        roots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roots_ignore_null() {
        let mut roots = ConservativeRoots::new();
        roots.add(0);
        roots.add(0x1000);
        roots.add_frame(&[0, 0x2000, 0x3000]);

        assert_eq!(roots.len(), 3);
        assert_eq!(roots.iter().collect::<Vec<_>>(), vec![0x1000, 0x2000, 0x3000]);
    }

    #[test]
    fn test_roots_clear() {
        let mut roots: ConservativeRoots = [1usize, 2, 3].into_iter().collect();
        assert_eq!(roots.len(), 3);
        roots.clear();
        assert!(roots.is_empty());
    }
}
