/// Vote threshold for a cluster of fixed size.
///
/// A round copies the policy in effect when it is created; later membership
/// changes only affect rounds created afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumPolicy {
    cluster_size: usize,
}

impl QuorumPolicy {
    pub fn new(cluster_size: usize) -> Self {
        QuorumPolicy { cluster_size }
    }

    pub fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    /// Minimum number of distinct matching votes to advance a phase:
    /// floor(2n/3) + 1
    pub fn threshold(&self) -> usize {
        2 * self.cluster_size / 3 + 1
    }

    /// Largest f with n >= 3f + 1
    pub fn max_faulty(&self) -> usize {
        self.cluster_size.saturating_sub(1) / 3
    }

    pub fn is_reached(&self, votes: usize) -> bool {
        votes >= self.threshold()
    }
}
