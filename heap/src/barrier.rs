use parking_lot::{Condvar, Mutex};

/// A reusable sense-reversing barrier for rendezvous whose participant
/// count changes between rounds as domains come and go.
///
/// Each round elects a leader: the last domain to arrive. The rendezvous
/// protocol hands the collection to it, since at that point every
/// submission is in.
#[derive(Debug, Default)]
pub struct SenseBarrier {
    round: Mutex<Round>,
    released: Condvar,
}

#[derive(Debug, Default)]
struct Round {
    arrived: usize,
    sense: bool,
}

impl SenseBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `participants` domains have arrived in this round.
    /// Returns `true` for the leader, the one whose arrival released the
    /// rest.
    pub fn wait(&self, participants: usize) -> bool {
        debug_assert!(participants > 0);
        let mut round = self.round.lock();
        let sense = round.sense;
        round.arrived += 1;

        if round.arrived < participants {
            while round.sense == sense {
                self.released.wait(&mut round);
            }
            return false;
        }
        round.arrived = 0;
        round.sense = !sense;
        self.released.notify_all();
        true
    }
}
