//! Rank communication for the distributed loading path.
//!
//! Ranks execute the same sequence of load ranges and meet at every
//! [`Communicator::exchange`]. A rank with nothing to send still takes part
//! with empty messages, otherwise the group falls out of step.

use crate::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use nxevent_core::TofEvent;

/// An event addressed to a rank by its rank-local spectrum index.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WireEvent {
    pub local_index: usize,
    pub event: TofEvent,
}

/// Collective exchange between cooperating ranks.
pub trait Communicator: Send + Sync {
    /// Index of this rank within the group.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// All-to-all exchange: `outgoing[r]` is delivered to rank `r`; the
    /// result holds, at index `r`, what rank `r` sent to this rank.
    ///
    /// # Errors
    /// Returns [`Error::Communication`] if `outgoing` does not have one entry
    /// per rank or a peer has gone away.
    fn exchange(&self, outgoing: Vec<Vec<WireEvent>>) -> Result<Vec<Vec<WireEvent>>>;
}

/// In-process rank connected to its peers by channels.
///
/// Each ordered pair of ranks has its own FIFO, so consecutive exchanges
/// cannot overtake each other.
pub struct LocalCommunicator {
    rank: usize,
    to_peers: Vec<Sender<Vec<WireEvent>>>,
    from_peers: Vec<Receiver<Vec<WireEvent>>>,
}

impl LocalCommunicator {
    /// Creates a fully connected group of `size` ranks, indexed by rank.
    #[must_use]
    pub fn group(size: usize) -> Vec<Self> {
        let size = size.max(1);
        // channels[from][to]
        let mut senders: Vec<Vec<Sender<Vec<WireEvent>>>> = Vec::with_capacity(size);
        let mut receivers: Vec<Vec<Option<Receiver<Vec<WireEvent>>>>> =
            (0..size).map(|_| (0..size).map(|_| None).collect()).collect();
        for from in 0..size {
            let mut row = Vec::with_capacity(size);
            for to_receivers in &mut receivers {
                let (tx, rx) = unbounded();
                row.push(tx);
                to_receivers[from] = Some(rx);
            }
            senders.push(row);
        }
        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (to_peers, from_peers))| Self {
                rank,
                to_peers,
                from_peers: from_peers.into_iter().flatten().collect(),
            })
            .collect()
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.to_peers.len()
    }

    fn exchange(&self, outgoing: Vec<Vec<WireEvent>>) -> Result<Vec<Vec<WireEvent>>> {
        if outgoing.len() != self.size() {
            return Err(Error::Communication(format!(
                "rank {} has {} outgoing messages for {} ranks",
                self.rank,
                outgoing.len(),
                self.size()
            )));
        }
        for (peer, (sender, message)) in self.to_peers.iter().zip(outgoing).enumerate() {
            sender.send(message).map_err(|_| {
                Error::Communication(format!("rank {peer} disconnected from rank {}", self.rank))
            })?;
        }
        self.from_peers
            .iter()
            .enumerate()
            .map(|(peer, receiver)| {
                receiver.recv().map_err(|_| {
                    Error::Communication(format!(
                        "rank {} lost connection to rank {peer}",
                        self.rank
                    ))
                })
            })
            .collect()
    }
}
