//! Communication between training ranks.
//!
//! Rank 0 owns the training dataset and drives collection and evaluation. Other
//! ranks only train; they adopt the state broadcast by rank 0 and wait at barriers
//! so that all ranks stay on the same epoch.
use crate::{error::TrainError, StateBlob};
use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::trace;
use std::cell::Cell;

/// Collective operations over a fixed group of ranks.
///
/// Every rank must call the same sequence of collective operations.
pub trait Communicator {
    /// Rank of this process or thread.
    fn rank(&self) -> usize;

    /// The number of ranks.
    fn world_size(&self) -> usize;

    /// Sends `value` from rank 0 to all ranks and returns it.
    ///
    /// Rank 0 must pass `Some`; other ranks' arguments are ignored.
    fn broadcast(&self, value: Option<StateBlob>) -> Result<StateBlob>;

    /// Replaces `values` on every rank by their element-wise mean over ranks.
    fn all_reduce_mean(&self, values: &mut [f32]) -> Result<()>;

    /// Blocks until every rank has reached the barrier.
    fn barrier(&self) -> Result<()>;

    /// Returns `true` on rank 0.
    fn is_main(&self) -> bool {
        self.rank() == 0
    }
}

/// A group with a single rank.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn broadcast(&self, value: Option<StateBlob>) -> Result<StateBlob> {
        value.ok_or_else(|| TrainError::SyncFailure("broadcast without a value on rank 0".to_string()).into())
    }

    fn all_reduce_mean(&self, _values: &mut [f32]) -> Result<()> {
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

enum Message {
    Value(u64, StateBlob),
    Mean(u64, Vec<f32>),
    Release(u64),
}

impl Message {
    fn describe(&self) -> String {
        match self {
            Self::Value(s, _) => format!("broadcast #{}", s),
            Self::Mean(s, _) => format!("all-reduce #{}", s),
            Self::Release(s) => format!("barrier #{}", s),
        }
    }
}

enum Reply {
    Values(u64, Vec<f32>),
    Arrived(u64),
}

enum Role {
    Main {
        peers: Vec<(Sender<Message>, Receiver<Reply>)>,
    },
    Peer {
        from_main: Receiver<Message>,
        to_main: Sender<Reply>,
    },
}

/// Ranks running as threads of one process.
///
/// Rank 0 is connected to every other rank by a pair of channels. Each collective
/// operation carries a sequence number; ranks that disagree on the sequence of
/// operations, or a rank that went away, cause [`TrainError::SyncFailure`].
pub struct ThreadGroup {
    rank: usize,
    world_size: usize,
    role: Role,
    seq: Cell<u64>,
}

impl ThreadGroup {
    /// Creates the members of a group; element `r` is rank `r`.
    pub fn new(world_size: usize) -> Vec<ThreadGroup> {
        let world_size = world_size.max(1);
        let mut peers = vec![];
        let mut members = vec![];
        for rank in 1..world_size {
            let (tx_msg, rx_msg) = unbounded();
            let (tx_ack, rx_ack) = unbounded();
            peers.push((tx_msg, rx_ack));
            members.push(ThreadGroup {
                rank,
                world_size,
                role: Role::Peer {
                    from_main: rx_msg,
                    to_main: tx_ack,
                },
                seq: Cell::new(0),
            });
        }
        members.insert(
            0,
            ThreadGroup {
                rank: 0,
                world_size,
                role: Role::Main { peers },
                seq: Cell::new(0),
            },
        );
        members
    }

    fn next_seq(&self) -> u64 {
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        seq
    }

    fn failure(&self, msg: impl Into<String>) -> anyhow::Error {
        TrainError::SyncFailure(format!("rank {}: {}", self.rank, msg.into())).into()
    }

    fn recv(&self, from_main: &Receiver<Message>) -> Result<Message> {
        from_main
            .recv()
            .map_err(|_| self.failure("rank 0 disconnected"))
    }

    fn recv_reply(&self, rank: usize, rx: &Receiver<Reply>) -> Result<Reply> {
        rx.recv()
            .map_err(|_| self.failure(format!("rank {} disconnected", rank)))
    }
}

impl Communicator for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn broadcast(&self, value: Option<StateBlob>) -> Result<StateBlob> {
        let seq = self.next_seq();
        trace!("rank {}: broadcast #{}", self.rank, seq);
        match &self.role {
            Role::Main { peers } => {
                let value = value.ok_or_else(|| self.failure("broadcast without a value"))?;
                for (i, (tx, _)) in peers.iter().enumerate() {
                    tx.send(Message::Value(seq, value.clone()))
                        .map_err(|_| self.failure(format!("rank {} disconnected", i + 1)))?;
                }
                Ok(value)
            }
            Role::Peer { from_main, .. } => match self.recv(from_main)? {
                Message::Value(s, value) if s == seq => Ok(value),
                other => Err(self.failure(format!("expected broadcast #{}, got {}", seq, other.describe()))),
            },
        }
    }

    fn all_reduce_mean(&self, values: &mut [f32]) -> Result<()> {
        let seq = self.next_seq();
        trace!("rank {}: all-reduce #{}", self.rank, seq);
        match &self.role {
            Role::Main { peers } => {
                let mut sum = values.to_vec();
                for (i, (_, rx)) in peers.iter().enumerate() {
                    match self.recv_reply(i + 1, rx)? {
                        Reply::Values(s, v) if s == seq && v.len() == sum.len() => {
                            sum.iter_mut().zip(v.iter()).for_each(|(a, b)| *a += b);
                        }
                        Reply::Values(s, v) => {
                            return Err(self.failure(format!(
                                "rank {} sent all-reduce #{} of length {}, expected #{} of length {}",
                                i + 1,
                                s,
                                v.len(),
                                seq,
                                sum.len()
                            )))
                        }
                        Reply::Arrived(s) => {
                            return Err(self.failure(format!("rank {} at barrier #{}, expected all-reduce #{}", i + 1, s, seq)))
                        }
                    }
                }
                let n = self.world_size as f32;
                sum.iter_mut().for_each(|x| *x /= n);
                for (i, (tx, _)) in peers.iter().enumerate() {
                    tx.send(Message::Mean(seq, sum.clone()))
                        .map_err(|_| self.failure(format!("rank {} disconnected", i + 1)))?;
                }
                values.copy_from_slice(&sum);
                Ok(())
            }
            Role::Peer { from_main, to_main } => {
                to_main
                    .send(Reply::Values(seq, values.to_vec()))
                    .map_err(|_| self.failure("rank 0 disconnected"))?;
                match self.recv(from_main)? {
                    Message::Mean(s, mean) if s == seq && mean.len() == values.len() => {
                        values.copy_from_slice(&mean);
                        Ok(())
                    }
                    other => Err(self.failure(format!("expected all-reduce #{}, got {}", seq, other.describe()))),
                }
            }
        }
    }

    fn barrier(&self) -> Result<()> {
        let seq = self.next_seq();
        trace!("rank {}: barrier #{}", self.rank, seq);
        match &self.role {
            Role::Main { peers } => {
                for (i, (_, rx)) in peers.iter().enumerate() {
                    match self.recv_reply(i + 1, rx)? {
                        Reply::Arrived(s) if s == seq => {}
                        Reply::Arrived(s) | Reply::Values(s, _) => {
                            return Err(self.failure(format!("rank {} at operation #{}, expected barrier #{}", i + 1, s, seq)))
                        }
                    }
                }
                for (i, (tx, _)) in peers.iter().enumerate() {
                    tx.send(Message::Release(seq))
                        .map_err(|_| self.failure(format!("rank {} disconnected", i + 1)))?;
                }
                Ok(())
            }
            Role::Peer { from_main, to_main } => {
                to_main
                    .send(Reply::Arrived(seq))
                    .map_err(|_| self.failure("rank 0 disconnected"))?;
                match self.recv(from_main)? {
                    Message::Release(s) if s == seq => Ok(()),
                    other => Err(self.failure(format!("expected barrier #{}, got {}", seq, other.describe()))),
                }
            }
        }
    }
}
