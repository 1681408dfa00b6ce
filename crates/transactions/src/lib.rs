//! The two-phase reference-transaction voting protocol.
//!
//! Every mutator RPC registers a transaction with the primary and each
//! voting secondary as participants. While handling the forwarded RPC, each
//! storage node hashes the reference updates it intends to apply and calls
//! `VoteTransaction` back against the proxy; the call blocks until enough
//! identical votes arrive (quorum), agreement becomes impossible (abort), or
//! the transaction is stopped.
//!
//! Transactions are in-memory and owned by the proxy instance that created
//! them; the per-RPC metadata injected into forwarded requests tells the
//! storage node where to send its votes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// Metadata keys observed by storage nodes on forwarded mutator RPCs.
pub const METADATA_TRANSACTION_ID: &str = "palisade-transaction-id";
pub const METADATA_NODE_NAME: &str = "palisade-node-name";
pub const METADATA_SERVER_ADDR: &str = "palisade-server-addr";

#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("transaction {0} not found")]
    NotFound(u64),
    #[error("invalid vote: {0}")]
    InvalidVote(String),
}

/// Reply sent to a blocked voter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    Commit,
    Abort,
    Stop,
}

/// Participant state, reported to the coordinator's finalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoterState {
    /// Registered but has not finished voting.
    Init,
    Committed,
    Aborted,
    Stopped,
}

/// How many identical votes a transaction requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threshold {
    /// Every registered voter must agree; used for reference updates.
    Strict,
    /// A strict majority suffices; used for maintenance.
    Majority,
}

impl Threshold {
    fn required(self, voters: usize) -> usize {
        match self {
            Threshold::Strict => voters,
            Threshold::Majority => voters / 2 + 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Resolution {
    Pending,
    Committed(Vec<u8>),
    Aborted,
    Stopped,
}

/// One independent quorum within a transaction. A node's n-th vote is
/// counted against the n-th subtransaction, so a single RPC may vote on a
/// sequence of reference updates.
struct Subtransaction {
    votes: HashMap<Vec<u8>, usize>,
    cast: usize,
    sender: watch::Sender<Resolution>,
    receiver: watch::Receiver<Resolution>,
}

impl Subtransaction {
    fn new() -> Self {
        let (sender, receiver) = watch::channel(Resolution::Pending);
        Self {
            votes: HashMap::new(),
            cast: 0,
            sender,
            receiver,
        }
    }

    fn resolve(&self, resolution: Resolution) {
        // Keep the first resolution; late arrivals compare against it.
        self.sender.send_if_modified(|current| {
            if *current == Resolution::Pending {
                *current = resolution;
                true
            } else {
                false
            }
        });
    }
}

struct Voter {
    storage: String,
    votes_cast: usize,
    state: VoterState,
}

struct Inner {
    voters: Vec<Voter>,
    subtransactions: Vec<Subtransaction>,
    stopped: bool,
}

pub struct Transaction {
    id: u64,
    threshold: usize,
    inner: Mutex<Inner>,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Participant states, keyed by storage name.
    pub fn results(&self) -> HashMap<String, VoterState> {
        let inner = self.inner.lock().unwrap();
        inner
            .voters
            .iter()
            .map(|voter| (voter.storage.clone(), voter.state))
            .collect()
    }

    /// Storages whose every vote reached quorum.
    pub fn committed_storages(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .voters
            .iter()
            .filter(|voter| voter.state == VoterState::Committed)
            .map(|voter| voter.storage.clone())
            .collect()
    }

    async fn vote(&self, storage: &str, vote_hash: Vec<u8>) -> Result<VoteOutcome, TransactionError> {
        if vote_hash.is_empty() {
            return Err(TransactionError::InvalidVote(
                "zero-length vote hash".to_string(),
            ));
        }

        let mut receiver = {
            let mut inner = self.inner.lock().unwrap();
            let total_voters = inner.voters.len();
            let threshold = self.threshold;

            if inner.stopped {
                let voter = find_voter(&mut inner, storage)?;
                voter.state = VoterState::Stopped;
                return Ok(VoteOutcome::Stop);
            }

            let index = {
                let voter = find_voter(&mut inner, storage)?;
                let index = voter.votes_cast;
                voter.votes_cast += 1;
                index
            };
            while inner.subtransactions.len() <= index {
                inner.subtransactions.push(Subtransaction::new());
            }

            let subtransaction = &mut inner.subtransactions[index];
            if *subtransaction.receiver.borrow() == Resolution::Pending {
                subtransaction.cast += 1;
                let count = {
                    let count = subtransaction.votes.entry(vote_hash.clone()).or_insert(0);
                    *count += 1;
                    *count
                };

                if count >= threshold {
                    subtransaction.resolve(Resolution::Committed(vote_hash.clone()));
                } else {
                    // Abort as soon as no hash can still reach quorum, so
                    // voters are not left blocking on an impossible vote.
                    let remaining = total_voters - subtransaction.cast;
                    let best = subtransaction.votes.values().copied().max().unwrap_or(0);
                    if best + remaining < threshold {
                        subtransaction.resolve(Resolution::Aborted);
                    }
                }
            }
            inner.subtransactions[index].receiver.clone()
        };

        // Block until the subtransaction resolves. Dropping this future
        // (client cancellation) simply abandons the wait.
        while *receiver.borrow() == Resolution::Pending {
            if receiver.changed().await.is_err() {
                break;
            }
        }
        let resolution = receiver.borrow().clone();

        let outcome = match resolution {
            Resolution::Committed(winning) if winning == vote_hash => VoteOutcome::Commit,
            Resolution::Committed(_) | Resolution::Aborted | Resolution::Pending => {
                VoteOutcome::Abort
            }
            Resolution::Stopped => VoteOutcome::Stop,
        };

        let mut inner = self.inner.lock().unwrap();
        let voter = find_voter(&mut inner, storage)?;
        voter.state = match outcome {
            VoteOutcome::Commit => VoterState::Committed,
            VoteOutcome::Abort => VoterState::Aborted,
            VoteOutcome::Stop => VoterState::Stopped,
        };
        Ok(outcome)
    }

    fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stopped = true;
        for subtransaction in &inner.subtransactions {
            subtransaction.resolve(Resolution::Stopped);
        }
    }

    /// Ends the transaction when its RPC finishes: voters which never voted
    /// are treated as having aborted, and any quorum still pending can no
    /// longer be reached.
    fn finish(&self) {
        let mut inner = self.inner.lock().unwrap();
        for voter in &mut inner.voters {
            if voter.state == VoterState::Init {
                voter.state = VoterState::Aborted;
            }
        }
        for subtransaction in &inner.subtransactions {
            subtransaction.resolve(Resolution::Aborted);
        }
    }
}

fn find_voter<'i>(inner: &'i mut Inner, storage: &str) -> Result<&'i mut Voter, TransactionError> {
    inner
        .voters
        .iter_mut()
        .find(|voter| voter.storage == storage)
        .ok_or_else(|| TransactionError::InvalidVote(format!("{storage:?} is not a participant")))
}

/// Registry of in-flight transactions of this proxy instance.
#[derive(Clone, Default)]
pub struct TransactionManager {
    transactions: Arc<Mutex<HashMap<u64, Arc<Transaction>>>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a transaction over `voters` and returns it. The id is
    /// random so concurrently proxied RPCs cannot collide.
    pub fn register(&self, voters: Vec<String>, threshold: Threshold) -> Arc<Transaction> {
        let mut transactions = self.transactions.lock().unwrap();

        loop {
            let id: u64 = rand::random();
            if transactions.contains_key(&id) {
                continue;
            }

            let transaction = Arc::new(Transaction {
                id,
                threshold: threshold.required(voters.len()),
                inner: Mutex::new(Inner {
                    voters: voters
                        .iter()
                        .map(|storage| Voter {
                            storage: storage.clone(),
                            votes_cast: 0,
                            state: VoterState::Init,
                        })
                        .collect(),
                    subtransactions: Vec::new(),
                    stopped: false,
                }),
            });
            transactions.insert(id, transaction.clone());
            return transaction;
        }
    }

    /// Casts `storage`'s vote and blocks until the outcome is known.
    pub async fn vote(
        &self,
        id: u64,
        storage: &str,
        vote_hash: Vec<u8>,
    ) -> Result<VoteOutcome, TransactionError> {
        let transaction = self.get(id)?;
        transaction.vote(storage, vote_hash).await
    }

    /// Stops a transaction: all blocked voters unblock with `Stop` and any
    /// further vote returns `Stop`. Stopping twice is fine.
    pub fn stop(&self, id: u64) -> Result<(), TransactionError> {
        self.get(id)?.stop();
        Ok(())
    }

    /// Removes the transaction when its RPC ends, resolving whatever is
    /// still pending as aborted. Returns the transaction for inspection.
    pub fn finish(&self, id: u64) -> Option<Arc<Transaction>> {
        let transaction = self.transactions.lock().unwrap().remove(&id)?;
        transaction.finish();
        Some(transaction)
    }

    fn get(&self, id: u64) -> Result<Arc<Transaction>, TransactionError> {
        self.transactions
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(TransactionError::NotFound(id))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn unanimous_vote_commits() {
        let manager = TransactionManager::new();
        let transaction =
            manager.register(strings(&["node-a", "node-b", "node-c"]), Threshold::Strict);
        let id = transaction.id();

        let votes = futures::future::join_all(["node-a", "node-b", "node-c"].map(|storage| {
            let manager = manager.clone();
            async move { manager.vote(id, storage, b"hash-1".to_vec()).await.unwrap() }
        }))
        .await;

        assert_eq!(votes, vec![VoteOutcome::Commit; 3]);
        assert_eq!(
            transaction.committed_storages(),
            strings(&["node-a", "node-b", "node-c"])
        );
    }

    #[tokio::test]
    async fn split_vote_aborts_everyone_under_strict_threshold() {
        let manager = TransactionManager::new();
        let transaction =
            manager.register(strings(&["node-a", "node-b", "node-c"]), Threshold::Strict);
        let id = transaction.id();

        // Two vote one way, one the other: agreement is provably impossible
        // the moment the divergent vote arrives.
        let votes = futures::future::join_all([
            ("node-a", b"hash-1".to_vec()),
            ("node-b", b"hash-1".to_vec()),
            ("node-c", b"hash-2".to_vec()),
        ]
        .map(|(storage, hash)| {
            let manager = manager.clone();
            async move { manager.vote(id, storage, hash).await.unwrap() }
        }))
        .await;

        assert_eq!(votes, vec![VoteOutcome::Abort; 3]);
        assert!(transaction.committed_storages().is_empty());
    }

    #[tokio::test]
    async fn majority_threshold_commits_without_stragglers() {
        let manager = TransactionManager::new();
        let transaction =
            manager.register(strings(&["node-a", "node-b", "node-c"]), Threshold::Majority);
        let id = transaction.id();

        // Two of three suffice; the vote resolves before node-c shows up.
        let first = manager.vote(id, "node-a", b"hash-1".to_vec());
        let second = manager.vote(id, "node-b", b"hash-1".to_vec());
        let (first, second) = futures::join!(first, second);
        assert_eq!(first.unwrap(), VoteOutcome::Commit);
        assert_eq!(second.unwrap(), VoteOutcome::Commit);

        // A matching late vote commits; a divergent one aborts.
        assert_eq!(
            manager.vote(id, "node-c", b"hash-1".to_vec()).await.unwrap(),
            VoteOutcome::Commit
        );
    }

    #[tokio::test]
    async fn late_divergent_vote_aborts() {
        let manager = TransactionManager::new();
        manager.register(strings(&["node-a", "node-b"]), Threshold::Majority);
        let id = manager.transactions.lock().unwrap().keys().next().copied().unwrap();

        let (first, second) = futures::join!(
            manager.vote(id, "node-a", b"hash-1".to_vec()),
            manager.vote(id, "node-b", b"hash-2".to_vec()),
        );
        // Majority of two is two: the split aborts both.
        assert_eq!(first.unwrap(), VoteOutcome::Abort);
        assert_eq!(second.unwrap(), VoteOutcome::Abort);
    }

    #[tokio::test]
    async fn subtransactions_carry_independent_quorums() {
        let manager = TransactionManager::new();
        let transaction = manager.register(strings(&["node-a", "node-b"]), Threshold::Strict);
        let id = transaction.id();

        // First round agrees.
        let (a, b) = futures::join!(
            manager.vote(id, "node-a", b"round-1".to_vec()),
            manager.vote(id, "node-b", b"round-1".to_vec()),
        );
        assert_eq!((a.unwrap(), b.unwrap()), (VoteOutcome::Commit, VoteOutcome::Commit));

        // Second round splits and aborts without affecting the first.
        let (a, b) = futures::join!(
            manager.vote(id, "node-a", b"round-2a".to_vec()),
            manager.vote(id, "node-b", b"round-2b".to_vec()),
        );
        assert_eq!((a.unwrap(), b.unwrap()), (VoteOutcome::Abort, VoteOutcome::Abort));

        // The voters' final state reflects the last round.
        assert!(transaction.committed_storages().is_empty());
    }

    #[tokio::test]
    async fn stop_unblocks_voters_and_rejects_future_votes() {
        let manager = TransactionManager::new();
        let transaction = manager.register(strings(&["node-a", "node-b"]), Threshold::Strict);
        let id = transaction.id();

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.vote(id, "node-a", b"hash-1".to_vec()).await })
        };
        tokio::task::yield_now().await;

        manager.stop(id).unwrap();
        manager.stop(id).unwrap(); // Idempotent.

        assert_eq!(pending.await.unwrap().unwrap(), VoteOutcome::Stop);
        assert_eq!(
            manager.vote(id, "node-b", b"hash-1".to_vec()).await.unwrap(),
            VoteOutcome::Stop
        );
    }

    #[tokio::test]
    async fn unknown_transactions_and_voters_are_rejected() {
        let manager = TransactionManager::new();
        assert!(matches!(
            manager.vote(42, "node-a", b"hash".to_vec()).await,
            Err(TransactionError::NotFound(42))
        ));
        assert!(matches!(manager.stop(42), Err(TransactionError::NotFound(42))));

        let transaction = manager.register(strings(&["node-a"]), Threshold::Strict);
        assert!(matches!(
            manager.vote(transaction.id(), "node-x", b"hash".to_vec()).await,
            Err(TransactionError::InvalidVote(_))
        ));
        assert!(matches!(
            manager.vote(transaction.id(), "node-a", Vec::new()).await,
            Err(TransactionError::InvalidVote(_))
        ));
    }

    #[tokio::test]
    async fn finishing_marks_silent_voters_aborted() {
        let manager = TransactionManager::new();
        let transaction = manager.register(strings(&["node-a", "node-b"]), Threshold::Strict);
        let id = transaction.id();

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.vote(id, "node-a", b"hash-1".to_vec()).await })
        };
        tokio::task::yield_now().await;

        // The RPC ends; node-b never voted.
        let finished = manager.finish(id).unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), VoteOutcome::Abort);

        let results = finished.results();
        assert_eq!(results["node-a"], VoterState::Aborted);
        assert_eq!(results["node-b"], VoterState::Aborted);
        assert!(matches!(
            manager.vote(id, "node-b", b"hash-1".to_vec()).await,
            Err(TransactionError::NotFound(_))
        ));
    }
}
