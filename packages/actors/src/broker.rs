//! Queue broker actor.
//!
//! Holds one FIFO per queue name. Workers block on [`BrokerHandle::dequeue`]
//! and are parked until an entry arrives or their timeout passes. A
//! delivered entry stays owned by the broker until it is acknowledged, and
//! goes back to the head of its queue on a nack or when its worker goes
//! away.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use jobs_core::{Delivery, DeliveryTag, JobId, QueueEntry, QueueName, QueueStats};
use ractor::rpc::CallResult;
use ractor::{Actor, ActorProcessingErr, ActorRef};

use crate::messages::BrokerMessage;

/// Extra time an rpc waits beyond the broker-side dequeue timeout.
const DEQUEUE_GRACE: Duration = Duration::from_secs(5);
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker did not answer in time")]
    Timeout,
}

struct Pending {
    entry: QueueEntry,
    attempt: u32,
}

struct InFlight {
    worker_id: String,
    delivery: Delivery,
}

struct Waiter {
    id: u64,
    worker_id: String,
    queues: Vec<QueueName>,
    reply: ractor::RpcReplyPort<Option<Delivery>>,
}

/// State for the broker actor.
#[derive(Default)]
pub struct BrokerState {
    queues: HashMap<QueueName, VecDeque<Pending>>,
    in_flight: HashMap<DeliveryTag, InFlight>,
    waiters: VecDeque<Waiter>,
    /// Jobs that are pending or in flight.
    held: HashSet<JobId>,
    next_tag: u64,
    next_waiter: u64,
}

impl BrokerState {
    fn push_back(&mut self, entry: QueueEntry, attempt: u32) {
        self.queues
            .entry(entry.queue.clone())
            .or_default()
            .push_back(Pending { entry, attempt });
    }

    fn push_front(&mut self, entry: QueueEntry, attempt: u32) {
        self.queues
            .entry(entry.queue.clone())
            .or_default()
            .push_front(Pending { entry, attempt });
    }

    fn take_for(&mut self, queues: &[QueueName]) -> Option<Pending> {
        queues
            .iter()
            .find_map(|name| self.queues.get_mut(name).and_then(VecDeque::pop_front))
    }

    fn deliver(&mut self, worker_id: &str, pending: Pending) -> Delivery {
        self.next_tag += 1;
        let delivery = Delivery {
            tag: DeliveryTag(self.next_tag),
            entry: pending.entry,
            attempt: pending.attempt,
        };
        self.in_flight.insert(
            delivery.tag,
            InFlight {
                worker_id: worker_id.to_string(),
                delivery: delivery.clone(),
            },
        );
        delivery
    }

    /// Hand pending entries to parked workers, oldest waiter first.
    fn dispatch(&mut self) {
        let mut index = 0;
        while index < self.waiters.len() {
            if self.waiters[index].reply.is_closed() {
                self.waiters.remove(index);
                continue;
            }

            let queues = self.waiters[index].queues.clone();
            let Some(pending) = self.take_for(&queues) else {
                index += 1;
                continue;
            };

            let Some(waiter) = self.waiters.remove(index) else {
                break;
            };
            let delivery = self.deliver(&waiter.worker_id, pending);
            let tag = delivery.tag;
            if waiter.reply.send(Some(delivery)).is_err() {
                // Caller gave up between the check and the send.
                if let Some(lost) = self.in_flight.remove(&tag) {
                    self.push_front(lost.delivery.entry, lost.delivery.attempt);
                }
            }
        }
    }

    fn requeue(&mut self, tag: DeliveryTag) -> bool {
        match self.in_flight.remove(&tag) {
            Some(held) => {
                let delivery = held.delivery;
                self.push_front(delivery.entry, delivery.attempt + 1);
                true
            }
            None => false,
        }
    }

    fn stats(&self) -> Vec<QueueStats> {
        let mut names: Vec<&QueueName> = self.queues.keys().collect();
        for held in self.in_flight.values() {
            names.push(&held.delivery.entry.queue);
        }
        for waiter in &self.waiters {
            names.extend(waiter.queues.iter());
        }
        names.sort();
        names.dedup();

        names
            .into_iter()
            .map(|name| QueueStats {
                queue: name.to_string(),
                pending: self.queues.get(name).map_or(0, |q| q.len() as u64),
                in_flight: self
                    .in_flight
                    .values()
                    .filter(|h| &h.delivery.entry.queue == name)
                    .count() as u64,
                waiting_workers: self
                    .waiters
                    .iter()
                    .filter(|w| w.queues.contains(name))
                    .count() as u64,
            })
            .collect()
    }
}

/// Broker actor owning every named queue of this process.
pub struct Broker;

impl Actor for Broker {
    type Msg = BrokerMessage;
    type State = BrokerState;
    type Arguments = ();

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        _args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting queue broker");
        Ok(BrokerState::default())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            BrokerMessage::Enqueue { entry, reply } => {
                let accepted = state.held.insert(entry.job_id);
                if accepted {
                    tracing::debug!("Enqueued job {} on {}", entry.job_id, entry.queue);
                    state.push_back(entry, 1);
                    state.dispatch();
                } else {
                    tracing::debug!("Job {} is already queued", entry.job_id);
                }
                let _ = reply.send(accepted);
            }

            BrokerMessage::Dequeue {
                worker_id,
                queues,
                timeout,
                reply,
            } => {
                if let Some(pending) = state.take_for(&queues) {
                    let delivery = state.deliver(&worker_id, pending);
                    let tag = delivery.tag;
                    if reply.send(Some(delivery)).is_err() {
                        state.requeue(tag);
                    }
                    return Ok(());
                }

                state.next_waiter += 1;
                let waiter_id = state.next_waiter;
                state.waiters.push_back(Waiter {
                    id: waiter_id,
                    worker_id,
                    queues,
                    reply,
                });

                let myself = myself.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = myself.send_message(BrokerMessage::WaiterExpired { waiter_id });
                });
            }

            BrokerMessage::WaiterExpired { waiter_id } => {
                let expired = state
                    .waiters
                    .iter()
                    .position(|w| w.id == waiter_id)
                    .and_then(|pos| state.waiters.remove(pos));
                if let Some(waiter) = expired {
                    let _ = waiter.reply.send(None);
                }
            }

            BrokerMessage::Ack { tag } => match state.in_flight.remove(&tag) {
                Some(held) => {
                    state.held.remove(&held.delivery.entry.job_id);
                }
                None => tracing::debug!("Ack for unknown delivery {}", tag),
            },

            BrokerMessage::Nack { tag } => {
                if state.requeue(tag) {
                    state.dispatch();
                } else {
                    tracing::debug!("Nack for unknown delivery {}", tag);
                }
            }

            BrokerMessage::ReleaseWorker { worker_id } => {
                let tags: Vec<DeliveryTag> = state
                    .in_flight
                    .iter()
                    .filter(|(_, held)| held.worker_id == worker_id)
                    .map(|(tag, _)| *tag)
                    .collect();
                state.waiters.retain(|w| w.worker_id != worker_id);

                if !tags.is_empty() {
                    tracing::warn!(
                        "Requeueing {} deliveries held by {}",
                        tags.len(),
                        worker_id
                    );
                    // Oldest tag ends up at the head.
                    for tag in tags.into_iter().rev() {
                        state.requeue(tag);
                    }
                    state.dispatch();
                }
            }

            BrokerMessage::Contains { job_id, reply } => {
                let _ = reply.send(state.held.contains(&job_id));
            }

            BrokerMessage::Stats { reply } => {
                let _ = reply.send(state.stats());
            }

            BrokerMessage::Purge { reply } => {
                let mut removed = 0;
                for queue in state.queues.values_mut() {
                    for pending in queue.drain(..) {
                        state.held.remove(&pending.entry.job_id);
                        removed += 1;
                    }
                }
                tracing::info!("Purged {} pending entries", removed);
                let _ = reply.send(removed);
            }
        }

        Ok(())
    }
}

/// Cloneable client for the broker actor.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    actor: ActorRef<BrokerMessage>,
}

impl BrokerHandle {
    pub fn new(actor: ActorRef<BrokerMessage>) -> Self {
        Self { actor }
    }

    /// Spawn an unsupervised broker.
    pub async fn spawn() -> Result<Self, ractor::SpawnErr> {
        let (actor, _handle) = Actor::spawn(None, Broker, ()).await?;
        Ok(Self::new(actor))
    }

    pub fn actor(&self) -> &ActorRef<BrokerMessage> {
        &self.actor
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(ractor::RpcReplyPort<T>) -> BrokerMessage,
        timeout: Duration,
    ) -> Result<T, QueueError>
    where
        T: Send + 'static,
    {
        let result = ractor::rpc::call(&self.actor, build, Some(timeout))
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        match result {
            CallResult::Success(value) => Ok(value),
            CallResult::Timeout => Err(QueueError::Timeout),
            CallResult::SenderError => {
                Err(QueueError::Unavailable("reply channel dropped".to_string()))
            }
        }
    }

    /// Put an entry on its queue. Returns false if the job is already held.
    pub async fn enqueue(&self, entry: QueueEntry) -> Result<bool, QueueError> {
        self.call(|reply| BrokerMessage::Enqueue { entry, reply }, CALL_TIMEOUT)
            .await
    }

    /// Wait up to `timeout` for the next entry on any of `queues`.
    pub async fn dequeue(
        &self,
        worker_id: &str,
        queues: &[QueueName],
        timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let worker_id = worker_id.to_string();
        let queues = queues.to_vec();
        self.call(
            |reply| BrokerMessage::Dequeue {
                worker_id,
                queues,
                timeout,
                reply,
            },
            timeout + DEQUEUE_GRACE,
        )
        .await
    }

    pub fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        self.cast(BrokerMessage::Ack { tag })
    }

    pub fn nack(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        self.cast(BrokerMessage::Nack { tag })
    }

    pub fn release_worker(&self, worker_id: &str) -> Result<(), QueueError> {
        self.cast(BrokerMessage::ReleaseWorker {
            worker_id: worker_id.to_string(),
        })
    }

    pub async fn contains(&self, job_id: JobId) -> Result<bool, QueueError> {
        self.call(|reply| BrokerMessage::Contains { job_id, reply }, CALL_TIMEOUT)
            .await
    }

    pub async fn stats(&self) -> Result<Vec<QueueStats>, QueueError> {
        self.call(|reply| BrokerMessage::Stats { reply }, CALL_TIMEOUT)
            .await
    }

    pub async fn purge(&self) -> Result<usize, QueueError> {
        self.call(|reply| BrokerMessage::Purge { reply }, CALL_TIMEOUT)
            .await
    }

    fn cast(&self, message: BrokerMessage) -> Result<(), QueueError> {
        self.actor
            .send_message(message)
            .map_err(|e| QueueError::Unavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use std::error::Error;

    fn entry(queue: &str) -> QueueEntry {
        QueueEntry::new(JobId::new(), QueueName::from(queue))
    }

    #[tokio::test]
    async fn entries_leave_in_fifo_order() -> Result<(), Box<dyn Error>> {
        let broker = BrokerHandle::spawn().await?;
        let first = entry("default");
        let second = entry("default");
        broker.enqueue(first.clone()).await?;
        broker.enqueue(second.clone()).await?;

        let queues = [QueueName::default_queue()];
        let a = broker.dequeue("w1", &queues, Duration::from_millis(50)).await?;
        let b = broker.dequeue("w1", &queues, Duration::from_millis(50)).await?;
        assert_eq!(a.map(|d| d.entry.job_id), Some(first.job_id));
        assert_eq!(b.map(|d| d.entry.job_id), Some(second.job_id));
        Ok(())
    }

    #[tokio::test]
    async fn blocked_dequeue_wakes_on_enqueue() -> Result<(), Box<dyn Error>> {
        let broker = BrokerHandle::spawn().await?;
        let waiting = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .dequeue("w1", &[QueueName::heavy()], Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let heavy = entry("heavy");
        broker.enqueue(heavy.clone()).await?;

        let delivery = waiting.await??;
        assert_eq!(delivery.map(|d| d.entry.job_id), Some(heavy.job_id));
        Ok(())
    }

    #[tokio::test]
    async fn empty_dequeue_times_out() -> Result<(), Box<dyn Error>> {
        let broker = BrokerHandle::spawn().await?;
        let started = std::time::Instant::now();
        let delivery = broker
            .dequeue("w1", &[QueueName::default_queue()], Duration::from_millis(100))
            .await?;
        assert!(delivery.is_none());
        assert!(started.elapsed() >= Duration::from_millis(100));

        let stats = broker.stats().await?;
        assert!(stats.iter().all(|s| s.waiting_workers == 0));
        Ok(())
    }

    #[tokio::test]
    async fn nack_and_release_redeliver() -> Result<(), Box<dyn Error>> {
        let broker = BrokerHandle::spawn().await?;
        let queues = [QueueName::default_queue()];
        let job = entry("default");
        broker.enqueue(job.clone()).await?;

        let first = broker
            .dequeue("w1", &queues, Duration::from_millis(50))
            .await?
            .ok_or("no delivery")?;
        broker.nack(first.tag)?;

        let second = broker
            .dequeue("w2", &queues, Duration::from_millis(50))
            .await?
            .ok_or("no redelivery")?;
        assert_eq!(second.entry.job_id, job.job_id);
        assert_eq!(second.attempt, 2);

        broker.release_worker("w2")?;
        let third = broker
            .dequeue("w3", &queues, Duration::from_millis(50))
            .await?
            .ok_or("no delivery after release")?;
        assert_eq!(third.attempt, 3);

        broker.ack(third.tag)?;
        assert!(!broker.contains(job.job_id).await?);
        Ok(())
    }

    #[tokio::test]
    async fn held_jobs_are_not_enqueued_twice() -> Result<(), Box<dyn Error>> {
        let broker = BrokerHandle::spawn().await?;
        let job = entry("default");
        assert!(broker.enqueue(job.clone()).await?);
        assert!(!broker.enqueue(job.clone()).await?);

        let delivery = broker
            .dequeue("w1", &[QueueName::default_queue()], Duration::from_millis(50))
            .await?
            .ok_or("no delivery")?;
        // Delivered but unacknowledged still counts as held.
        assert!(!broker.enqueue(job.clone()).await?);

        broker.ack(delivery.tag)?;
        assert!(broker.enqueue(job).await?);
        Ok(())
    }

    #[tokio::test]
    async fn stats_and_purge() -> Result<(), Box<dyn Error>> {
        let broker = BrokerHandle::spawn().await?;
        broker.enqueue(entry("default")).await?;
        broker.enqueue(entry("default")).await?;
        broker.enqueue(entry("heavy")).await?;
        broker
            .dequeue("w1", &[QueueName::heavy()], Duration::from_millis(50))
            .await?;

        let stats = broker.stats().await?;
        let default = stats.iter().find(|s| s.queue == "default").ok_or("default")?;
        let heavy = stats.iter().find(|s| s.queue == "heavy").ok_or("heavy")?;
        assert_eq!((default.pending, default.in_flight), (2, 0));
        assert_eq!((heavy.pending, heavy.in_flight), (0, 1));

        assert_eq!(broker.purge().await?, 2);
        let stats = broker.stats().await?;
        assert_eq!(stats.iter().map(|s| s.pending).sum::<u64>(), 0);
        Ok(())
    }
}
