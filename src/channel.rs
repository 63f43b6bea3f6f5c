//! Bounded FIFO channels.
//!
//! A [`Channel`] is shared by processes, which `put(..).await` and
//! `take().await`, and by event-based code, which probes it with
//! [`Channel::is_ready`] and uses the non-blocking `try_` operations.
//! Both styles may touch the same channel.
//!
//! Handoff rules:
//!
//! | Operation | Taker waiting | Buffer has room | Otherwise |
//! |---|---|---|---|
//! | `put(v)` | hand `v` to the oldest taker | buffer `v` | suspend as putter |
//!
//! | Operation | Buffer non-empty | Putter waiting | Otherwise |
//! |---|---|---|---|
//! | `take()` | oldest buffered value; oldest putter refills the slot | oldest putter's value | suspend as taker |
//!
//! A channel never holds buffered values while a taker is waiting.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use crate::process::WaitReason;
use crate::simulation::Kernel;

/// Identifier of a channel, unique within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelId(u64);

impl ChannelId {
    pub(crate) fn new(raw: u64) -> Self {
        ChannelId(raw)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// Direction a process is blocked in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum ChannelOp {
    Take,
    Put,
}

// ── State ─────────────────────────────────────────────────────────────

struct Waiter {
    ticket: u64,
    waker: Waker,
}

struct ChannelState<T> {
    capacity: usize,
    buffer: VecDeque<T>,
    takers: VecDeque<Waiter>,
    putters: VecDeque<(Waiter, T)>,
    /// Values handed straight to a suspended taker, by ticket.
    delivered: BTreeMap<u64, T>,
    /// Suspended putters whose value has been taken.
    released: BTreeSet<u64>,
    next_ticket: u64,
}

impl<T> ChannelState<T> {
    fn new(capacity: usize) -> Self {
        ChannelState {
            capacity,
            buffer: VecDeque::new(),
            takers: VecDeque::new(),
            putters: VecDeque::new(),
            delivered: BTreeMap::new(),
            released: BTreeSet::new(),
            next_ticket: 0,
        }
    }

    fn ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }

    /// Place `value` without suspending, or hand it back.
    fn offer(&mut self, value: T) -> Result<(), T> {
        if let Some(taker) = self.takers.pop_front() {
            self.delivered.insert(taker.ticket, value);
            taker.waker.wake();
            return Ok(());
        }
        if self.buffer.len() < self.capacity {
            self.buffer.push_back(value);
            return Ok(());
        }
        Err(value)
    }

    /// Remove a value without suspending.
    fn take_now(&mut self) -> Option<T> {
        if let Some(value) = self.buffer.pop_front() {
            if self.buffer.len() < self.capacity {
                if let Some((putter, pending)) = self.putters.pop_front() {
                    self.buffer.push_back(pending);
                    self.release(putter);
                }
            }
            return Some(value);
        }
        let (putter, value) = self.putters.pop_front()?;
        self.release(putter);
        Some(value)
    }

    fn release(&mut self, putter: Waiter) {
        self.released.insert(putter.ticket);
        putter.waker.wake();
    }

    fn is_ready(&self) -> bool {
        !self.buffer.is_empty() || !self.putters.is_empty()
    }
}

// ── Channel ───────────────────────────────────────────────────────────

/// A bounded FIFO channel created by [`Simulation::channel`](crate::Simulation::channel).
///
/// Cloning yields another handle to the same channel.
///
/// ```rust
/// use kairos::Simulation;
///
/// let sim = Simulation::new();
/// let ch = sim.channel::<u32>(0);
///
/// let rx = ch.clone();
/// sim.launch(|p| async move {
///     let v = rx.take().await;
///     assert_eq!((v, p.now().value()), (7, 3.0));
///     Ok(())
/// });
/// sim.launch(|p| async move {
///     p.delay(3.0).await?;
///     ch.put(7).await;
///     Ok(())
/// });
/// sim.run(10.0).unwrap();
/// ```
pub struct Channel<T> {
    id: ChannelId,
    state: Rc<RefCell<ChannelState<T>>>,
    kernel: Weak<Kernel>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel {
            id: self.id,
            state: Rc::clone(&self.state),
            kernel: self.kernel.clone(),
        }
    }
}

impl<T> Channel<T> {
    pub(crate) fn new(id: ChannelId, capacity: usize, kernel: Weak<Kernel>) -> Self {
        Channel {
            id,
            state: Rc::new(RefCell::new(ChannelState::new(capacity))),
            kernel,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Send `value`, suspending while the channel is full.
    pub fn put(&self, value: T) -> Put<T> {
        Put {
            channel: self.clone(),
            state: PutState::Start(value),
        }
    }

    /// Receive the next value, suspending while none is available.
    pub fn take(&self) -> Take<T> {
        Take {
            channel: self.clone(),
            state: TakeState::Start,
        }
    }

    /// `true` if a `take` would complete without suspending.
    pub fn is_ready(&self) -> bool {
        self.state.borrow().is_ready()
    }

    /// Send without suspending. Hands `value` back if the channel is full.
    pub fn try_put(&self, value: T) -> Result<(), T> {
        self.state.borrow_mut().offer(value)
    }

    /// Receive without suspending.
    pub fn try_take(&self) -> Option<T> {
        self.state.borrow_mut().take_now()
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        self.state.borrow().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.state.borrow().capacity
    }

    pub fn pending_takers(&self) -> usize {
        self.state.borrow().takers.len()
    }

    pub fn pending_putters(&self) -> usize {
        self.state.borrow().putters.len()
    }

    fn mark_waiting(&self, op: ChannelOp) {
        if let Some(kernel) = self.kernel.upgrade() {
            kernel.mark_current_waiting(WaitReason::Channel {
                channel: self.id,
                op,
            });
        }
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("capacity", &state.capacity)
            .field("buffered", &state.buffer.len())
            .field("takers", &state.takers.len())
            .field("putters", &state.putters.len())
            .finish()
    }
}

// ── Put ───────────────────────────────────────────────────────────────

enum PutState<T> {
    Start(T),
    Waiting(u64),
    Done,
}

/// Future returned by [`Channel::put`].
///
/// Dropping it while suspended withdraws the value.
#[must_use = "futures do nothing unless awaited"]
pub struct Put<T> {
    channel: Channel<T>,
    state: PutState<T>,
}

// The value is never pinned in place.
impl<T> Unpin for Put<T> {}

impl<T> Future for Put<T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        match std::mem::replace(&mut this.state, PutState::Done) {
            PutState::Start(value) => {
                let mut state = this.channel.state.borrow_mut();
                let Err(value) = state.offer(value) else {
                    return Poll::Ready(());
                };
                let ticket = state.ticket();
                let waiter = Waiter {
                    ticket,
                    waker: cx.waker().clone(),
                };
                state.putters.push_back((waiter, value));
                drop(state);
                this.channel.mark_waiting(ChannelOp::Put);
                this.state = PutState::Waiting(ticket);
                Poll::Pending
            }
            PutState::Waiting(ticket) => {
                if this.channel.state.borrow_mut().released.remove(&ticket) {
                    Poll::Ready(())
                } else {
                    this.state = PutState::Waiting(ticket);
                    Poll::Pending
                }
            }
            PutState::Done => Poll::Ready(()),
        }
    }
}

impl<T> Drop for Put<T> {
    fn drop(&mut self) {
        if let PutState::Waiting(ticket) = self.state {
            let mut state = self.channel.state.borrow_mut();
            if !state.released.remove(&ticket) {
                state.putters.retain(|(waiter, _)| waiter.ticket != ticket);
            }
        }
    }
}

// ── Take ──────────────────────────────────────────────────────────────

enum TakeState {
    Start,
    Waiting(u64),
    Done,
}

/// Future returned by [`Channel::take`].
///
/// Dropping it after a value was handed over puts the value back.
#[must_use = "futures do nothing unless awaited"]
pub struct Take<T> {
    channel: Channel<T>,
    state: TakeState,
}

impl<T> Unpin for Take<T> {}

impl<T> Future for Take<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        match this.state {
            TakeState::Start => {
                let mut state = this.channel.state.borrow_mut();
                if let Some(value) = state.take_now() {
                    this.state = TakeState::Done;
                    return Poll::Ready(value);
                }
                let ticket = state.ticket();
                state.takers.push_back(Waiter {
                    ticket,
                    waker: cx.waker().clone(),
                });
                drop(state);
                this.channel.mark_waiting(ChannelOp::Take);
                this.state = TakeState::Waiting(ticket);
                Poll::Pending
            }
            TakeState::Waiting(ticket) => {
                let delivered = this.channel.state.borrow_mut().delivered.remove(&ticket);
                match delivered {
                    Some(value) => {
                        this.state = TakeState::Done;
                        Poll::Ready(value)
                    }
                    None => Poll::Pending,
                }
            }
            TakeState::Done => panic!("`Take` polled after completion"),
        }
    }
}

impl<T> Drop for Take<T> {
    fn drop(&mut self) {
        if let TakeState::Waiting(ticket) = self.state {
            let mut state = self.channel.state.borrow_mut();
            match state.delivered.remove(&ticket) {
                Some(value) => {
                    if let Err(value) = state.offer(value) {
                        state.buffer.push_front(value);
                    }
                }
                None => state.takers.retain(|waiter| waiter.ticket != ticket),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Simulation;

    #[test]
    fn test_buffered_round_trip() {
        let sim = Simulation::new();
        let ch = sim.channel(2);
        assert_eq!(ch.capacity(), 2);
        assert!(!ch.is_ready());

        assert!(ch.try_put(1).is_ok());
        assert!(ch.try_put(2).is_ok());
        assert_eq!(ch.try_put(3), Err(3));
        assert!(ch.is_ready());
        assert_eq!(ch.len(), 2);

        assert_eq!(ch.try_take(), Some(1));
        assert_eq!(ch.try_take(), Some(2));
        assert_eq!(ch.try_take(), None);
        assert!(ch.is_empty());
    }

    #[test]
    fn test_zero_capacity_rejects_try_put_without_taker() {
        let sim = Simulation::new();
        let ch = sim.channel(0);
        assert_eq!(ch.try_put("x"), Err("x"));
        assert!(!ch.is_ready());
    }

    #[test]
    fn test_put_then_take_in_process() {
        let sim = Simulation::new();
        let ch = sim.channel(1);
        let got = Rc::new(RefCell::new(None));

        let (tx, rx, slot) = (ch.clone(), ch.clone(), Rc::clone(&got));
        sim.launch(|_| async move {
            tx.put(42).await;
            Ok(())
        });
        sim.launch(|_| async move {
            *slot.borrow_mut() = Some(rx.take().await);
            Ok(())
        });
        sim.run(1.0).unwrap();

        assert_eq!(*got.borrow(), Some(42));
        assert_eq!(sim.process_count(), 0);
    }

    #[test]
    fn test_full_buffer_suspends_putter_until_take() {
        let sim = Simulation::new();
        let ch = sim.channel(1);
        let done_at = Rc::new(RefCell::new(Vec::new()));

        let (tx, log) = (ch.clone(), Rc::clone(&done_at));
        sim.launch(|p| async move {
            tx.put('a').await;
            tx.put('b').await;
            log.borrow_mut().push(p.now().value());
            Ok(())
        });
        sim.run(1.0).unwrap();
        assert_eq!(ch.len(), 1);
        assert_eq!(ch.pending_putters(), 1);
        assert!(done_at.borrow().is_empty());

        let rx = ch.clone();
        sim.schedule_at(2.0, move |_| {
            assert_eq!(rx.try_take(), Some('a'));
            Ok(())
        })
        .unwrap();
        sim.run(3.0).unwrap();

        // The putter's value moved into the freed slot.
        assert_eq!(ch.pending_putters(), 0);
        assert_eq!(ch.try_take(), Some('b'));
        assert_eq!(*done_at.borrow(), vec![2.0]);
    }

    #[test]
    fn test_event_code_feeds_waiting_taker() {
        let sim = Simulation::new();
        let ch = sim.channel(0);
        let got = Rc::new(RefCell::new(Vec::new()));

        let (rx, log) = (ch.clone(), Rc::clone(&got));
        sim.launch(|p| async move {
            let v = rx.take().await;
            log.borrow_mut().push((p.now().value(), v));
            Ok(())
        });
        let tx = ch.clone();
        sim.schedule_at(4.0, move |_| {
            tx.try_put(9).map_err(|_| anyhow::anyhow!("no taker"))
        })
        .unwrap();
        sim.run(5.0).unwrap();

        assert_eq!(*got.borrow(), vec![(4.0, 9)]);
    }

    #[test]
    fn test_takers_served_fifo() {
        let sim = Simulation::new();
        let ch = sim.channel(0);
        let got = Rc::new(RefCell::new(Vec::new()));

        for name in ["first", "second"] {
            let (rx, log) = (ch.clone(), Rc::clone(&got));
            sim.launch(move |_| async move {
                let v = rx.take().await;
                log.borrow_mut().push((name, v));
                Ok(())
            });
        }
        sim.run(1.0).unwrap();
        assert_eq!(ch.pending_takers(), 2);

        assert!(ch.try_put(1).is_ok());
        assert!(ch.try_put(2).is_ok());
        sim.run(2.0).unwrap();
        assert_eq!(*got.borrow(), vec![("first", 1), ("second", 2)]);
    }

    #[test]
    fn test_dropped_take_returns_delivered_value() {
        let sim = Simulation::new();
        let ch = sim.channel::<u8>(0);

        let rx = ch.clone();
        let pid = sim.launch(|_| async move {
            rx.take().await;
            Ok(())
        });
        sim.run(1.0).unwrap();

        // Delivered but not yet resumed; killing the taker re-offers it.
        assert!(ch.try_put(5).is_ok());
        assert!(sim.kill(pid));
        assert_eq!(ch.len(), 1);
        assert_eq!(ch.try_take(), Some(5));
    }
}
