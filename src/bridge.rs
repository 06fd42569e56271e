// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Bridge
//!
//! The single handoff point between the broker client's callback context, which
//! pushes deliveries whenever the broker sends them, and the consumer stream, which
//! pulls them when the caller asks. Pushing never blocks the callback; when the
//! buffer is full the configured [`OverflowStrategy`] decides what happens.

use crate::errors::AmqpError;
use futures_util::task::AtomicWaker;
use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};

/// Default capacity for the bounded strategies.
pub const DEFAULT_BUFFER_SIZE: usize = 256;

/// Behavior when the bridge buffer is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowStrategy {
    /// Never drop; memory grows as long as the broker outpaces the consumer.
    #[default]
    Buffer,
    /// Discard the incoming delivery and keep queued ones.
    DropNewest,
    /// Discard the oldest queued delivery to make room.
    DropOldest,
    /// Fail the stream.
    Error,
}

/// What happened to a pushed item.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Pushed<T> {
    Queued,
    /// Item discarded by the overflow strategy.
    Dropped(T),
    /// Buffer overflowed under [`OverflowStrategy::Error`]; the stream is now failed.
    Overflow(T),
    /// The stream already terminated.
    Closed(T),
}

struct BridgeState<T> {
    items: VecDeque<T>,
    terminal: Option<Result<(), AmqpError>>,
}

pub(crate) struct Bridge<T> {
    state: Mutex<BridgeState<T>>,
    waker: AtomicWaker,
    strategy: OverflowStrategy,
    capacity: usize,
}

impl<T> Bridge<T> {
    pub(crate) fn new(strategy: OverflowStrategy, capacity: usize) -> Self {
        Bridge {
            state: Mutex::new(BridgeState {
                items: VecDeque::new(),
                terminal: None,
            }),
            waker: AtomicWaker::new(),
            strategy,
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BridgeState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, item: T) -> Pushed<T> {
        let pushed = {
            let mut state = self.lock();

            if state.terminal.is_some() {
                return Pushed::Closed(item);
            }

            let full = state.items.len() >= self.capacity;
            match self.strategy {
                OverflowStrategy::Buffer => {
                    state.items.push_back(item);
                    Pushed::Queued
                }
                _ if !full => {
                    state.items.push_back(item);
                    Pushed::Queued
                }
                OverflowStrategy::DropNewest => Pushed::Dropped(item),
                OverflowStrategy::DropOldest => {
                    let oldest = state.items.pop_front();
                    state.items.push_back(item);
                    match oldest {
                        Some(oldest) => Pushed::Dropped(oldest),
                        None => Pushed::Queued,
                    }
                }
                OverflowStrategy::Error => {
                    state.terminal = Some(Err(AmqpError::ConsumeError(format!(
                        "delivery buffer overflow ({} pending)",
                        state.items.len()
                    ))));
                    Pushed::Overflow(item)
                }
            }
        };

        self.waker.wake();
        pushed
    }

    /// Terminates the stream once already queued items are drained. The first
    /// terminal outcome wins.
    pub(crate) fn complete(&self, outcome: Result<(), AmqpError>) {
        {
            let mut state = self.lock();
            if state.terminal.is_none() {
                state.terminal = Some(outcome);
            }
        }
        self.waker.wake();
    }

    /// Terminates the stream immediately, dropping queued items.
    pub(crate) fn abort(&self, outcome: Result<(), AmqpError>) -> Vec<T> {
        let drained = {
            let mut state = self.lock();
            if state.terminal.is_none() {
                state.terminal = Some(outcome);
            }
            state.items.drain(..).collect()
        };
        self.waker.wake();
        drained
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Next item, then the terminal error if any, then `None` forever.
    pub(crate) fn poll_next(&self, cx: &mut Context<'_>) -> Poll<Option<Result<T, AmqpError>>> {
        self.waker.register(cx.waker());

        let mut state = self.lock();
        if let Some(item) = state.items.pop_front() {
            return Poll::Ready(Some(Ok(item)));
        }

        match &mut state.terminal {
            None => Poll::Pending,
            Some(Ok(())) => Poll::Ready(None),
            Some(terminal @ Err(_)) => {
                let outcome = std::mem::replace(terminal, Ok(()));
                Poll::Ready(outcome.err().map(Err))
            }
        }
    }
}
