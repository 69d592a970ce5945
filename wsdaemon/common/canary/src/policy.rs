// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::time::Duration;

use idmapping::CanaryConfig;

/// Where a canary session currently is in its lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Idle,
    Dialing,
    Established,
    Serving { served: u32 },
    Closing { failed: bool },
    Backoff,
    Done,
}

/// Something that happened while driving a canary session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    Start,
    DialSucceeded,
    DialFailed,
    StreamOpened,
    StreamFailed,
    RequestServed,
    StreamClosed,
    DelayElapsed,
    Cancelled,
}

/// The transition rules of a canary session.
///
/// A session serves at most `max_requests` requests on one stream, then
/// closes it and waits `reconnect_delay` before dialing again. Failed
/// sessions wait only half as long, so that a workspace which is still
/// starting up gets served soon.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CanaryPolicy {
    pub max_requests: u32,
    pub reconnect_delay: Duration,
}

impl From<&CanaryConfig> for CanaryPolicy {
    fn from(config: &CanaryConfig) -> Self {
        Self {
            max_requests: config.max_requests,
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

impl CanaryPolicy {
    fn backoff(&self, failed: bool) -> (State, Option<Duration>) {
        let delay = if failed {
            self.reconnect_delay / 2
        } else {
            self.reconnect_delay
        };
        (State::Backoff, Some(delay))
    }

    /// Computes the state following `state` after `event`, and how long to
    /// wait before acting on the new state.
    ///
    /// Events that make no sense in the current state leave it unchanged.
    pub fn next(&self, state: State, event: Event) -> (State, Option<Duration>) {
        match (state, event) {
            (_, Event::Cancelled) => (State::Done, None),
            (State::Done, _) => (State::Done, None),

            (State::Idle, Event::Start) => (State::Dialing, None),

            (State::Dialing, Event::DialSucceeded) => (State::Established, None),
            (State::Dialing, Event::DialFailed) => self.backoff(true),

            (State::Established, Event::StreamOpened) => (State::Serving { served: 0 }, None),
            (State::Established, Event::StreamFailed) => self.backoff(true),

            (State::Serving { served }, Event::RequestServed) => {
                let served = served.saturating_add(1);
                if served >= self.max_requests {
                    (State::Closing { failed: false }, None)
                } else {
                    (State::Serving { served }, None)
                }
            }
            (State::Serving { .. }, Event::StreamFailed) => (State::Closing { failed: true }, None),

            (State::Closing { failed }, Event::StreamClosed) => self.backoff(failed),

            (State::Backoff, Event::DelayElapsed) => (State::Dialing, None),

            (state, _) => (state, None),
        }
    }
}
