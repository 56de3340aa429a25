// MIT License
//
// Copyright (c) 2019-2021 Tobias Pfeiffer
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use {
	crate::{
		common::{ServerAddress, ConnectionPoolOptions},
		description::{ServerDescription, ClusterDescription},
		monitor::HeartbeatError,
		wire::HelloReply
	},
	std::{sync::{Arc, RwLock, atomic::{AtomicBool, Ordering}}, time::Duration}
};

pub type EventListener = Arc<dyn Fn(&Event) + Send + Sync>;

/// see https://github.com/mongodb/specifications/blob/master/source/connection-monitoring-and-pooling/connection-monitoring-and-pooling.rst#events,
/// https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring-logging-and-monitoring.rst#events-api
#[derive(Debug)]
pub enum Event<'a> {
	PoolCreated {
		address: &'a ServerAddress,
		options: &'a ConnectionPoolOptions
	},
	PoolCleared {
		address:    &'a ServerAddress,
		generation: u32
	},
	PoolClosed {
		address: &'a ServerAddress
	},
	ConnectionCreated {
		address:       &'a ServerAddress,
		connection_id: u64
	},
	ConnectionReady {
		address:       &'a ServerAddress,
		connection_id: u64,
		duration:      Duration
	},
	ConnectionClosed {
		address:       &'a ServerAddress,
		connection_id: u64,
		reason:        ConnectionClosedReason
	},
	ConnectionCheckOutStarted {
		address: &'a ServerAddress
	},
	ConnectionCheckOutFailed {
		address: &'a ServerAddress,
		reason:  ConnectionCheckOutFailedReason
	},
	ConnectionCheckedOut {
		address:       &'a ServerAddress,
		connection_id: u64
	},
	ConnectionCheckedIn {
		address:       &'a ServerAddress,
		connection_id: u64
	},
	ServerOpening {
		address: &'a ServerAddress
	},
	ServerClosed {
		address: &'a ServerAddress
	},
	ServerHeartbeatStarted {
		address: &'a ServerAddress
	},
	ServerHeartbeatSucceeded {
		address:  &'a ServerAddress,
		duration: Duration,
		reply:    &'a HelloReply
	},
	ServerHeartbeatFailed {
		address:  &'a ServerAddress,
		duration: Duration,
		failure:  &'a HeartbeatError
	},
	ServerDescriptionChanged {
		address:  &'a ServerAddress,
		previous: &'a ServerDescription,
		new:      &'a ServerDescription
	},
	TopologyDescriptionChanged {
		previous: &'a ClusterDescription,
		new:      &'a ClusterDescription
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionCheckOutFailedReason {
	PoolClosed,
	Timeout,
	Error,
	Cancelled
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionClosedReason {
	Stale,
	Idle,
	Error,
	PoolClosed
}

/// Fans events out to the registered listeners, in registration order.
#[derive(Clone, Default)]
pub struct EventEmitter(Arc<EmitterInner>);

#[derive(Default)]
struct EmitterInner {
	listeners_set: AtomicBool,
	listeners:     RwLock<Vec<EventListener>>
}

impl EventEmitter {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add_listener(&self, listener: impl Fn(&Event) + Send + Sync + 'static) {
		if let Ok(mut listeners) = self.0.listeners.write() {
			listeners.push(Arc::new(listener));
			self.0.listeners_set.store(true, Ordering::SeqCst);
		}
	}

	pub fn emit(&self, event: Event) {
		tracing::trace!(?event, "event");
		if !self.0.listeners_set.load(Ordering::SeqCst) { return; }

		// a listener may register further listeners
		let listeners = match self.0.listeners.read() {
			Ok(listeners) => listeners.clone(),
			Err(_)        => return
		};

		for listener in listeners.iter() {
			listener(&event)
		}
	}
}

impl std::fmt::Debug for EventEmitter {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("EventEmitter")
			.field("listeners", &self.0.listeners.read().map(|l| l.len()).unwrap_or(0))
			.finish()
	}
}
