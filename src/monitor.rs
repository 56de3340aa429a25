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

//! Server monitoring.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-monitoring.rst

use {
	crate::{
		apm::{Event, EventEmitter},
		common::{Result, Error, ServerAddress, ServerSelectionConfig},
		description::{ServerDescription, ServerType},
		pool::{ConnectionPool, Connection},
		wire::{HelloCodec, HelloReply}
	},
	std::{
		sync::{Arc, Mutex, Condvar},
		time::{Duration, Instant},
		thread::{self, JoinHandle},
		io::ErrorKind,
		fmt
	},
	arc_swap::ArcSwap
};

/// Called with every description the monitor publishes.
pub type DescriptionHook = Box<dyn Fn(&Arc<ServerDescription>) + Send + Sync>;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum HeartbeatErrorKind {
	Network,
	Timeout,
	Protocol
}

/// Why a heartbeat failed. Recorded in the server's description, never returned.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[error("{kind:?} error: {message}")]
pub struct HeartbeatError {
	pub kind:    HeartbeatErrorKind,
	pub message: String
}

impl HeartbeatError {
	pub fn network(message: impl Into<String>) -> Self {
		Self { kind: HeartbeatErrorKind::Network, message: message.into() }
	}

	pub fn timeout(message: impl Into<String>) -> Self {
		Self { kind: HeartbeatErrorKind::Timeout, message: message.into() }
	}

	pub fn protocol(message: impl Into<String>) -> Self {
		Self { kind: HeartbeatErrorKind::Protocol, message: message.into() }
	}
}

impl From<&Error> for HeartbeatError {
	fn from(e: &Error) -> Self {
		match e {
			Error::Handshake { source, .. } => Self::from(source.as_ref()),
			Error::Io(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Self::timeout(e.to_string()),
			Error::InvalidReply(_) | Error::Auth(_) | Error::Command { .. } => Self::protocol(e.to_string()),
			e => Self::network(e.to_string())
		}
	}
}

/// Exponentially weighted moving average of round trip times.
///
/// see https://github.com/mongodb/specifications/blob/master/source/server-selection/server-selection.rst#calculation-of-average-round-trip-times
#[derive(Debug, Default, Copy, Clone)]
pub struct RttMonitor {
	average: Option<Duration>
}

impl RttMonitor {
	const ALPHA: f64 = 0.2;

	pub fn new() -> Self {
		Self::default()
	}

	pub fn add_sample(&mut self, sample: Duration) -> Duration {
		let average = match self.average {
			None => sample,
			Some(average) => Duration::from_secs_f64(
				Self::ALPHA * sample.as_secs_f64() + (1.0 - Self::ALPHA) * average.as_secs_f64())
		};
		self.average = Some(average);
		average
	}

	pub fn average(&self) -> Option<Duration> {
		self.average
	}

	pub fn reset(&mut self) {
		self.average = None;
	}
}

/// Runs heartbeats against a single server on a dedicated thread and publishes the
/// resulting descriptions.
#[derive(Clone)]
pub struct ServerMonitor(Arc<MonitorInner>);

pub struct MonitorInner {
	address:     ServerAddress,
	pool:        ConnectionPool,
	codec:       Arc<dyn HelloCodec>,
	config:      ServerSelectionConfig,
	emitter:     EventEmitter,
	hook:        DescriptionHook,
	description: ArcSwap<ServerDescription>,
	state:       Mutex<MonitorState>,
	wake:        Condvar,
	pulse:       Condvar,
	thread:      Mutex<Option<JoinHandle<()>>>
}

#[derive(Debug, Default)]
struct MonitorState {
	/// Incremented with every published description.
	heartbeats:      u64,
	check_requested: bool,
	stopped:         bool
}

impl std::ops::Deref for ServerMonitor {
	type Target = MonitorInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl fmt::Debug for ServerMonitor {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("ServerMonitor")
			.field("address", &self.address)
			.field("description", &self.description.load_full())
			.finish()
	}
}

impl ServerMonitor {
	pub fn new(
		pool:    ConnectionPool,
		codec:   Arc<dyn HelloCodec>,
		config:  ServerSelectionConfig,
		emitter: EventEmitter,
		hook:    DescriptionHook
	) -> Self {
		let address = pool.address().clone();
		Self(Arc::new(MonitorInner {
			description: ArcSwap::from_pointee(ServerDescription::new(address.clone())),
			address,
			pool,
			codec,
			config,
			emitter,
			hook,
			state:       Mutex::new(MonitorState::default()),
			wake:        Condvar::new(),
			pulse:       Condvar::new(),
			thread:      Mutex::new(None)
		}))
	}

	pub fn address(&self) -> &ServerAddress {
		&self.address
	}

	pub fn pool(&self) -> &ConnectionPool {
		&self.pool
	}

	/// The latest published description.
	pub fn description(&self) -> Arc<ServerDescription> {
		self.description.load_full()
	}

	/// The number of heartbeats completed so far.
	pub fn heartbeats(&self) -> Result<u64> {
		Ok(self.state.lock()?.heartbeats)
	}

	/// Blocks until more than `count` heartbeats have completed or `timeout` elapsed,
	/// returns the number of heartbeats completed.
	pub fn wait_for_heartbeat(&self, count: u64, timeout: Duration) -> Result<u64> {
		let state = self.state.lock()?;
		let (state, _) = self.pulse.wait_timeout_while(state, timeout,
			|state| state.heartbeats <= count && !state.stopped)?;
		Ok(state.heartbeats)
	}

	/// Asks for a check before the regular interval elapses. Checks are never run more
	/// often than `min_heartbeat_frequency`.
	pub fn request_heartbeat(&self) {
		if let Ok(mut state) = self.state.lock() {
			state.check_requested = true;
			self.wake.notify_all();
		}
	}

	pub fn start(&self) -> Result<()> {
		let mut handle = self.thread.lock()?;
		if handle.is_some() { return Ok(()); }

		let self_ = self.clone();
		*handle = Some(thread::Builder::new()
			.name(format!("server-monitor-{}", self.address))
			.spawn(move || self_.run())?);
		Ok(())
	}

	/// Stops the monitor and waits for its thread to finish. A check that is in flight
	/// is bounded by the connect timeout.
	pub fn stop(&self) -> Result<()> {
		{
			let mut state = self.state.lock()?;
			state.stopped = true;
			self.wake.notify_all();
			self.pulse.notify_all();
		}

		if let Some(handle) = self.thread.lock()?.take() {
			if handle.thread().id() != thread::current().id() {
				handle.join().map_err(|_| Error::Sync)?;
			}
		}
		Ok(())
	}

	pub fn is_stopped(&self) -> Result<bool> {
		Ok(self.state.lock()?.stopped)
	}

	fn run(self) {
		if let Err(e) = self.run_inner() {
			tracing::error!(address = %self.address, error = %e, "server monitor died");
		}
	}

	fn run_inner(&self) -> Result<()> {
		let mut connection = None;
		let mut rtt = RttMonitor::new();
		let mut request_id = 0;

		while !self.is_stopped()? {
			let previous = self.description();
			let started = Instant::now();
			self.emitter.emit(Event::ServerHeartbeatStarted { address: &self.address });

			request_id += 1;
			let failed = match self.check(&mut connection, request_id) {
				Ok((reply, sample)) => {
					let average = rtt.add_sample(sample);
					self.emitter.emit(Event::ServerHeartbeatSucceeded {
						address:  &self.address,
						duration: started.elapsed(),
						reply:    &reply
					});

					if previous.error.is_some() {
						tracing::info!(address = %self.address, "server is reachable again");
					}
					self.publish(ServerDescription::from_reply(self.address.clone(), &reply, average))?;
					false
				}
				Err(e) => {
					rtt.reset();

					let failure = HeartbeatError::from(&e);
					self.emitter.emit(Event::ServerHeartbeatFailed {
						address:  &self.address,
						duration: started.elapsed(),
						failure:  &failure
					});

					self.publish(ServerDescription::from_error(self.address.clone(), failure))?;

					// repeated failures do not clear again
					if previous.error.is_none() {
						tracing::warn!(address = %self.address, error = %e, "heartbeat failed");
						self.pool.clear()?;
					} else {
						tracing::debug!(address = %self.address, error = %e, "heartbeat failed");
					}
					true
				}
			};

			self.pulse()?;

			let interval = if failed || previous.r#type == ServerType::Unknown {
				self.config.min_heartbeat_frequency
			} else {
				self.config.heartbeat_frequency
			};
			self.wait(started, interval)?;
		}
		Ok(())
	}

	/// Runs a single heartbeat, establishing the monitoring connection first if there is
	/// none. Returns the reply and the round trip time sample.
	fn check(&self, connection: &mut Option<Connection>, request_id: i32) -> Result<(HelloReply, Duration)> {
		let started = Instant::now();
		let mut conn = match connection.take() {
			Some(conn) => conn,
			None => {
				let mut conn = self.pool.establish_monitoring()?;
				conn.set_read_timeout(Some(self.pool.options().connect_timeout))?;
				conn
			}
		};

		conn.send(&self.codec.encode_hello(request_id)?)?;
		let reply = self.codec.decode_hello(request_id, &conn.receive()?)?;
		*connection = Some(conn);
		Ok((reply, started.elapsed()))
	}

	/// Publishes a description that was not learned from a heartbeat, e.g. an unknown
	/// server after an operation failed.
	pub(crate) fn invalidate(&self, description: ServerDescription) -> Result<()> {
		self.publish(description)
	}

	fn publish(&self, description: ServerDescription) -> Result<()> {
		let description = Arc::new(description);
		let previous = self.description.swap(description.clone());

		if !previous.sdam_eq(&description) {
			self.emitter.emit(Event::ServerDescriptionChanged {
				address:  &self.address,
				previous: &previous,
				new:      &description
			});
		}

		(self.hook)(&description);
		Ok(())
	}

	fn pulse(&self) -> Result<()> {
		let mut state = self.state.lock()?;
		state.heartbeats += 1;
		self.pulse.notify_all();
		Ok(())
	}

	/// Sleeps until `interval` has passed since `started`, or `min_heartbeat_frequency`
	/// if a check has been requested in the meantime.
	fn wait(&self, started: Instant, interval: Duration) -> Result<()> {
		let mut state = self.state.lock()?;
		loop {
			if state.stopped { return Ok(()); }

			let due = if state.check_requested {
				interval.min(self.config.min_heartbeat_frequency)
			} else {
				interval
			};

			let elapsed = started.elapsed();
			if elapsed >= due {
				state.check_requested = false;
				return Ok(());
			}

			state = self.wake.wait_timeout(state, due - elapsed)?.0;
		}
	}
}
