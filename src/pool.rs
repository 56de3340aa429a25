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

//! Connection pooling.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/connection-monitoring-and-pooling/connection-monitoring-and-pooling.rst

use {
	crate::{
		apm::{Event, EventEmitter, ConnectionClosedReason, ConnectionCheckOutFailedReason},
		cancel::CancellationToken,
		common::{Result, Error, ServerAddress, ConnectionPoolOptions},
		wire::{Transport, Connector, Authenticator}
	},
	std::{
		sync::{Arc, Weak, Mutex, Condvar, atomic::{AtomicU64, Ordering}},
		time::{Duration, Instant},
		collections::VecDeque,
		thread::{self, JoinHandle}
	}
};

/// Hands out connection ids. One generator is shared by all pools of a topology,
/// so ids are unique within it.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator(Arc<AtomicU64>);

impl IdGenerator {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn next_id(&self) -> u64 {
		self.0.fetch_add(1, Ordering::Relaxed) + 1
	}
}

/// A single established and authenticated connection.
#[derive(Debug)]
pub struct Connection {
	id:         u64,
	address:    ServerAddress,
	generation: u32,
	opened_at:  Instant,
	last_used:  Instant,
	broken:     bool,
	transport:  Box<dyn Transport>
}

impl Connection {
	fn new(id: u64, address: ServerAddress, generation: u32, transport: Box<dyn Transport>) -> Self {
		let now = Instant::now();
		Self { id, address, generation, opened_at: now, last_used: now, broken: false, transport }
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn address(&self) -> &ServerAddress {
		&self.address
	}

	/// The generation of the pool at the time this connection was created.
	pub fn generation(&self) -> u32 {
		self.generation
	}

	pub fn opened_at(&self) -> Instant {
		self.opened_at
	}

	pub fn last_used(&self) -> Instant {
		self.last_used
	}

	pub fn is_broken(&self) -> bool {
		self.broken
	}

	/// A connection that failed to send or receive is closed on check in.
	pub fn send(&mut self, message: &[u8]) -> Result<()> {
		let result = self.transport.send(message);
		self.broken |= result.is_err();
		result
	}

	pub fn receive(&mut self) -> Result<Vec<u8>> {
		let result = self.transport.receive();
		self.broken |= result.is_err();
		result
	}

	pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
		self.transport.set_read_timeout(timeout)
	}
}

/// A checked out connection, returns to its pool when dropped.
#[derive(Debug)]
pub struct PooledConnection {
	connection: Option<Connection>,
	pool:       ConnectionPool
}

impl PooledConnection {
	/// Closes the connection instead of returning it to the pool.
	pub fn mark_broken(&mut self) {
		if let Some(connection) = self.connection.as_mut() {
			connection.broken = true;
		}
	}

	pub fn pool(&self) -> &ConnectionPool {
		&self.pool
	}
}

impl std::ops::Deref for PooledConnection {
	type Target = Connection;

	fn deref(&self) -> &Self::Target {
		self.connection.as_ref().expect("connection has already been checked in")
	}
}

impl std::ops::DerefMut for PooledConnection {
	fn deref_mut(&mut self) -> &mut Self::Target {
		self.connection.as_mut().expect("connection has already been checked in")
	}
}

impl Drop for PooledConnection {
	fn drop(&mut self) {
		if let Some(connection) = self.connection.take() {
			self.pool.return_connection(connection);
		}
	}
}

/// A bounded pool of connections to a single server.
#[derive(Debug, Clone)]
pub struct ConnectionPool(Arc<PoolInner>);

pub struct PoolInner {
	address:       ServerAddress,
	options:       ConnectionPoolOptions,
	connector:     Arc<dyn Connector>,
	authenticator: Option<Arc<dyn Authenticator>>,
	emitter:       EventEmitter,
	ids:           IdGenerator,
	state:         Mutex<PoolState>,
	condvar:       Condvar,
	maintenance:   Arc<Maintenance>,
	worker:        Mutex<Option<JoinHandle<()>>>
}

impl std::fmt::Debug for PoolInner {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("ConnectionPool")
			.field("address", &self.address)
			.field("options", &self.options)
			.field("state", &self.state)
			.finish()
	}
}

#[derive(Debug, Default)]
struct PoolState {
	generation:  u32,
	/// Most recently used last.
	available:   Vec<Connection>,
	checked_out: usize,
	pending:     usize,
	wait_queue:  VecDeque<u64>,
	next_ticket: u64,
	closed:      bool
}

impl PoolState {
	fn total(&self) -> usize {
		self.available.len() + self.checked_out + self.pending
	}

	fn at_capacity(&self, options: &ConnectionPoolOptions) -> bool {
		options.max_pool_size != 0 && self.total() >= options.max_pool_size
	}

	/// Whether another connection may be established right now.
	fn may_open(&self, options: &ConnectionPoolOptions) -> bool {
		!self.at_capacity(options) && self.pending < options.max_connecting.max(1)
	}

	fn leave_queue(&mut self, ticket: u64) {
		self.wait_queue.retain(|t| *t != ticket);
	}
}

#[derive(Debug, Default)]
struct Maintenance {
	stopped: Mutex<bool>,
	condvar: Condvar
}

impl Maintenance {
	fn stop(&self) {
		if let Ok(mut stopped) = self.stopped.lock() {
			*stopped = true;
		}
		self.condvar.notify_all();
	}
}

impl Drop for PoolInner {
	fn drop(&mut self) {
		self.maintenance.stop();
	}
}

enum Slot {
	Available(Connection),
	Pending(u32)
}

impl std::ops::Deref for ConnectionPool {
	type Target = PoolInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl ConnectionPool {
	pub fn new(
		address:       ServerAddress,
		options:       ConnectionPoolOptions,
		connector:     Arc<dyn Connector>,
		authenticator: Option<Arc<dyn Authenticator>>,
		emitter:       EventEmitter,
		ids:           IdGenerator
	) -> Result<Self> {
		let self_ = Self::build(address, options, connector, authenticator, emitter, ids)?;
		self_.announce();
		Ok(self_)
	}

	/// Creates the pool and starts its maintenance thread without emitting
	/// `PoolCreated`, see `ConnectionPool::announce`.
	pub(crate) fn build(
		address:       ServerAddress,
		options:       ConnectionPoolOptions,
		connector:     Arc<dyn Connector>,
		authenticator: Option<Arc<dyn Authenticator>>,
		emitter:       EventEmitter,
		ids:           IdGenerator
	) -> Result<Self> {
		let self_ = Self(Arc::new(PoolInner {
			address,
			options,
			connector,
			authenticator,
			emitter,
			ids,
			state:       Mutex::new(PoolState::default()),
			condvar:     Condvar::new(),
			maintenance: Arc::new(Maintenance::default()),
			worker:      Mutex::new(None)
		}));

		let pool = Arc::downgrade(&self_.0);
		let maintenance = self_.maintenance.clone();
		let frequency = self_.options.maintenance_frequency;
		*self_.worker.lock()? = Some(thread::Builder::new()
			.name("pool-maintenance".to_string())
			.spawn(move || maintain(pool, maintenance, frequency))?);

		Ok(self_)
	}

	pub(crate) fn announce(&self) {
		self.emitter.emit(Event::PoolCreated {
			address: &self.address,
			options: &self.options
		});
	}

	pub fn address(&self) -> &ServerAddress {
		&self.address
	}

	pub fn options(&self) -> &ConnectionPoolOptions {
		&self.options
	}

	pub fn generation(&self) -> Result<u32> {
		Ok(self.state.lock()?.generation)
	}

	pub fn available_count(&self) -> Result<usize> {
		Ok(self.state.lock()?.available.len())
	}

	pub fn checked_out_count(&self) -> Result<usize> {
		Ok(self.state.lock()?.checked_out)
	}

	pub fn pending_count(&self) -> Result<usize> {
		Ok(self.state.lock()?.pending)
	}

	pub fn waiting_count(&self) -> Result<usize> {
		Ok(self.state.lock()?.wait_queue.len())
	}

	pub fn is_closed(&self) -> Result<bool> {
		Ok(self.state.lock()?.closed)
	}

	/// Checks out a connection, waiting at most `wait_queue_timeout`.
	pub fn check_out(&self) -> Result<PooledConnection> {
		self.acquire_connection(Instant::now() + self.options.wait_queue_timeout, &CancellationToken::new())
	}

	/// Checks out an available connection or creates a new one if the pool is not at
	/// its maximum size. Otherwise waits in line until a connection is checked in, the
	/// `deadline` passes, the pool gets closed or `cancel` is cancelled. Never succeeds
	/// after `deadline`, a connection opened too late is left in the pool.
	pub fn acquire_connection(&self, deadline: Instant, cancel: &CancellationToken) -> Result<PooledConnection> {
		let started = Instant::now();
		self.emitter.emit(Event::ConnectionCheckOutStarted { address: &self.address });

		let mut discarded = Vec::new();
		let slot = self.wait_for_slot(started, deadline, cancel, &mut discarded);
		self.close_connections(discarded);

		let connection = match slot.and_then(|slot| match slot {
			Slot::Available(connection) => Ok(connection),
			Slot::Pending(generation) => self.finish_check_out(self.open(generation), started, deadline)
		}) {
			Ok(connection) => connection,
			Err(e) => {
				self.emitter.emit(Event::ConnectionCheckOutFailed {
					address: &self.address,
					reason:  match &e {
						Error::PoolClosed { .. }       => ConnectionCheckOutFailedReason::PoolClosed,
						Error::WaitQueueTimeout { .. } => ConnectionCheckOutFailedReason::Timeout,
						Error::Cancelled               => ConnectionCheckOutFailedReason::Cancelled,
						_                              => ConnectionCheckOutFailedReason::Error
					}
				});
				return Err(e);
			}
		};

		self.emitter.emit(Event::ConnectionCheckedOut {
			address:       &self.address,
			connection_id: connection.id
		});

		Ok(PooledConnection { connection: Some(connection), pool: self.clone() })
	}

	/// Waits until this caller is first in line and either a connection is available
	/// or a new one may be opened, i.e. the pool is below its maximum size and fewer
	/// than `max_connecting` connections are being established.
	fn wait_for_slot(
		&self,
		started:   Instant,
		deadline:  Instant,
		cancel:    &CancellationToken,
		discarded: &mut Vec<(Connection, ConnectionClosedReason)>
	) -> Result<Slot> {
		let pool = Arc::downgrade(&self.0);
		let _waker = cancel.register(move || if let Some(pool) = pool.upgrade() {
			let _guard = pool.state.lock();
			pool.condvar.notify_all();
		});

		let mut state = self.state.lock()?;
		let ticket = state.next_ticket;
		state.next_ticket += 1;
		state.wait_queue.push_back(ticket);

		loop {
			if state.closed {
				state.leave_queue(ticket);
				return Err(Error::PoolClosed { address: self.address.clone() });
			}

			if cancel.is_cancelled() {
				state.leave_queue(ticket);
				self.condvar.notify_all();
				return Err(Error::Cancelled);
			}

			let now = Instant::now();
			if now >= deadline {
				state.leave_queue(ticket);
				self.condvar.notify_all();
				return Err(Error::WaitQueueTimeout {
					address: self.address.clone(),
					timeout: deadline.saturating_duration_since(started)
				});
			}

			if state.wait_queue.front() == Some(&ticket) {
				while let Some(connection) = state.available.pop() {
					match self.expiry(&connection, state.generation) {
						Some(reason) => discarded.push((connection, reason)),
						None => {
							state.checked_out += 1;
							state.wait_queue.pop_front();
							self.condvar.notify_all();
							return Ok(Slot::Available(connection));
						}
					}
				}

				if state.may_open(&self.options) {
					state.pending += 1;
					state.wait_queue.pop_front();
					self.condvar.notify_all();
					return Ok(Slot::Pending(state.generation));
				}
			}

			state = self.condvar.wait_timeout(state, deadline - now)?.0;
		}
	}

	/// Accounts for a connection opened on behalf of a caller.
	fn finish_check_out(&self, result: Result<Connection>, started: Instant, deadline: Instant) -> Result<Connection> {
		let mut state = self.state.lock()?;
		state.pending -= 1;
		self.condvar.notify_all();

		match result {
			Ok(connection) if state.closed => {
				drop(state);
				self.close_connection(connection, ConnectionClosedReason::PoolClosed);
				Err(Error::PoolClosed { address: self.address.clone() })
			}
			Ok(connection) if Instant::now() >= deadline => {
				match self.expiry(&connection, state.generation) {
					None => state.available.push(connection),
					Some(reason) => {
						drop(state);
						self.close_connection(connection, reason);
					}
				}
				Err(Error::WaitQueueTimeout {
					address: self.address.clone(),
					timeout: deadline.saturating_duration_since(started)
				})
			}
			Ok(connection) => {
				state.checked_out += 1;
				Ok(connection)
			}
			Err(e) => Err(e)
		}
	}

	/// Opens and authenticates a new connection, the caller must have reserved a
	/// pending slot.
	fn open(&self, generation: u32) -> Result<Connection> {
		let id = self.ids.next_id();
		let started = Instant::now();
		self.emitter.emit(Event::ConnectionCreated { address: &self.address, connection_id: id });

		match self.connect(id, generation) {
			Ok(connection) => {
				self.emitter.emit(Event::ConnectionReady {
					address:       &self.address,
					connection_id: id,
					duration:      started.elapsed()
				});
				Ok(connection)
			}
			Err(e) => {
				tracing::warn!(address = %self.address, error = %e, "failed to establish connection");
				self.emitter.emit(Event::ConnectionClosed {
					address:       &self.address,
					connection_id: id,
					reason:        ConnectionClosedReason::Error
				});
				Err(Error::Handshake { address: self.address.clone(), source: Box::new(e) })
			}
		}
	}

	fn connect(&self, id: u64, generation: u32) -> Result<Connection> {
		let transport = self.connector.connect(&self.address, self.options.connect_timeout)?;
		let mut connection = Connection::new(id, self.address.clone(), generation, transport);
		if let Some(authenticator) = &self.authenticator {
			authenticator.authenticate(&mut connection)?;
		}
		Ok(connection)
	}

	/// Opens a connection for a server monitor. It is neither authenticated nor
	/// counted against the size of the pool.
	pub(crate) fn establish_monitoring(&self) -> Result<Connection> {
		let generation = self.generation()?;
		let transport = self.connector.connect(&self.address, self.options.connect_timeout)?;
		Ok(Connection::new(self.ids.next_id(), self.address.clone(), generation, transport))
	}

	/// Returns a checked out connection to the pool.
	///
	/// # Panics
	/// If the connection has been checked out from another pool.
	pub fn check_in(&self, connection: PooledConnection) {
		assert!(Arc::ptr_eq(&connection.pool.0, &self.0),
			"connection checked into a pool for {} it was not checked out from", self.address);
		drop(connection);
	}

	fn return_connection(&self, mut connection: Connection) {
		connection.last_used = Instant::now();
		self.emitter.emit(Event::ConnectionCheckedIn {
			address:       &self.address,
			connection_id: connection.id
		});

		let mut state = match self.state.lock() {
			Ok(state) => state,
			Err(_) => return
		};

		state.checked_out -= 1;
		let reason = if state.closed {
			Some(ConnectionClosedReason::PoolClosed)
		} else if connection.broken {
			Some(ConnectionClosedReason::Error)
		} else {
			self.expiry(&connection, state.generation)
		};

		match reason {
			None => state.available.push(connection),
			Some(reason) => {
				drop(state);
				self.close_connection(connection, reason);
			}
		}
		self.condvar.notify_all();
	}

	/// Why a connection must not be reused, if at all.
	fn expiry(&self, connection: &Connection, generation: u32) -> Option<ConnectionClosedReason> {
		if connection.generation != generation {
			return Some(ConnectionClosedReason::Stale);
		}

		let now = Instant::now();
		if self.options.max_idle_time.map_or(false, |max| now - connection.last_used >= max) {
			Some(ConnectionClosedReason::Idle)
		} else if self.options.max_lifetime.map_or(false, |max| now - connection.opened_at >= max) {
			Some(ConnectionClosedReason::Stale)
		} else {
			None
		}
	}

	fn close_connection(&self, connection: Connection, reason: ConnectionClosedReason) {
		tracing::debug!(address = %self.address, connection_id = connection.id, ?reason, "closing connection");
		self.emitter.emit(Event::ConnectionClosed {
			address:       &self.address,
			connection_id: connection.id,
			reason
		});
	}

	fn close_connections(&self, connections: Vec<(Connection, ConnectionClosedReason)>) {
		for (connection, reason) in connections {
			self.close_connection(connection, reason);
		}
	}

	/// Invalidates all connections. Available connections are closed immediately,
	/// checked out ones when they are checked in.
	pub fn clear(&self) -> Result<()> {
		self.clear_if(|_| true).map(|_| ())
	}

	/// Clears the pool unless it has been cleared since `generation`. Returns whether
	/// it has been cleared.
	pub fn clear_generation(&self, generation: u32) -> Result<bool> {
		self.clear_if(|current| current == generation)
	}

	fn clear_if(&self, f: impl FnOnce(u32) -> bool) -> Result<bool> {
		let (generation, available) = {
			let mut state = self.state.lock()?;
			if state.closed || !f(state.generation) { return Ok(false); }
			state.generation += 1;
			(state.generation, std::mem::take(&mut state.available))
		};
		self.condvar.notify_all();

		tracing::info!(address = %self.address, generation, "connection pool cleared");
		self.emitter.emit(Event::PoolCleared { address: &self.address, generation });
		self.close_connections(available.into_iter()
			.map(|connection| (connection, ConnectionClosedReason::Stale))
			.collect());
		Ok(true)
	}

	/// Closes the pool, waiters fail with `Error::PoolClosed`.
	pub fn close(&self) -> Result<()> {
		let available = {
			let mut state = self.state.lock()?;
			if state.closed { return Ok(()); }
			state.closed = true;
			std::mem::take(&mut state.available)
		};
		self.condvar.notify_all();
		self.maintenance.stop();

		if let Some(worker) = self.worker.lock()?.take() {
			if worker.thread().id() != thread::current().id() {
				worker.join().map_err(|_| Error::Sync)?;
			}
		}

		self.close_connections(available.into_iter()
			.map(|connection| (connection, ConnectionClosedReason::PoolClosed))
			.collect());
		tracing::debug!(address = %self.address, "connection pool closed");
		self.emitter.emit(Event::PoolClosed { address: &self.address });
		Ok(())
	}

	/// Closes expired connections and opens new ones until the pool holds at least
	/// `min_pool_size` connections.
	pub fn perform_maintenance(&self) -> Result<()> {
		let expired = {
			let mut state = self.state.lock()?;
			if state.closed { return Ok(()); }
			let generation = state.generation;
			let (expired, available) = std::mem::take(&mut state.available).into_iter()
				.map(|connection| (self.expiry(&connection, generation), connection))
				.partition::<Vec<_>, _>(|(reason, _)| reason.is_some());
			state.available = available.into_iter().map(|(_, connection)| connection).collect();
			expired
		};

		self.close_connections(expired.into_iter()
			.filter_map(|(reason, connection)| reason.map(|reason| (connection, reason)))
			.collect());

		loop {
			let generation = {
				let mut state = self.state.lock()?;
				if state.closed || state.total() >= self.options.min_pool_size || !state.may_open(&self.options) {
					return Ok(());
				}
				state.pending += 1;
				state.generation
			};

			let result = self.open(generation);
			let mut state = self.state.lock()?;
			state.pending -= 1;
			self.condvar.notify_all();

			match result {
				Ok(connection) if state.closed || connection.generation != state.generation => {
					drop(state);
					self.close_connection(connection, ConnectionClosedReason::Stale);
				}
				Ok(connection) => state.available.push(connection),
				Err(e) => {
					tracing::debug!(address = %self.address, error = %e, "failed to populate connection pool");
					return Ok(());
				}
			}
		}
	}
}

fn maintain(pool: Weak<PoolInner>, maintenance: Arc<Maintenance>, frequency: Duration) {
	loop {
		let stopped = match maintenance.stopped.lock() {
			Ok(stopped) => stopped,
			Err(_) => return
		};

		match maintenance.condvar.wait_timeout_while(stopped, frequency, |stopped| !*stopped) {
			Ok((stopped, _)) if !*stopped => (),
			_ => return
		}

		let pool = match pool.upgrade() {
			Some(pool) => ConnectionPool(pool),
			None => return
		};

		if let Err(e) = pool.perform_maintenance() {
			tracing::error!(address = %pool.address, error = %e, "connection pool maintenance failed");
			return;
		}
	}
}
