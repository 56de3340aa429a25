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

//! Server discovery and monitoring.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst

use {
	crate::{
		apm::{Event, EventEmitter},
		cancel::CancellationToken,
		common::{Result, Error, ClientOptions, ServerAddress, ReadPreference},
		description::{ClusterDescription, ServerDescription, TopologyVersion},
		monitor::{ServerMonitor, HeartbeatError},
		pool::{ConnectionPool, IdGenerator},
		selection::{self, ServerSelectionError},
		wire::{self, Connector, Authenticator, HelloCodec}
	},
	std::{
		sync::{Arc, Weak, Mutex, Condvar},
		collections::{HashMap, VecDeque},
		time::Instant,
		fmt
	},
	arc_swap::ArcSwap
};

/// A monitored server, its monitor and its connection pool.
#[derive(Debug, Clone)]
pub struct Server(Arc<ServerInner>);

#[derive(Debug)]
pub struct ServerInner {
	pool:    ConnectionPool,
	monitor: ServerMonitor
}

impl std::ops::Deref for Server {
	type Target = ServerInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl Server {
	pub fn address(&self) -> &ServerAddress {
		self.pool.address()
	}

	pub fn pool(&self) -> &ConnectionPool {
		&self.pool
	}

	pub fn monitor(&self) -> &ServerMonitor {
		&self.monitor
	}

	pub fn description(&self) -> Arc<ServerDescription> {
		self.monitor.description()
	}

	/// Handles an error of an operation that ran on a connection of this server.
	/// `generation` is the generation of that connection, `topology_version` the one
	/// the server reported along with the error.
	///
	/// Network errors and state change errors mark the server unknown and request an
	/// immediate heartbeat. The pool is cleared at most once per generation, on state
	/// change errors only if the server is shutting down or too old to keep its
	/// connections. Timeouts, other errors and errors on connections from before the
	/// last clear are ignored.
	///
	/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#error-handling
	pub fn handle_application_error(
		&self,
		error:            &Error,
		generation:       u32,
		topology_version: Option<TopologyVersion>
	) -> Result<()> {
		if generation < self.pool.generation()? {
			return Ok(());
		}

		let current = self.description();
		let clear = if error.is_network() {
			true
		} else if error.is_state_change() {
			if let (Some(new), Some(current)) = (&topology_version, &current.topology_version) {
				if new.process_id == current.process_id && new.counter <= current.counter {
					return Ok(());
				}
			}
			error.is_shutdown() || current.max_wire_version < wire::KEEP_POOL_ON_STEP_DOWN_WIRE_VERSION
		} else {
			return Ok(());
		};

		tracing::info!(address = %self.address(), error = %error, "marking server unknown after a failed operation");
		self.monitor.invalidate(ServerDescription {
			topology_version,
			..ServerDescription::from_error(self.address().clone(), HeartbeatError::from(error))
		})?;

		if clear {
			self.pool.clear_generation(generation)?;
		}
		self.monitor.request_heartbeat();
		Ok(())
	}

	fn close(&self) {
		if let Err(e) = self.monitor.stop() {
			tracing::error!(address = %self.address(), error = %e, "failed to stop server monitor");
		}
		if let Err(e) = self.pool.close() {
			tracing::error!(address = %self.address(), error = %e, "failed to close connection pool");
		}
	}
}

#[derive(Debug, Default)]
struct Servers {
	map:     HashMap<ServerAddress, Server>,
	started: bool,
	closed:  bool
}

impl Servers {
	/// `description` with the latest round trip times and timestamps of the monitored
	/// servers, the stored snapshot only takes them along with other changes.
	fn refresh(&self, description: &ClusterDescription) -> ClusterDescription {
		let mut fresh = description.clone();
		for (address, server) in fresh.servers.iter_mut() {
			if let Some(latest) = self.map.get(address).map(Server::description) {
				if !Arc::ptr_eq(&latest, server) && latest.sdam_eq(&**server) {
					*server = latest;
				}
			}
		}
		fresh
	}
}

/// Work that has to happen after the topology's locks are released, as it calls
/// event listeners, which may call back into the topology.
#[derive(Debug)]
enum Notice {
	Changed {
		previous: Arc<ClusterDescription>,
		new:      Arc<ClusterDescription>
	},
	/// Announces the server and starts its monitor.
	Opening(Server),
	Closed(Server)
}

#[derive(Debug, Default)]
struct Notices {
	queue:    VecDeque<Notice>,
	flushing: bool
}

#[derive(Debug, Default)]
struct Revision {
	revision: u64,
	closed:   bool
}

/// The client's view of a deployment. Owns one [`Server`] per known address and keeps
/// the [`ClusterDescription`] current as monitors report.
#[derive(Debug, Clone)]
pub struct Topology(Arc<TopologyInner>);

pub struct TopologyInner {
	options:       ClientOptions,
	connector:     Arc<dyn Connector>,
	authenticator: Option<Arc<dyn Authenticator>>,
	codec:         Arc<dyn HelloCodec>,
	emitter:       EventEmitter,
	ids:           IdGenerator,
	description:   ArcSwap<ClusterDescription>,
	/// Also serializes description updates.
	servers:       Mutex<Servers>,
	revision:      Mutex<Revision>,
	changed:       Condvar,
	notices:       Mutex<Notices>
}

impl std::ops::Deref for Topology {
	type Target = TopologyInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl fmt::Debug for TopologyInner {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("TopologyInner")
			.field("options", &self.options)
			.field("description", &self.description.load_full())
			.field("servers", &self.servers)
			.field("revision", &self.revision)
			.finish()
	}
}

impl Topology {
	/// Creates a topology for the seeds in `options`. Nothing is connected until
	/// [`Topology::start`] is called.
	pub fn new(
		options:       ClientOptions,
		connector:     Arc<dyn Connector>,
		codec:         Arc<dyn HelloCodec>,
		authenticator: Option<Arc<dyn Authenticator>>
	) -> Self {
		Self(Arc::new(TopologyInner {
			description: ArcSwap::from_pointee(ClusterDescription::new(&options)),
			options,
			connector,
			authenticator,
			codec,
			emitter:     EventEmitter::new(),
			ids:         IdGenerator::new(),
			servers:     Mutex::new(Servers::default()),
			revision:    Mutex::new(Revision::default()),
			changed:     Condvar::new(),
			notices:     Mutex::new(Notices::default())
		}))
	}

	pub fn options(&self) -> &ClientOptions {
		&self.options
	}

	/// Listeners receive pool, monitor and topology events. Add them before starting.
	pub fn add_event_listener(&self, listener: impl Fn(&Event) + Send + Sync + 'static) {
		self.emitter.add_listener(listener);
	}

	/// The current description, never blocks.
	pub fn description(&self) -> Arc<ClusterDescription> {
		self.description.load_full()
	}

	pub fn server(&self, address: &ServerAddress) -> Result<Option<Server>> {
		Ok(self.servers.lock()?.map.get(address).cloned())
	}

	/// Opens a pool and starts a monitor for every seed.
	pub fn start(&self) -> Result<()> {
		{
			let mut servers = self.servers.lock()?;
			if servers.started || servers.closed {
				return Ok(());
			}
			servers.started = true;

			let description = self.description();
			tracing::debug!(topology = %description, "starting topology");

			let mut notices = Vec::with_capacity(description.servers.len());
			for address in description.servers.keys() {
				let server = self.open_server(address)?;
				servers.map.insert(address.clone(), server.clone());
				notices.push(Notice::Opening(server));
			}
			self.enqueue(notices)?;
		}
		self.flush()
	}

	/// Stops all monitors, closes all pools and fails pending and future selections.
	pub fn stop(&self) -> Result<()> {
		let removed = {
			let mut servers = self.servers.lock()?;
			servers.closed = true;
			servers.map.drain().map(|(_, server)| server).collect::<Vec<_>>()
		};

		{
			let mut revision = self.revision.lock()?;
			revision.closed = true;
			self.changed.notify_all();
		}

		for server in &removed {
			server.close();
		}
		self.enqueue(removed.into_iter().map(Notice::Closed))?;
		self.flush()?;
		tracing::debug!("topology stopped");
		Ok(())
	}

	pub fn is_closed(&self) -> Result<bool> {
		Ok(self.revision.lock()?.closed)
	}

	/// Asks every monitor for an immediate check.
	pub fn request_heartbeats(&self) -> Result<()> {
		for server in self.servers.lock()?.map.values() {
			server.monitor.request_heartbeat();
		}
		Ok(())
	}

	/// Blocks until the description revision exceeds `revision`. Returns `false` if
	/// `deadline` passed first.
	pub fn wait_for_change(&self, revision: u64, deadline: Instant, cancel: &CancellationToken) -> Result<bool> {
		let topology = Arc::downgrade(&self.0);
		let _waker = cancel.register(move || if let Some(topology) = topology.upgrade() {
			let _guard = topology.revision.lock();
			topology.changed.notify_all();
		});

		let mut state = self.revision.lock()?;
		loop {
			if state.revision > revision {
				return Ok(true);
			} else if state.closed {
				return Err(ServerSelectionError::TopologyClosed.into());
			} else if cancel.is_cancelled() {
				return Err(Error::Cancelled);
			}

			let now = Instant::now();
			if now >= deadline {
				return Ok(false);
			}
			state = self.changed.wait_timeout(state, deadline - now)?.0;
		}
	}

	/// Selects a server using the configured server selection timeout.
	pub fn select_server(&self, read_preference: &ReadPreference) -> Result<ConnectionPool> {
		let deadline = Instant::now() + self.options.server_selection_config.server_selection_timeout;
		self.select_server_with(read_preference, deadline, &CancellationToken::new())
	}

	/// Selects a server suitable for `read_preference` and returns its pool. Waits for
	/// the description to change while nothing is suitable.
	pub fn select_server_with(
		&self,
		read_preference: &ReadPreference,
		deadline:        Instant,
		cancel:          &CancellationToken
	) -> Result<ConnectionPool> {
		let config = &self.options.server_selection_config;
		read_preference.validate(config.heartbeat_frequency)?;

		let started = Instant::now();
		loop {
			if self.is_closed()? {
				return Err(ServerSelectionError::TopologyClosed.into());
			}

			let description = self.description();
			if let Some(e) = &description.compatibility_error {
				return Err(ServerSelectionError::Compatibility(e.clone()).into());
			}

			let selected = {
				let servers = self.servers.lock()?;
				selection::select_servers(&servers.refresh(&description), read_preference, config)
					.iter()
					.find_map(|address| servers.map.get(address))
					.map(|server| server.pool.clone())
			};

			if let Some(pool) = selected {
				tracing::trace!(address = %pool.address(), "selected server");
				return Ok(pool);
			}

			if cancel.is_cancelled() {
				return Err(Error::Cancelled);
			} else if Instant::now() >= deadline {
				tracing::debug!(topology = %description, "server selection timed out");
				return Err(ServerSelectionError::Timeout {
					elapsed: started.elapsed(),
					description
				}.into());
			}

			self.request_heartbeats()?;
			self.wait_for_change(description.revision, deadline, cancel)?;
		}
	}

	/// Creates the pool and the monitor of a server, announcing and starting them is
	/// left to `Notice::Opening`.
	fn open_server(&self, address: &ServerAddress) -> Result<Server> {
		let pool = ConnectionPool::build(
			address.clone(),
			self.options.pool_options,
			self.connector.clone(),
			self.authenticator.clone(),
			self.emitter.clone(),
			self.ids.clone()
		)?;

		let topology = Arc::downgrade(&self.0);
		let monitor = ServerMonitor::new(
			pool.clone(),
			self.codec.clone(),
			self.options.server_selection_config,
			self.emitter.clone(),
			Box::new(move |description: &Arc<ServerDescription>| on_server_description(&topology, description))
		);

		Ok(Server(Arc::new(ServerInner { pool, monitor })))
	}

	fn enqueue(&self, notices: impl IntoIterator<Item = Notice>) -> Result<()> {
		self.notices.lock()?.queue.extend(notices);
		Ok(())
	}

	/// Delivers queued notices in order. Only one thread delivers at a time, notices
	/// queued while another thread is delivering are left to that thread.
	fn flush(&self) -> Result<()> {
		{
			let mut notices = self.notices.lock()?;
			if notices.flushing {
				return Ok(());
			}
			notices.flushing = true;
		}

		loop {
			let notice = {
				let mut notices = self.notices.lock()?;
				match notices.queue.pop_front() {
					Some(notice) => notice,
					None => {
						notices.flushing = false;
						return Ok(());
					}
				}
			};

			match notice {
				Notice::Changed { previous, new } => self.emitter.emit(Event::TopologyDescriptionChanged {
					previous: &previous,
					new:      &new
				}),
				// removed before it was announced
				Notice::Opening(server) if !matches!(server.monitor.is_stopped(), Ok(false)) => (),
				Notice::Opening(server) => {
					self.emitter.emit(Event::ServerOpening { address: server.address() });
					server.pool.announce();
					if let Err(e) = server.monitor.start() {
						tracing::error!(address = %server.address(), error = %e, "failed to start server monitor");
					}
				}
				Notice::Closed(server) => self.emitter.emit(Event::ServerClosed { address: server.address() })
			}
		}
	}

	/// Folds a new server description into the cluster description, then opens servers
	/// that were discovered and closes the ones that were removed. The snapshot is only
	/// replaced if something besides round trip times and timestamps changed.
	fn update(&self, description: &Arc<ServerDescription>) -> Result<()> {
		let removed = {
			let mut servers = self.servers.lock()?;
			if servers.closed {
				return Ok(());
			}

			let previous = self.description();
			let transition = match previous.apply(description.clone()) {
				Some(transition) => transition,
				None => {
					tracing::trace!(address = %description.address, "ignoring server description");
					return Ok(());
				}
			};

			if !transition.changed {
				return Ok(());
			}

			let next = Arc::new(transition.description);
			self.description.store(next.clone());
			{
				let mut revision = self.revision.lock()?;
				revision.revision = next.revision;
				self.changed.notify_all();
			}
			tracing::debug!(previous = %previous, new = %next, "topology description changed");

			let mut notices = vec![Notice::Changed { previous, new: next }];
			for address in &transition.added {
				match self.open_server(address) {
					Ok(server) => {
						servers.map.insert(address.clone(), server.clone());
						notices.push(Notice::Opening(server));
					}
					Err(e) => tracing::error!(address = %address, error = %e, "failed to open server"),
				}
			}

			for address in &transition.possible_primaries {
				if let Some(server) = servers.map.get(address) {
					server.monitor.request_heartbeat();
				}
			}

			for address in &transition.demoted {
				tracing::info!(address = %address, "stale primary demoted");
			}

			self.enqueue(notices)?;
			transition.removed.iter()
				.filter_map(|address| servers.map.remove(address))
				.collect::<Vec<_>>()
		};

		// a removed monitor may be blocked on the lock above, so it is joined after release
		for server in &removed {
			server.close();
		}
		self.enqueue(removed.into_iter().map(Notice::Closed))?;
		self.flush()
	}
}

fn on_server_description(topology: &Weak<TopologyInner>, description: &Arc<ServerDescription>) {
	if let Some(topology) = topology.upgrade() {
		if let Err(e) = Topology(topology).update(description) {
			tracing::error!(address = %description.address, error = %e, "failed to update topology");
		}
	}
}

impl Drop for TopologyInner {
	fn drop(&mut self) {
		let servers = match self.servers.get_mut() {
			Ok(servers) => std::mem::take(&mut servers.map),
			Err(_) => return
		};

		for server in servers.values() {
			server.close();
		}
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::{
			common::Error,
			description::{TopologyType, ServerType, tests::{addr, rs_reply}},
			mock::MockNetwork,
			wire::HelloReply
		},
		std::{thread, io, time::Duration, sync::atomic::{AtomicUsize, Ordering}}
	};

	fn topology(network: &MockNetwork, uri: &str) -> Topology {
		Topology::new(uri.parse().unwrap(), Arc::new(network.clone()), network.codec(),
			Some(Arc::new(network.clone())))
	}

	fn wait_until(topology: &Topology, f: impl Fn(&ClusterDescription) -> bool) -> Arc<ClusterDescription> {
		let deadline = Instant::now() + Duration::from_secs(5);
		loop {
			let description = topology.description();
			if f(&description) {
				return description;
			}
			assert!(Instant::now() < deadline, "timed out, topology: {}", description);
			thread::sleep(Duration::from_millis(5));
		}
	}

	fn replica_set(network: &MockNetwork) {
		network.set_reply("a", rs_reply("rs", true, &["a", "b", "c"]));
		network.set_reply("b", rs_reply("rs", false, &["a", "b", "c"]));
		network.set_reply("c", rs_reply("rs", false, &["a", "b", "c"]));
	}

	const RS_URI: &str = "mongodb://a/?replicaSet=rs&heartbeatFrequencyMS=500&minHeartbeatFrequencyMS=10&serverSelectionTimeoutMS=2000";

	#[test]
	fn discovers_replica_set() {
		let network = MockNetwork::new();
		replica_set(&network);
		let topology = topology(&network, RS_URI);
		topology.start().unwrap();

		let pool = topology.select_server(&ReadPreference::primary()).unwrap();
		assert_eq!(pool.address(), &addr("a"));

		let description = wait_until(&topology, |d| d.servers.values()
			.all(|server| server.r#type != ServerType::Unknown) && d.servers.len() == 3);
		assert_eq!(description.r#type, TopologyType::ReplicaSetWithPrimary);
		assert!(topology.server(&addr("c")).unwrap().is_some());

		let pool = topology.select_server(&ReadPreference::secondary()).unwrap();
		assert!(pool.address() == &addr("b") || pool.address() == &addr("c"));
		topology.stop().unwrap();
	}

	#[test]
	fn single_seed_discovers_replica_set() {
		let network = MockNetwork::new();
		replica_set(&network);
		let topology = topology(&network, "mongodb://a/?heartbeatFrequencyMS=500&minHeartbeatFrequencyMS=10");
		assert_eq!(topology.description().r#type, TopologyType::Unknown);
		topology.start().unwrap();

		let description = wait_until(&topology, |d| d.servers.len() == 3);
		assert_eq!(description.r#type, TopologyType::ReplicaSetWithPrimary);
		assert_eq!(description.set_name.as_deref(), Some("rs"));
		assert_eq!(topology.select_server(&ReadPreference::primary()).unwrap().address(), &addr("a"));
		topology.stop().unwrap();
	}

	#[test]
	fn direct_connection_stays_single() {
		let network = MockNetwork::new();
		replica_set(&network);
		let topology = topology(&network, "mongodb://b/?directConnection=true&heartbeatFrequencyMS=500");
		assert_eq!(topology.description().r#type, TopologyType::Single);
		topology.start().unwrap();

		let pool = topology.select_server(&ReadPreference::primary_preferred()).unwrap();
		assert_eq!(pool.address(), &addr("b"));
		let description = topology.description();
		assert_eq!(description.r#type, TopologyType::Single);
		assert_eq!(description.servers.len(), 1);
		topology.stop().unwrap();
	}

	#[test]
	fn listeners_may_call_back() {
		let network = MockNetwork::new();
		replica_set(&network);
		let topology = topology(&network, RS_URI);

		let weak = Arc::downgrade(&topology.0);
		let calls = Arc::new(AtomicUsize::new(0));
		let calls_ = calls.clone();
		topology.add_event_listener(move |event| if matches!(event,
			Event::TopologyDescriptionChanged { .. } | Event::ServerOpening { .. }) {
			if let Some(topology) = weak.upgrade().map(Topology) {
				topology.server(&addr("a")).unwrap();
				topology.request_heartbeats().unwrap();
				calls_.fetch_add(1, Ordering::SeqCst);
			}
		});

		topology.start().unwrap();
		let deadline = Instant::now() + Duration::from_secs(2);
		let pool = topology.select_server_with(&ReadPreference::primary(), deadline, &CancellationToken::new()).unwrap();
		assert_eq!(pool.address(), &addr("a"));
		wait_until(&topology, |d| d.servers.len() == 3);
		assert!(calls.load(Ordering::SeqCst) >= 2);
		topology.stop().unwrap();
	}

	#[test]
	fn application_errors_mark_server_unknown() {
		let network = MockNetwork::new();
		replica_set(&network);
		let topology = topology(&network, RS_URI);
		let invalidated = Arc::new(AtomicUsize::new(0));
		let invalidated_ = invalidated.clone();
		topology.add_event_listener(move |event| if let Event::ServerDescriptionChanged { new, .. } = event {
			if new.address == addr("a") && new.r#type == ServerType::Unknown && new.error.is_some() {
				invalidated_.fetch_add(1, Ordering::SeqCst);
			}
		});
		topology.start().unwrap();

		let pool = topology.select_server(&ReadPreference::primary()).unwrap();
		let server = topology.server(&addr("a")).unwrap().unwrap();
		let generation = pool.check_out().unwrap().generation();
		let has_primary = |d: &ClusterDescription| d.r#type == TopologyType::ReplicaSetWithPrimary;

		let timeout = Error::Io(io::Error::new(io::ErrorKind::TimedOut, "timed out"));
		server.handle_application_error(&timeout, generation, None).unwrap();
		assert_eq!(invalidated.load(Ordering::SeqCst), 0);
		assert_eq!(pool.generation().unwrap(), 0);

		// a network error clears once per generation
		let reset = Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"));
		server.handle_application_error(&reset, generation, None).unwrap();
		assert_eq!(invalidated.load(Ordering::SeqCst), 1);
		assert_eq!(pool.generation().unwrap(), 1);
		server.handle_application_error(&reset, generation, None).unwrap();
		assert_eq!(invalidated.load(Ordering::SeqCst), 1);
		assert_eq!(pool.generation().unwrap(), 1);

		// the requested heartbeat finds the primary again
		wait_until(&topology, has_primary);

		// a step down keeps the pool of a recent server, a shutdown does not
		let not_primary = Error::Command { code: 10107, message: "not primary".to_string() };
		server.handle_application_error(&not_primary, 1, None).unwrap();
		assert_eq!(invalidated.load(Ordering::SeqCst), 2);
		assert_eq!(pool.generation().unwrap(), 1);
		wait_until(&topology, has_primary);

		let shutdown = Error::Command { code: 91, message: "shutdown in progress".to_string() };
		server.handle_application_error(&shutdown, 1, None).unwrap();
		assert_eq!(invalidated.load(Ordering::SeqCst), 3);
		assert_eq!(pool.generation().unwrap(), 2);
		wait_until(&topology, has_primary);
		topology.stop().unwrap();
	}

	#[test]
	fn emits_topology_events() {
		let network = MockNetwork::new();
		replica_set(&network);
		let topology = topology(&network, RS_URI);

		let log = Arc::new(Mutex::new(Vec::new()));
		let log_ = log.clone();
		topology.add_event_listener(move |event| {
			let entry = match event {
				Event::ServerOpening { address } => format!("opening {}", address),
				Event::TopologyDescriptionChanged { .. } => "changed".to_string(),
				_ => return
			};
			log_.lock().unwrap().push(entry);
		});

		topology.start().unwrap();
		topology.select_server(&ReadPreference::primary()).unwrap();
		wait_until(&topology, |d| d.servers.len() == 3);
		topology.stop().unwrap();

		let log = log.lock().unwrap();
		assert_eq!(log.first().map(String::as_str), Some("opening a:27017"));
		assert!(log.contains(&"opening b:27017".to_string()));
		assert!(log.contains(&"changed".to_string()));
	}

	#[test]
	fn unchanged_heartbeat_keeps_revision() {
		let network = MockNetwork::new();
		network.set_reply("a", HelloReply { max_wire_version: 13, ..HelloReply::default() });
		let topology = topology(&network, "mongodb://a/?heartbeatFrequencyMS=500&minHeartbeatFrequencyMS=10");
		topology.start().unwrap();

		let description = wait_until(&topology, |d| d.r#type == TopologyType::Single
			&& d.servers.values().all(|server| server.r#type == ServerType::Standalone));
		let monitor = topology.server(&addr("a")).unwrap().unwrap().monitor().clone();

		let count = monitor.heartbeats().unwrap();
		monitor.request_heartbeat();
		assert!(monitor.wait_for_heartbeat(count, Duration::from_secs(5)).unwrap() > count);

		assert_eq!(topology.description().revision, description.revision);
		assert!(Arc::ptr_eq(&topology.description(), &description));
		assert!(!topology.wait_for_change(description.revision, Instant::now() + Duration::from_millis(50),
			&CancellationToken::new()).unwrap());
		topology.stop().unwrap();
	}

	#[test]
	fn selection_times_out_with_description() {
		let network = MockNetwork::new();
		network.set_down("a", true);
		let topology = topology(&network, RS_URI);
		topology.start().unwrap();

		let deadline = Instant::now() + Duration::from_millis(200);
		match topology.select_server_with(&ReadPreference::primary(), deadline, &CancellationToken::new()) {
			Err(Error::ServerSelection(ServerSelectionError::Timeout { description, .. })) => {
				assert!(description.servers.contains_key(&addr("a")));
			}
			other => panic!("unexpected result: {:?}", other)
		}
		topology.stop().unwrap();
	}

	#[test]
	fn selection_waits_for_recovery() {
		let network = MockNetwork::new();
		replica_set(&network);
		network.set_down("a", true);
		let topology = topology(&network, RS_URI);
		topology.start().unwrap();

		let network_ = network.clone();
		let handle = thread::spawn(move || {
			thread::sleep(Duration::from_millis(100));
			network_.set_down("a", false);
		});

		let pool = topology.select_server(&ReadPreference::primary()).unwrap();
		assert_eq!(pool.address(), &addr("a"));
		handle.join().unwrap();
		topology.stop().unwrap();
	}

	#[test]
	fn selection_cancelled() {
		let network = MockNetwork::new();
		network.set_down("a", true);
		let topology = topology(&network, RS_URI);
		topology.start().unwrap();

		let cancel = CancellationToken::new();
		let cancel_ = cancel.clone();
		let handle = thread::spawn(move || {
			thread::sleep(Duration::from_millis(50));
			cancel_.cancel();
		});

		let started = Instant::now();
		let result = topology.select_server_with(&ReadPreference::primary(),
			Instant::now() + Duration::from_secs(10), &cancel);
		assert!(matches!(result, Err(Error::Cancelled)));
		assert!(started.elapsed() < Duration::from_secs(5));
		handle.join().unwrap();
		topology.stop().unwrap();
	}

	#[test]
	fn incompatible_server_fails_fast() {
		let network = MockNetwork::new();
		network.set_reply("a", HelloReply { max_wire_version: 2, ..HelloReply::default() });
		let topology = topology(&network, "mongodb://a/?serverSelectionTimeoutMS=10000");
		topology.start().unwrap();

		wait_until(&topology, |d| d.compatibility_error.is_some());
		let started = Instant::now();
		let result = topology.select_server(&ReadPreference::primary());
		assert!(matches!(result, Err(Error::ServerSelection(ServerSelectionError::Compatibility(_)))));
		assert!(started.elapsed() < Duration::from_secs(1));
		topology.stop().unwrap();
	}

	#[test]
	fn invalid_read_preference() {
		let network = MockNetwork::new();
		let topology = topology(&network, RS_URI);
		let read_preference = ReadPreference::primary().with_max_staleness(Duration::from_secs(120));
		assert!(matches!(topology.select_server(&read_preference),
			Err(Error::ServerSelection(ServerSelectionError::InvalidReadPreference(_)))));
	}

	#[test]
	fn removed_server_is_closed() {
		let network = MockNetwork::new();
		replica_set(&network);
		let topology = topology(&network, RS_URI);
		topology.start().unwrap();
		wait_until(&topology, |d| d.servers.len() == 3);
		let c = topology.server(&addr("c")).unwrap().unwrap();

		// members only add hosts, the primary removes them
		network.set_reply("b", rs_reply("rs", false, &["a", "b"]));
		network.set_reply("c", rs_reply("rs", false, &["a", "b"]));
		network.set_reply("a", rs_reply("rs", true, &["a", "b"]));
		topology.request_heartbeats().unwrap();
		wait_until(&topology, |d| d.servers.len() == 2);

		assert!(topology.server(&addr("c")).unwrap().is_none());
		let deadline = Instant::now() + Duration::from_secs(5);
		while !c.pool().is_closed().unwrap() {
			assert!(Instant::now() < deadline);
			thread::sleep(Duration::from_millis(5));
		}
		assert!(c.monitor().is_stopped().unwrap());
		topology.stop().unwrap();
	}

	#[test]
	fn stop_fails_selection() {
		let network = MockNetwork::new();
		network.set_down("a", true);
		let topology = topology(&network, RS_URI);
		topology.start().unwrap();

		let topology_ = topology.clone();
		let handle = thread::spawn(move || topology_.select_server(&ReadPreference::primary()));
		thread::sleep(Duration::from_millis(50));
		topology.stop().unwrap();

		assert!(matches!(handle.join().unwrap(),
			Err(Error::ServerSelection(ServerSelectionError::TopologyClosed))));
		assert!(topology.server(&addr("a")).unwrap().is_none());
	}
}
