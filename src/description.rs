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

//! Immutable server and cluster descriptions, and the transition function that
//! folds one new server description into a cluster description.

use {
	crate::{
		common::{ClientOptions, ServerAddress, TagSet},
		monitor::HeartbeatError,
		oid::ObjectId,
		wire::{self, HelloReply}
	},
	std::{sync::Arc, time::{Duration, SystemTime, UNIX_EPOCH}, collections::BTreeMap, fmt},
	serde::{Serialize, Deserialize}
};

/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#topologyversion
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyVersion {
	pub process_id: ObjectId,
	pub counter:    i64
}

impl TopologyVersion {
	/// A restarted server has a new process id, its counter starts over.
	pub fn is_older_than(&self, other: &Self) -> bool {
		self.process_id == other.process_id && self.counter < other.counter
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ServerType {
	Standalone,
	Mongos,
	PossiblePrimary,
	RSPrimary,
	RSSecondary,
	RSArbiter,
	RSOther,
	RSGhost,
	Unknown
}

impl Default for ServerType {
	fn default() -> Self {
		Self::Unknown
	}
}

impl ServerType {
	pub fn from_reply(reply: &HelloReply) -> Self {
		match reply {
			HelloReply { msg: Some(msg), .. } if msg == "isdbgrid"              => Self::Mongos,
			HelloReply { set_name: Some(_), hidden: true, ..  }               => Self::RSOther,
			HelloReply { set_name: Some(_), is_writable_primary: true, .. }   => Self::RSPrimary,
			HelloReply { set_name: Some(_), secondary: true, .. }             => Self::RSSecondary,
			HelloReply { set_name: Some(_), arbiter_only: true, .. }          => Self::RSArbiter,
			HelloReply { set_name: Some(_), .. }                              => Self::RSOther,
			HelloReply { is_replica_set: true, .. }                           => Self::RSGhost,
			_                                                                 => Self::Standalone
		}
	}

	pub fn is_data_bearing(self) -> bool {
		matches!(self, Self::Standalone | Self::Mongos | Self::RSPrimary | Self::RSSecondary)
	}
}

/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#serverdescription
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerDescription {
	pub address:                         ServerAddress,
	pub r#type:                          ServerType,
	/// Smoothed round trip time, `None` until the first successful heartbeat.
	pub rtt:                             Option<Duration>,
	pub last_update_time:                Option<SystemTime>,
	// fields from the hello reply
	pub last_write_date:                 Option<SystemTime>,
	pub min_wire_version:                i32,
	pub max_wire_version:                i32,
	pub me:                              Option<ServerAddress>,
	pub hosts:                           Vec<ServerAddress>,
	pub passives:                        Vec<ServerAddress>,
	pub arbiters:                        Vec<ServerAddress>,
	pub tags:                            TagSet,
	pub set_name:                        Option<String>,
	pub set_version:                     Option<i32>,
	pub election_id:                     Option<ObjectId>,
	pub primary:                         Option<ServerAddress>,
	pub topology_version:                Option<TopologyVersion>,
	pub logical_session_timeout_minutes: Option<i64>,
	pub error:                           Option<HeartbeatError>
}

impl ServerDescription {
	/// The description of a server that has not been checked yet.
	pub fn new(address: ServerAddress) -> Self {
		Self { address, ..Self::default() }
	}

	pub fn from_reply(address: ServerAddress, reply: &HelloReply, rtt: Duration) -> Self {
		Self {
			r#type:                          ServerType::from_reply(reply),
			rtt:                             Some(rtt),
			last_update_time:                Some(SystemTime::now()),
			last_write_date:                 reply.last_write.map(|v|
				UNIX_EPOCH + Duration::from_millis(v.last_write_date.max(0) as _)),
			min_wire_version:                reply.min_wire_version,
			max_wire_version:                reply.max_wire_version,
			me:                              reply.me.clone(),
			hosts:                           reply.hosts.clone(),
			passives:                        reply.passives.clone(),
			arbiters:                        reply.arbiters.clone(),
			tags:                            reply.tags.clone(),
			set_name:                        reply.set_name.clone(),
			set_version:                     reply.set_version,
			election_id:                     reply.election_id,
			primary:                         reply.primary.clone(),
			topology_version:                reply.topology_version,
			logical_session_timeout_minutes: reply.logical_session_timeout_minutes,
			error:                           None,
			address
		}
	}

	pub fn from_error(address: ServerAddress, error: HeartbeatError) -> Self {
		Self {
			last_update_time: Some(SystemTime::now()),
			error:            Some(error),
			..Self::new(address)
		}
	}

	/// Equality as far as discovery is concerned, i.e. ignoring the round trip time and
	/// the timestamps that change with every heartbeat.
	///
	/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#server-description-equality
	pub fn sdam_eq(&self, other: &Self) -> bool {
		self.address == other.address
			&& self.r#type == other.r#type
			&& self.min_wire_version == other.min_wire_version
			&& self.max_wire_version == other.max_wire_version
			&& self.me == other.me
			&& self.hosts == other.hosts
			&& self.passives == other.passives
			&& self.arbiters == other.arbiters
			&& self.tags == other.tags
			&& self.set_name == other.set_name
			&& self.set_version == other.set_version
			&& self.election_id == other.election_id
			&& self.primary == other.primary
			&& self.topology_version == other.topology_version
			&& self.logical_session_timeout_minutes == other.logical_session_timeout_minutes
			&& self.error == other.error
	}

	/// All members this server reports, including itself.
	pub fn members(&self) -> impl Iterator<Item = &ServerAddress> {
		self.hosts.iter().chain(&self.passives).chain(&self.arbiters)
	}

	fn compatibility_error(&self) -> Option<CompatibilityError> {
		if self.r#type == ServerType::Unknown {
			None
		} else if self.min_wire_version > wire::MAX_WIRE_VERSION {
			Some(CompatibilityError::WireVersionTooNew {
				address:          self.address.clone(),
				min_wire_version: self.min_wire_version
			})
		} else if self.max_wire_version < wire::MIN_WIRE_VERSION {
			Some(CompatibilityError::WireVersionTooOld {
				address:          self.address.clone(),
				max_wire_version: self.max_wire_version
			})
		} else {
			None
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TopologyType {
	Single,
	ReplicaSetNoPrimary,
	ReplicaSetWithPrimary,
	Sharded,
	Unknown
}

impl Default for TopologyType {
	fn default() -> Self {
		Self::Unknown
	}
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum CompatibilityError {
	#[error("server at {address} requires wire version {min_wire_version}, but this driver only supports up to {}", wire::MAX_WIRE_VERSION)]
	WireVersionTooNew {
		address:          ServerAddress,
		min_wire_version: i32
	},
	#[error("server at {address} reports max wire version {max_wire_version}, but this driver requires at least {}", wire::MIN_WIRE_VERSION)]
	WireVersionTooOld {
		address:          ServerAddress,
		max_wire_version: i32
	}
}

/// An immutable snapshot of the whole deployment.
///
/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#topologydescription
#[derive(Debug, Clone, Default)]
pub struct ClusterDescription {
	pub r#type:                          TopologyType,
	pub set_name:                        Option<String>,
	pub max_set_version:                 Option<i32>,
	pub max_election_id:                 Option<ObjectId>,
	pub servers:                         BTreeMap<ServerAddress, Arc<ServerDescription>>,
	pub compatibility_error:             Option<CompatibilityError>,
	pub logical_session_timeout_minutes: Option<i64>,
	/// Incremented whenever the description changes in a way that matters for discovery.
	pub revision:                        u64
}

/// The result of folding a server description into a cluster description.
#[derive(Debug)]
pub struct Transition {
	pub description:        ClusterDescription,
	/// Whether anything besides round trip times and timestamps changed.
	pub changed:            bool,
	/// Servers that need a monitor and a pool.
	pub added:              Vec<ServerAddress>,
	/// Servers whose monitor and pool have to be shut down.
	pub removed:            Vec<ServerAddress>,
	/// Primaries that were demoted because a newer one exists.
	pub demoted:            Vec<ServerAddress>,
	/// Servers named as primary by a member while their own state is unknown.
	pub possible_primaries: Vec<ServerAddress>
}

impl ClusterDescription {
	pub fn new(options: &ClientOptions) -> Self {
		Self {
			r#type:   if options.is_single() {
				TopologyType::Single
			} else if options.replica_set.is_some() {
				TopologyType::ReplicaSetNoPrimary
			} else {
				TopologyType::Unknown
			},
			set_name: options.replica_set.clone(),
			servers:  options.hosts.iter()
				.map(|address| (address.clone(), Arc::new(ServerDescription::new(address.clone()))))
				.collect(),
			..Self::default()
		}
	}

	pub fn server(&self, address: &ServerAddress) -> Option<&Arc<ServerDescription>> {
		self.servers.get(address)
	}

	pub fn primary(&self) -> Option<&Arc<ServerDescription>> {
		self.servers.values().find(|server| server.r#type == ServerType::RSPrimary)
	}

	/// Equality as far as discovery is concerned, see `ServerDescription::sdam_eq`.
	pub fn sdam_eq(&self, other: &Self) -> bool {
		self.r#type == other.r#type
			&& self.set_name == other.set_name
			&& self.max_set_version == other.max_set_version
			&& self.max_election_id == other.max_election_id
			&& self.compatibility_error == other.compatibility_error
			&& self.logical_session_timeout_minutes == other.logical_session_timeout_minutes
			&& self.servers.len() == other.servers.len()
			&& self.servers.iter().zip(&other.servers)
				.all(|((a0, s0), (a1, s1))| a0 == a1 && s0.sdam_eq(s1))
	}

	/// Applies a new description of one of the servers of this cluster. Returns `None` if
	/// the server is not part of the cluster anymore or if the description is older than
	/// the one already recorded.
	///
	/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#updating-the-topologydescription
	pub fn apply(&self, description: impl Into<Arc<ServerDescription>>) -> Option<Transition> {
		let description = description.into();
		let current = self.servers.get(&description.address)?;
		if let (Some(new), Some(old)) = (&description.topology_version, &current.topology_version) {
			if new.is_older_than(old) {
				return None;
			}
		}

		let mut update = Update {
			next:               self.clone(),
			added:              Vec::new(),
			removed:            Vec::new(),
			demoted:            Vec::new(),
			possible_primaries: Vec::new()
		};

		update.next.servers.insert(description.address.clone(), description.clone());
		update.apply(&description);
		update.finish();

		let Update { mut next, added, removed, demoted, possible_primaries } = update;
		let changed = !next.sdam_eq(self);
		next.revision = if changed { self.revision + 1 } else { self.revision };
		Some(Transition { description: next, changed, added, removed, demoted, possible_primaries })
	}
}

impl fmt::Display for ClusterDescription {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{{ type: {:?}", self.r#type)?;
		if let Some(set_name) = &self.set_name {
			write!(f, ", set name: {}", set_name)?;
		}
		if let Some(err) = &self.compatibility_error {
			write!(f, ", compatibility error: {}", err)?;
		}
		f.write_str(", servers: [")?;
		for (i, server) in self.servers.values().enumerate() {
			if i > 0 { f.write_str(", ")?; }
			write!(f, "{}: {:?}", server.address, server.r#type)?;
			if let Some(rtt) = server.rtt {
				write!(f, " ({:?})", rtt)?;
			}
			if let Some(err) = &server.error {
				write!(f, " ({})", err)?;
			}
		}
		f.write_str("] }")
	}
}

struct Update {
	next:               ClusterDescription,
	added:              Vec<ServerAddress>,
	removed:            Vec<ServerAddress>,
	demoted:            Vec<ServerAddress>,
	possible_primaries: Vec<ServerAddress>
}

impl Update {
	fn apply(&mut self, description: &ServerDescription) {
		match (self.next.r#type, description.r#type) {
			// no-op
			(TopologyType::Single, _)
			| (_, ServerType::PossiblePrimary)
			| (TopologyType::Unknown, ServerType::Unknown)
			| (TopologyType::Unknown, ServerType::RSGhost)
			| (TopologyType::Sharded, ServerType::Unknown)
			| (TopologyType::Sharded, ServerType::Mongos)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::Unknown)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::RSGhost) => (),
			// remove
			(TopologyType::Sharded, _)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::Standalone)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::Mongos) => self.remove(&description.address),
			(TopologyType::ReplicaSetWithPrimary, ServerType::Standalone)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::Mongos) => {
				self.remove(&description.address);
				self.check_if_has_primary();
			}
			// a lone seed that turns out to be a standalone is used directly
			(TopologyType::Unknown, ServerType::Standalone) => if self.next.servers.len() == 1 {
				self.next.r#type = TopologyType::Single;
			} else {
				self.remove(&description.address);
			},
			(TopologyType::Unknown, ServerType::Mongos) => self.next.r#type = TopologyType::Sharded,
			(TopologyType::Unknown, ServerType::RSPrimary)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::RSPrimary)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::RSPrimary) => self.update_rs_from_primary(description),
			(TopologyType::Unknown, ServerType::RSSecondary)
			| (TopologyType::Unknown, ServerType::RSArbiter)
			| (TopologyType::Unknown, ServerType::RSOther)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::RSSecondary)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::RSArbiter)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::RSOther) => self.update_rs_without_primary(description),
			(TopologyType::ReplicaSetWithPrimary, ServerType::RSSecondary)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::RSArbiter)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::RSOther) => self.update_rs_with_primary_from_member(description),
			(TopologyType::ReplicaSetWithPrimary, ServerType::Unknown)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::RSGhost) => self.check_if_has_primary()
		}
	}

	fn update_rs_from_primary(&mut self, description: &ServerDescription) {
		self.next.r#type = TopologyType::ReplicaSetWithPrimary;

		if self.next.set_name.is_none() {
			self.next.set_name = description.set_name.clone();
		} else if self.next.set_name != description.set_name {
			self.remove(&description.address);
			self.check_if_has_primary();
			return;
		}

		// stale primary, a newer election has already been observed

		if let (Some(set_version), Some(election_id)) = (description.set_version, description.election_id) {
			if let (Some(max_set_version), Some(max_election_id)) = (self.next.max_set_version, self.next.max_election_id) {
				if max_set_version > set_version || (max_set_version == set_version && max_election_id > election_id) {
					tracing::info!(address = %description.address, %election_id, %max_election_id, "ignoring stale primary");
					self.demote(&description.address);
					self.check_if_has_primary();
					return;
				}
			}
			self.next.max_election_id = Some(election_id);
		}

		match (description.set_version, self.next.max_set_version) {
			(Some(version), Some(max)) if version > max => self.next.max_set_version = Some(version),
			(Some(version), None) => self.next.max_set_version = Some(version),
			_ => ()
		}

		// invalidate old primaries

		let old_primaries = self.next.servers.values()
			.filter(|server| server.r#type == ServerType::RSPrimary && server.address != description.address)
			.map(|server| server.address.clone())
			.collect::<Vec<_>>();

		for address in old_primaries {
			tracing::info!(%address, primary = %description.address, "demoting old primary");
			self.demote(&address);
		}

		// the primary's member list is authoritative

		let stale = self.next.servers.keys()
			.filter(|address| *address != &description.address
				&& !description.members().any(|member| member == *address))
			.cloned()
			.collect::<Vec<_>>();

		for address in stale {
			self.remove(&address);
		}

		self.add_members(description);
		self.check_if_has_primary();
	}

	fn update_rs_without_primary(&mut self, description: &ServerDescription) {
		self.next.r#type = TopologyType::ReplicaSetNoPrimary;

		if self.next.set_name.is_none() {
			self.next.set_name = description.set_name.clone();
		} else if self.next.set_name != description.set_name {
			self.remove(&description.address);
			return;
		}

		self.add_members(description);
		self.mark_possible_primary(description);

		if description.me.as_ref().map_or(false, |me| me != &description.address) {
			self.remove(&description.address);
		}
	}

	fn update_rs_with_primary_from_member(&mut self, description: &ServerDescription) {
		if self.next.set_name != description.set_name
			|| description.me.as_ref().map_or(false, |me| me != &description.address) {
			self.remove(&description.address);
			self.check_if_has_primary();
			return;
		}

		// members only ever add candidates
		self.add_members(description);
		self.check_if_has_primary();
		self.mark_possible_primary(description);
	}

	fn mark_possible_primary(&mut self, description: &ServerDescription) {
		let address = match description.primary.as_ref() {
			Some(address) => address,
			None => return
		};

		if let Some(server) = self.next.servers.get_mut(address) {
			if server.r#type == ServerType::Unknown {
				let mut possible_primary = ServerDescription::clone(server);
				possible_primary.r#type = ServerType::PossiblePrimary;
				*server = Arc::new(possible_primary);
				self.possible_primaries.push(address.clone());
			}
		}
	}

	fn check_if_has_primary(&mut self) {
		self.next.r#type = if self.next.primary().is_some() {
			TopologyType::ReplicaSetWithPrimary
		} else {
			TopologyType::ReplicaSetNoPrimary
		};
	}

	fn add_members(&mut self, description: &ServerDescription) {
		for address in description.members() {
			if !self.next.servers.contains_key(address) {
				self.next.servers.insert(address.clone(), Arc::new(ServerDescription::new(address.clone())));
				self.removed.retain(|removed| removed != address);
				self.added.push(address.clone());
			}
		}
	}

	fn remove(&mut self, address: &ServerAddress) {
		if self.next.servers.remove(address).is_some() {
			let len = self.added.len();
			self.added.retain(|added| added != address);
			if self.added.len() == len {
				self.removed.push(address.clone());
			}
		}
	}

	fn demote(&mut self, address: &ServerAddress) {
		self.next.servers.insert(address.clone(), Arc::new(ServerDescription::new(address.clone())));
		self.demoted.push(address.clone());
	}

	fn finish(&mut self) {
		self.next.compatibility_error = self.next.servers.values()
			.find_map(|server| server.compatibility_error());

		let data_bearing = self.next.servers.values()
			.filter(|server| server.r#type.is_data_bearing())
			.map(|server| server.logical_session_timeout_minutes)
			.collect::<Vec<_>>();

		self.next.logical_session_timeout_minutes = if data_bearing.iter().any(Option::is_none) {
			None
		} else {
			data_bearing.into_iter().flatten().min()
		};
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use {super::*, std::str::FromStr};

	pub(crate) fn addr(s: &str) -> ServerAddress {
		ServerAddress::from_str(s).unwrap()
	}

	pub(crate) fn rs_reply(set_name: &str, primary: bool, hosts: &[&str]) -> HelloReply {
		HelloReply {
			is_writable_primary: primary,
			secondary:           !primary,
			set_name:            Some(set_name.to_string()),
			hosts:               hosts.iter().map(|h| addr(h)).collect(),
			max_wire_version:    13,
			..HelloReply::default()
		}
	}

	fn seeds(uri: &str) -> ClusterDescription {
		ClusterDescription::new(&ClientOptions::from_str(uri).unwrap())
	}

	fn apply(cluster: &ClusterDescription, address: &str, reply: &HelloReply) -> Transition {
		cluster.apply(ServerDescription::from_reply(addr(address), reply, Duration::from_millis(1))).unwrap()
	}

	#[test]
	fn initial_types() {
		assert_eq!(seeds("mongodb://a").r#type, TopologyType::Unknown);
		assert_eq!(seeds("mongodb://a/?directConnection=true").r#type, TopologyType::Single);
		assert_eq!(seeds("mongodb://a,b").r#type, TopologyType::Unknown);
		assert_eq!(seeds("mongodb://a,b/?replicaSet=rs").r#type, TopologyType::ReplicaSetNoPrimary);
		assert_eq!(seeds("mongodb://a,b").servers.len(), 2);
	}

	#[test]
	fn server_types() {
		let mut reply = HelloReply::default();
		assert_eq!(ServerType::from_reply(&reply), ServerType::Standalone);
		reply.msg = Some("isdbgrid".to_string());
		assert_eq!(ServerType::from_reply(&reply), ServerType::Mongos);
		assert_eq!(ServerType::from_reply(&rs_reply("rs", true, &[])), ServerType::RSPrimary);
		assert_eq!(ServerType::from_reply(&rs_reply("rs", false, &[])), ServerType::RSSecondary);
		assert_eq!(ServerType::from_reply(&HelloReply { hidden: true, ..rs_reply("rs", true, &[]) }), ServerType::RSOther);
		assert_eq!(ServerType::from_reply(&HelloReply { is_replica_set: true, ..HelloReply::default() }), ServerType::RSGhost);
	}

	#[test]
	fn primary_discovers_members() {
		let cluster = seeds("mongodb://a,b");
		let t = apply(&cluster, "a", &rs_reply("rs", true, &["a", "c"]));

		assert!(t.changed);
		assert_eq!(t.description.r#type, TopologyType::ReplicaSetWithPrimary);
		assert_eq!(t.description.set_name.as_deref(), Some("rs"));
		assert_eq!(t.added, vec![addr("c")]);
		assert_eq!(t.removed, vec![addr("b")]);
		assert_eq!(t.description.revision, cluster.revision + 1);
		assert_eq!(t.description.primary().map(|p| p.address.clone()), Some(addr("a")));
	}

	#[test]
	fn secondary_never_removes() {
		let cluster = seeds("mongodb://a,b,c/?replicaSet=rs");
		let t = apply(&cluster, "b", &rs_reply("rs", false, &["a", "b", "d"]));

		assert_eq!(t.description.r#type, TopologyType::ReplicaSetNoPrimary);
		assert_eq!(t.added, vec![addr("d")]);
		assert!(t.removed.is_empty());
		assert_eq!(t.description.servers.len(), 4);
	}

	#[test]
	fn topology_version_ordering() {
		let cluster = seeds("mongodb://a/?replicaSet=rs");
		let version = |counter| TopologyVersion { process_id: ObjectId::from_counter(1), counter };

		let v1 = HelloReply { topology_version: Some(version(1)), tags: [("v".to_string(), "1".to_string())].iter().cloned().collect(), ..rs_reply("rs", true, &["a"]) };
		let v2 = HelloReply { topology_version: Some(version(2)), tags: [("v".to_string(), "2".to_string())].iter().cloned().collect(), ..rs_reply("rs", true, &["a"]) };

		let cluster = apply(&cluster, "a", &v2).description;
		assert!(cluster.apply(ServerDescription::from_reply(addr("a"), &v1, Duration::from_millis(1))).is_none());
		assert_eq!(cluster.servers[&addr("a")].tags["v"], "2");

		// equal versions apply in arrival order, a restart resets the counter
		let restarted = HelloReply { topology_version: Some(TopologyVersion { process_id: ObjectId::from_counter(2), counter: 0 }), ..v1.clone() };
		let cluster = apply(&cluster, "a", &restarted).description;
		assert_eq!(cluster.servers[&addr("a")].tags["v"], "1");
	}

	#[test]
	fn stale_primary() {
		let cluster = seeds("mongodb://a,b/?replicaSet=rs");
		let new = HelloReply { set_version: Some(1), election_id: Some(ObjectId::from_counter(2)), ..rs_reply("rs", true, &["a", "b"]) };
		let old = HelloReply { set_version: Some(1), election_id: Some(ObjectId::from_counter(1)), ..rs_reply("rs", true, &["a", "b"]) };

		let cluster = apply(&cluster, "a", &new).description;
		let t = apply(&cluster, "b", &old);
		assert_eq!(t.demoted, vec![addr("b")]);
		assert_eq!(t.description.servers[&addr("b")].r#type, ServerType::Unknown);
		assert_eq!(t.description.primary().map(|p| p.address.clone()), Some(addr("a")));

		// a newer election demotes the old primary
		let newer = HelloReply { set_version: Some(1), election_id: Some(ObjectId::from_counter(3)), ..rs_reply("rs", true, &["a", "b"]) };
		let t = apply(&cluster, "b", &newer);
		assert_eq!(t.demoted, vec![addr("a")]);
		assert_eq!(t.description.primary().map(|p| p.address.clone()), Some(addr("b")));
		assert_eq!(t.description.max_election_id, Some(ObjectId::from_counter(3)));
	}

	#[test]
	fn removals() {
		// set name mismatch
		let cluster = seeds("mongodb://a,b/?replicaSet=rs");
		let t = apply(&cluster, "b", &rs_reply("other", false, &["b"]));
		assert_eq!(t.removed, vec![addr("b")]);

		// standalone among multiple seeds
		let t = apply(&seeds("mongodb://a,b/?directConnection=false"), "a", &HelloReply { max_wire_version: 13, ..HelloReply::default() });
		assert_eq!(t.removed, vec![addr("a")]);
		assert_eq!(t.description.r#type, TopologyType::Unknown);

		// non-router in a sharded cluster
		let mongos = HelloReply { msg: Some("isdbgrid".to_string()), max_wire_version: 13, ..HelloReply::default() };
		let cluster = apply(&seeds("mongodb://a,b/?directConnection=false"), "a", &mongos).description;
		assert_eq!(cluster.r#type, TopologyType::Sharded);
		let t = apply(&cluster, "b", &rs_reply("rs", false, &["b"]));
		assert_eq!(t.removed, vec![addr("b")]);

		// `me` mismatch
		let t = apply(&seeds("mongodb://a,b/?replicaSet=rs"), "a", &HelloReply { me: Some(addr("x")), ..rs_reply("rs", false, &["a", "b"]) });
		assert_eq!(t.removed, vec![addr("a")]);
	}

	#[test]
	fn lone_standalone_becomes_single() {
		let standalone = HelloReply { max_wire_version: 13, ..HelloReply::default() };
		for uri in &["mongodb://a", "mongodb://a/?directConnection=false"] {
			let t = apply(&seeds(uri), "a", &standalone);
			assert_eq!(t.description.r#type, TopologyType::Single);
			assert!(t.removed.is_empty());
		}
	}

	#[test]
	fn lone_seed_discovers_replica_set() {
		let t = apply(&seeds("mongodb://a"), "a", &rs_reply("rs", true, &["a", "b", "c"]));
		assert_eq!(t.description.r#type, TopologyType::ReplicaSetWithPrimary);
		assert_eq!(t.added, vec![addr("b"), addr("c")]);

		// a direct connection never leaves single mode
		let t = apply(&seeds("mongodb://a/?directConnection=true"), "a", &rs_reply("rs", true, &["a", "b", "c"]));
		assert_eq!(t.description.r#type, TopologyType::Single);
		assert!(t.added.is_empty());
	}

	#[test]
	fn possible_primary() {
		let cluster = seeds("mongodb://a,b/?replicaSet=rs");
		let t = apply(&cluster, "b", &HelloReply { primary: Some(addr("a")), ..rs_reply("rs", false, &["a", "b"]) });
		assert_eq!(t.possible_primaries, vec![addr("a")]);
		assert_eq!(t.description.servers[&addr("a")].r#type, ServerType::PossiblePrimary);
		assert_eq!(t.description.r#type, TopologyType::ReplicaSetNoPrimary);
	}

	#[test]
	fn primary_failure() {
		let cluster = apply(&seeds("mongodb://a,b/?replicaSet=rs"), "a", &rs_reply("rs", true, &["a", "b"])).description;
		let failed = ServerDescription::from_error(addr("a"), HeartbeatError::network("connection reset"));
		let t = cluster.apply(failed).unwrap();
		assert!(t.changed);
		assert_eq!(t.description.r#type, TopologyType::ReplicaSetNoPrimary);
		assert!(t.description.servers[&addr("a")].error.is_some());
	}

	#[test]
	fn compatibility() {
		let cluster = seeds("mongodb://a,b/?replicaSet=rs");
		let t = apply(&cluster, "a", &HelloReply { max_wire_version: 2, ..rs_reply("rs", false, &["a", "b"]) });
		assert!(matches!(t.description.compatibility_error, Some(CompatibilityError::WireVersionTooOld { max_wire_version: 2, .. })));

		let t = apply(&t.description, "a", &rs_reply("rs", false, &["a", "b"]));
		assert_eq!(t.description.compatibility_error, None);
	}

	#[test]
	fn unchanged_content_keeps_revision() {
		let cluster = seeds("mongodb://a,b/?replicaSet=rs");
		let reply = rs_reply("rs", true, &["a", "b"]);
		let cluster = apply(&cluster, "a", &reply).description;

		let t = cluster.apply(ServerDescription::from_reply(addr("a"), &reply, Duration::from_millis(7))).unwrap();
		assert!(!t.changed);
		assert_eq!(t.description.revision, cluster.revision);
		assert_eq!(t.description.servers[&addr("a")].rtt, Some(Duration::from_millis(7)));
	}

	#[test]
	fn unknown_server_ignored() {
		let cluster = seeds("mongodb://a");
		assert!(cluster.apply(ServerDescription::new(addr("z"))).is_none());
	}

	#[test]
	fn display() {
		let cluster = seeds("mongodb://a,b/?replicaSet=rs");
		let s = cluster.to_string();
		assert!(s.contains("ReplicaSetNoPrimary"));
		assert!(s.contains("a:27017: Unknown"));
	}
}
