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

//! Server selection.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/server-selection/server-selection.rst

use {
	crate::{
		common::{ServerAddress, ServerSelectionConfig, ReadPreference, ReadPreferenceMode, TagSet},
		description::{ClusterDescription, ServerDescription, ServerType, TopologyType, CompatibilityError}
	},
	std::{sync::Arc, time::{Duration, SystemTime, UNIX_EPOCH}},
	rand::seq::SliceRandom
};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ServerSelectionError {
	/// No suitable server has been found in time, carries the last seen description.
	#[error("no suitable server found after {elapsed:?}, topology: {description}")]
	Timeout {
		elapsed:     Duration,
		description: Arc<ClusterDescription>
	},
	#[error(transparent)]
	Compatibility(#[from] CompatibilityError),
	#[error("invalid read preference: {0}")]
	InvalidReadPreference(&'static str),
	#[error("the topology has been closed")]
	TopologyClosed
}

/// Returns the addresses of all servers suitable for `read_preference`, in random
/// order.
pub fn select_servers(
	description:     &ClusterDescription,
	read_preference: &ReadPreference,
	config:          &ServerSelectionConfig
) -> Vec<ServerAddress> {
	let candidates = match description.r#type {
		TopologyType::Unknown => Vec::new(),
		TopologyType::Single  => servers(description, |server| server.r#type != ServerType::Unknown
			&& server.r#type != ServerType::PossiblePrimary),
		TopologyType::Sharded => servers(description, |server| server.r#type == ServerType::Mongos),
		TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary =>
			select_replica_set_members(description, read_preference, config)
	};

	let mut selected = in_latency_window(candidates, config.local_threshold)
		.into_iter()
		.map(|server| server.address.clone())
		.collect::<Vec<_>>();
	selected.shuffle(&mut rand::thread_rng());
	selected
}

fn servers(
	description: &ClusterDescription,
	predicate:   impl Fn(&ServerDescription) -> bool
) -> Vec<&ServerDescription> {
	description.servers.values()
		.map(Arc::as_ref)
		.filter(|server| predicate(*server))
		.collect()
}

fn select_replica_set_members<'a>(
	description:     &'a ClusterDescription,
	read_preference: &ReadPreference,
	config:          &ServerSelectionConfig
) -> Vec<&'a ServerDescription> {
	let primary = servers(description, |server| server.r#type == ServerType::RSPrimary);
	let secondaries = || {
		let secondaries = servers(description, |server| server.r#type == ServerType::RSSecondary);
		let secondaries = match read_preference.max_staleness {
			Some(max_staleness) => within_staleness(secondaries, primary.first().copied(),
				max_staleness, config.heartbeat_frequency),
			None => secondaries
		};
		matching_tag_sets(secondaries, &read_preference.tag_sets)
	};

	match read_preference.mode {
		ReadPreferenceMode::Primary            => primary.clone(),
		ReadPreferenceMode::PrimaryPreferred   => if primary.is_empty() { secondaries() } else { primary.clone() },
		ReadPreferenceMode::Secondary          => secondaries(),
		ReadPreferenceMode::SecondaryPreferred => {
			let secondaries = secondaries();
			if secondaries.is_empty() { primary.clone() } else { secondaries }
		}
		ReadPreferenceMode::Nearest            => {
			let members = servers(description, |server| matches!(server.r#type,
				ServerType::RSPrimary | ServerType::RSSecondary));
			let members = match read_preference.max_staleness {
				Some(max_staleness) => within_staleness(members, primary.first().copied(),
					max_staleness, config.heartbeat_frequency),
				None => members
			};
			matching_tag_sets(members, &read_preference.tag_sets)
		}
	}
}

/// Keeps the servers matching the first tag set that matches any server.
fn matching_tag_sets<'a>(servers: Vec<&'a ServerDescription>, tag_sets: &[TagSet]) -> Vec<&'a ServerDescription> {
	if tag_sets.is_empty() {
		return servers;
	}

	let matches = |server: &ServerDescription, tags: &TagSet| tags.iter()
		.all(|(k, v)| server.tags.get(k) == Some(v));

	tag_sets.iter()
		.map(|tags| servers.iter()
			.copied()
			.filter(|server| matches(*server, tags))
			.collect::<Vec<_>>())
		.find(|matched| !matched.is_empty())
		.unwrap_or_default()
}

fn millis(time: SystemTime) -> i128 {
	match time.duration_since(UNIX_EPOCH) {
		Ok(d)  => d.as_millis() as i128,
		Err(e) => -(e.duration().as_millis() as i128)
	}
}

/// Estimated replication lag of `server` in milliseconds.
///
/// see https://github.com/mongodb/specifications/blob/master/source/max-staleness/max-staleness.rst
fn staleness(
	server:              &ServerDescription,
	primary:             Option<&ServerDescription>,
	newest_write:        Option<SystemTime>,
	heartbeat_frequency: Duration
) -> Option<i128> {
	let last_write = millis(server.last_write_date?);
	let heartbeat = heartbeat_frequency.as_millis() as i128;

	match primary {
		Some(primary) => {
			let p_lag = millis(primary.last_update_time?) - millis(primary.last_write_date?);
			let s_lag = millis(server.last_update_time?) - last_write;
			Some(s_lag - p_lag + heartbeat)
		}
		None => Some(millis(newest_write?) - last_write + heartbeat)
	}
}

fn within_staleness<'a>(
	servers:             Vec<&'a ServerDescription>,
	primary:             Option<&ServerDescription>,
	max_staleness:       Duration,
	heartbeat_frequency: Duration
) -> Vec<&'a ServerDescription> {
	let newest_write = servers.iter()
		.filter(|server| server.r#type == ServerType::RSSecondary)
		.filter_map(|server| server.last_write_date)
		.max();
	let max = max_staleness.as_millis() as i128;

	servers.into_iter()
		.filter(|server| server.r#type == ServerType::RSPrimary
			|| staleness(server, primary, newest_write, heartbeat_frequency)
				.map_or(true, |staleness| staleness <= max))
		.collect()
}

/// Keeps the servers whose round trip time is within `local_threshold` of the fastest.
fn in_latency_window(servers: Vec<&ServerDescription>, local_threshold: Duration) -> Vec<&ServerDescription> {
	let fastest = match servers.iter().filter_map(|server| server.rtt).min() {
		Some(fastest) => fastest,
		None => return servers
	};

	servers.into_iter()
		.filter(|server| server.rtt.unwrap_or_default() <= fastest + local_threshold)
		.collect()
}
